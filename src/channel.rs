// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;

use crate::address_::Address;
use crate::auth::AuthToken;
use crate::error_::Result;
use crate::value::Value;

// Protocol version thresholds for capability checks.
pub(crate) const PROTOCOL_TRANSACTION_CONFIG: (u8, u8) = (3, 0);
pub(crate) const PROTOCOL_MULTI_DB: (u8, u8) = (4, 0);
pub(crate) const PROTOCOL_USER_IMPERSONATION: (u8, u8) = (4, 4);
pub(crate) const PROTOCOL_SESSION_AUTH: (u8, u8) = (5, 1);

/// Parameters for the authenticating handshake completion ([`Channel::hello`]).
#[derive(Debug, Copy, Clone)]
pub struct HelloParameters<'a> {
    pub user_agent: &'a str,
    pub auth: &'a Arc<AuthToken>,
    pub routing_context: Option<&'a HashMap<String, Value>>,
    /// Whether `auth` is a session-level credential (as opposed to the
    /// driver-level one). Session credentials are exempt from driver-level
    /// token rotation.
    pub session_auth: bool,
}

impl<'a> HelloParameters<'a> {
    pub fn new(
        user_agent: &'a str,
        auth: &'a Arc<AuthToken>,
        routing_context: Option<&'a HashMap<String, Value>>,
        session_auth: bool,
    ) -> Self {
        Self {
            user_agent,
            auth,
            routing_context,
            session_auth,
        }
    }
}

/// Parameters for re-authentication over an established channel
/// ([`Channel::reauth`]).
#[derive(Debug, Copy, Clone)]
pub struct ReauthParameters<'a> {
    pub auth: &'a Arc<AuthToken>,
    pub session_auth: bool,
}

impl<'a> ReauthParameters<'a> {
    pub fn new(auth: &'a Arc<AuthToken>, session_auth: bool) -> Self {
        Self { auth, session_auth }
    }
}

/// Parameters for a routing-table request ([`Channel::route`]).
#[derive(Debug, Copy, Clone)]
pub struct RouteParameters<'a> {
    pub routing_context: &'a HashMap<String, Value>,
    pub bookmarks: Option<&'a [String]>,
    pub db: Option<&'a str>,
    pub imp_user: Option<&'a str>,
}

impl<'a> RouteParameters<'a> {
    pub fn new(
        routing_context: &'a HashMap<String, Value>,
        bookmarks: Option<&'a [String]>,
        db: Option<&'a str>,
        imp_user: Option<&'a str>,
    ) -> Self {
        Self {
            routing_context,
            bookmarks,
            db,
            imp_user,
        }
    }
}

/// A shared flag the pool uses to force re-authentication of a pooled
/// connection without closing its socket.
///
/// Channel implementations hold one per connection and must report
/// [`Channel::needs_reauth`] as `true` while the handle is marked.
/// Re-authenticating clears the mark.
#[derive(Debug)]
pub struct AuthResetHandle(Arc<AtomicBool>);

impl PartialEq for AuthResetHandle {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for AuthResetHandle {}

impl Hash for AuthResetHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl Default for AuthResetHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthResetHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    #[inline]
    pub fn clone(handle: &Self) -> Self {
        Self(Arc::clone(&handle.0))
    }

    #[inline]
    pub fn mark_for_reset(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-connection configuration handed to the [`ChannelFactory`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connection_timeout: Option<Duration>,
    pub tls_config: Option<Arc<ClientConfig>>,
}

/// Information about the server a connection is established to.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub address: Arc<Address>,
    pub server_agent: Arc<String>,
    pub protocol_version: (u8, u8),
}

impl ServerInfo {
    pub(crate) fn new(channel: &dyn Channel) -> Self {
        Self {
            address: channel.address(),
            server_agent: channel.server_agent(),
            protocol_version: channel.protocol_version(),
        }
    }
}

/// An established connection to a server, after the protocol handshake.
///
/// This is the seam between the connection provider and the transport: wire
/// framing, value codecs, and TLS live behind it.
/// Every operation returning a [`Result`] is a full round-trip (request
/// written and flushed, response read); these calls are the provider's
/// suspension points.
pub trait Channel: Debug + Send {
    fn address(&self) -> Arc<Address>;
    fn server_agent(&self) -> Arc<String>;
    fn protocol_version(&self) -> (u8, u8);

    /// Whether the negotiated protocol version supports re-authentication
    /// over the open channel.
    fn supports_reauth(&self) -> bool;

    /// Complete the handshake by presenting the user agent and
    /// authenticating. Must be called exactly once before any other
    /// round-trip.
    fn hello(&mut self, parameters: HelloParameters) -> Result<()>;

    /// Re-authenticate over the open channel.
    /// Implementations must clear their [`AuthResetHandle`] mark.
    fn reauth(&mut self, parameters: ReauthParameters) -> Result<()>;

    /// Whether the connection would have to re-authenticate to match the
    /// given parameters: the token differs from the current one (by data
    /// equality), the session-auth flag changes, or the auth-reset handle is
    /// marked.
    fn needs_reauth(&self, parameters: ReauthParameters) -> bool;

    /// The token the connection is currently authenticated with, if any.
    fn auth(&self) -> Option<Arc<AuthToken>>;

    /// Whether the current authentication is session-level.
    fn session_auth(&self) -> bool;

    fn auth_reset_handle(&self) -> AuthResetHandle;

    /// Fetch raw routing metadata from this server.
    fn route(&mut self, parameters: RouteParameters) -> Result<HashMap<String, Value>>;

    /// Reset the connection's server-side state and await the acknowledgment.
    /// Doubles as the liveness probe.
    fn reset(&mut self, deadline: Option<Instant>) -> Result<()>;

    /// Close the channel. Idempotent; must not block on the server.
    fn close(&mut self);

    fn closed(&self) -> bool;

    /// Whether the channel was closed by a failure rather than by
    /// [`Channel::close`].
    fn unexpectedly_closed(&self) -> bool;

    /// Whether the connection was created longer than `age` ago.
    fn is_older_than(&self, age: Duration) -> bool;

    /// Whether the connection has been sitting idle for at least `timeout`.
    fn is_idle_for(&self, timeout: Duration) -> bool;
}

/// Opens [`Channel`]s: TCP connect, TLS, protocol handshake.
pub trait ChannelFactory: Debug + Send + Sync {
    fn open(
        &self,
        address: Arc<Address>,
        deadline: Option<Instant>,
        config: ChannelConfig,
    ) -> Result<Box<dyn Channel>>;
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    #[test]
    fn test_auth_reset_handle_mark_and_clear() {
        let handle = AuthResetHandle::new();
        assert!(!handle.is_marked());
        handle.mark_for_reset();
        assert!(handle.is_marked());
        handle.reset();
        assert!(!handle.is_marked());
    }

    #[test]
    fn test_auth_reset_handle_identity() {
        let handle = AuthResetHandle::new();
        let alias = AuthResetHandle::clone(&handle);
        let other = AuthResetHandle::new();
        assert_eq!(handle, alias);
        assert_ne!(handle, other);

        let mut hasher1 = DefaultHasher::new();
        let mut hasher2 = DefaultHasher::new();
        handle.hash(&mut hasher1);
        alias.hash(&mut hasher2);
        assert_eq!(hasher1.finish(), hasher2.finish());

        alias.mark_for_reset();
        assert!(handle.is_marked());
    }
}
