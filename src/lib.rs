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

#![allow(clippy::option_map_unit_fn)]

//! # Graphbolt
//!
//! The connection-provider core of a client driver for clustered graph
//! databases speaking the Bolt session protocol over TCP: it hands out
//! ready-to-use, authenticated, healthy connections to the right cluster
//! member for the caller's access mode and database.
//!
//! The crate deliberately ends where the wire begins: framing, handshake,
//! value codecs, and TLS sockets live behind the
//! [`ChannelFactory`](channel::ChannelFactory) /
//! [`Channel`](channel::Channel) traits, while sessions, transactions, and
//! result streams compose on top of
//! [`ConnectionProvider`](provider::ConnectionProvider).
//!
//! ## Concepts
//!
//! ### The Connection Provider
//! The fundamental type of this crate is the
//! [`ConnectionProvider`](provider::ConnectionProvider).
//! Constructed from a [`ConnectionConfig`](config::ConnectionConfig) (where
//! to connect, routing or direct, TLS) and a
//! [`ProviderConfig`](config::ProviderConfig) (authentication, pool sizing,
//! timeouts), it maintains one bounded connection pool per cluster member.
//!
//! ### Routing
//! With routing enabled, the provider discovers the cluster through routing
//! tables fetched from router servers, caches them per database, refreshes
//! them when they go stale, and spreads acquisitions over the
//! least-connected eligible server.
//! Servers that stop cooperating are forgotten until rediscovery brings them
//! back.
//!
//! ### Authentication
//! The provider owns the driver-level credential: a static
//! [`AuthToken`](auth::AuthToken) or a rotating
//! [`AuthManager`](auth::AuthManager).
//! Where the protocol allows it, pooled connections are re-authenticated in
//! place; session-level credentials can be pinned per acquisition.
//!
//! ## Logging
//! The crate uses the [`log`] crate for logging.
//!
//! **Important Notes on Usage:**
//!  * Log messages are *not* considered part of the API.
//!    They may change at any time and don't follow semantic versioning.
//!  * The logs are meant for debugging the driver itself.
//!    If there are problems the user-code needs to be aware of, they will be
//!    reported via [`Result`]s, not log messages.

mod address_;
pub mod auth;
pub mod channel;
pub mod config;
mod error_;
mod home_db_cache;
mod macros;
pub mod provider;
mod sync;
mod value;

pub use error_::{Error, Result};
pub use value::Value;

/// Address and address resolution.
pub mod address {
    pub use super::address_::resolution::*;
    pub use super::address_::*;
}
/// Error types.
pub mod error {
    pub use super::error_::{Error, Result, ServerError, UserCallbackError};
}
