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

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::lock_api::MutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};

use super::PoolConfig;
use crate::address_::Address;
use crate::auth::{auth_managers, AuthToken};
use crate::channel::{AuthResetHandle, Channel, ChannelConfig, HelloParameters, ReauthParameters};
use crate::config::AuthConfig;
use crate::error_::{Error, Result};

type PoolElement = Box<dyn Channel>;

#[derive(Debug)]
pub(crate) struct InnerPool {
    address: Arc<Address>,
    config: Arc<PoolConfig>,
    synced: Mutex<InnerPoolSyncedData>,
    made_room_condition: Condvar,
}

#[derive(Debug)]
struct InnerPoolSyncedData {
    raw_pool: VecDeque<PoolElement>,
    reservations: usize,
    borrowed: usize,
    borrowed_auth_reset: HashSet<AuthResetHandle>,
    closed: bool,
}

impl InnerPool {
    fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        let raw_pool = VecDeque::with_capacity(config.max_connection_pool_size);
        let borrowed_auth_reset = HashSet::with_capacity(config.max_connection_pool_size);
        let synced = Mutex::new(InnerPoolSyncedData {
            raw_pool,
            reservations: 0,
            borrowed: 0,
            borrowed_auth_reset,
            closed: false,
        });
        Self {
            address,
            config,
            synced,
            made_room_condition: Condvar::new(),
        }
    }

    fn acquire_new(
        &self,
        deadline: Option<Instant>,
        session_auth: SessionAuth,
    ) -> Result<PoolElement> {
        let connection = self.open_new(deadline, session_auth);
        let mut sync = self.synced.lock();
        sync.reservations -= 1;
        let connection = connection?;
        sync.borrowed += 1;
        assert!(sync
            .borrowed_auth_reset
            .insert(connection.auth_reset_handle()));
        Ok(connection)
    }

    fn open_new(
        &self,
        deadline: Option<Instant>,
        session_auth: SessionAuth,
    ) -> Result<PoolElement> {
        let auth = self.resolve_auth(session_auth)?;
        let is_session_auth = !matches!(session_auth, SessionAuth::None);

        let address = Arc::clone(&self.address);
        let mut connection = self.open_channel(address, deadline)?;

        if let Err(err) = connection.hello(HelloParameters::new(
            &self.config.user_agent,
            &auth,
            self.config.routing_context.as_ref(),
            is_session_auth,
        )) {
            connection.close();
            return Err(err);
        }
        Ok(connection)
    }

    fn resolve_auth(&self, session_auth: SessionAuth) -> Result<Arc<AuthToken>> {
        match session_auth {
            SessionAuth::None => match &self.config.auth {
                AuthConfig::Static(auth) => Ok(Arc::clone(auth)),
                AuthConfig::Manager(manager) => auth_managers::get_auth(manager.as_ref()),
            },
            SessionAuth::Reauth(auth) | SessionAuth::Forced(auth) => Ok(Arc::clone(auth)),
        }
    }

    fn open_channel(&self, address: Arc<Address>, deadline: Option<Instant>) -> Result<PoolElement> {
        let mut last_err = None;
        for address in address.fully_resolve(self.config.resolver.as_deref())? {
            last_err = match address {
                Ok(address) => {
                    match self
                        .config
                        .factory
                        .open(address, deadline, self.channel_config())
                    {
                        Ok(connection) => return Ok(connection),
                        Err(err) => {
                            info!("failed to open connection: {}", err);
                            Some(err)
                        }
                    }
                }
                Err(err) => {
                    info!("failed to resolve address: {}", err);
                    Some(Error::ServiceUnavailable {
                        message: String::from("failed to resolve address"),
                        source: Some(err),
                    })
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::service_unavailable("address resolved to no targets")))
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connection_timeout: self.config.connection_timeout,
            tls_config: self.config.tls_config.as_ref().map(Arc::clone),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SimplePool(Arc<InnerPool>);

impl SimplePool {
    pub(crate) fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        Self(Arc::new(InnerPool::new(address, config)))
    }

    pub(crate) fn acquire(
        &self,
        deadline: Option<Instant>,
    ) -> Result<UnpreparedSingleChannel> {
        {
            let mut synced = self.synced.lock();
            loop {
                if synced.closed {
                    return Err(Error::pool_closed());
                }
                if let Some(connection) = self.acquire_existing(&mut synced) {
                    return Ok(UnpreparedSingleChannel::new(
                        Some(connection),
                        Arc::clone(&self.0),
                    ));
                }
                if self.has_room(&synced) {
                    synced.reservations += 1;
                    break;
                } else {
                    self.wait_for_room(deadline, &mut synced)?;
                }
            }
        }
        Ok(UnpreparedSingleChannel::new(None, Arc::clone(&self.0)))
    }

    fn wait_for_room(
        &self,
        deadline: Option<Instant>,
        synced: &mut MutexGuard<RawMutex, InnerPoolSyncedData>,
    ) -> Result<()> {
        match deadline {
            None => self.made_room_condition.wait(synced),
            Some(deadline) => {
                if self
                    .made_room_condition
                    .wait_until(synced, deadline)
                    .timed_out()
                {
                    return Err(Error::connection_acquisition_timeout(
                        "waiting for room in the connection pool",
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn acquire_no_wait(&self) -> Option<UnpreparedSingleChannel> {
        {
            let mut synced = self.synced.lock();
            if synced.closed {
                return None;
            }
            if let Some(connection) = self.acquire_existing(&mut synced) {
                return Some(UnpreparedSingleChannel::new(
                    Some(connection),
                    Arc::clone(&self.0),
                ));
            }
            if self.has_room(&synced) {
                synced.reservations += 1;
            } else {
                return None;
            }
        }
        Some(UnpreparedSingleChannel::new(None, Arc::clone(&self.0)))
    }

    /// Leased plus reserved connections; drives least-connected balancing.
    pub(crate) fn in_use(&self) -> usize {
        let synced = self.synced.lock();
        synced.borrowed + synced.reservations
    }

    /// Mark every connection of this pool (idle and leased alike) so that it
    /// re-authenticates before its next use. The sockets stay open.
    pub(crate) fn reset_all_auth(&self) {
        let synced = self.synced.lock();
        for connection in &synced.raw_pool {
            connection.auth_reset_handle().mark_for_reset();
        }
        for reset_handle in &synced.borrowed_auth_reset {
            reset_handle.mark_for_reset();
        }
    }

    /// Close all idle connections and fail current and future waiters.
    /// Leased connections are destroyed as they get released.
    pub(crate) fn close(&self) {
        let mut synced = self.synced.lock();
        synced.closed = true;
        while let Some(mut connection) = synced.raw_pool.pop_front() {
            connection.close();
        }
        self.made_room_condition.notify_all();
    }

    fn has_room(&self, synced: &InnerPoolSyncedData) -> bool {
        synced.raw_pool.len() + synced.borrowed + synced.reservations
            < self.config.max_connection_pool_size
    }

    fn acquire_existing(&self, synced: &mut InnerPoolSyncedData) -> Option<PoolElement> {
        let connection = synced.raw_pool.pop_front();
        if let Some(connection) = connection.as_ref() {
            synced.borrowed += 1;
            assert!(synced
                .borrowed_auth_reset
                .insert(connection.auth_reset_handle()));
        }
        connection
    }

    fn release(inner_pool: &Arc<InnerPool>, mut connection: PoolElement) {
        let mut lock = inner_pool.synced.lock();
        lock.borrowed -= 1;
        assert!(lock
            .borrowed_auth_reset
            .remove(&connection.auth_reset_handle()));
        let beyond_lifetime = inner_pool
            .config
            .max_connection_lifetime
            .map_or(false, |lifetime| connection.is_older_than(lifetime));
        if (beyond_lifetime || lock.closed) && !connection.closed() {
            connection.close();
        }
        if !connection.closed() {
            lock.raw_pool.push_back(connection);
        }
        inner_pool.made_room_condition.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.synced.lock().raw_pool.len()
    }
}

impl Deref for SimplePool {
    type Target = InnerPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A slot in the pool: either an idle connection that still has to be
/// validated, or the permission to open a new one (a reservation).
#[derive(Debug)]
pub(crate) struct UnpreparedSingleChannel {
    pool: Arc<InnerPool>,
    channel: Option<PoolElement>,
}

impl UnpreparedSingleChannel {
    fn new(channel: Option<PoolElement>, pool: Arc<InnerPool>) -> Self {
        Self { pool, channel }
    }

    /// Validate (lifetime, liveness, authentication) and hand out the
    /// connection. `Ok(None)` means the connection was discarded and the
    /// caller should try the pool again.
    pub(crate) fn prepare(
        mut self,
        deadline: Option<Instant>,
        idle_time_before_connection_test: Option<Duration>,
        session_auth: SessionAuth,
    ) -> Result<Option<SingleChannel>> {
        let channel = self.channel.take();
        let pool = Arc::clone(&self.pool);
        match channel {
            None => {
                let connection = self.pool.acquire_new(deadline, session_auth)?;
                Ok(Some(SingleChannel::new(connection, pool, true)))
            }
            Some(mut connection) => {
                if let Some(max_lifetime) = self.pool.config.max_connection_lifetime {
                    if connection.is_older_than(max_lifetime) {
                        debug!("connection reached max lifetime");
                        connection.close();
                        SimplePool::release(&self.pool, connection);
                        return Ok(None);
                    }
                }
                if let Some(timeout) = idle_time_before_connection_test {
                    if connection.is_idle_for(timeout) {
                        debug!("liveness check");
                        if let Err(err) = connection.reset(deadline) {
                            debug!("liveness check failed: {}", err);
                            connection.close();
                            SimplePool::release(&self.pool, connection);
                            return Ok(None);
                        }
                    }
                }
                match self.reauth(&mut connection, session_auth) {
                    Ok(Some(())) => Ok(Some(SingleChannel::new(connection, pool, false))),
                    Ok(None) => {
                        SimplePool::release(&self.pool, connection);
                        Ok(None)
                    }
                    Err(e) => {
                        SimplePool::release(&self.pool, connection);
                        Err(e)
                    }
                }
            }
        }
    }

    fn reauth(
        &self,
        connection: &mut PoolElement,
        session_auth: SessionAuth,
    ) -> Result<Option<()>> {
        match session_auth {
            SessionAuth::None => {
                let new_auth = match &self.pool.config.auth {
                    AuthConfig::Static(auth) => Arc::clone(auth),
                    AuthConfig::Manager(manager) => auth_managers::get_auth(manager.as_ref())?,
                };
                let reauth_params = ReauthParameters::new(&new_auth, false);
                if connection.needs_reauth(reauth_params) {
                    if !connection.supports_reauth() {
                        debug!("backwards compatible auth token refresh: purge connection");
                        connection.close();
                        return Ok(None);
                    }
                    connection.reauth(reauth_params)?;
                }
            }
            SessionAuth::Reauth(auth) => {
                let reauth_params = ReauthParameters::new(auth, true);
                if connection.needs_reauth(reauth_params) {
                    if !connection.supports_reauth() {
                        // sticky: never hand a connection authenticated as
                        // someone else back into circulation
                        connection.close();
                        return Err(Error::unsupported(
                            "driver is connected to a database that does not support user \
                            switching (requires protocol version 5.1+)",
                        ));
                    }
                    connection.reauth(reauth_params)?;
                }
            }
            SessionAuth::Forced(auth) => {
                if !connection.supports_reauth() {
                    debug!("cannot force re-auth: purge connection");
                    connection.close();
                    return Ok(None);
                }
                connection.reauth(ReauthParameters::new(auth, true))?;
            }
        }
        Ok(Some(()))
    }
}

impl Drop for UnpreparedSingleChannel {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        SimplePool::release(&self.pool, channel);
    }
}

/// The authentication a caller requests for an acquisition.
#[derive(Debug, Copy, Clone)]
pub enum SessionAuth<'a> {
    /// Use the driver-level credential (static token or auth manager).
    None,
    /// Use the given session credential, re-authenticating if necessary.
    Reauth(&'a Arc<AuthToken>),
    /// Use the given credential and force a re-authentication round-trip even
    /// if the connection already carries it.
    Forced(&'a Arc<AuthToken>),
}

#[derive(Debug)]
pub(crate) struct SingleChannel {
    pool: Arc<InnerPool>,
    channel: Option<PoolElement>,
    fresh: bool,
}

impl SingleChannel {
    fn new(channel: PoolElement, pool: Arc<InnerPool>, fresh: bool) -> Self {
        Self {
            pool,
            channel: Some(channel),
            fresh,
        }
    }

    /// Whether the connection was opened for this very acquisition.
    pub(crate) fn fresh(&self) -> bool {
        self.fresh
    }
}

impl Drop for SingleChannel {
    fn drop(&mut self) {
        let channel = self
            .channel
            .take()
            .expect("channel option should be Some from init to drop");
        SimplePool::release(&self.pool, channel);
    }
}

impl Deref for SingleChannel {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        &**self
            .channel
            .as_ref()
            .expect("channel option should be Some from init to drop")
    }
}

impl DerefMut for SingleChannel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self
            .channel
            .as_mut()
            .expect("channel option should be Some from init to drop")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::*;

    fn acquire_prepared(pool: &SimplePool, session_auth: SessionAuth) -> Result<SingleChannel> {
        let mut connection = None;
        while connection.is_none() {
            connection = pool
                .acquire(None)?
                .prepare(None, None, session_auth)?;
        }
        Ok(connection.expect("loop above asserts existence"))
    }

    #[test]
    fn test_acquire_creates_connection() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds");
        assert!(connection.fresh());
        assert_eq!(*connection.address(), *test_address("server"));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(factory.opened_count(), 1);
        drop(connection);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_acquire_reuses_idle_connection() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("idle reuse");
        assert!(!connection.fresh());
        assert_eq!(factory.opened_count(), 1);
    }

    #[test]
    fn test_acquire_no_wait_respects_capacity() {
        let factory = FakeFactory::new();
        let config = test_pool_config_with(&factory, |config| {
            config.max_connection_pool_size = 2;
        });
        let pool = SimplePool::new(test_address("server"), config);
        let c1 = acquire_prepared(&pool, SessionAuth::None).expect("room for one");
        let c2 = acquire_prepared(&pool, SessionAuth::None).expect("room for two");
        assert!(pool.acquire_no_wait().is_none());
        drop(c1);
        assert!(pool.acquire_no_wait().is_some());
        drop(c2);
    }

    #[test]
    fn test_acquire_times_out_at_capacity() {
        let factory = FakeFactory::new();
        let config = test_pool_config_with(&factory, |config| {
            config.max_connection_pool_size = 1;
        });
        let pool = SimplePool::new(test_address("server"), config);
        let _held = acquire_prepared(&pool, SessionAuth::None).expect("room for one");
        let deadline = Some(Instant::now() + Duration::from_millis(10));
        let res = pool.acquire(deadline);
        assert!(matches!(res, Err(Error::Timeout { .. })));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let factory = FakeFactory::new();
        let config = test_pool_config_with(&factory, |config| {
            config.max_connection_pool_size = 1;
        });
        let pool = Arc::new(SimplePool::new(test_address("server"), config));
        let held = acquire_prepared(&pool, SessionAuth::None).expect("room for one");
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || acquire_prepared(&pool, SessionAuth::None).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().expect("waiter thread must not panic"));
    }

    #[test]
    fn test_connection_beyond_lifetime_is_replaced() {
        let factory = FakeFactory::new();
        let config = test_pool_config_with(&factory, |config| {
            config.max_connection_lifetime = Some(Duration::from_secs(60));
        });
        let pool = SimplePool::new(test_address("server"), config);
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        factory.control_of(0).lock().age = Duration::from_secs(61);
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("replacement opens");
        assert!(connection.fresh());
        assert_eq!(factory.opened_count(), 2);
        assert!(factory.control_of(0).lock().closed);
    }

    #[test]
    fn test_liveness_check_discards_dead_connection() {
        let factory = FakeFactory::new();
        let config = test_pool_config_with(&factory, |config| {
            config.idle_time_before_connection_test = Some(Duration::from_secs(10));
        });
        let pool = SimplePool::new(test_address("server"), config);
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        {
            let control = factory.control_of(0);
            let mut control = control.lock();
            control.idle = Duration::from_secs(11);
            control.reset_replies.push_back(Scripted::Io("probe failed"));
        }
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("replacement opens");
        assert!(connection.fresh());
        assert!(factory.control_of(0).lock().closed);
        assert_eq!(factory.opened_count(), 2);
    }

    #[test]
    fn test_liveness_check_skipped_for_recently_used() {
        let factory = FakeFactory::new();
        let config = test_pool_config_with(&factory, |config| {
            config.idle_time_before_connection_test = Some(Duration::from_secs(10));
        });
        let pool = SimplePool::new(test_address("server"), config);
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("idle reuse");
        assert!(!connection.fresh());
        assert_eq!(factory.control_of(0).lock().reset_count, 0);
    }

    #[test]
    fn test_driver_auth_rotation_reauths_in_place() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        pool.reset_all_auth();
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("reauth in place");
        assert!(!connection.fresh());
        assert_eq!(factory.control_of(0).lock().reauth_count, 1);
    }

    #[test]
    fn test_driver_auth_rotation_replaces_legacy_connection() {
        let factory = FakeFactory::new();
        factory.script_address("server", |script| {
            script.supports_reauth = false;
        });
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        pool.reset_all_auth();
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("replacement opens");
        assert!(connection.fresh());
        assert!(factory.control_of(0).lock().closed);
        assert_eq!(factory.opened_count(), 2);
    }

    #[test]
    fn test_user_switch_without_reauth_support_is_sticky() {
        let factory = FakeFactory::new();
        factory.script_address("server", |script| {
            script.supports_reauth = false;
        });
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));

        let other_user = Arc::new(AuthToken::new_basic_auth("someone-else", "pass"));
        let res = pool
            .acquire(None)
            .expect("pool has an idle connection")
            .prepare(None, None, SessionAuth::Reauth(&other_user));
        assert!(matches!(res, Err(Error::Unsupported { .. })));
        // the connection was destroyed, not re-pooled
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use(), 0);
        assert!(factory.control_of(0).lock().closed);
    }

    #[test]
    fn test_session_auth_reauths_existing_connection() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        let other_user = Arc::new(AuthToken::new_basic_auth("someone-else", "pass"));
        let connection = acquire_prepared(&pool, SessionAuth::Reauth(&other_user))
            .expect("re-auth switches the user");
        assert!(!connection.fresh());
        let control = factory.control_of(0);
        let control = control.lock();
        assert_eq!(control.reauth_count, 1);
        assert!(control
            .auth
            .as_ref()
            .expect("authenticated")
            .eq_data(&other_user));
    }

    #[test]
    fn test_close_rejects_acquisitions_and_destroys_idle() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        pool.close();
        assert!(factory.control_of(0).lock().closed);
        assert!(matches!(pool.acquire(None), Err(Error::ServiceUnavailable { .. })));
        assert!(pool.acquire_no_wait().is_none());
    }

    #[test]
    fn test_close_destroys_leased_connection_on_release() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        let connection = acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds");
        pool.close();
        drop(connection);
        assert_eq!(pool.idle_count(), 0);
        assert!(factory.control_of(0).lock().closed);
    }

    #[test]
    fn test_reset_all_auth_marks_idle_and_leased() {
        let factory = FakeFactory::new();
        let pool = SimplePool::new(test_address("server"), test_pool_config(&factory));
        let leased = acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds");
        drop(acquire_prepared(&pool, SessionAuth::None).expect("factory succeeds"));
        pool.reset_all_auth();
        assert!(leased.auth_reset_handle().is_marked());
        // the idle connection's socket stays open
        let control = factory.control_of(1);
        assert!(!control.lock().closed);
    }
}
