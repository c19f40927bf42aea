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

mod load_balancing;
mod routing;
mod single_pool;
#[cfg(test)]
pub(crate) mod testing;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLockReadGuard};
use rustls::ClientConfig;

use crate::address_::resolution::AddressResolver;
use crate::address_::Address;
use crate::auth::{auth_managers, AuthToken};
use crate::channel::{
    Channel, ChannelFactory, RouteParameters, ServerInfo, PROTOCOL_MULTI_DB,
    PROTOCOL_SESSION_AUTH, PROTOCOL_TRANSACTION_CONFIG, PROTOCOL_USER_IMPERSONATION,
};
use crate::config::{AuthConfig, ConnectionConfig, ProviderConfig};
use crate::error_::{Error, Result, ServerError};
use crate::home_db_cache::{HomeDbCache, HomeDbCacheKey};
use crate::sync::MostlyRLock;
use crate::value::Value;
use load_balancing::LeastConnected;
use routing::{RoutingTable, RoutingTables};
pub use single_pool::SessionAuth;
use single_pool::{SimplePool, SingleChannel, UnpreparedSingleChannel};

// 7 is a reasonable common upper bound for the size of clusters
// this is, however, not a hard limit
const DEFAULT_CLUSTER_SIZE: usize = 7;

const HOME_DB_CACHE_SIZE: usize = 1000;

type Addresses = Vec<Arc<Address>>;

/// Declares whether an acquisition intends to read or to write.
///
/// Determines whether the routing table's readers or writers are consulted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoutingControl {
    Read,
    Write,
}

/// Everything the pools need to know, merged from [`ConnectionConfig`] and
/// [`ProviderConfig`].
#[derive(Debug)]
pub(crate) struct PoolConfig {
    pub(crate) routing_context: Option<HashMap<String, Value>>,
    pub(crate) tls_config: Option<Arc<ClientConfig>>,
    pub(crate) user_agent: String,
    pub(crate) auth: AuthConfig,
    pub(crate) max_connection_lifetime: Option<Duration>,
    pub(crate) max_connection_pool_size: usize,
    pub(crate) connection_timeout: Option<Duration>,
    pub(crate) connection_acquisition_timeout: Option<Duration>,
    pub(crate) idle_time_before_connection_test: Option<Duration>,
    pub(crate) routing_table_purge_delay: Duration,
    pub(crate) max_home_database_delay: Duration,
    pub(crate) resolver: Option<Box<dyn AddressResolver>>,
    pub(crate) factory: Arc<dyn ChannelFactory>,
}

impl PoolConfig {
    pub(crate) fn connection_acquisition_deadline(&self) -> Option<Instant> {
        self.connection_acquisition_timeout.map(|t| Instant::now() + t)
    }
}

/// Arguments for [`ConnectionProvider::acquire()`].
pub struct AcquireArgs<'a> {
    pub mode: RoutingControl,
    pub database: Option<Arc<String>>,
    pub bookmarks: Option<&'a [String]>,
    pub impersonated_user: Option<Arc<String>>,
    pub auth: SessionAuth<'a>,
    /// Invoked with the database name the cluster resolved for this
    /// acquisition (the home database when `database` is `None`).
    /// Only called when a routing-table refresh took place.
    pub on_db_resolved: Option<&'a dyn Fn(Option<Arc<String>>)>,
}

impl<'a> AcquireArgs<'a> {
    pub fn new(mode: RoutingControl) -> Self {
        Self {
            mode,
            database: None,
            bookmarks: None,
            impersonated_user: None,
            auth: SessionAuth::None,
            on_db_resolved: None,
        }
    }

    pub fn with_database(mut self, database: Arc<String>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: &'a [String]) -> Self {
        self.bookmarks = Some(bookmarks);
        self
    }

    pub fn with_impersonated_user(mut self, user: Arc<String>) -> Self {
        self.impersonated_user = Some(user);
        self
    }

    pub fn with_auth(mut self, auth: SessionAuth<'a>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_on_db_resolved(mut self, cb: &'a dyn Fn(Option<Arc<String>>)) -> Self {
        self.on_db_resolved = Some(cb);
        self
    }

    fn with_database_opt(mut self, database: Option<Arc<String>>) -> Self {
        self.database = database;
        self
    }
}

impl Debug for AcquireArgs<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireArgs")
            .field("mode", &self.mode)
            .field("database", &self.database)
            .field("bookmarks", &self.bookmarks)
            .field("impersonated_user", &self.impersonated_user)
            .field("auth", &self.auth)
            .field("on_db_resolved", &self.on_db_resolved.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Hands out ready-to-use, authenticated connections to the cluster member
/// matching the requested access mode and database.
///
/// Constructed over a direct address or, when the [`ConnectionConfig`]
/// carries a routing context, over the whole cluster reachable through it.
#[derive(Debug)]
pub struct ConnectionProvider {
    config: Arc<PoolConfig>,
    pools: Providers,
}

impl ConnectionProvider {
    pub fn new(
        connection_config: ConnectionConfig,
        config: ProviderConfig,
        factory: Arc<dyn ChannelFactory>,
    ) -> Self {
        let ConnectionConfig {
            address,
            routing_context,
            tls_config,
        } = connection_config;
        let ProviderConfig {
            user_agent,
            auth,
            idle_time_before_connection_test,
            max_connection_lifetime,
            max_connection_pool_size,
            connection_timeout,
            connection_acquisition_timeout,
            routing_table_purge_delay,
            max_home_database_delay,
            resolver,
        } = config;
        let config = Arc::new(PoolConfig {
            routing_context,
            tls_config: tls_config.map(Arc::new),
            user_agent,
            auth,
            max_connection_lifetime,
            max_connection_pool_size,
            connection_timeout,
            connection_acquisition_timeout,
            idle_time_before_connection_test,
            routing_table_purge_delay,
            max_home_database_delay,
            resolver,
            factory,
        });
        let address = Arc::new(address);
        let pools = match config.routing_context {
            None => Providers::Direct(SimplePool::new(address, Arc::clone(&config))),
            Some(_) => Providers::Routing(RoutingProvider::new(address, Arc::clone(&config))),
        };
        Self { config, pools }
    }

    #[inline]
    pub fn is_routing(&self) -> bool {
        self.config.routing_context.is_some()
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.config.tls_config.is_some()
    }

    /// Acquire a connection according to `args`.
    ///
    /// The returned [`PooledConnection`] returns itself to the pool on drop.
    pub fn acquire(&self, args: AcquireArgs) -> Result<PooledConnection<'_>> {
        let deadline = self.config.connection_acquisition_deadline();
        Ok(PooledConnection {
            channel: Some(match &self.pools {
                Providers::Direct(single_pool) => {
                    self.acquire_direct(single_pool, deadline, args.auth)?
                }
                Providers::Routing(routing_provider) => {
                    routing_provider.acquire(&args, deadline)?
                }
            }),
            provider: self,
        })
    }

    fn acquire_direct(
        &self,
        pool: &SimplePool,
        deadline: Option<Instant>,
        auth: SessionAuth,
    ) -> Result<SingleChannel> {
        let mut connection = None;
        while connection.is_none() {
            connection = pool.acquire(deadline)?.prepare(
                deadline,
                self.config.idle_time_before_connection_test,
                auth,
            )?;
        }
        Ok(connection.expect("loop above asserts existence"))
    }

    /// Acquire one connection per candidate server until one responds,
    /// sending a reset round-trip on connections that are not brand-new, and
    /// report that server.
    pub fn verify_connectivity(
        &self,
        database: Option<Arc<String>>,
        mode: RoutingControl,
    ) -> Result<ServerInfo> {
        let deadline = self.config.connection_acquisition_deadline();
        match &self.pools {
            Providers::Direct(pool) => {
                let mut connection = self.acquire_direct(pool, deadline, SessionAuth::None)?;
                let info = ServerInfo::new(&*connection);
                if !connection.fresh() {
                    connection.reset(deadline)?;
                }
                Ok(info)
            }
            Providers::Routing(provider) => {
                provider.with_first_reachable(database, mode, deadline, |connection| {
                    let info = ServerInfo::new(&**connection);
                    if !connection.fresh() {
                        connection.reset(deadline)?;
                    }
                    Ok(info)
                })
            }
        }
    }

    /// Check whether `auth` is accepted by the DBMS by forcing a
    /// re-authentication on an acquired connection.
    ///
    /// Returns `Ok(false)` when the server rejected the credential and
    /// propagates every other failure.
    pub fn verify_authentication(
        &self,
        auth: &Arc<AuthToken>,
        database: Option<Arc<String>>,
        mode: RoutingControl,
    ) -> Result<bool> {
        let res = self.acquire(
            AcquireArgs::new(mode)
                .with_auth(SessionAuth::Forced(auth))
                .with_database_opt(database),
        );
        match res {
            Ok(connection) => {
                drop(connection);
                Ok(true)
            }
            Err(Error::Server { error }) if error.indicates_invalid_auth() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Whether the DBMS supports running queries against a selected database
    /// (negotiated protocol version 4.0+).
    pub fn supports_multi_db(&self) -> Result<bool> {
        Ok(self.negotiated_protocol_version()? >= PROTOCOL_MULTI_DB)
    }

    /// Whether the DBMS supports transaction configuration (negotiated
    /// protocol version 3.0+).
    pub fn supports_transaction_config(&self) -> Result<bool> {
        Ok(self.negotiated_protocol_version()? >= PROTOCOL_TRANSACTION_CONFIG)
    }

    /// Whether the DBMS supports user impersonation (negotiated protocol
    /// version 4.4+).
    pub fn supports_user_impersonation(&self) -> Result<bool> {
        Ok(self.negotiated_protocol_version()? >= PROTOCOL_USER_IMPERSONATION)
    }

    /// Whether the DBMS supports session-scoped authentication (negotiated
    /// protocol version 5.1+).
    pub fn supports_session_auth(&self) -> Result<bool> {
        Ok(self.negotiated_protocol_version()? >= PROTOCOL_SESSION_AUTH)
    }

    fn negotiated_protocol_version(&self) -> Result<(u8, u8)> {
        let deadline = self.config.connection_acquisition_deadline();
        match &self.pools {
            Providers::Direct(pool) => Ok(self
                .acquire_direct(pool, deadline, SessionAuth::None)?
                .protocol_version()),
            Providers::Routing(provider) => provider.with_first_reachable(
                None,
                RoutingControl::Read,
                deadline,
                |connection| Ok(connection.protocol_version()),
            ),
        }
    }

    /// Close all pooled connections and fail pending and future acquisitions.
    pub fn close(&self) {
        match &self.pools {
            Providers::Direct(pool) => pool.close(),
            Providers::Routing(provider) => provider.close(),
        }
    }

    fn handle_server_error_feedback(
        &self,
        channel: &SingleChannel,
        error: &mut ServerError,
    ) -> Result<()> {
        let pools = match &self.pools {
            Providers::Direct(pool) => PoolsRef::Direct(pool),
            Providers::Routing(provider) => PoolsRef::Routing(provider),
        };
        handle_server_error(
            pools,
            &self.config,
            &channel.address(),
            channel.auth(),
            channel.session_auth(),
            error,
        )
    }

    fn deactivate_server(&self, address: &Address) {
        if let Providers::Routing(provider) = &self.pools {
            provider.deactivate_server(address);
        }
    }

    #[cfg(test)]
    fn routing(&self) -> &RoutingProvider {
        match &self.pools {
            Providers::Routing(provider) => provider,
            Providers::Direct(_) => panic!("not a routing provider"),
        }
    }

    #[cfg(test)]
    fn direct(&self) -> &SimplePool {
        match &self.pools {
            Providers::Direct(pool) => pool,
            Providers::Routing(_) => panic!("not a direct provider"),
        }
    }
}

#[derive(Debug)]
enum Providers {
    Direct(SimplePool),
    Routing(RoutingProvider),
}

#[derive(Debug)]
enum PoolsRef<'a> {
    Direct(&'a SimplePool),
    Routing(&'a RoutingProvider),
}

/// A leased connection handed to the session layer.
///
/// Every channel round-trip the caller performs must go through
/// [`PooledConnection::with_channel`], which routes failures through the
/// provider's error classifier (server deactivation, writer demotion, auth
/// invalidation, retryability) before surfacing them.
#[derive(Debug)]
pub struct PooledConnection<'pool> {
    channel: Option<SingleChannel>,
    provider: &'pool ConnectionProvider,
}

impl PooledConnection<'_> {
    pub fn address(&self) -> Arc<Address> {
        self.channel_ref().address()
    }

    pub fn protocol_version(&self) -> (u8, u8) {
        self.channel_ref().protocol_version()
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(&**self.channel_ref())
    }

    pub fn session_auth(&self) -> bool {
        self.channel_ref().session_auth()
    }

    /// Run a channel operation, feeding any failure back into the provider.
    ///
    /// The error is always returned to the caller (possibly rewritten), never
    /// swallowed.
    pub fn with_channel<T>(
        &mut self,
        io_op: impl FnOnce(&mut dyn Channel) -> Result<T>,
    ) -> Result<T> {
        let was_broken = self.channel_ref().unexpectedly_closed();
        let res = io_op(&mut **self.channel_mut());
        let mut res = match res {
            Err(Error::Server { mut error }) => {
                let address = self.channel_ref().address();
                self.provider
                    .handle_server_error_feedback(self.channel_ref(), &mut error)?;
                if error.is_security_error() {
                    // a rejected credential leaves the connection in an
                    // undefined state, it must not be reused
                    self.channel_mut().close();
                }
                if error.invalidates_writer() && self.provider.is_routing() {
                    Err(Error::SessionExpired {
                        message: format!(
                            "no longer possible to write to server at {address}: {error}"
                        ),
                        source: None,
                    })
                } else {
                    Err(Error::Server { error })
                }
            }
            res => res,
        };
        if !was_broken && self.channel_ref().unexpectedly_closed() {
            let address = self.channel_ref().address();
            self.provider.deactivate_server(&address);
            if self.provider.is_routing() {
                res = res.map_err(Error::into_session_expired);
            }
        }
        res
    }

    fn channel_ref(&self) -> &SingleChannel {
        self.channel
            .as_ref()
            .expect("channel option should be Some from init to drop")
    }

    fn channel_mut(&mut self) -> &mut SingleChannel {
        self.channel
            .as_mut()
            .expect("channel option should be Some from init to drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let channel = self
            .channel
            .take()
            .expect("channel option should be Some from init to drop");
        match &self.provider.pools {
            Providers::Direct(_) => drop(channel),
            Providers::Routing(provider) => {
                let _lock = provider.wait_cond.0.lock();
                drop(channel);
                provider.wait_cond.1.notify_all();
            }
        }
    }
}

type RoutingPools = HashMap<Arc<Address>, SimplePool>;

#[derive(Debug)]
struct RoutingProvider {
    pools: MostlyRLock<RoutingPools>,
    wait_cond: Arc<(Mutex<()>, Condvar)>,
    routing_tables: MostlyRLock<RoutingTables>,
    address: Arc<Address>,
    config: Arc<PoolConfig>,
    load_balancing: LeastConnected,
    home_db_cache: HomeDbCache,
    closed: AtomicBool,
}

impl RoutingProvider {
    fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        assert!(config.routing_context.is_some());
        let home_db_cache = HomeDbCache::new(HOME_DB_CACHE_SIZE, config.max_home_database_delay);
        Self {
            pools: MostlyRLock::new(HashMap::with_capacity(DEFAULT_CLUSTER_SIZE)),
            wait_cond: Arc::new((Mutex::new(()), Condvar::new())),
            routing_tables: MostlyRLock::new(RoutingTables::default()),
            address,
            config,
            load_balancing: LeastConnected::default(),
            home_db_cache,
            closed: AtomicBool::new(false),
        }
    }

    fn acquire(&self, args: &AcquireArgs, deadline: Option<Instant>) -> Result<SingleChannel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::pool_closed());
        }
        debug!(
            "acquiring {:?} connection towards {}",
            args.mode,
            args.database
                .as_ref()
                .map(|db| format!("{db:?}"))
                .unwrap_or(String::from("default database"))
        );
        let session_auth_token = match args.auth {
            SessionAuth::Reauth(auth) | SessionAuth::Forced(auth) => Some(auth),
            SessionAuth::None => None,
        };
        // home-database resolution only applies when no database was named
        let cache_key = match &args.database {
            Some(_) => None,
            None => Some(HomeDbCacheKey::new(
                args.impersonated_user.as_ref(),
                session_auth_token,
            )),
        };
        let db_req = match &args.database {
            Some(db) => Some(UpdateRtDb {
                db: Arc::clone(db),
                guess: false,
            }),
            None => cache_key
                .as_ref()
                .and_then(|key| self.home_db_cache.get(key))
                .map(|db| UpdateRtDb { db, guess: true }),
        };
        let db_resolution_cb = |resolved: Option<Arc<String>>| {
            if let (Some(key), Some(db)) = (&cache_key, &resolved) {
                self.home_db_cache.update(key.clone(), Arc::clone(db));
            }
            if let Some(cb) = args.on_db_resolved {
                cb(resolved);
            }
        };
        let update_rt_args = UpdateRtArgs {
            db: db_req.as_ref(),
            bookmarks: args.bookmarks,
            imp_user: args.impersonated_user.as_deref().map(String::as_str),
            session_auth: args.auth,
            deadline,
            db_resolution_cb: Some(&db_resolution_cb),
        };
        let acquire_args = AcquireConfig {
            mode: args.mode,
            update_rt_args,
        };

        let (targets, db) = self.choose_addresses_from_fresh_rt(acquire_args)?;
        'target: for target in &targets {
            while let Some(connection) = self.acquire_routing_address_no_wait(target) {
                match connection.prepare(
                    deadline,
                    self.config.idle_time_before_connection_test,
                    args.auth,
                ) {
                    Ok(Some(connection)) => return Ok(connection),
                    Ok(None) => continue,
                    Err(Error::ServiceUnavailable { .. }) => {
                        self.deactivate_server(target);
                        continue 'target;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // time to wait for a free connection
        let mut cond_lock = self.wait_cond.0.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::pool_closed());
            }
            let targets = self.choose_addresses(acquire_args.mode, &db)?;
            // a connection could've been returned while we didn't hold the
            // lock => try again with the lock
            let mut found = None;
            for target in &targets {
                if let Some(connection) = self.acquire_routing_address_no_wait(target) {
                    found = Some((Arc::clone(target), connection));
                    break;
                }
            }
            if let Some((target, connection)) = found {
                drop(cond_lock);
                match connection.prepare(
                    deadline,
                    self.config.idle_time_before_connection_test,
                    args.auth,
                ) {
                    Ok(Some(connection)) => return Ok(connection),
                    Ok(None) => {
                        cond_lock = self.wait_cond.0.lock();
                        continue;
                    }
                    Err(Error::ServiceUnavailable { .. }) => {
                        self.deactivate_server(&target);
                        cond_lock = self.wait_cond.0.lock();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            match deadline {
                None => self.wait_cond.1.wait(&mut cond_lock),
                Some(deadline) => {
                    if self
                        .wait_cond
                        .1
                        .wait_until(&mut cond_lock, deadline)
                        .timed_out()
                    {
                        return Err(Error::connection_acquisition_timeout(
                            "waiting for room in the connection pool",
                        ));
                    }
                }
            }
        }
    }

    /// Guarantees that the returned Vec is not empty.
    fn choose_addresses_from_fresh_rt(
        &self,
        args: AcquireConfig,
    ) -> Result<(Addresses, Option<Arc<String>>)> {
        let (lock, db) = self.get_fresh_rt(args)?;
        let rt = lock.get(&db).ok_or_else(|| {
            Error::session_expired(format!("routing table for {db:?} vanished during refresh"))
        })?;
        Ok((self.ordered_servers(rt, args.mode)?, db))
    }

    /// Guarantees that the returned Vec is not empty.
    fn choose_addresses(&self, mode: RoutingControl, db: &Option<Arc<String>>) -> Result<Addresses> {
        let rts = self.routing_tables.read();
        match rts.get(db) {
            Some(rt) => self.ordered_servers(rt, mode),
            None => Err(Error::session_expired(format!(
                "no routing table left for database {db:?}"
            ))),
        }
    }

    /// Guarantees that the returned Vec is not empty.
    fn ordered_servers(&self, rt: &RoutingTable, mode: RoutingControl) -> Result<Addresses> {
        let pools = self.pools.read();
        let ordered = self
            .load_balancing
            .order(mode, rt.servers_for_mode(mode), |addr| {
                pools.get(addr).map(|p| p.in_use()).unwrap_or(0)
            });
        if ordered.is_empty() {
            return Err(Error::SessionExpired {
                message: format!(
                    "no server available for {mode:?} access; last known routing table: {rt:?}"
                ),
                source: None,
            });
        }
        Ok(ordered)
    }

    fn acquire_routing_address_no_wait(
        &self,
        target: &Arc<Address>,
    ) -> Option<UnpreparedSingleChannel> {
        let pools = self.ensure_pool_exists(target);
        pools
            .get(target)
            .expect("just created above")
            .acquire_no_wait()
    }

    fn acquire_routing_address(
        &self,
        target: &Arc<Address>,
        args: UpdateRtArgs,
    ) -> Result<SingleChannel> {
        let mut connection = None;
        while connection.is_none() {
            let unprepared_connection = {
                let pools = self.ensure_pool_exists(target);
                pools
                    .get(target)
                    .expect("just created above")
                    .acquire(args.deadline)
            }?;
            connection = unprepared_connection.prepare(
                args.deadline,
                self.config.idle_time_before_connection_test,
                args.session_auth,
            )?;
        }
        Ok(connection.expect("loop above asserts existence"))
    }

    fn ensure_pool_exists(&self, target: &Arc<Address>) -> RwLockReadGuard<'_, RoutingPools> {
        self.pools
            .maybe_write(
                |pools| pools.get(target).is_none(),
                |mut pools| {
                    pools.insert(
                        Arc::clone(target),
                        SimplePool::new(Arc::clone(target), Arc::clone(&self.config)),
                    );
                    Ok(())
                },
            )
            .expect("updater is infallible")
    }

    fn get_fresh_rt(
        &self,
        args: AcquireConfig,
    ) -> Result<(RwLockReadGuard<'_, RoutingTables>, Option<Arc<String>>)> {
        let rt_args = args.update_rt_args;
        let db_key = rt_args.rt_key();
        let db_name = RefCell::new(rt_args.db_request());
        let db_name_ref = &db_name;
        let lock = self.routing_tables.try_maybe_write_until(
            rt_args.deadline,
            "waiting for access to the routing tables",
            |rts| {
                let needs_update = rts
                    .get(&db_key)
                    .map(|rt| !rt.is_fresh(args.mode))
                    .unwrap_or(true);
                if !needs_update {
                    *db_name_ref.borrow_mut() = db_key.clone();
                }
                needs_update
            },
            |mut rts| {
                let rt = rts.get_or_insert_default(rt_args.rt_key());
                if !rt.is_fresh(args.mode) {
                    let mut new_db = self.update_rts(rt_args, &mut rts)?;
                    if new_db.is_some() && db_name_ref.borrow().is_none() {
                        mem::swap(&mut *db_name_ref.borrow_mut(), &mut new_db);
                    }
                } else {
                    // another acquisition got here first
                    *db_name_ref.borrow_mut() = rt_args.rt_key();
                }
                Ok(())
            },
        )?;
        Ok((lock, db_name.into_inner()))
    }

    fn update_rts(
        &self,
        args: UpdateRtArgs,
        rts: &mut RoutingTables,
    ) -> Result<Option<Arc<String>>> {
        debug!("fetching new routing table for {:?}", args.db);
        let (pref_init_router, routers) = {
            let rt = rts.get_or_insert_default(args.rt_key());
            let routers = rt
                .routers
                .iter()
                .filter(|&r| r != &self.address)
                .map(Arc::clone)
                .collect::<Vec<_>>();
            (rt.initialized_without_writers, routers)
        };
        let mut new_rt: Result<RoutingTable>;
        if pref_init_router {
            new_rt = self.fetch_rt_from_routers(&[Arc::clone(&self.address)], args, rts)?;
            if new_rt.is_err() && !routers.is_empty() {
                new_rt = self.fetch_rt_from_routers(&routers, args, rts)?;
            }
        } else {
            new_rt = self.fetch_rt_from_routers(&routers, args, rts)?;
            if new_rt.is_err() {
                new_rt = self.fetch_rt_from_routers(&[Arc::clone(&self.address)], args, rts)?;
            }
        }
        match new_rt {
            Err(err) => {
                error!("failed to update routing table; last error: {err}");
                let last_known = rts.get(&args.rt_key());
                Err(Error::service_unavailable(format!(
                    "unable to retrieve routing information; \
                     last known routing table: {last_known:?}; last error: {err}"
                )))
            }
            Ok(mut new_rt) => {
                let db = match args.db {
                    Some(args_db) if !args_db.guess => {
                        let db = Some(Arc::clone(&args_db.db));
                        new_rt.database.clone_from(&db);
                        db
                    }
                    _ => new_rt.database.clone(),
                };
                debug!("storing new routing table for {db:?}: {new_rt:?}");
                rts.register(db.as_ref().map(Arc::clone), new_rt);
                self.clean_up_pools(rts);
                rts.remove_expired(self.config.routing_table_purge_delay);
                if let Some(cb) = args.db_resolution_cb {
                    cb(db.as_ref().map(Arc::clone));
                }
                Ok(db)
            }
        }
    }

    fn fetch_rt_from_routers(
        &self,
        routers: &[Arc<Address>],
        args: UpdateRtArgs,
        rts: &mut RoutingTables,
    ) -> Result<Result<RoutingTable>> {
        let mut last_err = None;
        for router in routers {
            for resolution in Arc::clone(router).fully_resolve(self.config.resolver.as_deref())? {
                let Ok(resolved) = resolution else {
                    self.deactivate_server_locked_rts(router, rts);
                    continue;
                };
                match Self::wrap_discovery_error(
                    self.acquire_routing_address(&resolved, args)
                        .and_then(|mut con| self.fetch_rt_from_router(&mut con, args)),
                )? {
                    Ok(rt) => return Ok(Ok(rt)),
                    Err(err) => last_err = Some(err),
                };
                self.deactivate_server_locked_rts(&resolved, rts);
            }
        }
        Ok(Err(last_err.unwrap_or_else(|| {
            Error::service_unavailable("no known routers left")
        })))
    }

    fn fetch_rt_from_router(
        &self,
        con: &mut SingleChannel,
        args: UpdateRtArgs,
    ) -> Result<RoutingTable> {
        let routing_context = self
            .config
            .routing_context
            .as_ref()
            .expect("a routing provider always has a routing context");
        let meta = con
            .route(RouteParameters::new(
                routing_context,
                args.bookmarks,
                args.db_request_str(),
                args.imp_user,
            ))
            .map_err(|err| match err {
                Error::Server { error } => {
                    if error.unauthenticates_all_connections() {
                        self.reset_all_auth(&con.address());
                    }
                    if error.means_routing_unsupported() {
                        Error::service_unavailable(format!(
                            "server at {} does not support routing; \
                             make sure you are connecting to a cluster",
                            con.address()
                        ))
                    } else {
                        Error::Server { error }
                    }
                }
                err => err,
            })?;
        let rt = RoutingTable::try_parse(meta).map_err(|e| {
            warn!("failed to parse routing table: {e}");
            Error::protocol_error(format!("{e}"))
        })?;
        if rt.routers.is_empty() {
            debug!("received routing table without routers -> discarded");
            // Not technically a connectivity error, but it signals that this
            // table must not be used and another router, if available, should
            // be tried.
            return Err(Error::service_unavailable(
                "received routing table without routers",
            ));
        }
        if rt.readers.is_empty() {
            debug!("received routing table without readers -> discarded");
            return Err(Error::service_unavailable(
                "received routing table without readers",
            ));
        }
        // A table without writers is accepted; it likely indicates a
        // temporary state such as a leader switch.
        Ok(rt)
    }

    fn clean_up_pools(&self, rts: &mut RoutingTables) {
        drop(self.pools.update(|mut pools| {
            let used_addresses = rts
                .values()
                .flat_map(|rt| rt.all_servers())
                .map(Arc::clone)
                .collect::<HashSet<_>>();
            pools.retain(|addr, _| used_addresses.contains(addr));
            Ok(())
        }));
    }

    fn deactivate_server(&self, addr: &Address) {
        drop(self.routing_tables.update(|mut rts| {
            drop(self.pools.update(|mut pools| {
                Self::deactivate_server_locked(addr, &mut rts, &mut pools);
                Ok(())
            }));
            Ok(())
        }));
    }

    fn deactivate_server_locked_rts(&self, addr: &Address, rts: &mut RoutingTables) {
        drop(self.pools.update(|mut pools| {
            Self::deactivate_server_locked(addr, rts, &mut pools);
            Ok(())
        }));
    }

    fn deactivate_server_locked(addr: &Address, rts: &mut RoutingTables, pools: &mut RoutingPools) {
        debug!("deactivating address: {addr:?}");
        rts.deactivate(addr);
        pools.remove(addr);
    }

    fn deactivate_writer(&self, addr: &Address) {
        drop(self.routing_tables.update(|mut rts| {
            debug!("deactivating writer: {addr:?}");
            rts.deactivate_writer(addr);
            Ok(())
        }));
    }

    fn reset_all_auth(&self, address: &Arc<Address>) {
        if let Some(pool) = self.pools.read().get(address) {
            pool.reset_all_auth();
        }
    }

    /// Acquire a connection per candidate of the requested mode (in balanced
    /// order) and run `op` on the first one that works.
    fn with_first_reachable<T>(
        &self,
        database: Option<Arc<String>>,
        mode: RoutingControl,
        deadline: Option<Instant>,
        mut op: impl FnMut(&mut SingleChannel) -> Result<T>,
    ) -> Result<T> {
        let db_req = database.map(|db| UpdateRtDb { db, guess: false });
        let update_rt_args = UpdateRtArgs {
            db: db_req.as_ref(),
            bookmarks: None,
            imp_user: None,
            session_auth: SessionAuth::None,
            deadline,
            db_resolution_cb: None,
        };
        let args = AcquireConfig {
            mode,
            update_rt_args,
        };
        let (targets, _) = self.choose_addresses_from_fresh_rt(args)?;
        let mut last_err = None;
        for target in &targets {
            match self
                .acquire_routing_address(target, update_rt_args)
                .and_then(|mut con| op(&mut con))
            {
                Ok(res) => return Ok(res),
                Err(err) => {
                    info!("server at {target} failed the check: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("choose_addresses_from_fresh_rt guarantees targets"))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        {
            let pools = self.pools.read();
            for pool in pools.values() {
                pool.close();
            }
        }
        // wake acquisitions waiting for a free connection
        let _lock = self.wait_cond.0.lock();
        self.wait_cond.1.notify_all();
    }

    fn wrap_discovery_error<T>(res: Result<T>) -> Result<Result<T>> {
        match res {
            Ok(t) => Ok(Ok(t)),
            Err(e) => {
                if e.fatal_during_discovery() {
                    Err(e)
                } else {
                    info!("ignored error during discovery: {e:?}");
                    Ok(Err(e))
                }
            }
        }
    }

    #[cfg(test)]
    fn seed_routing_table(&self, db: Option<Arc<String>>, table: RoutingTable) {
        let mut table = Some(table);
        drop(self.routing_tables.update(|mut rts| {
            rts.register(db.clone(), table.take().expect("update runs exactly once"));
            Ok(())
        }));
    }

    #[cfg(test)]
    fn table_servers(
        &self,
        db: &Option<Arc<String>>,
    ) -> Option<(Addresses, Addresses, Addresses)> {
        self.routing_tables
            .read()
            .get(db)
            .map(|rt| (rt.routers.clone(), rt.readers.clone(), rt.writers.clone()))
    }

    #[cfg(test)]
    fn table_initialized_without_writers(&self, db: &Option<Arc<String>>) -> Option<bool> {
        self.routing_tables
            .read()
            .get(db)
            .map(|rt| rt.initialized_without_writers)
    }

    #[cfg(test)]
    fn pool_addresses(&self) -> Addresses {
        self.pools.read().keys().map(Arc::clone).collect()
    }
}

fn handle_server_error(
    pools: PoolsRef,
    config: &Arc<PoolConfig>,
    address: &Arc<Address>,
    current_auth: Option<Arc<AuthToken>>,
    session_auth: bool,
    error: &mut ServerError,
) -> Result<()> {
    let current_auth = current_auth.ok_or_else(|| {
        Error::protocol_error("server sent security error over unauthenticated connection")
    })?;
    if error.deactivates_server() {
        match pools {
            PoolsRef::Direct(_) => {}
            PoolsRef::Routing(provider) => provider.deactivate_server(address),
        }
    } else if error.invalidates_writer() {
        match pools {
            PoolsRef::Direct(_) => {}
            PoolsRef::Routing(provider) => provider.deactivate_writer(address),
        }
    }
    if error.is_security_error() {
        if error.unauthenticates_all_connections() {
            debug!("mark all connections to {} as unauthenticated", address);
            match pools {
                PoolsRef::Direct(pool) => pool.reset_all_auth(),
                PoolsRef::Routing(provider) => provider.reset_all_auth(address),
            }
        }
        if !session_auth {
            match &config.auth {
                AuthConfig::Static(_) => {}
                AuthConfig::Manager(manager) => {
                    let handled =
                        auth_managers::handle_security_error(&**manager, &current_auth, error)?;
                    if handled {
                        error.overwrite_retryable();
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Copy, Clone)]
struct AcquireConfig<'a> {
    mode: RoutingControl,
    update_rt_args: UpdateRtArgs<'a>,
}

#[derive(Copy, Clone)]
struct UpdateRtArgs<'a> {
    db: Option<&'a UpdateRtDb>,
    bookmarks: Option<&'a [String]>,
    imp_user: Option<&'a str>,
    session_auth: SessionAuth<'a>,
    deadline: Option<Instant>,
    db_resolution_cb: Option<&'a dyn Fn(Option<Arc<String>>)>,
}

impl Debug for UpdateRtArgs<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRtArgs")
            .field("db", &self.db)
            .field("bookmarks", &self.bookmarks)
            .field("imp_user", &self.imp_user)
            .field("session_auth", &self.session_auth)
            .field("deadline", &self.deadline)
            .field(
                "db_resolution_cb",
                &self.db_resolution_cb.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

impl UpdateRtArgs<'_> {
    fn rt_key(&self) -> Option<Arc<String>> {
        self.db.as_ref().map(|db| Arc::clone(&db.db))
    }

    fn db_request_str(&self) -> Option<&str> {
        self.db.as_ref().and_then(|db| match db.guess {
            true => None,
            false => Some(db.db.as_str()),
        })
    }

    fn db_request(&self) -> Option<Arc<String>> {
        self.db.as_ref().and_then(|db| match db.guess {
            true => None,
            false => Some(Arc::clone(&db.db)),
        })
    }
}

#[derive(Debug, Clone)]
struct UpdateRtDb {
    db: Arc<String>,
    /// The name came from the home-database cache, not from the caller; the
    /// cluster remains the authority on it.
    guess: bool,
}
