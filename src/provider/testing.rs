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

//! Scripted channel fakes for pool and provider tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::PoolConfig;
use crate::address_::Address;
use crate::auth::AuthToken;
use crate::channel::{
    AuthResetHandle, Channel, ChannelConfig, ChannelFactory, HelloParameters, ReauthParameters,
    RouteParameters,
};
use crate::config::AuthConfig;
use crate::error_::{Error, Result, ServerError};
use crate::value::Value;
use crate::value_map;

/// An address that claims to be DNS resolved, so tests never hit the network.
pub(crate) fn test_address(host: &str) -> Arc<Address> {
    let mut address = Address::from(host);
    address.is_dns_resolved = true;
    Arc::new(address)
}

/// `127.0.0.1:<port>`; routing tables in tests identify servers by port.
pub(crate) fn test_server(port: u16) -> Arc<Address> {
    Arc::new(Address::from(("127.0.0.1", port)))
}

pub(crate) fn test_pool_config(factory: &Arc<FakeFactory>) -> Arc<PoolConfig> {
    test_pool_config_with(factory, |_| {})
}

pub(crate) fn test_pool_config_with(
    factory: &Arc<FakeFactory>,
    adjust: impl FnOnce(&mut PoolConfig),
) -> Arc<PoolConfig> {
    let mut config = PoolConfig {
        routing_context: None,
        tls_config: None,
        user_agent: String::from("test-agent/0.0"),
        auth: AuthConfig::Static(Arc::new(AuthToken::new_basic_auth("user", "pass"))),
        max_connection_lifetime: None,
        max_connection_pool_size: 100,
        connection_timeout: None,
        connection_acquisition_timeout: None,
        idle_time_before_connection_test: None,
        routing_table_purge_delay: Duration::from_secs(30),
        max_home_database_delay: Duration::from_secs(5),
        resolver: None,
        factory: Arc::clone(factory) as Arc<dyn ChannelFactory>,
    };
    adjust(&mut config);
    Arc::new(config)
}

/// Routing metadata the way a router would reply, servers given as ports on
/// localhost.
pub(crate) fn route_meta(
    routers: &[u16],
    readers: &[u16],
    writers: &[u16],
    ttl: i64,
    db: Option<&str>,
) -> HashMap<String, Value> {
    fn entry(role: &str, ports: &[u16]) -> Value {
        Value::from(value_map!({
            "role": role,
            "addresses": Value::List(
                ports
                    .iter()
                    .map(|port| Value::from(format!("127.0.0.1:{port}")))
                    .collect()
            ),
        }))
    }

    let mut rt = value_map!({
        "ttl": ttl,
        "servers": Value::List(vec![
            entry("ROUTE", routers),
            entry("READ", readers),
            entry("WRITE", writers),
        ]),
    });
    if let Some(db) = db {
        rt.insert("db".into(), Value::from(db));
    }
    value_map!({"rt": rt})
}

/// A scripted outcome for a channel round-trip.
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Ok,
    Route(HashMap<String, Value>),
    Io(&'static str),
    Server(&'static str),
}

impl Scripted {
    fn unit_result(&self) -> Result<()> {
        match self {
            Scripted::Ok | Scripted::Route(_) => Ok(()),
            Scripted::Io(message) => Err(Error::ServiceUnavailable {
                message: String::from(*message),
                source: Some(io::Error::new(io::ErrorKind::BrokenPipe, *message)),
            }),
            Scripted::Server(code) => {
                Err(ServerError::new(String::from(*code), String::from("scripted")).into())
            }
        }
    }

    fn breaks_channel(&self) -> bool {
        matches!(self, Scripted::Io(_))
    }
}

#[derive(Debug)]
pub(crate) struct AddressScript {
    pub(crate) supports_reauth: bool,
    pub(crate) protocol_version: (u8, u8),
    pub(crate) open_failures: usize,
    pub(crate) hello_replies: Arc<Mutex<VecDeque<Scripted>>>,
    pub(crate) route_replies: Arc<Mutex<VecDeque<Scripted>>>,
}

impl Default for AddressScript {
    fn default() -> Self {
        Self {
            supports_reauth: true,
            protocol_version: (5, 4),
            open_failures: 0,
            hello_replies: Default::default(),
            route_replies: Default::default(),
        }
    }
}

/// Shared, observable state of one fake channel.
#[derive(Debug)]
pub(crate) struct FakeChannelControl {
    pub(crate) auth_reset: AuthResetHandle,
    pub(crate) server_agent: Arc<String>,
    pub(crate) protocol_version: (u8, u8),
    pub(crate) supports_reauth: bool,
    pub(crate) auth: Option<Arc<AuthToken>>,
    pub(crate) session_auth: bool,
    pub(crate) closed: bool,
    pub(crate) broken: bool,
    pub(crate) age: Duration,
    pub(crate) idle: Duration,
    pub(crate) reset_replies: VecDeque<Scripted>,
    pub(crate) hello_count: usize,
    pub(crate) reauth_count: usize,
    pub(crate) reset_count: usize,
}

#[derive(Debug)]
pub(crate) struct FakeChannel {
    address: Arc<Address>,
    control: Arc<Mutex<FakeChannelControl>>,
    auth_reset: AuthResetHandle,
    hello_replies: Arc<Mutex<VecDeque<Scripted>>>,
    route_replies: Arc<Mutex<VecDeque<Scripted>>>,
}

impl Channel for FakeChannel {
    fn address(&self) -> Arc<Address> {
        Arc::clone(&self.address)
    }

    fn server_agent(&self) -> Arc<String> {
        Arc::clone(&self.control.lock().server_agent)
    }

    fn protocol_version(&self) -> (u8, u8) {
        self.control.lock().protocol_version
    }

    fn supports_reauth(&self) -> bool {
        self.control.lock().supports_reauth
    }

    fn hello(&mut self, parameters: HelloParameters) -> Result<()> {
        let mut control = self.control.lock();
        control.hello_count += 1;
        let scripted = self.hello_replies.lock().pop_front().unwrap_or(Scripted::Ok);
        if scripted.breaks_channel() {
            control.broken = true;
            control.closed = true;
        }
        scripted.unit_result()?;
        control.auth = Some(Arc::clone(parameters.auth));
        control.session_auth = parameters.session_auth;
        Ok(())
    }

    fn reauth(&mut self, parameters: ReauthParameters) -> Result<()> {
        let mut control = self.control.lock();
        control.reauth_count += 1;
        control.auth = Some(Arc::clone(parameters.auth));
        control.session_auth = parameters.session_auth;
        self.auth_reset.reset();
        Ok(())
    }

    fn needs_reauth(&self, parameters: ReauthParameters) -> bool {
        if self.auth_reset.is_marked() {
            return true;
        }
        let control = self.control.lock();
        match &control.auth {
            None => true,
            Some(auth) => {
                !auth.eq_data(parameters.auth) || control.session_auth != parameters.session_auth
            }
        }
    }

    fn auth(&self) -> Option<Arc<AuthToken>> {
        self.control.lock().auth.as_ref().map(Arc::clone)
    }

    fn session_auth(&self) -> bool {
        self.control.lock().session_auth
    }

    fn auth_reset_handle(&self) -> AuthResetHandle {
        AuthResetHandle::clone(&self.auth_reset)
    }

    fn route(&mut self, _parameters: RouteParameters) -> Result<HashMap<String, Value>> {
        let scripted = self
            .route_replies
            .lock()
            .pop_front()
            .ok_or_else(|| Error::protocol_error("no scripted route response"))?;
        if scripted.breaks_channel() {
            let mut control = self.control.lock();
            control.broken = true;
            control.closed = true;
        }
        match scripted {
            Scripted::Route(meta) => Ok(meta),
            other => other.unit_result().map(|_| HashMap::new()),
        }
    }

    fn reset(&mut self, _deadline: Option<Instant>) -> Result<()> {
        let mut control = self.control.lock();
        control.reset_count += 1;
        let scripted = control.reset_replies.pop_front().unwrap_or(Scripted::Ok);
        if scripted.breaks_channel() {
            control.broken = true;
            control.closed = true;
        }
        scripted.unit_result()
    }

    fn close(&mut self) {
        self.control.lock().closed = true;
    }

    fn closed(&self) -> bool {
        let control = self.control.lock();
        control.closed || control.broken
    }

    fn unexpectedly_closed(&self) -> bool {
        self.control.lock().broken
    }

    fn is_older_than(&self, age: Duration) -> bool {
        self.control.lock().age > age
    }

    fn is_idle_for(&self, timeout: Duration) -> bool {
        self.control.lock().idle >= timeout
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeFactory {
    scripts: Mutex<HashMap<Address, AddressScript>>,
    opened: Mutex<Vec<(Arc<Address>, Arc<Mutex<FakeChannelControl>>)>>,
}

impl FakeFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adjust the script for `host` (either `"name"` or `"ip:port"`).
    pub(crate) fn script_address(&self, host: &str, adjust: impl FnOnce(&mut AddressScript)) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(Address::from(host)).or_default();
        adjust(script);
    }

    pub(crate) fn push_route_reply(&self, host: &str, reply: Scripted) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(Address::from(host)).or_default();
        script.route_replies.lock().push_back(reply);
    }

    pub(crate) fn opened_count(&self) -> usize {
        self.opened.lock().len()
    }

    pub(crate) fn opened_addresses(&self) -> Vec<Arc<Address>> {
        self.opened.lock().iter().map(|(a, _)| Arc::clone(a)).collect()
    }

    /// Control handle of the `index`th channel ever opened.
    pub(crate) fn control_of(&self, index: usize) -> Arc<Mutex<FakeChannelControl>> {
        Arc::clone(&self.opened.lock()[index].1)
    }

    /// Control handle of the most recently opened channel to `host`.
    pub(crate) fn control_for(&self, host: &str) -> Arc<Mutex<FakeChannelControl>> {
        let wanted = Address::from(host);
        let opened = self.opened.lock();
        opened
            .iter()
            .rev()
            .find(|(address, _)| **address == wanted)
            .map(|(_, control)| Arc::clone(control))
            .expect("no channel was opened to the given host")
    }
}

impl ChannelFactory for FakeFactory {
    fn open(
        &self,
        address: Arc<Address>,
        _deadline: Option<Instant>,
        _config: ChannelConfig,
    ) -> Result<Box<dyn Channel>> {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry((*address).clone()).or_default();
        if script.open_failures > 0 {
            script.open_failures -= 1;
            return Err(Error::ServiceUnavailable {
                message: format!("scripted connect failure for {address}"),
                source: Some(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted")),
            });
        }
        let auth_reset = AuthResetHandle::new();
        let control = Arc::new(Mutex::new(FakeChannelControl {
            auth_reset: AuthResetHandle::clone(&auth_reset),
            server_agent: Arc::new(String::from("FakeDBMS/5.0")),
            protocol_version: script.protocol_version,
            supports_reauth: script.supports_reauth,
            auth: None,
            session_auth: false,
            closed: false,
            broken: false,
            age: Duration::ZERO,
            idle: Duration::ZERO,
            reset_replies: VecDeque::new(),
            hello_count: 0,
            reauth_count: 0,
            reset_count: 0,
        }));
        let channel = FakeChannel {
            address: Arc::clone(&address),
            control: Arc::clone(&control),
            auth_reset,
            hello_replies: Arc::clone(&script.hello_replies),
            route_replies: Arc::clone(&script.route_replies),
        };
        self.opened.lock().push((address, control));
        Ok(Box::new(channel))
    }
}
