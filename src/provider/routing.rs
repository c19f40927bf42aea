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
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use super::RoutingControl;
use crate::address_::Address;
use crate::value::Value;

/// The routing view for one database: which cluster members route, serve
/// reads, and serve writes, and for how long that knowledge may be relied
/// upon.
#[derive(Debug)]
pub(crate) struct RoutingTable {
    pub(crate) routers: Vec<Arc<Address>>,
    pub(crate) readers: Vec<Arc<Address>>,
    pub(crate) writers: Vec<Arc<Address>>,
    pub(crate) database: Option<Arc<String>>,
    /// A table that arrived without writers usually means the cluster is
    /// between leaders; the next refresh prefers the seed router.
    pub(crate) initialized_without_writers: bool,
    created: Instant,
    ttl: Duration,
}

impl RoutingTable {
    /// An empty placeholder that is stale for every mode.
    pub(crate) fn new() -> Self {
        Self {
            routers: Vec::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            database: None,
            initialized_without_writers: true,
            created: Instant::now(),
            ttl: Duration::new(0, 0),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_servers(
        routers: Vec<Arc<Address>>,
        readers: Vec<Arc<Address>>,
        writers: Vec<Arc<Address>>,
        ttl: Duration,
    ) -> Self {
        let initialized_without_writers = writers.is_empty();
        Self {
            routers,
            readers,
            writers,
            database: None,
            initialized_without_writers,
            created: Instant::now(),
            ttl,
        }
    }

    pub(crate) fn servers_for_mode(&self, mode: RoutingControl) -> &[Arc<Address>] {
        match mode {
            RoutingControl::Read => &self.readers,
            RoutingControl::Write => &self.writers,
        }
    }

    pub(crate) fn all_servers(&self) -> impl Iterator<Item = &Arc<Address>> {
        self.routers
            .iter()
            .chain(self.readers.iter())
            .chain(self.writers.iter())
    }

    pub(crate) fn try_parse(
        mut data: HashMap<String, Value>,
    ) -> Result<Self, RoutingTableParseError> {
        let rt = data.remove("rt").ok_or(RoutingTableParseError {
            reason: "top-level key \"rt\" missing",
        })?;
        let mut rt = rt.try_into_map().map_err(|_| RoutingTableParseError {
            reason: "value \"rt\" did not contain a map",
        })?;
        let ttl = rt.remove("ttl").ok_or(RoutingTableParseError {
            reason: "missing \"ttl\"",
        })?;
        let ttl: i64 = ttl.try_into_int().map_err(|_| RoutingTableParseError {
            reason: "\"ttl\" was not integer",
        })?;
        if ttl < 0 {
            return Err(RoutingTableParseError {
                reason: "negative \"ttl\"",
            });
        }
        let ttl = Duration::from_secs(ttl as u64);
        let db = match rt.remove("db") {
            None => Ok(None),
            Some(Value::String(db)) => Ok(Some(db)),
            Some(_) => Err(RoutingTableParseError {
                reason: "\"db\" was not string",
            }),
        }?;
        let servers = rt.remove("servers").ok_or(RoutingTableParseError {
            reason: "missing \"servers\"",
        })?;
        let mut routers = Vec::new();
        let mut readers = Vec::new();
        let mut writers = Vec::new();

        let servers = servers
            .try_into_list()
            .map_err(|_| RoutingTableParseError {
                reason: "\"servers\" was not list",
            })?;
        for server in servers.into_iter() {
            match Self::parse_server(server)? {
                (ServerRole::Router, addresses) => routers = addresses,
                (ServerRole::Reader, addresses) => readers = addresses,
                (ServerRole::Writer, addresses) => writers = addresses,
                (_, _) => {}
            }
        }

        let initialized_without_writers = writers.is_empty();
        Ok(Self {
            routers,
            readers,
            writers,
            database: db.map(Arc::new),
            initialized_without_writers,
            created: Instant::now(),
            ttl,
        })
    }

    fn parse_server(
        server: Value,
    ) -> Result<(ServerRole, Vec<Arc<Address>>), RoutingTableParseError> {
        let mut server = server.try_into_map().map_err(|_| RoutingTableParseError {
            reason: "\"servers\" entry was not map",
        })?;
        let role = server.remove("role").ok_or(RoutingTableParseError {
            reason: "\"servers\" entry missing \"role\"",
        })?;
        let role: String = role.try_into_string().map_err(|_| RoutingTableParseError {
            reason: "\"servers\" entry \"role\" was not string",
        })?;
        let role = match role.as_str().into() {
            ServerRole::Unknown => {
                warn!("ignoring unknown server role {}", role);
                return Ok((ServerRole::Unknown, vec![]));
            }
            role => role,
        };
        let addresses = server.remove("addresses").ok_or(RoutingTableParseError {
            reason: "\"servers\" entry missing \"addresses\"",
        })?;
        let addresses: Vec<Value> =
            addresses
                .try_into_list()
                .map_err(|_| RoutingTableParseError {
                    reason: "\"servers\" entry \"addresses\" was not list",
                })?;
        let addresses = addresses
            .into_iter()
            .map(|address| {
                let address: String =
                    address
                        .try_into_string()
                        .map_err(|_| RoutingTableParseError {
                            reason: "\"servers\" entry \"addresses\" contained non-string",
                        })?;
                let address = Address::from(&*address);
                Ok(Arc::new(address))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((role, addresses))
    }

    pub(crate) fn is_fresh(&self, mode: RoutingControl) -> bool {
        if self.routers.is_empty() {
            debug!("routing table stale: no routers left {:?}", self);
            return false;
        }
        if self.servers_for_mode(mode).is_empty() {
            debug!(
                "routing table stale: no servers for {:?} mode left {:?}",
                mode, self
            );
            return false;
        }
        if self.created.elapsed() > self.ttl {
            debug!(
                "routing table stale: ttl ({:?}) < age ({:?}) {:?}",
                self.ttl,
                self.created.elapsed(),
                self
            );
            return false;
        }
        debug!("routing table is fresh {:?}", self);
        true
    }

    /// Expired long enough ago for the registry sweeper to drop the table.
    pub(crate) fn is_expired_for_purge(&self, purge_delay: Duration) -> bool {
        self.created.elapsed() >= self.ttl + purge_delay
    }

    pub(crate) fn deactivate(&mut self, addr: &Address) {
        self.routers = mem::take(&mut self.routers)
            .into_iter()
            .filter(|a| **a != *addr)
            .collect();
        self.readers = mem::take(&mut self.readers)
            .into_iter()
            .filter(|a| **a != *addr)
            .collect();
        self.deactivate_writer(addr);
    }

    pub(crate) fn deactivate_writer(&mut self, addr: &Address) {
        self.writers = mem::take(&mut self.writers)
            .into_iter()
            .filter(|a| **a != *addr)
            .collect();
    }
}

/// All routing tables the provider currently holds, one per database.
///
/// The unnamed default database lives under the `None` key; `null` and the
/// default marker share this one bucket.
#[derive(Debug, Default)]
pub(crate) struct RoutingTables {
    tables: HashMap<Option<Arc<String>>, RoutingTable>,
}

impl RoutingTables {
    pub(crate) fn get(&self, db: &Option<Arc<String>>) -> Option<&RoutingTable> {
        self.tables.get(db)
    }

    pub(crate) fn get_or_insert_default(&mut self, db: Option<Arc<String>>) -> &mut RoutingTable {
        self.tables.entry(db).or_insert_with(RoutingTable::new)
    }

    pub(crate) fn register(&mut self, db: Option<Arc<String>>, table: RoutingTable) {
        self.tables.insert(db, table);
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &RoutingTable> {
        self.tables.values()
    }

    pub(crate) fn deactivate(&mut self, addr: &Address) {
        self.tables.values_mut().for_each(|rt| rt.deactivate(addr));
    }

    pub(crate) fn deactivate_writer(&mut self, addr: &Address) {
        self.tables
            .values_mut()
            .for_each(|rt| rt.deactivate_writer(addr));
    }

    pub(crate) fn remove_expired(&mut self, purge_delay: Duration) {
        let before = self.tables.len();
        self.tables
            .retain(|_, rt| !rt.is_expired_for_purge(purge_delay));
        let removed = before - self.tables.len();
        if removed > 0 {
            debug!("swept {removed} expired routing table(s)");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tables.len()
    }
}

#[derive(Error, Debug)]
#[error("failed to parse routing table: {reason}")]
pub(crate) struct RoutingTableParseError {
    reason: &'static str,
}

enum ServerRole {
    Router,
    Reader,
    Writer,
    Unknown,
}

impl From<&str> for ServerRole {
    fn from(s: &str) -> Self {
        match s {
            "ROUTE" => ServerRole::Router,
            "READ" => ServerRole::Reader,
            "WRITE" => ServerRole::Writer,
            _ => ServerRole::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;
    use crate::value_map;

    fn addr(host: &str) -> Arc<Address> {
        Arc::new(Address::from((host, 7687)))
    }

    fn server_entry(role: &str, addresses: &[&str]) -> Value {
        Value::from(value_map!({
            "role": role,
            "addresses": Value::List(
                addresses.iter().map(|a| Value::from(*a)).collect()
            ),
        }))
    }

    fn route_meta(ttl: i64, db: Option<&str>) -> HashMap<String, Value> {
        let mut rt = value_map!({
            "ttl": ttl,
            "servers": Value::List(vec![
                server_entry("ROUTE", &["r1:7687", "r2:7687"]),
                server_entry("READ", &["rd1:7687", "rd2:7687"]),
                server_entry("WRITE", &["w1:7687"]),
            ]),
        });
        if let Some(db) = db {
            rt.insert("db".into(), Value::from(db));
        }
        value_map!({"rt": rt})
    }

    #[test]
    fn test_try_parse() {
        let table = RoutingTable::try_parse(route_meta(300, Some("movies")))
            .expect("meta is well-formed");
        assert_eq!(table.routers, vec![addr("r1"), addr("r2")]);
        assert_eq!(table.readers, vec![addr("rd1"), addr("rd2")]);
        assert_eq!(table.writers, vec![addr("w1")]);
        assert_eq!(table.database.as_deref().map(String::as_str), Some("movies"));
        assert!(!table.initialized_without_writers);
        assert!(table.is_fresh(RoutingControl::Read));
        assert!(table.is_fresh(RoutingControl::Write));
    }

    #[test]
    fn test_try_parse_ignores_unknown_roles() {
        let meta = value_map!({
            "rt": value_map!({
                "ttl": 300,
                "servers": Value::List(vec![
                    server_entry("ROUTE", &["r1:7687"]),
                    server_entry("READ", &["rd1:7687"]),
                    server_entry("WRITE", &["w1:7687"]),
                    server_entry("ARBITER", &["x1:7687"]),
                ]),
            }),
        });
        let table = RoutingTable::try_parse(meta).expect("unknown roles are skipped");
        assert_eq!(table.routers, vec![addr("r1")]);
    }

    #[rstest]
    #[case(value_map!({}))]
    #[case(value_map!({"rt": 1}))]
    #[case(value_map!({"rt": value_map!({"servers": Value::List(vec![])})}))]
    #[case(value_map!({"rt": value_map!({"ttl": -1, "servers": Value::List(vec![])})}))]
    #[case(value_map!({"rt": value_map!({"ttl": "300", "servers": Value::List(vec![])})}))]
    #[case(value_map!({"rt": value_map!({"ttl": 300})}))]
    #[case(value_map!({"rt": value_map!({"ttl": 300, "db": 1, "servers": Value::List(vec![])})}))]
    #[case(value_map!({"rt": value_map!({"ttl": 300, "servers": Value::List(vec![Value::from(1)])})}))]
    fn test_try_parse_rejects(#[case] meta: HashMap<String, Value>) {
        assert!(RoutingTable::try_parse(meta).is_err());
    }

    #[test]
    fn test_placeholder_is_stale() {
        let table = RoutingTable::new();
        assert!(!table.is_fresh(RoutingControl::Read));
        assert!(!table.is_fresh(RoutingControl::Write));
    }

    #[test]
    fn test_expired_table_is_stale() {
        let table = RoutingTable::with_servers(
            vec![addr("r1")],
            vec![addr("rd1")],
            vec![addr("w1")],
            Duration::ZERO,
        );
        assert!(!table.is_fresh(RoutingControl::Read));
    }

    #[test]
    fn test_no_writers_is_stale_for_write_only() {
        let table = RoutingTable::with_servers(
            vec![addr("r1")],
            vec![addr("rd1")],
            vec![],
            Duration::from_secs(300),
        );
        assert!(table.is_fresh(RoutingControl::Read));
        assert!(!table.is_fresh(RoutingControl::Write));
        assert!(table.initialized_without_writers);
    }

    #[test]
    fn test_deactivate() {
        let mut table = RoutingTable::try_parse(route_meta(300, None)).expect("well-formed");
        table.deactivate(&addr("r1"));
        table.deactivate(&addr("rd2"));
        table.deactivate(&addr("w1"));
        assert_eq!(table.routers, vec![addr("r2")]);
        assert_eq!(table.readers, vec![addr("rd1")]);
        assert!(table.writers.is_empty());
    }

    #[test]
    fn test_deactivate_writer_only_touches_writers() {
        let mut table = RoutingTable::try_parse(route_meta(300, None)).expect("well-formed");
        // w1 also serving reads, as during a leader switch
        table.readers.push(addr("w1"));
        table.deactivate_writer(&addr("w1"));
        assert!(table.writers.is_empty());
        assert!(table.readers.contains(&addr("w1")));
        assert_eq!(table.routers.len(), 2);
    }

    #[test]
    fn test_registry_round_trip() {
        let mut tables = RoutingTables::default();
        let db = Some(Arc::new(String::from("movies")));
        let table = RoutingTable::try_parse(route_meta(300, Some("movies"))).expect("well-formed");
        tables.register(db.clone(), table);
        let found = tables.get(&db).expect("table was registered");
        assert_eq!(found.readers, vec![addr("rd1"), addr("rd2")]);
        assert!(tables.get(&None).is_none());
    }

    #[test]
    fn test_registry_default_bucket_is_distinct() {
        let mut tables = RoutingTables::default();
        tables.register(None, RoutingTable::new());
        assert!(tables.get(&None).is_some());
        assert!(tables.get(&Some(Arc::new(String::from("")))).is_none());
    }

    #[test]
    fn test_remove_expired() {
        let mut tables = RoutingTables::default();
        tables.register(
            Some(Arc::new(String::from("old"))),
            RoutingTable::with_servers(vec![addr("r1")], vec![addr("rd1")], vec![], Duration::ZERO),
        );
        tables.register(
            Some(Arc::new(String::from("new"))),
            RoutingTable::with_servers(
                vec![addr("r1")],
                vec![addr("rd1")],
                vec![],
                Duration::from_secs(300),
            ),
        );
        tables.remove_expired(Duration::ZERO);
        assert_eq!(tables.len(), 1);
        assert!(tables.get(&Some(Arc::new(String::from("new")))).is_some());
    }

    #[test]
    fn test_remove_expired_honors_purge_delay() {
        let mut tables = RoutingTables::default();
        tables.register(
            None,
            RoutingTable::with_servers(vec![addr("r1")], vec![addr("rd1")], vec![], Duration::ZERO),
        );
        // expired, but within the purge delay
        tables.remove_expired(Duration::from_secs(300));
        assert_eq!(tables.len(), 1);
    }
}
