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
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::debug;
use parking_lot::Mutex;

use crate::auth::AuthToken;
use crate::value::Value;

/// Maps principals to the home database the cluster last resolved for them.
///
/// Entries expire after a short delay (`max_home_database_delay`) so that a
/// changed home database propagates; until then, acquisitions without an
/// explicit database can target the right routing table immediately.
#[derive(Debug)]
pub(crate) struct HomeDbCache {
    cache: Mutex<HashMap<HomeDbCacheKey, HomeDbCacheEntry>>,
    config: HomeDbCacheConfig,
}

#[derive(Debug, Copy, Clone)]
struct HomeDbCacheConfig {
    max_size: usize,
    prune_size: usize,
    ttl: Duration,
}

impl HomeDbCache {
    pub(crate) fn new(max_size: usize, ttl: Duration) -> Self {
        let max_size_f64 = max_size as f64;
        let mut prune_size = (0.01 * max_size_f64 * max_size_f64.ln()) as usize;
        prune_size = usize::min(prune_size, max_size);
        if prune_size == 0 && max_size > 0 {
            prune_size = 1; // ensure at least one entry is pruned
        }
        HomeDbCache {
            cache: Mutex::new(HashMap::with_capacity(max_size)),
            config: HomeDbCacheConfig {
                max_size,
                prune_size,
                ttl,
            },
        }
    }

    pub(crate) fn get(&self, key: &HomeDbCacheKey) -> Option<Arc<String>> {
        let mut lock = self.cache.lock();
        let cache: &mut HashMap<HomeDbCacheKey, HomeDbCacheEntry> = &mut lock;
        let fresh = match cache.get(key) {
            None => return None,
            Some(entry) => entry.updated_at.elapsed() < self.config.ttl,
        };
        let res = if fresh {
            cache.get_mut(key).map(|entry| {
                entry.last_used = Instant::now();
                Arc::clone(&entry.database)
            })
        } else {
            cache.remove(key);
            None
        };
        debug!(
            "getting home database cache for key: {} -> {:?}",
            key.log_str(),
            res.as_deref(),
        );
        res
    }

    pub(crate) fn update(&self, key: HomeDbCacheKey, database: Arc<String>) {
        let mut lock = self.cache.lock();
        debug!(
            "updating home database cache for key: {} -> {:?}",
            key.log_str(),
            database.as_str(),
        );
        let cache: &mut HashMap<HomeDbCacheKey, HomeDbCacheEntry> = &mut lock;
        let now = Instant::now();
        let previous_val = cache.insert(
            key,
            HomeDbCacheEntry {
                database,
                last_used: now,
                updated_at: now,
            },
        );
        if previous_val.is_none() {
            // cache grew, prune if necessary
            Self::prune(cache, self.config);
        }
    }

    fn prune(cache: &mut HashMap<HomeDbCacheKey, HomeDbCacheEntry>, config: HomeDbCacheConfig) {
        if cache.len() <= config.max_size {
            return;
        }
        debug!(
            "pruning home database cache to size: {}",
            config.max_size - config.prune_size
        );
        let new_cache = mem::take(cache);
        *cache = new_cache
            .into_iter()
            .sorted_by(|(_, v1), (_, v2)| v2.last_used.cmp(&v1.last_used))
            .take(config.max_size - config.prune_size)
            .collect();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum HomeDbCacheKey {
    DriverUser,
    FixedUser(Arc<String>),
    SessionAuth(SessionAuthKey),
}

impl HomeDbCacheKey {
    fn log_str(&self) -> String {
        match self {
            HomeDbCacheKey::DriverUser | HomeDbCacheKey::FixedUser(_) => format!("{self:?}"),
            HomeDbCacheKey::SessionAuth(SessionAuthKey(auth)) => {
                let mut auth: AuthToken = (**auth).clone();
                auth.data
                    .get_mut("credentials")
                    .map(|c| *c = Value::from("**********"));
                format!("SessionAuth({:?})", auth.data)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SessionAuthKey(Arc<AuthToken>);

impl PartialEq for SessionAuthKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || self.0.data.len() == other.0.data.len()
                && self
                    .0
                    .data
                    .iter()
                    .sorted_by(|(k1, _), (k2, _)| k1.cmp(k2))
                    .zip(other.0.data.iter().sorted_by(|(k1, _), (k2, _)| k1.cmp(k2)))
                    .all(|((k1, v1), (k2, v2))| k1 == k2 && v1.eq_data(v2))
    }
}

impl Eq for SessionAuthKey {}

impl Hash for SessionAuthKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0
            .data
            .iter()
            .sorted_by(|(k1, _), (k2, _)| k1.cmp(k2))
            .for_each(|(k, v)| {
                k.hash(state);
                Self::hash(v, state);
            });
    }
}

impl SessionAuthKey {
    fn hash(v: &Value, state: &mut impl Hasher) {
        match v {
            Value::Null => state.write_usize(0),
            Value::Boolean(v) => v.hash(state),
            Value::Integer(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::String(v) => v.hash(state),
            Value::List(v) => v.iter().for_each(|v| Self::hash(v, state)),
            Value::Map(v) => {
                v.iter()
                    .sorted_by(|(k1, _), (k2, _)| k1.cmp(k2))
                    .for_each(|(k, v)| {
                        k.hash(state);
                        Self::hash(v, state);
                    });
            }
        }
    }
}

impl HomeDbCacheKey {
    pub(crate) fn new(user: Option<&Arc<String>>, session_auth: Option<&Arc<AuthToken>>) -> Self {
        fn get_basic_auth_principal(auth: &AuthToken) -> Option<&str> {
            let scheme = auth.data.get("scheme")?.as_string()?.as_str();
            if scheme != "basic" {
                return None;
            }
            Some(auth.data.get("principal")?.as_string()?.as_str())
        }

        match (user, session_auth) {
            (Some(user), _) => HomeDbCacheKey::FixedUser(Arc::clone(user)),
            (None, Some(auth)) => match get_basic_auth_principal(auth) {
                Some(user) => HomeDbCacheKey::FixedUser(Arc::new(user.to_string())),
                None => HomeDbCacheKey::SessionAuth(SessionAuthKey(Arc::clone(auth))),
            },
            (None, None) => HomeDbCacheKey::DriverUser,
        }
    }
}

#[derive(Debug, Clone)]
struct HomeDbCacheEntry {
    database: Arc<String>,
    last_used: Instant,
    updated_at: Instant,
}
