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

use std::error::Error as StdError;
use std::fmt::Debug;
use std::io::Result as IoResult;
use std::net::ToSocketAddrs;
use std::result::Result as StdResult;
use std::sync::Arc;

use log::debug;

use super::Address;
use crate::error_::{Error, Result, UserCallbackError};

type BoxError = Box<dyn StdError + Send + Sync>;
/// See [`AddressResolver::resolve()`].
pub type AddressResolverReturn = StdResult<Vec<Address>, BoxError>;

/// A trait for custom address resolution.
///
/// The resolver is called for every address coming into the driver, both the
/// configured seed address and every address found in a routing table, before
/// DNS resolution takes place.
pub trait AddressResolver: Debug + Send + Sync {
    /// must not return an empty vector
    fn resolve(&self, address: &Address) -> AddressResolverReturn;
}

#[derive(Debug)]
pub(crate) enum CustomResolution {
    NoResolver(Option<Arc<Address>>),
    Resolver(Vec<Arc<Address>>),
}

impl CustomResolution {
    pub(super) fn new(
        address: Arc<Address>,
        resolver: Option<&dyn AddressResolver>,
    ) -> Result<Self> {
        match resolver {
            None => Ok(Self::NoResolver(Some(address))),
            Some(_) if address.is_custom_resolved => Ok(Self::NoResolver(Some(address))),
            Some(resolver) => {
                debug!("custom resolver in: {address}");
                let res = resolver.resolve(&address);
                match res {
                    Ok(mut addrs) => {
                        addrs.iter_mut().for_each(|a| a.is_custom_resolved = true);
                        let addrs = addrs.into_iter().rev().map(Arc::new).collect::<Vec<_>>();
                        debug!(
                            "custom resolver out: {:?}",
                            addrs.iter().map(|a| format!("{a}")).collect::<Vec<_>>()
                        );
                        if addrs.is_empty() {
                            return Err(Error::InvalidConfig {
                                message: String::from("address resolver returned no addresses"),
                            });
                        }
                        Ok(Self::Resolver(addrs))
                    }
                    Err(err) => {
                        debug!("custom resolver failed: {err:?}");
                        Err(Error::UserCallback {
                            error: UserCallbackError::Resolver(err),
                        })
                    }
                }
            }
        }
    }
}

impl Iterator for CustomResolution {
    type Item = Arc<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            CustomResolution::NoResolver(address) => address.take(),
            CustomResolution::Resolver(addresses) => addresses.pop(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum DnsResolution {
    AlreadyResolved(Option<Arc<Address>>),
    RealResolution(Option<IoResult<Vec<Arc<Address>>>>),
}

impl DnsResolution {
    pub(super) fn new(address: Arc<Address>) -> Self {
        if address.is_dns_resolved {
            Self::AlreadyResolved(Some(address))
        } else {
            debug!("dns resolver in: {address}");
            let res = address.to_socket_addrs().map(|resolved| {
                resolved
                    .map(|resolved| Address {
                        host: resolved.ip().to_string(),
                        port: resolved.port(),
                        key: address.host.clone(),
                        is_custom_resolved: address.is_custom_resolved,
                        is_dns_resolved: true,
                    })
                    .map(Arc::new)
                    .collect::<Vec<_>>()
            });
            match &res {
                Ok(addrs) => {
                    debug!(
                        "dns resolver out: {:?}",
                        addrs.iter().map(|a| format!("{a}")).collect::<Vec<_>>()
                    );
                }
                Err(err) => {
                    debug!("dns resolver out: {err:?}");
                }
            }
            Self::RealResolution(Some(res))
        }
    }
}

impl Iterator for DnsResolution {
    type Item = IoResult<Arc<Address>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            DnsResolution::AlreadyResolved(address) => address.take().map(Ok),
            DnsResolution::RealResolution(res) => match res {
                None => None,
                Some(Err(_)) => Some(Err(res
                    .take()
                    .expect("checked above to be Some")
                    .expect_err("checked above to be Err"))),
                Some(Ok(resolved)) => resolved.pop().map(Ok),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StaticResolver(Vec<Address>);

    impl AddressResolver for StaticResolver {
        fn resolve(&self, _address: &Address) -> AddressResolverReturn {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct EmptyResolver;

    impl AddressResolver for EmptyResolver {
        fn resolve(&self, _address: &Address) -> AddressResolverReturn {
            Ok(vec![])
        }
    }

    #[test]
    fn test_custom_resolution_preserves_order() {
        let resolver = StaticResolver(vec![
            Address::from(("host1", 1)),
            Address::from(("host2", 2)),
        ]);
        let address = Arc::new(Address::from(("seed", 7687)));
        let resolved = address
            .custom_resolve(Some(&resolver))
            .expect("resolver returns addresses")
            .collect::<Vec<_>>();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].host(), "host1");
        assert_eq!(resolved[1].host(), "host2");
        assert!(resolved.iter().all(|a| a.is_custom_resolved));
    }

    #[test]
    fn test_custom_resolution_skips_resolved_addresses() {
        let resolver = StaticResolver(vec![Address::from(("host1", 1))]);
        let mut address = Address::from(("already", 7687));
        address.is_custom_resolved = true;
        let address = Arc::new(address);
        let resolved = Arc::clone(&address)
            .custom_resolve(Some(&resolver))
            .expect("pass-through cannot fail")
            .collect::<Vec<_>>();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].host(), "already");
    }

    #[test]
    fn test_empty_custom_resolution_is_rejected() {
        let address = Arc::new(Address::from(("seed", 7687)));
        let res = address.custom_resolve(Some(&EmptyResolver));
        assert!(matches!(res, Err(Error::InvalidConfig { .. })));
    }
}
