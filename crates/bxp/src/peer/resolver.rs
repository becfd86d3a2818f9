//! Cached host name resolution.
//!
//! Connect operations resolve `host:port` through a context-wide cache so
//! repeated sessions toward the same peer skip the resolver round trip.
//! Entries live until the context is dropped or the cache is explicitly
//! cleared.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use super::error::{Error, Result};
use super::socket::Transport;

#[derive(Debug, Default)]
pub(crate) struct Resolver {
    cache: Mutex<HashMap<String, Arc<Vec<SocketAddr>>>>,
}

impl Resolver {
    /// Resolve `host:port` for the given transport, consulting the cache
    /// first. The returned list only carries addresses of the requested
    /// family.
    pub fn resolve(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Arc<Vec<SocketAddr>>> {
        let key = format!("{host}:{port}:{}", family_tag(transport));

        if let Some(found) = self.cache.lock().unwrap().get(&key) {
            return Ok(Arc::clone(found));
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::NameResolution(format!("unable to resolve host {host}: {e}"))
            })?
            .filter(|addr| match transport {
                Transport::Ipv4 => addr.is_ipv4(),
                Transport::Ipv6 => addr.is_ipv6(),
            })
            .collect();
        if addrs.is_empty() {
            return Err(Error::NameResolution(format!(
                "host {host} has no {} address",
                family_tag(transport)
            )));
        }

        let addrs = Arc::new(addrs);
        self.cache
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&addrs));
        Ok(addrs)
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Number of cached entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

fn family_tag(transport: Transport) -> &'static str {
    match transport {
        Transport::Ipv4 => "ipv4",
        Transport::Ipv6 => "ipv6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_caches_results() {
        let resolver = Resolver::default();
        let first = resolver.resolve("127.0.0.1", 44000, Transport::Ipv4).unwrap();
        let second = resolver.resolve("127.0.0.1", 44000, Transport::Ipv4).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.len(), 1);
        assert!(first.iter().all(|a| a.is_ipv4()));

        resolver.clear();
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn test_transport_filter() {
        let resolver = Resolver::default();
        let v6 = resolver.resolve("::1", 44000, Transport::Ipv6).unwrap();
        assert!(v6.iter().all(|a| a.is_ipv6()));

        // The IPv4 loopback literal has no IPv6 address.
        assert!(resolver.resolve("127.0.0.1", 44000, Transport::Ipv6).is_err());
    }

    #[test]
    fn test_unresolvable_host() {
        let resolver = Resolver::default();
        let err = resolver
            .resolve("no-such-host.invalid.", 44000, Transport::Ipv4)
            .unwrap_err();
        assert_eq!(err.status(), crate::peer::Status::NameResolvFailure);
    }
}
