//! DNS resolution collaborators: nameserver discovery (from
//! `/etc/resolv.conf`) and `dsthost` name resolution.
//!
//! Both are modeled as narrow traits/functions so tests can substitute
//! fixtures instead of touching the real resolver or filesystem, mirroring
//! the way the backend modules inject a `RuleSubmitter` rather than calling
//! `Command` directly.

use std::fs;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

use crate::errors::*;
use crate::rule::Family;

/// Default location of the system resolver configuration.
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Extract the nameserver addresses of the given family from a
/// `resolv.conf`-formatted file.
///
/// A `nameserver` literal is classified IPv4 if it contains exactly three
/// dots, IPv6 if it contains any colon. Malformed or unreadable files yield
/// an empty list rather than an error -- nameserver discovery is
/// best-effort.
pub fn dns_addresses(path: &Path, family: Family) -> Vec<String> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    contents
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter(|addr| match family {
            Family::V4 => addr.matches('.').count() == 3,
            Family::V6 => addr.contains(':'),
        })
        .map(str::to_owned)
        .collect()
}

/// Resolves a `dsthost` name (or literal) to the set of addresses of a
/// given family. Implemented behind a trait so tests can inject a fixed
/// answer set instead of performing real DNS lookups.
pub trait HostResolver {
    fn resolve(&self, host: &str, family: Family) -> Result<Vec<IpAddr>>;
}

impl HostResolver for Box<dyn HostResolver> {
    fn resolve(&self, host: &str, family: Family) -> Result<Vec<IpAddr>> {
        (**self).resolve(host, family)
    }
}

/// Resolves names using the system resolver via `getaddrinfo` (through
/// `std::net::ToSocketAddrs`).
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, family: Family) -> Result<Vec<IpAddr>> {
        let addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|e| ErrorKind::RuleParse(format!("failed to resolve {}: {}", host, e)))?;

        let matching: Vec<IpAddr> = addrs
            .map(|sa| sa.ip())
            .filter(|ip| match family {
                Family::V4 => ip.is_ipv4(),
                Family::V6 => ip.is_ipv6(),
            })
            .collect();

        if matching.is_empty() {
            return Err(ErrorKind::RuleParse(format!(
                "failed to resolve {}: no {} address found",
                host,
                match family {
                    Family::V4 => "IPv4",
                    Family::V6 => "IPv6",
                }
            ))
            .into());
        }

        Ok(matching)
    }
}

/// Fixed-answer [`HostResolver`] test double, also used by the integration
/// suite under `tests/` -- kept outside `#[cfg(test)]` so it links into
/// that separate test binary too.
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;

    /// Fixed-answer resolver double for tests.
    #[derive(Default)]
    pub struct FakeResolver {
        pub answers: BTreeMap<(String, u8), Vec<IpAddr>>,
    }

    impl FakeResolver {
        pub fn new() -> FakeResolver {
            FakeResolver::default()
        }

        pub fn with(mut self, host: &str, family: Family, addrs: Vec<IpAddr>) -> Self {
            self.answers
                .insert((host.to_owned(), family.as_numeral()), addrs);
            self
        }
    }

    impl HostResolver for FakeResolver {
        fn resolve(&self, host: &str, family: Family) -> Result<Vec<IpAddr>> {
            self.answers
                .get(&(host.to_owned(), family.as_numeral()))
                .cloned()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ErrorKind::RuleParse(format!("failed to resolve {}: NXDOMAIN", host)).into()
                })
        }
    }
}
