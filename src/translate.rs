//! The shared parse-and-translate skeleton both backends build on: turning a
//! single [`Rule`] plus an address family into a [`NormalizedRule`] that
//! already has DNS resolution, `specialtarget=dns` intersection, and
//! family/destination validation applied. The two backends differ only in
//! how they stringify a `NormalizedRule` into their own dialect (see
//! `backend::legacy` and `backend::nft`).

use std::net::IpAddr;

use crate::errors::*;
use crate::resolver::{dns_addresses, HostResolver};
use crate::rule::{Family, PortRange, Rule};
use std::path::Path;

/// How a rule selects its destination, once resolved. `Literal` is a single
/// CIDR/address given directly by `dst4`/`dst6`; `Set` is a (possibly
/// multi-element) set of addresses produced by resolving `dsthost` or
/// `specialtarget=dns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DstSelector {
    Literal(String),
    Set(Vec<String>),
}

/// A [`Rule`], stripped of config-store syntax and resolved against a
/// concrete address family: every destination is a literal address/CIDR,
/// every protocol name is the one the current family actually uses (`icmp`
/// becomes `icmpv6` under IPv6), and `specialtarget=dns` has already been
/// expanded and intersected with any `dsthost` that was also present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRule {
    pub protos: Option<Vec<String>>,
    pub dst: Option<DstSelector>,
    pub dstports: Option<PortRange>,
    pub icmptype: Option<String>,
    pub action: crate::rule::Action,
}

/// Normalize `rule` for `family`, resolving `dsthost` via `resolver` and
/// nameservers via `resolv_conf`.
///
/// Returns `Ok(None)` when the rule is silently dropped (an unsatisfiable
/// `specialtarget=dns` rule), `Ok(Some(..))` otherwise, and `Err` with
/// [`ErrorKind::RuleParse`] on any validation failure (family/destination
/// mismatch, DNS lookup failure).
pub fn normalize_rule(
    rule: &Rule,
    family: Family,
    resolver: &dyn HostResolver,
    resolv_conf: &Path,
) -> Result<Option<NormalizedRule>> {
    if rule.dst4.is_some() && family == Family::V6 {
        return Err(ErrorKind::RuleParse("IPv4 rule found for IPv6 address".to_owned()).into());
    }
    if rule.dst6.is_some() && family == Family::V4 {
        return Err(ErrorKind::RuleParse("dst6 rule found for IPv4 address".to_owned()).into());
    }

    let mut protos: Option<Vec<String>> = rule.proto.as_ref().map(|p| {
        if p == "icmp" && family == Family::V6 {
            vec!["icmpv6".to_owned()]
        } else {
            vec![p.clone()]
        }
    });

    // The resolved `dsthost` set, if any. Resolved addresses are pinned
    // down with the family's full-host mask, same as the nameserver list
    // built below -- `dst4`/`dst6` literals are taken exactly as written
    // and are not masked here.
    let dsthost_resolved: Option<Vec<String>> = match &rule.dsthost {
        Some(host) => Some(mask_all(
            sorted_dedup(
                resolver
                    .resolve(host, family)?
                    .into_iter()
                    .map(|a| a.to_string())
                    .collect(),
            ),
            family,
        )),
        None => None,
    };

    // Whatever destination this rule named, kept around so
    // `specialtarget=dns` can intersect against it regardless of which
    // option produced it.
    let dst_candidates: Option<Vec<String>> = dsthost_resolved
        .clone()
        .or_else(|| rule.dst4.clone().map(|v| vec![v]))
        .or_else(|| rule.dst6.clone().map(|v| vec![v]));

    let mut dst: Option<DstSelector> = if let Some(dst4) = &rule.dst4 {
        Some(DstSelector::Literal(dst4.clone()))
    } else if let Some(dst6) = &rule.dst6 {
        Some(DstSelector::Literal(dst6.clone()))
    } else {
        dsthost_resolved.clone().map(DstSelector::Set)
    };

    let mut dstports = rule.dstports;

    if rule.specialtarget.as_deref() == Some("dns") {
        match dstports {
            Some(pr) if !pr.is_dns() => return Ok(None),
            _ => dstports = Some(PortRange::single(53)),
        }

        let dns_masked = mask_all(sorted_dedup(dns_addresses(resolv_conf, family)), family);
        if dns_masked.is_empty() {
            return Ok(None);
        }

        protos = Some(match protos {
            Some(ps) => intersect_sorted(&["tcp", "udp"], &ps),
            None => vec!["tcp".to_owned(), "udp".to_owned()],
        });

        // `specialtarget=dns` is authoritative over any prior `dsthost`,
        // `dst4`, or `dst6` on this rule: intersect with whatever
        // candidate destination the rule already had, or take the full
        // nameserver set if it had none.
        dst = Some(match &dst_candidates {
            Some(candidates) => DstSelector::Set(intersect_sorted(&dns_masked, candidates)),
            None => DstSelector::Set(dns_masked),
        });
    }

    Ok(Some(NormalizedRule {
        protos,
        dst,
        dstports,
        icmptype: rule.icmptype.clone(),
        action: rule.action,
    }))
}

fn sorted_dedup(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v.dedup();
    v
}

fn mask_all(addrs: Vec<String>, family: Family) -> Vec<String> {
    addrs
        .into_iter()
        .map(|a| format!("{}{}", a, family.fullmask()))
        .collect()
}

/// Intersection of two string collections, returned sorted and deduplicated.
fn intersect_sorted<A: AsRef<str>, B: AsRef<str>>(a: &[A], b: &[B]) -> Vec<String> {
    let a_set: std::collections::BTreeSet<&str> = a.iter().map(AsRef::as_ref).collect();
    let mut out: Vec<String> = b
        .iter()
        .map(AsRef::as_ref)
        .filter(|v| a_set.contains(v))
        .map(str::to_owned)
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::fake::FakeResolver;
    use crate::rule::Action;
    use std::net::Ipv4Addr;

    fn resolv_conf_with(nameservers: &[&str]) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for ns in nameservers {
            writeln!(f, "nameserver {}", ns).unwrap();
        }
        f
    }

    #[test]
    fn dst4_on_v6_is_parse_error() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.dst4 = Some("192.0.2.0/24".to_owned());
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&[]);
        let err = normalize_rule(&rule, Family::V6, &resolver, resolv.path()).unwrap_err();
        assert!(err.is_rule_parse());
    }

    #[test]
    fn dns_specialtarget_expands_nameservers() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.specialtarget = Some("dns".to_owned());
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&["1.1.1.1", "8.8.8.8"]);

        let normalized = normalize_rule(&rule, Family::V4, &resolver, resolv.path())
            .unwrap()
            .unwrap();
        assert_eq!(
            normalized.protos,
            Some(vec!["tcp".to_owned(), "udp".to_owned()])
        );
        assert_eq!(normalized.dstports, Some(PortRange::single(53)));
        match normalized.dst {
            Some(DstSelector::Set(hosts)) => {
                assert_eq!(hosts, vec!["1.1.1.1/32".to_owned(), "8.8.8.8/32".to_owned()])
            }
            other => panic!("unexpected dst: {:?}", other),
        }
    }

    #[test]
    fn dns_specialtarget_with_empty_nameservers_is_skipped() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.specialtarget = Some("dns".to_owned());
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&[]);
        assert!(normalize_rule(&rule, Family::V4, &resolver, resolv.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn dns_specialtarget_with_wrong_port_is_skipped() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.specialtarget = Some("dns".to_owned());
        rule.dstports = Some(PortRange::single(80));
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&["1.1.1.1"]);
        assert!(normalize_rule(&rule, Family::V4, &resolver, resolv.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn dns_specialtarget_intersects_existing_dsthost() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.specialtarget = Some("dns".to_owned());
        rule.dsthost = Some("resolver.example".to_owned());
        let resolver = FakeResolver::new().with(
            "resolver.example",
            Family::V4,
            vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
        );
        let resolv = resolv_conf_with(&["1.1.1.1", "8.8.8.8"]);

        let normalized = normalize_rule(&rule, Family::V4, &resolver, resolv.path())
            .unwrap()
            .unwrap();
        match normalized.dst {
            Some(DstSelector::Set(hosts)) => assert_eq!(hosts, vec!["1.1.1.1/32".to_owned()]),
            other => panic!("unexpected dst: {:?}", other),
        }
    }

    #[test]
    fn dns_specialtarget_intersects_existing_dst4_literal() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.specialtarget = Some("dns".to_owned());
        // `dst4` is compared against the nameserver list exactly as
        // written, with no implicit masking, so it must already carry the
        // full-host mask to survive the intersection.
        rule.dst4 = Some("1.1.1.1/32".to_owned());
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&["1.1.1.1", "8.8.8.8"]);

        let normalized = normalize_rule(&rule, Family::V4, &resolver, resolv.path())
            .unwrap()
            .unwrap();
        match normalized.dst {
            Some(DstSelector::Set(hosts)) => assert_eq!(hosts, vec!["1.1.1.1/32".to_owned()]),
            other => panic!("unexpected dst: {:?}", other),
        }
    }

    #[test]
    fn dns_specialtarget_with_unrelated_dst4_literal_yields_empty_set() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.specialtarget = Some("dns".to_owned());
        rule.dst4 = Some("203.0.113.1/32".to_owned());
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&["1.1.1.1"]);

        let normalized = normalize_rule(&rule, Family::V4, &resolver, resolv.path())
            .unwrap()
            .unwrap();
        match normalized.dst {
            Some(DstSelector::Set(hosts)) => assert!(hosts.is_empty()),
            other => panic!("unexpected dst: {:?}", other),
        }
    }

    #[test]
    fn icmp_becomes_icmpv6_on_v6() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.proto = Some("icmp".to_owned());
        let resolver = FakeResolver::new();
        let resolv = resolv_conf_with(&[]);
        let normalized = normalize_rule(&rule, Family::V6, &resolver, resolv.path())
            .unwrap()
            .unwrap();
        assert_eq!(normalized.protos, Some(vec!["icmpv6".to_owned()]));
    }
}
