//! End-to-end coverage of the translate-and-install pipeline, driven through
//! the public [`Daemon`]/[`normalize_rule`] surface against fake
//! collaborators rather than real kernel tools.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sloggers::terminal::TerminalLoggerBuilder;
use sloggers::Build;

use qubes_firewall::backend::fake::RecordingBackend;
use qubes_firewall::config::fake::FakeConfigStore;
use qubes_firewall::daemon::Daemon;
use qubes_firewall::resolver::fake::FakeResolver;
use qubes_firewall::rule::{Action, Family, PortRange, Rule};
use qubes_firewall::translate::{normalize_rule, DstSelector};

fn test_logger() -> slog::Logger {
    TerminalLoggerBuilder::new().build().unwrap()
}

fn no_resolv_conf() -> PathBuf {
    PathBuf::from("/nonexistent/resolv.conf")
}

// Scenario 1: tcp/443 accept in front of a drop policy.
#[test]
fn scenario_tcp_port_accept_then_drop_policy() {
    let mut rule = Rule::unconditional(Action::Accept);
    rule.proto = Some("tcp".to_owned());
    rule.dstports = Some(PortRange::single(443));

    let resolver = FakeResolver::new();
    let normalized = normalize_rule(&rule, Family::V4, &resolver, &no_resolv_conf())
        .unwrap()
        .unwrap();

    assert_eq!(normalized.protos, Some(vec!["tcp".to_owned()]));
    assert_eq!(normalized.dstports, Some(PortRange::single(443)));
    assert_eq!(normalized.action, Action::Accept);
}

// Scenario 2: specialtarget=dns expands into a sorted proto x nameserver
// cartesian set, each pinned to port 53.
#[test]
fn scenario_specialtarget_dns_expands_to_sorted_cartesian_set() {
    let mut rule = Rule::unconditional(Action::Accept);
    rule.specialtarget = Some("dns".to_owned());

    let resolver = FakeResolver::new();
    let resolv = {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "nameserver 1.1.1.1").unwrap();
        writeln!(f, "nameserver 8.8.8.8").unwrap();
        f
    };

    let normalized = normalize_rule(&rule, Family::V4, &resolver, resolv.path())
        .unwrap()
        .unwrap();

    assert_eq!(normalized.protos, Some(vec!["tcp".to_owned(), "udp".to_owned()]));
    assert_eq!(normalized.dstports, Some(PortRange::single(53)));
    match normalized.dst {
        Some(DstSelector::Set(hosts)) => {
            assert_eq!(hosts, vec!["1.1.1.1/32".to_owned(), "8.8.8.8/32".to_owned()])
        }
        other => panic!("unexpected dst: {:?}", other),
    }
}

// Scenario 3: icmp on an IPv6 source address becomes icmpv6.
#[test]
fn scenario_icmp_becomes_icmpv6_for_v6_source() {
    let mut rule = Rule::unconditional(Action::Accept);
    rule.proto = Some("icmp".to_owned());
    rule.icmptype = Some("128".to_owned());

    let resolver = FakeResolver::new();
    let normalized = normalize_rule(&rule, Family::V6, &resolver, &no_resolv_conf())
        .unwrap()
        .unwrap();

    assert_eq!(normalized.protos, Some(vec!["icmpv6".to_owned()]));
    assert_eq!(normalized.icmptype, Some("128".to_owned()));
}

// Scenario 4: a dst4 CIDR literal is carried through unchanged.
#[test]
fn scenario_dst4_cidr_literal_is_preserved() {
    let mut rule = Rule::unconditional(Action::Accept);
    rule.dst4 = Some("192.0.2.0/24".to_owned());

    let resolver = FakeResolver::new();
    let normalized = normalize_rule(&rule, Family::V4, &resolver, &no_resolv_conf())
        .unwrap()
        .unwrap();

    match normalized.dst {
        Some(DstSelector::Literal(d)) => assert_eq!(d, "192.0.2.0/24"),
        other => panic!("unexpected dst: {:?}", other),
    }
}

// Scenario 5: a malformed rule number is a parse error, and handle_addr
// falls back to installing an unconditional drop.
#[test]
fn scenario_malformed_rule_number_falls_back_to_drop() {
    let store = FakeConfigStore::new();
    store.set("/qubes-firewall/10.137.0.5/policy", "accept");
    store.set("/qubes-firewall/10.137.0.5/abcd", "action=accept");

    let backend = RecordingBackend::new();
    let daemon = Daemon::new(
        store,
        backend.clone(),
        FakeResolver::new(),
        no_resolv_conf(),
        test_logger(),
        Arc::new(AtomicBool::new(false)),
    );

    daemon.handle_addr("10.137.0.5");

    let (addr, family, rules) = backend.last().expect("fallback should have been applied");
    assert_eq!(addr, "10.137.0.5");
    assert_eq!(family, Family::V4);
    assert_eq!(rules.rules().len(), 1);
    assert_eq!(rules.rules()[0].action, Action::Drop);
}

// Scenario 6: a port range that collapses to a single nft port, with proto
// absent, is modeled by the normalized rule carrying no explicit proto
// (each backend's own renderer is responsible for the tcp/udp split; the
// shared normalization step itself is exercised here).
#[test]
fn scenario_port_range_collapses_for_modern_dialect() {
    let pr = PortRange::parse("8000-8000").unwrap();
    assert_eq!(pr.to_nft(), "8000");
    assert_eq!(pr.to_legacy(), "8000:8000");

    let mut rule = Rule::unconditional(Action::Accept);
    rule.dstports = Some(pr);
    let resolver = FakeResolver::new();
    let normalized = normalize_rule(&rule, Family::V4, &resolver, &no_resolv_conf())
        .unwrap()
        .unwrap();
    assert_eq!(normalized.protos, None);
    assert_eq!(normalized.dstports, Some(pr));
}

// Scenario 7: a watch event re-triggers handle_addr for the same SA after
// its policy changed; the backend's most recent recorded application
// reflects only the new rule set, with no trace of the rules that preceded
// it (each `apply_rules` call replaces the chain wholesale, never merges).
#[test]
fn scenario_watch_event_reapplies_with_no_residue() {
    let backend = RecordingBackend::new();

    let accept_store = FakeConfigStore::new();
    accept_store.set("/qubes-firewall/10.137.0.5/policy", "accept");
    let daemon = Daemon::new(
        accept_store,
        backend.clone(),
        FakeResolver::new(),
        no_resolv_conf(),
        test_logger(),
        Arc::new(AtomicBool::new(false)),
    );
    daemon.handle_addr("10.137.0.5");
    let first = backend.last().unwrap();
    assert_eq!(first.2.rules()[0].action, Action::Accept);

    // The administrator tightens the policy; a commit-barrier watch event
    // for the same SA arrives and the daemon re-reads and reapplies.
    assert_eq!(
        qubes_firewall::daemon::commit_addr("/qubes-firewall/10.137.0.5"),
        Some("10.137.0.5")
    );

    let drop_store = FakeConfigStore::new();
    drop_store.set("/qubes-firewall/10.137.0.5/policy", "drop");
    let daemon = Daemon::new(
        drop_store,
        backend.clone(),
        FakeResolver::new(),
        no_resolv_conf(),
        test_logger(),
        Arc::new(AtomicBool::new(false)),
    );
    daemon.handle_addr("10.137.0.5");

    let second = backend.last().unwrap();
    assert_eq!(second.2.rules().len(), 1);
    assert_eq!(second.2.rules()[0].action, Action::Drop);
}
