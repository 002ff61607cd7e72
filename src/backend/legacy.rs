//! The legacy backend: `iptables`/`ip6tables` plus `iptables-restore`.
//!
//! Chain management (`-N`, `-I`, `-F`, `-X`) goes straight through
//! [`CommandRunner`]; the rule program for a chain is rendered once per
//! [`apply_rules`](LegacyBackend::apply_rules) call and installed
//! atomically through [`RuleSubmitter`], mirroring `IptablesWorker`'s split
//! between `run_ipt` and `run_ipt_restore`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;

use super::{CommandRunner, CommandSubmitter, FirewallBackend, RuleSubmitter, SystemCommandRunner};
use crate::errors::*;
use crate::resolver::HostResolver;
use crate::rule::{Family, RuleList};
use crate::translate::{normalize_rule, DstSelector, NormalizedRule};

/// Chain to which every address family's forwarded traffic is first
/// dispatched; must already exist (created by the init script shipped
/// alongside this daemon) before [`LegacyBackend::init`] runs.
const FORWARD_CHAIN: &str = "QBS-FORWARD";

/// `qbs-` followed by the address with every `.`/`:` replaced by `-`,
/// truncated to the last 20 characters -- `iptables` chain names are capped
/// at 28 bytes, and `qbs-` plus a full IPv6 literal can exceed that.
fn chain_for_addr(addr: &str) -> String {
    let mut name = String::with_capacity(addr.len() + 4);
    name.push_str("qbs-");
    for c in addr.chars() {
        name.push(if c == '.' || c == ':' { '-' } else { c });
    }
    let start = name.len().saturating_sub(20);
    name[start..].to_owned()
}

pub struct LegacyBackend {
    runner4: Box<dyn CommandRunner>,
    runner6: Box<dyn CommandRunner>,
    submitter4: Box<dyn RuleSubmitter>,
    submitter6: Box<dyn RuleSubmitter>,
    chains4: RefCell<BTreeSet<String>>,
    chains6: RefCell<BTreeSet<String>>,
}

impl LegacyBackend {
    pub fn new() -> LegacyBackend {
        LegacyBackend {
            runner4: Box::new(SystemCommandRunner::new("iptables")),
            runner6: Box::new(SystemCommandRunner::new("ip6tables")),
            submitter4: Box::new(CommandSubmitter::new("iptables-restore", &["-n"])),
            submitter6: Box::new(CommandSubmitter::new("ip6tables-restore", &["-n"])),
            chains4: RefCell::new(BTreeSet::new()),
            chains6: RefCell::new(BTreeSet::new()),
        }
    }

    pub(crate) fn with_collaborators(
        runner4: Box<dyn CommandRunner>,
        runner6: Box<dyn CommandRunner>,
        submitter4: Box<dyn RuleSubmitter>,
        submitter6: Box<dyn RuleSubmitter>,
    ) -> LegacyBackend {
        LegacyBackend {
            runner4,
            runner6,
            submitter4,
            submitter6,
            chains4: RefCell::new(BTreeSet::new()),
            chains6: RefCell::new(BTreeSet::new()),
        }
    }

    /// A backend that logs every command and program it would have run
    /// instead of invoking `iptables`/`iptables-restore`, used for
    /// `--dry-run`.
    pub fn dry_run(log: slog::Logger) -> LegacyBackend {
        LegacyBackend::with_collaborators(
            Box::new(super::LoggingRunner::new("iptables", log.clone())),
            Box::new(super::LoggingRunner::new("ip6tables", log.clone())),
            Box::new(super::LoggingSubmitter::new("iptables-restore", log.clone())),
            Box::new(super::LoggingSubmitter::new("ip6tables-restore", log)),
        )
    }

    fn runner(&self, family: Family) -> &dyn CommandRunner {
        match family {
            Family::V4 => self.runner4.as_ref(),
            Family::V6 => self.runner6.as_ref(),
        }
    }

    fn submitter(&self, family: Family) -> &dyn RuleSubmitter {
        match family {
            Family::V4 => self.submitter4.as_ref(),
            Family::V6 => self.submitter6.as_ref(),
        }
    }

    fn chains(&self, family: Family) -> &RefCell<BTreeSet<String>> {
        match family {
            Family::V4 => &self.chains4,
            Family::V6 => &self.chains6,
        }
    }

    fn ensure_chain(&self, addr: &str, chain: &str, family: Family) -> Result<()> {
        if self.chains(family).borrow().contains(chain) {
            return Ok(());
        }
        let runner = self.runner(family);
        runner.run(&["-N", chain])?;
        runner.run(&["-I", FORWARD_CHAIN, "-s", addr, "-j", chain])?;
        self.chains(family).borrow_mut().insert(chain.to_owned());
        Ok(())
    }
}

impl Default for LegacyBackend {
    fn default() -> LegacyBackend {
        LegacyBackend::new()
    }
}

impl FirewallBackend for LegacyBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn init(&self) -> Result<()> {
        for family in [Family::V4, Family::V6].iter().copied() {
            let runner = self.runner(family);
            runner.run(&["-F", FORWARD_CHAIN])?;
            runner.run(&[
                "-A",
                FORWARD_CHAIN,
                "-m",
                "state",
                "--state",
                "ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ])?;
            runner.run(&["-A", FORWARD_CHAIN, "-j", "DROP"])?;
        }
        Ok(())
    }

    fn apply_rules(
        &self,
        addr: &str,
        family: Family,
        rules: &RuleList,
        resolver: &dyn HostResolver,
        resolv_conf: &Path,
    ) -> Result<()> {
        let chain = chain_for_addr(addr);
        self.ensure_chain(addr, &chain, family)?;

        let program = prepare_rules(&chain, rules, family, resolver, resolv_conf)?;

        self.runner(family).run(&["-F", &chain])?;
        self.submitter(family).submit(&program)
    }

    fn cleanup(&self) -> Result<()> {
        for family in [Family::V4, Family::V6].iter().copied() {
            let runner = self.runner(family);
            runner.run(&["-F", FORWARD_CHAIN])?;
            for chain in self.chains(family).borrow().iter() {
                runner.run(&["-F", chain])?;
                runner.run(&["-X", chain])?;
            }
        }
        Ok(())
    }
}

/// Render every rule in `rules` into `iptables-restore` text for `chain`.
fn prepare_rules(
    chain: &str,
    rules: &RuleList,
    family: Family,
    resolver: &dyn HostResolver,
    resolv_conf: &Path,
) -> Result<String> {
    let mut out = String::from("*filter\n");

    for rule in rules.rules() {
        let normalized = match normalize_rule(rule, family, resolver, resolv_conf)? {
            Some(n) => n,
            None => continue,
        };
        render_cartesian(&mut out, chain, &normalized);
    }

    out.push_str("COMMIT\n");
    Ok(out)
}

/// Emit one `-A` line per (proto, dst) pair, sorted for deterministic
/// output, matching the original's "sorting here is only to ease writing
/// tests" cartesian expansion.
fn render_cartesian(out: &mut String, chain: &str, rule: &NormalizedRule) {
    let protos: Vec<Option<&str>> = match &rule.protos {
        Some(ps) => {
            let mut v: Vec<&str> = ps.iter().map(String::as_str).collect();
            v.sort_unstable();
            v.into_iter().map(Some).collect()
        }
        None => vec![None],
    };

    let dsts: Vec<Option<&str>> = match &rule.dst {
        Some(DstSelector::Literal(d)) => vec![Some(d.as_str())],
        Some(DstSelector::Set(ds)) => {
            let mut v: Vec<&str> = ds.iter().map(String::as_str).collect();
            v.sort_unstable();
            v.into_iter().map(Some).collect()
        }
        None => vec![None],
    };

    for proto in &protos {
        for dst in &dsts {
            out.push_str("-A ");
            out.push_str(chain);
            if let Some(d) = dst {
                out.push_str(" -d ");
                out.push_str(d);
            }
            if let Some(p) = proto {
                out.push_str(" -p ");
                out.push_str(p);
            }
            if let Some(pr) = rule.dstports {
                out.push_str(" --dport ");
                out.push_str(&pr.to_legacy());
            }
            if let Some(t) = &rule.icmptype {
                out.push_str(" --icmp-type ");
                out.push_str(t);
            }
            out.push_str(" -j ");
            out.push_str(rule.action.legacy_target());
            out.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FailingSubmitter, RecordingRunner, RecordingSubmitter};
    use crate::resolver::fake::FakeResolver;
    use crate::rule::{Action, PortRange, Rule};
    use std::path::PathBuf;

    fn empty_resolv() -> PathBuf {
        PathBuf::from("/nonexistent/resolv.conf")
    }

    #[test]
    fn chain_name_replaces_separators() {
        assert_eq!(chain_for_addr("10.137.0.5"), "qbs-10-137-0-5");
    }

    #[test]
    fn init_establishes_accept_shortcut_ahead_of_default_drop() {
        let runner4 = RecordingRunner::new();
        let calls = runner4.calls.clone();
        let backend = LegacyBackend::with_collaborators(
            Box::new(runner4),
            Box::new(RecordingRunner::new()),
            Box::new(RecordingSubmitter::new()),
            Box::new(RecordingSubmitter::new()),
        );

        backend.init().unwrap();

        let calls = calls.borrow();
        let accept_pos = calls
            .iter()
            .position(|c| c.iter().any(|a| a == "ESTABLISHED,RELATED"))
            .expect("established/related shortcut should be installed");
        let expected_drop: Vec<String> = ["-A", FORWARD_CHAIN, "-j", "DROP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let drop_pos = calls
            .iter()
            .position(|c| *c == expected_drop)
            .expect("default-deny DROP should be installed");
        assert!(accept_pos < drop_pos);
    }

    #[test]
    fn chain_name_truncates_to_20_chars() {
        let chain = chain_for_addr("2001:0db8:1234:5678:0000:0000:0000:0001");
        assert_eq!(chain.len(), 20);
        assert!(chain.ends_with("0000-0001"));
    }

    #[test]
    fn apply_rules_creates_chain_once_and_submits_program() {
        let runner4 = RecordingRunner::new();
        let calls = runner4.calls.clone();
        let backend = LegacyBackend::with_collaborators(
            Box::new(runner4),
            Box::new(RecordingRunner::new()),
            Box::new(RecordingSubmitter::new()),
            Box::new(RecordingSubmitter::new()),
        );

        let rules = RuleList::new(vec![Rule::unconditional(Action::Drop)]);
        let resolver = FakeResolver::new();

        backend
            .apply_rules("10.137.0.5", Family::V4, &rules, &resolver, &empty_resolv())
            .unwrap();
        backend
            .apply_rules("10.137.0.5", Family::V4, &rules, &resolver, &empty_resolv())
            .unwrap();

        let new_chain_calls = calls
            .borrow()
            .iter()
            .filter(|c| c[0] == "-N")
            .count();
        assert_eq!(new_chain_calls, 1, "chain should only be created once");
    }

    #[test]
    fn prepare_rules_renders_cartesian_product() {
        let mut rule = Rule::unconditional(Action::Accept);
        rule.proto = Some("tcp".to_owned());
        rule.dstports = Some(PortRange::single(443));
        let rules = RuleList::new(vec![rule]);
        let resolver = FakeResolver::new();

        let program =
            prepare_rules("qbs-10-137-0-5", &rules, Family::V4, &resolver, &empty_resolv())
                .unwrap();

        assert!(program.starts_with("*filter\n"));
        assert!(program.contains("-A qbs-10-137-0-5 -p tcp --dport 443:443 -j ACCEPT"));
        assert!(program.trim_end().ends_with("COMMIT"));
    }

    #[test]
    fn apply_rules_surfaces_restore_rejection() {
        let backend = LegacyBackend::with_collaborators(
            Box::new(RecordingRunner::new()),
            Box::new(RecordingRunner::new()),
            Box::new(FailingSubmitter),
            Box::new(FailingSubmitter),
        );
        let rules = RuleList::fallback_drop();
        let resolver = FakeResolver::new();

        let err = backend
            .apply_rules("10.137.0.5", Family::V4, &rules, &resolver, &empty_resolv())
            .unwrap_err();
        assert!(err.is_rule_apply());
    }
}
