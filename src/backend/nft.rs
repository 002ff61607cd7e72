//! The modern backend: a single `nft` table per address family, one chain
//! per source address.
//!
//! Unlike the legacy backend there is no separate chain-plumbing step --
//! chain creation, the per-address flush, and the rule refill are all part
//! of one `nft -f -` transaction, so [`NftBackend`] only needs a
//! [`RuleSubmitter`] per family.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;

use super::{CommandSubmitter, FirewallBackend, RuleSubmitter};
use crate::errors::*;
use crate::resolver::HostResolver;
use crate::rule::{Family, RuleList};
use crate::translate::{normalize_rule, DstSelector, NormalizedRule};

const TABLE: &str = "qubes-firewall";

fn family_keyword(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

/// `qbs-` followed by the address with every `.`/`:` replaced by `-`. Chain
/// names inside an `nft` table aren't length-limited the way `iptables`
/// chain names are, so this isn't truncated.
fn chain_for_addr(addr: &str) -> String {
    let mut name = String::with_capacity(addr.len() + 4);
    name.push_str("qbs-");
    for c in addr.chars() {
        name.push(if c == '.' || c == ':' { '-' } else { c });
    }
    name
}

pub struct NftBackend {
    submitter4: Box<dyn RuleSubmitter>,
    submitter6: Box<dyn RuleSubmitter>,
    chains4: RefCell<BTreeSet<String>>,
    chains6: RefCell<BTreeSet<String>>,
}

impl NftBackend {
    pub fn new() -> NftBackend {
        NftBackend {
            submitter4: Box::new(CommandSubmitter::new("nft", &["-f", "-"])),
            submitter6: Box::new(CommandSubmitter::new("nft", &["-f", "-"])),
            chains4: RefCell::new(BTreeSet::new()),
            chains6: RefCell::new(BTreeSet::new()),
        }
    }

    pub(crate) fn with_collaborators(
        submitter4: Box<dyn RuleSubmitter>,
        submitter6: Box<dyn RuleSubmitter>,
    ) -> NftBackend {
        NftBackend {
            submitter4,
            submitter6,
            chains4: RefCell::new(BTreeSet::new()),
            chains6: RefCell::new(BTreeSet::new()),
        }
    }

    /// A backend that logs every `nft` program it would have submitted
    /// instead of invoking `nft`, used for `--dry-run`.
    pub fn dry_run(log: slog::Logger) -> NftBackend {
        NftBackend::with_collaborators(
            Box::new(super::LoggingSubmitter::new("nft", log.clone())),
            Box::new(super::LoggingSubmitter::new("nft", log)),
        )
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
}

impl Default for NftBackend {
    fn default() -> NftBackend {
        NftBackend::new()
    }
}

impl FirewallBackend for NftBackend {
    fn name(&self) -> &'static str {
        "nft"
    }

    fn init(&self) -> Result<()> {
        for family in [Family::V4, Family::V6].iter().copied() {
            let program = format!(
                "table {fam} {table} {{\n  \
                 chain forward {{\n    \
                 type filter hook forward priority 0;\n    \
                 policy drop;\n    \
                 ct state established,related accept\n  \
                 }}\n}}\n",
                fam = family_keyword(family),
                table = TABLE,
            );
            self.submitter(family).submit(&program)?;
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
        let fam = family_keyword(family);

        let mut program = String::new();
        if !self.chains(family).borrow().contains(&chain) {
            program.push_str(&format!(
                "table {fam} {table} {{\n  \
                 chain {chain} {{\n  \
                 }}\n  \
                 chain forward {{\n    \
                 {fam} saddr {addr} jump {chain}\n  \
                 }}\n}}\n",
                fam = fam,
                table = TABLE,
                chain = chain,
                addr = addr,
            ));
            self.chains(family).borrow_mut().insert(chain.clone());
        }

        let mut body = Vec::new();
        for rule in rules.rules() {
            let normalized = match normalize_rule(rule, family, resolver, resolv_conf)? {
                Some(n) => n,
                None => continue,
            };
            body.push(render_rule(fam, &normalized));
        }

        program.push_str(&format!(
            "flush chain {fam} {table} {chain}\n\
             table {fam} {table} {{\n  \
             chain {chain} {{\n   \
             {rules}\n  \
             }}\n}}\n",
            fam = fam,
            table = TABLE,
            chain = chain,
            rules = body.join("\n   "),
        ));

        self.submitter(family).submit(&program)
    }

    fn cleanup(&self) -> Result<()> {
        for family in [Family::V4, Family::V6].iter().copied() {
            let program = format!("delete table {} {}\n", family_keyword(family), TABLE);
            self.submitter(family).submit(&program)?;
        }
        Ok(())
    }
}

/// Render a single rule line; unlike the legacy backend this emits one line
/// per [`NormalizedRule`], using nft's set syntax (`{ a, b, c }`) for a
/// multi-valued destination rather than expanding a cartesian product.
fn render_rule(fam: &str, rule: &NormalizedRule) -> String {
    let mut out = String::new();

    if let Some(protos) = &rule.protos {
        if protos.len() == 1 {
            if fam == "ip6" {
                out.push_str(&format!(" ip6 nexthdr {}", protos[0]));
            } else {
                out.push_str(&format!(" ip protocol {}", protos[0]));
            }
        }
    }

    match &rule.dst {
        Some(DstSelector::Literal(d)) => {
            out.push_str(&format!(
                " {} daddr {}",
                if fam == "ip6" { "ip6" } else { "ip" },
                d
            ));
        }
        Some(DstSelector::Set(ds)) => {
            let mut sorted = ds.clone();
            sorted.sort();
            out.push_str(&format!(
                " {} daddr {{ {} }}",
                if fam == "ip6" { "ip6" } else { "ip" },
                sorted.join(", ")
            ));
        }
        None => {}
    }

    if let Some(t) = &rule.icmptype {
        if fam == "ip6" {
            out.push_str(&format!(" icmpv6 type {}", t));
        } else {
            out.push_str(&format!(" icmp type {}", t));
        }
    }

    match (&rule.dstports, &rule.protos) {
        (Some(pr), Some(protos)) if protos.len() == 1 => {
            out.push_str(&format!(
                " {} dport {} {}",
                protos[0],
                pr.to_nft(),
                rule.action.nft_verdict()
            ));
        }
        (Some(pr), _) => {
            return format!(
                "{prefix} tcp dport {port} {verdict}\n   {prefix} udp dport {port} {verdict}",
                prefix = out,
                port = pr.to_nft(),
                verdict = rule.action.nft_verdict()
            );
        }
        (None, _) => {
            out.push(' ');
            out.push_str(rule.action.nft_verdict());
        }
    }

    out
}
