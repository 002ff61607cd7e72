//! The rule model: a parsed rule and the closed set of options it may carry.
//!
//! A [`Rule`] is built from a single space-separated `k=v` token string (the
//! value half of one `/qubes-firewall/<SA>/<NNNN>` entry), or synthesized as
//! the unconditional terminal verdict appended to every [`RuleList`]. Unknown
//! options are rejected the moment a `Rule` is parsed, so there is no later
//! point where an unrecognized field could leak into a backend.

use crate::errors::*;

/// Address family of a source address (and therefore of the chain and rules
/// derived from it). Inferred from the presence of a `:` in the literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Classify a source-address literal by address family.
    pub fn of_addr(addr: &str) -> Family {
        if addr.contains(':') {
            Family::V6
        } else {
            Family::V4
        }
    }

    /// The full-host CIDR mask used to pin a resolved address down to a
    /// single host (`/32` for IPv4, `/128` for IPv6).
    pub fn fullmask(self) -> &'static str {
        match self {
            Family::V4 => "/32",
            Family::V6 => "/128",
        }
    }

    pub fn as_numeral(self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }
}

/// Terminal verdict of a rule or policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Accept,
    Drop,
}

impl Action {
    /// Parse an `action=`/`policy=` value. Recognized case-insensitively,
    /// since the legacy backend re-emits it uppercased regardless of how it
    /// was written in the config store.
    pub fn parse(value: &str) -> Result<Action> {
        match value.to_ascii_lowercase().as_str() {
            "accept" => Ok(Action::Accept),
            "drop" => Ok(Action::Drop),
            other => Err(ErrorKind::RuleParse(format!("unknown action '{}'", other)).into()),
        }
    }

    /// Uppercase target keyword used by the legacy (`iptables`) dialect.
    pub fn legacy_target(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
        }
    }

    /// Lowercase verdict keyword used by the modern (`nft`) dialect.
    pub fn nft_verdict(self) -> &'static str {
        match self {
            Action::Accept => "accept",
            Action::Drop => "drop",
        }
    }
}

/// A destination port or inclusive port range (`dstports=N` or `N-M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn parse(value: &str) -> Result<PortRange> {
        let (lo, hi) = match value.split_once('-') {
            Some((lo, hi)) => (lo, hi),
            None => (value, value),
        };
        let lo: u16 = lo
            .parse()
            .map_err(|_| ErrorKind::RuleParse(format!("invalid dstports '{}'", value)))?;
        let hi: u16 = hi
            .parse()
            .map_err(|_| ErrorKind::RuleParse(format!("invalid dstports '{}'", value)))?;
        if lo > hi {
            return Err(ErrorKind::RuleParse(format!("invalid dstports '{}'", value)).into());
        }
        Ok(PortRange { lo, hi })
    }

    pub fn single(port: u16) -> PortRange {
        PortRange { lo: port, hi: port }
    }

    pub fn is_single(self) -> bool {
        self.lo == self.hi
    }

    pub fn is_dns(self) -> bool {
        self.lo == 53 && self.hi == 53
    }

    /// `lo:hi`, the legacy (`iptables --dport`) range syntax.
    pub fn to_legacy(self) -> String {
        format!("{}:{}", self.lo, self.hi)
    }

    /// `lo` if the range collapses to a single port, else `lo-hi`; the
    /// modern (`nft dport`) range syntax.
    pub fn to_nft(self) -> String {
        if self.is_single() {
            self.lo.to_string()
        } else {
            format!("{}-{}", self.lo, self.hi)
        }
    }
}

/// One parsed rule entry, or the synthetic terminal verdict appended to
/// every [`RuleList`]. The terminal rule carries only `action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub proto: Option<String>,
    pub dst4: Option<String>,
    pub dst6: Option<String>,
    pub dsthost: Option<String>,
    pub dstports: Option<PortRange>,
    pub specialtarget: Option<String>,
    pub icmptype: Option<String>,
}

impl Rule {
    /// A rule with no constraints other than its verdict -- used both for
    /// the synthetic terminal policy rule and the single-rule fallback
    /// chain installed on parse/apply failure.
    pub fn unconditional(action: Action) -> Rule {
        Rule {
            action,
            proto: None,
            dst4: None,
            dst6: None,
            dsthost: None,
            dstports: None,
            specialtarget: None,
            icmptype: None,
        }
    }

    /// Parse the space-separated `k=v` token value of a single
    /// `/qubes-firewall/<SA>/<NNNN>` entry.
    ///
    /// `label` is used only to produce readable error messages (the rule
    /// number, or `"policy"`).
    pub fn parse(label: &str, value: &str) -> Result<Rule> {
        let mut action = None;
        let mut proto = None;
        let mut dst4 = None;
        let mut dst6 = None;
        let mut dsthost = None;
        let mut dstports = None;
        let mut specialtarget = None;
        let mut icmptype = None;

        for token in value.split(' ') {
            let mut parts = token.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let val = parts.next().ok_or_else(|| {
                ErrorKind::RuleParse(format!(
                    "malformed token '{}' in rule '{}'",
                    token, label
                ))
            })?;

            match key {
                "action" => action = Some(Action::parse(val)?),
                "proto" => proto = Some(val.to_owned()),
                "dst4" => dst4 = Some(val.to_owned()),
                "dst6" => dst6 = Some(val.to_owned()),
                "dsthost" => dsthost = Some(val.to_owned()),
                "dstports" => dstports = Some(PortRange::parse(val)?),
                "specialtarget" => specialtarget = Some(val.to_owned()),
                "icmptype" => icmptype = Some(val.to_owned()),
                other => {
                    return Err(ErrorKind::RuleParse(format!(
                        "unsupported rule option '{}' in rule '{}'",
                        other, label
                    ))
                    .into())
                }
            }
        }

        let action = action
            .ok_or_else(|| ErrorKind::RuleParse(format!("rule '{}' lacks action", label)))?;

        Ok(Rule {
            action,
            proto,
            dst4,
            dst6,
            dsthost,
            dstports,
            specialtarget,
            icmptype,
        })
    }
}

/// An ordered rule set for one source address: the numbered rules in
/// ascending order, followed by the synthetic terminal policy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleList(pub Vec<Rule>);

impl RuleList {
    pub fn new(rules: Vec<Rule>) -> RuleList {
        RuleList(rules)
    }

    /// The fallback chain content installed on any parse or apply failure:
    /// exactly one unconditional `drop` rule.
    pub fn fallback_drop() -> RuleList {
        RuleList(vec![Rule::unconditional(Action::Drop)])
    }

    pub fn rules(&self) -> &[Rule] {
        &self.0
    }
}
