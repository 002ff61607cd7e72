//! Crate-wide error types.
//!
//! Two kinds of failure are meaningful at the rule-translation boundary (see
//! `translate` and the backend modules): a malformed rule set (`RuleParse`)
//! and a backend tool rejecting a well-formed program (`RuleApply`). Every
//! other failure mode is either a foreign error (I/O, integer parsing) or a
//! generic message produced with `bail!`/`format_err!`.

error_chain! {
    foreign_links {
        Io(::std::io::Error);
        ParseIntError(::std::num::ParseIntError);
    }

    errors {
        /// The stored rule set for a source address could not be parsed: an
        /// unknown option, a missing `action`/`policy`, a malformed rule
        /// number, a family/destination mismatch, or a DNS lookup failure.
        RuleParse(msg: String) {
            description("rule parse error")
            display("rule parse error: {}", msg)
        }

        /// A backend tool rejected an otherwise well-formed rule program.
        RuleApply(msg: String) {
            description("rule apply error")
            display("rule apply error: {}", msg)
        }
    }
}

impl Error {
    /// True if this error originated from rule parsing rather than rule
    /// application. Used by the daemon loop's three-way match to decide
    /// whether a failure is recoverable the same way the Python original
    /// distinguishes `RuleParseError` from `RuleApplyError`.
    pub fn is_rule_parse(&self) -> bool {
        matches!(self.kind(), ErrorKind::RuleParse(_))
    }

    /// True if this error originated from submitting a rule program to a
    /// backend tool.
    pub fn is_rule_apply(&self) -> bool {
        matches!(self.kind(), ErrorKind::RuleApply(_))
    }
}
