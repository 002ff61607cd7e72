//! Config reader: adapts the external key/value store's flat namespace into
//! per-address ordered [`RuleList`]s.
//!
//! The store itself (QubesDB in production) is an external collaborator --
//! only its interface is modeled here, as [`ConfigStore`]. Production wiring
//! of a real QubesDB client is out of scope; tests exercise this module
//! against [`FakeConfigStore`].

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;

use crate::errors::*;
use crate::rule::{Action, Rule, RuleList};

/// The keyspace root under which per-source-address rules live.
pub const NAMESPACE: &str = "/qubes-firewall/";

/// The narrow surface this crate needs from the external key/value store:
/// `multiread`, `list`, `watch`, `read_watch`, and `watch_fd`, matching the
/// primitives QubesDB's own client exposes.
pub trait ConfigStore {
    /// Read every key at or below `prefix`, keyed by their full path.
    fn multiread(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// List the direct children of `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Start watching `prefix` for changes; subsequent calls to
    /// [`read_watch`](Self::read_watch) report writes below it.
    fn watch(&self, prefix: &str) -> Result<()>;

    /// Block until the next watched path is written, or `None` if the watch
    /// was closed. Implementations are expected to return an interrupted
    /// I/O error when a signal arrives mid-read, matching the behavior the
    /// daemon loop relies on to notice shutdown requests.
    fn read_watch(&self) -> Result<Option<String>>;

    /// The file descriptor backing the watch, preserved across
    /// daemonization by the process shell (out of scope for this crate).
    fn watch_fd(&self) -> RawFd;
}

/// Read and parse the rule set stored for `addr`.
///
/// Fails with [`ErrorKind::RuleParse`] if `policy` is absent, any non-policy
/// leaf key isn't a four-digit rule number, or any rule value fails to
/// parse (see [`Rule::parse`]).
pub fn read_rules(store: &dyn ConfigStore, addr: &str) -> Result<RuleList> {
    let prefix = format!("{}{}/", NAMESPACE, addr);
    let entries = store.multiread(&prefix)?;

    let mut policy: Option<Action> = None;
    let mut numbered: BTreeMap<String, String> = BTreeMap::new();

    for (path, value) in entries {
        let leaf = path
            .strip_prefix(&prefix)
            .ok_or_else(|| ErrorKind::RuleParse(format!("unexpected key '{}'", path)))?;
        if leaf == "policy" {
            policy = Some(Action::parse(&value)?);
        } else {
            numbered.insert(leaf.to_owned(), value);
        }
    }

    let policy = policy
        .ok_or_else(|| ErrorKind::RuleParse("no 'policy' defined".to_owned()))?;

    let mut rules = Vec::with_capacity(numbered.len() + 1);
    for (ruleno, value) in &numbered {
        if !is_rule_number(ruleno) {
            return Err(ErrorKind::RuleParse(format!(
                "unexpected non-rule found: {}={}",
                ruleno, value
            ))
            .into());
        }
        rules.push(Rule::parse(ruleno, value)?);
    }
    rules.push(Rule::unconditional(policy));

    Ok(RuleList::new(rules))
}

/// Four ASCII digits, nothing else -- stricter than Python's
/// `str.isdigit()`, which also accepts non-ASCII digit code points.
fn is_rule_number(s: &str) -> bool {
    s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit())
}

/// Enumerate the unique set of source addresses with rules defined in the
/// store.
pub fn list_targets(store: &dyn ConfigStore) -> Result<BTreeSet<String>> {
    let mut targets = BTreeSet::new();
    for path in store.list(NAMESPACE)? {
        let rest = path.strip_prefix(NAMESPACE).unwrap_or(&path);
        if let Some(addr) = rest.split('/').next() {
            if !addr.is_empty() {
                targets.insert(addr.to_owned());
            }
        }
    }
    Ok(targets)
}

/// In-memory [`ConfigStore`] test double, also used by the integration
/// suite under `tests/` -- kept outside `#[cfg(test)]` so it links into
/// that separate test binary too.
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// In-memory [`ConfigStore`] double for tests: a flat map of path ->
    /// value plus a queue of paths to hand back from `read_watch`.
    #[derive(Default)]
    pub struct FakeConfigStore {
        pub entries: RefCell<BTreeMap<String, String>>,
        pub watch_events: RefCell<VecDeque<String>>,
    }

    impl FakeConfigStore {
        pub fn new() -> FakeConfigStore {
            FakeConfigStore::default()
        }

        pub fn set(&self, path: &str, value: &str) {
            self.entries
                .borrow_mut()
                .insert(path.to_owned(), value.to_owned());
        }

        pub fn push_watch_event(&self, path: &str) {
            self.watch_events.borrow_mut().push_back(path.to_owned());
        }
    }

    impl ConfigStore for FakeConfigStore {
        fn multiread(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
            Ok(self
                .entries
                .borrow()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .entries
                .borrow()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        fn watch(&self, _prefix: &str) -> Result<()> {
            Ok(())
        }

        fn read_watch(&self) -> Result<Option<String>> {
            Ok(self.watch_events.borrow_mut().pop_front())
        }

        fn watch_fd(&self) -> RawFd {
            -1
        }
    }
}
