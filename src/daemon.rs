//! The daemon loop: bootstrap, initial sweep, watch-driven updates,
//! cancellation, and cleanup (spec §4.6).
//!
//! [`Daemon`] owns every piece of mutable state the loop touches -- the
//! config store, the selected backend, the resolver, and the termination
//! flag -- and is driven entirely from [`Daemon::run`]; nothing here runs
//! off the main loop thread, matching the single-threaded model of spec §5.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slog::{debug, error, info, Logger};

use crate::backend::FirewallBackend;
use crate::config::{self, ConfigStore, NAMESPACE};
use crate::notify::notify;
use crate::resolver::HostResolver;
use crate::rule::{Family, RuleList};
use crate::scripts;

/// Classify a watch-event path, returning the source address it names *only*
/// if the path is a commit barrier -- an empty write directly to
/// `/qubes-firewall/<SA>`, with no further `/`-separated components (spec
/// §4.6 step 7, §9). A path with more slashes is an in-progress write to one
/// of that address's numbered rule keys and must be ignored.
pub fn commit_addr(path: &str) -> Option<&str> {
    if path.matches('/').count() > 2 {
        return None;
    }
    let rest = path.strip_prefix(NAMESPACE)?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Drives the translate-and-install pipeline for one configuration store and
/// one backend.
pub struct Daemon<S, B, R> {
    store: S,
    backend: B,
    resolver: R,
    resolv_conf: PathBuf,
    log: Logger,
    terminate: Arc<AtomicBool>,
}

impl<S, B, R> Daemon<S, B, R>
where
    S: ConfigStore,
    B: FirewallBackend,
    R: HostResolver,
{
    pub fn new(
        store: S,
        backend: B,
        resolver: R,
        resolv_conf: PathBuf,
        log: Logger,
        terminate: Arc<AtomicBool>,
    ) -> Daemon<S, B, R> {
        Daemon {
            store,
            backend,
            resolver,
            resolv_conf,
            log,
            terminate,
        }
    }

    fn log_and_notify(&self, msg: &str) {
        error!(self.log, "{}", msg);
        notify(msg);
    }

    /// Install the single-rule fallback `drop` chain for `addr`. If that
    /// also fails, this is the last resort: log and give up on `addr` until
    /// its next watch event (spec §7).
    fn apply_fallback(&self, addr: &str, family: Family) {
        let fallback = RuleList::fallback_drop();
        if let Err(e) = self.backend.apply_rules(
            addr,
            family,
            &fallback,
            &self.resolver,
            &self.resolv_conf,
        ) {
            self.log_and_notify(&format!("Failed to block traffic for {}: {}", addr, e));
        }
    }

    /// Read, translate, and install the rule set for `addr` (spec §4.6). On
    /// a parse or apply failure, falls back to an unconditional drop chain
    /// for `addr`, logging and notifying the user either way.
    pub fn handle_addr(&self, addr: &str) {
        let family = Family::of_addr(addr);

        let rules = match config::read_rules(&self.store, addr) {
            Ok(rules) => rules,
            Err(e) => {
                self.log_and_notify(&format!(
                    "Failed to parse rules for {} ({}), blocking traffic",
                    addr, e
                ));
                self.apply_fallback(addr, family);
                return;
            }
        };

        if let Err(e) =
            self.backend
                .apply_rules(addr, family, &rules, &self.resolver, &self.resolv_conf)
        {
            self.log_and_notify(&format!(
                "Failed to apply rules for {} ({}), blocking traffic",
                addr, e
            ));
            self.apply_fallback(addr, family);
        }
    }

    /// Run the script directories and the user script once, ignoring
    /// individual exit codes (spec §6).
    fn run_startup_scripts(&self, user_script: &Path) {
        scripts::run_firewall_dirs(&self.log);
        scripts::run_user_script(&self.log, user_script);
    }

    /// Full daemon lifecycle: init, startup scripts, initial sweep, watch
    /// loop, cleanup. Returns once the watch loop exits, either because the
    /// store closed the watch or the termination flag was observed.
    pub fn run(&self, user_script: &Path) -> crate::errors::Result<()> {
        info!(self.log, "starting backend"; "backend" => self.backend.name());
        self.backend.init()?;

        self.run_startup_scripts(user_script);

        let targets = config::list_targets(&self.store)?;
        info!(self.log, "initial sweep"; "targets" => targets.len());
        for addr in &targets {
            self.handle_addr(addr);
        }

        self.store.watch(NAMESPACE)?;

        while !self.terminate.load(Ordering::SeqCst) {
            match self.store.read_watch() {
                Ok(Some(path)) => {
                    if let Some(addr) = commit_addr(&path) {
                        debug!(self.log, "config change"; "addr" => addr);
                        self.handle_addr(addr);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(self.log, "watch read interrupted"; "error" => %e);
                    break;
                }
            }
        }

        info!(self.log, "shutting down");
        self.backend.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FailingSubmitter, RecordingRunner, RecordingSubmitter};
    use crate::backend::legacy::LegacyBackend;
    use crate::config::fake::FakeConfigStore;
    use crate::resolver::fake::FakeResolver;
    use sloggers::terminal::TerminalLoggerBuilder;
    use sloggers::Build;
    use std::path::PathBuf;

    fn test_logger() -> Logger {
        TerminalLoggerBuilder::new().build().unwrap()
    }

    #[test]
    fn commit_addr_ignores_subkey_writes() {
        assert_eq!(
            commit_addr("/qubes-firewall/10.137.0.5"),
            Some("10.137.0.5")
        );
        assert_eq!(commit_addr("/qubes-firewall/10.137.0.5/0000"), None);
        assert_eq!(commit_addr("/qubes-firewall/"), None);
    }

    #[test]
    fn handle_addr_falls_back_to_drop_on_parse_error() {
        let store = FakeConfigStore::new();
        // no policy defined -> parse error
        store.set("/qubes-firewall/10.137.0.5/0000", "action=accept");

        let submitter4 = RecordingSubmitter::new();
        let programs = submitter4.programs.clone();
        let backend = LegacyBackend::with_collaborators(
            Box::new(RecordingRunner::new()),
            Box::new(RecordingRunner::new()),
            Box::new(submitter4),
            Box::new(RecordingSubmitter::new()),
        );

        let daemon = Daemon::new(
            store,
            backend,
            FakeResolver::new(),
            PathBuf::from("/nonexistent/resolv.conf"),
            test_logger(),
            Arc::new(AtomicBool::new(false)),
        );

        daemon.handle_addr("10.137.0.5");

        let program = programs.borrow().last().cloned().unwrap();
        assert_eq!(program, "*filter\n-A qbs-10-137-0-5 -j DROP\nCOMMIT\n");
    }

    #[test]
    fn handle_addr_gives_up_quietly_when_fallback_also_fails() {
        let store = FakeConfigStore::new();
        store.set("/qubes-firewall/10.137.0.5/policy", "drop");
        store.set("/qubes-firewall/10.137.0.5/abcd", "action=accept"); // non-numeric -> parse error

        let backend = LegacyBackend::with_collaborators(
            Box::new(RecordingRunner::new()),
            Box::new(RecordingRunner::new()),
            Box::new(FailingSubmitter),
            Box::new(FailingSubmitter),
        );

        let daemon = Daemon::new(
            store,
            backend,
            FakeResolver::new(),
            PathBuf::from("/nonexistent/resolv.conf"),
            test_logger(),
            Arc::new(AtomicBool::new(false)),
        );

        // Should not panic even though both the real apply and the fallback
        // apply fail.
        daemon.handle_addr("10.137.0.5");
    }
}
