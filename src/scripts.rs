//! Startup script execution: the `*.d` directories and the single user
//! script run once before the initial sweep (see spec §6).
//!
//! Both entry points ignore individual script exit codes -- a script failing
//! is the administrator's problem, not a reason to refuse to start the
//! daemon.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use slog::{debug, Logger};

/// Default `*.d` script directories, run in this order; a missing directory
/// is silently skipped.
pub const SCRIPT_DIRS: &[&str] = &[
    "/etc/qubes/qubes-firewall.d",
    "/rw/config/qubes-firewall.d",
];

/// Single user script run after the directory scripts.
pub const USER_SCRIPT: &str = "/rw/config/qubes-firewall-user-script";

fn is_executable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Run every executable regular file directly inside `dir`, in sorted
/// filename order. Missing directories are ignored; each script's exit
/// status is logged at debug level and otherwise discarded.
///
/// Enumeration goes through `glob` rather than a plain `read_dir`, matching
/// the `*.d`-style directory scan idiom this crate's dependency stack
/// already carries for exactly this purpose.
pub fn run_script_dir(log: &Logger, dir: &Path) {
    if !dir.is_dir() {
        return;
    }
    let pattern = dir.join("*").to_string_lossy().into_owned();
    let mut entries: Vec<_> = match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(_) => return,
    };
    entries.sort();

    for path in entries {
        if !is_executable_file(&path) {
            continue;
        }
        debug!(log, "running firewall script"; "path" => %path.display());
        match Command::new(&path).status() {
            Ok(status) => debug!(log, "firewall script finished"; "path" => %path.display(), "status" => %status),
            Err(e) => debug!(log, "failed to spawn firewall script"; "path" => %path.display(), "error" => %e),
        }
    }
}

/// Run every configured script directory, in order.
pub fn run_firewall_dirs(log: &Logger) {
    for dir in SCRIPT_DIRS {
        run_script_dir(log, Path::new(dir));
    }
}

/// Run the single user script at `path`, if it exists and is executable.
pub fn run_user_script(log: &Logger, path: &Path) {
    if !is_executable_file(path) {
        return;
    }
    debug!(log, "running user script"; "path" => %path.display());
    match Command::new(path).status() {
        Ok(status) => debug!(log, "user script finished"; "status" => %status),
        Err(e) => debug!(log, "failed to spawn user script"; "error" => %e),
    }
}
