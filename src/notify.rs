//! Best-effort desktop notification, used by the daemon loop to surface a
//! parse/apply failure to the user in addition to the log.
//!
//! `notify-send` may not exist, may fail, or may have nowhere to display to
//! (no X session) -- none of that should affect the caller, so every failure
//! mode is swallowed here rather than propagated.

use std::process::Command;

/// Show `msg` via `notify-send -t 3000 <msg>`, with `DISPLAY=:0` injected so
/// the message reaches the user's session even when this daemon runs
/// outside of it. Spawn failures and non-zero exits are both ignored.
pub fn notify(msg: &str) {
    let _ = Command::new("notify-send")
        .arg("-t")
        .arg("3000")
        .arg(msg)
        .env("DISPLAY", ":0")
        .status();
}
