//! Entry point: parses CLI flags, wires up logging and the config store,
//! selects a backend, and drives [`Daemon::run`].
//!
//! Process daemonization (forking, detaching, preserving the watch file
//! descriptor across that fork) is out of scope for this crate -- it is
//! assumed to run already attached to the right process context, under the
//! system's existing daemonization wrapper (spec §1, SPEC_FULL §4.6).

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{App, Arg};
use slog::error;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use qubes_firewall::backend::{backend_available, select_backend};
use qubes_firewall::daemon::Daemon;
use qubes_firewall::qubesdb::QubesDbStore;
use qubes_firewall::resolver::{HostResolver, SystemResolver};

const DEFAULT_RESOLV_CONF: &str = qubes_firewall::resolver::DEFAULT_RESOLV_CONF;
const DEFAULT_USER_SCRIPT: &str = "/rw/config/qubes-firewall-user-script";

fn build_logger(verbosity: u64) -> slog::Logger {
    let level = match verbosity {
        0 => Severity::Info,
        1 => Severity::Debug,
        _ => Severity::Trace,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);
    builder.level(level);
    builder
        .build()
        .unwrap_or_else(|_| sloggers::null::NullLoggerBuilder.build().unwrap())
}

fn main() {
    let matches = App::new("qubes-firewall")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Per-VM firewall enforcement daemon for Qubes OS network-serving VMs")
        .arg(
            Arg::with_name("dry-run")
                .long("dry-run")
                .help("Log rule programs instead of installing them with the real backend tools"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (may be repeated)"),
        )
        .arg(
            Arg::with_name("resolv-conf")
                .long("resolv-conf")
                .takes_value(true)
                .default_value(DEFAULT_RESOLV_CONF)
                .help("Path to the resolver configuration used for nameserver discovery"),
        )
        .arg(
            Arg::with_name("user-script")
                .long("user-script")
                .takes_value(true)
                .default_value(DEFAULT_USER_SCRIPT)
                .help("Path to the user script run once at startup"),
        )
        .get_matches();

    let log = build_logger(matches.occurrences_of("verbose"));
    let dry_run = matches.is_present("dry-run");
    let resolv_conf = PathBuf::from(matches.value_of("resolv-conf").unwrap());
    let user_script = PathBuf::from(matches.value_of("user-script").unwrap());

    let terminate = Arc::new(AtomicBool::new(false));
    for sig in &[signal_hook::SIGTERM, signal_hook::SIGINT] {
        if let Err(e) = signal_hook::flag::register(*sig, Arc::clone(&terminate)) {
            error!(log, "failed to register signal handler"; "signal" => *sig, "error" => %e);
        }
    }

    let backend = select_backend(dry_run, backend_available("nft"), &log);
    let resolver: Box<dyn HostResolver> = Box::new(SystemResolver);
    let store = QubesDbStore::new();

    let daemon = Daemon::new(store, backend, resolver, resolv_conf, log.clone(), terminate);

    let exit_code = match daemon.run(&user_script) {
        Ok(()) => 0,
        Err(e) => {
            error!(log, "fatal error, exiting"; "error" => %e);
            1
        }
    };
    std::process::exit(exit_code);
}
