//! `qubes-firewall` -- per-VM firewall enforcement daemon for Qubes OS
//! network-serving VMs.
//!
//! This crate watches the `/qubes-firewall/` keyspace of the QubesDB
//! configuration store for per-source-address rule sets, translates them
//! into backend-specific packet-filter programs, and keeps the kernel
//! filter state for each client VM synchronized with the store. See
//! [`daemon`] for the top-level control flow.

#[macro_use]
extern crate error_chain;

pub mod backend;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod notify;
pub mod qubesdb;
pub mod resolver;
pub mod rule;
pub mod scripts;
pub mod translate;
