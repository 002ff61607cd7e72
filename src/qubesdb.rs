//! Production [`ConfigStore`](crate::config::ConfigStore) wiring.
//!
//! The real QubesDB client is an external collaborator (spec §1) and its
//! wire protocol is out of scope for this crate. `QubesDbStore` is the seam
//! a real client slots into: every method currently fails with a plain
//! "not connected" error, which is enough to keep the crate buildable and
//! the trait boundary concrete without vendoring a QubesDB binding.

use std::os::unix::io::RawFd;

use std::collections::BTreeMap;

use crate::config::ConfigStore;
use crate::errors::*;

/// Placeholder production [`ConfigStore`]. Every method fails until this is
/// replaced with a real QubesDB client binding.
pub struct QubesDbStore;

impl QubesDbStore {
    pub fn new() -> QubesDbStore {
        QubesDbStore
    }

    fn not_connected() -> Error {
        "QubesDB client is not wired up in this build".into()
    }
}

impl Default for QubesDbStore {
    fn default() -> QubesDbStore {
        QubesDbStore::new()
    }
}

impl ConfigStore for QubesDbStore {
    fn multiread(&self, _prefix: &str) -> Result<BTreeMap<String, String>> {
        Err(Self::not_connected())
    }

    fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(Self::not_connected())
    }

    fn watch(&self, _prefix: &str) -> Result<()> {
        Err(Self::not_connected())
    }

    fn read_watch(&self) -> Result<Option<String>> {
        Err(Self::not_connected())
    }

    fn watch_fd(&self) -> RawFd {
        -1
    }
}
