//! Process-wide library state.
//!
//! The engine keeps no real global resources of its own, but bindings and
//! embedders expect an explicit, reference-counted init/cleanup pair:
//! [`init`] must run before the first client instance is created, and
//! [`cleanup`] succeeds only once every instance is gone. Both are
//! idempotent; a surplus `cleanup` is a no-op, never an error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

struct LibraryState {
    owners: AtomicUsize,
    instances: AtomicUsize,
}

static STATE: Lazy<LibraryState> = Lazy::new(|| LibraryState {
    owners: AtomicUsize::new(0),
    instances: AtomicUsize::new(0),
});

/// Initialize the library. Safe to call repeatedly and from any thread;
/// each call adds an owner reference.
pub fn init() {
    STATE.owners.fetch_add(1, Ordering::SeqCst);
}

/// Release an owner reference.
///
/// Refused while client instances are alive; calling with no outstanding
/// reference is a no-op.
pub fn cleanup() -> Result<()> {
    if STATE.instances.load(Ordering::SeqCst) > 0 {
        return Err(Error::invalid(
            "cannot clean up the library while client instances exist",
        ));
    }
    let _ = STATE
        .owners
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |owners| {
            owners.checked_sub(1)
        });
    Ok(())
}

/// Library version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Register a client instance, requiring a prior [`init`].
pub(crate) fn register_instance() -> Result<InstanceGuard> {
    if STATE.owners.load(Ordering::SeqCst) == 0 {
        return Err(Error::invalid(
            "library::init() must be called before creating a client",
        ));
    }
    STATE.instances.fetch_add(1, Ordering::SeqCst);
    Ok(InstanceGuard {
        released: AtomicBool::new(false),
    })
}

/// Live-instance token; releasing (or dropping) it decrements the count
/// exactly once.
pub(crate) struct InstanceGuard {
    released: AtomicBool,
}

impl InstanceGuard {
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            STATE.instances.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.release();
    }
}
