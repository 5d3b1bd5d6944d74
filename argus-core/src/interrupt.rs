//! Process-wide cooperative cancellation hook.
//!
//! Long-running operations poll [`is_interrupted`] once per query. The
//! first positive poll sets a sticky flag inside the operation; the
//! remaining iterations drain and the operation fails with
//! `Error::Interrupted` after its parallel region joins.

use parking_lot::RwLock;

type Hook = Box<dyn Fn() -> bool + Send + Sync>;

static HOOK: RwLock<Option<Hook>> = RwLock::new(None);

/// Install the process-wide interrupt probe, replacing any previous one.
pub fn set_hook(hook: impl Fn() -> bool + Send + Sync + 'static) {
    *HOOK.write() = Some(Box::new(hook));
}

/// Remove the interrupt probe.
pub fn clear_hook() {
    *HOOK.write() = None;
}

/// Poll the interrupt probe. Without an installed hook this is false.
pub fn is_interrupted() -> bool {
    HOOK.read().as_ref().is_some_and(|hook| hook())
}
