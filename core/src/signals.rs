//! Cooperative suspension points (spec §5): a "die flag" checked at every
//! worker loop top and before each retry, and a "save in progress" flag
//! gating a busy wait that must yield, never spin. Both are cheap
//! `Arc<AtomicBool>` handles so the server can hold one end while a
//! worker task holds the other, with no channel or lock needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tells every worker sharing this flag to stop at the next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tells every worker sharing this flag to pause ingestion while a save of
/// the graph state is in progress. The on-disk save format itself is out of
/// scope here; this only gates the busy wait around it.
#[derive(Debug, Clone, Default)]
pub struct SaveFlag(Arc<AtomicBool>);

impl SaveFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn begin(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn end(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_saving(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_visible_across_clones() {
        let a = CancelFlag::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn save_flag_toggles_across_clones() {
        let a = SaveFlag::new();
        let b = a.clone();
        a.begin();
        assert!(b.is_saving());
        a.end();
        assert!(!b.is_saving());
    }
}
