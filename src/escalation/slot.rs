//! Swappable cloud backend
//!
//! Under rate limiting the chain puts an alternate backend in the slot for one
//! retry. The swap lives in a guard whose `Drop` puts the primary back, so the
//! original configuration returns on every path out of the retry.

use crate::backends::Generator;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

struct Overlay {
    swaps: usize,
    active: Option<Arc<dyn Generator>>,
}

pub struct CloudSlot {
    primary: Arc<dyn Generator>,
    overlay: Mutex<Overlay>,
}

impl CloudSlot {
    pub fn new(primary: Arc<dyn Generator>) -> Self {
        Self {
            primary,
            overlay: Mutex::new(Overlay {
                swaps: 0,
                active: None,
            }),
        }
    }

    /// The backend calls should go to right now
    pub fn current(&self) -> Arc<dyn Generator> {
        let overlay = self.overlay.lock();
        match &overlay.active {
            Some(alternate) => Arc::clone(alternate),
            None => Arc::clone(&self.primary),
        }
    }

    pub fn is_swapped(&self) -> bool {
        self.overlay.lock().active.is_some()
    }

    /// Route to `alternate` until the returned guard drops. Overlapping
    /// swaps nest; the primary returns when the last guard goes.
    pub fn swap_to(&self, alternate: Arc<dyn Generator>) -> SwapGuard<'_> {
        let mut overlay = self.overlay.lock();
        overlay.swaps += 1;
        info!(from = self.primary.name(), to = alternate.name(), "Swapped cloud backend");
        overlay.active = Some(alternate);
        SwapGuard { slot: self }
    }
}

#[must_use = "the swap ends when the guard drops"]
pub struct SwapGuard<'a> {
    slot: &'a CloudSlot,
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        let mut overlay = self.slot.overlay.lock();
        overlay.swaps = overlay.swaps.saturating_sub(1);
        if overlay.swaps == 0 {
            overlay.active = None;
            info!(backend = self.slot.primary.name(), "Restored cloud backend");
        }
    }
}
