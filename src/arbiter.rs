//! Exclusive ownership of the audio output.
//!
//! Playback must not overlap other users of the speaker (announcements,
//! alerts). The arbitration seam is a trait so the pipeline composes with
//! whatever policy the host system uses; [`SingleOwnerArbiter`] is the
//! in-process policy used when nothing else contends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub trait AudioArbitration: Send + Sync {
    /// Try to take exclusive use of the output for `owner`. Granting is
    /// idempotent for the current owner.
    fn request_exclusive(&self, owner: &str) -> bool;

    /// Give the output back. A release by a non-owner is ignored.
    fn release(&self, owner: &str);
}

/// Single-slot arbiter: whoever holds the slot owns the output.
#[derive(Default)]
pub struct SingleOwnerArbiter {
    owner: Mutex<Option<String>>,
}

impl SingleOwnerArbiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioArbitration for SingleOwnerArbiter {
    fn request_exclusive(&self, owner: &str) -> bool {
        let mut slot = match self.owner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_deref() {
            None => {
                *slot = Some(owner.to_string());
                true
            }
            Some(current) => current == owner,
        }
    }

    fn release(&self, owner: &str) {
        let mut slot = match self.owner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_deref() == Some(owner) {
            *slot = None;
        }
    }
}

/// Held grant with exactly-once release.
///
/// The token is shared between the producer thread (which releases at
/// stream end) and `stop()` (which releases on interrupt); the flag makes
/// whichever path runs second a no-op. Dropping an unreleased token also
/// releases, so an error path cannot leak the grant.
pub struct ArbitrationToken {
    arbiter: Arc<dyn AudioArbitration>,
    owner: String,
    released: AtomicBool,
}

impl ArbitrationToken {
    pub fn new(arbiter: Arc<dyn AudioArbitration>, owner: impl Into<String>) -> Self {
        Self {
            arbiter,
            owner: owner.into(),
            released: AtomicBool::new(false),
        }
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(owner = %self.owner, "releasing audio output");
            self.arbiter.release(&self.owner);
        }
    }
}

impl Drop for ArbitrationToken {
    fn drop(&mut self) {
        self.release();
    }
}
