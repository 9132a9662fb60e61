use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Proof of being the only writer of some shared value.
///
/// Dropping the claim allows a new writer to be claimed.
pub(crate) struct WriterClaim {
    claimed: Arc<AtomicBool>,
}

impl WriterClaim {
    pub(crate) fn try_claim(claimed: &Arc<AtomicBool>) -> Option<Self> {
        claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                claimed: claimed.clone(),
            })
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        self.claimed.store(false, Ordering::Release);
    }
}
