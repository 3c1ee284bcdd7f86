use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Count-down start barrier.
///
/// Every card that is not held back counts down once after its `start` call returned. The held
/// back card blocks in [`StartLatch::wait`] until the count reaches zero.
pub struct StartLatch {
    state: Mutex<LatchState>,
    condvar: Condvar,
}

struct LatchState {
    remaining: usize,
    failed: bool,
}

impl StartLatch {
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                remaining: count,
                failed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// `ok = false` records that this card failed to start.
    pub fn count_down(&self, ok: bool) {
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        state.failed |= !ok;
        if state.remaining == 0 {
            self.condvar.notify_all();
        }
    }

    /// Blocks until every card counted down. Returns `true` if all of them started.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.condvar.wait(&mut state);
        }
        !state.failed
    }
}

/// Cooperative cancellation flag, checked by the runner between repetitions.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use crate::utils::*;

    #[test]
    fn latch_releases_after_all_count_down() {
        let latch = Arc::new(StartLatch::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.count_down(true))
            })
            .collect();
        assert!(latch.wait());
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn latch_reports_failure() {
        let latch = StartLatch::new(2);
        latch.count_down(true);
        latch.count_down(false);
        assert!(!latch.wait());
        // Empty latch does not block
        assert!(StartLatch::new(0).wait());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
