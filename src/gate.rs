//! Stage gates: counting-semaphore handshake between one producer stage and
//! its consumer, plus the stage lock that serializes buffer access.
//! A consumer reads a stage buffer only after acquiring a permit that was
//! released once the producer's write completed.

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Counting semaphore. Tracks blocked waiters so shutdown can release
/// exactly enough permits to unblock all of them.
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    available: Condvar,
}

struct SemaphoreState {
    permits: usize,
    waiters: usize,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState { permits, waiters: 0 }),
            available: Condvar::new(),
        }
    }

    /// Add `n` permits and wake up to `n` waiters.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.permits += n;
        drop(state);
        for _ in 0..n {
            self.available.notify_one();
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        state.waiters += 1;
        while state.permits == 0 {
            self.available.wait(&mut state);
        }
        state.waiters -= 1;
        state.permits -= 1;
    }

    /// Like `acquire`, but gives up after `timeout`. Returns whether a permit was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        state.waiters += 1;
        let deadline = std::time::Instant::now() + timeout;
        while state.permits == 0 {
            if self.available.wait_until(&mut state, deadline).timed_out() && state.permits == 0 {
                state.waiters -= 1;
                return false;
            }
        }
        state.waiters -= 1;
        state.permits -= 1;
        true
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits == 0 {
            return false;
        }
        state.permits -= 1;
        true
    }

    pub fn permits(&self) -> usize {
        self.state.lock().permits
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Release one permit per currently blocked waiter (at least one).
    /// Returns the number of permits released.
    pub fn unblock_all(&self) -> usize {
        let n = self.waiters().max(1);
        self.release(n);
        n
    }
}

/// Readiness signal between two pipeline stages and the lock guarding the
/// buffers the producer writes and the consumer reads.
pub struct StageGate {
    name: &'static str,
    ready: Semaphore,
    stage_lock: Mutex<()>,
}

impl StageGate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ready: Semaphore::new(0),
            stage_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Producer: one unit of new work is visible.
    pub fn signal(&self) {
        self.ready.release(1);
    }

    /// Consumer: wait for one unit of work. No timeout; shutdown unblocks it.
    pub fn wait(&self) {
        self.ready.acquire();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.ready.acquire_timeout(timeout)
    }

    /// Serialize access to the buffers of this stage.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.stage_lock.lock()
    }

    pub fn pending(&self) -> usize {
        self.ready.permits()
    }

    pub fn waiters(&self) -> usize {
        self.ready.waiters()
    }

    /// Release every blocked consumer.
    pub fn unblock_all(&self) -> usize {
        let released = self.ready.unblock_all();
        tracing::debug!(gate = self.name, released, "gate_unblocked");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn permits_are_counted() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_acquire());
        sem.release(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn acquire_timeout_expires_without_permit() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.acquire_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(sem.waiters(), 0);
    }

    #[test]
    fn unblock_all_releases_every_waiter() {
        let gate = Arc::new(StageGate::new("test"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.wait())
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(2);
        while gate.waiters() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(gate.waiters(), 4);

        assert_eq!(gate.unblock_all(), 4);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.waiters(), 0);
    }
}
