//! Session generations: CancellationToken + generation guard.
//! Every session start advances the generation and cancels the previous one,
//! so a stale session task can neither keep running nor clobber the state of
//! a newer session when it finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct SessionGenerations {
    current_token: Mutex<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl SessionGenerations {
    pub fn new() -> Self {
        Self {
            current_token: Mutex::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current session, advance the generation and return a guard for the new one.
    pub fn advance(&self) -> GenerationGuard {
        let mut token_guard = self.current_token.lock();
        token_guard.cancel();
        let token = CancellationToken::new();
        *token_guard = token.clone();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationGuard {
            generation: Arc::clone(&self.generation),
            my_generation: gen,
            token,
        }
    }

    /// Cancel the current session without advancing the generation.
    pub fn cancel_current(&self) {
        self.current_token.lock().cancel();
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for SessionGenerations {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by one session task. Stale once a newer session started.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Not cancelled and still the newest session.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
