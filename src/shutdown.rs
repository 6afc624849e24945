// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative stop request. The flag is polled between cycles; the notify
/// wakes a sleeping scheduler right away.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe to call from a signal handler thread.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
        // notify_one() stores a permit if nobody is waiting yet.
        self.wakeup.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Completes once a stop has been requested.
    pub async fn wait(&self) {
        while !self.is_requested() {
            self.wakeup.notified().await;
        }
    }
}

// mod tests.
