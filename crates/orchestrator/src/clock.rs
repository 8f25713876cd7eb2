#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Time source for the orchestrator. Delays in the publish/verify loop and
/// the pool timers go through this trait so tests can run without sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that never sleeps but records every requested delay. Test helper.
#[derive(Debug, Default)]
pub struct InstantClock {
    slept: std::sync::Mutex<Vec<Duration>>,
}

impl InstantClock {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().expect("clock lock").clone()
    }
}

#[async_trait]
impl Clock for InstantClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        self.slept.lock().expect("clock lock").push(duration);
    }
}
