// Time source and cancellable ticker for the engine loops

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the epoch
    fn now_ms(&self) -> i64;

    async fn sleep(&self, duration: Duration);

    fn now_secs(&self) -> i64 {
        self.now_ms() / 1000
    }
}

/// Wall clock backed by `chrono` and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when told to. Sleepers wake once enough time
/// has been advanced past their deadline.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
    sleepers: AtomicUsize,
    advanced: Notify,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            sleepers: AtomicUsize::new(0),
            advanced: Notify::new(),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms.fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
        self.advanced.notify_waiters();
    }

    /// Number of sleeps currently waiting on this clock
    pub fn pending_sleeps(&self) -> usize {
        self.sleepers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now_ms() + duration.as_millis() as i64;
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        loop {
            // registered before the check so an advance in between is not lost
            let advanced = self.advanced.notified();
            if self.now_ms() >= deadline {
                break;
            }
            advanced.await;
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Fixed-delay ticker that returns early when shutdown is signalled.
pub struct Ticker {
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Ticker {
    pub fn new(clock: Arc<dyn Clock>, period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self { clock, period, shutdown }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait one period. Returns false once shutdown has been requested.
    pub async fn tick(&mut self) -> bool {
        if self.is_shutdown() {
            return false;
        }

        let clock = Arc::clone(&self.clock);
        let period = self.period;
        let sender_alive = tokio::select! {
            _ = clock.sleep(period) => true,
            changed = self.shutdown.changed() => changed.is_ok(),
        };

        sender_alive && !self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_drives_ticker() {
        let clock = Arc::new(ManualClock::new(0));
        let (_tx, rx) = shutdown_channel();
        let mut ticker = Ticker::new(clock.clone(), Duration::from_secs(10), rx);

        let handle = tokio::spawn(async move { ticker.tick().await });
        while clock.pending_sleeps() == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_secs(4));
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        clock.advance(Duration::from_secs(6));
        assert!(handle.await.unwrap());
        assert_eq!(clock.now_secs(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let clock = Arc::new(ManualClock::new(0));
        let (tx, rx) = shutdown_channel();
        let mut ticker = Ticker::new(clock, Duration::from_secs(3600), rx);

        let handle = tokio::spawn(async move { ticker.tick().await });
        tx.send(true).unwrap();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock;
        let before = clock.now_ms();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(clock.now_ms() >= before);
    }
}
