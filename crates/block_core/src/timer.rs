//! Abort signalling and the wall-clock countdown of timed play.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::events::{Event, EventBus};

/// Fires once to stop an in-flight run at its next suspension point.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted. Pends forever if the handle is gone without firing.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Countdown that fires an [`AbortSignal`] and publishes [`Event::TimeExpired`]
/// when it reaches zero.
#[derive(Debug)]
pub struct Countdown {
    deadline: Instant,
    task: JoinHandle<()>,
}

impl Countdown {
    pub fn start(duration: Duration, bus: EventBus) -> (Self, AbortSignal) {
        let (handle, signal) = abort_pair();
        let deadline = Instant::now() + duration;
        let task = tokio::spawn(async move {
            sleep(duration).await;
            handle.abort();
            bus.publish(Event::TimeExpired);
            tracing::info!("countdown expired");
        });
        (Self { deadline, task }, signal)
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn countdown_fires_signal() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let (countdown, mut signal) = Countdown::start(Duration::from_secs(60), bus);
        assert!(!signal.is_aborted());
        signal.aborted().await;
        assert!(signal.is_aborted());
        assert_eq!(countdown.remaining(), Duration::ZERO);
        assert_eq!(rx.recv().await.expect("event"), Event::TimeExpired);
    }

    #[tokio::test]
    async fn handle_aborts_signal() {
        let (handle, signal) = abort_pair();
        handle.abort();
        assert!(signal.is_aborted());
    }
}
