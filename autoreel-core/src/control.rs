use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Cooperative control requested for an in-flight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Continue,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stop requested")]
pub struct Cancelled;

/// Owner side of a run's control channel.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<RunSignal>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunSignal::Continue);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> ControlSignal {
        ControlSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> RunSignal {
        *self.tx.borrow()
    }

    pub fn request_pause(&self) {
        // Stop always wins over a later pause.
        if self.current() != RunSignal::Stop {
            self.tx.send_replace(RunSignal::Pause);
        }
    }

    pub fn request_stop(&self) {
        self.tx.send_replace(RunSignal::Stop);
    }
}

/// Observer side, handed to stages, providers and waits.
///
/// Pause is only honoured at stage boundaries. Stop is honoured there and
/// inside every bounded wait that goes through [`ControlSignal::sleep`].
#[derive(Debug, Clone)]
pub struct ControlSignal {
    rx: watch::Receiver<RunSignal>,
}

impl ControlSignal {
    /// A signal with no controller; it never requests a stop.
    pub fn detached() -> Self {
        RunControl::new().signal()
    }

    pub fn current(&self) -> RunSignal {
        *self.rx.borrow()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.current() == RunSignal::Stop
    }

    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_stop_requested() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, returning early with [`Cancelled`] as soon as a
    /// stop is requested.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.checkpoint()?;
        let mut rx = self.rx.clone();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Controller dropped: nobody can request a stop anymore.
                        (&mut deadline).await;
                        return Ok(());
                    }
                    if *rx.borrow() == RunSignal::Stop {
                        return Err(Cancelled);
                    }
                }
            }
        }
    }
}
