use crate::delivery::model::DownloadState;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Single current-value slot with broadcast to any number of observers.
#[derive(Clone)]
pub struct StateChannel {
    current: Arc<Mutex<DownloadState>>,
    tx: broadcast::Sender<DownloadState>,
}

impl StateChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            current: Arc::new(Mutex::new(DownloadState::Idle)),
            tx,
        }
    }

    pub fn current(&self) -> DownloadState {
        self.current.lock().clone()
    }

    /// Replaces the slot and notifies observers. The lock is held across the
    /// send so a concurrent `subscribe` sees either the old value plus this
    /// one, or just this one.
    pub(crate) fn publish(&self, state: DownloadState) {
        let mut cur = self.current.lock();
        *cur = state.clone();
        let _ = self.tx.send(state);
    }

    pub fn subscribe(&self) -> StateSubscription {
        let cur = self.current.lock();
        StateSubscription {
            initial: Some(cur.clone()),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StateChannel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StateSubscription {
    initial: Option<DownloadState>,
    rx: broadcast::Receiver<DownloadState>,
}

impl StateSubscription {
    /// Current value on the first call, then each published transition.
    /// Returns `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<DownloadState> {
        if let Some(s) = self.initial.take() {
            return Some(s);
        }
        loop {
            match self.rx.recv().await {
                Ok(s) => return Some(s),
                // only the latest value is meaningful
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("[STATE] subscriber lagged, skipped {} values", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
