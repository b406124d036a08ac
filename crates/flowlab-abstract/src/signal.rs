use std::sync::Arc;
use tokio::sync::watch;

/// Triggers an [`AbortSignal`]. Cloning shares the same trigger.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observed by the scheduler and sweep runner at every suspension point.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the paired handle aborts; pends forever if the handle is gone.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        let handle_gone = rx.wait_for(|aborted| *aborted).await.is_err();
        if handle_gone {
            std::future::pending::<()>().await;
        }
    }
}
