//! Online/offline signal shared between the platform and the orchestrator.

use tokio::sync::watch;

/// Create a connectivity pair starting at `online`.
pub fn connectivity(online: bool) -> (ConnectivityHandle, ConnectivitySignal) {
    let (tx, rx) = watch::channel(online);
    (ConnectivityHandle { tx }, ConnectivitySignal { rx })
}

/// Writer side, owned by whatever observes the network
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

impl ConnectivityHandle {
    /// Publish a new state; repeated values do not wake listeners.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ConnectivitySignal {
        ConnectivitySignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    rx: watch::Receiver<bool>,
}

impl ConnectivitySignal {
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next transition and return the new state.
    ///
    /// Returns `None` once every handle is dropped.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
