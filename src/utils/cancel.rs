use tokio::signal::ctrl_c;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, warn};

/// Fires a [`Cancellation`] once; every clone of the token observes it
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

/// Read side of an external cancellation request (SIGINT/SIGTERM)
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, Cancellation { receiver })
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Receivers may all be gone already, nothing left to stop then
        let _ = self.sender.send(true);
    }
}

impl Cancellation {
    /// A token that is never cancelled
    #[cfg(test)]
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Cancellation { receiver }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Cancel the run on the first SIGINT or SIGTERM
pub fn cancel_on_signals(handle: CancelHandle) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => warn!("Received SIGTERM, aborting the run"),
            _ = ctrl_c() => warn!("Received interrupt, aborting the run"),
        }
        handle.cancel();
    });
}
