use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot, level-triggered stop signal.
///
/// Once [ShutdownHandle::shutdown] has been called every listener, including ones created
/// afterwards, observes the signal. The runner uses one handle for Ctrl-C, and each shard uses its
/// own handle to be told that the peer said BYE.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(watch::channel(false).0),
        }
    }

    pub fn shutdown(&self) {
        if self.sender.send_replace(true) {
            log::trace!("Shutdown signal was already sent");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn new_listener(&self) -> DelegatedShutdownListener {
        DelegatedShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelegatedShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl DelegatedShutdownListener {
    /// Point in time check if the shutdown signal has been sent. Work should stop at the next
    /// convenient boundary if this returns true.
    pub fn should_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown signal. Returns immediately if it has already been sent. It is safe
    /// to race this with another future so that the signal can cancel other work in progress.
    pub async fn wait_for_shutdown(&mut self) {
        // An error means the handle is gone, which can never signal again.
        let closed = self.receiver.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct ShutdownSignalError {
    msg: String,
}

impl Default for ShutdownSignalError {
    fn default() -> Self {
        Self {
            msg: "Execution cancelled by shutdown signal".to_string(),
        }
    }
}
