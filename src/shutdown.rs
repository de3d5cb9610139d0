// Cooperative shutdown.
//
// One ShutdownTrigger is held by whoever owns the process lifecycle; every loop that has to stop
// holds a Shutdown. Loops either check `is_triggered` between steps or race `wait` against their
// current await point.

use tokio::sync::watch;

/// Creates a connected trigger/token pair. The token can be cloned freely.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        log::debug!("Shutdown requested");
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A token that is never triggered.
    pub fn never() -> Shutdown {
        let (_, shutdown) = channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. If the trigger is dropped without firing, this
    /// never resolves.
    pub async fn wait(&mut self) {
        let triggered = self.rx.wait_for(|triggered| *triggered).await.is_ok();
        if !triggered {
            std::future::pending::<()>().await;
        }
    }
}
