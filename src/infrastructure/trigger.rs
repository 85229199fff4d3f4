use tokio::sync::watch;

/// A resettable one-way flag. Used for process shutdown and for cooperative
/// cancellation of a running batch.
#[derive(Clone)]
pub struct Trigger {
    sender: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct TriggerListener {
    receiver: watch::Receiver<bool>,
}

impl Trigger {
    pub fn new() -> (Self, TriggerListener) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, TriggerListener { receiver })
    }

    pub fn subscribe(&self) -> TriggerListener {
        TriggerListener {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn reset(&self) {
        self.sender.send_replace(false);
    }
}

impl TriggerListener {
    /// Resolves once the flag is set. Never resolves if the trigger is dropped unset.
    pub async fn notified(&mut self) {
        if self.receiver.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub fn install_signal_handlers(shutdown: Trigger) {
    let ctrlc = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrlc.trigger();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let term = shutdown.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                term.trigger();
            }
        });
    }
}
