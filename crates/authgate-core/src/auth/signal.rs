use tokio::sync::broadcast;
use tracing::info;

/// Capacity of the signed-out channel. Consumers only care that the event
/// happened, so lagging receivers losing duplicates is harmless.
const SIGNAL_CAPACITY: usize = 16;

/// Event: the session is over and the user must sign in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedOut;

/// Broadcasts `SignedOut` to whoever is listening (navigation, background
/// pollers). Clone is cheap and every clone feeds the same subscribers.
#[derive(Clone)]
pub struct SessionSignal {
    sender: broadcast::Sender<SignedOut>,
}

impl SessionSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignedOut> {
        self.sender.subscribe()
    }

    pub fn emit(&self) {
        // An error only means nobody is subscribed
        let receivers = self.sender.send(SignedOut).unwrap_or(0);
        info!(receivers, "Signed-out signal emitted");
    }
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}
