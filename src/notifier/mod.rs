pub mod telegram;

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn icon(&self) -> &'static str {
        match self {
            Severity::Info => "✅",
            Severity::Warning => "⚠️",
            Severity::Error => "🚨",
        }
    }
}

/// Fire-and-forget alert for the notification sinks.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub severity: Severity,
    pub message: String,
}

/// Periodic high-level snapshot, cached by reporters for status queries.
#[derive(Debug, Clone)]
pub struct BotSummary {
    pub name: String,
    pub symbol: String,
    pub last_price: f64,
    pub open_buys: usize,
    pub open_sells: usize,
    pub investment: f64,
    pub max_investment: f64,
    pub amount_per_grid: f64,
    pub surplus_volume: f64,
}

#[derive(Debug, Clone)]
pub enum NotifierEvent {
    StateChange(StateChangeEvent),
    Summary(BotSummary),
}

/// Cloneable handle fanning events out to all subscribed sinks. Sending
/// never blocks and never fails the caller; a sink that lags just misses
/// events.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<NotifierEvent>,
}

impl Notifier {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, severity: Severity, message: impl Into<String>) {
        let _ = self.tx.send(NotifierEvent::StateChange(StateChangeEvent {
            severity,
            message: message.into(),
        }));
    }

    pub fn summary(&self, summary: BotSummary) {
        let _ = self.tx.send(NotifierEvent::Summary(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_without_subscribers_is_a_noop() {
        let notifier = Notifier::new();
        // Must not panic or error even with nobody listening.
        notifier.notify(Severity::Info, "hello");
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.notify(Severity::Warning, "heads up");

        match rx.recv().await.unwrap() {
            NotifierEvent::StateChange(event) => {
                assert_eq!(event.severity, Severity::Warning);
                assert_eq!(event.message, "heads up");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
