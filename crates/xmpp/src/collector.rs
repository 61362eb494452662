//! Awaitable handles that pick matching stanzas off the inbound stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::filter::StanzaFilter;
use crate::stanza::{Stanza, StanzaError, StanzaErrorCondition, StanzaErrorType};

pub const DEFAULT_COLLECTOR_CAPACITY: usize = 5000;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Queued stanzas kept for a multi-shot collector before new ones are dropped.
    pub capacity: usize,
    /// Stop collecting after the first match.
    pub single_shot: bool,
    /// A matched stanza is not passed on to listeners.
    pub exclusive: bool,
    /// Name used in timeouts and logs.
    pub label: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_COLLECTOR_CAPACITY,
            single_shot: false,
            exclusive: false,
            label: None,
        }
    }
}

impl CollectorConfig {
    /// Waits for exactly one reply, which listeners will not see.
    pub fn single_reply(label: impl Into<String>) -> Self {
        Self {
            capacity: 1,
            single_shot: true,
            exclusive: true,
            label: Some(label.into()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

struct CollectorSlot {
    id: u64,
    label: String,
    filter: Box<dyn StanzaFilter>,
    sender: mpsc::Sender<Arc<Stanza>>,
    termination: Arc<OnceLock<ConnectionError>>,
    single_shot: bool,
    exclusive: bool,
}

/// Live collectors in registration order.
#[derive(Default)]
pub(crate) struct CollectorTable {
    slots: Mutex<Vec<CollectorSlot>>,
    next_id: AtomicU64,
}

impl CollectorTable {
    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<CollectorSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        filter: Box<dyn StanzaFilter>,
        config: CollectorConfig,
    ) -> ReplyCollector {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = config.label.unwrap_or_else(|| format!("collector-{id}"));
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let termination = Arc::new(OnceLock::new());

        self.slots().push(CollectorSlot {
            id,
            label: label.clone(),
            filter,
            sender,
            termination: Arc::clone(&termination),
            single_shot: config.single_shot,
            exclusive: config.exclusive,
        });

        ReplyCollector {
            id,
            label,
            receiver,
            table: Arc::downgrade(self),
            termination,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Offers `stanza` to every collector; returns whether an exclusive one took it.
    pub(crate) fn offer(&self, stanza: &Arc<Stanza>) -> bool {
        let mut claimed = false;
        self.slots().retain(|slot| {
            if !slot.filter.accept(stanza) {
                return true;
            }
            match slot.sender.try_send(Arc::clone(stanza)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(collector = %slot.label, "collector queue full, dropping stanza");
                }
                Err(TrySendError::Closed(_)) => return false,
            }
            claimed |= slot.exclusive;
            !slot.single_shot
        });
        claimed
    }

    fn remove(&self, id: u64) {
        self.slots().retain(|slot| slot.id != id);
    }

    /// Ends every collector with `error`; waiting callers wake immediately.
    pub(crate) fn fail_all(&self, error: &ConnectionError) {
        let slots = std::mem::take(&mut *self.slots());
        if !slots.is_empty() {
            debug!(count = slots.len(), %error, "terminating pending collectors");
        }
        for slot in slots {
            let _ = slot.termination.set(error.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots().len()
    }
}

/// Receives the stanzas accepted by its filter until cancelled or dropped.
///
/// After a single-shot collector delivered its stanza, or after `cancel`,
/// further waits return [`ConnectionError::Cancelled`]. When the connection
/// terminates, waits return the termination error once queued stanzas are
/// drained.
pub struct ReplyCollector {
    id: u64,
    label: String,
    receiver: mpsc::Receiver<Arc<Stanza>>,
    table: Weak<CollectorTable>,
    termination: Arc<OnceLock<ConnectionError>>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for ReplyCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyCollector")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ReplyCollector {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn next_result(&mut self, timeout: Duration) -> Result<Arc<Stanza>, ConnectionError> {
        if self.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }

        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(stanza)) => Ok(stanza),
            Ok(None) => Err(self.closed_reason()),
            Err(_) => Err(ConnectionError::NoResponse {
                id: self.label.clone(),
                timeout,
            }),
        }
    }

    /// Waits for one stanza, cancels the collector, and maps error stanzas
    /// to [`ConnectionError::Stanza`].
    pub async fn next_result_or_error(
        &mut self,
        timeout: Duration,
    ) -> Result<Arc<Stanza>, ConnectionError> {
        let result = self.next_result(timeout).await;
        self.cancel();

        let stanza = result?;
        if stanza.is_error() {
            let error = stanza.error().cloned().unwrap_or_else(|| {
                StanzaError::new(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::UndefinedCondition,
                )
            });
            return Err(ConnectionError::Stanza(error));
        }
        Ok(stanza)
    }

    /// Next queued stanza without waiting.
    pub fn poll_result(&mut self) -> Option<Arc<Stanza>> {
        if self.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Stops collecting. Calling it again has no effect.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }

    fn closed_reason(&self) -> ConnectionError {
        self.termination
            .get()
            .cloned()
            .unwrap_or(ConnectionError::Cancelled)
    }
}

impl Drop for ReplyCollector {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::time::Instant;

    use super::*;
    use crate::filter::{AcceptAll, StanzaIdFilter};
    use crate::stanza::{Iq, IqType, Message, MessageType};

    fn message(id: &str) -> Arc<Stanza> {
        let mut message = Message::new(MessageType::Chat);
        message.envelope.id = Some(id.to_string());
        Arc::new(message.into())
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn times_out_with_no_response() {
        let table = Arc::new(CollectorTable::default());
        let mut collector = table.register(
            Box::new(StanzaIdFilter::new("q1")),
            CollectorConfig::single_reply("q1"),
        );

        let result = collector.next_result(Duration::from_secs(5)).await;
        assert_matches!(result, Err(ConnectionError::NoResponse { ref id, .. }) if id == "q1");
        assert_eq!(table.len(), 1, "a timed out wait does not cancel");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let table = Arc::new(CollectorTable::default());
        let mut collector = table.register(Box::new(AcceptAll), CollectorConfig::default());

        collector.cancel();
        collector.cancel();

        assert!(collector.is_cancelled());
        assert_eq!(table.len(), 0);
        assert_matches!(
            collector.next_result(Duration::from_secs(1)).await,
            Err(ConnectionError::Cancelled)
        );
        assert!(!table.offer(&message("late")));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn termination_wakes_waiting_collector_promptly() {
        let table = Arc::new(CollectorTable::default());
        let mut collector = table.register(Box::new(AcceptAll), CollectorConfig::default());

        let started = Instant::now();
        let waiter = tokio::spawn(async move { collector.next_result(Duration::from_secs(60)).await });
        tokio::task::yield_now().await;

        table.fail_all(&ConnectionError::NotConnected);
        let result = waiter.await.expect("waiter task should not panic");

        assert_matches!(result, Err(ConnectionError::NotConnected));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn single_shot_collector_is_removed_after_first_match() {
        let table = Arc::new(CollectorTable::default());
        let mut collector = table.register(
            Box::new(StanzaIdFilter::new("m1")),
            CollectorConfig::single_reply("m1"),
        );

        assert!(table.offer(&message("m1")));
        assert_eq!(table.len(), 0);
        assert!(!table.offer(&message("m1")));

        let first = collector
            .next_result(Duration::from_secs(1))
            .await
            .expect("first match is delivered");
        assert_eq!(first.id(), Some("m1"));
        assert_matches!(
            collector.next_result(Duration::from_secs(1)).await,
            Err(ConnectionError::Cancelled)
        );
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let table = Arc::new(CollectorTable::default());
        let mut collector = table.register(
            Box::new(AcceptAll),
            CollectorConfig::default().with_capacity(1),
        );

        table.offer(&message("first"));
        table.offer(&message("second"));

        assert_eq!(
            collector.poll_result().and_then(|stanza| stanza.id().map(str::to_string)),
            Some("first".to_string())
        );
        assert!(collector.poll_result().is_none());
    }

    #[tokio::test]
    async fn error_reply_maps_to_stanza_error() {
        let table = Arc::new(CollectorTable::default());
        let mut collector = table.register(
            Box::new(StanzaIdFilter::new("q1")),
            CollectorConfig::single_reply("q1"),
        );

        let mut iq = Iq::new(IqType::Error);
        iq.envelope.id = Some("q1".to_string());
        iq.envelope.error = Some(StanzaError::service_unavailable());
        table.offer(&Arc::new(iq.into()));

        assert_matches!(
            collector.next_result_or_error(Duration::from_secs(1)).await,
            Err(ConnectionError::Stanza(StanzaError {
                condition: StanzaErrorCondition::ServiceUnavailable,
                ..
            }))
        );
        assert!(collector.is_cancelled());
    }

    #[test]
    fn dropping_collector_unregisters_it() {
        let table = Arc::new(CollectorTable::default());
        let collector = table.register(Box::new(AcceptAll), CollectorConfig::default());
        assert_eq!(table.len(), 1);
        drop(collector);
        assert_eq!(table.len(), 0);
    }
}
