//! Fans inbound stanzas out to collectors and listeners.
//!
//! `dispatch` is only ever called from the connection's reader task, so all
//! consumers observe stanzas in wire order. Collectors are offered each
//! stanza first, in registration order. Unless an exclusive collector took
//! it, the stanza is then queued for every matching asynchronous listener and
//! finally handed to the synchronous listeners before the next stanza is read.
//!
//! Outgoing stanzas pass through the interceptors on the writer task before
//! they are serialized; sending listeners see them once they are written.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::collector::{CollectorConfig, CollectorTable, ReplyCollector};
use crate::config::DEFAULT_LISTENER_QUEUE_CAPACITY;
use crate::error::ConnectionError;
use crate::filter::StanzaFilter;
use crate::stanza::Stanza;

pub type ListenerId = u64;

/// Runs on the reader task; blocks delivery of the next stanza while it runs.
pub trait StanzaListener: Send + Sync {
    fn on_stanza(&self, stanza: &Arc<Stanza>);
}

impl<F> StanzaListener for F
where
    F: Fn(&Arc<Stanza>) + Send + Sync,
{
    fn on_stanza(&self, stanza: &Arc<Stanza>) {
        self(stanza)
    }
}

/// Runs on its own task, receiving stanzas one at a time in wire order.
#[async_trait]
pub trait AsyncStanzaListener: Send + Sync {
    async fn on_stanza(&self, stanza: Arc<Stanza>);
}

#[async_trait]
impl<F, Fut> AsyncStanzaListener for F
where
    F: Fn(Arc<Stanza>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_stanza(&self, stanza: Arc<Stanza>) {
        self(stanza).await
    }
}

/// Runs on the writer task and may modify a stanza before it is serialized.
pub trait StanzaInterceptor: Send + Sync {
    fn intercept(&self, stanza: &mut Stanza);
}

impl<F> StanzaInterceptor for F
where
    F: Fn(&mut Stanza) + Send + Sync,
{
    fn intercept(&self, stanza: &mut Stanza) {
        self(stanza)
    }
}

struct InterceptorEntry {
    id: ListenerId,
    filter: Arc<dyn StanzaFilter>,
    interceptor: Arc<dyn StanzaInterceptor>,
}

struct SyncEntry {
    id: ListenerId,
    filter: Box<dyn StanzaFilter>,
    listener: Arc<dyn StanzaListener>,
}

struct AsyncEntry {
    id: ListenerId,
    filter: Box<dyn StanzaFilter>,
    queue: mpsc::Sender<Arc<Stanza>>,
}

pub struct StanzaRouter {
    collectors: Arc<CollectorTable>,
    sync_listeners: RwLock<Vec<SyncEntry>>,
    async_listeners: RwLock<Vec<AsyncEntry>>,
    interceptors: RwLock<Vec<InterceptorEntry>>,
    sending_listeners: RwLock<Vec<SyncEntry>>,
    listener_capacity: usize,
    next_listener_id: AtomicU64,
}

impl Default for StanzaRouter {
    fn default() -> Self {
        Self::with_listener_capacity(DEFAULT_LISTENER_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for StanzaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaRouter")
            .field("collectors", &self.collectors.len())
            .finish_non_exhaustive()
    }
}

impl StanzaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the backlog of each asynchronous listener; stanzas arriving
    /// while a listener's queue is full are dropped for that listener.
    pub fn with_listener_capacity(capacity: usize) -> Self {
        Self {
            collectors: Arc::default(),
            sync_listeners: RwLock::default(),
            async_listeners: RwLock::default(),
            interceptors: RwLock::default(),
            sending_listeners: RwLock::default(),
            listener_capacity: capacity.max(1),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn create_collector(
        &self,
        filter: impl StanzaFilter + 'static,
        config: CollectorConfig,
    ) -> ReplyCollector {
        self.collectors.register(Box::new(filter), config)
    }

    pub fn add_sync_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        listener: impl StanzaListener + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.sync_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SyncEntry {
                id,
                filter: Box::new(filter),
                listener: Arc::new(listener),
            });
        id
    }

    /// Registers a listener served by its own task. Must be called within a
    /// Tokio runtime.
    pub fn add_async_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        listener: impl AsyncStanzaListener + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (queue, mut inbox) = mpsc::channel::<Arc<Stanza>>(self.listener_capacity);
        tokio::spawn(async move {
            while let Some(stanza) = inbox.recv().await {
                listener.on_stanza(stanza).await;
            }
            trace!(listener = id, "async listener stopped");
        });

        self.async_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AsyncEntry {
                id,
                filter: Box::new(filter),
                queue,
            });
        id
    }

    pub fn add_outgoing_interceptor(
        &self,
        filter: impl StanzaFilter + 'static,
        interceptor: impl StanzaInterceptor + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(InterceptorEntry {
                id,
                filter: Arc::new(filter),
                interceptor: Arc::new(interceptor),
            });
        id
    }

    /// Registers a listener called on the writer task after a stanza is written.
    pub fn add_sending_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        listener: impl StanzaListener + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.sending_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SyncEntry {
                id,
                filter: Box::new(filter),
                listener: Arc::new(listener),
            });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut removed = false;
        let mut matches = |entry_id: ListenerId| {
            let keep = entry_id != id;
            removed |= !keep;
            keep
        };
        self.sync_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| matches(entry.id));
        self.async_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| matches(entry.id));
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| matches(entry.id));
        self.sending_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| matches(entry.id));
        removed
    }

    /// Runs every matching interceptor, in registration order, on an outgoing stanza.
    pub fn intercept_outgoing(&self, stanza: &mut Stanza) {
        let interceptors: Vec<(Arc<dyn StanzaFilter>, Arc<dyn StanzaInterceptor>)> = self
            .interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (Arc::clone(&entry.filter), Arc::clone(&entry.interceptor)))
            .collect();
        for (filter, interceptor) in interceptors {
            if filter.accept(stanza) {
                interceptor.intercept(stanza);
            }
        }
    }

    pub fn notify_sent(&self, stanza: &Arc<Stanza>) {
        let listeners: Vec<Arc<dyn StanzaListener>> = self
            .sending_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.filter.accept(stanza))
            .map(|entry| Arc::clone(&entry.listener))
            .collect();
        for listener in listeners {
            listener.on_stanza(stanza);
        }
    }

    pub fn dispatch(&self, stanza: Arc<Stanza>) {
        if self.collectors.offer(&stanza) {
            trace!(id = ?stanza.id(), "stanza claimed by exclusive collector");
            return;
        }

        for entry in self
            .async_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.filter.accept(&stanza))
        {
            match entry.queue.try_send(Arc::clone(&stanza)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(listener = entry.id, "async listener queue full, dropping stanza");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        let sync_listeners: Vec<Arc<dyn StanzaListener>> = self
            .sync_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.filter.accept(&stanza))
            .map(|entry| Arc::clone(&entry.listener))
            .collect();
        for listener in sync_listeners {
            listener.on_stanza(&stanza);
        }
    }

    /// Wakes every pending collector with `error`.
    pub fn fail_all(&self, error: &ConnectionError) {
        self.collectors.fail_all(error);
    }

    pub fn pending_collectors(&self) -> usize {
        self.collectors.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::filter::{AcceptAll, StanzaIdFilter};
    use crate::stanza::{Message, MessageType};

    fn message(id: &str) -> Arc<Stanza> {
        let mut message = Message::new(MessageType::Chat);
        message.envelope.id = Some(id.to_string());
        Arc::new(message.into())
    }

    fn ids(log: &Mutex<Vec<String>>) -> Vec<String> {
        log.lock().expect("log lock").clone()
    }

    #[tokio::test]
    async fn sync_listeners_see_stanzas_in_wire_order() {
        let router = StanzaRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        router.add_sync_listener(AcceptAll, move |stanza: &Arc<Stanza>| {
            sink.lock()
                .expect("log lock")
                .push(stanza.id().unwrap_or_default().to_string());
        });

        for id in ["a", "b", "c"] {
            router.dispatch(message(id));
        }

        assert_eq!(ids(&log), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn async_listener_preserves_order_per_listener() {
        let router = StanzaRouter::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        router.add_async_listener(AcceptAll, move |stanza: Arc<Stanza>| {
            let done_tx = done_tx.clone();
            async move {
                if stanza.id() == Some("first") {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                let _ = done_tx.send(stanza.id().unwrap_or_default().to_string());
            }
        });

        router.dispatch(message("first"));
        router.dispatch(message("second"));

        assert_eq!(done_rx.recv().await.as_deref(), Some("first"));
        assert_eq!(done_rx.recv().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn exclusive_collector_hides_stanza_from_listeners() {
        let router = StanzaRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        router.add_sync_listener(AcceptAll, move |stanza: &Arc<Stanza>| {
            sink.lock()
                .expect("log lock")
                .push(stanza.id().unwrap_or_default().to_string());
        });

        let mut collector =
            router.create_collector(StanzaIdFilter::new("reply"), CollectorConfig::single_reply("reply"));
        router.dispatch(message("reply"));
        router.dispatch(message("other"));

        let reply = collector
            .next_result(Duration::from_secs(1))
            .await
            .expect("collector receives its reply");
        assert_eq!(reply.id(), Some("reply"));
        assert_eq!(ids(&log), vec!["other"]);
    }

    #[tokio::test]
    async fn collectors_are_offered_stanzas_before_listeners() {
        let router = StanzaRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let collector_log = Arc::clone(&log);
        let mut collector = router.create_collector(
            move |_: &Stanza| {
                collector_log.lock().expect("log lock").push("collector".to_string());
                true
            },
            CollectorConfig::default(),
        );
        let listener_log = Arc::clone(&log);
        router.add_sync_listener(AcceptAll, move |_: &Arc<Stanza>| {
            listener_log.lock().expect("log lock").push("listener".to_string());
        });

        router.dispatch(message("m1"));

        assert_eq!(ids(&log), vec!["collector", "listener"]);
        assert!(collector.poll_result().is_some());
    }

    #[tokio::test]
    async fn removed_listener_stops_receiving() {
        let router = StanzaRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let id = router.add_sync_listener(AcceptAll, move |stanza: &Arc<Stanza>| {
            sink.lock()
                .expect("log lock")
                .push(stanza.id().unwrap_or_default().to_string());
        });

        router.dispatch(message("before"));
        assert!(router.remove_listener(id));
        assert!(!router.remove_listener(id));
        router.dispatch(message("after"));

        assert_eq!(ids(&log), vec!["before"]);
    }

    #[traced_test]
    #[tokio::test]
    async fn full_async_listener_queue_drops_newest_stanzas() {
        let router = StanzaRouter::with_listener_capacity(2);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        router.add_async_listener(AcceptAll, move |stanza: Arc<Stanza>| {
            let done_tx = done_tx.clone();
            async move {
                let _ = done_tx.send(stanza.id().unwrap_or_default().to_string());
            }
        });

        // The listener task cannot run until this test yields.
        for id in ["a", "b", "c", "d", "e"] {
            router.dispatch(message(id));
        }
        assert_eq!(done_rx.recv().await.as_deref(), Some("a"));
        assert_eq!(done_rx.recv().await.as_deref(), Some("b"));

        router.dispatch(message("f"));
        assert_eq!(done_rx.recv().await.as_deref(), Some("f"));
        assert!(done_rx.try_recv().is_err());
        assert!(logs_contain("async listener queue full, dropping stanza"));
    }

    #[tokio::test]
    async fn interceptors_modify_matching_outgoing_stanzas_in_order() {
        let router = StanzaRouter::new();
        router.add_outgoing_interceptor(AcceptAll, |stanza: &mut Stanza| {
            if let Stanza::Message(message) = stanza {
                message.body = Some("intercepted".to_string());
            }
        });
        router.add_outgoing_interceptor(StanzaIdFilter::new("m1"), |stanza: &mut Stanza| {
            if let Stanza::Message(message) = stanza {
                message.subject = Some("first".to_string());
            }
        });

        let mut first: Stanza = Message::new(MessageType::Chat).into();
        first.envelope_mut().id = Some("m1".to_string());
        let mut second: Stanza = Message::new(MessageType::Chat).into();
        second.envelope_mut().id = Some("m2".to_string());
        router.intercept_outgoing(&mut first);
        router.intercept_outgoing(&mut second);

        let (Stanza::Message(first), Stanza::Message(second)) = (first, second) else {
            panic!("interceptors keep the stanza kind");
        };
        assert_eq!(first.body.as_deref(), Some("intercepted"));
        assert_eq!(first.subject.as_deref(), Some("first"));
        assert_eq!(second.body.as_deref(), Some("intercepted"));
        assert_eq!(second.subject, None);
    }

    #[tokio::test]
    async fn sending_listeners_can_be_removed() {
        let router = StanzaRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let id = router.add_sending_listener(AcceptAll, move |stanza: &Arc<Stanza>| {
            sink.lock()
                .expect("log lock")
                .push(stanza.id().unwrap_or_default().to_string());
        });

        router.notify_sent(&message("sent"));
        // Inbound dispatch never reaches sending listeners.
        router.dispatch(message("received"));
        assert!(router.remove_listener(id));
        router.notify_sent(&message("after"));

        assert_eq!(ids(&log), vec!["sent"]);
    }
}
