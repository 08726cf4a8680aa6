//! # device-events
//!
//! The process-global publish/subscribe bus: dispatches device messages to
//! API consumers, correlates request/response pairs, and never invokes a
//! handler synchronously inside `publish` (spec.md §4.4's core guarantee).
//!
//! Deferred dispatch and cross-task safety come from an internal `mpsc`
//! work queue drained by a single dispatcher task spawned in [`EventPublisher::new`],
//! the same one-task-owns-mutable-state shape `device-session` uses for its
//! connection actor — `publish` only pushes onto the queue and returns,
//! which gives "never synchronous" and "re-entrant publishes are queued and
//! drained after the current publish completes" for free.

mod error;
mod event;

pub use error::EventError;
pub use event::{FilterOptions, PublishMetadata, PublishedEvent};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// A subscriber's handler. Sync and non-blocking by convention — like
/// `device_session::EventHandler`, a handler that needs to do async work
/// spawns its own task rather than holding up the dispatcher.
pub type Handler = Arc<dyn Fn(PublishedEvent, PublishMetadata) + Send + Sync>;

/// Opaque handle returned by [`EventPublisher::subscribe`], used to
/// unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    name_prefix: String,
    filter: FilterOptions,
    subscriber_id: Option<String>,
    handler: Handler,
}

enum WorkItem {
    Publish { event: PublishedEvent, metadata: PublishMetadata },
}

/// Canonical request-variant name for a symbolic event, e.g. `"testEvent"`
/// becomes `"spark/device/req/testEvent"`. Its inverse is never derived
/// automatically — the responder is handed the caller-generated response
/// event name in `context.responseEventName` and publishes directly to it
/// (spec.md §4.4: "the exact string form is not load-bearing provided it is
/// used consistently on both sides").
pub fn get_request_event_name(name: &str) -> String {
    format!("spark/device/req/{name}")
}

/// In-process pub/sub bus. Cheaply `Clone`-able; every clone shares the same
/// subscription registry and dispatcher queue. Construct once at server
/// start and hand clones to every connection task (spec.md §9: "make its
/// lifecycle explicit").
#[derive(Clone)]
pub struct EventPublisher {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
    queue_tx: mpsc::UnboundedSender<WorkItem>,
    response_timeout: Duration,
}

impl EventPublisher {
    /// Construct a new bus and spawn its dispatcher task. The returned
    /// `JoinHandle` resolves once the publisher (and every clone of it) has
    /// been dropped and the queue has drained — await it during shutdown.
    pub fn new(response_timeout: Duration) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let subscriptions: Arc<RwLock<Vec<Subscription>>> = Arc::new(RwLock::new(Vec::new()));

        let dispatcher_subs = subscriptions.clone();
        let handle = tokio::spawn(run_dispatcher(dispatcher_subs, queue_rx));

        (Self { subscriptions, next_id: Arc::new(AtomicU64::new(1)), queue_tx, response_timeout }, handle)
    }

    /// Register `handler` for every event whose name starts with
    /// `name_prefix` (pass the full name for exact-match subscriptions) and
    /// passes `filter`. Returns an id usable with [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        name_prefix: impl Into<String>,
        filter: FilterOptions,
        subscriber_id: Option<String>,
        handler: Handler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().await.push(Subscription {
            id,
            name_prefix: name_prefix.into(),
            filter,
            subscriber_id,
            handler,
        });
        id
    }

    /// Remove a single subscription by id. No-op if already removed.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().await.retain(|s| s.id != id);
    }

    /// Remove every subscription tagged with `subscriber_id` (bulk
    /// unsubscribe referenced but never implemented upstream — see
    /// SPEC_FULL.md §4.4).
    pub async fn unsubscribe_by_subscriber_id(&self, subscriber_id: &str) {
        self.subscriptions.write().await.retain(|s| s.subscriber_id.as_deref() != Some(subscriber_id));
    }

    /// Publish `event`. Returns immediately; matching handlers run later, on
    /// the dispatcher task, in subscription order.
    pub fn publish(&self, mut event: PublishedEvent, metadata: PublishMetadata) {
        event.published_at = chrono::Utc::now();
        // An unbounded channel send only fails if the dispatcher task has
        // already exited, which only happens after every publisher handle
        // (including this one) was dropped — i.e. never, from in here.
        let _ = self.queue_tx.send(WorkItem::Publish { event, metadata });
    }

    /// Publish a request event and wait for a single matching response.
    ///
    /// Generates a unique response event name, subscribes to it once, then
    /// publishes `get_request_event_name(event.name)` with `context`
    /// carrying both the caller's original `context` (under `data`) and the
    /// generated `responseEventName`. Resolves with the response event's
    /// `context` the moment a publish to that name arrives; the one-shot
    /// subscription removes itself either way.
    pub async fn publish_and_listen_for_response(
        &self,
        event: PublishedEvent,
    ) -> Result<Option<serde_json::Value>, EventError> {
        let response_event_name = format!("spark/device/resp/{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));

        let sub_id = self
            .subscribe(
                response_event_name.clone(),
                FilterOptions::new(),
                None,
                Arc::new(move |event, _metadata| {
                    if let Some(tx) = tx.lock().expect("oneshot cell poisoned").take() {
                        let _ = tx.send(event.context);
                    }
                }),
            )
            .await;

        let context = serde_json::json!({
            "data": event.context,
            "responseEventName": response_event_name,
        });
        let request = PublishedEvent { name: get_request_event_name(&event.name), context: Some(context), ..event };
        self.publish(request, PublishMetadata::private());

        let result = tokio::time::timeout(self.response_timeout, rx).await;
        self.unsubscribe(sub_id).await;

        match result {
            Ok(Ok(context)) => Ok(context),
            Ok(Err(_)) | Err(_) => Err(EventError::ResponseTimeout),
        }
    }
}

async fn run_dispatcher(subscriptions: Arc<RwLock<Vec<Subscription>>>, mut queue_rx: mpsc::UnboundedReceiver<WorkItem>) {
    while let Some(item) = queue_rx.recv().await {
        match item {
            WorkItem::Publish { event, metadata } => {
                // Snapshot handlers under the lock, then invoke outside it:
                // a handler that calls `subscribe`/`unsubscribe` (or
                // publishes again) must not deadlock against its own
                // dispatch.
                let matching: Vec<Handler> = {
                    let subs = subscriptions.read().await;
                    subs.iter()
                        .filter(|s| event.name.starts_with(&s.name_prefix) && s.filter.matches(&event, metadata))
                        .map(|s| s.handler.clone())
                        .collect()
                };

                for handler in matching {
                    let event = event.clone();
                    // Per spec.md §7: pub/sub handler exceptions are caught
                    // and logged per-handler, never abort the publish. Rust
                    // has no catchable panics across a plain call, so this
                    // relies on handlers not panicking; a handler that needs
                    // to do fallible work should catch its own errors.
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event, metadata))).is_err() {
                        warn!("pub/sub handler panicked; continuing with remaining subscribers");
                    }
                }
            }
        }
    }
}
