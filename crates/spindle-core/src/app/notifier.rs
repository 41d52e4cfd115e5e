//! Event notifier - lifecycle events を listener に配る
//!
//! # 配送モデル
//! - listener ごとに専用の delivery task と unbounded channel を持つ
//! - publish は channel に積むだけなので、遅い listener が遷移を止めることはない
//! - 1 つの listener への配送は直列（同じジョブのイベント順が保たれる）
//! - listener の失敗・panic はログに残すだけ

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{EventKind, LifecycleEvent, ListenerError};

/// Callback-style subscriber.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError>;
}

/// Which events a subscription wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<Vec<EventKind>>,
    queue: Option<String>,
}

impl EventFilter {
    /// Every event of every queue.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            queue: None,
        }
    }

    /// Restrict to one queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        let kind_ok = self
            .kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&event.kind()));
        let queue_ok = self
            .queue
            .as_deref()
            .is_none_or(|queue| queue == event.queue());
        kind_ok && queue_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

#[derive(Default)]
struct NotifierState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of lifecycle events. Clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventNotifier {
    state: Arc<Mutex<NotifierState>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Each listener gets its own delivery task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<L>(&self, listener: L, filter: EventFilter) -> SubscriptionId
    where
        L: Listener + 'static,
    {
        let (id, mut rx) = self.subscribe_channel(filter);
        let listener = Arc::new(listener);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind();
                let job_id = event.job_id();
                let listener = Arc::clone(&listener);

                // 別 task で呼ぶことで listener の panic をここで止める
                let call = tokio::spawn(async move { listener.on_event(&event).await });
                match call.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(subscription = %id, ?kind, %job_id, error = %err, "listener failed");
                    }
                    Err(err) => {
                        tracing::warn!(subscription = %id, ?kind, %job_id, error = %err, "listener panicked");
                    }
                }
            }
        });

        id
    }

    /// Subscribe with a plain receiver instead of a callback.
    pub fn subscribe_channel(
        &self,
        filter: EventFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, filter, tx });
        (id, rx)
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|subscriber| subscriber.id != id);
        state.subscribers.len() != before
    }

    /// Fire-and-forget delivery to every matching subscriber.
    pub fn publish(&self, event: LifecycleEvent) {
        let mut state = self.lock();
        // Receivers that went away are dropped on the way.
        state.subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(&event) {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobId;
    use std::time::Duration;
    use ulid::Ulid;

    fn failed(queue: &str, job_id: JobId, attempts_made: u32) -> LifecycleEvent {
        LifecycleEvent::Failed {
            queue: queue.to_string(),
            job_id,
            attempts_made,
            reason: "boom".to_string(),
        }
    }

    fn exhausted(queue: &str, job_id: JobId) -> LifecycleEvent {
        LifecycleEvent::RetriesExhausted {
            queue: queue.to_string(),
            job_id,
            attempts_made: 1,
            reason: "boom".to_string(),
        }
    }

    fn job_id() -> JobId {
        JobId::from_ulid(Ulid::new())
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event not delivered in time")
            .expect("channel closed")
    }

    /// Forwards every event into a channel.
    struct Forward(mpsc::UnboundedSender<LifecycleEvent>);

    #[async_trait]
    impl Listener for Forward {
        async fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Listener for Failing {
        async fn on_event(&self, _event: &LifecycleEvent) -> Result<(), ListenerError> {
            Err(ListenerError::new("listener is broken"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Listener for Panicking {
        async fn on_event(&self, _event: &LifecycleEvent) -> Result<(), ListenerError> {
            panic!("listener exploded");
        }
    }

    #[tokio::test]
    async fn listener_sees_events_in_publish_order() {
        let notifier = EventNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.subscribe(Forward(tx), EventFilter::all());

        let id = job_id();
        notifier.publish(failed("queue1", id, 1));
        notifier.publish(exhausted("queue1", id));

        assert_eq!(next(&mut rx).await.kind(), EventKind::Failed);
        assert_eq!(next(&mut rx).await.kind(), EventKind::RetriesExhausted);
    }

    #[tokio::test]
    async fn filters_by_kind_and_queue() {
        let notifier = EventNotifier::new();
        let (_, mut rx) = notifier.subscribe_channel(
            EventFilter::kinds([EventKind::RetriesExhausted]).queue("queue1"),
        );

        let id = job_id();
        notifier.publish(failed("queue1", id, 1));
        notifier.publish(exhausted("other", id));
        notifier.publish(exhausted("queue1", id));

        let event = next(&mut rx).await;
        assert_eq!(event, exhausted("queue1", id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broken_listeners_do_not_affect_others() {
        let notifier = EventNotifier::new();
        notifier.subscribe(Failing, EventFilter::all());
        notifier.subscribe(Panicking, EventFilter::all());
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.subscribe(Forward(tx), EventFilter::all());

        let id = job_id();
        for attempt in 1..=3 {
            notifier.publish(failed("queue1", id, attempt));
        }

        for attempt in 1..=3 {
            assert_eq!(next(&mut rx).await, failed("queue1", id, attempt));
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let notifier = EventNotifier::new();
        let (sub, mut rx) = notifier.subscribe_channel(EventFilter::all());

        assert!(notifier.unsubscribe(sub));
        assert!(!notifier.unsubscribe(sub));
        notifier.publish(failed("queue1", job_id(), 1));

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let notifier = EventNotifier::new();
        let (_, rx) = notifier.subscribe_channel(EventFilter::kinds([EventKind::Completed]));
        drop(rx);

        notifier.publish(failed("queue1", job_id(), 1));
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
