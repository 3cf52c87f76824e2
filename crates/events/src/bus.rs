//! Per-workflow event bus.
//!
//! [`EventBus`] keeps one topic per workflow id. A topic is the append-only
//! log of the workflow's [`StateEvent`]s plus the outbound queues of its
//! current subscribers. It is designed to be shared via `Arc<EventBus>`.
//!
//! Every subscriber owns an unbounded queue, so publishing never waits on a
//! slow consumer and never drops an event for a subscriber that was attached
//! at publish time. The log doubles as the replay buffer for late and
//! reconnecting subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc;
use tumbler_core::error::CoreError;
use tumbler_core::state::StateEvent;
use tumbler_core::types::{SequenceNumber, WorkflowId};

use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Channel sender half feeding one subscriber.
pub(crate) type SubscriberSender = mpsc::UnboundedSender<StateEvent>;

pub(crate) struct Topic {
    workflow_id: WorkflowId,
    inner: Mutex<TopicInner>,
}

#[derive(Default)]
struct TopicInner {
    log: Vec<StateEvent>,
    subscribers: HashMap<u64, SubscriberSender>,
    next_subscriber_id: u64,
}

impl TopicInner {
    /// A topic closes once its terminal event has been appended.
    fn is_closed(&self) -> bool {
        self.log.last().is_some_and(StateEvent::is_terminal)
    }
}

impl Topic {
    fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            inner: Mutex::new(TopicInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `event` to the log and fan it out to every attached subscriber.
    ///
    /// Returns the number of subscribers the event was queued for.
    fn append(&self, event: StateEvent) -> Result<usize, CoreError> {
        let mut inner = self.lock();

        if let Some(last) = inner.log.last().filter(|e| e.is_terminal()) {
            return Err(CoreError::AlreadyTerminal {
                state: last.to_state,
            });
        }

        let expected = inner.log.len() as SequenceNumber;
        if event.sequence_number != expected {
            return Err(CoreError::Internal(format!(
                "Out-of-order event for workflow {}: expected sequence {expected}, got {}",
                self.workflow_id, event.sequence_number
            )));
        }

        let terminal = event.is_terminal();
        inner.log.push(event.clone());

        // Closed receivers belong to subscriptions being torn down.
        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
        let delivered = inner.subscribers.len();

        if terminal {
            // Dropping the senders lets every receiver drain and then end.
            inner.subscribers.clear();
        }

        Ok(delivered)
    }

    /// Attach a subscriber starting at `from`.
    ///
    /// The backlog snapshot and the registration happen under one lock, so
    /// no event can fall between replay and live delivery.
    fn attach(self: &Arc<Self>, from: SequenceNumber) -> Subscription {
        let mut inner = self.lock();

        let start = usize::try_from(from).unwrap_or(usize::MAX).min(inner.log.len());
        let backlog: VecDeque<StateEvent> = inner.log[start..].iter().cloned().collect();

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;

        let live = if inner.is_closed() {
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            inner.subscribers.insert(id, tx);
            Some(rx)
        };

        Subscription::new(
            Arc::clone(self),
            id,
            self.workflow_id,
            from,
            backlog,
            live,
        )
    }

    pub(crate) fn detach(&self, subscriber_id: u64) {
        self.lock().subscribers.remove(&subscriber_id);
    }

    fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn len(&self) -> usize {
        self.lock().log.len()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process, per-workflow fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use tumbler_core::types::WorkflowId;
/// use tumbler_events::EventBus;
///
/// let bus = EventBus::new();
/// let id = WorkflowId::new();
/// bus.open(id);
/// let _subscription = bus.subscribe(id, 0).unwrap();
/// ```
pub struct EventBus {
    topics: RwLock<HashMap<WorkflowId, Arc<Topic>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn topic(&self, workflow_id: &WorkflowId) -> Result<Arc<Topic>, CoreError> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Workflow", workflow_id))
    }

    /// Create the topic for a new workflow. Returns `false` if it already
    /// existed.
    pub fn open(&self, workflow_id: WorkflowId) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(&workflow_id) {
            return false;
        }
        topics.insert(workflow_id, Arc::new(Topic::new(workflow_id)));
        true
    }

    /// Publish an event to its workflow's topic.
    ///
    /// Events must arrive in sequence order; an event for an unknown
    /// workflow fails with `NotFound`, one after the terminal event with
    /// `AlreadyTerminal`.
    pub fn publish(&self, event: StateEvent) -> Result<usize, CoreError> {
        let topic = self.topic(&event.workflow_id)?;
        let sequence = event.sequence_number;
        let delivered = topic.append(event)?;
        tracing::trace!(
            workflow_id = %topic.workflow_id,
            sequence,
            delivered,
            "Event published",
        );
        Ok(delivered)
    }

    /// Subscribe to a workflow, replaying buffered events with
    /// `sequence_number >= from` before switching to live delivery.
    pub fn subscribe(
        &self,
        workflow_id: WorkflowId,
        from: SequenceNumber,
    ) -> Result<Subscription, CoreError> {
        let topic = self.topic(&workflow_id)?;
        let subscription = topic.attach(from);
        tracing::debug!(%workflow_id, from, "Subscriber attached");
        Ok(subscription)
    }

    /// Drop a workflow's topic.
    ///
    /// New subscriptions fail with `NotFound`; subscriptions already open
    /// keep their reference to the topic and finish normally.
    pub fn retire(&self, workflow_id: &WorkflowId) -> bool {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workflow_id)
            .is_some()
    }

    pub fn contains(&self, workflow_id: &WorkflowId) -> bool {
        self.topic(workflow_id).is_ok()
    }

    /// Number of live subscribers attached to a workflow.
    pub fn subscriber_count(&self, workflow_id: &WorkflowId) -> usize {
        self.topic(workflow_id)
            .map(|t| t.subscriber_count())
            .unwrap_or(0)
    }

    /// Number of events buffered for a workflow.
    pub fn buffered(&self, workflow_id: &WorkflowId) -> usize {
        self.topic(workflow_id).map(|t| t.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::{FutureExt, StreamExt};
    use tumbler_core::state::ExecutionState::{self, *};

    use super::*;

    fn event(
        workflow_id: WorkflowId,
        seq: SequenceNumber,
        from: ExecutionState,
        to: ExecutionState,
    ) -> StateEvent {
        StateEvent {
            sequence_number: seq,
            workflow_id,
            from_state: from,
            to_state: to,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({ "seq": seq }),
        }
    }

    /// Publish `Pending->Running`, `outputs` output events, then `Running->Succeeded`.
    fn publish_run(bus: &EventBus, id: WorkflowId, outputs: u64) {
        bus.publish(event(id, 0, Pending, Running)).unwrap();
        for seq in 1..=outputs {
            bus.publish(event(id, seq, Running, Running)).unwrap();
        }
        bus.publish(event(id, outputs + 1, Running, Succeeded))
            .unwrap();
    }

    fn sequences(events: &[StateEvent]) -> Vec<SequenceNumber> {
        events.iter().map(|e| e.sequence_number).collect()
    }

    #[test]
    fn publish_to_unknown_workflow_is_not_found() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        assert_matches!(
            bus.publish(event(id, 0, Pending, Running)),
            Err(CoreError::NotFound { .. })
        );
    }

    #[test]
    fn subscribe_to_unknown_workflow_is_not_found() {
        let bus = EventBus::new();
        assert_matches!(
            bus.subscribe(WorkflowId::new(), 0),
            Err(CoreError::NotFound { .. })
        );
    }

    #[test]
    fn open_is_idempotent() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        assert!(bus.open(id));
        assert!(!bus.open(id));
        assert_eq!(bus.topic_count(), 1);
    }

    #[test]
    fn out_of_order_publish_is_rejected() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);
        assert_matches!(
            bus.publish(event(id, 1, Pending, Running)),
            Err(CoreError::Internal(_))
        );
        assert_eq!(bus.buffered(&id), 0);
    }

    #[test]
    fn publish_after_terminal_is_rejected() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);
        publish_run(&bus, id, 0);
        assert_matches!(
            bus.publish(event(id, 2, Running, Failed)),
            Err(CoreError::AlreadyTerminal { state: Succeeded })
        );
    }

    #[tokio::test]
    async fn live_subscriber_receives_events_in_order_and_stream_ends() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);

        let subscription = bus.subscribe(id, 0).unwrap();
        assert_eq!(bus.subscriber_count(&id), 1);

        publish_run(&bus, id, 2);

        let received: Vec<StateEvent> = subscription.collect().await;
        assert_eq!(sequences(&received), vec![0, 1, 2, 3]);
        assert_eq!(received.last().unwrap().to_state, Succeeded);
    }

    #[tokio::test]
    async fn late_subscriber_replays_full_history_then_closes() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);
        publish_run(&bus, id, 0);

        let subscription = bus.subscribe(id, 0).unwrap();
        // Closed topic: nothing is registered for live delivery.
        assert_eq!(bus.subscriber_count(&id), 0);

        let received: Vec<StateEvent> = subscription.collect().await;
        assert_eq!(sequences(&received), vec![0, 1]);
    }

    #[tokio::test]
    async fn resubscribing_with_same_cursor_yields_same_sequence() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);
        publish_run(&bus, id, 3);

        let first: Vec<StateEvent> = bus.subscribe(id, 2).unwrap().collect().await;
        let second: Vec<StateEvent> = bus.subscribe(id, 2).unwrap().collect().await;
        assert_eq!(first, second);
        assert_eq!(sequences(&first), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn reconnect_resumes_without_gaps_or_duplicates() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);

        bus.publish(event(id, 0, Pending, Running)).unwrap();
        let mut first = bus.subscribe(id, 0).unwrap();
        for seq in 1..=3 {
            bus.publish(event(id, seq, Running, Running)).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(first.next().await.unwrap().sequence_number);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        let last_seen = first.cursor().unwrap();
        drop(first);
        assert_eq!(bus.subscriber_count(&id), 0);

        // Produced while disconnected.
        for seq in 4..=6 {
            bus.publish(event(id, seq, Running, Running)).unwrap();
        }
        let resumed = bus.subscribe(id, last_seen + 1).unwrap();
        bus.publish(event(id, 7, Running, Succeeded)).unwrap();

        let rest: Vec<StateEvent> = resumed.collect().await;
        assert_eq!(sequences(&rest), vec![4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);

        let stalled = bus.subscribe(id, 0).unwrap();
        let fast = bus.subscribe(id, 0).unwrap();

        publish_run(&bus, id, 50);

        let received: Vec<StateEvent> = fast.collect().await;
        assert_eq!(received.len(), 52);

        // The stalled subscriber still has everything queued.
        let backlog: Vec<StateEvent> = stalled.collect().await;
        assert_eq!(sequences(&backlog), (0..52).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cursor_beyond_log_skips_until_reached() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);

        let mut subscription = bus.subscribe(id, 2).unwrap();
        bus.publish(event(id, 0, Pending, Running)).unwrap();
        bus.publish(event(id, 1, Running, Running)).unwrap();
        assert!(subscription.next().now_or_never().is_none());

        bus.publish(event(id, 2, Running, Failed)).unwrap();
        let received: Vec<StateEvent> = subscription.collect().await;
        assert_eq!(sequences(&received), vec![2]);
    }

    #[tokio::test]
    async fn cursor_past_terminal_event_ends_immediately() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);
        publish_run(&bus, id, 0);

        let received: Vec<StateEvent> = bus.subscribe(id, 10).unwrap().collect().await;
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn retired_topic_keeps_open_subscriptions_alive() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);
        publish_run(&bus, id, 1);

        let open = bus.subscribe(id, 0).unwrap();
        assert!(bus.retire(&id));
        assert!(!bus.contains(&id));
        assert_matches!(bus.subscribe(id, 0), Err(CoreError::NotFound { .. }));

        let received: Vec<StateEvent> = open.collect().await;
        assert_eq!(sequences(&received), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn dropping_subscription_detaches_it() {
        let bus = EventBus::new();
        let id = WorkflowId::new();
        bus.open(id);

        let a = bus.subscribe(id, 0).unwrap();
        let _b = bus.subscribe(id, 0).unwrap();
        assert_eq!(bus.subscriber_count(&id), 2);

        drop(a);
        assert_eq!(bus.subscriber_count(&id), 1);
        assert_eq!(bus.publish(event(id, 0, Pending, Running)).unwrap(), 1);
    }
}
