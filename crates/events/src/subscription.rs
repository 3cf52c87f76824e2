//! A subscriber's cursor over one workflow topic.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tumbler_core::state::StateEvent;
use tumbler_core::types::{SequenceNumber, WorkflowId};

use crate::bus::Topic;

/// Ordered stream of a workflow's events starting at a requested cursor.
///
/// Yields the replayed backlog first, then live events, each exactly once
/// and with contiguous sequence numbers. The stream ends (returns `None`)
/// on the poll after the terminal event was handed out. Dropping the
/// subscription detaches it from the topic immediately.
pub struct Subscription {
    topic: Arc<Topic>,
    id: u64,
    workflow_id: WorkflowId,
    /// Next sequence number this subscriber expects.
    next: SequenceNumber,
    backlog: VecDeque<StateEvent>,
    live: Option<mpsc::UnboundedReceiver<StateEvent>>,
    delivered: u64,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        topic: Arc<Topic>,
        id: u64,
        workflow_id: WorkflowId,
        from: SequenceNumber,
        backlog: VecDeque<StateEvent>,
        live: Option<mpsc::UnboundedReceiver<StateEvent>>,
    ) -> Self {
        Self {
            topic,
            id,
            workflow_id,
            next: from,
            backlog,
            live,
            delivered: 0,
            finished: false,
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Sequence number of the last event handed out, if any.
    pub fn cursor(&self) -> Option<SequenceNumber> {
        (self.delivered > 0).then(|| self.next - 1)
    }

    /// Whether the terminal event has been delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.live = None;
        self.topic.detach(self.id);
    }
}

impl Stream for Subscription {
    type Item = StateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StateEvent>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            let event = match this.backlog.pop_front() {
                Some(event) => event,
                None => match this.live.as_mut() {
                    Some(rx) => match rx.poll_recv(cx) {
                        Poll::Ready(Some(event)) => event,
                        Poll::Ready(None) => {
                            this.finish();
                            return Poll::Ready(None);
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                    None => {
                        this.finish();
                        return Poll::Ready(None);
                    }
                },
            };

            if event.sequence_number < this.next {
                // Before the requested cursor. A terminal event here means
                // the cursor points past the end of the workflow.
                if event.is_terminal() {
                    this.finish();
                }
                continue;
            }

            this.next = event.sequence_number + 1;
            this.delivered += 1;
            if event.is_terminal() {
                this.finish();
            }
            return Poll::Ready(Some(event));
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("workflow_id", &self.workflow_id)
            .field("next", &self.next)
            .field("backlog", &self.backlog.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topic.detach(self.id);
        tracing::debug!(
            workflow_id = %self.workflow_id,
            delivered = self.delivered,
            finished = self.finished,
            "Subscriber detached",
        );
    }
}
