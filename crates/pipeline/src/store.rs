//! Table of active and recently finished executions, keyed by workflow id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{future, stream, Stream, StreamExt};
use tokio::sync::RwLock;
use tumbler_core::error::CoreError;
use tumbler_core::path::JobPath;
use tumbler_core::state::ExecutionState;
use tumbler_core::types::{Timestamp, WorkflowId};
use tumbler_events::EventBus;

use crate::execution::{Execution, ExecutionHandle, ExecutionSummary, DEFAULT_OUTPUT_LIMIT};

/// How long finished executions stay queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Terminal executions older than this are evicted.
    pub retain_for: chrono::Duration,
    /// Upper bound on retained terminal executions; the oldest go first.
    pub max_retained: usize,
}

/// Optional criteria for [`ExecutionStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Match this path or anything below it.
    pub path: Option<JobPath>,
    pub state: Option<ExecutionState>,
}

impl ExecutionFilter {
    pub fn matches(&self, summary: &ExecutionSummary) -> bool {
        let path_ok = self.path.as_ref().map_or(true, |p| {
            summary.job_path == *p || summary.job_path.is_descendant_of(p)
        });
        let state_ok = self.state.map_or(true, |s| summary.state == s);
        path_ok && state_ok
    }
}

pub struct ExecutionStore {
    executions: RwLock<HashMap<WorkflowId, Arc<ExecutionHandle>>>,
    bus: Arc<EventBus>,
    output_limit: usize,
}

impl ExecutionStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            bus,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Output events kept per execution created by this store.
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Create a `Pending` execution for `job_path` under a fresh id and open
    /// its bus topic.
    pub async fn create(&self, job_path: JobPath) -> Arc<ExecutionHandle> {
        let mut executions = self.executions.write().await;

        let mut workflow_id = WorkflowId::new();
        while executions.contains_key(&workflow_id) || !self.bus.open(workflow_id) {
            workflow_id = WorkflowId::new();
        }

        let handle = Arc::new(
            ExecutionHandle::new(workflow_id, job_path, Arc::clone(&self.bus))
                .with_output_limit(self.output_limit),
        );
        executions.insert(workflow_id, Arc::clone(&handle));

        tracing::debug!(
            %workflow_id,
            path = %handle.job_path(),
            "Execution created",
        );
        handle
    }

    pub async fn handle(&self, workflow_id: &WorkflowId) -> Result<Arc<ExecutionHandle>, CoreError> {
        self.executions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Execution", workflow_id))
    }

    /// Snapshot of one execution, history included.
    pub async fn get(&self, workflow_id: &WorkflowId) -> Result<Execution, CoreError> {
        Ok(self.handle(workflow_id).await?.snapshot())
    }

    /// Summaries matching `filter`, newest first.
    ///
    /// The handle set is captured at call time; each summary is read lazily
    /// as the stream is polled.
    pub async fn list(&self, filter: ExecutionFilter) -> impl Stream<Item = ExecutionSummary> {
        let mut handles: Vec<Arc<ExecutionHandle>> =
            self.executions.read().await.values().cloned().collect();
        // v7 ids sort by creation time.
        handles.sort_by(|a, b| b.workflow_id().cmp(&a.workflow_id()));

        stream::iter(handles).filter_map(move |handle| {
            let summary = handle.summary();
            future::ready(filter.matches(&summary).then_some(summary))
        })
    }

    /// Most recent execution of exactly `job_path`.
    pub async fn latest_for_path(&self, job_path: &JobPath) -> Option<ExecutionSummary> {
        self.executions
            .read()
            .await
            .values()
            .filter(|h| h.job_path() == job_path)
            .max_by_key(|h| h.workflow_id())
            .map(|h| h.summary())
    }

    /// Most recent execution a definition at `job_path` may have produced.
    ///
    /// A wildcard path (`team/service/*`) matches every run strictly below
    /// its prefix; any other path matches itself only.
    pub async fn latest_matching(&self, job_path: &JobPath) -> Option<ExecutionSummary> {
        let Some(prefix) = job_path.parent().filter(|_| job_path.is_wildcard()) else {
            return self.latest_for_path(job_path).await;
        };
        self.executions
            .read()
            .await
            .values()
            .filter(|h| h.job_path().is_descendant_of(&prefix))
            .max_by_key(|h| h.workflow_id())
            .map(|h| h.summary())
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }

    /// Drop terminal executions per `policy` and retire their bus topics.
    ///
    /// Active executions are never evicted. Returns how many were removed.
    pub async fn evict(&self, policy: &RetentionPolicy, now: Timestamp) -> usize {
        let cutoff = now - policy.retain_for;
        let mut executions = self.executions.write().await;

        let mut finished: Vec<(Timestamp, WorkflowId)> = executions
            .iter()
            .filter_map(|(id, h)| h.ended_at().map(|ended| (ended, *id)))
            .collect();
        finished.sort();

        let overflow = finished.len().saturating_sub(policy.max_retained);
        let expired: Vec<WorkflowId> = finished
            .iter()
            .enumerate()
            .filter(|(i, (ended, _))| *i < overflow || *ended < cutoff)
            .map(|(_, (_, id))| *id)
            .collect();

        for id in &expired {
            executions.remove(id);
            self.bus.retire(id);
        }

        if !expired.is_empty() {
            tracing::debug!(
                evicted = expired.len(),
                remaining = executions.len(),
                "Executions evicted",
            );
        }
        expired.len()
    }
}
