//! The dispatcher: single ingress for every request that needs the brain.
//!
//! Request lifecycle:
//! 1. Triage picks a lane (full lane whenever classification is unavailable)
//! 2. Wait for a slot on that lane, bounded by the request's own deadline
//! 3. Build context (minimal for fast, full for full) and invoke the brain
//!    under the lane timeout, clamped to whatever deadline is left
//! 4. Strip action tags from the reply, spawning delegations and appending
//!    memories
//! 5. Publish `dispatch:completed` or `dispatch:failed`

use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use vigil_config::DispatchConfig;
use vigil_core::brain::{Brain, BrainReply};
use vigil_core::error::{BrainError, DispatchError, TimeoutStage};
use vigil_core::event::{Event, EventBus, EventPattern, SubscriptionId, handler};
use vigil_core::memory::{ContextMode, MemoryEntry, MemoryStore};
use vigil_delegation::{DelegationExecutor, TaskId};

use crate::lane::{Lane, LaneKind, LanePermit, LaneStats};
use crate::tags::{ParsedReply, parse_reply};
use crate::triage::{Classifier, TriageDecision, triage};

/// An inbound request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub content: String,
    /// Where the request came from (channel name, trigger event, ...)
    pub source: String,
    pub metadata: serde_json::Value,
    /// Give up once this passes, whether queued or executing
    pub deadline: Option<Instant>,
}

impl DispatchRequest {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            metadata: json!({}),
            deadline: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, limit: Duration) -> Self {
        self.with_deadline(Instant::now() + limit)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub id: String,
    /// Reply text with action tags removed
    pub content: String,
    pub lane: LaneKind,
    pub duration_ms: u64,
    pub triage: TriageDecision,
    /// Background tasks requested by the reply
    pub delegations: Vec<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

pub struct Dispatcher {
    bus: Arc<EventBus>,
    brain: Arc<dyn Brain>,
    classifier: Option<Arc<dyn Classifier>>,
    triage_timeout: Duration,
    fast: Lane,
    full: Lane,
    memory: Option<Arc<dyn MemoryStore>>,
    delegation: Option<DelegationExecutor>,
}

impl Dispatcher {
    /// A dispatcher with default lanes and no classifier, memory, or
    /// delegation attached.
    pub fn new(bus: Arc<EventBus>, brain: Arc<dyn Brain>) -> Self {
        Self::from_config(bus, brain, &DispatchConfig::default())
    }

    pub fn from_config(
        bus: Arc<EventBus>,
        brain: Arc<dyn Brain>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            bus,
            brain,
            classifier: None,
            triage_timeout: Duration::from_millis(config.triage_timeout_ms),
            fast: Lane::from_config(LaneKind::Fast, &config.fast),
            full: Lane::from_config(LaneKind::Full, &config.full),
            memory: None,
            delegation: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_triage_timeout(mut self, limit: Duration) -> Self {
        self.triage_timeout = limit;
        self
    }

    pub fn with_lanes(mut self, fast: Lane, full: Lane) -> Self {
        self.fast = fast;
        self.full = full;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_delegation(mut self, executor: DelegationExecutor) -> Self {
        self.delegation = Some(executor);
        self
    }

    pub fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Fast => &self.fast,
            LaneKind::Full => &self.full,
        }
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        vec![self.fast.stats(), self.full.stats()]
    }

    /// Refuse new and queued requests. Requests already executing finish.
    pub fn close(&self) {
        self.fast.close();
        self.full.close();
    }

    /// Handle one request end to end. Every failure is returned to the
    /// caller and published as `dispatch:failed`; nothing hangs past the
    /// request deadline.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let id = format!("dsp-{}", uuid::Uuid::new_v4().simple());
        let started = Instant::now();

        let decision = triage(
            self.classifier.as_ref(),
            &request.content,
            self.triage_timeout,
        )
        .await;
        let lane = self.lane(decision.lane);
        debug!(
            dispatch_id = %id,
            source = %request.source,
            lane = %lane.kind(),
            rationale = %decision.rationale,
            "Request triaged"
        );

        let result = self.execute(lane, &request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    dispatch_id = %id,
                    source = %request.source,
                    lane = %lane.kind(),
                    duration_ms,
                    error = %e,
                    "Dispatch failed"
                );
                self.bus.emit(
                    "dispatch:failed",
                    json!({
                        "id": id,
                        "lane": lane.kind(),
                        "source": request.source,
                        "duration_ms": duration_ms,
                        "kind": e.kind(),
                        "error": e.to_string(),
                        "metadata": request.metadata,
                    }),
                );
                return Err(e);
            }
        };

        let ParsedReply {
            content,
            delegations,
            memories,
        } = parse_reply(&reply.text);

        let delegations: Vec<TaskId> = match &self.delegation {
            Some(executor) => delegations
                .iter()
                .map(|tag| executor.spawn(tag.to_spec()))
                .collect(),
            None => {
                if !delegations.is_empty() {
                    warn!(
                        dispatch_id = %id,
                        requested = delegations.len(),
                        "Reply asked for delegation but no executor is attached"
                    );
                }
                Vec::new()
            }
        };

        if let Some(memory) = &self.memory {
            for tag in memories {
                let entry = MemoryEntry::new(tag.content)
                    .with_source(&request.source)
                    .with_tags(tag.section.into_iter().collect());
                if let Err(e) = memory.append(entry).await {
                    warn!(dispatch_id = %id, error = %e, "Failed to store remembered fact");
                }
            }
        }

        info!(
            dispatch_id = %id,
            source = %request.source,
            lane = %lane.kind(),
            duration_ms,
            delegations = delegations.len(),
            "Dispatch completed"
        );
        self.bus.emit(
            "dispatch:completed",
            json!({
                "id": id,
                "lane": lane.kind(),
                "source": request.source,
                "duration_ms": duration_ms,
                "triage": decision.rationale,
                "delegations": delegations,
                "metadata": request.metadata,
            }),
        );

        Ok(DispatchResponse {
            id,
            content,
            lane: lane.kind(),
            duration_ms,
            triage: decision,
            delegations,
            model: reply.model,
        })
    }

    /// Hold a lane slot for context building and the brain call.
    async fn execute(
        &self,
        lane: &Lane,
        request: &DispatchRequest,
    ) -> Result<BrainReply, DispatchError> {
        let mut permit: LanePermit<'_> = lane.acquire(request.deadline).await?;

        let mode = match lane.kind() {
            LaneKind::Fast => ContextMode::Minimal,
            LaneKind::Full => ContextMode::Full,
        };
        let context = self.build_context(mode).await;

        let mut budget = lane.timeout();
        let mut clamped = false;
        if let Some(deadline) = request.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < budget {
                budget = remaining;
                clamped = true;
            }
        }
        let lane_timeout = || DispatchError::LaneTimeout {
            lane: lane.kind().to_string(),
            stage: TimeoutStage::Executing,
        };
        if budget.is_zero() {
            return Err(lane_timeout());
        }

        match timeout(budget, self.brain.invoke(&request.content, &context, budget)).await {
            Ok(Ok(reply)) => {
                permit.succeed();
                Ok(reply)
            }
            Ok(Err(BrainError::Timeout { .. })) | Err(_) if clamped => Err(lane_timeout()),
            Ok(Err(source)) => Err(DispatchError::Backend {
                lane: lane.kind().to_string(),
                source,
            }),
            Err(_) => Err(DispatchError::Backend {
                lane: lane.kind().to_string(),
                source: BrainError::Timeout {
                    timeout_ms: budget.as_millis() as u64,
                },
            }),
        }
    }

    async fn build_context(&self, mode: ContextMode) -> String {
        let Some(memory) = &self.memory else {
            return String::new();
        };
        match memory.build_context(mode).await {
            Ok(context) => context,
            Err(e) => {
                warn!(
                    store = memory.name(),
                    error = %e,
                    "Context build failed; continuing without context"
                );
                String::new()
            }
        }
    }

    /// Dispatch every bus event matching `pattern` whose data carries a
    /// `content` string, with the event type as the request source.
    ///
    /// Must be called from within a tokio runtime. The subscription holds
    /// only a weak reference, so it stops dispatching once the dispatcher
    /// is dropped.
    pub fn attach_triggers(self: &Arc<Self>, pattern: impl Into<EventPattern>) -> SubscriptionId {
        let pattern = pattern.into();
        let runtime = Handle::current();
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        debug!(pattern = %pattern, "Dispatcher attached to triggers");

        self.bus.on(
            pattern,
            handler(move |event: &Event| {
                let Some(content) = event.str_field("content") else {
                    debug!(event_type = %event.event_type, "Trigger without content ignored");
                    return;
                };
                let request = DispatchRequest::new(content, &event.event_type)
                    .with_metadata(event.data.clone());
                let dispatcher = dispatcher.clone();
                runtime.spawn(async move {
                    if let Some(dispatcher) = dispatcher.upgrade() {
                        // Failures are already published as dispatch:failed.
                        let _ = dispatcher.dispatch(request).await;
                    }
                });
            }),
        )
    }
}
