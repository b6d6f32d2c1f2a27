//! `CommandBroker`: submit commands to agents and correlate their replies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tracing::{debug, info, warn};
use vibrant_core::{
    AgentReply, BrokerError, ClientId, CommandKind, CommandPayload, CommandResult, OutboundEnvelope,
    ReplyError, RequestId,
};

use crate::fanout::FanOutRegistry;
use crate::metrics::{
    COMMANDS_EXPIRED_TOTAL, COMMANDS_RESOLVED_TOTAL, COMMANDS_SUBMITTED_TOTAL,
    COMMANDS_TIMED_OUT_TOTAL, COMMAND_LATENCY_SECONDS, PENDING_REQUESTS, REPLIES_DROPPED_TOTAL,
};
use crate::pending::{ExpiredRequest, PendingRequest, PendingTable, Resolution};

/// Timing knobs for the broker.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Await timeout when the caller gives none.
    pub default_timeout: Duration,
    /// How long an entry may stay pending before the reaper evicts it.
    pub request_ttl: Duration,
    /// Let the reaper drop fan-outs whose connections are all gone.
    pub prune_empty_fanouts: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            request_ttl: Duration::from_secs(60),
            prune_empty_fanouts: false,
        }
    }
}

/// How an [`CommandBroker::await_reply`] call ended.
#[derive(Clone, Debug, PartialEq)]
pub enum AwaitOutcome {
    Resolved(CommandResult),
    /// The timer fired and this call evicted the request.
    TimedOut,
    /// The slot closed without a value: another path evicted the request.
    Closed,
}

impl AwaitOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// `TimedOut` and `Closed` both mean no reply will arrive.
    pub fn is_timeout(&self) -> bool {
        !self.is_resolved()
    }

    pub fn into_result(self) -> Option<CommandResult> {
        match self {
            Self::Resolved(result) => Some(result),
            Self::TimedOut | Self::Closed => None,
        }
    }
}

/// What happened to one inbound agent message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Resolved(RequestId),
    /// Well-formed reply for an id that is unknown, finished, or evicted.
    Unknown(RequestId),
    /// Reply type does not answer the request's command; the request stays pending.
    KindMismatch {
        request_id: RequestId,
        expected: CommandKind,
        got: CommandKind,
    },
    /// Missing envelope fields or unparseable body.
    Malformed(ReplyError),
    /// A `type` this broker does not handle.
    Unhandled(String),
}

/// Composition root for command fan-out and reply correlation.
///
/// Owns the pending table and the fan-out registry; share it behind an `Arc`.
pub struct CommandBroker {
    config: BrokerConfig,
    pending: PendingTable,
    fanouts: FanOutRegistry,
}

impl CommandBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            pending: PendingTable::new(),
            fanouts: FanOutRegistry::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn fanouts(&self) -> &FanOutRegistry {
        &self.fanouts
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record a command and broadcast it to every connection of `client_id`.
    ///
    /// Never waits. With no connection registered the request is still
    /// returned and will time out.
    pub fn submit(
        &self,
        client_id: &ClientId,
        payload: CommandPayload,
    ) -> Result<PendingRequest, BrokerError> {
        let kind = payload.kind();
        let (request, entry) = PendingRequest::new(client_id.clone(), payload, self.config.request_ttl);
        let message = OutboundEnvelope::new(request.id().clone(), entry.payload())
            .to_json()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;

        if let Err(e) = self.pending.insert(entry) {
            tracing::error!(request_id = %request.id(), error = %e, "correlation id collision");
            return Err(e);
        }
        counter!(COMMANDS_SUBMITTED_TOTAL, "kind" => kind.as_str()).increment(1);
        self.record_pending_gauge();

        match self.fanouts.broadcast(client_id, &Arc::new(message)) {
            Some(report) if report.delivered > 0 => {
                debug!(
                    client_id = %client_id,
                    request_id = %request.id(),
                    kind = kind.as_str(),
                    delivered = report.delivered,
                    "submitted command"
                );
            }
            Some(report) => {
                warn!(
                    client_id = %client_id,
                    request_id = %request.id(),
                    recipients = report.recipients,
                    "command reached no connection; it will time out"
                );
            }
            None => {
                info!(
                    client_id = %client_id,
                    request_id = %request.id(),
                    "no fanout for client; command will time out"
                );
            }
        }
        Ok(request)
    }

    /// Wait for the reply to `request`, at most `timeout` (default from config).
    ///
    /// The entry's deadline is pushed out to cover the whole wait, so the
    /// reaper never evicts a request before its waiter's own timer fires.
    pub async fn await_reply(&self, request: PendingRequest, timeout: Option<Duration>) -> AwaitOutcome {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();
        let kind = request.kind();
        let id = request.id().clone();
        let mut slot = request.slot;

        if let Some(deadline) = tokio::time::Instant::now().checked_add(timeout) {
            self.pending.extend_deadline(&id, deadline);
        }

        let outcome = match tokio::time::timeout(timeout, &mut slot).await {
            Ok(Ok(result)) => AwaitOutcome::Resolved(result),
            Ok(Err(_)) => AwaitOutcome::Closed,
            Err(_) => {
                if self.pending.evict_if_unresolved(&id) {
                    AwaitOutcome::TimedOut
                } else {
                    // A reply won the race; its value is already in the slot.
                    match slot.await {
                        Ok(result) => AwaitOutcome::Resolved(result),
                        Err(_) => AwaitOutcome::Closed,
                    }
                }
            }
        };

        match &outcome {
            AwaitOutcome::Resolved(_) => {
                histogram!(COMMAND_LATENCY_SECONDS, "kind" => kind.as_str())
                    .record(started.elapsed().as_secs_f64());
            }
            AwaitOutcome::TimedOut | AwaitOutcome::Closed => {
                counter!(COMMANDS_TIMED_OUT_TOTAL, "kind" => kind.as_str()).increment(1);
                info!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "timed out waiting for reply");
            }
        }
        self.record_pending_gauge();
        outcome
    }

    /// Submit and wait in one call.
    pub async fn submit_and_wait(
        &self,
        client_id: &ClientId,
        payload: CommandPayload,
        timeout: Option<Duration>,
    ) -> Result<(RequestId, AwaitOutcome), BrokerError> {
        let request = self.submit(client_id, payload)?;
        let id = request.id().clone();
        Ok((id, self.await_reply(request, timeout).await))
    }

    /// Fire and forget. The entry is left to the reaper if no reply comes.
    pub fn send(&self, client_id: &ClientId, payload: CommandPayload) -> Result<RequestId, BrokerError> {
        self.submit(client_id, payload).map(|request| request.id().clone())
    }

    /// Handle one inbound message from a connection of `client_id`.
    ///
    /// Never fails: malformed, unknown, and late messages are logged and
    /// dropped.
    pub fn dispatch(&self, client_id: &ClientId, raw: &str) -> DispatchOutcome {
        let reply = match AgentReply::parse(raw) {
            Ok(reply) => reply,
            Err(ReplyError::UnknownType(tag)) => {
                counter!(REPLIES_DROPPED_TOTAL, "reason" => "unhandled").increment(1);
                info!(client_id = %client_id, message_type = %tag, "unhandled message type from agent");
                return DispatchOutcome::Unhandled(tag);
            }
            Err(e) => {
                counter!(REPLIES_DROPPED_TOTAL, "reason" => e.error_kind()).increment(1);
                warn!(client_id = %client_id, error = %e, "dropping malformed agent message");
                return DispatchOutcome::Malformed(e);
            }
        };

        let kind = reply.kind;
        let failed = reply.result.is_failure();
        match self.pending.resolve_once(&reply.request_id, reply.result) {
            Resolution::Resolved => {
                counter!(COMMANDS_RESOLVED_TOTAL, "kind" => kind.as_str()).increment(1);
                self.record_pending_gauge();
                debug!(
                    client_id = %client_id,
                    request_id = %reply.request_id,
                    kind = kind.as_str(),
                    agent_failure = failed,
                    "resolved command"
                );
                DispatchOutcome::Resolved(reply.request_id)
            }
            Resolution::KindMismatch { expected } => {
                counter!(REPLIES_DROPPED_TOTAL, "reason" => "kind_mismatch").increment(1);
                warn!(
                    client_id = %client_id,
                    request_id = %reply.request_id,
                    expected = expected.as_str(),
                    got = kind.as_str(),
                    "reply type does not match the pending command"
                );
                DispatchOutcome::KindMismatch {
                    request_id: reply.request_id,
                    expected,
                    got: kind,
                }
            }
            Resolution::Unknown => {
                counter!(REPLIES_DROPPED_TOTAL, "reason" => "unknown_request").increment(1);
                info!(
                    client_id = %client_id,
                    request_id = %reply.request_id,
                    "reply for unknown or already-resolved request"
                );
                DispatchOutcome::Unknown(reply.request_id)
            }
        }
    }

    /// Evict expired entries now. Returns what was evicted.
    pub fn reap_expired(&self) -> Vec<ExpiredRequest> {
        let expired = self.pending.evict_expired(tokio::time::Instant::now());
        for req in &expired {
            counter!(COMMANDS_EXPIRED_TOTAL, "kind" => req.kind.as_str()).increment(1);
            debug!(request_id = %req.id, client_id = %req.client_id, "evicted expired request");
        }
        if !expired.is_empty() {
            self.record_pending_gauge();
        }
        if self.config.prune_empty_fanouts {
            let pruned = self.fanouts.prune_empty();
            if pruned > 0 {
                debug!(pruned, "pruned empty fanouts");
            }
        }
        expired
    }

    /// Periodically evict requests nobody waited on past their TTL.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = broker.reap_expired();
                if !expired.is_empty() {
                    info!(evicted = expired.len(), "pending request cleanup");
                }
            }
        })
    }

    fn record_pending_gauge(&self) {
        gauge!(PENDING_REQUESTS).set(self.pending.len() as f64);
    }
}

impl Default for CommandBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
