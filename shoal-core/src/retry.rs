use std::time::Duration;

use crate::context::CoreContext;
use crate::request::Request;

/// Why a request could not be dispatched and went to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The chosen endpoint is not writable (disconnected, backpressured or
    /// gated by its circuit breaker).
    EndpointNotWritable,
    /// Every pooled endpoint is busy and the pool cannot grow further.
    NoFreeEndpoint,
    /// The target node does not currently offer the required service.
    ServiceNotAvailable,
    /// No managed node can take the request right now.
    NodeNotAvailable,
    /// The request's bucket has no applied configuration.
    BucketNotAvailable,
    /// The key's partition has no usable master or replica assigned.
    PartitionNotAvailable,
}

/// Decides whether and when an undispatchable request is resubmitted.
///
/// Dispatch failures never surface to the caller synchronously, they are
/// routed through here and either resubmitted later or cancelled.
pub trait RetryOrchestrator: Send + Sync + 'static {
    fn maybe_retry(&self, ctx: &CoreContext, request: Request, reason: RetryReason);
}

/// Resubmits with a small capped backoff until the request completes.
///
/// The per operation timeout bounds how long this loops, an expired
/// request is cancelled by the timer and dropped here on the next pass.
#[derive(Debug, Default)]
pub struct BestEffortRetry;

impl RetryOrchestrator for BestEffortRetry {
    fn maybe_retry(&self, ctx: &CoreContext, request: Request, reason: RetryReason) {
        if request.completed() {
            return;
        }

        let attempt = request.next_retry_attempt();
        let delay = Duration::from_millis(1u64 << attempt.min(7));
        trace!(
            request_id = request.id(),
            reason = ?reason,
            attempt = attempt,
            delay = ?delay,
            "Request could not be dispatched, scheduling resubmit.",
        );

        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !request.completed() {
                ctx.redispatch(request);
            }
        });
    }
}
