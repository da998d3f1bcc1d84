//! Request context
//!
//! One [`RequestContext`] is created at ingress and threaded through
//! routing, retries and provider calls. It carries the request identity,
//! the per-request budget, and a cancellation token; a deadline cancels
//! the token when it expires.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::gateway::error::GatewayError;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start_time: Instant,
    pub tenant: String,
    pub max_cost_usd: Option<f64>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(
        request_id: Option<String>,
        tenant: Option<String>,
        max_cost_usd: Option<f64>,
    ) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            start_time: Instant::now(),
            tenant: tenant.unwrap_or_else(|| "internal".to_string()),
            max_cost_usd,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Attach a wall-clock deadline. When it passes, the context's token is
    /// cancelled, which interrupts in-flight provider calls and backoff
    /// sleeps.
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(deadline);
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    token.cancel();
                }
            }
        });
        self
    }

    /// Derived context for a fan-out task: same identity and budget,
    /// child cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            start_time: self.start_time,
            tenant: self.tenant.clone(),
            max_cost_usd: self.max_cost_usd,
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled, directly or via deadline.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The error a cancelled context surfaces: deadline expiry reads as a
    /// timeout, an explicit cancel as a client disconnect.
    pub fn cancellation_error(&self) -> GatewayError {
        if self.deadline_passed() {
            GatewayError::Timeout {
                provider: None,
                detail: "request deadline exceeded".to_string(),
            }
        } else {
            GatewayError::Cancelled
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Deterministic token approximation for prompts and responses when the
/// provider does not report counts: one token per four bytes of UTF-8.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() as f64 / 4.0).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_request_id_when_absent() {
        let ctx = RequestContext::new(None, None, None);
        assert!(Uuid::parse_str(&ctx.request_id).is_ok());
        assert_eq!(ctx.tenant, "internal");
    }

    #[test]
    fn reuses_supplied_request_id() {
        let id = Uuid::new_v4().to_string();
        let ctx = RequestContext::new(Some(id.clone()), Some("team-a".into()), Some(0.5));
        assert_eq!(ctx.request_id, id);
        assert_eq!(ctx.tenant, "team-a");
        assert_eq!(ctx.max_cost_usd, Some(0.5));
    }

    #[test]
    fn explicit_cancel_is_not_a_timeout() {
        let ctx = RequestContext::new(None, None, None);
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.cancellation_error(), GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_expiry_cancels_and_reads_as_timeout() {
        let ctx = RequestContext::new(None, None, None).with_deadline(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
            .await
            .expect("deadline should cancel the context");
        assert!(matches!(
            ctx.cancellation_error(),
            GatewayError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_children() {
        let ctx = RequestContext::new(None, None, None);
        let child = ctx.child();
        ctx.cancel();
        tokio::time::timeout(Duration::from_millis(100), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
    }

    #[test]
    fn token_estimate_is_bytes_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(300)), 75);
    }
}
