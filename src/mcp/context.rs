//! Per-request identifiers carried through the async call chain
//!
//! The context is passed explicitly to every handler and is also attached to
//! the handling task with a task-local scope, so code that cannot take a
//! parameter (log helpers, nested utilities) can still reach it. The scope
//! ends with the future it wraps, on success, error, or cancellation alike.

use std::future::Future;

use serde_json::Value;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: RequestContext;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    correlation_id: String,
    request_id: Option<Value>,
    session_id: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: Option<Value>, session_id: Option<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().simple().to_string(),
            request_id,
            session_id,
        }
    }

    /// Reuses a caller-supplied correlation id, e.g. from an upstream proxy.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn request_id(&self) -> Option<&Value> {
        self.request_id.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Runs `future` with this context attached to the current task.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT.scope(self, future).await
    }

    /// The context of the enclosing [`RequestContext::scope`], if any.
    pub fn current() -> Option<RequestContext> {
        CURRENT.try_with(Clone::clone).ok()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn scope_is_visible_across_suspension_points() {
        let ctx = RequestContext::new(Some(json!("1")), Some("session-a".to_string()));
        let expected = ctx.clone();

        let seen = ctx
            .scope(async {
                tokio::task::yield_now().await;
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                RequestContext::current()
            })
            .await;

        assert_eq!(seen, Some(expected));
        assert!(RequestContext::current().is_none());
    }

    #[tokio::test]
    async fn scope_is_cleared_when_the_future_is_cancelled() {
        let ctx = RequestContext::new(None, None);
        let scoped = ctx.scope(std::future::pending::<()>());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(5), scoped).await;

        assert!(timed_out.is_err());
        assert!(RequestContext::current().is_none());
    }

    #[tokio::test]
    async fn concurrent_scopes_do_not_leak_into_each_other() {
        let a = RequestContext::new(None, Some("a".to_string()));
        let b = RequestContext::new(None, Some("b".to_string()));

        let (seen_a, seen_b) = tokio::join!(
            a.scope(async {
                tokio::task::yield_now().await;
                RequestContext::current().and_then(|ctx| ctx.session_id().map(str::to_string))
            }),
            b.scope(async {
                tokio::task::yield_now().await;
                RequestContext::current().and_then(|ctx| ctx.session_id().map(str::to_string))
            }),
        );

        assert_eq!(seen_a.as_deref(), Some("a"));
        assert_eq!(seen_b.as_deref(), Some("b"));
    }

    #[test]
    fn correlation_ids_are_unique_unless_supplied() {
        let first = RequestContext::new(None, None);
        let second = RequestContext::new(None, None);
        assert_ne!(first.correlation_id(), second.correlation_id());

        let supplied = RequestContext::new(None, None).with_correlation_id("upstream-7");
        assert_eq!(supplied.correlation_id(), "upstream-7");
    }
}
