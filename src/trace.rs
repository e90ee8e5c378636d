use std::{future::Future, sync::OnceLock};

use rand::{Rng, distr::Alphanumeric};
use tracing::Span;

const CORRELATION_ID_LEN: usize = 12;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

tokio::task_local! {
    static TRACE_CONTEXT: TraceContext;
}

/// Correlation data bound to one unit of work (an HTTP request or a consumed
/// message).
///
/// The context lives in task-local storage for exactly as long as the future
/// passed to [`TraceContext::scope`]. It is gone once that future returns,
/// fails or is dropped, so a worker never carries it into the next request.
#[derive(Debug)]
pub struct TraceContext {
    correlation_id: String,
    subject: OnceLock<String>,
}

impl TraceContext {
    pub fn begin() -> Self {
        Self::with_correlation_id(generate_correlation_id())
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            subject: OnceLock::new(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        TRACE_CONTEXT.scope(self, future).await
    }

    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        TRACE_CONTEXT.sync_scope(self, f)
    }

    pub fn current_correlation_id() -> Option<String> {
        TRACE_CONTEXT
            .try_with(|context| context.correlation_id.clone())
            .ok()
    }

    pub fn current_subject() -> Option<String> {
        TRACE_CONTEXT
            .try_with(|context| context.subject.get().cloned())
            .ok()
            .flatten()
    }

    /// Publishes the authenticated subject for the rest of the scope and
    /// records it on the current span. The first subject wins; returns false
    /// when no scope is active or a subject is already set.
    pub fn set_subject(subject: &str) -> bool {
        let stored = TRACE_CONTEXT
            .try_with(|context| context.subject.set(subject.to_string()).is_ok())
            .unwrap_or(false);

        if stored {
            Span::current().record("subject", subject);
        }

        stored
    }
}

/// Short alphanumeric id: 62^12 possibilities, readable in logs.
pub fn generate_correlation_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_ID_LEN)
        .map(char::from)
        .collect()
}

pub fn request_span(correlation_id: &str, method: &str, path: &str) -> Span {
    tracing::info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %method,
        path = %path,
        subject = tracing::field::Empty,
    )
}

pub fn message_span(correlation_id: &str, command_id: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "notification",
        correlation_id = %correlation_id,
        command_id = %command_id,
        attempt,
        subject = tracing::field::Empty,
    )
}
