use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, header::AUTHORIZATION},
    middleware::{Next, from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info};

use crate::{
    auth::Authenticator,
    errors::AppError,
    models::{principal::Principal, status::AdmissionState},
    rate_limit::RateLimiter,
    trace::{CORRELATION_ID_HEADER, TraceContext, request_span},
};

pub const ANONYMOUS_KEY: &str = "anonymous";

/// Collaborators of the authentication and throttling stages.
pub struct Admission {
    pub authenticator: Arc<Authenticator>,
    pub limiter: RateLimiter,
}

/// Wraps `router` so every request passes trace, authentication and rate
/// limiting, in that order, before reaching a handler.
pub fn with_admission(router: Router, admission: Arc<Admission>) -> Router {
    // Layers run outermost-last.
    router
        .layer(from_fn_with_state(admission.clone(), rate_limit))
        .layer(from_fn_with_state(admission, authenticate))
        .layer(from_fn(trace_requests))
}

/// Opens the correlation scope for the request and logs its completion.
/// The scope ends with this future, on success and on error alike.
pub async fn trace_requests(request: Request, next: Next) -> Response {
    let context = TraceContext::begin();
    let correlation_id = context.correlation_id().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = request_span(&correlation_id, method.as_str(), &path);

    let mut response = context
        .scope(
            async move {
                let started = Instant::now();
                debug!(state = %AdmissionState::Traced, "Request received");

                let response = next.run(request).await;

                info!(
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
                debug!(state = %AdmissionState::Completed, "Request finished");
                response
            }
            .instrument(span),
        )
        .await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }

    response
}

/// Binds a [`Principal`] when the bearer token checks out. Bad or missing
/// credentials fall through as anonymous; a failing identity store aborts.
pub async fn authenticate(
    State(admission): State<Arc<Admission>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<Principal>().is_some() {
        return next.run(request).await;
    }

    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match admission
        .authenticator
        .authenticate(authorization.as_deref())
        .await
    {
        Ok(Some(principal)) => {
            debug!(state = %AdmissionState::Authenticated, principal_id = %principal.id, "Principal bound");
            request.extensions_mut().insert(principal);
        }
        Ok(None) => {
            debug!(state = %AdmissionState::Anonymous, "No principal bound");
        }
        Err(e) => {
            return AppError::IdentityStoreUnavailable(e.to_string()).into_response();
        }
    }

    next.run(request).await
}

/// Charges one token to the principal's bucket, or to the shared anonymous
/// bucket. A denial answers 429 without running the handler.
pub async fn rate_limit(
    State(admission): State<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    let key = request
        .extensions()
        .get::<Principal>()
        .map(|principal| principal.id.clone())
        .unwrap_or_else(|| ANONYMOUS_KEY.to_string());

    if !admission.limiter.try_consume(&key) {
        let retry_after = admission.limiter.retry_after(&key);
        info!(
            state = %AdmissionState::Rejected,
            key = %key,
            retry_after_secs = retry_after.as_secs(),
            "Request throttled"
        );
        return AppError::RateLimited { retry_after }.into_response();
    }

    debug!(state = %AdmissionState::Admitted, key = %key, "Request admitted");

    let response = next.run(request).await;

    debug!(
        state = %AdmissionState::Handled,
        status = response.status().as_u16(),
        "Handler finished"
    );
    response
}

pub async fn require_principal(request: Request, next: Next) -> Result<Response, AppError> {
    if request.extensions().get::<Principal>().is_none() {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// Lets the request through only for a principal with an unexpired premium
/// subscription.
pub async fn require_premium(request: Request, next: Next) -> Result<Response, AppError> {
    let principal = request
        .extensions()
        .get::<Principal>()
        .ok_or(AppError::Unauthorized)?;

    if !principal.has_active_premium(Utc::now()) {
        debug!(principal_id = %principal.id, "Premium access denied");
        return Err(AppError::AccessDenied(
            "Premium subscription required".to_string(),
        ));
    }

    Ok(next.run(request).await)
}
