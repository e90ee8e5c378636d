use std::{collections::HashMap, sync::Arc};

use axum::{
    Extension, Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::Authenticator,
    clients::health::HealthChecker,
    errors::AppError,
    middleware::{Admission, require_premium, require_principal, with_admission},
    models::{
        health::HealthStatus,
        message::{Channel, NotificationCommand, NotificationPayload},
        principal::Principal,
        response::ApiResponse,
        validation::normalize_email,
    },
    passcode::PasscodeStore,
    producer::NotificationProducer,
    rate_limit::RateLimiters,
};

pub struct AppState {
    pub authenticator: Arc<Authenticator>,
    pub rate_limiters: RateLimiters,
    pub producer: NotificationProducer,
    pub passcodes: PasscodeStore,
    pub health_checker: HealthChecker,
}

#[derive(Debug, Deserialize)]
pub struct PasscodeRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasscodeVerification {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PremiumStatus {
    pub principal_id: String,
    pub premium_expires_at: Option<DateTime<Utc>>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let admission = Arc::new(Admission {
        authenticator: state.authenticator.clone(),
        limiter: state.rate_limiters.api.clone(),
    });

    let authenticated = Router::new()
        .route("/me", get(current_principal))
        .route_layer(from_fn(require_principal));

    let premium = Router::new()
        .route("/premium/status", get(premium_status))
        .route_layer(from_fn(require_premium));

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/auth/otp", post(request_passcode))
        .route("/auth/otp/verify", post(verify_passcode))
        .merge(authenticated)
        .merge(premium)
        .with_state(state)
        // Inside the admission stack so its events carry the correlation id.
        .layer(TraceLayer::new_for_http());

    with_admission(router, admission)
}

pub async fn run_api_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn current_principal(Extension(principal): Extension<Principal>) -> impl IntoResponse {
    Json(ApiResponse::success(principal, "Principal resolved"))
}

async fn premium_status(Extension(principal): Extension<Principal>) -> impl IntoResponse {
    Json(ApiResponse::success(
        PremiumStatus {
            principal_id: principal.id,
            premium_expires_at: principal.premium_expires_at,
        },
        "Premium subscription active",
    ))
}

async fn request_passcode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PasscodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email =
        normalize_email(&request.email).map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let limiter = &state.rate_limiters.otp;
    if !limiter.try_consume(&email) {
        return Err(AppError::RateLimited {
            retry_after: limiter.retry_after(&email),
        });
    }

    let code = state.passcodes.issue(&email);
    let minutes = (state.passcodes.ttl().as_secs() / 60).max(1);

    let command = NotificationCommand::new(
        email.clone(),
        Channel::Email,
        NotificationPayload {
            title: "Your sign-in code".to_string(),
            body: format!("Your code is {}. It expires in {} minutes.", code, minutes),
            data: HashMap::from([("purpose".to_string(), "passcode".to_string())]),
        },
    );

    state.producer.publish(&command).await?;

    info!(notification_id = %command.id, "Passcode notification queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(
            serde_json::json!({ "expires_in_seconds": state.passcodes.ttl().as_secs() }),
            "Passcode sent",
        )),
    ))
}

async fn verify_passcode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PasscodeVerification>,
) -> Result<impl IntoResponse, AppError> {
    let email =
        normalize_email(&request.email).map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let limiter = &state.rate_limiters.verification;
    if !limiter.try_consume(&email) {
        return Err(AppError::RateLimited {
            retry_after: limiter.retry_after(&email),
        });
    }

    if !state.passcodes.verify(&email, request.code.trim()) {
        return Err(AppError::InvalidCredentials);
    }

    let principal = state
        .authenticator
        .identity_store()
        .find_by_email(&email)
        .await
        .map_err(|e| AppError::IdentityStoreUnavailable(e.to_string()))?
        .ok_or(AppError::InvalidCredentials)?;

    let access_token = state
        .authenticator
        .issue_token(&principal.id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ApiResponse::success(
        TokenResponse {
            access_token,
            token_type: "Bearer",
        },
        "Signed in",
    )))
}
