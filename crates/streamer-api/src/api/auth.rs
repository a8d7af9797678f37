//! Device-code OAuth flow and per-user session management.

use actix_web::{HttpResponse, get, post, web};
use serde::Deserialize;

use crate::errors::ApiError;
use crate::provider::{ProviderClient, ProviderError};
use crate::sessions::{SessionTokens, map_provider_error};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub device_code: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
pub struct SessionCheckRequest {
    pub access_token: String,
    pub user_id: String,
    pub country_code: String,
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub country_code: String,
}

/// Step 1: initiate the device-code flow.
#[post("/auth/device")]
pub async fn auth_device(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let device = state
        .auth
        .device_authorization()
        .await
        .map_err(map_provider_error)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "device_code": device.device_code,
        "user_code": device.user_code,
        "verification_uri": device.verification_uri,
        "verification_uri_complete": device.verification_uri_complete,
        "expires_in": device.expires_in,
        "interval": device.interval,
    })))
}

/// Step 2: poll for the token. Returns 428 while the user has not finished
/// authorizing.
#[post("/auth/token")]
pub async fn auth_token(
    state: web::Data<AppState>,
    body: web::Json<TokenRequest>,
) -> Result<HttpResponse, ApiError> {
    let grant = state
        .auth
        .token(&body.device_code)
        .await
        .map_err(map_provider_error)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "access_token": grant.access_token,
        "refresh_token": grant.refresh_token,
        "token_type": grant.token_type,
        "expires_in": grant.expires_in,
        "user_id": grant.user.id_string(),
        "country_code": grant.user.country_code,
        "username": grant.user.username,
    })))
}

/// Refresh an expired access token.
#[post("/auth/refresh")]
pub async fn auth_refresh(
    state: web::Data<AppState>,
    body: web::Json<RefreshRequest>,
) -> Result<HttpResponse, ApiError> {
    let grant = state.auth.refresh(&body.refresh_token).await.map_err(|e| {
        if matches!(e, ProviderError::Transport(_)) {
            map_provider_error(e)
        } else {
            ApiError::Unauthenticated(e.to_string())
        }
    })?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "access_token": grant.access_token,
        "token_type": grant.token_type,
        "expires_in": grant.expires_in,
        "user_id": grant.user.id_string(),
        "country_code": grant.user.country_code,
    })))
}

/// Verify stored tokens against the provider's session endpoint.
#[post("/auth/session")]
pub async fn auth_session(
    state: web::Data<AppState>,
    body: web::Json<SessionCheckRequest>,
) -> Result<HttpResponse, ApiError> {
    let client = ProviderClient::new(
        &state.config.provider_base_url,
        &body.access_token,
        &body.user_id,
        &body.country_code,
    );

    let session = client
        .verify_session()
        .await
        .map_err(|e| ApiError::Unauthenticated(e.to_string()))?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "valid": true,
        "session_id": session.session_id,
        "user_id": session.user_id,
        "country_code": session.country_code,
    })))
}

#[get("/user/auth/status")]
pub async fn user_auth_status(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "authenticated": state.sessions.is_authenticated(&query.user_id),
        "user_id": query.user_id,
    }))
}

/// Restore a user's credentials. If the access token is already expired,
/// a refresh is attempted automatically.
#[post("/user/auth/restore")]
pub async fn user_auth_restore(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
    body: web::Json<RestoreRequest>,
) -> Result<HttpResponse, ApiError> {
    let outcome = state
        .sessions
        .restore(
            &query.user_id,
            SessionTokens {
                access_token: body.access_token.clone(),
                refresh_token: body.refresh_token.clone(),
                principal_id: body.user_id.clone(),
                region: body.country_code.clone(),
            },
        )
        .await?;

    let mut response = serde_json::json!({
        "success": true,
        "user_id": outcome.tokens.principal_id,
        "country_code": outcome.tokens.region,
    });
    if outcome.refreshed {
        response["refreshed"] = serde_json::Value::Bool(true);
        response["access_token"] = serde_json::Value::String(outcome.tokens.access_token);
    }
    Ok(HttpResponse::Ok().json(response))
}

#[post("/user/auth/clear")]
pub async fn user_auth_clear(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
) -> HttpResponse {
    state.sessions.invalidate(&query.user_id);
    HttpResponse::Ok().json(serde_json::json!({ "success": true }))
}
