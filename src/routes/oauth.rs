use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::services::business::BusinessService;
use crate::services::oauth::{
    self, code_challenge, StateError, StatePayload,
};
use crate::AppState;

#[derive(Deserialize)]
pub struct ConsentQuery {
    pub business_id: String,
}

/// GET /auth/google-business - create a PKCE flow and bounce the operator
/// to the Google consent screen.
pub async fn google_business(
    State(state): State<AppState>,
    Query(query): Query<ConsentQuery>,
) -> Result<Redirect, (StatusCode, Json<Value>)> {
    BusinessService::get_business(&state.db, &query.business_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "ok": false, "error": "Business not found" })),
            )
        })?;

    let (nonce, verifier) = oauth::create_flow(&state.db, &query.business_id)
        .await
        .map_err(internal)?;

    let payload = StatePayload {
        business_id: query.business_id.clone(),
        nonce,
        ts: Utc::now().timestamp(),
    };
    let signed = state.state_signer.sign(&payload);
    let url =
        oauth::consent_url(&state.config, &signed, &code_challenge(&verifier)).map_err(internal)?;

    Ok(Redirect::temporary(&url))
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// GET /auth/google/callback - verify the HMAC state, consume the flow by
/// nonce (single use), exchange the code with the PKCE verifier, store the
/// encrypted tokens.
pub async fn google_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(err) = &query.error {
        return Err(bad_request(&format!("Consent denied: {err}")));
    }
    let code = query
        .code
        .as_deref()
        .ok_or_else(|| bad_request("Missing code"))?;
    let raw_state = query
        .state
        .as_deref()
        .ok_or_else(|| bad_request("Invalid state"))?;

    let payload = state
        .state_signer
        .verify(raw_state, Utc::now())
        .map_err(|e| match e {
            StateError::BadSig => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "Invalid state", "code": "bad_sig" })),
            ),
            StateError::Expired => bad_request("OAuth flow expired"),
            StateError::Malformed => bad_request("Invalid state"),
        })?;

    let flow = oauth::consume_flow(&state.db, &payload.nonce)
        .await
        .map_err(internal)?
        .ok_or_else(|| bad_request("OAuth flow expired"))?;

    if flow.business_id != payload.business_id {
        return Err(bad_request("Invalid state"));
    }

    let http = reqwest::Client::new();
    let tokens = oauth::exchange_code(&http, &state.config, code, &flow.code_verifier)
        .await
        .map_err(|e| {
            error!(business_id = %flow.business_id, error = %e, "code exchange failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "Internal error" })),
            )
        })?;

    state
        .vault
        .store_tokens(&flow.business_id, &tokens)
        .await
        .map_err(internal)?;

    info!(business_id = %flow.business_id, "google calendar connected");
    Ok(Json(json!({
        "ok": true,
        "businessId": flow.business_id,
        "connected": true,
    })))
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": message })),
    )
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!(error = %e, "oauth request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": "Internal error" })),
    )
}
