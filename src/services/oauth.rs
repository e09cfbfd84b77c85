use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;

use crate::config::Config;
use crate::models::token::{OAuthFlow, TokenResponse};

type HmacSha256 = Hmac<Sha256>;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

/// Tolerated clock skew when a state timestamp appears to be from the
/// future (seconds).
const STATE_SKEW_TOLERANCE_SEC: i64 = 60;

/// Consent-flow TTL mirrored in the oauth_flows.expires_at column.
const FLOW_TTL_MIN: i64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("bad_sig")]
    BadSig,
    #[error("OAuth flow expired")]
    Expired,
    #[error("Invalid state")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    #[serde(rename = "businessId")]
    pub business_id: String,
    pub nonce: String,
    pub ts: i64,
}

/// HMAC-SHA256 signer for the OAuth state parameter. The payload travels as
/// `base64url(json).base64url(mac)`; verification is constant time.
#[derive(Clone)]
pub struct StateSigner {
    secret: Vec<u8>,
    ttl_sec: i64,
}

impl StateSigner {
    pub fn new(secret: &str, ttl_sec: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_sec,
        }
    }

    pub fn sign(&self, payload: &StatePayload) -> String {
        let body = serde_json::to_vec(payload).expect("state payload serializes");
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(&body);
        let sig = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    pub fn verify(&self, state: &str, now: DateTime<Utc>) -> Result<StatePayload, StateError> {
        let (body_b64, sig_b64) = state.split_once('.').ok_or(StateError::Malformed)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| StateError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| StateError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(&body);
        mac.verify_slice(&sig).map_err(|_| StateError::BadSig)?;

        let payload: StatePayload =
            serde_json::from_slice(&body).map_err(|_| StateError::Malformed)?;

        let age = now.timestamp() - payload.ts;
        if age > self.ttl_sec || age < -STATE_SKEW_TOLERANCE_SEC {
            return Err(StateError::Expired);
        }
        Ok(payload)
    }
}

/// 32 random bytes, base64url - the PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge over the verifier's ASCII representation.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Create a single-use PKCE consent record and return (nonce, verifier).
pub async fn create_flow(pool: &PgPool, business_id: &str) -> anyhow::Result<(String, String)> {
    let nonce = generate_nonce();
    let verifier = generate_code_verifier();
    sqlx::query(
        "INSERT INTO oauth_flows (nonce, business_id, code_verifier, created_at, expires_at)
         VALUES ($1, $2, $3, NOW(), NOW() + $4 * INTERVAL '1 minute')",
    )
    .bind(&nonce)
    .bind(business_id)
    .bind(&verifier)
    .bind(FLOW_TTL_MIN)
    .execute(pool)
    .await?;
    Ok((nonce, verifier))
}

/// Atomic consume-and-delete by nonce. A second call for the same nonce, or
/// any call past the TTL, returns None - lookup-then-delete would admit
/// replay.
pub async fn consume_flow(pool: &PgPool, nonce: &str) -> anyhow::Result<Option<OAuthFlow>> {
    let flow = sqlx::query_as::<_, OAuthFlow>(
        "DELETE FROM oauth_flows
         WHERE nonce = $1 AND expires_at > NOW()
         RETURNING nonce, business_id, code_verifier, created_at, expires_at",
    )
    .bind(nonce)
    .fetch_optional(pool)
    .await?;
    // Expired rows are dropped opportunistically on every consume.
    sqlx::query("DELETE FROM oauth_flows WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(flow)
}

/// Build the Google consent redirect for a business.
pub fn consent_url(
    config: &Config,
    state: &str,
    challenge: &str,
) -> anyhow::Result<String> {
    let client_id = config
        .google_client_id
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("GOOGLE_OAUTH_NOT_CONFIGURED"))?;
    let redirect_uri = config
        .google_redirect_uri
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("GOOGLE_OAUTH_NOT_CONFIGURED"))?;

    let mut url = reqwest::Url::parse(GOOGLE_AUTH_URL)?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", CALENDAR_SCOPE)
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent")
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

/// Exchange the authorization code (with the PKCE verifier) for tokens.
pub async fn exchange_code(
    http: &Client,
    config: &Config,
    code: &str,
    code_verifier: &str,
) -> anyhow::Result<TokenResponse> {
    let client_id = config
        .google_client_id
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("GOOGLE_OAUTH_NOT_CONFIGURED"))?;
    let client_secret = config
        .google_client_secret
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("GOOGLE_OAUTH_NOT_CONFIGURED"))?;
    let redirect_uri = config
        .google_redirect_uri
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("GOOGLE_OAUTH_NOT_CONFIGURED"))?;

    let response = http
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", code_verifier),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Token exchange failed ({status}): {body}");
    }
    Ok(response.json().await?)
}

/// Refresh-token grant used before calendar calls when the access token is
/// stale.
pub async fn refresh_access_token(
    http: &Client,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> anyhow::Result<TokenResponse> {
    let response = http
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Token refresh failed ({status}): {body}");
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> StateSigner {
        StateSigner::new("state-secret", 600)
    }

    fn payload(ts: i64) -> StatePayload {
        StatePayload {
            business_id: "b1".into(),
            nonce: "abc123".into(),
            ts,
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let now = Utc::now();
        let state = signer().sign(&payload(now.timestamp()));
        let verified = signer().verify(&state, now).unwrap();
        assert_eq!(verified.business_id, "b1");
        assert_eq!(verified.nonce, "abc123");
    }

    #[test]
    fn tampered_state_is_bad_sig() {
        let now = Utc::now();
        let state = signer().sign(&payload(now.timestamp()));
        let (body, sig) = state.split_once('.').unwrap();
        let mut sig_bytes = URL_SAFE_NO_PAD.decode(sig).unwrap();
        sig_bytes[0] ^= 1;
        let forged = format!("{body}.{}", URL_SAFE_NO_PAD.encode(sig_bytes));
        assert_eq!(signer().verify(&forged, now), Err(StateError::BadSig));
    }

    #[test]
    fn wrong_secret_is_bad_sig() {
        let now = Utc::now();
        let state = StateSigner::new("other-secret", 600).sign(&payload(now.timestamp()));
        assert_eq!(signer().verify(&state, now), Err(StateError::BadSig));
    }

    #[test]
    fn expired_state_is_rejected() {
        let now = Utc::now();
        let state = signer().sign(&payload(now.timestamp() - 601));
        assert_eq!(signer().verify(&state, now), Err(StateError::Expired));
    }

    #[test]
    fn small_negative_skew_is_tolerated() {
        let now = Utc::now();
        let slightly_future = signer().sign(&payload(now.timestamp() + 30));
        assert!(signer().verify(&slightly_future, now).is_ok());
        let too_far_future = signer().sign(&payload(now.timestamp() + 120));
        assert_eq!(
            signer().verify(&too_far_future, now),
            Err(StateError::Expired)
        );
    }

    #[test]
    fn garbage_state_is_malformed() {
        let now = Utc::now();
        assert_eq!(signer().verify("nodot", now), Err(StateError::Malformed));
        assert_eq!(
            signer().verify("!!!.???", now),
            Err(StateError::Malformed)
        );
    }

    #[test]
    fn challenge_is_s256_of_verifier() {
        // RFC 7636 appendix B vector
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_is_unique_and_url_safe() {
        let a = generate_code_verifier();
        let b = generate_code_verifier();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 32 bytes → 43 base64url chars
        assert_eq!(a.len(), 43);
    }
}
