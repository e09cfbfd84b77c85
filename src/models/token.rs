use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-business Google credential row. The refresh token only exists as
/// ciphertext + iv + tag (all three present or all three absent);
/// refresh_token_plain carries legacy rows until the one-time sweep nulls it.
#[derive(Debug, Clone, FromRow)]
pub struct GoogleTokenRecord {
    pub business_id: String,
    pub access_token: Option<String>,
    pub refresh_token_ct: Option<Vec<u8>>,
    pub refresh_token_iv: Option<Vec<u8>>,
    pub refresh_token_tag: Option<Vec<u8>>,
    pub refresh_token_plain: Option<String>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl GoogleTokenRecord {
    pub fn has_encrypted_refresh(&self) -> bool {
        self.refresh_token_ct.is_some()
            && self.refresh_token_iv.is_some()
            && self.refresh_token_tag.is_some()
    }

    /// True when the stored access token is missing or expires within the
    /// next minute.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expiry) {
            (Some(_), Some(expiry)) => expiry <= now + chrono::Duration::seconds(60),
            _ => true,
        }
    }
}

/// Single-use PKCE consent record.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthFlow {
    pub nonce: String,
    pub business_id: String,
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Token payload returned by Google's token endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(access: Option<&str>, expiry: Option<DateTime<Utc>>) -> GoogleTokenRecord {
        GoogleTokenRecord {
            business_id: "b1".into(),
            access_token: access.map(String::from),
            refresh_token_ct: None,
            refresh_token_iv: None,
            refresh_token_tag: None,
            refresh_token_plain: None,
            scope: None,
            token_type: None,
            expiry,
        }
    }

    #[test]
    fn missing_access_token_needs_refresh() {
        let now = Utc::now();
        assert!(record(None, None).needs_refresh(now));
    }

    #[test]
    fn near_expiry_needs_refresh() {
        let now = Utc::now();
        let soon = now + chrono::Duration::seconds(30);
        let later = now + chrono::Duration::seconds(600);
        assert!(record(Some("tok"), Some(soon)).needs_refresh(now));
        assert!(!record(Some("tok"), Some(later)).needs_refresh(now));
    }
}
