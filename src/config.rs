use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub app_env: String,
    // Google Calendar OAuth
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
    pub google_api_timeout_ms: u64,
    // OAuth state signing
    pub oauth_state_secret: String,
    pub oauth_state_ttl_sec: i64,
    /// 32-byte AES key for refresh tokens, supplied as 64 hex chars.
    pub tokens_enc_key: [u8; 32],
    pub booking_hold_minutes: i64,
    pub run_retry_worker: bool,
    pub run_token_migration: bool,
    // Twilio (optional - SMS/call features degrade to logged failures)
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    /// Fallback technician phone when a business has no emergency phone.
    pub emergency_fallback_phone: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        let tokens_enc_key = match env::var("TOKENS_ENC_KEY") {
            Ok(hex_key) => parse_enc_key(&hex_key)?,
            Err(_) if app_env == "production" => {
                anyhow::bail!("Missing required env var: TOKENS_ENC_KEY")
            }
            // Dev fallback so a local instance boots without secrets.
            Err(_) => [0u8; 32],
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            app_env,
            google_client_id: optional("GOOGLE_CLIENT_ID"),
            google_client_secret: optional("GOOGLE_CLIENT_SECRET"),
            google_redirect_uri: optional("GOOGLE_REDIRECT_URI"),
            google_api_timeout_ms: env::var("GOOGLE_API_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".into())
                .parse()?,
            oauth_state_secret: env::var("OAUTH_STATE_SECRET")
                .unwrap_or_else(|_| "change_this_state_secret".into()),
            oauth_state_ttl_sec: env::var("OAUTH_STATE_TTL_SEC")
                .unwrap_or_else(|_| "600".into())
                .parse()?,
            tokens_enc_key,
            booking_hold_minutes: env::var("BOOKING_HOLD_MINUTES")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
            run_retry_worker: env::var("RUN_RETRY_WORKER").as_deref() == Ok("1"),
            run_token_migration: env::var("RUN_TOKEN_MIGRATION").as_deref() == Ok("1"),
            twilio_account_sid: optional("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: optional("TWILIO_AUTH_TOKEN"),
            twilio_from_number: optional("TWILIO_FROM_NUMBER"),
            emergency_fallback_phone: optional("EMERGENCY_FALLBACK_PHONE"),
        })
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_enc_key(hex_key: &str) -> anyhow::Result<[u8; 32]> {
    if hex_key.len() != 64 {
        anyhow::bail!("TOKENS_ENC_KEY must be 64 hex characters (32 bytes)");
    }
    let bytes = hex::decode(hex_key)
        .map_err(|_| anyhow::anyhow!("TOKENS_ENC_KEY is not valid hex"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enc_key_round_trips_hex() {
        let hex_key = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let key = parse_enc_key(hex_key).unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[1], 0x11);
        assert_eq!(key[31], 0xff);
    }

    #[test]
    fn enc_key_rejects_wrong_length() {
        assert!(parse_enc_key("abcd").is_err());
        assert!(parse_enc_key(&"0".repeat(63)).is_err());
    }

    #[test]
    fn enc_key_rejects_non_hex() {
        assert!(parse_enc_key(&"zz".repeat(32)).is_err());
    }
}
