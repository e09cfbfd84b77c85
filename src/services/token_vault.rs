use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rand::RngCore;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::models::token::{GoogleTokenRecord, TokenResponse};

/// Authenticated encryption for refresh tokens: AES-256-GCM with a random
/// 12-byte IV per token and the 16-byte auth tag stored separately.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Returns (ciphertext, iv, authentication_tag).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).context("Failed to create cipher")?;

        let mut iv = vec![0u8; 12];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        // aes-gcm appends the 16-byte tag to the ciphertext; split it off
        // so the three parts are stored in separate columns.
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;
        let tag_start = sealed.len().saturating_sub(16);
        let ciphertext = sealed[..tag_start].to_vec();
        let tag = sealed[tag_start..].to_vec();

        Ok((ciphertext, iv, tag))
    }

    /// Fails with CRYPTO_AUTH when any of ciphertext/iv/tag was tampered.
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != 12 {
            anyhow::bail!("IV must be exactly 12 bytes");
        }
        if tag.len() != 16 {
            anyhow::bail!("Authentication tag must be exactly 16 bytes");
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).context("Failed to create cipher")?;
        let nonce = Nonce::from_slice(iv);

        let mut sealed = ciphertext.to_vec();
        sealed.extend_from_slice(tag);

        cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| anyhow::anyhow!("CRYPTO_AUTH: refresh token failed authentication"))
    }
}

/// Encrypted-at-rest storage for per-business Google credentials.
pub struct TokenVault {
    pool: PgPool,
    cipher: TokenCipher,
}

impl TokenVault {
    pub fn new(pool: PgPool, key: [u8; 32]) -> Self {
        Self {
            pool,
            cipher: TokenCipher::new(key),
        }
    }

    pub async fn get_tokens(&self, business_id: &str) -> Result<Option<GoogleTokenRecord>> {
        let record = sqlx::query_as::<_, GoogleTokenRecord>(
            "SELECT business_id, access_token, refresh_token_ct, refresh_token_iv,
                    refresh_token_tag, refresh_token_plain, scope, token_type, expiry
             FROM google_tokens WHERE business_id = $1",
        )
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Upsert the credential row from a token-endpoint response. The refresh
    /// token (when present) is encrypted before it touches the database; the
    /// legacy plaintext column is always nulled on write.
    pub async fn store_tokens(&self, business_id: &str, tokens: &TokenResponse) -> Result<()> {
        let expiry = tokens
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        let encrypted = tokens
            .refresh_token
            .as_deref()
            .map(|rt| self.cipher.encrypt(rt.as_bytes()))
            .transpose()?;
        let (ct, iv, tag) = match encrypted {
            Some((ct, iv, tag)) => (Some(ct), Some(iv), Some(tag)),
            None => (None, None, None),
        };

        sqlx::query(
            "INSERT INTO google_tokens
                (business_id, access_token, refresh_token_ct, refresh_token_iv,
                 refresh_token_tag, refresh_token_plain, scope, token_type, expiry, updated_at)
             VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $8, NOW())
             ON CONFLICT (business_id) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token_ct = COALESCE(EXCLUDED.refresh_token_ct, google_tokens.refresh_token_ct),
                refresh_token_iv = COALESCE(EXCLUDED.refresh_token_iv, google_tokens.refresh_token_iv),
                refresh_token_tag = COALESCE(EXCLUDED.refresh_token_tag, google_tokens.refresh_token_tag),
                refresh_token_plain = NULL,
                scope = COALESCE(EXCLUDED.scope, google_tokens.scope),
                token_type = COALESCE(EXCLUDED.token_type, google_tokens.token_type),
                expiry = EXCLUDED.expiry,
                updated_at = NOW()",
        )
        .bind(business_id)
        .bind(&tokens.access_token)
        .bind(ct)
        .bind(iv)
        .bind(tag)
        .bind(&tokens.scope)
        .bind(&tokens.token_type)
        .bind(expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a refreshed access token without touching the refresh token.
    pub async fn update_access_token(
        &self,
        business_id: &str,
        access_token: &str,
        expires_in: Option<i64>,
    ) -> Result<()> {
        let expiry = expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
        sqlx::query(
            "UPDATE google_tokens
             SET access_token = $2, expiry = $3, updated_at = NOW()
             WHERE business_id = $1",
        )
        .bind(business_id)
        .bind(access_token)
        .bind(expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Decrypt the stored refresh token. Falls back to the legacy plaintext
    /// column only when no ciphertext exists yet.
    pub fn refresh_token_plaintext(&self, record: &GoogleTokenRecord) -> Result<Option<String>> {
        if record.has_encrypted_refresh() {
            let plaintext = self.cipher.decrypt(
                record.refresh_token_ct.as_deref().unwrap_or_default(),
                record.refresh_token_iv.as_deref().unwrap_or_default(),
                record.refresh_token_tag.as_deref().unwrap_or_default(),
            )?;
            return Ok(Some(String::from_utf8(plaintext)?));
        }
        Ok(record.refresh_token_plain.clone())
    }

    /// One-time sweep: re-encrypt every legacy plaintext refresh token and
    /// null the plaintext column. Idempotent - a second run finds nothing.
    pub async fn migrate_legacy_plaintext(&self) -> Result<u64> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT business_id, refresh_token_plain
             FROM google_tokens
             WHERE refresh_token_plain IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut migrated = 0u64;
        for (business_id, plaintext) in rows {
            let (ct, iv, tag) = self.cipher.encrypt(plaintext.as_bytes())?;
            let result = sqlx::query(
                "UPDATE google_tokens
                 SET refresh_token_ct = $2, refresh_token_iv = $3, refresh_token_tag = $4,
                     refresh_token_plain = NULL, updated_at = NOW()
                 WHERE business_id = $1 AND refresh_token_plain IS NOT NULL",
            )
            .bind(&business_id)
            .bind(ct)
            .bind(iv)
            .bind(tag)
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => {
                    migrated += 1;
                    info!("Re-encrypted legacy refresh token for business {business_id}");
                }
                Err(e) => warn!("Token migration failed for business {business_id}: {e}"),
            }
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new([42u8; 32])
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let c = cipher();
        let plaintext = b"1//0gRefreshTokenValue";
        let (ct, iv, tag) = c.encrypt(plaintext).unwrap();
        assert_ne!(&ct[..], &plaintext[..]);
        assert_eq!(iv.len(), 12);
        assert_eq!(tag.len(), 16);
        let decrypted = c.decrypt(&ct, &iv, &tag).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let c = cipher();
        let (_, iv1, _) = c.encrypt(b"same").unwrap();
        let (_, iv2, _) = c.encrypt(b"same").unwrap();
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let c = cipher();
        let (mut ct, iv, tag) = c.encrypt(b"secret").unwrap();
        ct[0] ^= 1;
        let err = c.decrypt(&ct, &iv, &tag).unwrap_err();
        assert!(err.to_string().contains("CRYPTO_AUTH"));
    }

    #[test]
    fn tampered_iv_fails_auth() {
        let c = cipher();
        let (ct, mut iv, tag) = c.encrypt(b"secret").unwrap();
        iv[0] ^= 1;
        assert!(c.decrypt(&ct, &iv, &tag).is_err());
    }

    #[test]
    fn tampered_tag_fails_auth() {
        let c = cipher();
        let (ct, iv, mut tag) = c.encrypt(b"secret").unwrap();
        tag[15] ^= 1;
        let err = c.decrypt(&ct, &iv, &tag).unwrap_err();
        assert!(err.to_string().contains("CRYPTO_AUTH"));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let (ct, iv, tag) = cipher().encrypt(b"secret").unwrap();
        let other = TokenCipher::new([7u8; 32]);
        assert!(other.decrypt(&ct, &iv, &tag).is_err());
    }
}
