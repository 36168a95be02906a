//! Telegram WebApp init data verification.
//!
//! Init data is a URL-encoded query string signed by Telegram:
//! - `secret_key = HMAC_SHA256(key = "WebAppData", msg = bot_token)`
//! - `hash = hex(HMAC_SHA256(key = secret_key, msg = data_check_string))`
//!
//! where `data_check_string` is every field except `hash`, formatted as
//! `key=value`, sorted, and joined with `\n`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitDataError {
    #[error("Hash is missing from init data")]
    MissingHash,

    #[error("Hash mismatch")]
    InvalidSignature,

    #[error("Init data is expired")]
    Expired,

    #[error("Malformed init data: {0}")]
    Malformed(String),
}

/// Identity extracted from verified init data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Telegram user id, absent when the payload carries no `user` object
    pub user_id: Option<i64>,
    pub auth_date: Option<DateTime<Utc>>,
}

/// Validates a signed client payload and extracts the trusted external identity.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, raw: &str, now: DateTime<Utc>) -> Result<VerifiedIdentity, InitDataError>;
}

/// Verifies init data signed with a bot token.
pub struct InitDataVerifier {
    bot_token: String,
    max_age: Option<Duration>,
}

impl InitDataVerifier {
    pub fn new(bot_token: impl Into<String>, max_age: Option<std::time::Duration>) -> Self {
        Self {
            bot_token: bot_token.into(),
            max_age: max_age.and_then(|d| Duration::from_std(d).ok()),
        }
    }
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Result<Vec<u8>, InitDataError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| InitDataError::Malformed(e.to_string()))?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// MAC over `data_check_string` keyed by the bot token's derived secret.
fn signing_mac(bot_token: &str, data_check_string: &str) -> Result<HmacSha256, InitDataError> {
    let secret = hmac_sha256(b"WebAppData", bot_token.as_bytes())?;
    let mut mac =
        HmacSha256::new_from_slice(&secret).map_err(|e| InitDataError::Malformed(e.to_string()))?;
    mac.update(data_check_string.as_bytes());
    Ok(mac)
}

fn data_check_string(fields: &[(String, String)]) -> String {
    let mut lines: Vec<String> = fields
        .iter()
        .filter(|(k, _)| k != "hash")
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    lines.sort();
    lines.join("\n")
}

impl IdentityVerifier for InitDataVerifier {
    fn verify(&self, raw: &str, now: DateTime<Utc>) -> Result<VerifiedIdentity, InitDataError> {
        let fields: Vec<(String, String)> = url::form_urlencoded::parse(raw.trim().as_bytes())
            .into_owned()
            .collect();

        let hash = fields
            .iter()
            .find(|(k, _)| k == "hash")
            .map(|(_, v)| v.trim())
            .ok_or(InitDataError::MissingHash)?;
        let provided = hex::decode(hash).map_err(|_| InitDataError::InvalidSignature)?;

        signing_mac(&self.bot_token, &data_check_string(&fields))?
            .verify_slice(&provided)
            .map_err(|_| InitDataError::InvalidSignature)?;

        let auth_date = match fields.iter().find(|(k, _)| k == "auth_date") {
            Some((_, v)) => {
                let secs: i64 = v
                    .parse()
                    .map_err(|_| InitDataError::Malformed("auth_date is not a number".to_string()))?;
                Some(
                    Utc.timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| InitDataError::Malformed("auth_date out of range".to_string()))?,
                )
            }
            None => None,
        };

        if let Some(max_age) = self.max_age {
            match auth_date {
                Some(at) if now - at > max_age => return Err(InitDataError::Expired),
                Some(_) => {}
                None => return Err(InitDataError::Malformed("auth_date is missing".to_string())),
            }
        }

        let user_id = match fields.iter().find(|(k, _)| k == "user") {
            Some((_, v)) => {
                let user: serde_json::Value = serde_json::from_str(v)
                    .map_err(|e| InitDataError::Malformed(format!("user: {}", e)))?;
                user.get("id").and_then(|id| id.as_i64())
            }
            None => None,
        };

        Ok(VerifiedIdentity { user_id, auth_date })
    }
}

/// Build signed init data for `fields` (test fixture).
#[cfg(test)]
pub(crate) fn sign_init_data(bot_token: &str, fields: &[(&str, &str)]) -> String {
    let owned: Vec<(String, String)> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mac = signing_mac(bot_token, &data_check_string(&owned)).unwrap();
    let hash = hex::encode(mac.finalize().into_bytes());
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in fields {
        serializer.append_pair(k, v);
    }
    serializer.append_pair("hash", &hash);
    serializer.finish()
}
