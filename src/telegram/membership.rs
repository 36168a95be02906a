//! Bot API client for chat membership lookups.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::TelegramConfig;

/// A user's relationship to a chat, as reported by `getChatMember`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
    Other(String),
}

impl MembershipStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "creator" => Self::Creator,
            "administrator" => Self::Administrator,
            "member" => Self::Member,
            "restricted" => Self::Restricted,
            "left" => Self::Left,
            "kicked" => Self::Kicked,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only owners, admins and plain members count as joined.
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Creator | Self::Administrator | Self::Member)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    #[error("Failed to check membership: {0}")]
    Transport(String),

    #[error("Failed to check membership: HTTP {status}")]
    Http { status: u16, body: String },

    #[error("Failed to check membership: {0}")]
    Api(String),
}

/// Queries an external platform for a user's membership in a chat.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    async fn membership_status(
        &self,
        chat_id: &str,
        user_id: i64,
    ) -> Result<MembershipStatus, MembershipError>;
}

/// Prefix bare usernames with `@`; keep `@name` and `-100...` supergroup ids as is.
pub fn normalize_chat_id(chat_id: &str) -> String {
    if chat_id.starts_with('@') || chat_id.starts_with("-100") {
        chat_id.to_string()
    } else {
        format!("@{}", chat_id)
    }
}

#[derive(Debug, Deserialize)]
struct BotResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

#[derive(Clone)]
pub struct TelegramClient {
    api_url: String,
    bot_token: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self, MembershipError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MembershipError::Transport(e.to_string()))?;
        let mut api_url = config.api_url.clone();
        while api_url.ends_with('/') {
            api_url.pop();
        }
        Ok(Self {
            api_url,
            bot_token: config.bot_token.clone(),
            client,
        })
    }

    fn chat_member_url(&self, chat_id: &str, user_id: i64) -> String {
        format!(
            "{}/bot{}/getChatMember?chat_id={}&user_id={}",
            self.api_url,
            self.bot_token,
            urlencoding::encode(chat_id),
            user_id
        )
    }
}

#[async_trait]
impl MembershipClient for TelegramClient {
    async fn membership_status(
        &self,
        chat_id: &str,
        user_id: i64,
    ) -> Result<MembershipStatus, MembershipError> {
        // The URL embeds the bot token; never log it.
        let resp = self
            .client
            .get(self.chat_member_url(chat_id, user_id))
            .send()
            .await
            .map_err(|e| MembershipError::Transport(e.without_url().to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            tracing::warn!("getChatMember failed for chat {}: {} - {}", chat_id, status, text);
            return Err(MembershipError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let body: BotResponse<ChatMember> = serde_json::from_str(&text)
            .map_err(|e| MembershipError::Api(format!("unparsable response: {}", e)))?;
        tracing::debug!("getChatMember response for chat {}: {}", chat_id, text);

        match body {
            BotResponse {
                ok: true,
                result: Some(member),
                ..
            } => Ok(MembershipStatus::parse(&member.status)),
            BotResponse { description, .. } => Err(MembershipError::Api(
                description.unwrap_or_else(|| "request was not ok".to_string()),
            )),
        }
    }
}
