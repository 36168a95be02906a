//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::task::StrategyInput;

/// Body of `POST /api/tasks/check`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTaskRequest {
    /// Task to check
    pub task_id: i64,

    /// Signed Telegram WebApp init data (join-channel tasks)
    #[serde(default)]
    pub telegram_init_data: Option<String>,
}

impl CheckTaskRequest {
    pub fn strategy_input(&self) -> StrategyInput {
        StrategyInput {
            telegram_init_data: self.telegram_init_data.clone(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Whether the progress store survives restarts
    pub persistent_store: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_request_uses_camel_case() {
        let req: CheckTaskRequest =
            serde_json::from_str(r#"{"taskId": 4, "telegramInitData": "a=b&hash=c"}"#).unwrap();
        assert_eq!(req.task_id, 4);
        assert_eq!(
            req.strategy_input().telegram_init_data.as_deref(),
            Some("a=b&hash=c")
        );

        let bare: CheckTaskRequest = serde_json::from_str(r#"{"taskId": 4}"#).unwrap();
        assert!(bare.telegram_init_data.is_none());
    }
}
