//! Completion checks, one per task kind.
//!
//! Each strategy answers "is this task complete right now?" and never grants
//! anything itself; the dispatcher owns the grant.
//!
//! # Design Principles
//! - Input validation happens before any store mutation
//! - Strategies take their collaborators explicitly
//! - Pure decisions are separated from the IO that feeds them

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::progress::{ProgressRecord, TaskView, VisitPhase};
use super::task::TaskError;
use crate::telegram::{normalize_chat_id, IdentityVerifier, MembershipClient};

/// Strategy-specific input supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyInput {
    /// Signed Telegram WebApp init data (join-channel tasks only)
    #[serde(default)]
    pub telegram_init_data: Option<String>,
}

/// A strategy's judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Completed,
    Pending,
}

/// Result of an evaluation. Failures are carried as `Err(TaskError)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completed now or earlier; the reward has been granted exactly once
    Completed(TaskView),

    /// Criteria not met yet; poll again later
    Pending(TaskView),
}

impl Outcome {
    pub fn view(&self) -> &TaskView {
        match self {
            Self::Completed(view) | Self::Pending(view) => view,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Membership check against a Telegram channel or group.
pub struct JoinChannelStrategy<'a> {
    membership: &'a dyn MembershipClient,
}

impl<'a> JoinChannelStrategy<'a> {
    pub fn new(membership: &'a dyn MembershipClient) -> Self {
        Self { membership }
    }

    /// Verify the signed payload and extract the caller's Telegram user id.
    ///
    /// # Errors
    /// `TaskError::Validation` when the payload is absent, fails
    /// verification, or carries no user.
    pub fn external_user_id(
        verifier: &dyn IdentityVerifier,
        input: &StrategyInput,
        now: DateTime<Utc>,
    ) -> Result<i64, TaskError> {
        let raw = input
            .telegram_init_data
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| TaskError::Validation("Invalid request".to_string()))?;

        let identity = verifier
            .verify(raw, now)
            .map_err(|e| TaskError::Validation(format!("Invalid Telegram data: {}", e)))?;

        identity
            .user_id
            .ok_or_else(|| TaskError::Validation("Invalid user data".to_string()))
    }

    /// Ask the platform whether `external_user_id` has joined `chat_id`.
    ///
    /// # Errors
    /// `TaskError::ExternalService` on transport or API failure; not retried.
    pub async fn check(&self, chat_id: &str, external_user_id: i64) -> Result<Verdict, TaskError> {
        let chat = normalize_chat_id(chat_id);
        let status = self
            .membership
            .membership_status(&chat, external_user_id)
            .await
            .map_err(|e| {
                tracing::warn!("Membership lookup for {} failed: {}", chat, e);
                TaskError::ExternalService(e.to_string())
            })?;

        tracing::debug!("User {} has status {:?} in {}", external_user_id, status, chat);
        Ok(if status.is_joined() {
            Verdict::Completed
        } else {
            Verdict::Pending
        })
    }
}

/// Threshold on referrals whose referrer reward is still outstanding.
pub struct ReferralStrategy;

impl ReferralStrategy {
    pub fn check(unrewarded: u64, required: u64) -> Verdict {
        if unrewarded >= required {
            Verdict::Completed
        } else {
            Verdict::Pending
        }
    }
}

/// What the visit timer needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStep {
    /// Record the start time, then report pending
    Start,
    /// Timer running
    Wait { remaining_ms: i64 },
    /// Wait elapsed
    Complete,
}

/// Two-phase timer: the first check starts it, a later one completes it.
pub struct VisitStrategy;

impl VisitStrategy {
    pub fn step(progress: &ProgressRecord, now: DateTime<Utc>, wait_seconds: u64) -> VisitStep {
        match progress.visit_phase(now, wait_seconds) {
            VisitPhase::NotStarted => VisitStep::Start,
            VisitPhase::Started { remaining_ms } => VisitStep::Wait { remaining_ms },
            VisitPhase::Elapsed | VisitPhase::Completed => VisitStep::Complete,
        }
    }
}

impl From<VisitStep> for Verdict {
    /// Starting the timer never completes the task in the same call.
    fn from(step: VisitStep) -> Self {
        match step {
            VisitStep::Start | VisitStep::Wait { .. } => Verdict::Pending,
            VisitStep::Complete => Verdict::Completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{
        sign_init_data, InitDataVerifier, MembershipError, MembershipStatus,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    const TOKEN: &str = "42:SECRET";

    struct StubMembership {
        reply: Result<MembershipStatus, MembershipError>,
        asked: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl MembershipClient for StubMembership {
        async fn membership_status(
            &self,
            chat_id: &str,
            user_id: i64,
        ) -> Result<MembershipStatus, MembershipError> {
            self.asked
                .lock()
                .unwrap()
                .push((chat_id.to_string(), user_id));
            self.reply.clone()
        }
    }

    fn stub(reply: Result<MembershipStatus, MembershipError>) -> StubMembership {
        StubMembership {
            reply,
            asked: Mutex::new(Vec::new()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_100, 0).unwrap()
    }

    fn input(raw: Option<String>) -> StrategyInput {
        StrategyInput {
            telegram_init_data: raw,
        }
    }

    #[test]
    fn external_user_id_from_signed_payload() {
        let verifier = InitDataVerifier::new(TOKEN, None);
        let raw = sign_init_data(TOKEN, &[("user", r#"{"id":99}"#), ("auth_date", "1700000000")]);
        assert_eq!(
            JoinChannelStrategy::external_user_id(&verifier, &input(Some(raw)), now()),
            Ok(99)
        );
    }

    #[test]
    fn external_user_id_rejects_bad_input() {
        let verifier = InitDataVerifier::new(TOKEN, None);

        assert_eq!(
            JoinChannelStrategy::external_user_id(&verifier, &input(None), now()),
            Err(TaskError::Validation("Invalid request".to_string()))
        );

        let forged = sign_init_data("1:OTHER", &[("user", r#"{"id":99}"#)]);
        assert_eq!(
            JoinChannelStrategy::external_user_id(&verifier, &input(Some(forged)), now()),
            Err(TaskError::Validation("Invalid Telegram data: Hash mismatch".to_string()))
        );

        let anonymous = sign_init_data(TOKEN, &[("auth_date", "1700000000")]);
        assert_eq!(
            JoinChannelStrategy::external_user_id(&verifier, &input(Some(anonymous)), now()),
            Err(TaskError::Validation("Invalid user data".to_string()))
        );
    }

    #[tokio::test]
    async fn membership_status_maps_to_verdict() {
        for (status, verdict) in [
            (MembershipStatus::Creator, Verdict::Completed),
            (MembershipStatus::Administrator, Verdict::Completed),
            (MembershipStatus::Member, Verdict::Completed),
            (MembershipStatus::Left, Verdict::Pending),
            (MembershipStatus::Kicked, Verdict::Pending),
            (MembershipStatus::Restricted, Verdict::Pending),
            (MembershipStatus::Other("banned".to_string()), Verdict::Pending),
        ] {
            let client = stub(Ok(status.clone()));
            let got = JoinChannelStrategy::new(&client).check("news", 7).await;
            assert_eq!(got, Ok(verdict), "status {:?}", status);
            assert_eq!(*client.asked.lock().unwrap(), vec![("@news".to_string(), 7)]);
        }
    }

    #[tokio::test]
    async fn membership_failure_is_external_service_error() {
        let client = stub(Err(MembershipError::Transport("timed out".to_string())));
        let got = JoinChannelStrategy::new(&client).check("-1001", 7).await;
        assert!(matches!(got, Err(TaskError::ExternalService(_))));
        assert_eq!(client.asked.lock().unwrap()[0].0, "-1001");
    }

    #[test]
    fn referral_threshold() {
        assert_eq!(ReferralStrategy::check(2, 3), Verdict::Pending);
        assert_eq!(ReferralStrategy::check(3, 3), Verdict::Completed);
        assert_eq!(ReferralStrategy::check(5, 3), Verdict::Completed);
        assert_eq!(ReferralStrategy::check(0, 1), Verdict::Pending);
    }

    #[test]
    fn visit_steps() {
        let mut progress = ProgressRecord::new(1, "u", 1);
        assert_eq!(VisitStrategy::step(&progress, now(), 10), VisitStep::Start);
        assert_eq!(Verdict::from(VisitStep::Start), Verdict::Pending);

        progress.started_at = Some(now());
        assert_eq!(
            VisitStrategy::step(&progress, now() + Duration::seconds(3), 10),
            VisitStep::Wait { remaining_ms: 7000 }
        );
        assert_eq!(
            VisitStrategy::step(&progress, now() + Duration::seconds(11), 10),
            VisitStep::Complete
        );
        assert_eq!(Verdict::from(VisitStep::Complete), Verdict::Completed);
    }
}
