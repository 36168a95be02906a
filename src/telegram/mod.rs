//! Telegram integration: Bot API membership checks and WebApp init data
//! verification.
//!
//! Both are consumed by the dispatcher through traits so tests can substitute
//! deterministic fakes.

mod init_data;
mod membership;

pub use init_data::{IdentityVerifier, InitDataError, InitDataVerifier, VerifiedIdentity};
pub use membership::{
    normalize_chat_id, MembershipClient, MembershipError, MembershipStatus, TelegramClient,
};

#[cfg(test)]
pub(crate) use init_data::sign_init_data;
