pub mod message;
pub mod notification;
pub mod request;

pub use message::*;
pub use notification::*;
pub use request::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The slice of a user profile the delivery core needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub nickname: String,
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub nickname: String,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: i64,
    pub creator_id: i64,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl NewGroup {
    pub fn validate(&self) -> crate::error::AppResult<()> {
        if self.title.trim().is_empty() {
            return Err(crate::error::AppError::Validation(
                "group title must not be empty".into(),
            ));
        }
        Ok(())
    }
}
