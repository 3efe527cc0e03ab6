use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::TokenPair;
use crate::entities::{account, Role};

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 30))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8))]
    pub password: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    pub role: Option<Role>,
}

/// Minimal non-secret account view returned on login and registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

impl From<&account::Model> for AccountSummary {
    fn from(model: &account::Model) -> Self {
        Self {
            id: model.id,
            username: model.username.clone(),
            role: model.role,
        }
    }
}

/// Login response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub account: AccountSummary,
    #[serde(flatten)]
    pub tokens: TokenPair,
}
