use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Database entity for issued refresh tokens (the token ledger)
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "refresh_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(column_type = "Uuid")]
    pub account_id: Uuid,
    /// Hex SHA-256 digest of the issued token string
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Successor issued when this token was rotated
    pub replaced_by: Option<Uuid>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// A token is live iff it has not been revoked and has not expired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_in: Duration, revoked: bool) -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            token_hash: "ab".repeat(32),
            issued_at: now,
            expires_at: now + expires_in,
            revoked_at: revoked.then_some(now),
            replaced_by: None,
        }
    }

    #[test]
    fn liveness_requires_unrevoked_and_unexpired() {
        let now = Utc::now();
        assert!(token(Duration::days(7), false).is_live_at(now));
        assert!(!token(Duration::days(7), true).is_live_at(now));
        assert!(!token(Duration::seconds(-1), false).is_live_at(now));
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let t = token(Duration::days(1), false);
        assert!(!t.is_live_at(t.expires_at));
    }
}
