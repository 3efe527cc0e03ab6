//! Durable refresh-token ledger.
//!
//! Every operation takes any [`ConnectionTrait`] so it can run on the pool or inside
//! an open transaction. Rows are keyed by the SHA-256 digest of the token string and
//! are revoked, never deleted.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::entities::refresh_token::{self, Column, Entity as RefreshToken};

/// Hex-encoded SHA-256 of a presented token
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct TokenLedger;

impl TokenLedger {
    pub async fn insert<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        account_id: Uuid,
        token: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<refresh_token::Model, DbErr> {
        refresh_token::ActiveModel {
            id: Set(id),
            account_id: Set(account_id),
            token_hash: Set(token_digest(token)),
            issued_at: Set(issued_at),
            expires_at: Set(expires_at),
            revoked_at: Set(None),
            replaced_by: Set(None),
        }
        .insert(conn)
        .await
    }

    /// Ledger row for `token`, live or not
    pub async fn find_by_token<C: ConnectionTrait>(
        conn: &C,
        token: &str,
    ) -> Result<Option<refresh_token::Model>, DbErr> {
        RefreshToken::find()
            .filter(Column::TokenHash.eq(token_digest(token)))
            .one(conn)
            .await
    }

    /// Revoke one row only if nobody revoked it first. Returns `false` when the row was
    /// already revoked, which during rotation means a concurrent refresh consumed it.
    pub async fn revoke_if_live<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        now: DateTime<Utc>,
        replaced_by: Option<Uuid>,
    ) -> Result<bool, DbErr> {
        let result = RefreshToken::update_many()
            .col_expr(Column::RevokedAt, Expr::value(now))
            .col_expr(Column::ReplacedBy, Expr::value(replaced_by))
            .filter(Column::Id.eq(id))
            .filter(Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Revoke the row matching `token` if it is still unrevoked. Unknown tokens are a no-op.
    pub async fn revoke_by_token<C: ConnectionTrait>(
        conn: &C,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        let result = RefreshToken::update_many()
            .col_expr(Column::RevokedAt, Expr::value(now))
            .filter(Column::TokenHash.eq(token_digest(token)))
            .filter(Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Batched revoke of every unrevoked token belonging to `account_id`
    pub async fn revoke_all_for_account<C: ConnectionTrait>(
        conn: &C,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        let result = RefreshToken::update_many()
            .col_expr(Column::RevokedAt, Expr::value(now))
            .filter(Column::AccountId.eq(account_id))
            .filter(Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn count_live_for_account<C: ConnectionTrait>(
        conn: &C,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        RefreshToken::find()
            .filter(Column::AccountId.eq(account_id))
            .filter(Column::RevokedAt.is_null())
            .filter(Column::ExpiresAt.gt(now))
            .count(conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex_sha256() {
        let digest = token_digest("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.len(), 64);
        assert_ne!(token_digest("abd"), digest);
    }
}
