use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::password::{hash_blocking, verify_blocking, PasswordHasher};
use super::token_ledger::TokenLedger;
use super::{
    AccessClaims, AccountSummary, AuthConfig, AuthError, AuthUser, LoginResponse, TokenPair,
};
use crate::entities::account::{self, Entity as Account};

/// Hashed once and verified against when the username is unknown, so a failed login
/// costs the same whether or not the account exists.
const TIMING_EQUALIZER_PASSWORD: &str = "kodbank-unknown-account";

/// Issues, verifies, rotates and revokes access/refresh token pairs.
///
/// Refresh tokens are single-use. The ledger lookup decides which branch a presented
/// token takes:
///
/// | ledger state       | outcome                                                 |
/// |--------------------|---------------------------------------------------------|
/// | live               | revoke it, issue a new pair                             |
/// | expired            | `RefreshTokenExpired`                                   |
/// | revoked            | revoke every token of the account, `TokenReuseDetected` |
/// | absent, authentic  | revoke every token of the account, `TokenReuseDetected` |
/// | absent, forged     | `InvalidRefreshToken`                                   |
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<AuthConfig>,
    db: Arc<DatabaseConnection>,
    hasher: Arc<dyn PasswordHasher>,
    dummy_hash: Arc<OnceCell<String>>,
}

impl SessionManager {
    pub fn new(
        config: AuthConfig,
        db: Arc<DatabaseConnection>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            hasher,
            dummy_hash: Arc::new(OnceCell::new()),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Verify credentials and open a new session.
    ///
    /// Unknown usernames, soft-deleted accounts and wrong passwords all fail with
    /// [`AuthError::InvalidCredentials`].
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let db = &*self.db;

        let account = Account::find()
            .filter(account::Column::Username.eq(username))
            .filter(account::Column::DeletedAt.is_null())
            .one(db)
            .await?
            .filter(|account| account.is_active());

        let Some(account) = account else {
            let dummy = self.dummy_hash().await?;
            let _ = verify_blocking(self.hasher.clone(), password.to_string(), dummy).await;
            counter!("kodbank_auth.login_failed", 1);
            debug!("Login rejected");
            return Err(AuthError::InvalidCredentials);
        };

        let verified = verify_blocking(
            self.hasher.clone(),
            password.to_string(),
            account.password_hash.clone(),
        )
        .await
        .map_err(|e| AuthError::HashError(e.0))?;

        if !verified {
            counter!("kodbank_auth.login_failed", 1);
            debug!("Login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let tokens = self
            .issue_pair(db, &account, Utc::now(), Uuid::new_v4())
            .await?;

        counter!("kodbank_auth.login", 1);
        info!(account_id = %account.id, "Account logged in");

        Ok(LoginResponse {
            account: AccountSummary::from(&account),
            tokens,
        })
    }

    /// Exchange a refresh token for a new pair, rotating the presented token.
    #[instrument(skip(self, presented))]
    pub async fn refresh(&self, presented: &str) -> Result<TokenPair, AuthError> {
        let now = Utc::now();

        match TokenLedger::find_by_token(&*self.db, presented).await? {
            None => match self.config.decode_refresh_token(presented, false) {
                // Authentic but unknown: issued by us and no longer tracked as live.
                Ok(claims) => Err(self.lock_out(claims.sub, "unknown authentic token").await),
                Err(_) => Err(AuthError::InvalidRefreshToken),
            },
            Some(record) if record.is_revoked() => {
                Err(self.lock_out(record.account_id, "revoked token presented").await)
            }
            Some(record) => {
                if !record.is_live_at(now) {
                    return Err(AuthError::RefreshTokenExpired);
                }

                let claims = self
                    .config
                    .decode_refresh_token(presented, true)
                    .map_err(|_| AuthError::RefreshTokenExpired)?;
                if claims.sub != record.account_id {
                    return Err(AuthError::InvalidRefreshToken);
                }

                self.rotate(record.id, record.account_id, now).await
            }
        }
    }

    /// Revoke `old_token_id` and issue its successor in one transaction.
    async fn rotate(
        &self,
        old_token_id: Uuid,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let txn = self.db.begin().await?;
        let successor_id = Uuid::new_v4();

        if !TokenLedger::revoke_if_live(&txn, old_token_id, now, Some(successor_id)).await? {
            // A concurrent refresh consumed this token between our read and our write.
            txn.rollback().await?;
            return Err(self.lock_out(account_id, "concurrent rotation").await);
        }

        let account = Account::find_by_id(account_id)
            .one(&txn)
            .await?
            .filter(|account| account.is_active());
        let Some(account) = account else {
            txn.rollback().await?;
            return Err(AuthError::InvalidRefreshToken);
        };

        let tokens = self.issue_pair(&txn, &account, now, successor_id).await?;
        txn.commit().await?;

        counter!("kodbank_auth.refresh", 1);
        debug!(account_id = %account_id, "Refresh token rotated");
        Ok(tokens)
    }

    /// Revoke the presented refresh token. Unknown or already-revoked tokens are a no-op.
    #[instrument(skip(self, presented))]
    pub async fn logout(&self, presented: &str) -> Result<(), AuthError> {
        let revoked = TokenLedger::revoke_by_token(&*self.db, presented, Utc::now()).await?;
        debug!(revoked, "Logout processed");
        Ok(())
    }

    /// Revoke every refresh token of an account ("log out everywhere").
    #[instrument(skip(self))]
    pub async fn revoke_all_sessions(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let revoked =
            TokenLedger::revoke_all_for_account(&*self.db, account_id, Utc::now()).await?;
        info!(account_id = %account_id, revoked, "Revoked all sessions");
        Ok(revoked)
    }

    /// Number of live refresh tokens for an account
    pub async fn live_session_count(&self, account_id: Uuid) -> Result<u64, AuthError> {
        Ok(TokenLedger::count_live_for_account(&*self.db, account_id, Utc::now()).await?)
    }

    /// Stateless access-token check: signature, issuer, audience and expiry only.
    /// Access tokens are not individually revocable; their lifetime is the bound.
    pub fn verify_access(&self, access_token: &str) -> Result<AccessClaims, AuthError> {
        self.config
            .decode_access_token(access_token)
            .map_err(|_| AuthError::Unauthorized)
    }

    /// [`verify_access`](Self::verify_access) producing the request principal
    pub fn authenticate(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        self.verify_access(access_token).map(AuthUser::from)
    }

    async fn issue_pair<C: ConnectionTrait>(
        &self,
        conn: &C,
        account: &account::Model,
        now: DateTime<Utc>,
        refresh_id: Uuid,
    ) -> Result<TokenPair, AuthError> {
        let (access_token, _) = self.config.sign_access_token(account, now)?;
        let (refresh_token, refresh_expires_at) =
            self.config.sign_refresh_token(account.id, now)?;

        TokenLedger::insert(
            conn,
            refresh_id,
            account.id,
            &refresh_token,
            now,
            refresh_expires_at,
        )
        .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_expiration.as_secs() as i64,
            refresh_expires_in: self.config.refresh_token_expiration.as_secs() as i64,
        })
    }

    /// Reuse response: revoke every token of the account before surfacing the error.
    /// If the revocation itself fails the caller gets an internal error instead,
    /// since the lockout did not happen.
    async fn lock_out(&self, account_id: Uuid, reason: &'static str) -> AuthError {
        match TokenLedger::revoke_all_for_account(&*self.db, account_id, Utc::now()).await {
            Ok(revoked) => {
                counter!("kodbank_auth.token_reuse_detected", 1);
                warn!(
                    account_id = %account_id,
                    revoked,
                    reason,
                    "Refresh token reuse detected; all sessions revoked"
                );
                AuthError::TokenReuseDetected
            }
            Err(e) => {
                error!(account_id = %account_id, error = %e, "Failed to revoke sessions after token reuse");
                AuthError::DatabaseError(e)
            }
        }
    }

    async fn dummy_hash(&self) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        self.dummy_hash
            .get_or_try_init(|| async move {
                hash_blocking(hasher, TIMING_EQUALIZER_PASSWORD.to_string()).await
            })
            .await
            .map(Clone::clone)
            .map_err(|e| AuthError::HashError(e.0))
    }
}
