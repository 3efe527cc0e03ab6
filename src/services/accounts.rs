use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set, SqlErr, TransactionError, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::ledger::{validate_amount, LedgerService};
use crate::auth::password::{hash_blocking, PasswordHasher};
use crate::auth::{AccountSummary, RegisterRequest};
use crate::entities::account::{self, AccountStatus, Entity as Account};
use crate::errors::ServiceError;

const OPENING_BALANCE_DESCRIPTION: &str = "Opening balance";

/// Registration, lookup and soft deletion of accounts.
///
/// Balances are never written here directly; the opening credit goes through the
/// ledger so the transaction log reconciles from zero.
#[derive(Clone)]
pub struct AccountService {
    db: Arc<DatabaseConnection>,
    hasher: Arc<dyn PasswordHasher>,
    opening_balance: Decimal,
}

impl AccountService {
    pub fn new(db: Arc<DatabaseConnection>, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self {
            db,
            hasher,
            opening_balance: Decimal::ZERO,
        }
    }

    pub fn with_opening_balance(mut self, opening_balance: Decimal) -> Self {
        self.opening_balance = opening_balance;
        self
    }

    /// Create an account and credit the opening balance in the same transaction.
    #[instrument(skip(self, request), fields(username = %request.username))]
    pub async fn register(
        &self,
        mut request: RegisterRequest,
    ) -> Result<AccountSummary, ServiceError> {
        request.username = request.username.trim().to_string();
        request.email = request.email.trim().to_lowercase();
        request.validate()?;

        let opening_cents = if self.opening_balance > Decimal::ZERO {
            Some(validate_amount(self.opening_balance)?)
        } else {
            None
        };
        let username = request.username;
        let email = request.email;

        // Uniqueness spans soft-deleted rows too; the unique indexes are global.
        if self.count_where(account::Column::Username.eq(username.as_str())).await? > 0 {
            return Err(ServiceError::DuplicateUsername);
        }
        if self.count_where(account::Column::Email.eq(email.as_str())).await? > 0 {
            return Err(ServiceError::DuplicateEmail);
        }

        let password_hash = hash_blocking(self.hasher.clone(), request.password)
            .await
            .map_err(|e| ServiceError::HashError(e.0))?;

        let now = Utc::now();
        let new_account = account::ActiveModel {
            id: Set(Uuid::new_v4()),
            username: Set(username),
            email: Set(email),
            password_hash: Set(password_hash),
            phone: Set(request.phone.filter(|phone| !phone.trim().is_empty())),
            balance_cents: Set(0),
            role: Set(request.role.unwrap_or_default()),
            status: Set(AccountStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
        };
        let account = self
            .db
            .transaction::<_, account::Model, ServiceError>(move |txn| {
                Box::pin(async move {
                    let account = new_account.insert(txn).await.map_err(duplicate_or_db)?;
                    if let Some(cents) = opening_cents {
                        LedgerService::apply_deposit(
                            txn,
                            account.id,
                            cents,
                            Some(OPENING_BALANCE_DESCRIPTION.to_string()),
                        )
                        .await?;
                    }
                    Ok(account)
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(e) => ServiceError::DatabaseError(e),
                TransactionError::Transaction(e) => e,
            })?;

        info!(account_id = %account.id, "Account registered");
        Ok(AccountSummary::from(&account))
    }

    /// Active account by id
    pub async fn find(&self, account_id: Uuid) -> Result<AccountSummary, ServiceError> {
        Account::find_by_id(account_id)
            .one(&*self.db)
            .await?
            .filter(|account| account.is_active())
            .map(|account| AccountSummary::from(&account))
            .ok_or(ServiceError::AccountNotFound)
    }

    /// Soft delete. Calling it on an already-deleted account is a no-op.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, account_id: Uuid) -> Result<(), ServiceError> {
        let account = Account::find_by_id(account_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        if !account.is_active() {
            return Ok(());
        }

        if account.balance_cents > 0 {
            warn!(account_id = %account_id, balance = %account.balance(), "Deactivating account with funds");
        }

        let now = Utc::now();
        let mut active: account::ActiveModel = account.into();
        active.status = Set(AccountStatus::Deleted);
        active.deleted_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&*self.db).await?;

        info!(account_id = %account_id, "Account deactivated");
        Ok(())
    }

    async fn count_where(
        &self,
        condition: sea_orm::sea_query::SimpleExpr,
    ) -> Result<u64, ServiceError> {
        Ok(Account::find().filter(condition).count(&*self.db).await?)
    }
}

/// A concurrent registration can slip past the pre-checks; the unique index
/// still catches it and the violation is reported as the matching duplicate.
fn duplicate_or_db(err: DbErr) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(message)) => {
            let message = message.to_lowercase();
            if message.contains("username") {
                ServiceError::DuplicateUsername
            } else if message.contains("email") {
                ServiceError::DuplicateEmail
            } else {
                ServiceError::DatabaseError(err)
            }
        }
        _ => ServiceError::DatabaseError(err),
    }
}
