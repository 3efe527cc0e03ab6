//! Funds movement between accounts.
//!
//! Every balance mutation runs inside one database transaction together with the
//! append of its [`transaction`] row, so either all writes are visible or none are.
//! Amounts are integer cents (see [`crate::money`]), so the SQL arithmetic is exact.
//! The debit is a guarded `UPDATE ... WHERE balance_cents >= amount`; its affected-row
//! count is the authoritative overdraft check on every backend.
//!
//! Each unit takes its write locks before the first precondition read, see
//! [`lock_accounts`].

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionError,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::db;
use crate::entities::{
    account::{self, Entity as Account},
    transaction::{self, Entity as Transaction, TransactionStatus, TransactionType},
};
use crate::errors::ServiceError;
use crate::money;

/// Largest number of fractional digits accepted for an amount
pub const MAX_AMOUNT_SCALE: u32 = money::CENT_SCALE;
/// Longest description accepted on a ledger entry, in characters
pub const MAX_DESCRIPTION_LEN: usize = 255;

const DEFAULT_PAGE_SIZE: u64 = 10;
const MAX_PAGE_SIZE: u64 = 100;

/// Result of a committed ledger operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub reference_id: Uuid,
    pub transaction_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    /// Balance of the acting account (sender, depositor or withdrawer) after commit
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One history row as seen from a specific account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: Uuid,
    pub reference_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    /// Signed effect on the viewing account's balance
    pub delta: Decimal,
    pub sender_id: Option<Uuid>,
    pub sender_username: Option<String>,
    pub receiver_id: Option<Uuid>,
    pub receiver_username: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    /// `limit == 0` yields zero pages.
    pub fn new(page: u64, limit: u64, total: u64) -> Self {
        Self {
            page,
            limit,
            total,
            total_pages: if limit == 0 { 0 } else { total.div_ceil(limit) },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub transactions: Vec<TransactionView>,
    pub pagination: Pagination,
}

/// Audit of the balance field against the transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: Uuid,
    pub balance: Decimal,
    /// Credits minus debits over the account's COMPLETED rows
    pub ledger_net: Decimal,
    pub consistent: bool,
}

/// Rejects zero, negative and sub-cent amounts. Returns the amount in cents.
pub fn validate_amount(amount: Decimal) -> Result<i64, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::InvalidAmount);
    }
    money::to_cents(amount).ok_or(ServiceError::InvalidAmount)
}

/// Trims the description and drops it when blank.
pub fn normalize_description(description: Option<String>) -> Result<Option<String>, ServiceError> {
    let Some(description) = description else {
        return Ok(None);
    };
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ServiceError::ValidationError(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(Some(trimmed.to_string()))
}

#[derive(Clone)]
pub struct LedgerService {
    db: Arc<DatabaseConnection>,
    default_page_size: u64,
    max_page_size: u64,
}

impl LedgerService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_page_sizes(mut self, default_page_size: u64, max_page_size: u64) -> Self {
        self.default_page_size = default_page_size;
        self.max_page_size = max_page_size;
        self
    }

    /// Move `amount` from `sender_id` to the active account named `receiver_username`.
    ///
    /// Preconditions are checked in this order: amount, sender, sender balance,
    /// receiver, self-transfer. Any store failure during the atomic unit surfaces as
    /// [`ServiceError::TransferFailed`] with nothing written.
    #[instrument(skip(self, description))]
    pub async fn transfer(
        &self,
        sender_id: Uuid,
        receiver_username: &str,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<LedgerReceipt, ServiceError> {
        let result = self
            .try_transfer(sender_id, receiver_username, amount, description)
            .await;

        match &result {
            Ok(receipt) => {
                counter!("kodbank_ledger.transfer.completed", 1);
                info!(
                    sender_id = %sender_id,
                    reference_id = %receipt.reference_id,
                    "Transfer completed"
                );
            }
            Err(e) => {
                counter!("kodbank_ledger.transfer.failed", 1);
                debug!(sender_id = %sender_id, code = e.code(), "Transfer rejected");
            }
        }

        result
    }

    async fn try_transfer(
        &self,
        sender_id: Uuid,
        receiver_username: &str,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<LedgerReceipt, ServiceError> {
        let amount_cents = validate_amount(amount)?;
        let description = normalize_description(description)?;
        let receiver_username = receiver_username.trim().to_string();

        self.db
            .transaction::<_, LedgerReceipt, ServiceError>(move |txn| {
                Box::pin(async move {
                    let mut claimed = vec![sender_id];
                    if db::backend_locks_rows(txn.get_database_backend()) {
                        claimed.extend(account_id_by_username(txn, &receiver_username).await?);
                    }
                    lock_accounts(txn, &claimed).await?;

                    let sender = Account::find_by_id(sender_id)
                        .one(txn)
                        .await?
                        .filter(|account| account.is_active())
                        .ok_or(ServiceError::SenderNotFound)?;

                    if sender.balance_cents < amount_cents {
                        return Err(ServiceError::InsufficientBalance);
                    }

                    let receiver = Account::find()
                        .filter(account::Column::Username.eq(receiver_username.as_str()))
                        .filter(account::Column::Status.eq(account::AccountStatus::Active))
                        .filter(account::Column::DeletedAt.is_null())
                        .one(txn)
                        .await?
                        .ok_or(ServiceError::ReceiverNotFound)?;

                    if receiver.id == sender.id {
                        return Err(ServiceError::SelfTransferNotAllowed);
                    }

                    let now = Utc::now();
                    if !debit(txn, sender.id, amount_cents, now).await? {
                        return Err(ServiceError::InsufficientBalance);
                    }
                    if !credit(txn, receiver.id, amount_cents, now).await? {
                        return Err(ServiceError::ReceiverNotFound);
                    }

                    let row = append_entry(
                        txn,
                        Some(sender.id),
                        Some(receiver.id),
                        amount_cents,
                        TransactionType::Transfer,
                        description,
                        now,
                    )
                    .await?;

                    let balance_after = current_balance(txn, sender.id).await?;
                    Ok(receipt(&row, balance_after))
                })
            })
            .await
            .map_err(into_transfer_error)
    }

    /// Credit an account from outside the ledger (cash in, opening balance).
    #[instrument(skip(self, description))]
    pub async fn deposit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<LedgerReceipt, ServiceError> {
        let amount_cents = validate_amount(amount)?;
        let description = normalize_description(description)?;

        let receipt = self
            .db
            .transaction::<_, LedgerReceipt, ServiceError>(move |txn| {
                Box::pin(async move {
                    let row =
                        Self::apply_deposit(txn, account_id, amount_cents, description).await?;
                    let balance_after = current_balance(txn, account_id).await?;
                    Ok(receipt(&row, balance_after))
                })
            })
            .await
            .map_err(flatten_transaction_error)?;

        info!(account_id = %account_id, reference_id = %receipt.reference_id, "Deposit completed");
        Ok(receipt)
    }

    /// Debit an account to outside the ledger. Fails with `InsufficientBalance`
    /// rather than going negative.
    #[instrument(skip(self, description))]
    pub async fn withdraw(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<LedgerReceipt, ServiceError> {
        let amount_cents = validate_amount(amount)?;
        let description = normalize_description(description)?;

        let receipt = self
            .db
            .transaction::<_, LedgerReceipt, ServiceError>(move |txn| {
                Box::pin(async move {
                    lock_accounts(txn, &[account_id]).await?;
                    Account::find_by_id(account_id)
                        .one(txn)
                        .await?
                        .filter(|account| account.is_active())
                        .ok_or(ServiceError::AccountNotFound)?;

                    let now = Utc::now();
                    if !debit(txn, account_id, amount_cents, now).await? {
                        return Err(ServiceError::InsufficientBalance);
                    }
                    let row = append_entry(
                        txn,
                        Some(account_id),
                        None,
                        amount_cents,
                        TransactionType::Withdrawal,
                        description,
                        now,
                    )
                    .await?;

                    let balance_after = current_balance(txn, account_id).await?;
                    Ok(receipt(&row, balance_after))
                })
            })
            .await
            .map_err(flatten_transaction_error)?;

        info!(account_id = %account_id, reference_id = %receipt.reference_id, "Withdrawal completed");
        Ok(receipt)
    }

    /// Deposit on a caller-supplied connection so registration can open an account
    /// and fund it in one transaction. The credit is the unit's first statement, so
    /// it also claims the write lock.
    pub(crate) async fn apply_deposit<C: ConnectionTrait>(
        conn: &C,
        account_id: Uuid,
        amount_cents: i64,
        description: Option<String>,
    ) -> Result<transaction::Model, ServiceError> {
        let now = Utc::now();
        if !credit(conn, account_id, amount_cents, now).await? {
            return Err(ServiceError::AccountNotFound);
        }
        append_entry(
            conn,
            None,
            Some(account_id),
            amount_cents,
            TransactionType::Deposit,
            description,
            now,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_balance(&self, account_id: Uuid) -> Result<Decimal, ServiceError> {
        Account::find_by_id(account_id)
            .one(&*self.db)
            .await?
            .filter(|account| account.is_active())
            .map(|account| account.balance())
            .ok_or(ServiceError::AccountNotFound)
    }

    /// Transactions where the account is sender or receiver, newest first.
    ///
    /// `page` is 1-based. `page_size` falls back to the configured default.
    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        account_id: Uuid,
        page: u64,
        page_size: Option<u64>,
    ) -> Result<HistoryPage, ServiceError> {
        let limit = page_size.unwrap_or(self.default_page_size);
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "page must be at least 1".to_string(),
            ));
        }
        if limit == 0 || limit > self.max_page_size {
            return Err(ServiceError::ValidationError(format!(
                "page size must be between 1 and {}",
                self.max_page_size
            )));
        }

        let db = &*self.db;

        // History outlives the account, so soft-deleted accounts still have one.
        Account::find_by_id(account_id)
            .one(db)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        let paginator = Transaction::find()
            .filter(
                Condition::any()
                    .add(transaction::Column::SenderId.eq(account_id))
                    .add(transaction::Column::ReceiverId.eq(account_id)),
            )
            .order_by_desc(transaction::Column::CreatedAt)
            .order_by_desc(transaction::Column::Id)
            .paginate(db, limit);

        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page - 1).await?;

        let usernames = self.usernames_for(&rows).await?;
        let transactions = rows
            .into_iter()
            .map(|row| TransactionView {
                id: row.id,
                reference_id: row.reference_id,
                transaction_type: row.transaction_type,
                status: row.status,
                amount: row.amount(),
                delta: row.delta_for(account_id),
                sender_id: row.sender_id,
                sender_username: row.sender_id.and_then(|id| usernames.get(&id).cloned()),
                receiver_id: row.receiver_id,
                receiver_username: row.receiver_id.and_then(|id| usernames.get(&id).cloned()),
                description: row.description,
                created_at: row.created_at,
            })
            .collect();

        Ok(HistoryPage {
            transactions,
            pagination: Pagination::new(page, limit, total),
        })
    }

    /// Counterpart usernames, including soft-deleted accounts
    async fn usernames_for(
        &self,
        rows: &[transaction::Model],
    ) -> Result<HashMap<Uuid, String>, ServiceError> {
        let mut ids: Vec<Uuid> = rows
            .iter()
            .flat_map(|row| [row.sender_id, row.receiver_id])
            .flatten()
            .collect();
        ids.sort_unstable();
        ids.dedup();

        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let accounts = Account::find()
            .filter(account::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?;

        Ok(accounts
            .into_iter()
            .map(|account| (account.id, account.username))
            .collect())
    }

    /// Compare the stored balance with the sum of the account's ledger rows.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, account_id: Uuid) -> Result<Reconciliation, ServiceError> {
        let db = &*self.db;

        let account = Account::find_by_id(account_id)
            .one(db)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        let rows = Transaction::find()
            .filter(
                Condition::any()
                    .add(transaction::Column::SenderId.eq(account_id))
                    .add(transaction::Column::ReceiverId.eq(account_id)),
            )
            .filter(transaction::Column::Status.eq(TransactionStatus::Completed))
            .all(db)
            .await?;

        let balance = account.balance();
        let ledger_net: Decimal = rows.iter().map(|row| row.delta_for(account_id)).sum();
        let consistent = ledger_net == balance;
        if !consistent {
            error!(
                account_id = %account_id,
                balance = %balance,
                ledger_net = %ledger_net,
                "Balance does not reconcile with transaction log"
            );
        }

        Ok(Reconciliation {
            account_id,
            balance,
            ledger_net,
            consistent,
        })
    }
}

/// Take the write locks of a unit before its first read.
///
/// Row-locking backends lock `ids` `FOR UPDATE` in ascending id order, so transfers
/// running in opposite directions queue instead of deadlocking. On SQLite a no-op
/// write to the first id claims the database writer lock up front; a concurrent unit
/// then waits in the busy handler instead of failing to upgrade a read lock.
async fn lock_accounts<C: ConnectionTrait>(conn: &C, ids: &[Uuid]) -> Result<(), DbErr> {
    if db::backend_locks_rows(conn.get_database_backend()) {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        Account::find()
            .select_only()
            .column(account::Column::Id)
            .filter(account::Column::Id.is_in(ids))
            .order_by_asc(account::Column::Id)
            .lock_exclusive()
            .into_tuple::<Uuid>()
            .all(conn)
            .await?;
    } else if let Some(first) = ids.first() {
        Account::update_many()
            .col_expr(
                account::Column::BalanceCents,
                Expr::col(account::Column::BalanceCents).into(),
            )
            .filter(account::Column::Id.eq(*first))
            .exec(conn)
            .await?;
    }
    Ok(())
}

async fn account_id_by_username<C: ConnectionTrait>(
    conn: &C,
    username: &str,
) -> Result<Option<Uuid>, DbErr> {
    Account::find()
        .select_only()
        .column(account::Column::Id)
        .filter(account::Column::Username.eq(username))
        .into_tuple::<Uuid>()
        .one(conn)
        .await
}

/// `balance -= amount` only if the balance covers it. `false` means no row changed.
async fn debit<C: ConnectionTrait>(
    conn: &C,
    account_id: Uuid,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let result = Account::update_many()
        .col_expr(
            account::Column::BalanceCents,
            Expr::col(account::Column::BalanceCents).sub(amount_cents),
        )
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::Id.eq(account_id))
        .filter(account::Column::BalanceCents.gte(amount_cents))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// `balance += amount` on an active account. `false` means no row changed.
async fn credit<C: ConnectionTrait>(
    conn: &C,
    account_id: Uuid,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let result = Account::update_many()
        .col_expr(
            account::Column::BalanceCents,
            Expr::col(account::Column::BalanceCents).add(amount_cents),
        )
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::Id.eq(account_id))
        .filter(account::Column::Status.eq(account::AccountStatus::Active))
        .filter(account::Column::DeletedAt.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

async fn append_entry<C: ConnectionTrait>(
    conn: &C,
    sender_id: Option<Uuid>,
    receiver_id: Option<Uuid>,
    amount_cents: i64,
    transaction_type: TransactionType,
    description: Option<String>,
    now: DateTime<Utc>,
) -> Result<transaction::Model, ServiceError> {
    let row = transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        reference_id: Set(Uuid::new_v4()),
        sender_id: Set(sender_id),
        receiver_id: Set(receiver_id),
        amount_cents: Set(amount_cents),
        transaction_type: Set(transaction_type),
        status: Set(TransactionStatus::Completed),
        description: Set(description),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;
    Ok(row)
}

async fn current_balance<C: ConnectionTrait>(
    conn: &C,
    account_id: Uuid,
) -> Result<Decimal, ServiceError> {
    Account::find_by_id(account_id)
        .one(conn)
        .await?
        .map(|account| account.balance())
        .ok_or(ServiceError::AccountNotFound)
}

fn receipt(row: &transaction::Model, balance_after: Decimal) -> LedgerReceipt {
    LedgerReceipt {
        reference_id: row.reference_id,
        transaction_id: row.id,
        transaction_type: row.transaction_type,
        amount: row.amount(),
        balance_after,
        created_at: row.created_at,
    }
}

fn flatten_transaction_error(err: TransactionError<ServiceError>) -> ServiceError {
    match err {
        TransactionError::Connection(e) => ServiceError::DatabaseError(e),
        TransactionError::Transaction(e) => e,
    }
}

/// Typed outcomes pass through; store failures collapse into the retryable
/// `TransferFailed` since the rolled-back unit left nothing behind.
fn into_transfer_error(err: TransactionError<ServiceError>) -> ServiceError {
    match flatten_transaction_error(err) {
        ServiceError::DatabaseError(e) => {
            error!(error = %e, "Transfer transaction aborted");
            ServiceError::TransferFailed
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case(dec!(0.01))]
    #[case(dec!(1))]
    #[case(dec!(60.50))]
    #[case(dec!(100000.00))]
    #[case(dec!(12.3000))]
    fn accepts_positive_cent_amounts(#[case] amount: Decimal) {
        assert!(validate_amount(amount).is_ok());
    }

    #[rstest]
    #[case(dec!(0))]
    #[case(dec!(-5))]
    #[case(dec!(0.001))]
    #[case(dec!(10.555))]
    fn rejects_invalid_amounts(#[case] amount: Decimal) {
        assert_matches!(validate_amount(amount), Err(ServiceError::InvalidAmount));
    }

    #[test]
    fn description_is_trimmed_and_bounded() {
        assert_eq!(normalize_description(None).unwrap(), None);
        assert_eq!(normalize_description(Some("   ".into())).unwrap(), None);
        assert_eq!(
            normalize_description(Some("  rent  ".into())).unwrap(),
            Some("rent".to_string())
        );
        assert!(normalize_description(Some("x".repeat(MAX_DESCRIPTION_LEN))).is_ok());
        assert_matches!(
            normalize_description(Some("x".repeat(MAX_DESCRIPTION_LEN + 1))),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(Pagination::new(1, 10, 0).total_pages, 0);
        assert_eq!(Pagination::new(1, 10, 10).total_pages, 1);
        assert_eq!(Pagination::new(2, 10, 11).total_pages, 2);
    }

    #[test]
    fn zero_limit_yields_no_pages() {
        assert_eq!(Pagination::new(1, 0, 0).total_pages, 0);
        assert_eq!(Pagination::new(1, 0, 25).total_pages, 0);
    }

    #[test]
    fn validated_amounts_are_returned_in_cents() {
        assert_eq!(validate_amount(dec!(0.17)).unwrap(), 17);
        assert_eq!(validate_amount(dec!(60)).unwrap(), 6000);
    }
}
