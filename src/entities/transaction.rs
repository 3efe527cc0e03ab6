use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    #[sea_orm(string_value = "TRANSFER")]
    Transfer,
    #[sea_orm(string_value = "DEPOSIT")]
    Deposit,
    #[sea_orm(string_value = "WITHDRAWAL")]
    Withdrawal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

/// Append-only ledger row. Never updated or deleted once written.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Reference handed back to the caller for auditing
    #[sea_orm(unique)]
    pub reference_id: Uuid,

    /// Null for deposits
    pub sender_id: Option<Uuid>,

    /// Null for withdrawals
    pub receiver_id: Option<Uuid>,

    /// Whole cents, always positive
    pub amount_cents: i64,

    pub transaction_type: TransactionType,

    pub status: TransactionStatus,

    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::SenderId",
        to = "super::account::Column::Id"
    )]
    Sender,
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::ReceiverId",
        to = "super::account::Column::Id"
    )]
    Receiver,
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn amount(&self) -> Decimal {
        money::from_cents(self.amount_cents)
    }

    /// Balance delta this row applies to `account_id` (positive when credited).
    pub fn delta_for(&self, account_id: Uuid) -> Decimal {
        if self.status != TransactionStatus::Completed {
            return Decimal::ZERO;
        }
        let mut delta = Decimal::ZERO;
        if self.receiver_id == Some(account_id) {
            delta += self.amount();
        }
        if self.sender_id == Some(account_id) {
            delta -= self.amount();
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(sender: Option<Uuid>, receiver: Option<Uuid>, status: TransactionStatus) -> Model {
        Model {
            id: Uuid::new_v4(),
            reference_id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            amount_cents: 2550,
            transaction_type: TransactionType::Transfer,
            status,
            description: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn delta_is_signed_by_direction() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tx = row(Some(a), Some(b), TransactionStatus::Completed);
        assert_eq!(tx.delta_for(a), dec!(-25.50));
        assert_eq!(tx.delta_for(b), dec!(25.50));
        assert_eq!(tx.delta_for(Uuid::new_v4()), Decimal::ZERO);
    }

    #[test]
    fn non_completed_rows_do_not_count() {
        let a = Uuid::new_v4();
        let tx = row(None, Some(a), TransactionStatus::Failed);
        assert_eq!(tx.delta_for(a), Decimal::ZERO);
    }
}
