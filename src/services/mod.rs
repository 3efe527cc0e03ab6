// Account lifecycle
pub mod accounts;

// Funds movement
pub mod ledger;

pub use accounts::AccountService;
pub use ledger::{
    HistoryPage, LedgerReceipt, LedgerService, Pagination, Reconciliation, TransactionView,
};
