pub mod account;
pub mod refresh_token;
pub mod transaction;

pub use account::{AccountStatus, Entity as Account, Model as AccountModel, Role};
pub use refresh_token::{Entity as RefreshToken, Model as RefreshTokenModel};
pub use transaction::{
    Entity as Transaction, Model as TransactionModel, TransactionStatus, TransactionType,
};
