//! KodBank core library
//!
//! Session lifecycle (login, rotating refresh tokens with reuse detection, logout)
//! and the atomic funds-transfer ledger, persisted through sea-orm.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod migrator;
pub mod money;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::auth::{Argon2PasswordHasher, PasswordHasher, SessionManager};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::services::{AccountService, LedgerService};

/// The services exposed to whatever transport fronts the crate
#[derive(Clone)]
pub struct AppServices {
    pub sessions: Arc<SessionManager>,
    pub accounts: Arc<AccountService>,
    pub ledger: Arc<LedgerService>,
}

impl AppServices {
    /// Wire every service with the Argon2 parameters from `config`.
    pub fn from_config(db: Arc<DatabaseConnection>, config: &AppConfig) -> Result<Self, ServiceError> {
        let hasher = Argon2PasswordHasher::new(config.argon2_memory_kib, config.argon2_iterations)
            .map_err(|e| ServiceError::HashError(e.0))?;
        Ok(Self::new(db, config, Arc::new(hasher)))
    }

    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        let sessions = SessionManager::new(config.auth_config(), db.clone(), hasher.clone());
        let accounts = AccountService::new(db.clone(), hasher)
            .with_opening_balance(config.opening_balance);
        let ledger = LedgerService::new(db).with_page_sizes(
            config.history_default_page_size,
            config.history_max_page_size,
        );

        Self {
            sessions: Arc::new(sessions),
            accounts: Arc::new(accounts),
            ledger: Arc::new(ledger),
        }
    }
}
