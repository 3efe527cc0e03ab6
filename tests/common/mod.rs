#![allow(dead_code)]

use std::sync::Arc;

use kodbank::{
    auth::{AccountSummary, Argon2PasswordHasher, LoginResponse, PasswordHasher, RegisterRequest},
    config::AppConfig,
    db, AppServices,
};
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use tempfile::TempDir;

pub const PASSWORD: &str = "correct-horse-battery";

/// Helper harness backed by a freshly migrated SQLite file in a temp directory.
///
/// [`TestApp::new`] uses a single pooled connection; race tests use
/// [`TestApp::pooled`] so concurrent units contend for the database lock.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub hasher: Arc<dyn PasswordHasher>,
    pub services: AppServices,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn pooled(connections: u32) -> Self {
        Self::with_config(|cfg| cfg.db_max_connections = connections).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db_path = dir.path().join("kodbank_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "access_signing_key_9f8e7d6c5b4a3210_for_tests".to_string(),
            "refresh_signing_key_0a1b2c3d4e5f6789_for_tests".to_string(),
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.opening_balance = Decimal::ZERO;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");

        let db = Arc::new(pool);
        let hasher: Arc<dyn PasswordHasher> =
            Arc::new(Argon2PasswordHasher::new(64, 1).expect("argon2 params"));
        let services = AppServices::new(db.clone(), &cfg, hasher.clone());

        Self {
            db,
            config: cfg,
            hasher,
            services,
            _dir: dir,
        }
    }

    pub async fn register(&self, username: &str) -> AccountSummary {
        self.services
            .accounts
            .register(RegisterRequest {
                username: username.to_string(),
                email: format!("{}@x.com", username),
                password: PASSWORD.to_string(),
                phone: None,
                role: None,
            })
            .await
            .expect("registration failed")
    }

    /// Register `username` and fund it with `balance`.
    pub async fn funded(&self, username: &str, balance: Decimal) -> AccountSummary {
        let account = self.register(username).await;
        if balance > Decimal::ZERO {
            self.services
                .ledger
                .deposit(account.id, balance, Some("seed".to_string()))
                .await
                .expect("seed deposit failed");
        }
        account
    }

    pub async fn login(&self, username: &str) -> LoginResponse {
        self.services
            .sessions
            .login(username, PASSWORD)
            .await
            .expect("login failed")
    }
}
