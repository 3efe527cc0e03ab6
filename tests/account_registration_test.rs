mod common;

use assert_matches::assert_matches;
use common::{TestApp, PASSWORD};
use kodbank::auth::RegisterRequest;
use kodbank::entities::{account, transaction, AccountStatus, Role, TransactionType};
use kodbank::errors::ServiceError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

fn request(username: &str, email: &str) -> RegisterRequest {
    RegisterRequest {
        username: username.to_string(),
        email: email.to_string(),
        password: PASSWORD.to_string(),
        phone: None,
        role: None,
    }
}

#[tokio::test]
async fn duplicate_username_is_rejected_even_with_new_email() {
    let app = TestApp::new().await;
    let accounts = &app.services.accounts;

    accounts.register(request("alice", "alice@x.com")).await.unwrap();

    assert_matches!(
        accounts.register(request("alice", "alice@x.com")).await,
        Err(ServiceError::DuplicateUsername)
    );
    assert_matches!(
        accounts.register(request("alice", "another@x.com")).await,
        Err(ServiceError::DuplicateUsername)
    );
}

#[tokio::test]
async fn duplicate_email_is_rejected() {
    let app = TestApp::new().await;
    let accounts = &app.services.accounts;

    accounts.register(request("alice", "alice@x.com")).await.unwrap();

    assert_matches!(
        accounts.register(request("alicia", "Alice@X.com")).await,
        Err(ServiceError::DuplicateEmail)
    );
}

#[tokio::test]
async fn invalid_input_is_a_validation_error() {
    let app = TestApp::new().await;

    assert_matches!(
        app.services.accounts.register(request("al", "alice@x.com")).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        app.services.accounts.register(request("alice", "nope")).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn username_length_is_checked_after_trimming() {
    let app = TestApp::new().await;
    let accounts = &app.services.accounts;

    assert_matches!(
        accounts.register(request("  ab  ", "ab@x.com")).await,
        Err(ServiceError::ValidationError(_))
    );

    let summary = accounts
        .register(request("  alice  ", "  Alice@X.com "))
        .await
        .unwrap();
    assert_eq!(summary.username, "alice");
    let stored = account::Entity::find_by_id(summary.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.email, "alice@x.com");
}

#[tokio::test]
async fn password_is_stored_only_as_a_hash() {
    let app = TestApp::new().await;
    let summary = app.register("alice").await;

    let stored = account::Entity::find_by_id(summary.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(stored.password_hash, PASSWORD);
    assert!(stored.password_hash.starts_with("$argon2id$"));
    assert_eq!(stored.role, Role::Customer);
    assert_eq!(stored.status, AccountStatus::Active);
}

#[tokio::test]
async fn role_can_be_chosen_at_registration() {
    let app = TestApp::new().await;
    let mut req = request("manny", "manny@x.com");
    req.role = Some(Role::Manager);

    let summary = app.services.accounts.register(req).await.unwrap();
    assert_eq!(summary.role, Role::Manager);

    let tokens = app.login("manny").await.tokens;
    let user = app.services.sessions.authenticate(&tokens.access_token).unwrap();
    assert!(user.is_staff());
}

#[tokio::test]
async fn opening_balance_is_booked_as_a_deposit() {
    let app = TestApp::with_config(|cfg| cfg.opening_balance = dec!(100000.00)).await;
    let summary = app.register("alice").await;

    assert_eq!(
        app.services.ledger.get_balance(summary.id).await.unwrap(),
        dec!(100000)
    );

    let rows = transaction::Entity::find()
        .filter(transaction::Column::ReceiverId.eq(summary.id))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].transaction_type, TransactionType::Deposit);
    assert_eq!(rows[0].sender_id, None);

    assert!(app.services.ledger.reconcile(summary.id).await.unwrap().consistent);
}

#[tokio::test]
async fn zero_opening_balance_writes_no_ledger_row() {
    let app = TestApp::new().await;
    let summary = app.register("alice").await;

    assert_eq!(
        app.services.ledger.get_balance(summary.id).await.unwrap(),
        Decimal::ZERO
    );
    let rows = transaction::Entity::find().all(&*app.db).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn deactivation_is_soft_and_idempotent() {
    let app = TestApp::new().await;
    let summary = app.register("alice").await;

    app.services.accounts.deactivate(summary.id).await.unwrap();
    app.services.accounts.deactivate(summary.id).await.unwrap();

    let stored = account::Entity::find_by_id(summary.id)
        .one(&*app.db)
        .await
        .unwrap()
        .expect("row must survive deactivation");
    assert_eq!(stored.status, AccountStatus::Deleted);
    assert!(stored.deleted_at.is_some());

    assert_matches!(
        app.services.accounts.find(summary.id).await,
        Err(ServiceError::AccountNotFound)
    );
    // The username stays taken.
    assert_matches!(
        app.services.accounts.register(request("alice", "fresh@x.com")).await,
        Err(ServiceError::DuplicateUsername)
    );
    assert_matches!(
        app.services.accounts.deactivate(Uuid::new_v4()).await,
        Err(ServiceError::AccountNotFound)
    );
}
