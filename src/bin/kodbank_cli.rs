use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use kodbank::{
    auth::{AuthError, AuthUser, RegisterRequest},
    config::{self, AppConfig},
    db,
    entities::Role,
    errors::ServiceError,
    services::{HistoryPage, LedgerReceipt},
    AppServices,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize(matches!(cli.command, Commands::Migrate)).await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::Register(args) => handle_register(&context, args, cli.json).await?,
        Commands::Login(args) => handle_login(&context, args, cli.json).await?,
        Commands::Refresh(args) => handle_refresh(&context, args, cli.json).await?,
        Commands::Logout(args) => {
            context
                .services
                .sessions
                .logout(&args.refresh_token)
                .await
                .map_err(auth_failure)?;
            println!("Logged out");
        }
        Commands::LogoutAll(args) => {
            let user = context.authenticate(&args.access_token)?;
            let revoked = context
                .services
                .sessions
                .revoke_all_sessions(user.account_id)
                .await
                .map_err(auth_failure)?;
            println!("Revoked {} session(s) for {}", revoked, user.username);
        }
        Commands::Whoami(args) => handle_whoami(&context, args, cli.json).await?,
        Commands::Transfer(args) => handle_transfer(&context, args, cli.json).await?,
        Commands::Balance(args) => {
            let user = context.authenticate(&args.access_token)?;
            let balance = context
                .services
                .ledger
                .get_balance(user.account_id)
                .await
                .map_err(service_failure)?;
            if cli.json {
                print_json(&serde_json::json!({ "account_id": user.account_id, "balance": balance }))?;
            } else {
                println!("Balance for {}: {}", user.username, balance);
            }
        }
        Commands::History(args) => handle_history(&context, args, cli.json).await?,
        Commands::Deposit(args) => handle_cash(&context, args, CashDirection::In, cli.json).await?,
        Commands::Withdraw(args) => {
            handle_cash(&context, args, CashDirection::Out, cli.json).await?
        }
        Commands::Deactivate(args) => {
            let user = context.authenticate(&args.access_token)?;
            let account_id = target_account(&user, args.account)?;
            context
                .services
                .accounts
                .deactivate(account_id)
                .await
                .map_err(service_failure)?;
            let revoked = context
                .services
                .sessions
                .revoke_all_sessions(account_id)
                .await
                .map_err(auth_failure)?;
            println!(
                "Account {} deactivated; {} session(s) revoked",
                account_id, revoked
            );
        }
        Commands::Reconcile(args) => {
            let user = context.authenticate(&args.access_token)?;
            let account_id = target_account(&user, args.account)?;
            let report = context
                .services
                .ledger
                .reconcile(account_id)
                .await
                .map_err(service_failure)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Account {} • balance {} • ledger net {} • {}",
                    report.account_id,
                    report.balance,
                    report.ledger_net,
                    if report.consistent { "consistent" } else { "MISMATCH" }
                );
            }
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "kodbank", about = "KodBank session and ledger operations", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the embedded schema migrations
    Migrate,
    Register(RegisterArgs),
    Login(LoginArgs),
    Refresh(RefreshArgs),
    Logout(RefreshArgs),
    /// Revoke every refresh token of the authenticated account
    LogoutAll(AccessArgs),
    Whoami(AccessArgs),
    Transfer(TransferArgs),
    Balance(AccessArgs),
    History(HistoryArgs),
    Deposit(CashArgs),
    Withdraw(CashArgs),
    /// Soft-delete an account and revoke its sessions
    Deactivate(TargetArgs),
    /// Check the stored balance against the transaction log
    Reconcile(TargetArgs),
}

#[derive(Args)]
struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long, help = "customer, manager or admin")]
    role: Option<Role>,
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
}

#[derive(Args)]
struct RefreshArgs {
    #[arg(long, help = "Refresh token issued by login or a previous refresh")]
    refresh_token: String,
}

#[derive(Args)]
struct AccessArgs {
    #[arg(long, help = "Access token issued by login or refresh")]
    access_token: String,
}

#[derive(Args)]
struct TransferArgs {
    #[arg(long)]
    access_token: String,
    #[arg(long, help = "Username of the receiving account")]
    to: String,
    #[arg(long)]
    amount: Decimal,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long)]
    access_token: String,
    #[arg(long, default_value_t = 1)]
    page: u64,
    #[arg(long)]
    page_size: Option<u64>,
}

#[derive(Args)]
struct CashArgs {
    #[arg(long)]
    access_token: String,
    #[arg(long, help = "Target account id (staff only); defaults to the caller")]
    account: Option<Uuid>,
    #[arg(long)]
    amount: Decimal,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    access_token: String,
    #[arg(long, help = "Target account id (staff only); defaults to the caller")]
    account: Option<Uuid>,
}

#[derive(Clone, Copy)]
enum CashDirection {
    In,
    Out,
}

struct CliContext {
    db: Arc<db::DbPool>,
    services: AppServices,
}

impl CliContext {
    async fn initialize(skip_auto_migrate: bool) -> Result<Self> {
        let config: AppConfig =
            config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;

        if config.auto_migrate && !skip_auto_migrate {
            db::run_migrations(&db_pool)
                .await
                .context("failed to run migrations")?;
        }

        let db = Arc::new(db_pool);
        let services = AppServices::from_config(db.clone(), &config)
            .map_err(|e| anyhow!("failed to initialise services: {}", e))?;
        debug!(environment = %config.environment, "CLI context ready");

        Ok(Self { db, services })
    }

    fn authenticate(&self, access_token: &str) -> Result<AuthUser> {
        self.services
            .sessions
            .authenticate(access_token)
            .map_err(auth_failure)
    }
}

async fn handle_register(context: &CliContext, args: RegisterArgs, json: bool) -> Result<()> {
    let summary = context
        .services
        .accounts
        .register(RegisterRequest {
            username: args.username,
            email: args.email,
            password: args.password,
            phone: args.phone,
            role: args.role,
        })
        .await
        .map_err(service_failure)?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "Registered {} (id {}, role {})",
            summary.username, summary.id, summary.role
        );
    }
    Ok(())
}

async fn handle_login(context: &CliContext, args: LoginArgs, json: bool) -> Result<()> {
    let response = context
        .services
        .sessions
        .login(&args.username, &args.password)
        .await
        .map_err(auth_failure)?;

    if json {
        print_json(&response)?;
    } else {
        println!(
            "Logged in as {} (id {})",
            response.account.username, response.account.id
        );
        println!("Access token:  {}", response.tokens.access_token);
        println!("Refresh token: {}", response.tokens.refresh_token);
    }
    Ok(())
}

async fn handle_refresh(context: &CliContext, args: RefreshArgs, json: bool) -> Result<()> {
    let tokens = context
        .services
        .sessions
        .refresh(&args.refresh_token)
        .await
        .map_err(auth_failure)?;

    if json {
        print_json(&tokens)?;
    } else {
        println!("Access token:  {}", tokens.access_token);
        println!("Refresh token: {}", tokens.refresh_token);
    }
    Ok(())
}

async fn handle_whoami(context: &CliContext, args: AccessArgs, json: bool) -> Result<()> {
    let claims = context
        .services
        .sessions
        .verify_access(&args.access_token)
        .map_err(auth_failure)?;
    let live_sessions = context
        .services
        .sessions
        .live_session_count(claims.sub)
        .await
        .map_err(auth_failure)?;

    if json {
        print_json(&serde_json::json!({
            "claims": claims,
            "live_sessions": live_sessions,
        }))?;
    } else {
        println!(
            "{} (id {}, role {}) • {} live session(s)",
            claims.username, claims.sub, claims.role, live_sessions
        );
    }
    Ok(())
}

async fn handle_transfer(context: &CliContext, args: TransferArgs, json: bool) -> Result<()> {
    let user = context.authenticate(&args.access_token)?;
    let receipt = context
        .services
        .ledger
        .transfer(user.account_id, &args.to, args.amount, args.description)
        .await
        .map_err(service_failure)?;

    if json {
        print_json(&receipt)?;
    } else {
        render_receipt(&receipt);
    }
    Ok(())
}

async fn handle_history(context: &CliContext, args: HistoryArgs, json: bool) -> Result<()> {
    let user = context.authenticate(&args.access_token)?;
    let page = context
        .services
        .ledger
        .get_history(user.account_id, args.page, args.page_size)
        .await
        .map_err(service_failure)?;

    if json {
        print_json(&page)?;
    } else {
        render_history(&page);
    }
    Ok(())
}

async fn handle_cash(
    context: &CliContext,
    args: CashArgs,
    direction: CashDirection,
    json: bool,
) -> Result<()> {
    let user = context.authenticate(&args.access_token)?;
    let account_id = target_account(&user, args.account)?;
    let ledger = &context.services.ledger;

    let receipt = match direction {
        CashDirection::In => ledger.deposit(account_id, args.amount, args.description).await,
        CashDirection::Out => ledger.withdraw(account_id, args.amount, args.description).await,
    }
    .map_err(service_failure)?;

    if json {
        print_json(&receipt)?;
    } else {
        render_receipt(&receipt);
    }
    Ok(())
}

/// Callers act on their own account; staff may name another one.
fn target_account(user: &AuthUser, requested: Option<Uuid>) -> Result<Uuid> {
    match requested {
        None => Ok(user.account_id),
        Some(id) if id == user.account_id => Ok(id),
        Some(id) if user.is_staff() => Ok(id),
        Some(_) => bail!("only managers and admins may act on other accounts"),
    }
}

fn auth_failure(err: AuthError) -> anyhow::Error {
    anyhow!("{} ({})", err.public_message(), err.code())
}

fn service_failure(err: ServiceError) -> anyhow::Error {
    anyhow!("{} ({})", err.public_message(), err.code())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_receipt(receipt: &LedgerReceipt) {
    println!(
        "{:?} {} • reference {} • balance now {}",
        receipt.transaction_type, receipt.amount, receipt.reference_id, receipt.balance_after
    );
}

fn render_history(page: &HistoryPage) {
    for tx in &page.transactions {
        let counterpart = if tx.delta.is_sign_negative() {
            tx.receiver_username.as_deref()
        } else {
            tx.sender_username.as_deref()
        };
        println!(
            "- {} • {:?} • {} • {} • {}",
            tx.created_at.format("%Y-%m-%d %H:%M:%S"),
            tx.transaction_type,
            tx.delta,
            counterpart.unwrap_or("-"),
            tx.description.as_deref().unwrap_or("")
        );
    }
    println!(
        "Page {} of {} ({} transaction(s))",
        page.pagination.page,
        page.pagination.total_pages.max(1),
        page.pagination.total
    );
}
