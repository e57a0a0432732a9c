//! Stable embedded ledger command surface for host runtimes.
//!
//! Host projects should embed ledger behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_ledger_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_ledger`] for execution against an existing [`SqliteLedgerStore`].
//!
//! These entrypoints are the supported v1 embed API; their JSON outputs are
//! frozen by the schemas under `contracts/v1/`.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use coinledger_core::{
    format_rfc3339, parse_rfc3339_utc, AppendRequest, AuditPolicy, BulkRefundRequest, KeepPolicy,
    RefundRequest, RefundTarget, Transaction, TransactionId, TransactionKind, UserId,
};
use coinledger_store_sqlite::{
    AuditReport, LedgerIssueSeverity, ReconcileReport, SqliteLedgerStore, UserLedgerStatus,
};

#[derive(Debug, Parser)]
#[command(name = "coinctl")]
#[command(about = "Coin Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./coin_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Account {
        #[command(subcommand)]
        command: Box<AccountCommand>,
    },
    Txn {
        #[command(subcommand)]
        command: Box<TxnCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
    Refund {
        #[command(subcommand)]
        command: Box<RefundCommand>,
    },
    Reconcile {
        #[command(subcommand)]
        command: Box<ReconcileCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AccountCommand {
    Create(AccountArgs),
    Show(AccountArgs),
}

#[derive(Debug, Args)]
pub struct AccountArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Subcommand)]
pub enum TxnCommand {
    Append(TxnAppendArgs),
    List(TxnListArgs),
}

#[derive(Debug, Args)]
pub struct TxnAppendArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    kind: KindArg,
    #[arg(long, allow_negative_numbers = true)]
    amount: i64,
    #[arg(long)]
    description: String,
    #[arg(long)]
    initiated_by: Option<String>,
    #[arg(long = "refund-of")]
    refund_of: Vec<String>,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct TxnListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Run(AuditRunArgs),
}

#[derive(Debug, Args)]
pub struct AuditRunArgs {
    #[arg(long)]
    user: String,
    #[arg(long, default_value_t = 60)]
    duplicate_window_seconds: i64,
    #[arg(long, default_value_t = 120)]
    suspicious_window_seconds: i64,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long, default_value = "earliest")]
    keep: KeepArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RefundCommand {
    Apply(RefundApplyArgs),
    Duplicates(RefundDuplicatesArgs),
}

#[derive(Debug, Args)]
pub struct RefundApplyArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    authorized_by: String,
    #[arg(long = "transaction")]
    transactions: Vec<String>,
    #[arg(long)]
    amount: Option<i64>,
}

#[derive(Debug, Args)]
pub struct RefundDuplicatesArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    authorized_by: String,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long, default_value = "earliest")]
    keep: KeepArg,
}

#[derive(Debug, Subcommand)]
pub enum ReconcileCommand {
    Status(ReconcileStatusArgs),
    Check(ReconcileCheckArgs),
}

#[derive(Debug, Args)]
pub struct ReconcileStatusArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ReconcileCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Earn,
    Spend,
    Purchase,
    Refund,
    Adjustment,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KeepArg {
    Earliest,
    Latest,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_ledger_with_db(&cli.db, cli.command)
}

/// Executes a parsed ledger command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_ledger_with_db(db_path: &std::path::Path, command: Command) -> Result<()> {
    let mut store = SqliteLedgerStore::open(db_path)?;
    store.migrate()?;
    run_ledger(command, &mut store)
}

/// Executes a parsed ledger command against an existing store handle.
///
/// # Errors
/// Returns an error when command validation, persistence, audit, or refund
/// operations fail.
pub fn run_ledger(command: Command, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        Command::Account { command } => run_account(*command, store),
        Command::Txn { command } => run_txn(*command, store),
        Command::Audit { command } => run_audit(*command, store),
        Command::Refund { command } => run_refund(*command, store),
        Command::Reconcile { command } => run_reconcile(*command, store),
    }
}

fn run_account(command: AccountCommand, store: &SqliteLedgerStore) -> Result<()> {
    match command {
        AccountCommand::Create(args) => {
            let account = store.create_account(&UserId(args.user))?;
            println!("{}", serde_json::to_string_pretty(&account)?);
            Ok(())
        }
        AccountCommand::Show(args) => {
            let account = store.account(&UserId(args.user))?;
            println!("{}", serde_json::to_string_pretty(&account)?);
            Ok(())
        }
    }
}

fn run_txn(command: TxnCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        TxnCommand::Append(args) => {
            let request = AppendRequest {
                id: None,
                user_id: UserId(args.user),
                kind: map_kind(args.kind),
                amount: args.amount,
                description: args.description,
                initiated_by: args.initiated_by,
                refund_of: parse_transaction_ids(&args.refund_of)?,
                created_at: parse_optional_utc(args.created_at.as_deref())?,
            };

            let transaction = store.append(&request)?;
            println!("{}", serde_json::to_string_pretty(&transaction)?);
            Ok(())
        }
        TxnCommand::List(args) => {
            let user_id = UserId(args.user);
            let transactions = store.transactions_for_user(&user_id, args.limit)?;
            if args.json {
                let payload = build_transaction_list_json_payload(&user_id, &transactions);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_transaction_table(&transactions);
            }
            Ok(())
        }
    }
}

fn run_audit(command: AuditCommand, store: &SqliteLedgerStore) -> Result<()> {
    match command {
        AuditCommand::Run(args) => {
            let policy = AuditPolicy {
                duplicate_window_seconds: args.duplicate_window_seconds,
                suspicious_window_seconds: args.suspicious_window_seconds,
            };
            let start = parse_optional_utc(args.start.as_deref())?;
            let end = parse_optional_utc(args.end.as_deref())?;

            let report = store.audit_report(
                &UserId(args.user),
                &policy,
                start,
                end,
                map_keep(args.keep),
            )?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_audit_report(&report);
            }
            Ok(())
        }
    }
}

fn run_refund(command: RefundCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        RefundCommand::Apply(args) => {
            let target = match (args.transactions.is_empty(), args.amount) {
                (false, None) => {
                    RefundTarget::Transactions(parse_transaction_ids(&args.transactions)?)
                }
                (true, Some(amount)) => RefundTarget::Amount(amount),
                (true, None) => {
                    return Err(anyhow!(
                        "either --transaction <transaction_id> or --amount <coins> is required"
                    ))
                }
                (false, Some(_)) => {
                    return Err(anyhow!("--transaction and --amount are mutually exclusive"))
                }
            };

            let request = RefundRequest {
                user_id: UserId(args.user),
                reason: args.reason,
                authorized_by: args.authorized_by,
                target,
            };

            let result = store.refund(&request)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        RefundCommand::Duplicates(args) => {
            let request = BulkRefundRequest {
                user_id: UserId(args.user),
                authorized_by: args.authorized_by,
                reason: args.reason,
                start: parse_optional_utc(args.start.as_deref())?,
                end: parse_optional_utc(args.end.as_deref())?,
                keep: map_keep(args.keep),
            };

            let result = store.bulk_refund_duplicates(&request)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn run_reconcile(command: ReconcileCommand, store: &SqliteLedgerStore) -> Result<()> {
    match command {
        ReconcileCommand::Status(args) => {
            let status = store.user_ledger_status(&UserId(args.user))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_ledger_status(&status);
            }
            Ok(())
        }
        ReconcileCommand::Check(args) => {
            let report = store.reconcile_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_reconcile_report(&report);
            }

            if !report.healthy {
                return Err(anyhow!(
                    "ledger consistency check failed: {}",
                    report
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<time::OffsetDateTime>> {
    match raw {
        Some(value) => parse_rfc3339_utc(value)
            .map(Some)
            .map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(None),
    }
}

fn parse_transaction_ids(raw: &[String]) -> Result<Vec<TransactionId>> {
    raw.iter()
        .map(|value| TransactionId::parse(value).map_err(anyhow::Error::from))
        .collect()
}

fn map_kind(value: KindArg) -> TransactionKind {
    match value {
        KindArg::Earn => TransactionKind::Earn,
        KindArg::Spend => TransactionKind::Spend,
        KindArg::Purchase => TransactionKind::Purchase,
        KindArg::Refund => TransactionKind::Refund,
        KindArg::Adjustment => TransactionKind::Adjustment,
    }
}

fn map_keep(value: KeepArg) -> KeepPolicy {
    match value {
        KeepArg::Earliest => KeepPolicy::Earliest,
        KeepArg::Latest => KeepPolicy::Latest,
    }
}

fn print_transaction_table(transactions: &[Transaction]) {
    println!(
        "{:<6} {:<26} {:<10} {:>8} {:>13} {:<20} description",
        "seq", "id", "kind", "amount", "balance_after", "created_at"
    );
    println!("{}", "-".repeat(110));

    for transaction in transactions {
        println!(
            "{:<6} {:<26} {:<10} {:>8} {:>13} {:<20} {}",
            transaction.seq,
            transaction.id,
            transaction.kind.as_str(),
            transaction.amount,
            transaction.balance_after,
            format_rfc3339(transaction.created_at).unwrap_or_else(|_| "-".to_string()),
            transaction.description
        );
    }
}

fn print_audit_report(report: &AuditReport) {
    println!(
        "contract={} user={} scanned={} duplicates={} suspicious={} refunded={} window={}..{}",
        report.contract_version,
        report.user_id,
        report.transactions_scanned,
        report.duplicate_count,
        report.suspicious_count,
        report.refunded_count,
        report.window_start.as_deref().unwrap_or("*"),
        report.window_end.as_deref().unwrap_or("*")
    );
    println!(
        "{:<26} {:>8} {:<20} {:<9} {:<10} {:<8} related",
        "id", "amount", "created_at", "duplicate", "suspicious", "refunded"
    );
    println!("{}", "-".repeat(110));

    for item in &report.transactions {
        println!(
            "{:<26} {:>8} {:<20} {:<9} {:<10} {:<8} {}",
            item.transaction.id,
            item.transaction.amount,
            format_rfc3339(item.transaction.created_at).unwrap_or_else(|_| "-".to_string()),
            if item.duplicate { "yes" } else { "no" },
            if item.suspicious { "yes" } else { "no" },
            if item.refunded { "yes" } else { "no" },
            item.related_transaction_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
    }

    for group in &report.duplicate_groups {
        println!(
            "group description={:?} amount={} members={} keep={} refund={}",
            group.description,
            group.amount,
            group.member_count,
            group.kept_transaction_id,
            group
                .refund_candidate_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
    }
}

fn print_ledger_status(status: &UserLedgerStatus) {
    println!(
        "contract={} user={} cached_balance={} replayed_balance={} drift={} transactions={} last_seq={} last_balance_after={} updated_at={}",
        status.contract_version,
        status.user_id,
        status.cached_balance,
        status.replayed_balance,
        status.drift,
        status.transaction_count,
        status
            .last_seq
            .map_or_else(|| "none".to_string(), |value| value.to_string()),
        status
            .last_balance_after
            .map_or_else(|| "none".to_string(), |value| value.to_string()),
        status.updated_at
    );
}

fn print_reconcile_report(report: &ReconcileReport) {
    println!(
        "contract={} generated_at={} accounts={} transactions={} healthy={}",
        report.contract_version,
        report.generated_at,
        report.accounts_checked,
        report.transactions_checked,
        if report.healthy { "yes" } else { "no" }
    );
    if !report.issues.is_empty() {
        let formatted = report
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    LedgerIssueSeverity::Warning => "warning",
                    LedgerIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `coinctl reconcile status --user <user_id>` for a per-user replay");
    }
    for sample in &report.drift_sample {
        println!(
            "drift user={} cached={} replayed={} drift={}",
            sample.user_id, sample.cached_balance, sample.replayed_balance, sample.drift
        );
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct TransactionListJsonPayload {
    contract_version: String,
    user_id: UserId,
    count: usize,
    transactions: Vec<Transaction>,
}

fn build_transaction_list_json_payload(
    user_id: &UserId,
    transactions: &[Transaction],
) -> TransactionListJsonPayload {
    TransactionListJsonPayload {
        contract_version: "transaction_list.v1".to_string(),
        user_id: user_id.clone(),
        count: transactions.len(),
        transactions: transactions.to_vec(),
    }
}
