#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use coinledger_core::{
    apply_amount, audit_transactions, format_rfc3339, group_duplicates, now_utc,
    parse_rfc3339_utc, refund_eligible, refund_total, AppendRequest, AuditPolicy,
    AuditedTransaction, BulkRefundRequest, DuplicateGroup, KeepPolicy, LedgerError, RefundRequest,
    RefundResult, RefundTarget, Transaction, TransactionId, TransactionKind, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

const LEDGER_MIGRATION_VERSION: i64 = 1;
const AUDIT_REPORT_CONTRACT_VERSION: &str = "audit_report.v1";
const LEDGER_STATUS_CONTRACT_VERSION: &str = "ledger_status.v1";
const RECONCILE_REPORT_CONTRACT_VERSION: &str = "reconcile_report.v1";
const DRIFT_SAMPLE_LIMIT: usize = 25;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS coin_accounts (
  user_id TEXT PRIMARY KEY,
  balance INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS coin_transactions (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (
    kind IN ('earn', 'spend', 'purchase', 'refund', 'adjustment')
  ),
  amount INTEGER NOT NULL CHECK (amount <> 0),
  description TEXT NOT NULL,
  initiated_by TEXT,
  refund_of TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  balance_after INTEGER NOT NULL,
  FOREIGN KEY (user_id) REFERENCES coin_accounts(user_id)
);

CREATE TRIGGER IF NOT EXISTS trg_coin_transactions_no_update
BEFORE UPDATE ON coin_transactions
BEGIN
  SELECT RAISE(FAIL, 'coin_transactions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_coin_transactions_no_delete
BEFORE DELETE ON coin_transactions
BEGIN
  SELECT RAISE(FAIL, 'coin_transactions is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_coin_transactions_user_seq
  ON coin_transactions(user_id, seq);
CREATE INDEX IF NOT EXISTS idx_coin_transactions_user_kind_seq
  ON coin_transactions(user_id, kind, seq);

CREATE TABLE IF NOT EXISTS refund_markers (
  transaction_id TEXT PRIMARY KEY,
  refund_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (transaction_id) REFERENCES coin_transactions(id),
  FOREIGN KEY (refund_id) REFERENCES coin_transactions(id),
  FOREIGN KEY (user_id) REFERENCES coin_accounts(user_id)
);

CREATE TRIGGER IF NOT EXISTS trg_refund_markers_no_update
BEFORE UPDATE ON refund_markers
BEGIN
  SELECT RAISE(FAIL, 'refund_markers is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_refund_markers_no_delete
BEFORE DELETE ON refund_markers
BEGIN
  SELECT RAISE(FAIL, 'refund_markers is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_refund_markers_user
  ON refund_markers(user_id);
CREATE INDEX IF NOT EXISTS idx_refund_markers_refund
  ON refund_markers(refund_id);
";

pub struct SqliteLedgerStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    pub balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub contract_version: String,
    pub generated_at: String,
    pub user_id: UserId,
    pub policy: AuditPolicy,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub transactions_scanned: usize,
    pub duplicate_count: usize,
    pub suspicious_count: usize,
    pub refunded_count: usize,
    pub transactions: Vec<AuditedTransaction>,
    pub duplicate_groups: Vec<DuplicateGroup>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct UserLedgerStatus {
    pub contract_version: String,
    pub user_id: UserId,
    pub cached_balance: i64,
    pub replayed_balance: i64,
    pub drift: i64,
    pub transaction_count: usize,
    pub last_seq: Option<i64>,
    pub last_balance_after: Option<i64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerIssue {
    pub code: String,
    pub severity: LedgerIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DriftSample {
    pub user_id: UserId,
    pub cached_balance: i64,
    pub replayed_balance: i64,
    pub drift: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub contract_version: String,
    pub generated_at: String,
    pub accounts_checked: usize,
    pub transactions_checked: usize,
    pub healthy: bool,
    pub issues: Vec<LedgerIssue>,
    pub drift_sample: Vec<DriftSample>,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )
                .context("failed to read schema_migrations")?
        } else {
            0
        };

        Ok(SchemaStatus {
            current_version: current,
            target_version: LEDGER_MIGRATION_VERSION,
            pending_versions: (LEDGER_MIGRATION_VERSION - current).max(0),
        })
    }

    /// Idempotent: creating an account that already exists returns it
    /// unchanged.
    pub fn create_account(&self, user_id: &UserId) -> Result<Account> {
        if user_id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation("user_id MUST be provided".to_string()).into());
        }

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO coin_accounts(user_id, balance, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?2)",
                params![user_id.as_str(), now],
            )
            .context("failed to create account")?;

        self.account(user_id)
    }

    pub fn account(&self, user_id: &UserId) -> Result<Account> {
        let account = self
            .conn
            .query_row(
                "SELECT user_id, balance, created_at, updated_at
                 FROM coin_accounts
                 WHERE user_id = ?1",
                params![user_id.as_str()],
                parse_account_row,
            )
            .optional()
            .context("failed to read account")?;

        let Some(account) = account else {
            return Err(LedgerError::UserNotFound {
                user_id: user_id.clone(),
            }
            .into());
        };

        Ok(account)
    }

    pub fn balance(&self, user_id: &UserId) -> Result<i64> {
        Ok(self.account(user_id)?.balance)
    }

    /// Appends one transaction and moves the cached balance in the same
    /// write transaction. A writer that cannot acquire the database within
    /// the busy timeout fails with `ConcurrentModification` and leaves no
    /// partial state behind.
    pub fn append(&mut self, request: &AppendRequest) -> Result<Transaction> {
        request.validate()?;

        let id = match request.id {
            Some(value) => value,
            None => TransactionId::new(),
        };
        let created_at = match request.created_at {
            Some(value) => value,
            None => now_utc(),
        };

        self.append_inner(request, id, created_at)
            .map_err(|err| map_concurrency(err, &request.user_id))
    }

    fn append_inner(
        &mut self,
        request: &AppendRequest,
        id: TransactionId,
        created_at: OffsetDateTime,
    ) -> Result<Transaction> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        let appended = write_transaction(
            &tx,
            &PendingTransaction {
                id,
                user_id: &request.user_id,
                kind: request.kind,
                amount: request.amount,
                description: &request.description,
                initiated_by: request.initiated_by.as_deref(),
                refund_of: &request.refund_of,
                created_at,
            },
        )?;

        tx.commit().context("failed to commit append transaction")?;
        Ok(appended)
    }

    pub fn transactions_for_user(
        &self,
        user_id: &UserId,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>> {
        if account_balance(&self.conn, user_id)?.is_none() {
            return Err(LedgerError::UserNotFound {
                user_id: user_id.clone(),
            }
            .into());
        }

        let mut query = String::from(
            "SELECT seq, id, user_id, kind, amount, description, initiated_by, refund_of, created_at, balance_after
             FROM coin_transactions
             WHERE user_id = ?1
             ORDER BY seq ASC",
        );
        if let Some(limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id.as_str()], parse_transaction_row)?;
        collect_rows(rows)
    }

    /// Classifies a user's spends without writing anything. A user with no
    /// account audits as empty; reads never invent accounts.
    pub fn audit(
        &self,
        user_id: &UserId,
        policy: &AuditPolicy,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Vec<AuditedTransaction>> {
        policy.validate()?;

        let mut spends = self.spend_transactions(user_id)?;
        if let Some(start) = start {
            spends.retain(|transaction| transaction.created_at >= start);
        }
        if let Some(end) = end {
            spends.retain(|transaction| transaction.created_at <= end);
        }
        spends.sort_by_key(|transaction| (transaction.created_at, transaction.seq));

        let refunded = load_refunded_ids(&self.conn, user_id)?;
        let annotated = audit_transactions(&spends, &refunded, policy)?;
        Ok(annotated)
    }

    pub fn audit_report(
        &self,
        user_id: &UserId,
        policy: &AuditPolicy,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
        keep: KeepPolicy,
    ) -> Result<AuditReport> {
        let annotated = self.audit(user_id, policy, start, end)?;
        let duplicate_groups = group_duplicates(&annotated, keep);

        let duplicate_count = annotated.iter().filter(|item| item.duplicate).count();
        let suspicious_count = annotated.iter().filter(|item| item.suspicious).count();
        let refunded_count = annotated.iter().filter(|item| item.refunded).count();

        Ok(AuditReport {
            contract_version: AUDIT_REPORT_CONTRACT_VERSION.to_string(),
            generated_at: format_rfc3339(now_utc())?,
            user_id: user_id.clone(),
            policy: *policy,
            window_start: start.map(format_rfc3339).transpose()?,
            window_end: end.map(format_rfc3339).transpose()?,
            transactions_scanned: annotated.len(),
            duplicate_count,
            suspicious_count,
            refunded_count,
            transactions: annotated,
            duplicate_groups,
        })
    }

    /// Issues one compensating refund. Eligibility of the targeted spends is
    /// resolved inside the write transaction, so a spend consumed by a
    /// racing refund drops out before any money moves.
    pub fn refund(&mut self, request: &RefundRequest) -> Result<RefundResult> {
        request.validate()?;

        self.refund_inner(request)
            .map_err(|err| map_concurrency(err, &request.user_id))
    }

    fn refund_inner(&mut self, request: &RefundRequest) -> Result<RefundResult> {
        let refund_id = TransactionId::new();
        let created_at = now_utc();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start refund transaction")?;

        if account_balance(&tx, &request.user_id)?.is_none() {
            return Err(LedgerError::UserNotFound {
                user_id: request.user_id.clone(),
            }
            .into());
        }

        let (refunded_amount, refunded_ids): (i64, Vec<TransactionId>) = match &request.target {
            RefundTarget::Transactions(ids) => {
                let mut distinct = ids.clone();
                distinct.sort();
                distinct.dedup();

                let candidates = load_transactions_by_ids(&tx, &distinct)?;
                let refunded = load_refunded_ids(&tx, &request.user_id)?;
                let eligible = refund_eligible(&candidates, &request.user_id, &refunded);
                if eligible.is_empty() {
                    return Err(LedgerError::NoEligibleTransactions.into());
                }

                let total = refund_total(&eligible)?;
                let ids = eligible.iter().map(|transaction| transaction.id).collect();
                (total, ids)
            }
            RefundTarget::Amount(amount) => (*amount, Vec::new()),
        };

        let appended = write_transaction(
            &tx,
            &PendingTransaction {
                id: refund_id,
                user_id: &request.user_id,
                kind: TransactionKind::Refund,
                amount: refunded_amount,
                description: &format!("Refund: {}", request.reason),
                initiated_by: Some(&request.authorized_by),
                refund_of: &refunded_ids,
                created_at,
            },
        )?;

        let marker_created_at = format_rfc3339(created_at)?;
        for transaction_id in &refunded_ids {
            tx.execute(
                "INSERT INTO refund_markers(transaction_id, refund_id, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    transaction_id.to_string(),
                    refund_id.to_string(),
                    request.user_id.as_str(),
                    marker_created_at,
                ],
            )
            .context("failed to record refund marker")?;
        }

        tx.commit().context("failed to commit refund transaction")?;

        Ok(RefundResult {
            refund_transaction_id: refund_id,
            refunded_amount,
            refunded_transaction_ids: refunded_ids,
            balance_after: appended.balance_after,
        })
    }

    /// Finds strict duplicate groups across the window and refunds every
    /// member except the kept one in a single compensating transaction. The
    /// groups come from a plain audit read; the refund write re-checks
    /// eligibility, so running this twice never refunds a spend twice.
    pub fn bulk_refund_duplicates(&mut self, request: &BulkRefundRequest) -> Result<RefundResult> {
        if request.user_id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation(
                "user_id MUST be provided for every refund".to_string(),
            )
            .into());
        }
        if request.authorized_by.trim().is_empty() {
            return Err(LedgerError::Validation(
                "authorized_by MUST be provided for every refund".to_string(),
            )
            .into());
        }

        self.account(&request.user_id)?;

        let annotated = self.audit(&request.user_id, &AuditPolicy::v1(), request.start, request.end)?;
        let groups = group_duplicates(&annotated, request.keep);

        let refund_ids: Vec<TransactionId> = groups
            .iter()
            .flat_map(|group| group.refund_candidate_ids.iter().copied())
            .collect();
        if refund_ids.is_empty() {
            return Err(LedgerError::NoDuplicatesFound.into());
        }

        let reason = match &request.reason {
            Some(value) => value.clone(),
            None => "duplicate transaction cleanup".to_string(),
        };
        let annotated_reason = format!("{} ({} duplicates)", reason, refund_ids.len());

        self.refund(&RefundRequest {
            user_id: request.user_id.clone(),
            reason: annotated_reason,
            authorized_by: request.authorized_by.clone(),
            target: RefundTarget::Transactions(refund_ids),
        })
    }

    pub fn user_ledger_status(&self, user_id: &UserId) -> Result<UserLedgerStatus> {
        let account = self.account(user_id)?;
        let transactions = self.transactions_for_user(user_id, None)?;

        let mut replayed: i64 = 0;
        for transaction in &transactions {
            replayed = apply_amount(replayed, transaction.amount)?;
        }

        Ok(UserLedgerStatus {
            contract_version: LEDGER_STATUS_CONTRACT_VERSION.to_string(),
            user_id: user_id.clone(),
            cached_balance: account.balance,
            replayed_balance: replayed,
            drift: account.balance - replayed,
            transaction_count: transactions.len(),
            last_seq: transactions.last().map(|transaction| transaction.seq),
            last_balance_after: transactions
                .last()
                .map(|transaction| transaction.balance_after),
            updated_at: format_rfc3339(account.updated_at)?,
        })
    }

    /// Replays every account against its transaction log and cross-checks
    /// refund markers. Corruption is reported, never repaired.
    pub fn reconcile_check(&self) -> Result<ReconcileReport> {
        let accounts = self.accounts_snapshot()?;

        let mut issues: Vec<LedgerIssue> = Vec::new();
        let mut drift_sample: Vec<DriftSample> = Vec::new();
        let mut transactions_checked = 0usize;

        for (user_id, cached) in &accounts {
            let transactions = self.transactions_for_user(user_id, None)?;
            transactions_checked += transactions.len();

            let mut replayed: i64 = 0;
            let mut chain_flagged = false;
            let mut overflowed = false;
            for transaction in &transactions {
                let Some(next) = replayed.checked_add(transaction.amount) else {
                    issues.push(LedgerIssue {
                        code: "replayed_balance_overflow".to_string(),
                        severity: LedgerIssueSeverity::Error,
                        message: format!("ledger for user {} overflows during replay", user_id),
                    });
                    overflowed = true;
                    break;
                };
                replayed = next;
                if transaction.balance_after != next && !chain_flagged {
                    issues.push(LedgerIssue {
                        code: "balance_chain_broken".to_string(),
                        severity: LedgerIssueSeverity::Error,
                        message: format!(
                            "transaction {} for user {} recorded balance_after {} but replay expects {}",
                            transaction.id, user_id, transaction.balance_after, next
                        ),
                    });
                    chain_flagged = true;
                }
            }
            if overflowed {
                continue;
            }

            let drift = cached - replayed;
            if drift != 0 {
                issues.push(LedgerIssue {
                    code: "balance_drift".to_string(),
                    severity: LedgerIssueSeverity::Error,
                    message: format!(
                        "cached balance {} for user {} drifts from replayed balance {}",
                        cached, user_id, replayed
                    ),
                });
                if drift_sample.len() < DRIFT_SAMPLE_LIMIT {
                    drift_sample.push(DriftSample {
                        user_id: user_id.clone(),
                        cached_balance: *cached,
                        replayed_balance: replayed,
                        drift,
                    });
                }
            }

            if let Some(last) = transactions.last() {
                if last.balance_after != *cached {
                    issues.push(LedgerIssue {
                        code: "last_balance_after_mismatch".to_string(),
                        severity: LedgerIssueSeverity::Error,
                        message: format!(
                            "last transaction for user {} ends at {} but the cached balance is {}",
                            user_id, last.balance_after, cached
                        ),
                    });
                }
            }

            let amounts_by_id: BTreeMap<TransactionId, i64> = transactions
                .iter()
                .map(|transaction| (transaction.id, transaction.amount))
                .collect();
            for transaction in &transactions {
                if transaction.kind != TransactionKind::Refund || transaction.refund_of.is_empty() {
                    continue;
                }
                let mut bound: i64 = 0;
                let mut missing = false;
                for origin_id in &transaction.refund_of {
                    match amounts_by_id.get(origin_id) {
                        Some(amount) => bound = bound.saturating_add(amount.saturating_abs()),
                        None => missing = true,
                    }
                }
                if missing {
                    issues.push(LedgerIssue {
                        code: "refund_origin_missing".to_string(),
                        severity: LedgerIssueSeverity::Warning,
                        message: format!(
                            "refund {} references transactions outside the ledger of user {}",
                            transaction.id, user_id
                        ),
                    });
                } else if transaction.amount > bound {
                    issues.push(LedgerIssue {
                        code: "refund_exceeds_origin".to_string(),
                        severity: LedgerIssueSeverity::Error,
                        message: format!(
                            "refund {} credits {} but its origin spends total {}",
                            transaction.id, transaction.amount, bound
                        ),
                    });
                }
            }
        }

        let marker_origin_mismatches: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*)
                 FROM refund_markers AS markers
                 JOIN coin_transactions AS transactions ON transactions.id = markers.transaction_id
                 WHERE transactions.kind <> 'spend'",
                [],
                |row| row.get(0),
            )
            .context("failed to check refund marker origins")?;
        if marker_origin_mismatches > 0 {
            issues.push(LedgerIssue {
                code: "marker_origin_not_spend".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "{} refund markers reference non-spend transactions",
                    marker_origin_mismatches
                ),
            });
        }

        let marker_refund_mismatches: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*)
                 FROM refund_markers AS markers
                 JOIN coin_transactions AS transactions ON transactions.id = markers.refund_id
                 WHERE transactions.kind <> 'refund'",
                [],
                |row| row.get(0),
            )
            .context("failed to check refund marker refunds")?;
        if marker_refund_mismatches > 0 {
            issues.push(LedgerIssue {
                code: "marker_refund_not_refund".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "{} refund markers point at a non-refund transaction",
                    marker_refund_mismatches
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == LedgerIssueSeverity::Error);

        Ok(ReconcileReport {
            contract_version: RECONCILE_REPORT_CONTRACT_VERSION.to_string(),
            generated_at: format_rfc3339(now_utc())?,
            accounts_checked: accounts.len(),
            transactions_checked,
            healthy,
            issues,
            drift_sample,
        })
    }

    fn spend_transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, id, user_id, kind, amount, description, initiated_by, refund_of, created_at, balance_after
             FROM coin_transactions
             WHERE user_id = ?1 AND kind = 'spend'
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![user_id.as_str()], parse_transaction_row)?;
        collect_rows(rows)
    }

    fn accounts_snapshot(&self) -> Result<Vec<(UserId, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, balance FROM coin_accounts ORDER BY user_id ASC")?;
        let rows = stmt.query_map([], |row| Ok((UserId(row.get(0)?), row.get::<_, i64>(1)?)))?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

struct PendingTransaction<'a> {
    id: TransactionId,
    user_id: &'a UserId,
    kind: TransactionKind,
    amount: i64,
    description: &'a str,
    initiated_by: Option<&'a str>,
    refund_of: &'a [TransactionId],
    created_at: OffsetDateTime,
}

fn write_transaction(conn: &Connection, pending: &PendingTransaction<'_>) -> Result<Transaction> {
    let Some(balance) = account_balance(conn, pending.user_id)? else {
        return Err(LedgerError::UserNotFound {
            user_id: pending.user_id.clone(),
        }
        .into());
    };

    let balance_after = apply_amount(balance, pending.amount)?;
    let created_at_text = format_rfc3339(pending.created_at)?;
    let refund_of_json =
        serde_json::to_string(pending.refund_of).context("failed to serialize refund_of")?;

    conn.execute(
        "INSERT INTO coin_transactions(
            id, user_id, kind, amount, description,
            initiated_by, refund_of, created_at, balance_after
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            pending.id.to_string(),
            pending.user_id.as_str(),
            pending.kind.as_str(),
            pending.amount,
            pending.description,
            pending.initiated_by,
            refund_of_json,
            created_at_text,
            balance_after,
        ],
    )
    .context("failed to append ledger transaction")?;

    let seq = conn.last_insert_rowid();

    let updated_at = format_rfc3339(now_utc())?;
    conn.execute(
        "UPDATE coin_accounts SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
        params![balance_after, updated_at, pending.user_id.as_str()],
    )
    .context("failed to update cached balance")?;

    Ok(Transaction {
        seq,
        id: pending.id,
        user_id: pending.user_id.clone(),
        kind: pending.kind,
        amount: pending.amount,
        description: pending.description.to_string(),
        initiated_by: pending.initiated_by.map(str::to_string),
        refund_of: pending.refund_of.to_vec(),
        created_at: pending.created_at,
        balance_after,
    })
}

fn account_balance(conn: &Connection, user_id: &UserId) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT balance FROM coin_accounts WHERE user_id = ?1",
        params![user_id.as_str()],
        |row| row.get(0),
    )
    .optional()
    .context("failed to read account balance")
}

fn load_transactions_by_ids(conn: &Connection, ids: &[TransactionId]) -> Result<Vec<Transaction>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let query = format!(
        "SELECT seq, id, user_id, kind, amount, description, initiated_by, refund_of, created_at, balance_after
         FROM coin_transactions
         WHERE id IN ({placeholders})
         ORDER BY seq ASC"
    );

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(ids.iter().map(ToString::to_string)),
        parse_transaction_row,
    )?;
    collect_rows(rows)
}

fn load_refunded_ids(conn: &Connection, user_id: &UserId) -> Result<BTreeSet<TransactionId>> {
    let mut stmt = conn.prepare("SELECT transaction_id FROM refund_markers WHERE user_id = ?1")?;
    let rows = stmt.query_map(params![user_id.as_str()], |row| {
        let raw: String = row.get(0)?;
        parse_transaction_id(0, &raw)
    })?;

    let mut ids = BTreeSet::new();
    for row in rows {
        ids.insert(row.context("failed to read refund marker row")?);
    }
    Ok(ids)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn parse_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let id_raw: String = row.get(1)?;
    let kind_raw: String = row.get(3)?;
    let refund_of_json: String = row.get(7)?;

    let id = parse_transaction_id(1, &id_raw)?;
    let kind = TransactionKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid kind: {kind_raw}"),
            )),
        )
    })?;
    let refund_of: Vec<TransactionId> = serde_json::from_str(&refund_of_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid refund_of: {err}"),
            )),
        )
    })?;
    let created_at = parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?;

    Ok(Transaction {
        seq: row.get(0)?,
        id,
        user_id: UserId(row.get(2)?),
        kind,
        amount: row.get(4)?,
        description: row.get(5)?,
        initiated_by: row.get(6)?,
        refund_of,
        created_at,
        balance_after: row.get(9)?,
    })
}

fn parse_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let created_at = parse_rfc3339_utc(&row.get::<_, String>(2)?).map_err(to_sql_error)?;
    let updated_at = parse_rfc3339_utc(&row.get::<_, String>(3)?).map_err(to_sql_error)?;

    Ok(Account {
        user_id: UserId(row.get(0)?),
        balance: row.get(1)?,
        created_at,
        updated_at,
    })
}

fn parse_transaction_id(index: usize, raw: &str) -> rusqlite::Result<TransactionId> {
    TransactionId::parse(raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid transaction id ULID: {raw}"),
            )),
        )
    })
}

fn map_concurrency(err: anyhow::Error, user_id: &UserId) -> anyhow::Error {
    let busy = err.chain().any(|cause| {
        cause
            .downcast_ref::<rusqlite::Error>()
            .is_some_and(is_busy_error)
    });

    if busy {
        anyhow::Error::new(LedgerError::ConcurrentModification {
            user_id: user_id.clone(),
        })
    } else {
        err
    }
}

fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::DatabaseBusy
                || failure.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: LedgerError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed to read row")?);
    }
    Ok(items)
}
