use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("audit error: {0}")]
    Audit(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("account not found for user {user_id}")]
    UserNotFound { user_id: UserId },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("no eligible transactions to refund")]
    NoEligibleTransactions,
    #[error("no duplicate transactions found")]
    NoDuplicatesFound,
    #[error("concurrent ledger modification for user {user_id}")]
    ConcurrentModification { user_id: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TransactionId(pub Ulid);

impl TransactionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a transaction id from its canonical ULID string.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| LedgerError::Validation(format!("invalid transaction id: {err}")))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Earn,
    Spend,
    Purchase,
    Refund,
    Adjustment,
}

impl TransactionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Spend => "spend",
            Self::Purchase => "purchase",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "earn" => Some(Self::Earn),
            "spend" => Some(Self::Spend),
            "purchase" => Some(Self::Purchase),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

/// A committed ledger row. Immutable once written; corrections are always
/// new compensating transactions.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Transaction {
    pub seq: i64,
    pub id: TransactionId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    pub initiated_by: Option<String>,
    pub refund_of: Vec<TransactionId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub balance_after: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppendRequest {
    #[serde(default)]
    pub id: Option<TransactionId>,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    #[serde(default)]
    pub initiated_by: Option<String>,
    #[serde(default)]
    pub refund_of: Vec<TransactionId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl AppendRequest {
    /// Validates an append payload before it reaches the write path.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for structural problems and
    /// [`LedgerError::InvalidAmount`] when the amount is zero or carries
    /// the wrong sign for its kind.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.user_id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation(
                "user_id MUST be provided for every append".to_string(),
            ));
        }

        if self.description.trim().is_empty() {
            return Err(LedgerError::Validation(
                "description MUST be provided for every append".to_string(),
            ));
        }

        if self.amount == 0 {
            return Err(LedgerError::InvalidAmount(
                "amount MUST be nonzero".to_string(),
            ));
        }

        match self.kind {
            TransactionKind::Spend => {
                if self.amount > 0 {
                    return Err(LedgerError::InvalidAmount(
                        "spend amount MUST be negative".to_string(),
                    ));
                }
            }
            TransactionKind::Earn | TransactionKind::Purchase | TransactionKind::Refund => {
                if self.amount < 0 {
                    return Err(LedgerError::InvalidAmount(format!(
                        "{} amount MUST be positive",
                        self.kind.as_str()
                    )));
                }
            }
            TransactionKind::Adjustment => {}
        }

        if !self.refund_of.is_empty() && self.kind != TransactionKind::Refund {
            return Err(LedgerError::Validation(
                "refund_of is only valid on refund transactions".to_string(),
            ));
        }

        let distinct: BTreeSet<&TransactionId> = self.refund_of.iter().collect();
        if distinct.len() != self.refund_of.len() {
            return Err(LedgerError::Validation(
                "refund_of MUST NOT contain duplicate ids".to_string(),
            ));
        }

        if let Some(created_at) = self.created_at {
            if created_at.offset() != UtcOffset::UTC {
                return Err(LedgerError::Validation(
                    "created_at MUST be UTC (offset Z)".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Time windows for the duplicate/suspicious classifier. The strict window
/// drives automated refunds; the loose window widens the operator view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditPolicy {
    pub duplicate_window_seconds: i64,
    pub suspicious_window_seconds: i64,
}

impl AuditPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            duplicate_window_seconds: 60,
            suspicious_window_seconds: 120,
        }
    }

    /// Validates window bounds.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a window is not positive
    /// or the strict window exceeds the loose one.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.duplicate_window_seconds <= 0 {
            return Err(LedgerError::Configuration(
                "duplicate_window_seconds MUST be >= 1".to_string(),
            ));
        }

        if self.suspicious_window_seconds < self.duplicate_window_seconds {
            return Err(LedgerError::Configuration(
                "suspicious_window_seconds MUST be >= duplicate_window_seconds".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn duplicate_window(self) -> Duration {
        Duration::seconds(self.duplicate_window_seconds)
    }

    #[must_use]
    pub fn suspicious_window(self) -> Duration {
        Duration::seconds(self.suspicious_window_seconds)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum KeepPolicy {
    Earliest,
    Latest,
}

impl KeepPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "earliest" => Some(Self::Earliest),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }
}

impl Default for KeepPolicy {
    fn default() -> Self {
        Self::Earliest
    }
}

/// A spend transaction annotated by one audit run. Annotations are derived
/// per run and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub duplicate: bool,
    pub suspicious: bool,
    pub related_transaction_ids: Vec<TransactionId>,
    pub refunded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateGroup {
    pub description: String,
    pub amount: i64,
    /// Minutes since the Unix epoch for the group's `created_at` bucket.
    pub minute_bucket: i64,
    pub member_count: usize,
    pub kept_transaction_id: TransactionId,
    pub refund_candidate_ids: Vec<TransactionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RefundTarget {
    Transactions(Vec<TransactionId>),
    Amount(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RefundRequest {
    pub user_id: UserId,
    pub reason: String,
    pub authorized_by: String,
    pub target: RefundTarget,
}

impl RefundRequest {
    /// Validates the static parts of a refund request; eligibility of the
    /// targeted transactions is resolved against storage.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for missing fields,
    /// [`LedgerError::InvalidAmount`] for a non-positive explicit amount,
    /// and [`LedgerError::NoEligibleTransactions`] for an empty id set.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.user_id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation(
                "user_id MUST be provided for every refund".to_string(),
            ));
        }

        if self.reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reason MUST be provided for every refund".to_string(),
            ));
        }

        if self.authorized_by.trim().is_empty() {
            return Err(LedgerError::Validation(
                "authorized_by MUST be provided for every refund".to_string(),
            ));
        }

        match &self.target {
            RefundTarget::Transactions(ids) => {
                if ids.is_empty() {
                    return Err(LedgerError::NoEligibleTransactions);
                }
            }
            RefundTarget::Amount(amount) => {
                if *amount <= 0 {
                    return Err(LedgerError::InvalidAmount(
                        "refund amount MUST be positive".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RefundResult {
    pub refund_transaction_id: TransactionId,
    pub refunded_amount: i64,
    pub refunded_transaction_ids: Vec<TransactionId>,
    pub balance_after: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BulkRefundRequest {
    pub user_id: UserId,
    pub authorized_by: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    #[serde(default)]
    pub keep: KeepPolicy,
}

/// Classifies a single user's spend snapshot into duplicate and suspicious
/// sets. Pure: the caller supplies the snapshot, the already-refunded id
/// set, and the policy; nothing is read or written here.
///
/// The snapshot must belong to one user and be ordered by
/// `(created_at, seq)` ascending. Two spends with identical description and
/// amount are duplicates of each other when their timestamps differ by
/// strictly less than the duplicate window, and suspicious when strictly
/// less than the suspicious window. Non-spend kinds are not audit
/// candidates and do not appear in the output.
///
/// # Errors
/// Returns [`LedgerError::Audit`] when the snapshot mixes users or is out
/// of order, and [`LedgerError::Configuration`] for an invalid policy.
pub fn audit_transactions(
    transactions: &[Transaction],
    refunded: &BTreeSet<TransactionId>,
    policy: &AuditPolicy,
) -> Result<Vec<AuditedTransaction>, LedgerError> {
    policy.validate()?;

    let Some(first) = transactions.first() else {
        return Ok(Vec::new());
    };

    let mut prev: Option<&Transaction> = None;
    for transaction in transactions {
        if transaction.user_id != first.user_id {
            return Err(LedgerError::Audit(
                "audit snapshot MUST contain a single user".to_string(),
            ));
        }

        if let Some(prev) = prev {
            if (transaction.created_at, transaction.seq) <= (prev.created_at, prev.seq) {
                return Err(LedgerError::Audit(
                    "audit snapshot MUST be strictly ordered by (created_at, seq)".to_string(),
                ));
            }
        }
        prev = Some(transaction);
    }

    let candidates: Vec<&Transaction> = transactions
        .iter()
        .filter(|transaction| transaction.kind == TransactionKind::Spend)
        .collect();

    let count = candidates.len();
    let mut duplicate = vec![false; count];
    let mut suspicious = vec![false; count];
    let mut related: Vec<Vec<TransactionId>> = vec![Vec::new(); count];

    let duplicate_window = policy.duplicate_window();
    let suspicious_window = policy.suspicious_window();

    for left in 0..count {
        // Candidates stay sorted, so the scan can stop at the first
        // right-hand entry outside the loose window.
        for right in (left + 1)..count {
            let delta = candidates[right].created_at - candidates[left].created_at;
            if delta >= suspicious_window {
                break;
            }

            if candidates[left].description != candidates[right].description
                || candidates[left].amount != candidates[right].amount
            {
                continue;
            }

            suspicious[left] = true;
            suspicious[right] = true;
            if delta < duplicate_window {
                duplicate[left] = true;
                duplicate[right] = true;
            }

            push_related(&mut related[left], candidates[right].id);
            push_related(&mut related[right], candidates[left].id);
        }
    }

    Ok(candidates
        .into_iter()
        .enumerate()
        .map(|(index, transaction)| AuditedTransaction {
            refunded: refunded.contains(&transaction.id),
            transaction: transaction.clone(),
            duplicate: duplicate[index],
            suspicious: suspicious[index],
            related_transaction_ids: std::mem::take(&mut related[index]),
        })
        .collect())
}

/// Partitions strict duplicates into groups keyed by
/// `(description, amount, created_at truncated to the minute)` and selects
/// the surviving member per the keep policy. Already-refunded entries are
/// dropped before grouping, and groups with fewer than two outstanding
/// members dissolve.
#[must_use]
pub fn group_duplicates(audited: &[AuditedTransaction], keep: KeepPolicy) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<(String, i64, i64), Vec<&AuditedTransaction>> = BTreeMap::new();
    for entry in audited {
        if !entry.duplicate || entry.refunded {
            continue;
        }

        let minute = entry.transaction.created_at.unix_timestamp().div_euclid(60);
        buckets
            .entry((entry.transaction.description.clone(), entry.transaction.amount, minute))
            .or_default()
            .push(entry);
    }

    let mut groups = Vec::new();
    for ((description, amount, minute_bucket), mut members) in buckets {
        if members.len() < 2 {
            continue;
        }

        members.sort_by_key(|member| (member.transaction.created_at, member.transaction.seq));
        let kept_index = match keep {
            KeepPolicy::Earliest => 0,
            KeepPolicy::Latest => members.len() - 1,
        };

        let kept_transaction_id = members[kept_index].transaction.id;
        let refund_candidate_ids = members
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != kept_index)
            .map(|(_, member)| member.transaction.id)
            .collect();

        groups.push(DuplicateGroup {
            description,
            amount,
            minute_bucket,
            member_count: members.len(),
            kept_transaction_id,
            refund_candidate_ids,
        });
    }

    groups
}

/// Filters refund targets down to spends owned by the user that have not
/// already been consumed by a prior refund.
#[must_use]
pub fn refund_eligible<'a>(
    candidates: &'a [Transaction],
    user_id: &UserId,
    refunded: &BTreeSet<TransactionId>,
) -> Vec<&'a Transaction> {
    candidates
        .iter()
        .filter(|transaction| {
            transaction.user_id == *user_id
                && transaction.kind == TransactionKind::Spend
                && !refunded.contains(&transaction.id)
        })
        .collect()
}

/// Sums the absolute values of the eligible spends' amounts. The result is
/// the upper bound a compensating refund may carry.
///
/// # Errors
/// Returns [`LedgerError::InvalidAmount`] when the sum overflows.
pub fn refund_total(eligible: &[&Transaction]) -> Result<i64, LedgerError> {
    let mut total: i64 = 0;
    for transaction in eligible {
        let magnitude = transaction.amount.checked_abs().ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "amount of transaction {} is out of range",
                transaction.id
            ))
        })?;
        total = total.checked_add(magnitude).ok_or_else(|| {
            LedgerError::InvalidAmount("refund total overflows".to_string())
        })?;
    }
    Ok(total)
}

/// Applies a signed amount to a balance with overflow checking.
///
/// # Errors
/// Returns [`LedgerError::InvalidAmount`] when the new balance would not
/// fit in an `i64`.
pub fn apply_amount(balance: i64, amount: i64) -> Result<i64, LedgerError> {
    balance.checked_add(amount).ok_or_else(|| {
        LedgerError::InvalidAmount(format!("balance overflow applying {amount} to {balance}"))
    })
}

fn push_related(related: &mut Vec<TransactionId>, id: TransactionId) {
    if !related.contains(&id) {
        related.push(id);
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
