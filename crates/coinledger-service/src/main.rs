use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use coinledger_core::{
    parse_rfc3339_utc, AppendRequest, AuditPolicy, BulkRefundRequest, KeepPolicy, LedgerError,
    RefundRequest, RefundResult, Transaction, UserId,
};
use coinledger_store_sqlite::{
    Account, AuditReport, ReconcileReport, SchemaStatus, SqliteLedgerStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const SERVICE_CONTRACT_VERSION: &str = "coinledger_service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

/// Cloneable handle that opens a fresh store per operation, so blocking
/// work never shares a connection across tasks.
#[derive(Debug, Clone)]
struct LedgerApi {
    db_path: PathBuf,
}

impl LedgerApi {
    fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open(&self) -> Result<SqliteLedgerStore> {
        SqliteLedgerStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteLedgerStore> {
        let store = self.open()?;
        store.migrate()?;
        Ok(store)
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: LedgerApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct MigrateResponse {
    dry_run: bool,
    applied_versions: i64,
    schema: SchemaStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateAccountRequest {
    user_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    user_id: String,
    balance: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct AuditRunRequest {
    user_id: String,
    #[serde(default)]
    duplicate_window_seconds: Option<i64>,
    #[serde(default)]
    suspicious_window_seconds: Option<i64>,
    #[serde(default)]
    window_start: Option<String>,
    #[serde(default)]
    window_end: Option<String>,
    #[serde(default)]
    keep: Option<KeepPolicy>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    user_not_found_total: AtomicU64,
    refund_conflict_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    user_not_found_total: u64,
    refund_conflict_total: u64,
    schema_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    current_schema_version: i64,
    target_schema_version: i64,
    pending_migrations: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Parser)]
#[command(name = "coinledger-service")]
#[command(about = "Local HTTP service for the coin ledger")]
struct Args {
    #[arg(long, default_value = "./coin_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();

        if let Some(ledger_err) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<LedgerError>())
        {
            let (status, code) = match ledger_err {
                LedgerError::UserNotFound { .. } => (StatusCode::NOT_FOUND, "user_not_found"),
                LedgerError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "invalid_amount"),
                LedgerError::Validation(_) | LedgerError::Configuration(_) => {
                    (StatusCode::BAD_REQUEST, "validation_error")
                }
                LedgerError::NoEligibleTransactions => {
                    (StatusCode::CONFLICT, "no_eligible_transactions")
                }
                LedgerError::NoDuplicatesFound => (StatusCode::CONFLICT, "no_duplicates_found"),
                LedgerError::ConcurrentModification { .. } => {
                    (StatusCode::CONFLICT, "concurrent_modification")
                }
                LedgerError::Audit(_) => (StatusCode::INTERNAL_SERVER_ERROR, "audit_failed"),
            };
            return Self::failure(status, code, message, None);
        }

        let diagnostic = format!("{err:#}").to_ascii_lowercase();
        if diagnostic.contains("sqlite")
            || diagnostic.contains("database")
            || diagnostic.contains("schema")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(LedgerApi) -> Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                let timeout_ms =
                    u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX);
                Self::failure(
                    default_status,
                    default_code,
                    format!("{operation_label} timed out after {timeout_ms} ms"),
                    Some(json!({ "timeout_ms": timeout_ms })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" | "invalid_amount" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "user_not_found" => {
                self.user_not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "no_eligible_transactions" | "no_duplicates_found" | "concurrent_modification" => {
                self.refund_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "schema_unavailable" => {
                self.schema_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            user_not_found_total: self.user_not_found_total.load(Ordering::Relaxed),
            refund_conflict_total: self.refund_conflict_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/accounts", post(accounts_create))
        .route("/v1/accounts/:user_id/balance", get(account_balance))
        .route(
            "/v1/accounts/:user_id/transactions",
            get(account_transactions),
        )
        .route("/v1/transactions", post(transactions_append))
        .route("/v1/audit", post(audit_run))
        .route("/v1/refunds", post(refunds_apply))
        .route("/v1/refunds/duplicates", post(refunds_duplicates))
        .route("/v1/reconcile", get(reconcile_check))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState {
        api: LedgerApi::new(args.db),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let schema_status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_status",
            |api| {
                let store = api.open()?;
                store.schema_status()
            },
        )
        .await?;

    let is_ready = schema_status.pending_versions == 0
        && schema_status.current_version == schema_status.target_version;
    let checks = ReadinessChecks {
        current_schema_version: schema_status.current_version,
        target_schema_version: schema_status.target_version,
        pending_migrations: schema_status.pending_versions,
    };

    if is_ready {
        return Ok(Json(envelope(ReadinessResponse {
            status: "ready",
            checks,
        })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; run /v1/db/migrate before serving traffic",
        Some(json!({
            "current_version": schema_status.current_version,
            "target_version": schema_status.target_version,
            "pending_versions": schema_status.pending_versions
        })),
    ))
}

async fn openapi() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/yaml; charset=utf-8")],
        OPENAPI_YAML,
    )
}

async fn db_migrate(
    State(state): State<ServiceState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResponse>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "migration_failed",
            "migrate",
            move |api| {
                let store = api.open()?;
                let before = store.schema_status()?;
                if !request.dry_run {
                    store.migrate()?;
                }
                let after = store.schema_status()?;
                Ok(MigrateResponse {
                    dry_run: request.dry_run,
                    applied_versions: before.pending_versions - after.pending_versions,
                    schema: after,
                })
            },
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn accounts_create(
    State(state): State<ServiceState>,
    payload: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Account>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let account = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "create_account",
            move |api| {
                let store = api.open_migrated()?;
                store.create_account(&UserId(request.user_id))
            },
        )
        .await?;
    Ok(Json(envelope(account)))
}

async fn account_balance(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<BalanceResponse>>, ServiceFailure> {
    let balance = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "read_failed",
            "balance",
            move |api| {
                let store = api.open_migrated()?;
                let balance = store.balance(&UserId(user_id.clone()))?;
                Ok(BalanceResponse { user_id, balance })
            },
        )
        .await?;
    Ok(Json(envelope(balance)))
}

async fn account_transactions(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<Transaction>>>, ServiceFailure> {
    let transactions = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "read_failed",
            "transactions",
            move |api| {
                let store = api.open_migrated()?;
                store.transactions_for_user(&UserId(user_id), None)
            },
        )
        .await?;
    Ok(Json(envelope(transactions)))
}

async fn transactions_append(
    State(state): State<ServiceState>,
    payload: Result<Json<AppendRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Transaction>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let transaction = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "append",
            move |api| {
                let mut store = api.open_migrated()?;
                store.append(&request)
            },
        )
        .await?;
    Ok(Json(envelope(transaction)))
}

async fn audit_run(
    State(state): State<ServiceState>,
    payload: Result<Json<AuditRunRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AuditReport>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "audit_failed",
            "audit",
            move |api| {
                let defaults = AuditPolicy::v1();
                let policy = AuditPolicy {
                    duplicate_window_seconds: request
                        .duplicate_window_seconds
                        .unwrap_or(defaults.duplicate_window_seconds),
                    suspicious_window_seconds: request
                        .suspicious_window_seconds
                        .unwrap_or(defaults.suspicious_window_seconds),
                };
                let start = request
                    .window_start
                    .as_deref()
                    .map(parse_rfc3339_utc)
                    .transpose()?;
                let end = request
                    .window_end
                    .as_deref()
                    .map(parse_rfc3339_utc)
                    .transpose()?;

                let store = api.open_migrated()?;
                store.audit_report(
                    &UserId(request.user_id),
                    &policy,
                    start,
                    end,
                    request.keep.unwrap_or_default(),
                )
            },
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn refunds_apply(
    State(state): State<ServiceState>,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RefundResult>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "refund",
            move |api| {
                let mut store = api.open_migrated()?;
                store.refund(&request)
            },
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn refunds_duplicates(
    State(state): State<ServiceState>,
    payload: Result<Json<BulkRefundRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RefundResult>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "bulk_refund",
            move |api| {
                let mut store = api.open_migrated()?;
                store.bulk_refund_duplicates(&request)
            },
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn reconcile_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReconcileReport>>, ServiceFailure> {
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reconcile_failed",
            "reconcile",
            |api| {
                let store = api.open_migrated()?;
                store.reconcile_check()
            },
        )
        .await?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("coinledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(api: LedgerApi, timeout_ms: u64) -> ServiceState {
        ServiceState {
            api,
            operation_timeout: Duration::from_millis(timeout_ms),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn get_request(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}"))
    }

    fn post_json(uri: &str, payload: &serde_json::Value) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}"))
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(serde_json::Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = test_state(LedgerApi::new(unique_temp_db_path()), 2500);
        let router = app(state);

        let response = send(router, get_request("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value
                .get("service_contract_version")
                .and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("status"))
                .and_then(serde_json::Value::as_str),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = test_state(LedgerApi::new(unique_temp_db_path()), 2500);
        let router = app(state);

        let response = send(router, get_request("/v1/openapi")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: coinledger_service.v1"));
        assert!(body.contains("/v1/refunds/duplicates"));
        assert!(body.contains("/v1/audit"));
        assert!(body.contains("/v1/ready"));
        assert!(body.contains("ServiceErrorEnvelope"));
    }

    #[tokio::test]
    async fn ready_endpoint_reports_ready_after_migration() {
        let db_path = unique_temp_db_path();
        let api = LedgerApi::new(db_path.clone());
        if let Err(err) = api.open_migrated() {
            panic!("failed to migrate schema before readiness test: {err:#}");
        }
        let router = app(test_state(api, 2500));

        let response = send(router, get_request("/v1/ready")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("status"))
                .and_then(serde_json::Value::as_str),
            Some("ready")
        );
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("checks"))
                .and_then(|checks| checks.get("pending_migrations"))
                .and_then(serde_json::Value::as_i64),
            Some(0)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn ready_endpoint_reports_schema_unavailable_before_migration() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let response = send(router, get_request("/v1/ready")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("schema_unavailable"));
        assert!(
            value.get("data").is_none(),
            "error envelope must not include data: {value}"
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn run_blocking_returns_success_for_fast_operation() {
        let state = test_state(LedgerApi::new(unique_temp_db_path()), 2500);

        let result = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "read_failed",
                "unit_fast_operation",
                |_api| Ok::<_, anyhow::Error>(42_u32),
            )
            .await;

        match result {
            Ok(value) => assert_eq!(value, 42),
            Err(err) => panic!("expected fast blocking operation to succeed: {err:?}"),
        }
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_mapped_error_status() {
        let state = test_state(LedgerApi::new(unique_temp_db_path()), 1);

        let result = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "read_failed",
                "unit_timeout_operation",
                |_api| {
                    std::thread::sleep(Duration::from_millis(25));
                    Ok::<_, anyhow::Error>(())
                },
            )
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.code, "read_failed");
                assert!(
                    err.message.contains("timed out"),
                    "timeout error message must mention timeout: {}",
                    err.message
                );
                assert!(err.details.is_some(), "timeout error should include details");
            }
        }
    }

    #[tokio::test]
    async fn telemetry_counters_track_success_failure_and_timeout() {
        let state = test_state(LedgerApi::new(unique_temp_db_path()), 50);

        let success = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "read_failed",
                "telemetry_success",
                |_api| Ok::<_, anyhow::Error>(1_u32),
            )
            .await;
        assert!(success.is_ok(), "expected success path for telemetry test");

        let timeout = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "read_failed",
                "telemetry_timeout",
                |_api| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok::<_, anyhow::Error>(0_u32)
                },
            )
            .await;
        assert!(timeout.is_err(), "expected timeout path for telemetry test");

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
        assert_eq!(snapshot.timeout_total, 1);
    }

    #[tokio::test]
    async fn service_append_audit_and_refund_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let state = test_state(LedgerApi::new(db_path.clone()), 2500);
        let router = app(state);

        let create = send(
            router.clone(),
            post_json("/v1/accounts", &json!({"user_id": "user-1"})),
        )
        .await;
        assert_eq!(create.status(), StatusCode::OK);

        let earn = send(
            router.clone(),
            post_json(
                "/v1/transactions",
                &json!({
                    "user_id": "user-1",
                    "kind": "earn",
                    "amount": 100,
                    "description": "Signup grant"
                }),
            ),
        )
        .await;
        assert_eq!(earn.status(), StatusCode::OK);

        for created_at in [
            "2026-03-01T12:00:00Z",
            "2026-03-01T12:00:05Z",
            "2026-03-01T12:00:50Z",
        ] {
            let spend = send(
                router.clone(),
                post_json(
                    "/v1/transactions",
                    &json!({
                        "user_id": "user-1",
                        "kind": "spend",
                        "amount": -20,
                        "description": "Premium search",
                        "created_at": created_at
                    }),
                ),
            )
            .await;
            assert_eq!(spend.status(), StatusCode::OK);
        }

        let audit = send(
            router.clone(),
            post_json("/v1/audit", &json!({"user_id": "user-1"})),
        )
        .await;
        assert_eq!(audit.status(), StatusCode::OK);
        let audit_value = response_json(audit).await;
        assert_eq!(
            audit_value
                .get("data")
                .and_then(|data| data.get("contract_version"))
                .and_then(serde_json::Value::as_str),
            Some("audit_report.v1")
        );
        assert_eq!(
            audit_value
                .get("data")
                .and_then(|data| data.get("duplicate_count"))
                .and_then(serde_json::Value::as_u64),
            Some(3)
        );

        let refund = send(
            router.clone(),
            post_json(
                "/v1/refunds/duplicates",
                &json!({
                    "user_id": "user-1",
                    "authorized_by": "billing@example.com"
                }),
            ),
        )
        .await;
        assert_eq!(refund.status(), StatusCode::OK);
        let refund_value = response_json(refund).await;
        assert_eq!(
            refund_value
                .get("data")
                .and_then(|data| data.get("refunded_amount"))
                .and_then(serde_json::Value::as_i64),
            Some(40)
        );
        assert_eq!(
            refund_value
                .get("data")
                .and_then(|data| data.get("balance_after"))
                .and_then(serde_json::Value::as_i64),
            Some(80)
        );

        let balance = send(router.clone(), get_request("/v1/accounts/user-1/balance")).await;
        assert_eq!(balance.status(), StatusCode::OK);
        let balance_value = response_json(balance).await;
        assert_eq!(
            balance_value
                .get("data")
                .and_then(|data| data.get("balance"))
                .and_then(serde_json::Value::as_i64),
            Some(80)
        );

        let reconcile = send(router, get_request("/v1/reconcile")).await;
        assert_eq!(reconcile.status(), StatusCode::OK);
        let reconcile_value = response_json(reconcile).await;
        assert_eq!(
            reconcile_value
                .get("data")
                .and_then(|data| data.get("healthy"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn unknown_user_returns_not_found_machine_error() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let response = send(router, get_request("/v1/accounts/ghost/balance")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("user_not_found"));
        assert_eq!(
            value
                .get("service_contract_version")
                .and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn append_with_wrong_sign_returns_invalid_amount() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let create = send(
            router.clone(),
            post_json("/v1/accounts", &json!({"user_id": "user-1"})),
        )
        .await;
        assert_eq!(create.status(), StatusCode::OK);

        let response = send(
            router,
            post_json(
                "/v1/transactions",
                &json!({
                    "user_id": "user-1",
                    "kind": "spend",
                    "amount": 20,
                    "description": "Premium search"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_amount"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn bulk_refund_without_duplicates_returns_conflict() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let create = send(
            router.clone(),
            post_json("/v1/accounts", &json!({"user_id": "user-1"})),
        )
        .await;
        assert_eq!(create.status(), StatusCode::OK);

        let response = send(
            router,
            post_json(
                "/v1/refunds/duplicates",
                &json!({
                    "user_id": "user-1",
                    "authorized_by": "billing@example.com"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("no_duplicates_found"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn invalid_json_payload_returns_invalid_json_error() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let request = Request::builder()
            .uri("/v1/audit")
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{".to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
        assert!(
            value
                .get("error")
                .and_then(|error| error.get("details"))
                .and_then(|details| details.get("rejection"))
                .and_then(serde_json::Value::as_str)
                .is_some(),
            "missing json rejection details: {value}"
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn audit_with_malformed_window_returns_validation_error() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let create = send(
            router.clone(),
            post_json("/v1/accounts", &json!({"user_id": "user-1"})),
        )
        .await;
        assert_eq!(create.status(), StatusCode::OK);

        let response = send(
            router,
            post_json(
                "/v1/audit",
                &json!({
                    "user_id": "user-1",
                    "window_start": "yesterday"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("validation_error"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn migrate_endpoint_applies_schema_and_reports_versions() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(LedgerApi::new(db_path.clone()), 2500));

        let dry = send(
            router.clone(),
            post_json("/v1/db/migrate", &json!({"dry_run": true})),
        )
        .await;
        assert_eq!(dry.status(), StatusCode::OK);
        let dry_value = response_json(dry).await;
        assert_eq!(
            dry_value
                .get("data")
                .and_then(|data| data.get("applied_versions"))
                .and_then(serde_json::Value::as_i64),
            Some(0)
        );

        let apply = send(
            router.clone(),
            post_json("/v1/db/migrate", &json!({"dry_run": false})),
        )
        .await;
        assert_eq!(apply.status(), StatusCode::OK);
        let apply_value = response_json(apply).await;
        assert_eq!(
            apply_value
                .get("data")
                .and_then(|data| data.get("applied_versions"))
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let ready = send(router, get_request("/v1/ready")).await;
        assert_eq!(ready.status(), StatusCode::OK);

        let _ = std::fs::remove_file(&db_path);
    }
}
