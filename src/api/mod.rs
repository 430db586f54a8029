//! HTTP API for health checks, loan status and operator actions

use crate::chain::ChainPair;
use crate::config::ApiConfig;
use crate::devnet::{Devnet, LoanApplication};
use crate::error::{ErrorClass, RelayerError, RelayerResult};
use crate::ledger::CollateralLedger;
use crate::metadata::MetadataClient;
use crate::orchestrator::LoanEngine;
use crate::state::LoanStore;
use crate::types::{AssetId, LoanId, LoanRecord, LoanState};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LoanStore>,
    pub engine: Arc<LoanEngine>,
    pub collateral: Arc<dyn CollateralLedger>,
    pub metadata: Arc<MetadataClient>,
    /// Set under the EVM transport
    pub chains: Option<Arc<ChainPair>>,
    /// Set under the local transport; enables the borrower-side routes
    pub devnet: Option<Arc<Devnet>>,
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/loans", get(list_loans))
        .route("/loans/:loan_id", get(get_loan))
        .route("/loans/:loan_id/resume", post(resume_loan))
        .route("/assets/:asset_id", get(get_asset))
        .route("/assets/:asset_id/metadata", get(get_asset_metadata));

    if state.devnet.is_some() {
        app = app
            .route("/devnet/assets/:asset_id/approve", post(devnet_approve))
            .route("/devnet/loans", post(devnet_request_loan))
            .route("/devnet/loans/:loan_id/repay", post(devnet_repay));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("cannot bind API server to {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Error body: `{"error": "..."}` with a status derived from the error kind
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

fn status_for_class(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Business => StatusCode::CONFLICT,
        ErrorClass::Transient | ErrorClass::Ambiguous => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        let status = match &err {
            RelayerError::LoanNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayerError::Collateral(crate::error::CollateralError::UnknownAsset(_)) => {
                StatusCode::NOT_FOUND
            }
            RelayerError::Collateral(e) => status_for_class(e.class()),
            RelayerError::LoanLedger(e) => status_for_class(e.class()),
            RelayerError::Relay(e) => status_for_class(e.class()),
            RelayerError::Metadata(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if err.should_alert() {
            error!("API request failed, operator action needed: {}", err);
        } else if status.is_server_error() {
            warn!("API request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<crate::error::CollateralError> for ApiError {
    fn from(err: crate::error::CollateralError) -> Self {
        RelayerError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

fn parse_loan_id(raw: &str) -> Result<LoanId, ApiError> {
    raw.parse::<LoanId>().map_err(ApiError::bad_request)
}

fn devnet(state: &AppState) -> Result<&Arc<Devnet>, ApiError> {
    state
        .devnet
        .as_ref()
        .ok_or_else(|| ApiError::not_found("devnet routes are only served by the local transport"))
}

/// Liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: store reachable and, under the EVM transport, both chains answering
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();

    let details = match &state.chains {
        Some(chains) => chains
            .health_check()
            .await
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
        None => Vec::new(),
    };
    let chains = details.iter().all(|c| c.healthy);
    let ready = database && chains;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            details,
        }),
    )
}

async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(stats))
}

async fn get_loan(
    State(state): State<AppState>,
    Path(loan_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let loan_id = parse_loan_id(&loan_id)?;
    let record = state
        .store
        .get_loan(&loan_id)
        .await?
        .ok_or(RelayerError::LoanNotFound { loan_id })?;
    Ok(Json(record))
}

/// A borrower's loans, newest first
async fn list_loans(
    State(state): State<AppState>,
    Query(query): Query<LoansQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let borrower = query
        .borrower
        .parse::<Address>()
        .map_err(|e| ApiError::bad_request(format!("invalid borrower address: {}", e)))?;
    let loans: Vec<LoanSummary> = state
        .store
        .loans_by_borrower(borrower)
        .await?
        .iter()
        .map(LoanSummary::from)
        .collect();
    Ok(Json(loans))
}

/// Operator action: clear a halt so the next tick retries the loan
async fn resume_loan(
    State(state): State<AppState>,
    Path(loan_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let loan_id = parse_loan_id(&loan_id)?;
    let record = state.engine.resume(loan_id).await?;
    Ok(Json(record))
}

async fn get_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let asset = state
        .collateral
        .asset(AssetId(asset_id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("asset {} is not registered", asset_id)))?;
    Ok(Json(asset))
}

async fn get_asset_metadata(
    State(state): State<AppState>,
    Path(asset_id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let token_uri = state.collateral.token_uri(AssetId(asset_id)).await?;
    let metadata = state.metadata.fetch(&token_uri).await?;
    Ok(Json(metadata))
}

async fn devnet_approve(
    State(state): State<AppState>,
    Path(asset_id): Path<u64>,
    Json(body): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    devnet(&state)?
        .approve_collateral(AssetId(asset_id), body.owner)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn devnet_request_loan(
    State(state): State<AppState>,
    Json(application): Json<LoanApplication>,
) -> Result<impl IntoResponse, ApiError> {
    let loan_id = devnet(&state)?.request_loan(&application)?;
    Ok((StatusCode::ACCEPTED, Json(LoanRequestedResponse { loan_id })))
}

async fn devnet_repay(
    State(state): State<AppState>,
    Path(loan_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let loan_id = parse_loan_id(&loan_id)?;
    let amount = devnet(&state)?.repay_loan(loan_id).await?;
    Ok(Json(RepaidResponse {
        loan_id,
        amount: amount.to_string(),
    }))
}

// Request and response types

#[derive(Deserialize)]
struct LoansQuery {
    borrower: String,
}

/// What a borrower needs to see about one loan
#[derive(Serialize)]
struct LoanSummary {
    loan_id: LoanId,
    asset_id: AssetId,
    state: LoanState,
    /// Wei, decimal string
    principal: String,
    interest_rate_bps: u32,
    /// Wei, decimal string
    repayment_due: Option<String>,
    due_at: Option<DateTime<Utc>>,
    halted: bool,
    last_error: Option<String>,
}

impl From<&LoanRecord> for LoanSummary {
    fn from(record: &LoanRecord) -> Self {
        let loan = &record.loan;
        Self {
            loan_id: loan.loan_id,
            asset_id: loan.asset_id,
            state: loan.state,
            principal: loan.principal.to_string(),
            interest_rate_bps: loan.interest_rate_bps,
            repayment_due: loan.repayment_due().map(|due| due.to_string()),
            due_at: loan.due_at,
            halted: record.halted,
            last_error: record.last_error.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ApproveRequest {
    owner: Address,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct LoanRequestedResponse {
    loan_id: LoanId,
}

#[derive(Serialize)]
struct RepaidResponse {
    loan_id: LoanId,
    /// Wei, decimal string
    amount: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::local_test_settings;
    use crate::state::MemoryLoanStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<Devnet>) {
        let (app, devnet, _) = app_with_store().await;
        (app, devnet)
    }

    async fn app_with_store() -> (Router, Arc<Devnet>, Arc<dyn LoanStore>) {
        let settings = local_test_settings();
        let store: Arc<dyn LoanStore> = Arc::new(MemoryLoanStore::new());
        let devnet = Arc::new(Devnet::new(&settings, store.clone()).await.unwrap());
        let engine = Arc::new(LoanEngine::new(
            devnet.engine_config(),
            store.clone(),
            devnet.adapters(),
            devnet.clock().clone(),
        ));
        let state = AppState {
            store: store.clone(),
            engine,
            collateral: devnet.collateral().clone(),
            metadata: Arc::new(MetadataClient::new(&settings.metadata).unwrap()),
            chains: None,
            devnet: Some(devnet.clone()),
        };
        (router(state), devnet, store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_loan_lookup_validates_id() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(Request::get("/loans/0x1234").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let unknown = format!("/loans/{}", LoanId([7u8; 32]));
        let response = app
            .oneshot(Request::get(unknown.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_loans_listed_by_borrower() {
        let (app, _, store) = app_with_store().await;
        let borrower = Address::repeat_byte(0xb0);
        let loan_id = LoanId::derive(1, AssetId(1), borrower, ethers::types::U256::one());
        let mut record = LoanRecord::new(
            crate::types::Loan {
                loan_id,
                source_domain: 1,
                destination_domain: 2,
                asset_id: AssetId(1),
                borrower,
                principal: ethers::types::U256::from(1_000_000u64),
                interest_rate_bps: 500,
                duration_secs: 30 * 86_400,
                issued_at: None,
                due_at: None,
                state: LoanState::Active,
            },
            Utc::now(),
        );
        record.last_error = Some("rpc down".to_string());
        store.upsert_loan(&record).await.unwrap();

        let uri = format!("/loans?borrower={:?}", borrower);
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let loans = body_json(response).await;
        let loans = loans.as_array().unwrap();
        assert_eq!(loans.len(), 1);
        assert_eq!(loans[0]["state"], "active");
        assert_eq!(loans[0]["principal"], "1000000");
        assert_eq!(loans[0]["repayment_due"], "1050000");
        assert_eq!(loans[0]["last_error"], "rpc down");

        let uri = format!("/loans?borrower={:?}", Address::repeat_byte(0xb1));
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([]));

        let response = app
            .oneshot(Request::get("/loans?borrower=nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_asset_is_not_found() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/assets/99").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_devnet_request_flow() {
        let (app, devnet) = app().await;
        let owner = Address::repeat_byte(0xb0);
        devnet
            .collateral()
            .register_asset(AssetId(3), owner, "ipfs://QmThree");

        // Unapproved: the collateral manager refuses on business grounds
        let application = serde_json::json!({
            "asset_id": 3,
            "borrower": format!("{:?}", owner),
            "amount": "1000",
            "duration_days": 30,
            "destination_chain": "arbitrum",
        });
        let response = app
            .clone()
            .oneshot(post_json("/devnet/loans", application.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(post_json(
                "/devnet/assets/3/approve",
                serde_json::json!({ "owner": format!("{:?}", owner) }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(post_json("/devnet/loans", application))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let loan_id = body_json(response).await["loan_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(loan_id.parse::<LoanId>().is_ok());

        let response = app
            .oneshot(Request::get("/assets/3").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_application_is_rejected() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post_json(
                "/devnet/loans",
                serde_json::json!({
                    "asset_id": 1,
                    "borrower": format!("{:?}", Address::repeat_byte(0xb0)),
                    "amount": "0",
                    "duration_days": 30,
                    "destination_chain": "arbitrum",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
