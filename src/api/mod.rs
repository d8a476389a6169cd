//! HTTP API for transactions, workflows, event normalisation and health

use crate::actions::Action;
use crate::chain::AbiRegistry;
use crate::config::ApiConfig;
use crate::coordination::CoordinationEngine;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{
    most_recent_annotation, parse_subgraph_event, sort_events, NormalizedEvent, SortDirection,
    SubgraphEvent,
};
use crate::metrics;
use crate::state::StateManager;
use crate::tx::{Params, TransactionRecord, TransactionStats, TxConfig};
use crate::workflows::{create_colony, CreateColonyRequest, NameChecker};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const RECENT_ACTIONS: usize = 256;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
    pub name_checker: Arc<NameChecker>,
    pub state_manager: Option<Arc<StateManager>>,
    pub actions: Arc<ActionLog>,
    /// Event names declared here are counted by name in metrics
    pub abis: Arc<AbiRegistry>,
}

/// Most recent actions published on the engine bus
#[derive(Default)]
pub struct ActionLog {
    recent: Mutex<VecDeque<Action>>,
}

impl ActionLog {
    pub fn push(&self, action: Action) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_ACTIONS {
                recent.pop_front();
            }
            recent.push_back(action);
        }
    }

    /// Actions in publication order, optionally only those for one id
    pub fn snapshot(&self, id: Option<&str>) -> Vec<Action> {
        self.recent
            .lock()
            .map(|recent| {
                recent
                    .iter()
                    .filter(|action| id.map_or(true, |id| action.id() == id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy bus traffic into the log until the bus closes
    pub async fn follow(self: Arc<Self>, mut bus: broadcast::Receiver<Action>) {
        loop {
            match bus.recv().await {
                Ok(action) => self.push(action),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Action log lagged, skipped {} actions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Error body returned by every failing handler
pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordinatorError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            CoordinatorError::InvalidRequest(_)
            | CoordinatorError::InvalidPayload(_)
            | CoordinatorError::EventParsing(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::InvalidStateTransition { .. }
            | CoordinatorError::NameTaken { .. }
            | CoordinatorError::DuplicateTransaction { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(json!({ "kind": self.0.kind(), "error": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/actions", get(get_actions))
        .route("/transactions", get(list_transactions).post(create_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/params", post(add_params))
        .route("/transactions/:id/identifier", post(add_identifier))
        .route("/transactions/:id/ready", post(mark_ready))
        .route("/transactions/:id/estimate", post(estimate_gas))
        .route("/transactions/:id/send", post(send_transaction))
        .route("/transactions/:id/cancel", post(cancel_transaction))
        .route("/groups/:id", get(get_group))
        .route("/colonies", post(start_colony_create))
        .route("/colonies/name-check", post(check_colony_name))
        .route("/events/normalize", post(normalize_events))
        .route("/events/annotation", post(find_annotation))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - the chain client and, when configured, the database
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain = state.engine.client().health_check().await;
    let database = match &state.state_manager {
        Some(manager) => Some(manager.health_check().await.is_ok()),
        None => None,
    };

    let ready = chain && database.unwrap_or(true);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            chain,
            database,
        }),
    )
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        transactions: state.engine.registry().stats().await,
        open_channels: state.engine.dispatcher().channels().open_count(),
    })
}

async fn get_actions(
    State(state): State<AppState>,
    Query(query): Query<ActionsQuery>,
) -> Json<Vec<Action>> {
    Json(state.actions.snapshot(query.id.as_deref()))
}

async fn list_transactions(State(state): State<AppState>) -> Json<Vec<TransactionRecord>> {
    Json(state.engine.registry().list().await)
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransactionRecord>> {
    state
        .engine
        .registry()
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| CoordinatorError::TransactionNotFound { tx_id: id }.into())
}

async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<TransactionRecord>> {
    Json(state.engine.registry().group(&id).await)
}

/// Enqueue a standalone transaction
async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<CreateTransactionRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let id = request
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if state.engine.registry().get(&id).await.is_some() {
        return Err(CoordinatorError::DuplicateTransaction { tx_id: id }.into());
    }
    let record = TransactionRecord::new(id.clone(), request.config, None);
    state
        .engine
        .dispatcher()
        .dispatch(Action::transaction_created(&record))?;
    Ok(accepted(id))
}

async fn add_params(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(params): Json<Params>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    dispatch_for(&state, &id, Action::transaction_add_params(&id, params)).await
}

async fn add_identifier(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<IdentifierRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    dispatch_for(
        &state,
        &id,
        Action::transaction_add_identifier(&id, request.identifier),
    )
    .await
}

async fn mark_ready(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    dispatch_for(&state, &id, Action::transaction_ready(&id)).await
}

async fn estimate_gas(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    dispatch_for(&state, &id, Action::transaction_estimate_gas(&id)).await
}

async fn send_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    dispatch_for(&state, &id, Action::transaction_send(&id)).await
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    dispatch_for(&state, &id, Action::transaction_cancel(&id)).await
}

/// Dispatch an action for an existing transaction
async fn dispatch_for(
    state: &AppState,
    id: &str,
    action: Action,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    if state.engine.registry().get(id).await.is_none() {
        return Err(CoordinatorError::TransactionNotFound {
            tx_id: id.to_string(),
        }
        .into());
    }
    state.engine.dispatcher().dispatch(action)?;
    Ok(accepted(id.to_string()))
}

fn accepted(id: String) -> (StatusCode, Json<AcceptedResponse>) {
    (StatusCode::ACCEPTED, Json(AcceptedResponse { id }))
}

/// Start the colony creation batch; progress is reported through actions
async fn start_colony_create(
    State(state): State<AppState>,
    Json(request): Json<CreateColonyRequest>,
) -> (StatusCode, Json<AcceptedResponse>) {
    let group_id = uuid::Uuid::new_v4().to_string();
    let dispatcher = state.engine.dispatcher();
    let client = state.engine.client().clone();

    tokio::spawn({
        let group_id = group_id.clone();
        async move {
            if let Err(e) = create_colony(dispatcher, client, group_id.clone(), request).await {
                warn!("Colony creation {} ended with error: {}", group_id, e);
            }
        }
    });

    accepted(group_id)
}

async fn check_colony_name(
    State(state): State<AppState>,
    Json(request): Json<NameCheckRequest>,
) -> ApiResult<Json<NameCheckResponse>> {
    let key = request.key.unwrap_or_else(|| "default".to_string());
    let available = state
        .name_checker
        .check(&key, &request.colony_name)
        .await?;

    Ok(Json(NameCheckResponse {
        key,
        superseded: available.is_none(),
        available,
    }))
}

fn parse_all(abis: &AbiRegistry, events: &[SubgraphEvent]) -> CoordinatorResult<Vec<NormalizedEvent>> {
    let parsed = events
        .iter()
        .map(parse_subgraph_event)
        .collect::<CoordinatorResult<Vec<_>>>()?;
    for event in &parsed {
        metrics::record_event_normalized(&event.name, abis.knows_event(&event.name));
    }
    Ok(parsed)
}

async fn normalize_events(
    State(state): State<AppState>,
    Json(request): Json<NormalizeRequest>,
) -> ApiResult<Json<Vec<NormalizedEvent>>> {
    let mut events = parse_all(&state.abis, &request.events)?;
    sort_events(&mut events, request.direction.unwrap_or_default());
    Ok(Json(events))
}

async fn find_annotation(
    State(state): State<AppState>,
    Json(request): Json<AnnotationRequest>,
) -> ApiResult<Json<Option<NormalizedEvent>>> {
    let events = parse_all(&state.abis, &request.events)?;
    Ok(Json(most_recent_annotation(events, &request.user)))
}

// Request types

#[derive(Deserialize)]
struct CreateTransactionRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    config: TxConfig,
}

#[derive(Deserialize)]
struct IdentifierRequest {
    identifier: String,
}

#[derive(Deserialize)]
struct ActionsQuery {
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NameCheckRequest {
    #[serde(default)]
    key: Option<String>,
    colony_name: String,
}

#[derive(Deserialize)]
struct NormalizeRequest {
    events: Vec<SubgraphEvent>,
    #[serde(default)]
    direction: Option<SortDirection>,
}

#[derive(Deserialize)]
struct AnnotationRequest {
    events: Vec<SubgraphEvent>,
    user: String,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chain: bool,
    /// Absent when no database is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<bool>,
}

#[derive(Serialize)]
struct StatsResponse {
    transactions: TransactionStats,
    open_channels: usize,
}

#[derive(Serialize)]
struct AcceptedResponse {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NameCheckResponse {
    key: String,
    available: Option<bool>,
    superseded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionType;
    use crate::chain::MockContractClient;
    use crate::config::CoordinatorConfig;
    use crate::tx::{ContractContext, TransactionStatus};
    use serde_json::Value;

    fn app_state(client: MockContractClient) -> AppState {
        let client: Arc<dyn crate::chain::ContractClient> = Arc::new(client);
        let config = CoordinatorConfig::for_tests();
        let engine = Arc::new(CoordinationEngine::new(client.clone(), None, config.clone()));
        let runner = engine.clone();
        tokio::spawn(async move { runner.run().await });

        let actions = Arc::new(ActionLog::default());
        tokio::spawn(actions.clone().follow(engine.subscribe()));

        AppState {
            name_checker: Arc::new(NameChecker::new(
                engine.dispatcher(),
                client,
                config.name_check_debounce_ms,
            )),
            engine,
            state_manager: None,
            actions,
            abis: Arc::new(AbiRegistry::new()),
        }
    }

    fn idle_client() -> MockContractClient {
        let mut client = MockContractClient::new();
        client.expect_health_check().returning(|| true);
        client.expect_send().never();
        client
    }

    async fn wait_for_record(state: &AppState, id: &str) -> TransactionRecord {
        loop {
            if let Some(record) = state.engine.registry().get(id).await {
                return record;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_transaction() {
        let state = app_state(idle_client());

        let request: CreateTransactionRequest = serde_json::from_value(json!({
            "id": "manual-1",
            "context": "colony",
            "method_name": "moveFundsBetweenPots",
            "ready": false,
        }))
        .unwrap();
        let (status, Json(body)) = create_transaction(State(state.clone()), Json(request))
            .await
            .ok()
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.id, "manual-1");

        let record = wait_for_record(&state, "manual-1").await;
        assert_eq!(record.context, ContractContext::Colony);
        assert_eq!(record.status, TransactionStatus::Created);

        let Json(fetched) = get_transaction(State(state.clone()), Path("manual-1".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(fetched.id, "manual-1");
        state.engine.stop();
    }

    #[tokio::test]
    async fn test_existing_id_conflicts() {
        let state = app_state(idle_client());
        let request = || -> CreateTransactionRequest {
            serde_json::from_value(json!({
                "id": "manual-2",
                "context": "token",
                "method_name": "approve",
                "ready": false,
            }))
            .unwrap()
        };

        create_transaction(State(state.clone()), Json(request()))
            .await
            .ok()
            .unwrap();
        wait_for_record(&state, "manual-2").await;

        let response = create_transaction(State(state.clone()), Json(request()))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        state.engine.stop();
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let state = app_state(idle_client());

        let response = get_transaction(State(state.clone()), Path("missing".to_string()))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = mark_ready(State(state.clone()), Path("missing".to_string()))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.engine.stop();
    }

    #[tokio::test]
    async fn test_actions_are_logged() {
        let state = app_state(idle_client());
        let record = TransactionRecord::new(
            "logged-1",
            TxConfig::new(ContractContext::Colony, "setRootRole").not_ready(),
            None,
        );
        state
            .engine
            .dispatcher()
            .dispatch(Action::transaction_created(&record))
            .unwrap();
        wait_for_record(&state, "logged-1").await;

        let logged = loop {
            let logged = state.actions.snapshot(Some("logged-1"));
            if !logged.is_empty() {
                break logged;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(logged[0].action_type, ActionType::TransactionCreated);
        assert!(state.actions.snapshot(Some("other")).is_empty());
        state.engine.stop();
    }

    #[tokio::test]
    async fn test_normalize_sorts_events() {
        let state = app_state(idle_client());
        let request: NormalizeRequest = serde_json::from_value(json!({
            "direction": "desc",
            "events": [
                {
                    "id": "tx_event_3", "name": "DomainAdded(uint256)",
                    "args": "{\"domainId\":\"2\"}", "address": "0x1",
                    "transaction": { "block": { "number": "block_7" } }
                },
                {
                    "id": "tx_event_12", "name": "DomainAdded(uint256)",
                    "args": "{\"domainId\":\"3\"}", "address": "0x1",
                    "transaction": { "block": { "number": "block_7" } }
                }
            ]
        }))
        .unwrap();

        let Json(events) = normalize_events(State(state.clone()), Json(request)).await.ok().unwrap();
        let domains: Vec<Value> = events.iter().map(|e| e.values["domainId"].clone()).collect();
        assert_eq!(domains, vec![json!(3), json!(2)]);
        state.engine.stop();
    }

    #[tokio::test]
    async fn test_bad_event_args_rejected() {
        let state = app_state(idle_client());
        let request: NormalizeRequest = serde_json::from_value(json!({
            "events": [{ "name": "X", "args": "oops", "address": "0x1" }]
        }))
        .unwrap();
        let response = normalize_events(State(state.clone()), Json(request))
            .await
            .err()
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        state.engine.stop();
    }
}
