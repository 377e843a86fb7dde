use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get, post, put},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::ApiError;
use crate::appeals::{AppealQuery, AppealService};
use crate::arbitration::{Arbiter, Verdict};
use crate::auth::{auth_middleware, JwtHandler};
use crate::comments::{CommentPage, CommentQuery, CommentService};
use crate::credits::{BalanceSummary, CreditService, PaymentApplied, PaymentCompleted};
use crate::errors::{ArbitrationError, MarketError};
use crate::ledger::{
    Appeal, AppealStatus, ArbitrationRun, Comment, MarketListFilter, PositionStats,
    PositionSummary, StatusFilter,
};
use crate::middleware::request_logging;
use crate::models::{MarketView, Position, Principal, ResolutionDecision, Side};
use crate::settlement::{CancelOutcome, NewMarket, ResolveOutcome, SettlementEngine, StakeReceipt};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: SettlementEngine,
    pub credits: CreditService,
    pub appeals: AppealService,
    pub comments: CommentService,
    /// `None` when no model or search credentials are configured.
    pub arbiter: Option<Arc<Arbiter>>,
    pub jwt: Arc<JwtHandler>,
}

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/markets", post(create_market).get(list_markets))
        .route("/api/markets/:id", get(get_market))
        .route(
            "/api/markets/:id/comments",
            get(list_comments).post(post_comment),
        )
        .route("/api/comments/:id", delete(delete_comment))
        .route("/api/markets/:id/stakes", post(place_stake))
        .route("/api/markets/:id/resolve", post(resolve_market))
        .route("/api/markets/:id/cancel", post(cancel_market))
        .route("/api/markets/:id/refunds/retry", post(retry_refunds))
        .route("/api/markets/:id/arbitrate", post(arbitrate_market))
        .route("/api/user/balance", get(get_balance))
        .route("/api/user/bets", get(user_positions))
        .route("/api/admin/credits", post(admin_credits))
        .route("/api/payments/completed", post(payment_completed))
        .route("/api/appeals", post(create_appeal).get(list_appeals))
        .route("/api/appeals/:id", get(get_appeal))
        .route("/api/appeals/:id/resolve", put(resolve_appeal))
        .route_layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_market(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<NewMarket>,
) -> Result<(StatusCode, Json<MarketView>), ApiError> {
    let market = state.engine.create_market(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(market.view())))
}

/// Paged market browser, newest first unless `order=asc`.
async fn list_markets(
    State(state): State<AppState>,
    Query(query): Query<MarketListQuery>,
) -> Result<Json<MarketListResponse>, ApiError> {
    let status = parse_status(query.status.as_deref())?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_MARKET_PAGE).clamp(1, MAX_MARKET_PAGE);
    let filter = MarketListFilter {
        status,
        search: query.search,
        ascending: query.order.as_deref() == Some("asc"),
        limit,
        offset: (page - 1).saturating_mul(limit),
    };

    let (markets, total) = state
        .engine
        .ledger()
        .atomic(|tx| tx.list_markets(&filter))
        .await?;
    let total = total.max(0) as usize;
    Ok(Json(MarketListResponse {
        markets: markets.iter().map(|m| m.view()).collect(),
        pagination: PageInfo {
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        },
    }))
}

/// Market with its stakes, the recorded decision and any AI arbitration runs.
async fn get_market(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MarketDetail>, ApiError> {
    let detail = state
        .engine
        .ledger()
        .atomic(|tx| {
            let market = tx.require_market(id)?;
            Ok(MarketDetail {
                market: market.view(),
                positions: tx.list_positions(id)?,
                decision: tx.get_resolution_decision(id)?,
                arbitration_runs: tx.list_arbitration_runs(id)?,
            })
        })
        .await?;
    Ok(Json(detail))
}

async fn place_stake(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<StakeRequest>,
) -> Result<Json<StakeReceipt>, ApiError> {
    let receipt = state
        .engine
        .place_stake(&principal, id, req.side, req.amount)
        .await?;
    Ok(Json(receipt))
}

async fn resolve_market(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveOutcome>, ApiError> {
    let reasoning = req
        .reasoning
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    let outcome = state
        .engine
        .resolve_market(&principal, id, req.outcome, reasoning)
        .await?;
    Ok(Json(outcome))
}

async fn cancel_market(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelOutcome>, ApiError> {
    Ok(Json(state.engine.cancel_market(&principal, id).await?))
}

async fn retry_refunds(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelOutcome>, ApiError> {
    Ok(Json(state.engine.retry_refunds(&principal, id).await?))
}

/// Run the AI arbiter and settle the market as the system arbitrator.
/// An `UNRESOLVABLE` verdict never settles.
async fn arbitrate_market(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<ArbitrationResponse>, ApiError> {
    let arbiter = state
        .arbiter
        .clone()
        .ok_or(ArbitrationError::NotConfigured)?;
    let market = state.engine.get_market(id).await?;

    info!(market_id = %id, requested_by = %principal.user_id, "arbitration requested");

    let verdict = arbiter.arbitrate(&market).await?;
    let resolution = state
        .engine
        .resolve_market(
            &Principal::system_ai(),
            id,
            verdict.outcome,
            Some(verdict.reasoning.clone()),
        )
        .await?;

    Ok(Json(ArbitrationResponse {
        verdict,
        resolution,
    }))
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<BalanceSummary>, ApiError> {
    Ok(Json(state.credits.balance_summary(&principal).await?))
}

/// The caller's stakes folded per market and side, with win/loss totals.
async fn user_positions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PositionHistoryQuery>,
) -> Result<Json<PositionHistoryResponse>, ApiError> {
    let status = parse_status(query.status.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_POSITION_PAGE).clamp(1, MAX_POSITION_PAGE);
    let offset = query.offset.unwrap_or(0);

    let summaries = state
        .engine
        .ledger()
        .atomic(|tx| tx.list_user_positions(principal.user_id, status))
        .await?;
    let stats = PositionStats::from_summaries(&summaries);
    let total = summaries.len();
    let positions: Vec<PositionSummary> =
        summaries.into_iter().skip(offset).take(limit).collect();

    Ok(Json(PositionHistoryResponse {
        positions,
        pagination: OffsetPageInfo {
            total,
            limit,
            offset,
            has_more: total > offset.saturating_add(limit),
        },
        stats,
    }))
}

async fn admin_credits(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AdminCreditRequest>,
) -> Result<Json<AdminCreditResponse>, ApiError> {
    let new_balance = state
        .credits
        .admin_adjust(&principal, req.user_id, req.amount, req.description)
        .await?;
    Ok(Json(AdminCreditResponse {
        user_id: req.user_id,
        credits_added: req.amount,
        new_balance,
    }))
}

/// Relay for payment events the processor has already verified.
async fn payment_completed(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(event): Json<PaymentCompleted>,
) -> Result<Json<PaymentApplied>, ApiError> {
    if !principal.is_admin() {
        return Err(MarketError::AdminRequired.into());
    }
    Ok(Json(state.credits.apply_payment(event).await?))
}

async fn create_appeal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AppealRequest>,
) -> Result<(StatusCode, Json<Appeal>), ApiError> {
    let appeal = state
        .appeals
        .create_appeal(&principal, req.market_id, &req.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(appeal)))
}

async fn list_appeals(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<AppealQuery>,
) -> Result<Json<AppealsResponse>, ApiError> {
    let appeals = state.appeals.list_appeals(&principal, &query).await?;
    Ok(Json(AppealsResponse {
        count: appeals.len(),
        appeals,
    }))
}

async fn get_appeal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Appeal>, ApiError> {
    Ok(Json(state.appeals.get_appeal(&principal, id).await?))
}

async fn resolve_appeal(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<AppealDecisionRequest>,
) -> Result<Json<Appeal>, ApiError> {
    let status = AppealStatus::from_str(&req.status)
        .ok_or_else(|| MarketError::validation("status", "status must be approved or rejected"))?;
    let appeal = state
        .appeals
        .resolve_appeal(&principal, id, status, &req.admin_notes)
        .await?;
    Ok(Json(appeal))
}

async fn list_comments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<CommentQuery>,
) -> Result<Json<CommentPage>, ApiError> {
    Ok(Json(state.comments.list_comments(id, &query).await?))
}

async fn post_comment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<CommentRequest>,
) -> Result<(StatusCode, Json<Comment>), ApiError> {
    let comment = state
        .comments
        .post_comment(&principal, id, &req.content, req.parent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn delete_comment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.comments.delete_comment(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_status(raw: Option<&str>) -> Result<StatusFilter, MarketError> {
    StatusFilter::from_str(raw.unwrap_or("all")).ok_or_else(|| {
        MarketError::validation("status", "status must be all, active, resolved or cancelled")
    })
}

// ===== Request/Response Types =====

const DEFAULT_MARKET_PAGE: usize = 10;
const MAX_MARKET_PAGE: usize = 50;
const DEFAULT_POSITION_PAGE: usize = 50;
const MAX_POSITION_PAGE: usize = 100;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Deserialize)]
struct MarketListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    order: Option<String>,
}

#[derive(Serialize)]
struct PageInfo {
    total: usize,
    page: usize,
    limit: usize,
    total_pages: usize,
}

#[derive(Serialize)]
struct MarketListResponse {
    markets: Vec<MarketView>,
    pagination: PageInfo,
}

#[derive(Deserialize)]
struct PositionHistoryQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Serialize)]
struct OffsetPageInfo {
    total: usize,
    limit: usize,
    offset: usize,
    has_more: bool,
}

#[derive(Serialize)]
struct PositionHistoryResponse {
    positions: Vec<PositionSummary>,
    pagination: OffsetPageInfo,
    stats: PositionStats,
}

#[derive(Serialize)]
struct MarketDetail {
    market: MarketView,
    positions: Vec<Position>,
    decision: Option<ResolutionDecision>,
    arbitration_runs: Vec<ArbitrationRun>,
}

#[derive(Deserialize)]
struct StakeRequest {
    side: Side,
    amount: f64,
}

#[derive(Deserialize)]
struct ResolveRequest {
    outcome: Side,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Serialize)]
struct ArbitrationResponse {
    verdict: Verdict,
    resolution: ResolveOutcome,
}

#[derive(Deserialize)]
struct AdminCreditRequest {
    user_id: Uuid,
    amount: f64,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct AdminCreditResponse {
    user_id: Uuid,
    credits_added: f64,
    new_balance: f64,
}

#[derive(Deserialize)]
struct AppealRequest {
    market_id: Uuid,
    reason: String,
}

#[derive(Serialize)]
struct AppealsResponse {
    count: usize,
    appeals: Vec<Appeal>,
}

#[derive(Deserialize)]
struct AppealDecisionRequest {
    status: String,
    admin_notes: String,
}

#[derive(Deserialize)]
struct CommentRequest {
    content: String,
    #[serde(default)]
    parent_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::{
        ArbitrationConfig, ChatMessage, ModelTurn, ReasoningService, SearchResult, ToolSpec,
        WebSearch,
    };
    use crate::clock::{Clock, ManualClock};
    use crate::ledger::LedgerDb;
    use crate::models::UserRole;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct FixedVerdictModel(&'static str);

    #[async_trait]
    impl ReasoningService for FixedVerdictModel {
        async fn converse(
            &self,
            _system: &str,
            _history: &[ChatMessage],
            _tools: &[ToolSpec],
            _max_tokens: u32,
        ) -> anyhow::Result<ModelTurn> {
            Ok(ModelTurn {
                content: Some(self.0.to_string()),
                tool_calls: vec![],
            })
        }
    }

    struct NoSearch;

    #[async_trait]
    impl WebSearch for NoSearch {
        async fn search(&self, _query: &str) -> anyhow::Result<Vec<SearchResult>> {
            Ok(vec![])
        }
    }

    struct Harness {
        app: Router,
        clock: ManualClock,
        jwt: Arc<JwtHandler>,
        credits: CreditService,
    }

    impl Harness {
        fn new(model_answer: Option<&'static str>) -> Self {
            let ledger = LedgerDb::open_in_memory().unwrap();
            let clock = ManualClock::new(Utc::now());
            let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
            let jwt = Arc::new(JwtHandler::new("router-test-secret".to_string()));
            let arbiter = model_answer.map(|answer| {
                Arc::new(
                    Arbiter::new(
                        Arc::new(FixedVerdictModel(answer)),
                        Arc::new(NoSearch),
                        shared_clock.clone(),
                        ArbitrationConfig::default(),
                    )
                    .with_ledger(ledger.clone()),
                )
            });
            let credits = CreditService::new(ledger.clone());
            let state = AppState {
                engine: SettlementEngine::new(ledger.clone(), shared_clock),
                credits: credits.clone(),
                appeals: AppealService::new(ledger.clone()),
                comments: CommentService::new(ledger),
                arbiter,
                jwt: jwt.clone(),
            };
            Self {
                app: create_router(state),
                clock,
                jwt,
                credits,
            }
        }

        fn token(&self, principal: &Principal) -> String {
            self.jwt.generate_token(principal).unwrap().0
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            principal: Option<&Principal>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(p) = principal {
                req = req.header("Authorization", format!("Bearer {}", self.token(p)));
            }
            let req = match body {
                Some(b) => req
                    .header("Content-Type", "application/json")
                    .body(Body::from(b.to_string()))
                    .unwrap(),
                None => req.body(Body::empty()).unwrap(),
            };
            let res = self.app.clone().oneshot(req).await.unwrap();
            let status = res.status();
            let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }

        async fn fund(&self, principal: &Principal, amount: f64) {
            let admin = Principal {
                user_id: Uuid::new_v4(),
                email: None,
                role: UserRole::Admin,
            };
            // Creates the account row on first sight
            self.call("GET", "/api/user/balance", Some(principal), None)
                .await;
            self.credits
                .admin_adjust(&admin, principal.user_id, amount, None)
                .await
                .unwrap();
        }

        async fn create_market(&self, creator: &Principal, arbitrator_type: &str) -> Uuid {
            let deadline = self.clock.now() + Duration::hours(1);
            let (status, body) = self
                .call(
                    "POST",
                    "/api/markets",
                    Some(creator),
                    Some(json!({
                        "title": "Will the launch happen this week?",
                        "deadline": deadline,
                        "arbitrator_type": arbitrator_type,
                        "minimum_stake": 1.0,
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
            Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_health_is_public_and_api_is_not() {
        let h = Harness::new(None);
        let (status, body) = h.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = h.call("GET", "/api/user/balance", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_stake_resolve_and_error_codes() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let bettor = Principal::user(Uuid::new_v4(), None);
        h.fund(&creator, 100.0).await;
        h.fund(&bettor, 100.0).await;

        let id = h.create_market(&creator, "creator").await;
        let stakes = format!("/api/markets/{id}/stakes");

        let (status, _) = h
            .call("POST", &stakes, Some(&creator), Some(json!({"side": "yes", "amount": 40.0})))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = h
            .call("POST", &stakes, Some(&bettor), Some(json!({"side": "no", "amount": 500.0})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INSUFFICIENT_BALANCE");
        h.call("POST", &stakes, Some(&bettor), Some(json!({"side": "no", "amount": 60.0})))
            .await;

        let resolve = format!("/api/markets/{id}/resolve");
        let (status, body) = h
            .call("POST", &resolve, Some(&creator), Some(json!({"outcome": "yes"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "DEADLINE_NOT_PASSED");

        h.clock.advance(Duration::hours(2));

        let (status, body) = h
            .call("POST", &resolve, Some(&bettor), Some(json!({"outcome": "no"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "UNAUTHORIZED_ARBITRATOR");

        let (status, body) = h
            .call("POST", &resolve, Some(&creator), Some(json!({"outcome": "yes"})))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["winners_count"], 1);
        assert!((body["total_payout"].as_f64().unwrap() - 100.0).abs() < 1e-9);

        let (status, body) = h
            .call("POST", &resolve, Some(&creator), Some(json!({"outcome": "no"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_RESOLVED");

        let (status, body) = h
            .call("GET", &format!("/api/markets/{id}"), Some(&bettor), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["market"]["status"], "resolved");
        assert_eq!(body["market"]["outcome"], "yes");
        assert_eq!(body["positions"].as_array().unwrap().len(), 2);
        assert_eq!(body["decision"]["outcome"], "yes");

        let (_, body) = h.call("GET", "/api/user/balance", Some(&creator), None).await;
        assert!((body["balance"].as_f64().unwrap() - 160.0).abs() < 1e-9);
        assert_eq!(body["audit"]["consistent"], true);
    }

    #[tokio::test]
    async fn test_unknown_market_is_404() {
        let h = Harness::new(None);
        let user = Principal::user(Uuid::new_v4(), None);
        let (status, body) = h
            .call("GET", &format!("/api/markets/{}", Uuid::new_v4()), Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "MARKET_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_arbitrate_settles_ai_market() {
        let h = Harness::new(Some(
            r#"{"resolution_status": "RESOLVED_FALSE", "reasoning": {"analysis": "a", "evidence": "e", "conclusion": "did not happen"}}"#,
        ));
        let creator = Principal::user(Uuid::new_v4(), None);
        let bettor = Principal::user(Uuid::new_v4(), None);
        h.fund(&creator, 50.0).await;
        h.fund(&bettor, 50.0).await;

        let id = h.create_market(&creator, "ai").await;
        h.call(
            "POST",
            &format!("/api/markets/{id}/stakes"),
            Some(&creator),
            Some(json!({"side": "yes", "amount": 20.0})),
        )
        .await;
        h.call(
            "POST",
            &format!("/api/markets/{id}/stakes"),
            Some(&bettor),
            Some(json!({"side": "no", "amount": 30.0})),
        )
        .await;

        // Humans cannot settle AI markets directly
        h.clock.advance(Duration::hours(2));
        let (status, body) = h
            .call(
                "POST",
                &format!("/api/markets/{id}/resolve"),
                Some(&creator),
                Some(json!({"outcome": "yes"})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "AI_BET_MANUAL_RESOLVE");

        let (status, body) = h
            .call("POST", &format!("/api/markets/{id}/arbitrate"), Some(&bettor), None)
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["verdict"]["outcome"], "no");
        assert_eq!(body["resolution"]["winners_count"], 1);

        let (_, detail) = h
            .call("GET", &format!("/api/markets/{id}"), Some(&bettor), None)
            .await;
        assert_eq!(detail["decision"]["arbitrator_id"], Uuid::nil().to_string());
        assert_eq!(detail["arbitration_runs"].as_array().unwrap().len(), 1);

        let (_, balance) = h.call("GET", "/api/user/balance", Some(&bettor), None).await;
        assert!((balance["balance"].as_f64().unwrap() - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unresolvable_is_422_and_leaves_market_open() {
        let h = Harness::new(Some(r#"{"resolution_status": "UNRESOLVABLE", "reasoning": {"conclusion": "no reliable reporting"}}"#));
        let creator = Principal::user(Uuid::new_v4(), None);
        let id = h.create_market(&creator, "ai").await;
        h.clock.advance(Duration::hours(2));

        let (status, body) = h
            .call("POST", &format!("/api/markets/{id}/arbitrate"), Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "UNRESOLVABLE");
        assert_eq!(body["retryable"], false);

        let (_, detail) = h
            .call("GET", &format!("/api/markets/{id}"), Some(&creator), None)
            .await;
        assert_eq!(detail["market"]["status"], "active");
        assert!(detail["decision"].is_null());
    }

    #[tokio::test]
    async fn test_arbitrate_without_ai_stack_is_503() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let id = h.create_market(&creator, "ai").await;
        let (status, body) = h
            .call("POST", &format!("/api/markets/{id}/arbitrate"), Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "AI_NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn test_payment_relay_requires_admin_and_is_idempotent() {
        let h = Harness::new(None);
        let user = Principal::user(Uuid::new_v4(), None);
        let relay = Principal {
            user_id: Uuid::new_v4(),
            email: None,
            role: UserRole::System,
        };
        let event = json!({
            "checkout_session_id": "cs_test_123",
            "user_id": user.user_id,
            "package_id": "credits_500",
            "credits": 500.0,
            "amount_cents": 4000,
        });

        let (status, body) = h
            .call("POST", "/api/payments/completed", Some(&user), Some(event.clone()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "ADMIN_REQUIRED");

        let (status, body) = h
            .call("POST", "/api/payments/completed", Some(&relay), Some(event.clone()))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["already_processed"], false);

        let (_, body) = h
            .call("POST", "/api/payments/completed", Some(&relay), Some(event))
            .await;
        assert_eq!(body["already_processed"], true);
        assert!((body["new_balance"].as_f64().unwrap() - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_appeal_flow_over_http() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let admin = Principal {
            user_id: Uuid::new_v4(),
            email: None,
            role: UserRole::Admin,
        };
        h.fund(&creator, 10.0).await;
        let id = h.create_market(&creator, "creator").await;
        h.call(
            "POST",
            &format!("/api/markets/{id}/stakes"),
            Some(&creator),
            Some(json!({"side": "yes", "amount": 10.0})),
        )
        .await;

        let (status, body) = h
            .call(
                "POST",
                "/api/appeals",
                Some(&creator),
                Some(json!({"market_id": id, "reason": "The outcome was wrong"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BET_NOT_RESOLVED");

        h.clock.advance(Duration::hours(2));
        h.call(
            "POST",
            &format!("/api/markets/{id}/resolve"),
            Some(&creator),
            Some(json!({"outcome": "no"})),
        )
        .await;

        let (status, appeal) = h
            .call(
                "POST",
                "/api/appeals",
                Some(&creator),
                Some(json!({"market_id": id, "reason": "The outcome was wrong"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{appeal}");
        let appeal_id = appeal["id"].as_str().unwrap().to_string();

        let (_, listed) = h
            .call("GET", "/api/appeals?status=pending", Some(&admin), None)
            .await;
        assert_eq!(listed["count"], 1);

        let (status, body) = h
            .call(
                "PUT",
                &format!("/api/appeals/{appeal_id}/resolve"),
                Some(&admin),
                Some(json!({"status": "rejected", "admin_notes": "Outcome matches the evidence"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "rejected");
    }

    #[tokio::test]
    async fn test_market_listing_filters_and_paginates() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.create_market(&creator, "creator").await);
        }
        h.call("POST", &format!("/api/markets/{}/cancel", ids[0]), Some(&creator), None)
            .await;

        let (status, body) = h
            .call("GET", "/api/markets?limit=2&page=1", Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["markets"].as_array().unwrap().len(), 2);
        assert_eq!(body["pagination"]["total"], 3);
        assert_eq!(body["pagination"]["total_pages"], 2);

        let (_, body) = h
            .call("GET", "/api/markets?limit=2&page=2", Some(&creator), None)
            .await;
        assert_eq!(body["markets"].as_array().unwrap().len(), 1);

        let (_, body) = h
            .call("GET", "/api/markets?status=cancelled", Some(&creator), None)
            .await;
        assert_eq!(body["pagination"]["total"], 1);
        assert_eq!(body["markets"][0]["id"], ids[0].to_string());

        let (_, body) = h
            .call("GET", "/api/markets?status=active&search=LAUNCH", Some(&creator), None)
            .await;
        assert_eq!(body["pagination"]["total"], 2);

        let (_, body) = h
            .call("GET", "/api/markets?search=nothing%20like%20this", Some(&creator), None)
            .await;
        assert_eq!(body["pagination"]["total"], 0);
        assert_eq!(body["pagination"]["total_pages"], 0);

        let (status, body) = h
            .call("GET", "/api/markets?status=open", Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_user_bets_history_and_stats() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let bettor = Principal::user(Uuid::new_v4(), None);
        h.fund(&creator, 100.0).await;
        h.fund(&bettor, 100.0).await;

        let settled = h.create_market(&creator, "creator").await;
        let open = h.create_market(&creator, "creator").await;
        for (market, side, amount) in [
            (settled, "yes", 10.0),
            (settled, "yes", 5.0),
            (open, "no", 20.0),
        ] {
            let (status, body) = h
                .call(
                    "POST",
                    &format!("/api/markets/{market}/stakes"),
                    Some(&bettor),
                    Some(json!({"side": side, "amount": amount})),
                )
                .await;
            assert_eq!(status, StatusCode::OK, "{body}");
        }
        h.call(
            "POST",
            &format!("/api/markets/{settled}/stakes"),
            Some(&creator),
            Some(json!({"side": "no", "amount": 30.0})),
        )
        .await;

        h.clock.advance(Duration::hours(2));
        let (status, _) = h
            .call(
                "POST",
                &format!("/api/markets/{settled}/resolve"),
                Some(&creator),
                Some(json!({"outcome": "yes"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = h.call("GET", "/api/user/bets", Some(&bettor), None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let positions = body["positions"].as_array().unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(body["stats"]["total_positions"], 2);
        assert_eq!(body["stats"]["total_stakes"], 3);
        assert_eq!(body["stats"]["won_positions"], 1);
        assert_eq!(body["stats"]["win_rate"], 100);
        assert!((body["stats"]["total_wagered"].as_f64().unwrap() - 35.0).abs() < 1e-9);

        let won = positions
            .iter()
            .find(|p| p["market"]["id"] == settled.to_string())
            .unwrap();
        assert_eq!(won["stake_count"], 2);
        assert_eq!(won["won"], true);

        let (_, body) = h
            .call("GET", "/api/user/bets?status=active&limit=1", Some(&bettor), None)
            .await;
        assert_eq!(body["positions"].as_array().unwrap().len(), 1);
        assert_eq!(body["positions"][0]["market"]["id"], open.to_string());
        assert_eq!(body["pagination"]["has_more"], false);

        let (_, body) = h
            .call("GET", "/api/user/bets?limit=1", Some(&bettor), None)
            .await;
        assert_eq!(body["pagination"]["total"], 2);
        assert_eq!(body["pagination"]["has_more"], true);

        // Another user's history is separate
        let (_, body) = h.call("GET", "/api/user/bets", Some(&creator), None).await;
        assert_eq!(body["stats"]["total_positions"], 1);
        assert_eq!(body["stats"]["won_positions"], 0);
    }

    #[tokio::test]
    async fn test_single_appeal_lookup() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let stranger = Principal::user(Uuid::new_v4(), None);
        let admin = Principal {
            user_id: Uuid::new_v4(),
            email: None,
            role: UserRole::Admin,
        };
        h.fund(&creator, 10.0).await;
        let id = h.create_market(&creator, "creator").await;
        h.call(
            "POST",
            &format!("/api/markets/{id}/stakes"),
            Some(&creator),
            Some(json!({"side": "yes", "amount": 10.0})),
        )
        .await;
        h.clock.advance(Duration::hours(2));
        h.call(
            "POST",
            &format!("/api/markets/{id}/resolve"),
            Some(&creator),
            Some(json!({"outcome": "no"})),
        )
        .await;
        let (_, appeal) = h
            .call(
                "POST",
                "/api/appeals",
                Some(&creator),
                Some(json!({"market_id": id, "reason": "The outcome was wrong"})),
            )
            .await;
        let uri = format!("/api/appeals/{}", appeal["id"].as_str().unwrap());

        let (status, body) = h.call("GET", &uri, Some(&creator), None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["reason"], "The outcome was wrong");
        assert_eq!(body["status"], "pending");

        let (status, _) = h.call("GET", &uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = h.call("GET", &uri, Some(&stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "APPEAL_FORBIDDEN");

        let (status, body) = h
            .call("GET", &format!("/api/appeals/{}", Uuid::new_v4()), Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "APPEAL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_comment_thread_over_http() {
        let h = Harness::new(None);
        let creator = Principal::user(Uuid::new_v4(), None);
        let reader = Principal::user(Uuid::new_v4(), None);
        let id = h.create_market(&creator, "creator").await;
        let comments = format!("/api/markets/{id}/comments");

        let (status, top) = h
            .call("POST", &comments, Some(&creator), Some(json!({"content": "Launch window opens Friday"})))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{top}");
        let top_id = top["id"].as_str().unwrap().to_string();

        let (status, reply) = h
            .call(
                "POST",
                &comments,
                Some(&reader),
                Some(json!({"content": "Weather looks bad", "parent_id": top_id})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{reply}");

        let (_, page) = h.call("GET", &comments, Some(&reader), None).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["comments"][0]["reply_count"], 1);

        let (_, replies) = h
            .call("GET", &format!("{comments}?parent_id={top_id}"), Some(&reader), None)
            .await;
        assert_eq!(replies["comments"][0]["content"], "Weather looks bad");

        let (status, body) = h
            .call("DELETE", &format!("/api/comments/{top_id}"), Some(&reader), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "NOT_OWNER");

        let (status, _) = h
            .call("DELETE", &format!("/api/comments/{top_id}"), Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = h
            .call("DELETE", &format!("/api/comments/{top_id}"), Some(&creator), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "ALREADY_DELETED");

        let (_, page) = h.call("GET", &comments, Some(&reader), None).await;
        assert_eq!(page["total"], 0);

        let (status, body) = h
            .call("POST", &comments, Some(&reader), Some(json!({"content": ""})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }
}
