use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use mealplan_core::store::{
    Ballot, EventDetail, EventDraft, OptionDraft, PlanDetail, PlanDraft, PlanUpdate,
};
use mealplan_core::{Actor, CoreError, MissingVote, OpContext, PlanningCore};
use mealplan_db::models::{
    GroceryItemStatus, GroceryListItem, MealPlan, MealPlanOption, PlanStatus, PrepTask,
    PrepTaskStatus,
};
use mealplan_db::queries::grocery_items::GroceryItemUpdate;
use mealplan_db::queries::plans::PlanFilter;

use crate::runtime::Runtime;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(kind = err.code(), error = %err, "request failed");
        }
        Self {
            status,
            code: err.code(),
            message: err.message().to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// The acting member. Authentication happens in front of this server.
#[derive(Debug, Deserialize)]
pub struct ActingUser {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListPlansQuery {
    pub status: Option<PlanStatus>,
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<ListPlansQuery> for PlanFilter {
    fn from(q: ListPlansQuery) -> Self {
        let defaults = PlanFilter::default();
        Self {
            status: q.status,
            include_archived: q.include_archived,
            limit: q.limit.unwrap_or(defaults.limit).clamp(1, 500),
            offset: q.offset.unwrap_or(0).max(0),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    pub user_id: Uuid,
    pub notes: Option<String>,
    pub voting_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AddEventRequest {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub event: EventDraft,
}

#[derive(Debug, Deserialize)]
pub struct AddOptionRequest {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub option: OptionDraft,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    /// Absent for a system-initiated finalization.
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct BallotRequest {
    pub user_id: Uuid,
    pub ranking: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct GroceryItemRequest {
    pub user_id: Uuid,
    pub status: Option<GroceryItemStatus>,
    pub status_explanation: Option<String>,
    pub purchased_quantity: Option<Decimal>,
    pub purchased_measurement_unit_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub purchased_upc: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusRequest {
    pub user_id: Uuid,
    pub status: PrepTaskStatus,
    pub explanation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignTaskRequest {
    pub user_id: Uuid,
    pub assignee: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<PlanningCore>,
    pub request_timeout: Duration,
}

impl AppState {
    /// A fresh per-request context bounded by the request timeout.
    fn ctx(&self) -> OpContext {
        OpContext::background().with_timeout(self.request_timeout)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/plans", post(create_plan))
        .route("/api/households/{id}/plans", get(list_plans))
        .route("/api/plans/{id}", get(get_plan).patch(update_plan))
        .route("/api/plans/{id}/events", post(add_event))
        .route("/api/plans/{id}/finalize", post(finalize_plan))
        .route("/api/plans/{id}/archive", post(archive_plan))
        .route("/api/plans/{id}/missing-votes", get(missing_votes))
        .route("/api/plans/{id}/grocery-items", get(grocery_items))
        .route("/api/plans/{id}/prep-tasks", get(prep_tasks))
        .route("/api/events/{id}/options", post(add_option))
        .route("/api/events/{id}/ballots", get(event_ballots).put(submit_ballot))
        .route("/api/options/{id}/archive", post(archive_option))
        .route("/api/grocery-items/{id}", patch(update_grocery_item))
        .route("/api/prep-tasks/{id}/status", post(change_task_status))
        .route("/api/prep-tasks/{id}/assign", post(assign_task))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(runtime: Runtime, bind: &str, port: u16, request_timeout: Duration) -> Result<()> {
    let app = build_router(AppState {
        core: runtime.core.clone(),
        request_timeout,
    });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("mealplan serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    runtime.shutdown().await;
    served?;
    tracing::info!("mealplan serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(draft): Json<PlanDraft>,
) -> Result<(StatusCode, Json<PlanDetail>), AppError> {
    let plan = state.core.create_plan(&state.ctx(), draft).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn list_plans(
    State(state): State<AppState>,
    Path(household_id): Path<Uuid>,
    Query(query): Query<ListPlansQuery>,
) -> ApiResult<Vec<MealPlan>> {
    let filter = PlanFilter::from(query);
    Ok(Json(state.core.list_plans(household_id, &filter).await?))
}

async fn get_plan(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<PlanDetail> {
    Ok(Json(state.core.plan(id).await?))
}

async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePlanRequest>,
) -> ApiResult<MealPlan> {
    let update = PlanUpdate {
        notes: req.notes,
        voting_deadline: req.voting_deadline,
    };
    Ok(Json(
        state.core.update_plan(&state.ctx(), id, req.user_id, update).await?,
    ))
}

async fn add_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddEventRequest>,
) -> Result<(StatusCode, Json<EventDetail>), AppError> {
    let event = state
        .core
        .add_event(&state.ctx(), id, req.user_id, req.event)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn add_option(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddOptionRequest>,
) -> Result<(StatusCode, Json<MealPlanOption>), AppError> {
    let option = state
        .core
        .add_option(&state.ctx(), id, req.user_id, req.option)
        .await?;
    Ok((StatusCode::CREATED, Json(option)))
}

async fn archive_option(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActingUser>,
) -> Result<StatusCode, AppError> {
    state.core.archive_option(&state.ctx(), id, req.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn finalize_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FinalizeRequest>,
) -> ApiResult<MealPlan> {
    let actor = req.user_id.map_or(Actor::System, Actor::User);
    Ok(Json(
        state.core.finalize(&state.ctx(), id, actor, req.force).await?,
    ))
}

async fn archive_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActingUser>,
) -> ApiResult<MealPlan> {
    Ok(Json(state.core.archive_plan(&state.ctx(), id, req.user_id).await?))
}

async fn missing_votes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<MissingVote>> {
    Ok(Json(state.core.missing_votes(id).await?))
}

async fn submit_ballot(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Json(req): Json<BallotRequest>,
) -> ApiResult<Ballot> {
    Ok(Json(
        state
            .core
            .submit_vote(&state.ctx(), event_id, req.user_id, req.ranking)
            .await?,
    ))
}

async fn event_ballots(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Vec<Ballot>> {
    Ok(Json(state.core.event_ballots(event_id).await?))
}

async fn grocery_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<GroceryListItem>> {
    Ok(Json(state.core.grocery_list(id).await?))
}

async fn update_grocery_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<GroceryItemRequest>,
) -> ApiResult<GroceryListItem> {
    let update = GroceryItemUpdate {
        status: req.status,
        status_explanation: req.status_explanation.as_deref(),
        purchased_quantity: req.purchased_quantity,
        purchased_measurement_unit_id: req.purchased_measurement_unit_id,
        purchase_price: req.purchase_price,
        purchased_upc: req.purchased_upc.as_deref(),
    };
    Ok(Json(
        state
            .core
            .update_grocery_item(&state.ctx(), id, req.user_id, &update)
            .await?,
    ))
}

async fn prep_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<PrepTask>> {
    Ok(Json(state.core.prep_tasks(id).await?))
}

async fn change_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TaskStatusRequest>,
) -> ApiResult<PrepTask> {
    Ok(Json(
        state
            .core
            .change_task_status(
                &state.ctx(),
                id,
                req.user_id,
                req.status,
                req.explanation.as_deref(),
            )
            .await?,
    ))
}

async fn assign_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignTaskRequest>,
) -> ApiResult<PrepTask> {
    Ok(Json(
        state
            .core
            .assign_task(&state.ctx(), id, req.user_id, req.assignee)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use sqlx::PgPool;
    use tower::ServiceExt;
    use uuid::Uuid;

    use mealplan_core::bus::MemoryPublisher;
    use mealplan_core::catalog::PgCatalog;
    use mealplan_core::store::PgPlanStore;
    use mealplan_core::{CoreConfig, FixedClock, PlanningCore};
    use mealplan_test_utils::seed::{self, SeededHousehold};
    use mealplan_test_utils::{create_test_db, drop_test_db};

    use super::{AppState, build_router};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    struct TestApp {
        pool: PgPool,
        db_name: String,
        state: AppState,
        bus: Arc<MemoryPublisher>,
        household: SeededHousehold,
    }

    async fn test_app(extra_members: usize) -> TestApp {
        let (pool, db_name) = create_test_db().await;
        let household = seed::household(&pool, extra_members).await.unwrap();
        let bus = Arc::new(MemoryPublisher::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2030, 3, 4, 9, 0, 0).unwrap()));
        let core = PlanningCore::new(
            Arc::new(PgPlanStore::new(pool.clone())),
            bus.clone(),
            clock,
            Arc::new(PgCatalog::new(pool.clone())),
            CoreConfig::default(),
        );
        TestApp {
            pool,
            db_name,
            state: AppState {
                core: Arc::new(core),
                request_timeout: Duration::from_secs(10),
            },
            bus,
            household,
        }
    }

    impl TestApp {
        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> axum::response::Response {
            let app = build_router(self.state.clone());
            let builder = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            app.oneshot(request).await.unwrap()
        }

        fn plan_body(&self, meals: &[Uuid]) -> Value {
            json!({
                "household_id": self.household.id,
                "created_by_user_id": self.household.owner,
                "notes": "week ten",
                "voting_deadline": "2030-03-05T09:00:00Z",
                "events": [{
                    "meal_name": "dinner",
                    "starts_at": "2030-03-06T18:00:00Z",
                    "ends_at": "2030-03-06T19:00:00Z",
                    "options": meals.iter().map(|m| json!({ "meal_id": m })).collect::<Vec<_>>(),
                }],
            })
        }

        async fn teardown(self) {
            self.pool.close().await;
            drop_test_db(&self.db_name).await;
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn meals(pool: &PgPool, n: usize) -> Vec<Uuid> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(seed::bare_meal(pool, &format!("meal {i}")).await.unwrap());
        }
        out
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_health() {
        let app = test_app(0).await;

        let resp = app.send("GET", "/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "status": "ok" }));

        app.teardown().await;
    }

    #[tokio::test]
    async fn test_create_then_read_plan() {
        let app = test_app(0).await;
        let meals = meals(&app.pool, 2).await;

        let resp = app.send("POST", "/api/plans", Some(app.plan_body(&meals))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["status"], "awaiting_votes");
        assert_eq!(created["events"][0]["options"].as_array().unwrap().len(), 2);
        let plan_id = created["id"].as_str().unwrap().to_string();

        let resp = app.send("GET", &format!("/api/plans/{plan_id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["notes"], "week ten");

        let uri = format!("/api/households/{}/plans?status=awaiting_votes", app.household.id);
        let resp = app.send("GET", &uri, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], plan_id.as_str());

        assert_eq!(app.bus.count(mealplan_core::bus::topics::PLAN_CREATED), 1);
        app.teardown().await;
    }

    #[tokio::test]
    async fn test_invalid_draft_is_bad_request() {
        let app = test_app(0).await;

        let mut body = app.plan_body(&[]);
        body["events"] = json!([]);
        let resp = app.send("POST", "/api/plans", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "invalid");
        assert!(json["error"]["message"].as_str().is_some());

        app.teardown().await;
    }

    #[tokio::test]
    async fn test_unknown_plan_is_not_found() {
        let app = test_app(0).await;

        let resp = app.send("GET", &format!("/api/plans/{}", Uuid::new_v4()), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["code"], "not_found");

        app.teardown().await;
    }

    #[tokio::test]
    async fn test_vote_finalize_then_late_vote_conflicts() {
        let app = test_app(1).await;
        let meals = meals(&app.pool, 2).await;
        let owner = app.household.owner;
        let other = app.household.members[1];

        let created = body_json(app.send("POST", "/api/plans", Some(app.plan_body(&meals))).await).await;
        let plan_id = created["id"].as_str().unwrap().to_string();
        let event_id = created["events"][0]["id"].as_str().unwrap().to_string();
        let options: Vec<String> = created["events"][0]["options"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["id"].as_str().unwrap().to_string())
            .collect();

        let ballots_uri = format!("/api/events/{event_id}/ballots");
        let resp = app
            .send("PUT", &ballots_uri, Some(json!({ "user_id": owner, "ranking": [options[1], options[0]] })))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let missing = body_json(app.send("GET", &format!("/api/plans/{plan_id}/missing-votes"), None).await).await;
        assert_eq!(missing, json!([{ "event_id": event_id, "user_id": other }]));

        let resp = app
            .send("PUT", &ballots_uri, Some(json!({ "user_id": other, "ranking": [options[1]] })))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // The last ballot closed voting; an explicit finalize is a no-op.
        let plan = body_json(app.send("GET", &format!("/api/plans/{plan_id}"), None).await).await;
        assert_eq!(plan["status"], "finalized");

        let resp = app
            .send("POST", &format!("/api/plans/{plan_id}/finalize"), Some(json!({ "user_id": other })))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "finalized");

        let detail = body_json(app.send("GET", &format!("/api/plans/{plan_id}"), None).await).await;
        let winner = detail["events"][0]["options"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["chosen"] == "winner")
            .map(|o| o["id"].clone());
        assert_eq!(winner, Some(json!(options[1])));

        let resp = app
            .send("PUT", &ballots_uri, Some(json!({ "user_id": owner, "ranking": [options[0]] })))
            .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"]["code"], "conflict");

        let resp = app.send("GET", &ballots_uri, None).await;
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);

        app.teardown().await;
    }

    #[tokio::test]
    async fn test_archive_by_member_while_open() {
        let app = test_app(1).await;
        let meals = meals(&app.pool, 1).await;

        let created = body_json(app.send("POST", "/api/plans", Some(app.plan_body(&meals))).await).await;
        let plan_id = created["id"].as_str().unwrap().to_string();
        let uri = format!("/api/plans/{plan_id}/archive");

        let resp = app.send("POST", &uri, Some(json!({ "user_id": Uuid::new_v4() }))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .send("POST", &uri, Some(json!({ "user_id": app.household.members[1] })))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "archived");

        let resp = app.send("POST", &uri, Some(json!({ "user_id": app.household.owner }))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        app.teardown().await;
    }
}
