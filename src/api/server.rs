use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{ProjectionPayload, ProjectionRequest, request_from_payload};
use crate::core::{
    DrawdownRow, GoalSolveConfig, GoalSolveResult, GoalType, IncomeBreakdown, NiCategory,
    ProjectionSummary, Region, TaxRegistry, YearRow, income_breakdown, project_drawdown,
    project_retirement, solve_goal, summarize, total_shortfall,
};

type SharedRegistry = Arc<TaxRegistry>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    tax_year: u16,
    rows: Vec<YearRow>,
    summary: Option<ProjectionSummary>,
    drawdown_rows: Option<Vec<DrawdownRow>>,
    drawdown_shortfall: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TakeHomeQuery {
    salary: f64,
    #[serde(default)]
    scotland: bool,
    tax_year: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolvePayload {
    goal: GoalType,
    target_pot: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u32>,
    #[serde(flatten)]
    projection: ProjectionPayload,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(registry: TaxRegistry) -> Router {
    Router::new()
        .route("/api/project", post(project_handler))
        .route("/api/take-home", get(take_home_handler))
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(registry))
}

pub async fn run_http_server(port: u16, registry: TaxRegistry) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(registry);

    let listener = TcpListener::bind(addr).await?;
    info!("planwise HTTP API listening on http://{addr}");
    info!("Local access: http://127.0.0.1:{port}/api/project");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn project_handler(
    State(registry): State<SharedRegistry>,
    Json(payload): Json<ProjectionPayload>,
) -> Response {
    let request = match request_from_payload(payload, &registry) {
        Ok(request) => request,
        Err(msg) => return bad_request("project", &msg),
    };
    match build_project_response(&registry, &request) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => bad_request("project", &msg),
    }
}

fn build_project_response(
    registry: &TaxRegistry,
    request: &ProjectionRequest,
) -> Result<ProjectResponse, String> {
    let inputs = &request.inputs;
    let rows = project_retirement(registry, inputs).map_err(|e| e.to_string())?;
    let summary = summarize(&rows, &inputs.initial_balances);

    let (drawdown_rows, drawdown_shortfall) = match &request.drawdown {
        None => (None, None),
        Some(settings) => {
            let limits = registry.limits(inputs.tax_year).map_err(|e| e.to_string())?;
            let at_retirement = rows
                .last()
                .map(YearRow::balances)
                .unwrap_or(inputs.initial_balances);
            let drawdown = project_drawdown(registry, limits, inputs, &at_retirement, settings)
                .map_err(|e| e.to_string())?;
            let shortfall = total_shortfall(&drawdown);
            (Some(drawdown), Some(shortfall))
        }
    };

    Ok(ProjectResponse {
        tax_year: inputs.tax_year,
        rows,
        summary,
        drawdown_rows,
        drawdown_shortfall,
    })
}

async fn take_home_handler(
    State(registry): State<SharedRegistry>,
    Query(query): Query<TakeHomeQuery>,
) -> Response {
    match take_home(&registry, &query) {
        Ok(income) => json_response(StatusCode::OK, income),
        Err(msg) => bad_request("take-home", &msg),
    }
}

fn take_home(registry: &TaxRegistry, query: &TakeHomeQuery) -> Result<IncomeBreakdown, String> {
    let tax_year = query.tax_year.unwrap_or_else(|| registry.latest_year());
    income_breakdown(
        registry,
        query.salary,
        Region::from_scotland_flag(query.scotland),
        tax_year,
        NiCategory::A,
    )
    .map_err(|e| e.to_string())
}

async fn solve_handler(
    State(registry): State<SharedRegistry>,
    Json(payload): Json<SolvePayload>,
) -> Response {
    match solve(&registry, payload) {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(msg) => bad_request("solve", &msg),
    }
}

fn solve(registry: &TaxRegistry, payload: SolvePayload) -> Result<GoalSolveResult, String> {
    let goal_type = payload.goal;
    let target_pot = payload.target_pot.unwrap_or(0.0);
    let search_min = payload.search_min.unwrap_or(0.0);
    let search_max = payload.search_max.unwrap_or(match goal_type {
        GoalType::RequiredIsaContribution => 20_000.0,
        GoalType::MaxDrawdown => 200_000.0,
    });
    let tolerance = payload.tolerance.unwrap_or(1.0);
    let max_iterations = payload.max_iterations.unwrap_or(60);

    let request = request_from_payload(payload.projection, registry)?;
    let limits = *registry
        .limits(request.inputs.tax_year)
        .map_err(|e| e.to_string())?;
    let config = GoalSolveConfig {
        goal_type,
        target_pot,
        search_min,
        search_max,
        tolerance,
        max_iterations,
        drawdown: request.drawdown.unwrap_or_default(),
    };
    solve_goal(registry, limits, &request.inputs, config).map_err(|e| e.to_string())
}

fn bad_request(route: &str, msg: &str) -> Response {
    warn!(route, error = msg, "rejected request");
    error_response(StatusCode::BAD_REQUEST, msg)
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn shared() -> SharedRegistry {
        Arc::new(TaxRegistry::builtin().expect("tables"))
    }

    #[tokio::test]
    async fn project_returns_rows_and_summary() {
        let payload: ProjectionPayload = serde_json::from_str(
            r#"{"currentAge": 40, "retirementAge": 45, "salary": 50000, "drawdownWithdrawal": 10000, "drawdownEndAge": 50}"#,
        )
        .expect("payload");
        let response = project_handler(State(shared()), Json(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).map(|v| v.as_bytes()),
            Some(&b"no-store"[..])
        );

        let body = body_json(response).await;
        assert_eq!(body["taxYear"], 2025);
        assert_eq!(body["rows"].as_array().map(Vec::len), Some(5));
        assert_eq!(body["summary"]["finalAge"], 44);
        assert_eq!(body["drawdownRows"].as_array().map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn project_rejects_invalid_ages() {
        let payload: ProjectionPayload =
            serde_json::from_str(r#"{"currentAge": 50, "retirementAge": 40}"#).expect("payload");
        let response = project_handler(State(shared()), Json(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .is_some_and(|msg| msg.contains("--retirement-age"))
        );
    }

    #[tokio::test]
    async fn take_home_uses_regional_bands() {
        let query = |scotland| TakeHomeQuery {
            salary: 30_000.0,
            scotland,
            tax_year: Some(2025),
        };
        let uk = body_json(take_home_handler(State(shared()), Query(query(false))).await).await;
        let scot = body_json(take_home_handler(State(shared()), Query(query(true))).await).await;
        assert_ne!(uk["incomeTax"], scot["incomeTax"]);
        assert_eq!(uk["niDue"], scot["niDue"]);
    }

    #[tokio::test]
    async fn solve_reports_infeasible_isa_target() {
        let payload: SolvePayload = serde_json::from_str(
            r#"{"goal": "requiredIsaContribution", "targetPot": 50000000, "currentAge": 60, "retirementAge": 62}"#,
        )
        .expect("payload");
        let response = solve_handler(State(shared()), Json(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["feasible"], false);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let response = not_found_handler().await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Not found");
    }
}
