//! HTTP surface for the admin-facing operations.
//!
//! Routes:
//! - POST /api/members/sync - reconcile the given member ids
//! - POST /api/members/sync/cancel - cancel the in-flight run
//! - GET  /api/members/sync/status - counts, running and last run
//! - GET  /api/crm/test-connection?listId=N - discover and store the field mapping
//! - GET  /api/crm/field-mapping?listId=N - the stored field mapping
//! - GET  /api/crm/companies - companies of list members
//! - GET  /health
//!
//! Every failure body is an `ErrorPayload` with `success: false`.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::commands::{self, SyncRunReport};
use crate::crm::client::CrmError;
use crate::error::{ErrorPayload, SyncError};
use crate::state::AppState;
use crate::sync::cancel::CancellationToken;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/members/sync", post(trigger_sync))
        .route("/api/members/sync/cancel", post(cancel_sync))
        .route("/api/members/sync/status", get(sync_status))
        .route("/api/crm/test-connection", get(test_connection))
        .route("/api/crm/field-mapping", get(field_mapping))
        .route("/api/crm/companies", get(member_companies))
        .with_state(state)
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
            SyncError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Crm(CrmError::NoApiKey | CrmError::InvalidBaseUrl(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SyncError::Page { .. } | SyncError::List { .. } | SyncError::Crm(_) => {
                if self.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            SyncError::Configuration(_)
            | SyncError::Member { .. }
            | SyncError::Database(_)
            | SyncError::DatabaseUnavailable
            | SyncError::DatabaseTask(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("Request failed ({}): {}", status, self);
        } else {
            log::warn!("Request rejected ({}): {}", status, self);
        }

        (status, Json(ErrorPayload::from(&self))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    member_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    list_id: Option<u64>,
}

/// POST /api/members/sync
///
/// The run executes as its own task. If this request goes away before the
/// run finishes, the run is cancelled rather than left running unobserved.
async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return SyncError::InvalidRequest(rejection.body_text()).into_response(),
    };

    let cancel = CancellationToken::new();
    let on_disconnect = cancel.clone().drop_guard();

    let task_state = Arc::clone(&state);
    let task_cancel = cancel.clone();
    let joined = tokio::spawn(async move {
        commands::run_member_sync(&task_state, request.member_ids, task_cancel).await
    })
    .await;
    on_disconnect.disarm();

    match joined {
        Ok(Ok(report)) => report_response(report),
        Ok(Err(e)) => e.into_response(),
        Err(e) => {
            log::error!("Sync task ended abnormally: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "Sync task ended abnormally" })),
            )
                .into_response()
        }
    }
}

/// Shape a finished run. Failed members or a cancelled run are not a success.
fn report_response(report: SyncRunReport) -> Response {
    if report.success() {
        return (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "runId": report.run_id,
                "summary": report.summary,
            })),
        )
            .into_response();
    }

    let (status, error) = if report.cancelled {
        (StatusCode::SERVICE_UNAVAILABLE, SyncError::Cancelled.to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "{} member(s) failed to sync",
                report.summary.failures.len()
            ),
        )
    };

    (
        status,
        Json(json!({
            "success": false,
            "error": error,
            "runId": report.run_id,
            "cancelled": report.cancelled,
            "summary": report.summary,
        })),
    )
        .into_response()
}

/// POST /api/members/sync/cancel
async fn cancel_sync(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let run_id = commands::cancel_member_sync(&state);
    Json(json!({
        "success": true,
        "cancelled": run_id.is_some(),
        "runId": run_id,
    }))
}

/// GET /api/members/sync/status
async fn sync_status(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, SyncError> {
    let status = commands::get_sync_status(&state).await?;
    Ok(Json(json!({ "success": true, "data": status })))
}

/// GET /api/crm/test-connection
async fn test_connection(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<commands::ConnectionTestResult>, SyncError> {
    let Query(query) = query.map_err(|e| SyncError::InvalidRequest(e.body_text()))?;
    let result = commands::test_crm_connection(&state, query.list_id).await?;
    Ok(Json(result))
}

/// GET /api/crm/field-mapping
async fn field_mapping(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, SyncError> {
    let Query(query) = query.map_err(|e| SyncError::InvalidRequest(e.body_text()))?;
    let mapping = commands::get_field_mapping(&state, query.list_id).await?;
    Ok(Json(json!({ "success": true, "data": mapping })))
}

/// GET /api/crm/companies
async fn member_companies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, SyncError> {
    let cancel = CancellationToken::new();
    let _on_disconnect = cancel.clone().drop_guard();
    let companies = commands::list_member_companies(&state, &cancel).await?;
    Ok(Json(json!({ "success": true, "data": companies })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LocalProfile, SyncRunStatus};
    use crate::state::test_support::test_state;
    use std::time::Duration;
    use crate::sync::reconcile::{MemberFailure, SyncSummary};
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state(None, None, "http://unused.invalid"));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sync_without_api_key_fails_with_payload() {
        let server = MockServer::start().await;
        let app = router(test_state(None, Some(7), &server.uri()));

        let response = app
            .oneshot(post_json("/api/members/sync", json!({ "memberIds": ["42"] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["errorType"], "configuration");
        assert!(body["error"].as_str().unwrap().contains("API key"));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_sync_with_malformed_body_is_bad_request() {
        let app = router(test_state(Some("key"), Some(7), "http://unused.invalid"));
        let response = app
            .oneshot(post_json("/api/members/sync", json!({ "ids": "42" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_sync_success_returns_summary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/v1/lists/7/contacts/all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "contacts": [
                    { "vid": 7, "properties": { "firstname": { "value": "Lee" } } }
                ],
                "has-more": false
            })))
            .mount(&server)
            .await;
        let app = router(test_state(Some("key"), Some(7), &server.uri()));

        let response = app
            .oneshot(post_json("/api/members/sync", json!({ "memberIds": ["7", "42"] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["summary"]["updated"], 1);
        assert_eq!(body["summary"]["deactivated"], 0);
        assert_eq!(body["summary"]["skipped"], 1);
    }

    #[tokio::test]
    async fn test_sync_upstream_failure_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/v1/lists/7/contacts/all"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let app = router(test_state(Some("key"), Some(7), &server.uri()));

        let response = app
            .oneshot(post_json("/api/members/sync", json!({ "memberIds": ["7"] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["canRetry"], true);
    }

    #[tokio::test]
    async fn test_overlapping_sync_is_conflict() {
        let state = test_state(Some("key"), Some(7), "http://unused.invalid");
        let _held = state.begin_run(&CancellationToken::new()).expect("slot");
        let app = router(state.clone());

        let response = app
            .oneshot(post_json("/api/members/sync", json!({ "memberIds": ["7"] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["errorType"], "conflict");
    }

    #[tokio::test]
    async fn test_cancel_endpoint_cancels_active_run() {
        let state = test_state(Some("key"), Some(7), "http://unused.invalid");
        let token = CancellationToken::new();
        let held = state.begin_run(&token).expect("slot");
        let app = router(state.clone());

        let response = app
            .oneshot(post_json("/api/members/sync/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], true);
        assert_eq!(body["runId"], held.run_id());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_sync_request_cancels_and_records_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/v1/lists/7/contacts/all"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "contacts": [], "has-more": false }))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        let state = test_state(Some("key"), Some(7), &server.uri());
        state
            .with_db(|db| Ok(db.upsert_member(&LocalProfile::new("42"))?))
            .expect("seed");

        let request = router(state.clone())
            .oneshot(post_json("/api/members/sync", json!({ "memberIds": ["42"] })));
        let dropped = tokio::time::timeout(Duration::from_millis(200), request).await;
        assert!(dropped.is_err(), "the walk is still waiting on the CRM");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.active_run().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "run kept going");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let runs = state.with_db(|db| Ok(db.recent_sync_runs(1)?)).expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, SyncRunStatus::Cancelled);
        let member = state
            .with_db(|db| Ok(db.get_member("42")?))
            .expect("query")
            .expect("row");
        assert!(member.active, "a dropped request changes no member");
    }

    #[test]
    fn test_report_with_failures_is_not_success() {
        let report = SyncRunReport {
            run_id: "r1".to_string(),
            list_id: 7,
            status: SyncRunStatus::CompletedWithFailures,
            cancelled: false,
            summary: SyncSummary {
                updated: 2,
                failures: vec![MemberFailure {
                    member_id: "9".to_string(),
                    error: "Member 9: SQLite error".to_string(),
                }],
                ..SyncSummary::default()
            },
        };
        let response = report_response(report);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_cancelled_report_is_unavailable() {
        let report = SyncRunReport {
            run_id: "r1".to_string(),
            list_id: 7,
            status: SyncRunStatus::Cancelled,
            cancelled: true,
            summary: SyncSummary::default(),
        };
        assert_eq!(
            report_response(report).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_timeout_maps_to_gateway_timeout() {
        let err = SyncError::Page {
            page: 1,
            cursor: "start".to_string(),
            source: CrmError::Timeout(30),
        };
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connection_rejects_non_numeric_list_id() {
        let app = router(test_state(Some("key"), Some(7), "http://unused.invalid"));
        let response = app
            .oneshot(get("/api/crm/test-connection?listId=abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connection_returns_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/v1/lists/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "listId": 12,
                "name": "Members",
                "filters": [{ "propertyName": "job_title" }, { "propertyName": "unknown_prop" }]
            })))
            .mount(&server)
            .await;
        let app = router(test_state(Some("key"), None, &server.uri()));

        let response = app
            .oneshot(get("/api/crm/test-connection?listId=12"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["listId"], 12);
        assert_eq!(body["listName"], "Members");
        assert_eq!(body["properties"], json!({ "Job Title": "job_title" }));
    }

    #[tokio::test]
    async fn test_status_and_field_mapping_read() {
        let state = test_state(Some("key"), Some(7), "http://unused.invalid");

        let response = router(state.clone())
            .oneshot(get("/api/members/sync/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["apiKeySet"], true);
        assert_eq!(body["data"]["memberCount"], 0);
        assert!(body["data"]["lastRun"].is_null());

        let response = router(state)
            .oneshot(get("/api/crm/field-mapping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["data"].is_null());
    }
}
