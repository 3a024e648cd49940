use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, header},
    response::Json,
    routing::get,
};
use tower_http::set_header::response::SetResponseHeaderLayer;

use crate::schema::ReconciliationReport;

// ---------- shared state ----------

#[derive(Clone)]
pub struct AppState {
    /// Outcome of the reconciliation pass that ran at startup.
    pub report: Arc<ReconciliationReport>,
}

// ---------- router ----------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/schema/report",
            get(schema_report).layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            )),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn schema_report(State(state): State<AppState>) -> Json<ReconciliationReport> {
    Json(state.report.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ReconciliationOutcome;
    use crate::schema::report::{BindingReport, BootstrapOutcome};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let mut report = ReconciliationReport::new(false);
        report.bindings.push(BindingReport {
            table: "companies".into(),
            column: "lifecycleStage".into(),
            enum_type: "lifecycle_stage_enum".into(),
            previous_type: Some("enum_companies_lifecycleStage".into()),
            outcome: ReconciliationOutcome::Converted,
        });
        report.bootstrap = Some(BootstrapOutcome::AlreadyApplied);
        report.finish(Vec::new());

        router(AppState {
            report: Arc::new(report),
        })
    }

    async fn get_json(uri: &str) -> (StatusCode, header::HeaderMap, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_schema_report_is_served_uncached() {
        let (status, headers, body) = get_json("/api/schema/report").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");

        assert_eq!(body["dry_run"], false);
        assert_eq!(body["bootstrap"], "already_applied");
        assert_eq!(body["bindings"][0]["outcome"]["status"], "converted");
        assert_eq!(
            body["bindings"][0]["previous_type"],
            "enum_companies_lifecycleStage"
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (status, _, _) = get_json("/api/schema/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
