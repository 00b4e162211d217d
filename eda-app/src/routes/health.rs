use axum::Json;
use axum::routing::get;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/messages/health", get(get_health))
}

#[utoipa::path(
    get,
    path = "/api/messages/health",
    tag = "Health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_healthy() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/api/messages/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body, serde_json::json!({"status": "healthy"}));
    }
}
