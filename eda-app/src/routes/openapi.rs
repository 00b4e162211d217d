use axum::Json;
use axum::routing::get;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "Eda messaging API", description = "HTTP gateway to the Eda AI message handler"),
    paths(
        crate::routes::health::get_health,
        crate::routes::messages::send_message,
        crate::routes::messages::receive_messages
    ),
    components(
        schemas(
            crate::routes::health::HealthResponse,
            crate::routes::messages::SendMessageRequest,
            crate::routes::messages::SendMessageResponse,
            crate::routes::messages::ReceiveResponse,
            crate::routes::messages::ErrorResponse,
            crate::store::ReceivedMessage
        )
    ),
    tags(
        (name = "Messages", description = "Send messages to the AI and list received ones"),
        (name = "Health", description = "Liveness")
    )
)]
pub struct ApiDoc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/messages/openapi.json", get(get_openapi))
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
