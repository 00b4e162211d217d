pub mod health;
pub mod messages;
pub mod openapi;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(messages::router())
        .merge(openapi::router())
}
