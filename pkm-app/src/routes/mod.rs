pub mod health;
pub mod query;
pub mod sessions;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(query::router())
        .merge(sessions::router())
}
