use axum::Router;

pub mod dashboard;
pub mod system;

pub fn router() -> Router {
    Router::new().nest("/dashboard", dashboard::router())
}
