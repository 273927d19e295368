pub mod health;
pub mod parcels;
pub mod scan;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new().merge(parcels::router()).merge(scan::router()),
        )
        .with_state(state)
}
