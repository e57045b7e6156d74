//! Registry-facing endpoints

pub mod clusters;

use axum::Router;

use crate::server::AppState;

pub(crate) fn routes() -> Router<AppState> {
    clusters::routes()
}
