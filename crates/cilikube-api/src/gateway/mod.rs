//! Resource gateway: CRUD, list and watch against the targeted cluster

pub mod crd;
pub mod kinds;
pub mod params;
pub mod verbs;
pub mod watch;

use axum::Router;

use crate::server::AppState;

pub use kinds::{Kind, KindScope, CLUSTER_KINDS, NAMESPACED_KINDS};
pub use params::ListQuery;
pub use verbs::Page;

pub(crate) fn routes() -> Router<AppState> {
    kinds::routes().merge(crd::routes())
}
