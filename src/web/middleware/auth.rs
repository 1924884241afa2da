use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;
use serde_json::json;

use crate::web::handlers::{
    health::health_check,
    reconcile::{reconcile_status, run_reconciliation},
    sync::sync_appointment,
    webhooks::provider_webhook,
};
use crate::web::metrics::metrics_endpoint;
use crate::web::web_state;

/// Admin routes require `Authorization: Bearer <web.admin_token>`. The
/// webhook endpoint stays open: the provider authenticates deliveries on its
/// own and dropped events are redelivered anyway.
#[handler]
pub async fn require_admin_token(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let expected = &web_state().config.web.admin_token;
    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false);

    if !authorized {
        res.status_code(StatusCode::UNAUTHORIZED);
        res.render(Json(json!({ "error": "invalid or missing bearer token" })));
        ctrl.skip_rest();
    }
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics_endpoint))
        .push(Router::with_path("webhooks/provider").post(provider_webhook))
        .push(
            Router::with_path("admin")
                .hoop(require_admin_token)
                .push(Router::with_path("reconcile").post(run_reconciliation))
                .push(Router::with_path("reconcile/status").get(reconcile_status))
                .push(Router::with_path("appointments/{id}/sync").post(sync_appointment)),
        )
}
