use salvo::prelude::*;
use serde_json::json;

pub mod health;
pub mod reconcile;
pub mod sync;
pub mod webhooks;

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}
