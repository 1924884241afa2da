use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    let state = web_state();
    let database = match state.db_manager.ping().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    let status = if database == "ok" { "ok" } else { "degraded" };

    res.render(Json(json!({
        "status": status,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "database": database,
        "provider_configured": state.provider.is_configured(),
    })));
}
