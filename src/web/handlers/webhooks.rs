use salvo::prelude::*;
use serde_json::json;
use tracing::debug;

use crate::sync::events::{InboundEvent, SubmitResult};
use crate::web::handlers::render_error;
use crate::web::web_state;

/// Inbound event boundary. The response only acknowledges receipt;
/// processing happens on the event worker after this handler returns.
#[handler]
pub async fn provider_webhook(req: &mut Request, res: &mut Response) {
    let event: InboundEvent = match req.parse_json().await {
        Ok(event) => event,
        Err(err) => {
            render_error(
                res,
                StatusCode::BAD_REQUEST,
                &format!("malformed event payload: {err}"),
            );
            return;
        }
    };

    debug!(
        "provider webhook received event_id={} type={}",
        event.event_id, event.event_type
    );

    match web_state().event_processor.submit(event) {
        SubmitResult::Accepted => {
            res.render(Json(json!({ "accepted": true })));
        }
        SubmitResult::Dropped { reason } => {
            res.render(Json(json!({ "accepted": false, "reason": reason })));
        }
    }
}
