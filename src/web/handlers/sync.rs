use salvo::prelude::*;
use serde_json::json;
use tracing::warn;

use crate::db::AppointmentStatus;
use crate::sync::SyncOutcome;
use crate::web::handlers::render_error;
use crate::web::web_state;

/// Operator resync for a single appointment. Picks the mirroring action from
/// local state: cancelled appointments cancel their external booking, linked
/// ones go through cancel-and-recreate, the rest through outbound sync.
///
/// Mirror failures come back as a `failed` result, not an HTTP error: the
/// local record is the source of truth and stays valid either way.
#[handler]
pub async fn sync_appointment(req: &mut Request, res: &mut Response) {
    let id = match req.param::<i64>("id") {
        Some(v) if v > 0 => v,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid appointment id");
            return;
        }
    };

    let state = web_state();
    let appointment = match state.db_manager.appointment_store().get_appointment(id).await {
        Ok(Some(appointment)) => appointment,
        Ok(None) => {
            render_error(res, StatusCode::NOT_FOUND, "appointment not found");
            return;
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
            return;
        }
    };

    let outcome = if appointment.status == AppointmentStatus::Cancelled {
        match appointment.external_booking_id.clone() {
            Some(external_booking_id) => {
                let outcome = state
                    .sync_service
                    .cancel_external_booking(&external_booking_id)
                    .await;
                if !outcome.is_failure() {
                    if let Err(e) = state
                        .db_manager
                        .appointment_store()
                        .set_external_booking_id(appointment.id, None)
                        .await
                    {
                        warn!(
                            "failed to unlink cancelled appointment {}: {}",
                            appointment.id, e
                        );
                    }
                }
                outcome
            }
            None => SyncOutcome::Skipped {
                reason: "appointment has no external booking".to_string(),
            },
        }
    } else if appointment.external_booking_id.is_some() {
        state.sync_service.update_external_booking(&appointment).await
    } else {
        state.sync_service.sync_appointment_outbound(&appointment).await
    };

    match outcome {
        SyncOutcome::Synced {
            external_booking_id,
        } => {
            res.render(Json(json!({
                "result": "synced",
                "appointment_id": id,
                "external_booking_id": external_booking_id,
            })));
        }
        SyncOutcome::Skipped { reason } => {
            res.render(Json(json!({
                "result": "skipped",
                "appointment_id": id,
                "reason": reason,
            })));
        }
        SyncOutcome::Failed { error } => {
            res.render(Json(json!({
                "result": "failed",
                "appointment_id": id,
                "error": error,
            })));
        }
    }
}
