use chrono::{DateTime, Utc};
use salvo::prelude::*;
use serde_json::json;

use crate::sync::reconcile::{ReconcileOptions, ReconcileOutcome};
use crate::web::handlers::render_error;
use crate::web::web_state;

fn parse_date_param(req: &mut Request, name: &str) -> Result<Option<DateTime<Utc>>, String> {
    match req.query::<String>(name) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| format!("invalid {name} parameter, expected RFC 3339: {e}")),
    }
}

/// Manual "run reconciliation now" entry point. Accepts an optional RFC 3339
/// `start`/`end` range and a `dry_run` flag.
#[handler]
pub async fn run_reconciliation(req: &mut Request, res: &mut Response) {
    let start = match parse_date_param(req, "start") {
        Ok(v) => v,
        Err(message) => {
            render_error(res, StatusCode::BAD_REQUEST, &message);
            return;
        }
    };
    let end = match parse_date_param(req, "end") {
        Ok(v) => v,
        Err(message) => {
            render_error(res, StatusCode::BAD_REQUEST, &message);
            return;
        }
    };
    let dry_run = req.query::<bool>("dry_run").unwrap_or(false);

    match web_state()
        .reconcile_job
        .run(ReconcileOptions { start, end, dry_run })
        .await
    {
        ReconcileOutcome::Completed(report) => {
            res.render(Json(json!({
                "ok": report.errors.is_empty(),
                "dry_run": dry_run,
                "report": report,
            })));
        }
        ReconcileOutcome::AlreadyRunning => {
            render_error(res, StatusCode::CONFLICT, "reconciliation is already running");
        }
        ReconcileOutcome::NotConfigured => {
            render_error(
                res,
                StatusCode::SERVICE_UNAVAILABLE,
                "provider is not configured",
            );
        }
    }
}

#[handler]
pub async fn reconcile_status(res: &mut Response) {
    match web_state().reconcile_job.last_run_status().await {
        Ok(status) => {
            res.render(Json(status));
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
        }
    }
}
