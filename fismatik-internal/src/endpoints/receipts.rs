use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::auth::UserContext;
use crate::endpoints::record_outcome;
use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::pipeline::ParseReceiptRequest;

/// `POST /api/parse-receipt`
pub async fn parse_receipt_handler(
    app_state: AppState,
    Extension(mut user): Extension<UserContext>,
    StructuredJson(params): StructuredJson<ParseReceiptRequest>,
) -> Result<Json<Value>, Error> {
    let result = app_state.pipeline.parse_receipt(&mut user, &params).await;
    record_outcome("parse_receipt", &result);
    let outcome = result?;
    Ok(Json(json!({
        "ok": true,
        "data": outcome.data,
        "meta": outcome.meta,
    })))
}
