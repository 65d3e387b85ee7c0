use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::auth::UserContext;
use crate::endpoints::record_outcome;
use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::pipeline::FinancialAdviceRequest;

/// `POST /api/financial-advice`. Not counted against the receipt quota.
pub async fn financial_advice_handler(
    app_state: AppState,
    Extension(user): Extension<UserContext>,
    StructuredJson(params): StructuredJson<FinancialAdviceRequest>,
) -> Result<Json<Value>, Error> {
    let result = app_state.pipeline.financial_advice(&user, &params).await;
    record_outcome("financial_advice", &result);
    Ok(Json(json!({ "ok": true, "advice": result? })))
}
