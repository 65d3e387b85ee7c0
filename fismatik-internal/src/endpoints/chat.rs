use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::auth::UserContext;
use crate::endpoints::record_outcome;
use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::pipeline::ChatRequest;

/// `POST /api/chat`
pub async fn chat_handler(
    app_state: AppState,
    Extension(user): Extension<UserContext>,
    StructuredJson(params): StructuredJson<ChatRequest>,
) -> Result<Json<Value>, Error> {
    let result = app_state.pipeline.chat(&user, &params).await;
    record_outcome("chat", &result);
    Ok(Json(json!({ "ok": true, "reply": result? })))
}
