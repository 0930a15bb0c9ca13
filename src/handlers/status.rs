use axum::extract::State;
use serde_json::Value;

use super::AppState;
use crate::error::AppError;

const STATUS_KEY: &str = "core:status";

/// Release status line of the running build
pub fn status_message() -> String {
    let commit = option_env!("GIT_COMMIT").unwrap_or("unknown");
    format!(
        "ok! Plugin Core {} released, last commit was \"{}\"",
        env!("CARGO_PKG_VERSION"),
        commit
    )
}

/// Handle GET {prefix}/status
pub async fn status(State(state): State<AppState>) -> Result<String, AppError> {
    let value = state
        .cache
        .get(STATUS_KEY, || async { Ok(Value::String(status_message())) })
        .await?;

    Ok(value.as_str().unwrap_or_default().to_string())
}
