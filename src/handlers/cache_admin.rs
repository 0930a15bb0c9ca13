use axum::{extract::State, http::StatusCode};

use super::AppState;

/// Handle DELETE {prefix}/cache: discard every memoized value
pub async fn nuke_cache(State(state): State<AppState>) -> StatusCode {
    let discarded = state.cache.len();
    state.cache.nuke();
    tracing::info!(discarded, "Cache nuked by administrative request");
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_nuke_cache_empties_store() {
        let state = AppState::default();
        state
            .cache
            .get("translations", || async { Ok(Value::Array(vec![])) })
            .await
            .unwrap();
        assert_eq!(state.cache.len(), 1);

        let status = nuke_cache(State(state.clone())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.cache.is_empty());
    }
}
