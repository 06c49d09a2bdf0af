//! HTTP surface of the mini app.

pub mod api;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::auth::INIT_DATA_HEADER;

pub use api::{ApiError, AppState};

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/me", get(get_me))
        .route("/api/leaderboard", get(get_leaderboard))
        .route("/api/exchange", post(post_exchange))
        .with_state(state)
}

fn init_data(headers: &HeaderMap) -> Option<String> {
    headers
        .get(INIT_DATA_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Runs a blocking handler on the blocking pool and renders its outcome.
async fn run<T, F>(state: AppState, headers: HeaderMap, handler: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AppState, Option<&str>) -> Result<T, ApiError> + Send + 'static,
{
    let init_data = init_data(&headers);
    let outcome =
        tokio::task::spawn_blocking(move || handler(&state, init_data.as_deref())).await;
    match outcome {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err(err)) => err.into_response(),
        Err(join) => {
            error!(error = %join, "request handler aborted");
            ApiError::Internal.into_response()
        }
    }
}

async fn root() -> Redirect {
    Redirect::temporary("/app")
}

async fn get_me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    run(state, headers, api::me).await
}

async fn get_leaderboard(State(state): State<AppState>, headers: HeaderMap) -> Response {
    run(state, headers, api::leaderboard).await
}

async fn post_exchange(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<api::ExchangeRequest>,
) -> Response {
    run(state, headers, move |state, init_data| {
        api::exchange_points(state, init_data, request)
    })
    .await
}
