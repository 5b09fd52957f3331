// src/api.rs
use crate::cell::TonAddress;
use crate::db::Store;
use crate::models::{Log, PendingOperation, UserSnapshot};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
    #[serde(default)]
    pub unprocessed: bool,
}

pub enum ApiError {
    BadRequest(String),
    NotFound,
    Internal(eyre::Report),
}

impl From<eyre::Report> for ApiError {
    fn from(e: eyre::Report) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Internal(e) => {
                error!("API request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Lending Indexer API running" }))
        .route("/events", get(events))
        .route("/users/:contract", get(user))
        .route("/pending", get(pending))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(port: u16, state: ApiState) -> eyre::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service()).await?;

    Ok(())
}

async fn events(State(state): State<ApiState>, Query(q): Query<EventsQuery>) -> Result<Json<Vec<Log>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.store.list_events(limit, q.unprocessed).await?))
}

async fn user(State(state): State<ApiState>, Path(contract): Path<String>) -> Result<Json<UserSnapshot>, ApiError> {
    let contract: TonAddress = contract
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    state
        .store
        .get_user_snapshot(&contract)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn pending(State(state): State<ApiState>) -> Result<Json<Vec<PendingOperation>>, ApiError> {
    Ok(Json(state.store.list_pending_operations().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, Principals};
    use crate::testing::{addr, memory_store};
    use alloy::primitives::B256;

    fn state() -> ApiState {
        ApiState { store: memory_store() }
    }

    fn event(hash: u8, processed: bool) -> Log {
        Log {
            id: None,
            hash: B256::repeat_byte(hash),
            utime: 1_716_100_000 + hash as u64,
            kind: EventKind::Supply,
            sender_address: addr(2),
            user_address: addr(1),
            attached: None,
            redeemed: None,
            processed,
        }
    }

    #[tokio::test]
    async fn lists_events_with_filter_and_limit() {
        let state = state();
        for (hash, processed) in [(1, true), (2, false), (3, true)] {
            state.store.append_event(&event(hash, processed)).await.unwrap();
        }

        let Ok(Json(all)) = events(State(state.clone()), Query(EventsQuery::default())).await else {
            panic!("listing failed");
        };
        assert_eq!(all.len(), 3);

        let q = EventsQuery {
            limit: Some(1),
            unprocessed: false,
        };
        let Ok(Json(one)) = events(State(state.clone()), Query(q)).await else {
            panic!("listing failed");
        };
        assert_eq!(one.len(), 1);

        let q = EventsQuery {
            limit: None,
            unprocessed: true,
        };
        let Ok(Json(open)) = events(State(state), Query(q)).await else {
            panic!("listing failed");
        };
        assert_eq!(open.len(), 1);
        assert!(!open[0].processed);
    }

    #[tokio::test]
    async fn user_lookup_validates_and_finds() {
        let state = state();
        let bad = user(State(state.clone()), Path("nope".to_string())).await;
        assert!(matches!(bad, Err(ApiError::BadRequest(_))));

        let missing = user(State(state.clone()), Path(addr(2).to_string())).await;
        assert!(matches!(missing, Err(ApiError::NotFound)));

        let snapshot = UserSnapshot {
            wallet_address: addr(1),
            contract_address: addr(2),
            code_version: 3,
            created_at: 10,
            updated_at: 20,
            principals: Principals::default(),
            state: 0,
        };
        state.store.insert_user_snapshot(&snapshot).await.unwrap();
        let Ok(Json(found)) = user(State(state), Path(addr(2).to_string())).await else {
            panic!("snapshot not found");
        };
        assert_eq!(found, snapshot);
    }
}
