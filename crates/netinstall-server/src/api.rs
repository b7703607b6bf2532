//! HTTP operator API.
//!
//! A thin JSON front end over the operator command queue:
//!
//! - `GET  /v1/sessions`
//! - `POST /v1/sessions/{mac}/transfer` with `{"image": "<filename>"}`
//! - `POST /v1/sessions/{mac}/key`
//! - `GET  /v1/images?arch=<arch>`

use crate::catalog::ImageMetadata;
use crate::error::{NetInstallError, Result};
use crate::hwaddr::MacAddr;
use crate::operator::OperatorHandle;
use crate::session::SessionSummary;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub arch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct KeyExported {
    pub path: String,
}

/// Error response carrying a [`NetInstallError`]
pub struct ApiError(NetInstallError);

impl From<NetInstallError> for ApiError {
    fn from(err: NetInstallError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NetInstallError::UnknownPeer(_) | NetInstallError::ImageNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            NetInstallError::ResourceBusy(_) => StatusCode::CONFLICT,
            NetInstallError::MalformedFrame(_) | NetInstallError::MalformedImage { .. } => {
                StatusCode::BAD_REQUEST
            }
            NetInstallError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Builds the API router over `operator`.
pub fn router(operator: OperatorHandle) -> Router {
    Router::new()
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/{mac}/transfer", post(start_transfer))
        .route("/v1/sessions/{mac}/key", post(export_key))
        .route("/v1/images", get(list_images))
        .layer(TraceLayer::new_for_http())
        .with_state(operator)
}

async fn list_sessions(
    State(operator): State<OperatorHandle>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    Ok(Json(operator.list_sessions().await?))
}

async fn start_transfer(
    State(operator): State<OperatorHandle>,
    Path(mac): Path<String>,
    Json(request): Json<TransferRequest>,
) -> ApiResult<(StatusCode, Json<ImageMetadata>)> {
    let mac: MacAddr = mac.parse()?;
    let image = operator.start_transfer(mac, request.image).await?;
    Ok((StatusCode::ACCEPTED, Json(image)))
}

async fn export_key(
    State(operator): State<OperatorHandle>,
    Path(mac): Path<String>,
) -> ApiResult<Json<KeyExported>> {
    let mac: MacAddr = mac.parse()?;
    let path = operator.export_key(mac).await?;
    Ok(Json(KeyExported {
        path: path.display().to_string(),
    }))
}

async fn list_images(
    State(operator): State<OperatorHandle>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<Json<Vec<ImageMetadata>>> {
    Ok(Json(operator.list_images(query.arch).await?))
}

/// Serve the API on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    operator: OperatorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Operator API listening");

    axum::serve(listener, router(operator))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!("Operator API stopped");
    Ok(())
}
