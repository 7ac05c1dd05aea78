//! Defines the Axum API routes and handlers.

use crate::machine::MachOp;
use crate::planner::Program;
use crate::state::Changes;
use crate::web::ctrl_channel::CtrlRequest;
use crate::web::models::{
    ErrorResponse, HomeRequest, JogRequest, MdiRequest, OverrideRequest, PositionRequest,
    StartRequest, UnhomeRequest,
};
use async_stream::stream;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use std::convert::Infallible;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

pub type AppState = Sender<CtrlRequest>;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(ctrl_tx: AppState) -> Router {
    Router::new()
        .route("/api/v1/state", get(get_state))
        .route("/api/v1/events", get(events))
        .route("/api/v1/mdi", post(mdi))
        .route("/api/v1/jog", post(jog))
        .route("/api/v1/home", post(home))
        .route("/api/v1/unhome", post(unhome))
        .route("/api/v1/start", post(start))
        .route("/api/v1/stop", post(stop))
        .route("/api/v1/pause", post(pause))
        .route("/api/v1/pause/optional", post(optional_pause))
        .route("/api/v1/unpause", post(unpause))
        .route("/api/v1/step", post(step))
        .route("/api/v1/estop", post(estop))
        .route("/api/v1/clear", post(clear))
        .route("/api/v1/position", post(set_position))
        .route("/api/v1/override/feed", post(override_feed))
        .route("/api/v1/override/speed", post(override_speed))
        .route("/api/v1/reboot", post(reboot))
        .with_state(ctrl_tx)
}

/// Send `op` to the controller task and wait for its verdict. A refused
/// operation maps to 409.
async fn run_op(ctrl_tx: AppState, op: MachOp) -> Result<StatusCode, ApiError> {
    let (resp_tx, resp_rx) = oneshot::channel();
    if ctrl_tx
        .send(CtrlRequest::Command {
            op,
            respond_to: resp_tx,
        })
        .await
        .is_err()
    {
        return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "controller not running"));
    }
    match resp_rx.await {
        Ok(Ok(())) => Ok(StatusCode::OK),
        Ok(Err(e)) => Err(api_error(StatusCode::CONFLICT, e)),
        Err(_) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "no reply from controller")),
    }
}

/// Handler to get the full machine state.
async fn get_state(State(ctrl_tx): State<AppState>) -> Result<Json<Changes>, StatusCode> {
    let (resp_tx, resp_rx) = oneshot::channel();
    if ctrl_tx.send(CtrlRequest::GetState { respond_to: resp_tx }).await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    match resp_rx.await {
        Ok(state) => Ok(Json(state)),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn changes_event(changes: &Changes) -> Event {
    Event::default()
        .json_data(changes)
        .unwrap_or_else(|_| Event::default().comment("unencodable state"))
}

/// Server-sent events: the full state first, then every change batch.
async fn events(
    State(ctrl_tx): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let (snapshot, rx) = subscribe(&ctrl_tx).await?;
    let stream = change_stream(ctrl_tx, snapshot, rx)
        .map(|changes| Ok::<_, Infallible>(changes_event(&changes)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn subscribe(ctrl_tx: &AppState) -> Result<(Changes, Receiver<Changes>), StatusCode> {
    let (resp_tx, resp_rx) = oneshot::channel();
    if ctrl_tx.send(CtrlRequest::Subscribe { respond_to: resp_tx }).await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    resp_rx.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// `snapshot`, then every batch from `rx`. A subscriber that falls behind
/// and misses batches is sent a fresh snapshot and continues from there.
pub fn change_stream(
    ctrl_tx: AppState,
    snapshot: Changes,
    mut rx: Receiver<Changes>,
) -> impl Stream<Item = Changes> {
    stream! {
        yield snapshot;
        loop {
            match rx.recv().await {
                Ok(changes) => yield changes,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Event subscriber lagged, {} batches dropped, resending state", n);
                    match subscribe(&ctrl_tx).await {
                        Ok((snapshot, fresh)) => {
                            rx = fresh;
                            yield snapshot;
                        }
                        Err(_) => break,
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

async fn mdi(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<MdiRequest>,
) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Mdi(payload.command)).await
}

async fn jog(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<JogRequest>,
) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Jog(payload.axes)).await
}

async fn home(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<HomeRequest>,
) -> Result<StatusCode, ApiError> {
    let op = MachOp::Home {
        axis: payload.axis,
        position: payload.position,
    };
    run_op(ctrl_tx, op).await
}

async fn unhome(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<UnhomeRequest>,
) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Unhome(payload.axis)).await
}

async fn start(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<StartRequest>,
) -> Result<StatusCode, ApiError> {
    let program = payload.path.map(|p| Program::Path(p.into()));
    run_op(ctrl_tx, MachOp::Start(program)).await
}

async fn stop(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Stop).await
}

async fn pause(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Pause).await
}

async fn optional_pause(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::OptionalPause).await
}

async fn unpause(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Unpause).await
}

async fn step(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Step).await
}

async fn estop(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Estop).await
}

async fn clear(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Clear).await
}

async fn set_position(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<PositionRequest>,
) -> Result<StatusCode, ApiError> {
    let op = MachOp::SetPosition {
        axis: payload.axis,
        position: payload.position,
    };
    run_op(ctrl_tx, op).await
}

async fn override_feed(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<OverrideRequest>,
) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::OverrideFeed(payload.value)).await
}

async fn override_speed(
    State(ctrl_tx): State<AppState>,
    Json(payload): Json<OverrideRequest>,
) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::OverrideSpeed(payload.value)).await
}

async fn reboot(State(ctrl_tx): State<AppState>) -> Result<StatusCode, ApiError> {
    run_op(ctrl_tx, MachOp::Reboot).await
}
