//! Contains the data models for API requests and responses.

use crate::state::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single MDI block, or a raw device command starting with `$` or `\`.
#[derive(Deserialize)]
pub struct MdiRequest {
    pub command: String,
}

/// Jog velocities as a fraction of each axis' maximum, keyed by axis letter.
#[derive(Deserialize)]
pub struct JogRequest {
    pub axes: BTreeMap<Axis, f64>,
}

/// Home one axis, or every axis when `axis` is absent. `position` is
/// required for manually homed axes.
#[derive(Deserialize, Default)]
pub struct HomeRequest {
    pub axis: Option<Axis>,
    pub position: Option<f64>,
}

/// Start the loaded program, or load `path` first.
#[derive(Deserialize, Default)]
pub struct StartRequest {
    pub path: Option<String>,
}

#[derive(Deserialize)]
pub struct PositionRequest {
    pub axis: Axis,
    pub position: f64,
}

/// Override ratio, 1.0 being 100%.
#[derive(Deserialize)]
pub struct OverrideRequest {
    pub value: f64,
}

#[derive(Deserialize)]
pub struct UnhomeRequest {
    pub axis: Axis,
}

/// Returned when a machine operation is refused.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
