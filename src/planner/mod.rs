// src/planner/mod.rs - Interface to the trajectory planner
//!
//! Trajectory planning itself lives outside this crate. The controller only
//! needs to load a program, pull planned blocks one at a time, and keep the
//! planner informed about what the device is actually executing.

pub mod adapter;
pub mod scripted;

pub use adapter::PlannerAdapter;
pub use scripted::ScriptedPlanner;

use crate::state::{Axis, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid planner block on line {line}: {source}")]
    Block {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("planner error: {0}")]
    Other(String),
}

/// Something to plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    Path(PathBuf),
    Text(String),
}

/// Machine limits and start position handed to the planner on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlannerConfig {
    pub start: BTreeMap<String, f64>,
    pub max_vel: BTreeMap<String, f64>,
    pub max_accel: BTreeMap<String, f64>,
    pub max_jerk: BTreeMap<String, f64>,
    pub min_soft_limit: BTreeMap<String, f64>,
    pub max_soft_limit: BTreeMap<String, f64>,
    pub metric: bool,
}

impl PlannerConfig {
    pub fn start_position(&self) -> Position {
        axis_map(&self.start)
    }
}

/// Convert a letter-keyed map to axes, skipping unknown letters.
pub fn axis_map(map: &BTreeMap<String, f64>) -> Position {
    map.iter()
        .filter_map(|(k, v)| {
            let mut chars = k.chars();
            match (chars.next().and_then(Axis::from_char), chars.next()) {
                (Some(axis), None) => Some((axis, *v)),
                _ => None,
            }
        })
        .collect()
}

pub fn letter_map(position: &Position) -> BTreeMap<String, f64> {
    position
        .iter()
        .map(|(axis, v)| (axis.letter().to_string(), *v))
        .collect()
}

/// One planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub id: u32,
    #[serde(flatten)]
    pub kind: BlockKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BlockKind {
    #[serde(rename_all = "kebab-case")]
    Line {
        target: BTreeMap<String, f64>,
        exit_vel: f64,
        max_accel: f64,
        max_jerk: f64,
        /// Segment durations in milliseconds.
        #[serde(default)]
        times: Vec<f64>,
    },
    Set {
        name: String,
        value: serde_json::Value,
    },
    Dwell {
        seconds: f64,
    },
    #[serde(rename_all = "kebab-case")]
    Pause {
        #[serde(default)]
        optional: bool,
        #[serde(default)]
        pause_type: Option<String>,
    },
    Seek {
        switch: String,
        active: bool,
        error: bool,
    },
    Output {
        port: String,
        value: f64,
    },
}

/// The calls the controller makes on a trajectory planner.
pub trait PathPlanner {
    fn load(&mut self, program: &Program, config: &PlannerConfig) -> Result<(), PlannerError>;
    fn has_more(&self) -> bool;
    fn next(&mut self) -> Result<Option<Block>, PlannerError>;
    /// The device has started executing block `id`.
    fn set_active(&mut self, id: u32);
    /// Blocks remain to be issued or are issued but not yet executed.
    fn is_running(&self) -> bool;
    /// Planning is suspended until a seek result is known.
    fn is_synchronizing(&self) -> bool;
    fn synchronize(&mut self, offset: f64);
    /// Continue after block `id` from `position`, re-issuing what the
    /// device discarded.
    fn restart(&mut self, id: u32, position: &Position);
    /// Discard everything planned.
    fn stop(&mut self);
    fn set_position(&mut self, position: &Position);
}
