// src/planner/scripted.rs - Replays pre-planned blocks stored as JSON lines
use super::{Block, BlockKind, PathPlanner, PlannerConfig, PlannerError, Program, axis_map};
use crate::state::Position;
use std::collections::VecDeque;

/// A planner that reads already planned blocks, one JSON object per line,
/// and hands them out in order. G-code needs a real planner and is refused.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    queued: VecDeque<Block>,
    /// Issued but not yet reported active by the device.
    issued: VecDeque<Block>,
    next_id: u32,
    active_id: u32,
    synchronizing: bool,
    position: Position,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    fn parse(text: &str) -> Result<Vec<Block>, PlannerError> {
        let mut blocks = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('{') {
                return Err(PlannerError::Unsupported(format!(
                    "line {} is not a planned block; G-code requires an external planner",
                    n + 1
                )));
            }
            let block = serde_json::from_str(line)
                .map_err(|source| PlannerError::Block { line: n + 1, source })?;
            blocks.push(block);
        }
        Ok(blocks)
    }
}

impl PathPlanner for ScriptedPlanner {
    fn load(&mut self, program: &Program, config: &PlannerConfig) -> Result<(), PlannerError> {
        let text = match program {
            Program::Text(text) => text.clone(),
            Program::Path(path) => std::fs::read_to_string(path)?,
        };
        let blocks = Self::parse(&text)?;
        self.position = config.start_position();
        for mut block in blocks {
            if block.id == 0 {
                self.next_id += 1;
                block.id = self.next_id;
            } else {
                self.next_id = self.next_id.max(block.id);
            }
            self.queued.push_back(block);
        }
        tracing::debug!("Loaded {} planned blocks", self.queued.len());
        Ok(())
    }

    fn has_more(&self) -> bool {
        !self.queued.is_empty() && !self.synchronizing
    }

    fn next(&mut self) -> Result<Option<Block>, PlannerError> {
        if self.synchronizing {
            return Ok(None);
        }
        let Some(block) = self.queued.pop_front() else {
            return Ok(None);
        };
        match &block.kind {
            BlockKind::Line { target, .. } => self.position.extend(axis_map(target)),
            BlockKind::Seek { .. } => self.synchronizing = true,
            _ => {}
        }
        self.issued.push_back(block.clone());
        Ok(Some(block))
    }

    fn set_active(&mut self, id: u32) {
        self.active_id = id;
        while self.issued.front().is_some_and(|b| b.id <= id) {
            self.issued.pop_front();
        }
    }

    /// Set blocks are carried out by the host, so only device blocks count
    /// as outstanding work once issued.
    fn is_running(&self) -> bool {
        !self.queued.is_empty()
            || self
                .issued
                .iter()
                .any(|b| !matches!(b.kind, BlockKind::Set { .. }))
    }

    fn is_synchronizing(&self) -> bool {
        self.synchronizing
    }

    fn synchronize(&mut self, offset: f64) {
        tracing::debug!("Planner synchronized, offset {}", offset);
        self.synchronizing = false;
    }

    fn restart(&mut self, id: u32, position: &Position) {
        self.set_active(id);
        while let Some(block) = self.issued.pop_back() {
            self.queued.push_front(block);
        }
        self.position = position.clone();
        self.synchronizing = false;
    }

    fn stop(&mut self) {
        self.queued.clear();
        self.issued.clear();
        self.synchronizing = false;
    }

    fn set_position(&mut self, position: &Position) {
        self.position = position.clone();
    }
}
