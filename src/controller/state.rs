use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::devices::axis::Axis;

/// Rolling log retains at most this many entries.
const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Idle,
    Running,
    Error,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "IDLE"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Controller-owned mutable state. Every read and write happens under the
/// controller's state mutex so observers never see a partially updated
/// snapshot.
///
/// Invariant: `run_state == Running` implies `current_sequence` is set;
/// leaving Running clears sequence, step and stop flag together via
/// [`DeviceState::clear_run`].
#[derive(Debug)]
pub struct DeviceState {
    pub run_state: RunState,
    pub current_sequence: Option<String>,
    pub sequence_step: Option<String>,
    pub last_error: Option<String>,
    pub stop_requested: bool,
    pub relay_states: BTreeMap<u8, bool>,
    pub rotary_port: Option<u8>,
    pub syringe_busy: bool,
    pub syringe_volume_ml: Option<f64>,
    pub syringe_target_ml: Option<f64>,
    pub axis_targets_mm: BTreeMap<Axis, f64>,
    pub axis_homed: BTreeMap<Axis, bool>,
    log: VecDeque<LogEntry>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            run_state: RunState::Idle,
            current_sequence: None,
            sequence_step: None,
            last_error: None,
            stop_requested: false,
            relay_states: (1..=8).map(|ch| (ch, false)).collect(),
            rotary_port: None,
            syringe_busy: false,
            syringe_volume_ml: None,
            syringe_target_ml: None,
            axis_targets_mm: BTreeMap::new(),
            axis_homed: BTreeMap::new(),
            log: VecDeque::with_capacity(LOG_CAPACITY),
        }
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_log(&mut self, message: impl Into<String>) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    /// Clear the per-run fields together when leaving the Running state.
    pub fn clear_run(&mut self) {
        self.current_sequence = None;
        self.sequence_step = None;
        self.stop_requested = false;
    }

    pub fn snapshot(&self, device_id: &str) -> StatusSnapshot {
        StatusSnapshot {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            run_state: self.run_state,
            current_sequence: self.current_sequence.clone(),
            sequence_step: self.sequence_step.clone(),
            last_error: self.last_error.clone(),
            stop_requested: self.stop_requested,
            relay_states: self.relay_states.clone(),
            rotary_port: self.rotary_port,
            syringe_busy: self.syringe_busy,
            syringe_volume_ml: self.syringe_volume_ml,
            syringe_target_ml: self.syringe_target_ml,
            axis_targets_mm: self.axis_targets_mm.clone(),
            axis_homed: self.axis_homed.clone(),
            log: self.log.iter().cloned().collect(),
        }
    }
}

/// Complete, consistently-read device state handed to external observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub run_state: RunState,
    pub current_sequence: Option<String>,
    pub sequence_step: Option<String>,
    pub last_error: Option<String>,
    pub stop_requested: bool,
    pub relay_states: BTreeMap<u8, bool>,
    pub rotary_port: Option<u8>,
    pub syringe_busy: bool,
    pub syringe_volume_ml: Option<f64>,
    pub syringe_target_ml: Option<f64>,
    pub axis_targets_mm: BTreeMap<Axis, f64>,
    pub axis_homed: BTreeMap<Axis, bool>,
    pub log: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded() {
        let mut state = DeviceState::new();
        for i in 0..250 {
            state.push_log(format!("entry {}", i));
        }
        let snapshot = state.snapshot("dev");
        assert_eq!(snapshot.log.len(), LOG_CAPACITY);
        assert_eq!(snapshot.log.first().unwrap().message, "entry 150");
        assert_eq!(snapshot.log.last().unwrap().message, "entry 249");
    }

    #[test]
    fn clear_run_resets_the_run_fields_together() {
        let mut state = DeviceState::new();
        state.run_state = RunState::Running;
        state.current_sequence = Some("maf_sampling".to_string());
        state.sequence_step = Some("Step 3".to_string());
        state.stop_requested = true;

        state.run_state = RunState::Idle;
        state.clear_run();
        assert!(state.current_sequence.is_none());
        assert!(state.sequence_step.is_none());
        assert!(!state.stop_requested);
    }

    #[test]
    fn snapshot_serializes_run_state_uppercase() {
        let state = DeviceState::new();
        let json = serde_json::to_value(state.snapshot("dev3")).unwrap();
        assert_eq!(json["run_state"], "IDLE");
        assert_eq!(json["device_id"], "dev3");
    }
}
