use log::debug;
use std::sync::Arc;
use std::time::Duration;

use super::controller::DeviceController;
use crate::devices::syringe_pump::MotionStatus;

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Consecutive idle polls required before the syringe is declared idle.
const IDLE_DEBOUNCE_POLLS: u32 = 3;
/// Raw velocity magnitude treated as motion evidence even when the busy
/// bit is clear.
const ACTIVE_VELOCITY_THRESHOLD: i32 = 50;
const ACTIVE_FLOW_THRESHOLD_ML_MIN: f64 = 0.01;

/// Debounced activity detector. Drives clear the busy bit slightly before
/// motion actually stops, so "active" is derived from several telemetry
/// fields and only drops after a run of idle polls.
pub(crate) struct ActivityFilter {
    active: bool,
    idle_polls: u32,
}

impl ActivityFilter {
    pub(crate) fn new() -> Self {
        Self {
            active: false,
            idle_polls: 0,
        }
    }

    pub(crate) fn update(&mut self, status: &MotionStatus) -> bool {
        let moving = status.busy
            || !status.standstill
            || status.actual_velocity.abs() > ACTIVE_VELOCITY_THRESHOLD
            || status.flow_ml_min.abs() > ACTIVE_FLOW_THRESHOLD_ML_MIN;
        if moving {
            self.idle_polls = 0;
            self.active = true;
        } else {
            self.idle_polls += 1;
            if self.idle_polls >= IDLE_DEBOUNCE_POLLS {
                self.active = false;
            }
        }
        self.active
    }
}

/// Long-lived telemetry loop, independent of any running sequence. State
/// and broadcast are only touched when the derived activity flag or the
/// observed volume actually change.
pub(crate) async fn run(ctrl: Arc<DeviceController>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut filter = ActivityFilter::new();
    let mut last_published: Option<(bool, i64)> = None;

    loop {
        ticker.tick().await;

        let status = match ctrl.syringe().read_status().await {
            Ok(status) => status,
            Err(e) => {
                debug!("📡 telemetry poll failed: {}", e);
                continue;
            }
        };

        let active = filter.update(&status);
        let volume_key = (status.volume_ml * 1000.0).round() as i64;
        if last_published != Some((active, volume_key)) {
            last_published = Some((active, volume_key));
            ctrl.poll_update(active, status.volume_ml);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(busy: bool, standstill: bool, velocity: i32) -> MotionStatus {
        MotionStatus {
            busy,
            standstill,
            velocity_ok: true,
            position_ok: true,
            mode: 0,
            actual_velocity: velocity,
            actual_position: 0,
            volume_ml: 0.0,
            flow_ml_min: velocity as f64 / 1000.0,
        }
    }

    #[test]
    fn busy_bit_marks_active_immediately() {
        let mut filter = ActivityFilter::new();
        assert!(filter.update(&status(true, false, 0)));
    }

    #[test]
    fn velocity_counts_as_motion_evidence_without_busy_bit() {
        let mut filter = ActivityFilter::new();
        assert!(filter.update(&status(false, true, 5000)));
    }

    #[test]
    fn idle_needs_debounce_before_clearing() {
        let mut filter = ActivityFilter::new();
        assert!(filter.update(&status(true, false, 1200)));
        // drive drops busy early; two idle polls are not enough
        assert!(filter.update(&status(false, true, 0)));
        assert!(filter.update(&status(false, true, 0)));
        // third consecutive idle poll clears the flag
        assert!(!filter.update(&status(false, true, 0)));
    }

    #[test]
    fn motion_resets_the_debounce_counter() {
        let mut filter = ActivityFilter::new();
        assert!(filter.update(&status(true, false, 1200)));
        assert!(filter.update(&status(false, true, 0)));
        assert!(filter.update(&status(false, true, 0)));
        // brief twitch re-arms the debounce
        assert!(filter.update(&status(false, false, 0)));
        assert!(filter.update(&status(false, true, 0)));
        assert!(filter.update(&status(false, true, 0)));
        assert!(!filter.update(&status(false, true, 0)));
    }
}
