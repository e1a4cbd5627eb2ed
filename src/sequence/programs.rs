use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::engine::{SequenceAbort, SequenceOutcome, SequenceRunner};
use crate::devices::traits::{PortSelect, RelaySwitch, SyringeMotion};
use crate::utils::error::DeviceError;

pub const MAF_SAMPLING: &str = "maf_sampling";
pub const SEQUENCE_TWO: &str = "sequence2";

/// Resolve a user-supplied sequence name to its canonical key.
pub fn resolve(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "maf_sampling" | "maf" | "sequence1" | "sequence_1" => Some(MAF_SAMPLING),
        "sequence2" | "sequence_2" | "seq2" => Some(SEQUENCE_TWO),
        _ => None,
    }
}

pub fn display_name(key: &str) -> &str {
    match key {
        MAF_SAMPLING => "MAF sampling sequence",
        SEQUENCE_TWO => "Sequence 2",
        other => other,
    }
}

/// Named axis moves a sequence may request. Targets come from the axis
/// preset table, not from the sequence itself.
#[async_trait]
pub trait AxisPresets: Send + Sync {
    async fn horizontal_to_filtering(&self) -> Result<(), DeviceError>;
    async fn horizontal_home(&self) -> Result<(), DeviceError>;
    async fn vertical_close(&self) -> Result<(), DeviceError>;
    async fn vertical_open(&self) -> Result<(), DeviceError>;
}

/// Full re-initialization (relays off, axes and syringe homed).
#[async_trait]
pub trait InitStrategy: Send + Sync {
    async fn initialize(&self) -> Result<(), DeviceError>;
}

/// Strategy bundle handed to a sequence once per invocation. Hardware
/// drivers and test fakes both fit behind these capabilities.
pub struct SequenceIo {
    pub relays: Arc<dyn RelaySwitch>,
    pub syringe: Arc<dyn SyringeMotion>,
    pub valve: Arc<dyn PortSelect>,
    pub axes: Arc<dyn AxisPresets>,
    pub init: Arc<dyn InitStrategy>,
}

const RELAY_SETTLE_WAIT: Duration = Duration::from_secs(1);
const OPTIONAL_WAIT: Duration = Duration::from_secs(1);

/// MAF sampling / injection sequence (28 numbered steps; the air-push
/// block runs twice).
pub async fn run_maf_sampling(runner: &SequenceRunner, io: &SequenceIo) -> SequenceOutcome {
    runner.log("=== MAF sampling sequence start ===");
    match maf_sampling_body(runner, io).await {
        Ok(()) => {
            runner.log("=== MAF sampling sequence complete ===");
            SequenceOutcome::Completed
        }
        Err(SequenceAbort) => {
            runner.log("=== MAF sampling sequence aborted ===");
            SequenceOutcome::Aborted
        }
    }
}

async fn maf_sampling_body(r: &SequenceRunner, io: &SequenceIo) -> Result<(), SequenceAbort> {
    // 1. Initialization
    r.step("Step 1: Initialization", io.init.initialize()).await?;

    // 2-7: load and push MAF filter with relays 5 and 6
    r.step("Step 2: Relay 5 ON (load MAF filter)", io.relays.on(5)).await?;
    r.pause("Step 3: Wait after Relay 5 ON", RELAY_SETTLE_WAIT).await?;
    r.step("Step 4: Relay 5 OFF", io.relays.off(5)).await?;
    r.step("Step 5: Relay 6 ON (push MAF in position)", io.relays.on(6)).await?;
    r.pause("Step 6: Wait after Relay 6 ON", RELAY_SETTLE_WAIT).await?;
    r.step("Step 7: Relay 6 OFF", io.relays.off(6)).await?;

    // 8-9: move axes
    r.step(
        "Step 8: Horizontal axis to FILTERING position (below plate)",
        io.axes.horizontal_to_filtering(),
    )
    .await?;
    r.step("Step 9: Close plate (vertical axis)", io.axes.vertical_close()).await?;

    // 10-11: air 0.1 mL
    r.step("Step 10: Rotary Valve Port 4 (AIR)", io.valve.select_port(4)).await?;
    r.step(
        "Step 11: Syringe suck AIR to 0.1 mL",
        io.syringe.goto_absolute(0.1, 1.0),
    )
    .await?;

    // 12-13: sample 1.5 mL (total 1.6 mL)
    r.step("Step 12: Rotary Valve Port 2 (SAMPLE)", io.valve.select_port(2)).await?;
    r.step(
        "Step 13: Syringe suck SAMPLE to 1.5 mL (0.1 air + 1.5 sample)",
        io.syringe.goto_absolute(1.6, 1.0),
    )
    .await?;

    // 14-15: inject into MAF at reduced flow
    r.step("Step 14: Rotary Valve Port 5 (MAF)", io.valve.select_port(5)).await?;
    r.step(
        "Step 15: Syringe inject SAMPLE (to 0.0 mL)",
        io.syringe.goto_absolute(0.0, 0.2),
    )
    .await?;

    // 16-19: push additional 2.0 mL air through MAF
    air_push_block(r, io).await?;

    // 20-23: air + H2O plug (0.1 air + 1.2 H2O)
    r.step("Step 20: Rotary Valve Port 4 (AIR)", io.valve.select_port(4)).await?;
    r.step(
        "Step 21: Syringe suck AIR to 0.1 mL",
        io.syringe.goto_absolute(0.1, 1.0),
    )
    .await?;
    r.step("Step 22: Rotary Valve Port 3 (H2O)", io.valve.select_port(3)).await?;
    r.step(
        "Step 23: Syringe suck H2O to 1.3 mL (0.1 air + 1.2 H2O)",
        io.syringe.goto_absolute(1.3, 1.0),
    )
    .await?;

    // 24-26: inject plug through MAF with Valve 2 open
    r.step("Step 24: Rotary Valve Port 5 (MAF)", io.valve.select_port(5)).await?;
    r.step("Step 25: Relay 2 ON (Valve 2 OPEN)", io.relays.on(2)).await?;
    r.step(
        "Step 26: Syringe inject to 0.0 mL",
        io.syringe.goto_absolute(0.0, 1.0),
    )
    .await?;

    // Repeat 16-19 to push more air
    air_push_block(r, io).await?;

    // 27: re-run initialization (homes all axes)
    r.step("Step 27: Re-initialization / Homing", io.init.initialize()).await?;

    // 28: everything off
    r.step("Step 28: Turn ALL relays OFF", io.relays.all_off()).await?;

    Ok(())
}

async fn air_push_block(r: &SequenceRunner, io: &SequenceIo) -> Result<(), SequenceAbort> {
    r.step("Step 16: Rotary Valve Port 4 (AIR)", io.valve.select_port(4)).await?;
    r.step(
        "Step 17: Syringe suck AIR to 2.0 mL",
        io.syringe.goto_absolute(2.0, 2.0),
    )
    .await?;
    r.step("Step 18: Rotary Valve Port 5 (MAF)", io.valve.select_port(5)).await?;
    r.step(
        "Step 19: Syringe inject AIR (to 0.0 mL)",
        io.syringe.goto_absolute(0.0, 1.0),
    )
    .await?;
    Ok(())
}

/// Sequence 2: rinse/flush procedure (46 numbered steps; the port-3 cycle
/// runs twice with distinguishable suffixes).
pub async fn run_sequence_two(runner: &SequenceRunner, io: &SequenceIo) -> SequenceOutcome {
    runner.log("=== Sequence 2 start ===");
    match sequence_two_body(runner, io).await {
        Ok(()) => {
            runner.log("=== Sequence 2 complete ===");
            SequenceOutcome::Completed
        }
        Err(SequenceAbort) => {
            runner.log("=== Sequence 2 aborted ===");
            SequenceOutcome::Aborted
        }
    }
}

const SEQUENCE_TWO_FLOW_ML_MIN: f64 = 2.0;

async fn sequence_two_body(r: &SequenceRunner, io: &SequenceIo) -> Result<(), SequenceAbort> {
    let syringe = |target_ml: f64| io.syringe.goto_absolute(target_ml, SEQUENCE_TWO_FLOW_ML_MIN);

    // Initial axis positioning
    r.step("Step 1: Move X-Axis to FILTERING", io.axes.horizontal_to_filtering()).await?;
    r.step("Step 2: Close filter (vertical axis)", io.axes.vertical_close()).await?;

    // Main operations
    r.step("Step 3: Rotary Valve -> Port 3", io.valve.select_port(3)).await?;
    r.step("Step 4: Syringe -> 2.5 mL", syringe(2.5)).await?;

    r.step("Step 5: Rotary Valve -> Port 1", io.valve.select_port(1)).await?;
    r.step("Step 6: Syringe -> 0.0 mL", syringe(0.0)).await?;

    r.step("Step 7: Rotary Valve -> Port 3", io.valve.select_port(3)).await?;
    r.step("Step 8: Syringe -> 2.5 mL", syringe(2.5)).await?;

    r.step("Step 9: Rotary Valve -> Port 5", io.valve.select_port(5)).await?;
    r.step("Step 10: Syringe -> 0.0 mL", syringe(0.0)).await?;

    r.step("Step 11: Rotary Valve -> Port 4", io.valve.select_port(4)).await?;
    r.step("Step 12: Syringe -> 2.0 mL", syringe(2.0)).await?;

    r.step("Step 13: Rotary Valve -> Port 5", io.valve.select_port(5)).await?;
    r.step("Step 14: Syringe -> 0.0 mL", syringe(0.0)).await?;

    // Valve 1 flush block
    r.step("Step 15: Valve 1 ON", io.relays.on(1)).await?;
    r.step("Step 16: Syringe -> 2.5 mL", syringe(2.5)).await?;
    r.pause("Step 17: Optional wait", OPTIONAL_WAIT).await?;
    r.step("Step 18: Valve 1 OFF", io.relays.off(1)).await?;
    r.step("Step 19: Syringe -> 0.0 mL", syringe(0.0)).await?;

    r.step("Step 20: Rotary Valve -> Port 6", io.valve.select_port(6)).await?;
    r.step("Step 21: Syringe -> 2.5 mL", syringe(2.5)).await?;
    r.step("Step 22: Rotary Valve -> Port 1", io.valve.select_port(1)).await?;
    r.pause("Step 23: Optional wait", OPTIONAL_WAIT).await?;
    r.step("Step 24: Syringe -> 0.0 mL", syringe(0.0)).await?;

    // Repeated port-3 cycle
    for i in 0..2 {
        r.step(&format!("Step 25.{}: Rotary Valve -> Port 3", i), io.valve.select_port(3))
            .await?;
        r.step(&format!("Step 26.{}: Syringe -> 2.5 mL", i), syringe(2.5)).await?;
        r.step(&format!("Step 27.{}: Rotary Valve -> Port 5", i), io.valve.select_port(5))
            .await?;
        r.step(&format!("Step 28.{}: Syringe -> 0.0 mL", i), syringe(0.0)).await?;
    }

    // Final block via port 3
    r.step("Step 29: Rotary Valve -> Port 3", io.valve.select_port(3)).await?;
    r.step("Step 30: Syringe -> 1.0 mL", syringe(1.0)).await?;
    r.step("Step 31: Rotary Valve -> Port 5", io.valve.select_port(5)).await?;
    r.step("Step 32: Valve 2 ON", io.relays.on(2)).await?;
    r.step("Step 33: Syringe -> 0.0 mL", syringe(0.0)).await?;
    r.step("Step 34: Valve 2 OFF", io.relays.off(2)).await?;

    // Same block again via port 4
    r.step("Step 35: Rotary Valve -> Port 4", io.valve.select_port(4)).await?;
    r.step("Step 36: Syringe -> 2.5 mL", syringe(2.5)).await?;
    r.step("Step 37: Rotary Valve -> Port 5", io.valve.select_port(5)).await?;
    r.step("Step 38: Syringe -> 0.0 mL", syringe(0.0)).await?;

    r.step("Step 39: Rotary Valve -> Port 4", io.valve.select_port(4)).await?;
    r.step("Step 40: Syringe -> 1.0 mL", syringe(1.0)).await?;
    r.step("Step 41: Rotary Valve -> Port 5", io.valve.select_port(5)).await?;
    r.step("Step 42: Valve 2 ON", io.relays.on(2)).await?;
    r.step("Step 43: Syringe -> 0.0 mL", syringe(0.0)).await?;
    r.step("Step 44: Valve 2 OFF", io.relays.off(2)).await?;

    // Final positioning
    r.step("Step 45: Open filter", io.axes.vertical_open()).await?;
    r.step("Step 46: Move X-Axis HOME", io.axes.horizontal_home()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::engine::LogFn;
    use crate::utils::cancel::CancelToken;
    use std::sync::Mutex;

    struct AckRelays;
    #[async_trait]
    impl RelaySwitch for AckRelays {
        async fn on(&self, _channel: u8) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn off(&self, _channel: u8) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn all_off(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    struct AckSyringe {
        fail: bool,
    }
    #[async_trait]
    impl SyringeMotion for AckSyringe {
        async fn goto_absolute(&self, _volume_ml: f64, _flow_ml_min: f64) -> Result<(), DeviceError> {
            if self.fail {
                Err(DeviceError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    struct AckValve;
    #[async_trait]
    impl PortSelect for AckValve {
        async fn select_port(&self, _port: u8) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    struct AckAxes;
    #[async_trait]
    impl AxisPresets for AckAxes {
        async fn horizontal_to_filtering(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn horizontal_home(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn vertical_close(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn vertical_open(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    struct AckInit;
    #[async_trait]
    impl InitStrategy for AckInit {
        async fn initialize(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn ack_io(syringe_fails: bool) -> SequenceIo {
        SequenceIo {
            relays: Arc::new(AckRelays),
            syringe: Arc::new(AckSyringe { fail: syringe_fails }),
            valve: Arc::new(AckValve),
            axes: Arc::new(AckAxes),
            init: Arc::new(AckInit),
        }
    }

    fn collector() -> (LogFn, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let log: LogFn = Arc::new(move |msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
        });
        (log, lines)
    }

    fn step_labels(lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .filter(|line| line.starts_with("Step ") && !line.ends_with(" completed"))
            .cloned()
            .collect()
    }

    const MAF_EXPECTED_LABELS: [&str; 32] = [
        "Step 1: Initialization",
        "Step 2: Relay 5 ON (load MAF filter)",
        "Step 3: Wait after Relay 5 ON",
        "Step 4: Relay 5 OFF",
        "Step 5: Relay 6 ON (push MAF in position)",
        "Step 6: Wait after Relay 6 ON",
        "Step 7: Relay 6 OFF",
        "Step 8: Horizontal axis to FILTERING position (below plate)",
        "Step 9: Close plate (vertical axis)",
        "Step 10: Rotary Valve Port 4 (AIR)",
        "Step 11: Syringe suck AIR to 0.1 mL",
        "Step 12: Rotary Valve Port 2 (SAMPLE)",
        "Step 13: Syringe suck SAMPLE to 1.5 mL (0.1 air + 1.5 sample)",
        "Step 14: Rotary Valve Port 5 (MAF)",
        "Step 15: Syringe inject SAMPLE (to 0.0 mL)",
        "Step 16: Rotary Valve Port 4 (AIR)",
        "Step 17: Syringe suck AIR to 2.0 mL",
        "Step 18: Rotary Valve Port 5 (MAF)",
        "Step 19: Syringe inject AIR (to 0.0 mL)",
        "Step 20: Rotary Valve Port 4 (AIR)",
        "Step 21: Syringe suck AIR to 0.1 mL",
        "Step 22: Rotary Valve Port 3 (H2O)",
        "Step 23: Syringe suck H2O to 1.3 mL (0.1 air + 1.2 H2O)",
        "Step 24: Rotary Valve Port 5 (MAF)",
        "Step 25: Relay 2 ON (Valve 2 OPEN)",
        "Step 26: Syringe inject to 0.0 mL",
        "Step 16: Rotary Valve Port 4 (AIR)",
        "Step 17: Syringe suck AIR to 2.0 mL",
        "Step 18: Rotary Valve Port 5 (MAF)",
        "Step 19: Syringe inject AIR (to 0.0 mL)",
        "Step 27: Re-initialization / Homing",
        "Step 28: Turn ALL relays OFF",
    ];

    #[tokio::test(start_paused = true)]
    async fn maf_sampling_emits_documented_step_order() {
        let (log, lines) = collector();
        let runner = SequenceRunner::new("MAF sampling sequence", CancelToken::new(), log);
        let outcome = run_maf_sampling(&runner, &ack_io(false)).await;
        assert_eq!(outcome, SequenceOutcome::Completed);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.first().unwrap(), "=== MAF sampling sequence start ===");
        assert_eq!(lines.last().unwrap(), "=== MAF sampling sequence complete ===");

        let labels = step_labels(&lines);
        assert_eq!(labels, MAF_EXPECTED_LABELS);

        let mut distinct = labels.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 28);

        // every label is followed by its completion entry
        for label in &labels {
            assert!(
                lines.iter().any(|line| line == &format!("{} completed", label)),
                "missing completion for {}",
                label
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_two_emits_forty_six_numbered_steps() {
        let (log, lines) = collector();
        let runner = SequenceRunner::new("Sequence 2", CancelToken::new(), log);
        let outcome = run_sequence_two(&runner, &ack_io(false)).await;
        assert_eq!(outcome, SequenceOutcome::Completed);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.first().unwrap(), "=== Sequence 2 start ===");
        assert_eq!(lines.last().unwrap(), "=== Sequence 2 complete ===");

        let labels = step_labels(&lines);
        // 46 numbered steps; the repeated cycle contributes four extra entries
        assert_eq!(labels.len(), 50);
        let mut numbers: Vec<String> = labels
            .iter()
            .map(|label| {
                label
                    .trim_start_matches("Step ")
                    .split(&[':', '.'][..])
                    .next()
                    .unwrap()
                    .to_string()
            })
            .collect();
        numbers.sort();
        numbers.dedup();
        assert_eq!(numbers.len(), 46);

        // the repeated block is distinguishable by its suffixes
        for base in [25, 26, 27, 28] {
            for suffix in [0, 1] {
                assert!(
                    labels
                        .iter()
                        .any(|label| label.starts_with(&format!("Step {}.{}:", base, suffix))),
                    "missing Step {}.{}",
                    base,
                    suffix
                );
            }
        }
        assert_eq!(labels[0], "Step 1: Move X-Axis to FILTERING");
        assert_eq!(labels[49], "Step 46: Move X-Axis HOME");
    }

    #[tokio::test(start_paused = true)]
    async fn syringe_failures_do_not_abort_the_sequence() {
        let (log, lines) = collector();
        let runner = SequenceRunner::new("MAF sampling sequence", CancelToken::new(), log);
        let outcome = run_maf_sampling(&runner, &ack_io(true)).await;
        assert_eq!(outcome, SequenceOutcome::Completed);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.last().unwrap(), "=== MAF sampling sequence complete ===");
        assert!(lines.iter().any(|line| line.starts_with("[WARN]")));
        assert_eq!(step_labels(&lines).len(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_step_ten_aborts_with_banner() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let stop = CancelToken::new();

        let sink = Arc::clone(&lines);
        let canceller = stop.clone();
        let log: LogFn = Arc::new(move |msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
            // Operator hits STOP while step 10 is in progress.
            if msg == "Step 10: Rotary Valve Port 4 (AIR)" {
                canceller.cancel();
            }
        });

        let runner = SequenceRunner::new("MAF sampling sequence", stop, log);
        let outcome = run_maf_sampling(&runner, &ack_io(false)).await;
        assert_eq!(outcome, SequenceOutcome::Aborted);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.last().unwrap(), "=== MAF sampling sequence aborted ===");
        let labels = step_labels(&lines);
        assert_eq!(labels.len(), 10);
        assert_eq!(labels.last().unwrap(), "Step 10: Rotary Valve Port 4 (AIR)");
    }

    #[test]
    fn sequence_names_resolve() {
        assert_eq!(resolve("MAF"), Some(MAF_SAMPLING));
        assert_eq!(resolve("sequence_2"), Some(SEQUENCE_TWO));
        assert_eq!(resolve("Sequence2"), Some(SEQUENCE_TWO));
        assert_eq!(resolve("unknown"), None);
    }
}
