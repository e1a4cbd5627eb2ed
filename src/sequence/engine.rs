use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::cancel::CancelToken;
use crate::utils::error::DeviceError;

/// Floor applied to every post-step wait, even when a smaller wait is
/// requested. Gives valves and relays time to physically settle between
/// consecutive commands.
pub const MIN_STEP_DELAY: Duration = Duration::from_millis(500);

/// How a sequence ended. Callers distinguish a user stop from any other
/// abort via the stop token they own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    Completed,
    Aborted,
}

/// Internal unwind signal. Raised by the stop flag, the before-step
/// observer or an interrupted wait, and caught exactly once at the top of
/// each sequence.
#[derive(Debug)]
pub(crate) struct SequenceAbort;

pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;
/// Progress observer invoked with each step label before the step runs.
/// Returning `false` aborts the sequence.
pub type StepObserverFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Step-execution primitive shared by every fluidic procedure.
///
/// Per step: publish the label to the observer, check the cooperative
/// stop flag, log and run the action, then sleep interruptibly. A failed
/// action logs a warning and the sequence continues; only the stop flag
/// or the observer unwind it.
pub struct SequenceRunner {
    name: String,
    stop: CancelToken,
    log: LogFn,
    before_step: Option<StepObserverFn>,
}

impl SequenceRunner {
    pub fn new(name: &str, stop: CancelToken, log: LogFn) -> Self {
        Self {
            name: name.to_string(),
            stop,
            log,
            before_step: None,
        }
    }

    pub fn with_observer(mut self, observer: StepObserverFn) -> Self {
        self.before_step = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, message: &str) {
        (self.log)(message);
    }

    /// Run a step with the default post-step wait.
    pub(crate) async fn step<F>(&self, label: &str, action: F) -> Result<(), SequenceAbort>
    where
        F: Future<Output = Result<(), DeviceError>> + Send,
    {
        self.exec(label, Some(action), MIN_STEP_DELAY).await
    }

    /// Run a step with a custom post-step wait (still floored).
    pub(crate) async fn step_with_wait<F>(
        &self,
        label: &str,
        action: F,
        wait_after: Duration,
    ) -> Result<(), SequenceAbort>
    where
        F: Future<Output = Result<(), DeviceError>> + Send,
    {
        self.exec(label, Some(action), wait_after).await
    }

    /// A pure wait step with no hardware action.
    pub(crate) async fn pause(&self, label: &str, wait_after: Duration) -> Result<(), SequenceAbort> {
        self.exec(
            label,
            None::<std::future::Ready<Result<(), DeviceError>>>,
            wait_after,
        )
        .await
    }

    async fn exec<F>(
        &self,
        label: &str,
        action: Option<F>,
        wait_after: Duration,
    ) -> Result<(), SequenceAbort>
    where
        F: Future<Output = Result<(), DeviceError>> + Send,
    {
        if let Some(observer) = &self.before_step {
            if !observer(label) {
                return Err(SequenceAbort);
            }
        }

        if self.stop.is_cancelled() {
            self.log(&format!("[INFO] {} aborted by STOP.", self.name));
            return Err(SequenceAbort);
        }

        self.log(label);
        let mut ok = true;
        if let Some(action) = action {
            if let Err(err) = action.await {
                ok = false;
                self.log(&format!("[WARN] {} failed: {}", label, err));
            }
        }
        if ok {
            self.log(&format!("{} completed", label));
        }

        self.wait_block(wait_after.max(MIN_STEP_DELAY)).await
    }

    /// Interruptible wait: wakes immediately when the stop flag is raised.
    async fn wait_block(&self, duration: Duration) -> Result<(), SequenceAbort> {
        if duration.is_zero() {
            return Ok(());
        }
        if self.stop.sleep(duration).await {
            Ok(())
        } else {
            Err(SequenceAbort)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn collector() -> (LogFn, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let log: LogFn = Arc::new(move |msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
        });
        (log, lines)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_action_logs_warning_and_continues() {
        let (log, lines) = collector();
        let runner = SequenceRunner::new("Test sequence", CancelToken::new(), log);
        runner
            .step("Step 1: Breaks", async {
                Err(DeviceError::Timeout)
            })
            .await
            .unwrap();
        runner.step("Step 2: Works", async { Ok(()) }).await.unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "Step 1: Breaks");
        assert!(lines[1].starts_with("[WARN] Step 1: Breaks failed"));
        assert_eq!(lines[2], "Step 2: Works");
        assert_eq!(lines[3], "Step 2: Works completed");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_aborts_before_running_the_action() {
        let (log, lines) = collector();
        let stop = CancelToken::new();
        stop.cancel();
        let runner = SequenceRunner::new("Test sequence", stop, log);
        let ran = Arc::new(Mutex::new(false));
        let ran_in_action = Arc::clone(&ran);
        let result = runner
            .step("Step 1: Never runs", async move {
                *ran_in_action.lock().unwrap() = true;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(!*ran.lock().unwrap());
        assert!(lines.lock().unwrap()[0].contains("aborted by STOP"));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_abort_unwinds_without_logging_the_label() {
        let (log, lines) = collector();
        let runner = SequenceRunner::new("Test sequence", CancelToken::new(), log)
            .with_observer(Arc::new(|_label| false));
        assert!(runner.step("Step 1: Skipped", async { Ok(()) }).await.is_err());
        assert!(lines.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_wait_floor_is_enforced() {
        let (log, _lines) = collector();
        let runner = SequenceRunner::new("Test sequence", CancelToken::new(), log);
        let started = Instant::now();
        runner
            .step_with_wait("Step 1: Fast", async { Ok(()) }, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(started.elapsed() >= MIN_STEP_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_interrupted_by_stop() {
        let (log, _lines) = collector();
        let stop = CancelToken::new();
        let runner = SequenceRunner::new("Test sequence", stop.clone(), log);
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result = runner.pause("Step 1: Long wait", Duration::from_secs(3600)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
