//! Reusable callback fixtures.
//!
//! - [`ScriptedRewind`] requests rewinds at predetermined steps and logs
//!   the replay hooks it receives.
//! - [`RecordingCallback`] records every step it runs in, with the input
//!   it saw, and echoes the step back as its output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tether_core::{InternalStep, RewindCallback, SimCallback, StepInfo};

/// Rewinds to `target` when `trigger` completes, once per script entry.
///
/// The log records `"pre N first"`, `"pre N"` and `"post N"` for each
/// replayed step `N`.
pub struct ScriptedRewind {
    script: VecDeque<(InternalStep, InternalStep)>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRewind {
    pub fn new(script: impl IntoIterator<Item = (InternalStep, InternalStep)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    fn record(&self, line: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(line);
        }
    }
}

impl RewindCallback for ScriptedRewind {
    fn trigger_rewind_if_needed(&mut self, last_step: InternalStep) -> Option<InternalStep> {
        let (trigger, target) = *self.script.front()?;
        if trigger != last_step {
            return None;
        }
        self.script.pop_front();
        Some(target)
    }

    fn pre_resim_step(&mut self, step: InternalStep, first: bool) {
        if first {
            self.record(format!("pre {} first", step.0));
        } else {
            self.record(format!("pre {}", step.0));
        }
    }

    fn post_resim_step(&mut self, step: InternalStep) {
        self.record(format!("post {}", step.0));
    }
}

/// Shared record of what a [`RecordingCallback`] observed.
pub type Observations<I> = Arc<Mutex<Vec<(StepInfo, Option<I>)>>>;

/// Records each step and its input; outputs the step's [`StepInfo`].
pub struct RecordingCallback<I> {
    seen: Observations<I>,
    removed: Arc<AtomicBool>,
}

impl<I> RecordingCallback<I> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            removed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn observations(&self) -> Observations<I> {
        Arc::clone(&self.seen)
    }

    /// Set once `on_removed` has run.
    pub fn removed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.removed)
    }
}

impl<I> Default for RecordingCallback<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Clone + Send + Sync + 'static> SimCallback for RecordingCallback<I> {
    type Input = I;
    type Output = StepInfo;

    fn pre_simulate(&mut self, step: &StepInfo, input: Option<&I>) -> Option<StepInfo> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((*step, input.cloned()));
        }
        Some(*step)
    }

    fn on_removed(&mut self) {
        self.removed.store(true, Ordering::Release);
    }
}
