//! Circuit breaker guarding against runaway or stuck agent behavior.
//!
//! Four trigger kinds are watched on the output stream: inactivity, repeated
//! errors, cumulative output size, and task stagnation. Every trigger draws
//! from one shared attempts budget; once the budget is exhausted the breaker
//! opens and all detection becomes a no-op until `reset()`.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;
use crate::state::Phase;

/// Capacity of the error-fingerprint ring. Counts slide with the ring, so a
/// fingerprint must recur within the last 10 error lines to accumulate.
const ERROR_RING_CAPACITY: usize = 10;

/// Raw output lines retained for test-command detection.
const RECENT_OUTPUT_LINES: usize = 50;

/// Context-aware inactivity windows, in seconds.
const TEST_COMMAND_INACTIVITY_SECS: u64 = 300;
const PR_PHASE_INACTIVITY_SECS: u64 = 120;
const QA_PHASE_INACTIVITY_SECS: u64 = 180;

const ERROR_MARKERS: [&str; 6] = [
    "error:",
    "exception:",
    "traceback",
    "failed",
    "fatal:",
    "panic:",
];

const COMPLETION_MARKERS: [&str; 5] = ["completed", "done", "finished", "success", "passed"];
const COMPLETION_GLYPHS: [&str; 4] = ["✓", "✔", "[x]", "[X]"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Inactivity,
    RepeatedError,
    TaskStagnation,
    OutputSize,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Inactivity => "inactivity",
            TriggerKind::RepeatedError => "repeated_error",
            TriggerKind::TaskStagnation => "task_stagnation",
            TriggerKind::OutputSize => "output_size",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    }
}

/// Execution context the breaker adapts to: phase-specific inactivity
/// windows, and task stagnation only for the implementation agent.
#[derive(Debug, Clone)]
pub struct BreakerContext {
    pub phase: Phase,
    pub is_dev_agent: bool,
    pub test_command: Option<String>,
}

impl BreakerContext {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            is_dev_agent: false,
            test_command: None,
        }
    }
}

pub type WarningHook = Box<dyn Fn(TriggerKind, u32) + Send + Sync>;
pub type TripHook = Box<dyn Fn(TriggerKind) + Send + Sync>;

struct Inner {
    state: BreakerState,
    attempts: u32,
    last_trigger: Option<TriggerKind>,
    last_output: Instant,
    last_task_completion: Instant,
    total_output_bytes: u64,
    error_ring: VecDeque<String>,
    error_counts: HashMap<String, u32>,
    recent_output: VecDeque<String>,
}

impl Inner {
    fn fresh() -> Self {
        let now = Instant::now();
        Self {
            state: BreakerState::Closed,
            attempts: 0,
            last_trigger: None,
            last_output: now,
            last_task_completion: now,
            total_output_bytes: 0,
            error_ring: VecDeque::with_capacity(ERROR_RING_CAPACITY),
            error_counts: HashMap::new(),
            recent_output: VecDeque::with_capacity(RECENT_OUTPUT_LINES),
        }
    }
}

/// Outcome captured under the lock; callbacks fire after it is released.
struct Fired {
    kind: TriggerKind,
    attempts: u32,
    is_open: bool,
}

/// Thread-safe detector over a single execution attempt's output stream.
///
/// All mutation happens under one mutex. The `on_warning` and `on_trip`
/// hooks are invoked strictly after the lock is released so a hook may
/// re-enter the breaker without deadlocking.
pub struct CircuitBreaker {
    config: BreakerConfig,
    context: BreakerContext,
    on_warning: Option<WarningHook>,
    on_trip: Option<TripHook>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, context: BreakerContext) -> Self {
        Self {
            config,
            context,
            on_warning: None,
            on_trip: None,
            inner: Mutex::new(Inner::fresh()),
        }
    }

    pub fn with_hooks(
        config: BreakerConfig,
        context: BreakerContext,
        on_warning: Option<WarningHook>,
        on_trip: Option<TripHook>,
    ) -> Self {
        Self {
            config,
            context,
            on_warning,
            on_trip,
            inner: Mutex::new(Inner::fresh()),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").attempts
    }

    pub fn last_trigger(&self) -> Option<TriggerKind> {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .last_trigger
    }

    /// Clear all counters and timers, closing the breaker.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        *inner = Inner::fresh();
    }

    /// Record one output line. Returns the trigger kind if this line tripped
    /// the breaker open.
    pub fn record_output(&self, line: &str) -> Option<TriggerKind> {
        if !self.config.enabled {
            return None;
        }
        let fired = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            if inner.state == BreakerState::Open {
                return None;
            }
            inner.last_output = Instant::now();
            inner.total_output_bytes += line.len() as u64;

            if inner.recent_output.len() == RECENT_OUTPUT_LINES {
                inner.recent_output.pop_front();
            }
            inner.recent_output.push_back(line.to_string());

            if is_task_completion(line) {
                inner.last_task_completion = Instant::now();
            }

            if inner.total_output_bytes > self.config.max_output_size {
                Some(self.fire(&mut inner, TriggerKind::OutputSize))
            } else if let Some(fingerprint) = error_fingerprint(line) {
                self.record_error(&mut inner, fingerprint)
            } else {
                None
            }
        };
        self.notify(fired)
    }

    /// Check elapsed time since the last output line against the effective
    /// inactivity window.
    pub fn check_inactivity(&self) -> Option<TriggerKind> {
        if !self.config.enabled {
            return None;
        }
        let fired = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            if inner.state == BreakerState::Open {
                return None;
            }
            let timeout = self.effective_inactivity_timeout(&inner);
            if inner.last_output.elapsed() > timeout {
                Some(self.fire(&mut inner, TriggerKind::Inactivity))
            } else {
                None
            }
        };
        self.notify(fired)
    }

    /// Check elapsed time since the last detected task completion.
    /// Only the implementation agent is subject to stagnation.
    pub fn check_task_stagnation(&self) -> Option<TriggerKind> {
        if !self.config.enabled || !self.context.is_dev_agent {
            return None;
        }
        let fired = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            if inner.state == BreakerState::Open {
                return None;
            }
            let timeout = Duration::from_secs(self.config.task_stagnation_timeout);
            if inner.last_task_completion.elapsed() > timeout {
                Some(self.fire(&mut inner, TriggerKind::TaskStagnation))
            } else {
                None
            }
        };
        self.notify(fired)
    }

    /// Effective inactivity window, in priority order: a configured test
    /// command seen in recent output, then PR phase, then QA phase, then the
    /// configured default.
    fn effective_inactivity_timeout(&self, inner: &Inner) -> Duration {
        if let Some(test_command) = &self.context.test_command {
            if inner
                .recent_output
                .iter()
                .any(|line| line.contains(test_command.as_str()))
            {
                return Duration::from_secs(TEST_COMMAND_INACTIVITY_SECS);
            }
        }
        match self.context.phase {
            Phase::Pr => Duration::from_secs(PR_PHASE_INACTIVITY_SECS),
            Phase::Qa => Duration::from_secs(QA_PHASE_INACTIVITY_SECS),
            _ => Duration::from_secs(self.config.inactivity_timeout),
        }
    }

    /// Sliding-window repeated-error count: when the ring is full the oldest
    /// fingerprint's count is decremented (and dropped at zero) before the
    /// new one is inserted.
    fn record_error(&self, inner: &mut Inner, fingerprint: String) -> Option<Fired> {
        if inner.error_ring.len() == ERROR_RING_CAPACITY {
            if let Some(oldest) = inner.error_ring.pop_front() {
                if let Some(count) = inner.error_counts.get_mut(&oldest) {
                    *count -= 1;
                    if *count == 0 {
                        inner.error_counts.remove(&oldest);
                    }
                }
            }
        }
        inner.error_ring.push_back(fingerprint.clone());
        let count = inner.error_counts.entry(fingerprint).or_insert(0);
        *count += 1;
        if *count >= self.config.max_repeated_errors {
            Some(self.fire(inner, TriggerKind::RepeatedError))
        } else {
            None
        }
    }

    /// Consume one unit of the shared attempts budget. Opens the breaker
    /// once attempts reach the configured maximum.
    fn fire(&self, inner: &mut Inner, kind: TriggerKind) -> Fired {
        inner.attempts += 1;
        inner.last_trigger = Some(kind);
        let is_open = inner.attempts >= self.config.max_attempts;
        if is_open {
            inner.state = BreakerState::Open;
        }
        Fired {
            kind,
            attempts: inner.attempts,
            is_open,
        }
    }

    /// Invoke hooks outside the lock. Returns the trigger only when the
    /// breaker just opened; warnings return None.
    fn notify(&self, fired: Option<Fired>) -> Option<TriggerKind> {
        let fired = fired?;
        if fired.is_open {
            if let Some(hook) = &self.on_trip {
                hook(fired.kind);
            }
            Some(fired.kind)
        } else {
            if let Some(hook) = &self.on_warning {
                hook(fired.kind, fired.attempts);
            }
            None
        }
    }
}

fn is_task_completion(line: &str) -> bool {
    let lower = line.to_lowercase();
    COMPLETION_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
        || COMPLETION_GLYPHS.iter().any(|glyph| line.contains(glyph))
}

/// Fingerprint for error lines: a hash over the first 200 characters, so the
/// same error with differing tails still counts as repeated.
fn error_fingerprint(line: &str) -> Option<String> {
    let lower = line.to_lowercase();
    if !ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return None;
    }
    let head: String = line.chars().take(200).collect();
    let mut hasher = Sha256::new();
    hasher.update(head.trim().as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}
