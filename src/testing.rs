//! In-memory doubles for the environment and id generator.
//!
//! `FakeEnvironment` understands just enough Python-flavoured `print(...)`
//! to make scenario tests readable, and reports every call to a shared
//! [`Probe`].

use crate::environment::{
    EnvironmentError, EnvironmentFactory, ExecutionEnvironment, ExecutionOutput, Language,
};
use crate::id::{IdGenerator, SessionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    runs: AtomicUsize,
    runs_completed: AtomicUsize,
    closes: AtomicUsize,
    active_runs: AtomicUsize,
    max_concurrent_runs: AtomicUsize,
    close_overlapped_run: AtomicBool,
    last_libraries: Mutex<Vec<String>>,
}

/// Shared call counters for every environment a factory hands out.
#[derive(Clone, Default)]
pub struct Probe(Arc<Counters>);

impl Probe {
    pub fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.0.runs.load(Ordering::SeqCst)
    }

    pub fn runs_completed(&self) -> usize {
        self.0.runs_completed.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    pub fn active_runs(&self) -> usize {
        self.0.active_runs.load(Ordering::SeqCst)
    }

    /// Highest number of `run` calls observed inside the environment at once.
    pub fn max_concurrent_runs(&self) -> usize {
        self.0.max_concurrent_runs.load(Ordering::SeqCst)
    }

    /// Whether any `close` arrived while a `run` was still executing.
    pub fn close_overlapped_run(&self) -> bool {
        self.0.close_overlapped_run.load(Ordering::SeqCst)
    }

    pub fn last_libraries(&self) -> Vec<String> {
        self.0
            .last_libraries
            .lock()
            .map(|libs| libs.clone())
            .unwrap_or_default()
    }

    fn enter_run(&self) {
        self.0.runs.fetch_add(1, Ordering::SeqCst);
        let active = self.0.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_concurrent_runs.fetch_max(active, Ordering::SeqCst);
    }

    fn leave_run(&self, completed: bool) {
        if completed {
            self.0.runs_completed.fetch_add(1, Ordering::SeqCst);
        }
        self.0.active_runs.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
struct Behavior {
    fail_open: bool,
    fail_run: bool,
    panic_in_run: bool,
    fail_close: bool,
    open_delay: Duration,
    run_delay: Duration,
}

pub struct FakeEnvironment {
    probe: Probe,
    behavior: Behavior,
    language: Language,
    open: bool,
}

impl FakeEnvironment {
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            behavior: Behavior::default(),
            language: Language::Python,
            open: false,
        }
    }
}

impl ExecutionEnvironment for FakeEnvironment {
    fn open(&mut self) -> Result<(), EnvironmentError> {
        self.probe.0.opens.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.open_delay.is_zero() {
            std::thread::sleep(self.behavior.open_delay);
        }
        if self.open {
            return Err(EnvironmentError::AlreadyOpen);
        }
        if self.behavior.fail_open {
            return Err(EnvironmentError::Sandbox(format!(
                "cannot prepare {} runtime",
                self.language
            )));
        }
        self.open = true;
        Ok(())
    }

    fn run(
        &mut self,
        code: &str,
        libraries: &[String],
    ) -> Result<ExecutionOutput, EnvironmentError> {
        if !self.open {
            return Err(EnvironmentError::NotOpen);
        }
        self.probe.enter_run();
        if let Ok(mut last) = self.probe.0.last_libraries.lock() {
            *last = libraries.to_vec();
        }
        if !self.behavior.run_delay.is_zero() {
            std::thread::sleep(self.behavior.run_delay);
        }
        if self.behavior.panic_in_run {
            self.probe.leave_run(false);
            panic!("fake environment crashed");
        }
        if self.behavior.fail_run {
            self.probe.leave_run(false);
            return Err(EnvironmentError::Sandbox("runtime went away".to_string()));
        }
        let output = interpret(code);
        self.probe.leave_run(true);
        Ok(output)
    }

    fn close(&mut self) -> Result<(), EnvironmentError> {
        self.probe.0.closes.fetch_add(1, Ordering::SeqCst);
        if self.probe.active_runs() > 0 {
            self.probe.0.close_overlapped_run.store(true, Ordering::SeqCst);
        }
        self.open = false;
        if self.behavior.fail_close {
            return Err(EnvironmentError::Sandbox("teardown failed".to_string()));
        }
        Ok(())
    }
}

/// Hands out [`FakeEnvironment`]s that all report to one probe.
#[derive(Clone)]
pub struct FakeEnvironmentFactory {
    probe: Probe,
    behavior: Behavior,
}

impl FakeEnvironmentFactory {
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            behavior: Behavior::default(),
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.behavior.fail_open = true;
        self
    }

    pub fn failing_run(mut self) -> Self {
        self.behavior.fail_run = true;
        self
    }

    pub fn panicking_run(mut self) -> Self {
        self.behavior.panic_in_run = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.behavior.fail_close = true;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.behavior.open_delay = delay;
        self
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.behavior.run_delay = delay;
        self
    }
}

impl EnvironmentFactory for FakeEnvironmentFactory {
    fn create(&self, language: Language, _keep_template: bool) -> Box<dyn ExecutionEnvironment> {
        Box::new(FakeEnvironment {
            probe: self.probe.clone(),
            behavior: self.behavior.clone(),
            language,
            open: false,
        })
    }
}

fn interpret(code: &str) -> ExecutionOutput {
    let mut stdout = String::new();
    for (index, line) in code.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(arg) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) else {
            return failure(stdout, index, "SyntaxError: invalid syntax".to_string());
        };
        match evaluate(arg.trim()) {
            Ok(value) => {
                stdout.push_str(&value);
                stdout.push('\n');
            }
            Err(message) => return failure(stdout, index, message),
        }
    }
    ExecutionOutput {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    }
}

fn evaluate(expr: &str) -> Result<String, String> {
    for quote in ['\'', '"'] {
        if let Some(text) = expr.strip_prefix(quote).and_then(|e| e.strip_suffix(quote)) {
            return Ok(text.to_string());
        }
    }
    if let Ok(n) = expr.parse::<i64>() {
        return Ok(n.to_string());
    }
    for op in ['+', '-', '*'] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            if let (Ok(a), Ok(b)) = (lhs.trim().parse::<i64>(), rhs.trim().parse::<i64>()) {
                let value = match op {
                    '+' => a + b,
                    '-' => a - b,
                    _ => a * b,
                };
                return Ok(value.to_string());
            }
        }
    }
    Err(format!("NameError: name '{}' is not defined", expr))
}

fn failure(stdout: String, index: usize, message: String) -> ExecutionOutput {
    ExecutionOutput {
        stdout,
        stderr: format!(
            "Traceback (most recent call last):\n  File \"<string>\", line {}, in <module>\n{}\n",
            index + 1,
            message
        ),
        exit_code: 1,
    }
}

/// Deterministic ids: scripted values first, then `session-1`, `session-2`, ...
#[derive(Default)]
pub struct SequentialIds {
    scripted: Mutex<VecDeque<String>>,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn scripted<S: Into<String>>(ids: Vec<S>) -> Self {
        Self {
            scripted: Mutex::new(ids.into_iter().map(Into::into).collect()),
            next: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn generate(&self) -> SessionId {
        if let Some(id) = self.scripted.lock().ok().and_then(|mut ids| ids.pop_front()) {
            return SessionId::new(id);
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        SessionId::new(format!("session-{}", n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interprets_prints() {
        let out = interpret("print(1+1)\nprint('hi')");
        assert_eq!(out.stdout, "2\nhi\n");
        assert_eq!(out.exit_code, 0);

        let out = interpret("print(undefined_name)");
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.ends_with("NameError: name 'undefined_name' is not defined\n"));
    }

    #[test]
    fn sequential_ids_follow_script() {
        let ids = SequentialIds::scripted(vec!["x"]);
        assert_eq!(ids.generate().as_str(), "x");
        assert_eq!(ids.generate().as_str(), "session-1");
        assert_eq!(ids.generate().as_str(), "session-2");
    }
}
