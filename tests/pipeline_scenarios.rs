//! End-to-end pipeline scenarios with scripted collaborators.
//!
//! The adapter, executor and analyst are replaced by deterministic mocks so
//! each scenario controls exactly what every attempt does. One test drives
//! the real process sandbox with `sh` scripts.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use automl_forge::adapter::{AdaptContext, AdapterError, AlgorithmType, CodeAdapter, SchemaContext};
use automl_forge::analysis::{DescriptorAnalyst, FailureAnalysis, FailureAnalyst, FixType, QuickFix};
use automl_forge::classifier::{AttemptOutcome, FailureDescriptor};
use automl_forge::pipeline::{
    EventStatus, PipelineConfig, PipelineOrchestrator, PipelineRequest, PipelineRun, StreamEvent,
    TerminalState,
};
use automl_forge::registry::{FsModelRegistry, ModelRegistry};
use automl_forge::report::{REPORT_BEGIN, REPORT_END};
use automl_forge::runner::{
    ExecutionOutput, ProcessSandbox, SandboxConfig, SandboxError, ScriptExecutor, ScriptJob,
};

const REPORT_JSON: &str = r#"{"model_type": "linear_regression", "metrics": {"r2": 0.87, "mse": 3.2}, "features": ["rooms", "area"], "target": "price"}"#;

/// What one scripted execution does.
#[derive(Debug, Clone)]
enum Step {
    Runtime,
    NoReport,
    Timeout,
    Success,
    /// Prints progress lines, then succeeds.
    Chatty(Vec<&'static str>),
    /// Blocks until the run is cancelled.
    Hang,
}

fn report_stdout() -> String {
    format!("Training...\n{}\n{}\n{}\n", REPORT_BEGIN, REPORT_JSON, REPORT_END)
}

struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    codes: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            codes: Mutex::new(Vec::new()),
        }
    }

    fn executed_codes(&self) -> Vec<String> {
        self.codes.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ScriptExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &ScriptJob,
        cancel: &CancellationToken,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ExecutionOutput, SandboxError> {
        self.codes.lock().expect("lock").push(job.code.clone());
        let step = self
            .steps
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Step::Runtime);

        let output = match step {
            Step::Runtime => ExecutionOutput {
                exit_code: Some(1),
                stderr: "Traceback (most recent call last):\n  File \"pipeline.py\", line 3, in <module>\nValueError: could not convert string to float: 'n/a'\n".to_string(),
                ..Default::default()
            },
            Step::NoReport => ExecutionOutput {
                exit_code: Some(0),
                stdout: "Model trained\n".to_string(),
                ..Default::default()
            },
            Step::Timeout => ExecutionOutput {
                exit_code: None,
                stdout: "epoch 1\n".to_string(),
                timed_out: true,
                ..Default::default()
            },
            Step::Success => ExecutionOutput {
                exit_code: Some(0),
                stdout: report_stdout(),
                ..Default::default()
            },
            Step::Chatty(progress) => {
                if let Some(tx) = lines {
                    for line in &progress {
                        tx.send(line.to_string()).await.expect("line receiver");
                    }
                }
                let mut stdout: String = progress.iter().map(|l| format!("{}\n", l)).collect();
                stdout.push_str(&report_stdout());
                ExecutionOutput {
                    exit_code: Some(0),
                    stdout,
                    ..Default::default()
                }
            }
            Step::Hang => {
                cancel.cancelled().await;
                return Err(SandboxError::Cancelled);
            }
        };
        Ok(output)
    }
}

/// Adapter returning numbered scripts, optionally failing on one call.
struct CountingAdapter {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
    contexts: Mutex<Vec<AdaptContext>>,
}

impl CountingAdapter {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeAdapter for CountingAdapter {
    async fn adapt(&self, context: &AdaptContext) -> Result<String, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.contexts.lock().expect("lock").push(context.clone());
        if self.fail_on_call == Some(call) {
            return Err(AdapterError::EmptyCode);
        }
        Ok(format!("# script v{}\nprint('training')\n", call))
    }
}

/// Analyst that always proposes importing numpy.
struct NumpyAnalyst;

#[async_trait]
impl FailureAnalyst for NumpyAnalyst {
    async fn analyze(
        &self,
        _code: &str,
        _failure: &FailureDescriptor,
        _stderr: &str,
        _objective: Option<&str>,
    ) -> FailureAnalysis {
        FailureAnalysis {
            summary: "numpy is used but never imported".to_string(),
            fix_type: FixType::QuickFix,
            quick_fix: Some(QuickFix {
                action: "add_import".to_string(),
                library: "numpy".to_string(),
                alias: None,
            }),
        }
    }
}

/// Analyst whose summaries run far past any sensible length.
struct VerboseAnalyst;

#[async_trait]
impl FailureAnalyst for VerboseAnalyst {
    async fn analyze(
        &self,
        _code: &str,
        _failure: &FailureDescriptor,
        _stderr: &str,
        _objective: Option<&str>,
    ) -> FailureAnalysis {
        FailureAnalysis {
            summary: "the target column holds strings ".repeat(200),
            fix_type: FixType::FullRepair,
            quick_fix: None,
        }
    }
}

/// Adds a fixed delay in front of every adapter, executor and analyst call.
struct Slow<T> {
    inner: T,
    delay: Duration,
}

#[async_trait]
impl CodeAdapter for Slow<CountingAdapter> {
    async fn adapt(&self, context: &AdaptContext) -> Result<String, AdapterError> {
        tokio::time::sleep(self.delay).await;
        self.inner.adapt(context).await
    }
}

#[async_trait]
impl ScriptExecutor for Slow<ScriptedExecutor> {
    async fn execute(
        &self,
        job: &ScriptJob,
        cancel: &CancellationToken,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ExecutionOutput, SandboxError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(job, cancel, lines).await
    }
}

#[async_trait]
impl FailureAnalyst for Slow<DescriptorAnalyst> {
    async fn analyze(
        &self,
        code: &str,
        failure: &FailureDescriptor,
        stderr: &str,
        objective: Option<&str>,
    ) -> FailureAnalysis {
        tokio::time::sleep(self.delay).await;
        self.inner.analyze(code, failure, stderr, objective).await
    }
}

fn schema() -> SchemaContext {
    serde_json::from_value(serde_json::json!({
        "tables": [{
            "name": "houses",
            "columns": [
                {"name": "rooms", "type": "INTEGER"},
                {"name": "area", "type": "REAL"},
                {"name": "price", "type": "REAL"}
            ]
        }]
    }))
    .expect("valid schema")
}

fn request() -> PipelineRequest {
    PipelineRequest::new(schema(), AlgorithmType::LinearRegression).with_objective("Predict price")
}

fn config(max_attempts: u32) -> PipelineConfig {
    PipelineConfig::new()
        .with_max_attempts(max_attempts)
        .with_heartbeat(None)
}

fn orchestrator(
    max_attempts: u32,
    adapter: Arc<CountingAdapter>,
    executor: Arc<ScriptedExecutor>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        config(max_attempts),
        adapter,
        executor,
        Arc::new(DescriptorAnalyst::new(200)),
    )
    .expect("valid config")
}

async fn run_collect(
    orchestrator: &PipelineOrchestrator,
    request: PipelineRequest,
) -> (PipelineRun, Vec<StreamEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let run = orchestrator.run(request, tx, CancellationToken::new()).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (run, events)
}

/// Statuses of the fixing, success and final_error events, in order.
fn milestones(events: &[StreamEvent]) -> Vec<EventStatus> {
    events
        .iter()
        .map(|e| e.status)
        .filter(|s| {
            matches!(
                s,
                EventStatus::Fixing | EventStatus::Success | EventStatus::FinalError
            )
        })
        .collect()
}

fn terminal_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test]
async fn test_recovers_after_two_failures() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Step::Runtime,
        Step::NoReport,
        Step::Success,
    ]));
    let orch = orchestrator(3, adapter.clone(), executor.clone());

    let (run, events) = run_collect(&orch, request()).await;

    assert_eq!(run.terminal_state, TerminalState::Succeeded);
    assert_eq!(run.attempts.len(), 3);
    assert_eq!(
        milestones(&events),
        vec![EventStatus::Fixing, EventStatus::Fixing, EventStatus::Success]
    );
    assert_eq!(
        run.attempts[0].outcome,
        Some(AttemptOutcome::RuntimeFailure)
    );
    assert_eq!(
        run.attempts[1].outcome,
        Some(AttemptOutcome::NoReportFailure)
    );

    let report = run.report().expect("report from last attempt");
    assert_eq!(report.model_type, "linear_regression");
    assert_eq!(run.attempts[2].report.as_ref(), Some(report));

    // Initial generation plus two repairs, each executed verbatim.
    assert_eq!(adapter.call_count(), 3);
    assert_eq!(
        executor.executed_codes(),
        run.attempts.iter().map(|a| a.code.clone()).collect::<Vec<_>>()
    );

    let success = events.last().expect("events");
    assert_eq!(success.status, EventStatus::Success);
    assert_eq!(success.data["attempt"], 3);
    assert_eq!(success.data["report"]["metrics"]["r2"], 0.87);
}

#[tokio::test]
async fn test_repair_context_carries_previous_code_and_failure() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Success]));
    let orch = orchestrator(3, adapter.clone(), executor);

    let (run, _) = run_collect(&orch, request()).await;
    assert!(run.succeeded());

    let contexts = adapter.contexts.lock().expect("lock").clone();
    assert_eq!(contexts.len(), 2);
    assert!(!contexts[0].is_repair());
    match &contexts[1] {
        AdaptContext::Repair(repair) => {
            assert_eq!(repair.previous_code, run.attempts[0].code);
            assert!(repair.failure.message.contains("ValueError"));
            assert_eq!(repair.initial.objective.as_deref(), Some("Predict price"));
        }
        other => panic!("expected repair context, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeouts_exhaust_retries() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Timeout, Step::Timeout]));
    let orch = orchestrator(2, adapter, executor);

    let (run, events) = run_collect(&orch, request()).await;

    assert_eq!(run.terminal_state, TerminalState::ExhaustedRetries);
    assert_eq!(run.attempts.len(), 2);
    assert!(run
        .attempts
        .iter()
        .all(|a| a.outcome == Some(AttemptOutcome::TimeoutFailure)));
    assert_eq!(
        milestones(&events),
        vec![EventStatus::Fixing, EventStatus::FinalError]
    );

    let last = events.last().expect("events");
    assert_eq!(last.status, EventStatus::FinalError);
    assert_eq!(last.data["terminal_state"], "exhausted_retries");
    assert!(run.summary.is_some());
}

#[tokio::test]
async fn test_attempt_count_never_exceeds_budget() {
    for max_attempts in [1, 2, 4] {
        let adapter = Arc::new(CountingAdapter::new());
        let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
        let orch = orchestrator(max_attempts, adapter, executor.clone());

        let (run, events) = run_collect(&orch, request()).await;

        assert_eq!(run.terminal_state, TerminalState::ExhaustedRetries);
        assert_eq!(run.attempts.len(), max_attempts as usize);
        assert_eq!(executor.executed_codes().len(), max_attempts as usize);
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(
            events.iter().filter(|e| e.status == EventStatus::Fixing).count(),
            max_attempts as usize - 1
        );
        let indices: Vec<u32> = run.attempts.iter().map(|a| a.index).collect();
        assert_eq!(indices, (1..=max_attempts).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_cancel_during_second_attempt() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Hang]));
    let orch = orchestrator(5, adapter, executor);

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(1024);
    let cancel = CancellationToken::new();
    let watcher_cancel = cancel.clone();

    let watcher = async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if event.message.starts_with("Execution attempt 2/") {
                watcher_cancel.cancel();
            }
            events.push(event);
        }
        events
    };

    let (run, events) = tokio::join!(orch.run(request(), tx, cancel), watcher);

    assert_eq!(run.terminal_state, TerminalState::AbortedByCaller);
    assert_eq!(run.completed_attempts(), 1);
    assert_eq!(run.attempts.len(), 2);
    assert!(!run.attempts[1].is_complete());
    assert_eq!(terminal_count(&events), 0);
}

#[tokio::test]
async fn test_error_event_precedes_fixing_and_final_error() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Timeout]));
    let orch = orchestrator(2, adapter, executor);

    let (_, events) = run_collect(&orch, request()).await;

    let flow: Vec<(EventStatus, u64)> = events
        .iter()
        .filter(|e| {
            matches!(
                e.status,
                EventStatus::Error | EventStatus::Fixing | EventStatus::FinalError
            )
        })
        .map(|e| {
            let attempt = e.data["attempt"]
                .as_u64()
                .or_else(|| e.data["attempts"].as_u64())
                .expect("attempt number");
            (e.status, attempt)
        })
        .collect();
    assert_eq!(
        flow,
        vec![
            (EventStatus::Error, 1),
            (EventStatus::Fixing, 1),
            (EventStatus::Error, 2),
            (EventStatus::FinalError, 2),
        ]
    );
}

#[tokio::test]
async fn test_heartbeats_cover_each_slow_phase() {
    let delay = Duration::from_millis(350);
    let orch = PipelineOrchestrator::new(
        PipelineConfig::new()
            .with_max_attempts(2)
            .with_heartbeat(Some(Duration::from_millis(100))),
        Arc::new(Slow {
            inner: CountingAdapter::new(),
            delay,
        }),
        Arc::new(Slow {
            inner: ScriptedExecutor::new(vec![Step::Runtime, Step::Success]),
            delay,
        }),
        Arc::new(Slow {
            inner: DescriptorAnalyst::new(200),
            delay,
        }),
    )
    .expect("valid config");

    let (run, events) = run_collect(&orch, request()).await;
    assert!(run.succeeded());

    let heartbeats: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| e.data["heartbeat"] == true)
        .collect();
    assert!(heartbeats.iter().all(|e| e.status == EventStatus::Info));
    for phase in ["adapting", "executing", "analyzing"] {
        assert!(
            heartbeats.iter().any(|e| e.data["phase"] == phase),
            "no heartbeat while {}",
            phase
        );
    }
    assert!(heartbeats
        .iter()
        .filter(|e| e.data["phase"] == "executing")
        .all(|e| e.data["attempt"] == 1 || e.data["attempt"] == 2));

    // Heartbeats never follow the terminal event.
    assert_eq!(terminal_count(&events), 1);
    assert!(events.last().expect("events").is_terminal());
}

#[tokio::test]
async fn test_long_summaries_are_capped() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Runtime]));
    let orch = PipelineOrchestrator::new(
        config(2).with_summary_max_chars(50),
        adapter.clone(),
        executor,
        Arc::new(VerboseAnalyst),
    )
    .expect("valid config");

    let (run, events) = run_collect(&orch, request()).await;
    assert_eq!(run.terminal_state, TerminalState::ExhaustedRetries);

    let fixing = events
        .iter()
        .find(|e| e.status == EventStatus::Fixing)
        .expect("fixing event");
    let shown = fixing.data["summary"].as_str().expect("summary");
    assert!(shown.chars().count() <= 50);
    assert!(shown.ends_with("..."));

    let contexts = adapter.contexts.lock().expect("lock").clone();
    match &contexts[1] {
        AdaptContext::Repair(repair) => {
            let fed_back = repair.summary.as_deref().expect("summary");
            assert!(fed_back.chars().count() <= 50);
        }
        other => panic!("expected repair context, got {:?}", other),
    }

    let last = events.last().expect("events");
    assert!(last.data["summary"].as_str().expect("summary").chars().count() <= 50);
    assert!(run.summary.expect("summary").chars().count() <= 50);
}

#[tokio::test]
async fn test_initial_adapter_failure_ends_run() {
    let adapter = Arc::new(CountingAdapter::failing_on(1));
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Success]));
    let orch = orchestrator(3, adapter, executor.clone());

    let (run, events) = run_collect(&orch, request()).await;

    assert_eq!(run.terminal_state, TerminalState::AdapterFailed);
    assert!(run.attempts.is_empty());
    assert!(executor.executed_codes().is_empty());
    assert_eq!(milestones(&events), vec![EventStatus::FinalError]);
    assert_eq!(
        events.last().expect("events").data["terminal_state"],
        "adapter_failed"
    );
}

#[tokio::test]
async fn test_repair_adapter_failure_is_not_retried() {
    let adapter = Arc::new(CountingAdapter::failing_on(2));
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Success]));
    let orch = orchestrator(3, adapter.clone(), executor);

    let (run, events) = run_collect(&orch, request()).await;

    assert_eq!(run.terminal_state, TerminalState::AdapterFailed);
    assert_eq!(run.attempts.len(), 1);
    assert_eq!(adapter.call_count(), 2);
    assert_eq!(
        milestones(&events),
        vec![EventStatus::Fixing, EventStatus::FinalError]
    );
}

#[tokio::test]
async fn test_quick_fix_skips_adapter() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Success]));
    let orch = PipelineOrchestrator::new(
        config(3),
        adapter.clone(),
        executor.clone(),
        Arc::new(NumpyAnalyst),
    )
    .expect("valid config");

    let (run, events) = run_collect(&orch, request()).await;

    assert!(run.succeeded());
    assert_eq!(adapter.call_count(), 1);
    let codes = executor.executed_codes();
    assert!(codes[1].starts_with("import numpy as np\n"));
    assert!(codes[1].ends_with(&codes[0]));

    let fix = events
        .iter()
        .find(|e| e.message == "Fix applied")
        .expect("fix event");
    assert_eq!(fix.data["quick_fix"], true);
}

#[tokio::test]
async fn test_quick_fix_disabled_uses_adapter() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Runtime, Step::Success]));
    let orch = PipelineOrchestrator::new(
        config(3).with_quick_fixes(false),
        adapter.clone(),
        executor,
        Arc::new(NumpyAnalyst),
    )
    .expect("valid config");

    let (run, _) = run_collect(&orch, request()).await;

    assert!(run.succeeded());
    assert_eq!(adapter.call_count(), 2);
}

#[tokio::test]
async fn test_resume_code_skips_generation() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Success]));
    let orch = orchestrator(3, adapter.clone(), executor.clone());

    let supplied = "import pandas as pd\nprint('resumed')\n";
    let (run, events) = run_collect(&orch, request().with_initial_code(supplied)).await;

    assert!(run.succeeded());
    assert_eq!(adapter.call_count(), 0);
    assert_eq!(executor.executed_codes(), vec![supplied.to_string()]);
    assert_eq!(events[0].data["resumed"], true);
}

#[tokio::test]
async fn test_stdout_lines_forwarded_in_order() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Chatty(vec![
        "Loading data",
        "Fitting model",
    ])]));
    let orch = orchestrator(1, adapter, executor);

    let (run, events) = run_collect(&orch, request()).await;

    assert!(run.succeeded());
    let forwarded: Vec<&str> = events
        .iter()
        .filter(|e| e.data["stream"] == "stdout")
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(forwarded, vec!["Loading data", "Fitting model"]);

    let success_at = events
        .iter()
        .position(|e| e.status == EventStatus::Success)
        .expect("success event");
    let last_line_at = events
        .iter()
        .rposition(|e| e.data["stream"] == "stdout")
        .expect("stdout event");
    assert!(last_line_at < success_at);
}

#[tokio::test]
async fn test_success_is_recorded_in_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(FsModelRegistry::new(dir.path().join("models")));

    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::NoReport, Step::Success]));
    let orch = orchestrator(3, adapter, executor).with_registry(registry.clone());

    let (run, events) = run_collect(&orch, request()).await;

    let record = run.model_record.clone().expect("model record");
    assert_eq!(record.model_type, "linear_regression");
    assert_eq!(record.attempts, 2);
    assert_eq!(record.algorithm, Some(AlgorithmType::LinearRegression));

    let stored = registry.list().await.expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].run_id, record.run_id);
    assert_eq!(
        events.last().expect("events").data["model_record"]["run_id"],
        record.run_id.as_str()
    );
}

#[tokio::test]
async fn test_dropped_receiver_cancels_run() {
    let adapter = Arc::new(CountingAdapter::new());
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Success]));
    let orch = orchestrator(3, adapter, executor.clone());

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let run = orch.run(request(), tx, CancellationToken::new()).await;

    assert_eq!(run.terminal_state, TerminalState::AbortedByCaller);
    assert!(executor.executed_codes().is_empty());
}

/// Adapter that hands out fixed shell scripts in order.
struct ShellAdapter {
    scripts: Mutex<VecDeque<String>>,
}

#[async_trait]
impl CodeAdapter for ShellAdapter {
    async fn adapt(&self, _context: &AdaptContext) -> Result<String, AdapterError> {
        self.scripts
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or(AdapterError::EmptyCode)
    }
}

fn has_sh() -> bool {
    if Path::new("/bin/sh").exists() {
        true
    } else {
        eprintln!("Skipping: /bin/sh not available");
        false
    }
}

fn shell_orchestrator(
    work: &Path,
    scripts: Vec<String>,
    max_attempts: u32,
) -> PipelineOrchestrator {
    let adapter = Arc::new(ShellAdapter {
        scripts: Mutex::new(scripts.into()),
    });
    let sandbox = ProcessSandbox::new(
        SandboxConfig::new("sh", work)
            .with_script_name("pipeline.sh")
            .with_timeout(Duration::from_secs(30)),
    );
    PipelineOrchestrator::new(
        config(max_attempts),
        adapter,
        Arc::new(sandbox),
        Arc::new(DescriptorAnalyst::new(200)),
    )
    .expect("valid config")
}

fn failing_script() -> String {
    "echo 'Traceback (most recent call last):' >&2\necho \"NameError: name 'np' is not defined\" >&2\nexit 1\n".to_string()
}

fn succeeding_script() -> String {
    format!(
        "echo 'Loading data'\necho 'model' > model.bin\necho '{}'\necho '{}'\necho '{}'\n",
        REPORT_BEGIN,
        r#"{"model_type": "linear_regression", "metrics": {"r2": 0.5}, "features": ["area"], "target": "price", "model_path": "model.bin"}"#,
        REPORT_END
    )
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_process_sandbox_end_to_end() {
    if !has_sh() {
        return;
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let work = dir.path().join("work");
    let registry = Arc::new(FsModelRegistry::new(dir.path().join("models")));
    let orch = shell_orchestrator(&work, vec![failing_script(), succeeding_script()], 3)
        .with_registry(registry);

    let (run, events) = run_collect(&orch, request()).await;

    assert_eq!(run.terminal_state, TerminalState::Succeeded);
    assert_eq!(run.attempts.len(), 2);
    assert_eq!(run.attempts[0].exit_code, Some(1));
    assert!(run.attempts[0].stderr.contains("NameError"));
    assert!(events
        .iter()
        .any(|e| e.data["stream"] == "stdout" && e.message == "Loading data"));

    let record = run.model_record.expect("model record");
    let stored = record.model_path.expect("model path");
    assert!(stored.starts_with(&*dir.path().join("models").to_string_lossy()));
    assert!(Path::new(&stored).is_file());

    // The artifact was copied out, so the attempt directories are gone.
    assert_eq!(entries(&work), 0);
    let success = events.last().expect("events");
    assert_eq!(success.data["report"]["model_path"], stored.as_str());
}

#[tokio::test]
async fn test_exhausted_run_leaves_no_workspace() {
    if !has_sh() {
        return;
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let work = dir.path().join("work");
    let orch = shell_orchestrator(&work, vec![failing_script(), failing_script()], 2);

    let (run, _) = run_collect(&orch, request()).await;

    assert_eq!(run.terminal_state, TerminalState::ExhaustedRetries);
    assert_eq!(run.attempts.len(), 2);
    assert_eq!(entries(&work), 0);
}

#[tokio::test]
async fn test_unrecorded_artifact_keeps_workspace() {
    if !has_sh() {
        return;
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let work = dir.path().join("work");
    let orch = shell_orchestrator(&work, vec![succeeding_script()], 1);

    let (run, _) = run_collect(&orch, request()).await;

    assert!(run.succeeded());
    let model_path = run
        .report()
        .and_then(|r| r.model_path.clone())
        .expect("model path");
    assert!(Path::new(&model_path).is_file());
}
