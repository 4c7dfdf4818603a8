//! Retry orchestrator.
//!
//! Drives one run through `Adapting → Executing → Evaluating`, looping
//! through `Fixing` until a report is recovered, the attempt budget is spent,
//! the adapter itself fails, or the caller cancels. Progress goes out as
//! [`StreamEvent`]s on a bounded channel; the orchestrator knows nothing about
//! how they are delivered.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AdaptContext, AdapterError, CodeAdapter, LlmCodeAdapter, RepairContext};
use crate::analysis::{
    apply_quick_fix, cap_summary, DescriptorAnalyst, FailureAnalysis, FailureAnalyst,
    LlmFailureAnalyst,
};
use crate::classifier::{AttemptOutcome, FailureClassifier, FailureDescriptor, FailureKind};
use crate::error::LlmError;
use crate::llm::build_provider;
use crate::registry::{FsModelRegistry, ModelRecord, ModelRegistry};
use crate::report::ExecutionReport;
use crate::runner::result::tail_lines;
use crate::runner::{
    ExecutionOutput, ProcessSandbox, SandboxConfig, SandboxError, ScriptExecutor, ScriptJob,
};
use crate::settings::{Settings, SettingsError};

use super::config::PipelineConfig;
use super::events::StreamEvent;
use super::run::{Attempt, PipelineRequest, PipelineRun, PipelineState, TerminalState};

/// Buffered stdout lines between the runner and the event stream.
const LINE_BUFFER: usize = 256;

/// Stderr lines carried by per-attempt `error` events.
const ERROR_TAIL_LINES: usize = 30;

/// Errors that can occur while setting up an orchestrator.
///
/// Once a run has started nothing is raised; every ending is a
/// [`TerminalState`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] LlmError),

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

/// Event sink for one run. Nothing is sent once the run is cancelled.
struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    async fn send(&self, event: StreamEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            sent = self.tx.send(event) => {
                if sent.is_err() {
                    debug!("Event receiver dropped, cancelling run");
                    self.cancel.cancel();
                }
            }
        }
    }
}

/// Tracks and logs state transitions of one run.
struct StateTracker<'a> {
    run_id: &'a str,
    state: PipelineState,
}

impl<'a> StateTracker<'a> {
    fn new(run_id: &'a str) -> Self {
        Self {
            run_id,
            state: PipelineState::Adapting,
        }
    }

    fn enter(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            warn!(
                run_id = %self.run_id,
                from = %self.state,
                to = %next,
                "Unexpected pipeline state transition"
            );
        }
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}

/// Coordinates adapter, runner, classifier and registry for pipeline runs.
///
/// One orchestrator serves any number of concurrent runs; runs share no
/// mutable state apart from the model registry.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    adapter: Arc<dyn CodeAdapter>,
    executor: Arc<dyn ScriptExecutor>,
    analyst: Arc<dyn FailureAnalyst>,
    classifier: FailureClassifier,
    registry: Option<Arc<dyn ModelRegistry>>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidConfig` if the configuration is invalid.
    pub fn new(
        config: PipelineConfig,
        adapter: Arc<dyn CodeAdapter>,
        executor: Arc<dyn ScriptExecutor>,
        analyst: Arc<dyn FailureAnalyst>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            adapter,
            executor,
            analyst,
            classifier: FailureClassifier::default(),
            registry: None,
        })
    }

    /// Builds the production orchestrator from a settings snapshot.
    ///
    /// The LLM provider is resolved here, once; runs never branch on it.
    pub fn from_settings(settings: &Settings) -> Result<Self, PipelineError> {
        settings.validate()?;
        let provider = build_provider(&settings.llm)?;
        let pipeline = &settings.pipeline;

        let adapter = LlmCodeAdapter::new(provider.clone(), settings.llm.model.clone())
            .with_temperature(settings.llm.temperature);

        let analyst: Arc<dyn FailureAnalyst> = if pipeline.summarize_failures {
            Arc::new(
                LlmFailureAnalyst::new(provider, settings.llm.model.clone())
                    .with_max_chars(pipeline.summary_max_chars),
            )
        } else {
            Arc::new(DescriptorAnalyst::new(pipeline.summary_max_chars))
        };

        let sandbox = ProcessSandbox::new(
            SandboxConfig::new(pipeline.interpreter.clone(), pipeline.workspace_dir.clone())
                .with_timeout(Duration::from_secs(pipeline.script_timeout_secs))
                .with_output_limit(pipeline.output_limit_bytes),
        );
        let classifier = FailureClassifier::new(sandbox.config().script_name.clone());
        let registry = FsModelRegistry::new(settings.models_dir.clone());

        Ok(Self::new(
            PipelineConfig::from_settings(settings),
            Arc::new(adapter),
            Arc::new(sandbox),
            analyst,
        )?
        .with_classifier(classifier)
        .with_registry(Arc::new(registry)))
    }

    /// Sets the classifier (it must know the script file name).
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Records successful runs in `registry`.
    pub fn with_registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one pipeline to a terminal state.
    ///
    /// Events are sent on `events` in order; exactly one `success` or
    /// `final_error` ends every run that is not cancelled. Cancelling
    /// `cancel` kills an in-flight script, abandons an in-flight adapter
    /// call, and stops all further events. Dropping the receiver counts as
    /// cancellation.
    pub async fn run(
        &self,
        request: PipelineRequest,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let run_id = format!("run-{}", Uuid::new_v4().simple());
        let emitter = Emitter { tx: events, cancel };
        let max_attempts = self.config.max_attempts;
        let mut run = PipelineRun::new(run_id.clone(), max_attempts);
        let mut state = StateTracker::new(&run_id);
        let initial = request.initial_context();
        let objective = request.objective.as_deref();

        info!(
            run_id = %run_id,
            algorithm = %request.algorithm,
            max_attempts = max_attempts,
            resumed = request.resume_code().is_some(),
            "Starting pipeline run"
        );

        let mut code = match request.resume_code() {
            Some(code) => {
                emitter
                    .send(
                        StreamEvent::info(format!(
                            "Resuming with supplied code ({} attempts available)",
                            max_attempts
                        ))
                        .with_data(json!({
                            "run_id": run_id,
                            "resumed": true,
                            "max_attempts": max_attempts,
                        })),
                    )
                    .await;
                code.to_string()
            }
            None => {
                emitter
                    .send(
                        StreamEvent::info(format!(
                            "Generating {} pipeline...",
                            request.algorithm.display_name()
                        ))
                        .with_data(json!({
                            "run_id": run_id,
                            "resumed": false,
                            "max_attempts": max_attempts,
                        })),
                    )
                    .await;
                match self
                    .adapt(&AdaptContext::Initial(initial.clone()), 1, &emitter)
                    .await
                {
                    Some(Ok(code)) => code,
                    Some(Err(err)) => {
                        return self.adapter_failed(run, &mut state, err, &emitter).await
                    }
                    None => return self.abort(run, &mut state),
                }
            }
        };

        loop {
            let index = run.attempts.len() as u32 + 1;
            state.enter(PipelineState::Executing);
            emitter
                .send(
                    StreamEvent::info(format!("Execution attempt {}/{}...", index, max_attempts))
                        .with_data(json!({"attempt": index, "max_attempts": max_attempts})),
                )
                .await;
            if emitter.cancel.is_cancelled() {
                run.attempts.push(Attempt::aborted(index, code));
                return self.abort(run, &mut state);
            }

            let job = ScriptJob::new(run.run_id.clone(), index, code.clone());
            let output = match self.execute(&job, &emitter).await {
                Ok(output) => output,
                Err(SandboxError::Cancelled) => {
                    run.attempts.push(Attempt::aborted(index, code));
                    return self.abort(run, &mut state);
                }
                Err(e) => {
                    error!(
                        run_id = %run.run_id,
                        attempt = index,
                        error = %e,
                        "Sandbox could not run script"
                    );
                    ExecutionOutput {
                        stderr: e.to_string(),
                        ..Default::default()
                    }
                }
            };
            if emitter.cancel.is_cancelled() {
                run.attempts.push(Attempt::aborted(index, code));
                return self.abort(run, &mut state);
            }

            state.enter(PipelineState::Evaluating);
            let mut evaluation = self.classifier.evaluate(&output, &code);
            if let Some(report) = evaluation.report.as_mut() {
                resolve_model_path(report, output.work_dir.as_deref());
            }
            run.attempts
                .push(Attempt::evaluated(index, code.clone(), &output, &evaluation));

            if evaluation.outcome == AttemptOutcome::Success {
                if let Some(report) = evaluation.report {
                    return self
                        .succeed(run, &mut state, &request, report, &output, &emitter)
                        .await;
                }
            }

            let failure = evaluation
                .failure
                .unwrap_or_else(|| FailureDescriptor::new(FailureKind::Unknown, "attempt failed"));
            warn!(
                run_id = %run.run_id,
                attempt = index,
                max_attempts = max_attempts,
                outcome = %evaluation.outcome,
                exit_code = %output.exit_label(),
                failure = %failure,
                "Attempt failed"
            );
            emitter
                .send(StreamEvent::error(
                    format!("Attempt {} failed: {}", index, failure),
                    json!({
                        "attempt": index,
                        "outcome": evaluation.outcome,
                        "exit_code": output.exit_code,
                        "timed_out": output.timed_out,
                        "failure": failure,
                        "stderr": tail_lines(&output.stderr, ERROR_TAIL_LINES),
                    }),
                ))
                .await;

            let mut analysis = match self
                .guarded(
                    self.analyst
                        .analyze(&code, &failure, &output.stderr, objective),
                    "analyzing",
                    index,
                    &emitter,
                )
                .await
            {
                Some(analysis) => analysis,
                None => return self.abort(run, &mut state),
            };
            analysis.summary = cap_summary(&analysis.summary, self.config.summary_max_chars);

            if index >= max_attempts {
                return self
                    .exhausted(run, &mut state, &output, &failure, analysis, &emitter)
                    .await;
            }

            state.enter(PipelineState::Fixing);
            emitter
                .send(StreamEvent::fixing(
                    format!("Attempt {} failed, fixing: {}", index, analysis.summary),
                    json!({
                        "attempt": index,
                        "next_attempt": index + 1,
                        "failure": failure,
                        "summary": analysis.summary,
                        "fix_type": analysis.fix_type,
                    }),
                ))
                .await;

            let patched = if self.config.quick_fixes {
                analysis
                    .applicable_quick_fix()
                    .and_then(|fix| apply_quick_fix(&code, fix))
            } else {
                None
            };

            let (next_code, quick_fix) = match patched {
                Some(patched) => {
                    info!(run_id = %run.run_id, attempt = index, "Applied quick fix");
                    (patched, true)
                }
                None => {
                    state.enter(PipelineState::Adapting);
                    let context = AdaptContext::Repair(RepairContext {
                        initial: initial.clone(),
                        previous_code: code.clone(),
                        failure: failure.clone(),
                        summary: Some(analysis.summary.clone()),
                    });
                    match self.adapt(&context, index + 1, &emitter).await {
                        Some(Ok(code)) => (code, false),
                        Some(Err(err)) => {
                            return self.adapter_failed(run, &mut state, err, &emitter).await
                        }
                        None => return self.abort(run, &mut state),
                    }
                }
            };

            emitter
                .send(StreamEvent::info("Fix applied").with_data(json!({
                    "attempt": index + 1,
                    "quick_fix": quick_fix,
                    "code": next_code,
                })))
                .await;
            code = next_code;
        }
    }

    async fn adapt(
        &self,
        context: &AdaptContext,
        attempt: u32,
        emitter: &Emitter,
    ) -> Option<Result<String, AdapterError>> {
        self.guarded(self.adapter.adapt(context), "adapting", attempt, emitter)
            .await
    }

    /// Awaits `fut` with heartbeats. `None` if the run was cancelled first.
    async fn guarded<F, T>(&self, fut: F, phase: &str, attempt: u32, emitter: &Emitter) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        let started = Instant::now();
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                biased;
                _ = emitter.cancel.cancelled() => return None,
                out = &mut fut => return Some(out),
                _ = tick(&mut ticker) => {
                    emitter
                        .send(StreamEvent::heartbeat(phase, attempt, started.elapsed().as_secs()))
                        .await;
                }
            }
        }
    }

    /// Runs one script, forwarding stdout lines and heartbeats as it goes.
    ///
    /// Cancellation is left to the executor so it can kill the child.
    async fn execute(
        &self,
        job: &ScriptJob,
        emitter: &Emitter,
    ) -> Result<ExecutionOutput, SandboxError> {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);
        let lines = self.config.forward_stdout.then_some(line_tx);
        let fut = self.executor.execute(job, &emitter.cancel, lines);
        tokio::pin!(fut);

        let started = Instant::now();
        let mut ticker = self.ticker();
        let result = loop {
            tokio::select! {
                result = &mut fut => break result,
                Some(line) = line_rx.recv() => {
                    emitter.send(stdout_event(job.attempt, line)).await;
                }
                _ = tick(&mut ticker) => {
                    let elapsed = started.elapsed().as_secs();
                    emitter
                        .send(StreamEvent::heartbeat("executing", job.attempt, elapsed))
                        .await;
                }
            }
        };

        while let Ok(line) = line_rx.try_recv() {
            emitter.send(stdout_event(job.attempt, line)).await;
        }
        result
    }

    fn ticker(&self) -> Option<Interval> {
        self.config.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        })
    }

    async fn succeed(
        &self,
        mut run: PipelineRun,
        state: &mut StateTracker<'_>,
        request: &PipelineRequest,
        mut report: ExecutionReport,
        output: &ExecutionOutput,
        emitter: &Emitter,
    ) -> PipelineRun {
        state.enter(PipelineState::Finished(TerminalState::Succeeded));
        let attempt = run.attempts.len() as u32;

        let model_record = match &self.registry {
            Some(registry) => {
                let record = ModelRecord::from_report(&report, Some(request.algorithm), attempt);
                match registry.record(record).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(run_id = %run.run_id, error = %e, "Failed to record model run");
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(path) = model_record.as_ref().and_then(|r| r.model_path.clone()) {
            report.model_path = Some(path);
        }
        let artifact_in_workspace = report
            .model_path
            .as_deref()
            .zip(output.work_dir.as_deref())
            .is_some_and(|(path, dir)| Path::new(path).starts_with(dir));
        if artifact_in_workspace {
            warn!(run_id = %run.run_id, "Model artifact was not recorded, keeping run workspace");
        } else {
            self.release_workspace(&run.run_id).await;
        }

        info!(
            run_id = %run.run_id,
            attempts = attempt,
            model_type = %report.model_type,
            registry_id = model_record.as_ref().map(|r| r.run_id.as_str()).unwrap_or("-"),
            "Pipeline succeeded"
        );

        emitter
            .send(StreamEvent::success(
                format!("Pipeline succeeded on attempt {}/{}", attempt, run.max_attempts),
                json!({
                    "terminal_state": TerminalState::Succeeded,
                    "attempt": attempt,
                    "report": report,
                    "model_record": model_record,
                    "exit_code": output.exit_code,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                    "code": run.final_code(),
                }),
            ))
            .await;

        run.terminal_state = TerminalState::Succeeded;
        run.model_record = model_record;
        run
    }

    async fn exhausted(
        &self,
        mut run: PipelineRun,
        state: &mut StateTracker<'_>,
        output: &ExecutionOutput,
        failure: &FailureDescriptor,
        analysis: FailureAnalysis,
        emitter: &Emitter,
    ) -> PipelineRun {
        state.enter(PipelineState::Finished(TerminalState::ExhaustedRetries));
        self.release_workspace(&run.run_id).await;
        warn!(
            run_id = %run.run_id,
            attempts = run.attempts.len(),
            failure = %failure,
            "Pipeline exhausted its attempts"
        );

        emitter
            .send(StreamEvent::final_error(
                format!(
                    "Pipeline failed after {} attempts: {}",
                    run.attempts.len(),
                    analysis.summary
                ),
                json!({
                    "terminal_state": TerminalState::ExhaustedRetries,
                    "attempts": run.attempts.len(),
                    "failure": failure,
                    "summary": analysis.summary,
                    "exit_code": output.exit_code,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                    "code": run.final_code(),
                }),
            ))
            .await;

        run.terminal_state = TerminalState::ExhaustedRetries;
        run.summary = Some(analysis.summary);
        run
    }

    async fn adapter_failed(
        &self,
        mut run: PipelineRun,
        state: &mut StateTracker<'_>,
        err: AdapterError,
        emitter: &Emitter,
    ) -> PipelineRun {
        state.enter(PipelineState::Finished(TerminalState::AdapterFailed));
        error!(run_id = %run.run_id, error = %err, "Code adapter failed, ending run");
        self.release_workspace(&run.run_id).await;

        let summary = format!("Code generation failed: {}", err);
        let last = run.last_attempt();
        let data = json!({
            "terminal_state": TerminalState::AdapterFailed,
            "attempts": run.attempts.len(),
            "error": err.to_string(),
            "stdout": last.map(|a| a.stdout.as_str()).unwrap_or_default(),
            "stderr": last.map(|a| a.stderr.as_str()).unwrap_or_default(),
            "code": last.map(|a| a.code.as_str()),
        });
        emitter
            .send(StreamEvent::final_error(summary.clone(), data))
            .await;

        run.terminal_state = TerminalState::AdapterFailed;
        run.summary = Some(summary);
        run
    }

    /// Removes the run's script workspace. Cancelled runs keep theirs.
    async fn release_workspace(&self, run_id: &str) {
        if let Err(e) = self.executor.cleanup(run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to remove run workspace");
        }
    }

    fn abort(&self, mut run: PipelineRun, state: &mut StateTracker<'_>) -> PipelineRun {
        state.enter(PipelineState::Finished(TerminalState::AbortedByCaller));
        info!(
            run_id = %run.run_id,
            completed_attempts = run.completed_attempts(),
            "Pipeline run cancelled by caller"
        );
        run.terminal_state = TerminalState::AbortedByCaller;
        run
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn stdout_event(attempt: u32, line: String) -> StreamEvent {
    StreamEvent::info(line).with_data(json!({"attempt": attempt, "stream": "stdout"}))
}

/// Makes a relative `model_path` absolute against the script's directory.
fn resolve_model_path(report: &mut ExecutionReport, work_dir: Option<&Path>) {
    if let (Some(path), Some(dir)) = (report.model_path.as_mut(), work_dir) {
        if Path::new(path.as_str()).is_relative() {
            *path = dir.join(path.as_str()).to_string_lossy().into_owned();
        }
    }
}
