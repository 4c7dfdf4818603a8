//! Generate, run and repair loop for ML pipeline scripts.
//!
//! # Architecture
//!
//! - **Orchestrator**: the state machine owning one [`PipelineRun`] per request
//! - **Events**: the ordered [`StreamEvent`] protocol sent to the caller
//! - **Run**: requests, attempts and terminal states
//! - **Config**: attempt budget and progress options, fixed at construction
//!
//! # Flow
//!
//! 1. **Adapting**: the code adapter writes a script from the schema context
//! 2. **Executing**: the runner executes it in an isolated working directory
//! 3. **Evaluating**: the classifier looks for a report and classifies failures
//! 4. **Fixing**: the failure is summarised, then patched locally (missing
//!    import) or sent back to the adapter as a repair context
//!
//! The loop ends on the first report, when the attempt budget is spent, when
//! the adapter call itself fails, or when the caller cancels.
//!
//! # Example
//!
//! ```rust,ignore
//! use automl_forge::pipeline::{PipelineOrchestrator, PipelineRequest};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let orchestrator = PipelineOrchestrator::from_settings(&settings)?;
//! let (tx, mut rx) = mpsc::channel(64);
//!
//! let request = PipelineRequest::new(schema, AlgorithmType::RandomForest)
//!     .with_objective("Predict churn");
//! let handle = tokio::spawn(async move {
//!     orchestrator.run(request, tx, CancellationToken::new()).await
//! });
//!
//! while let Some(event) = rx.recv().await {
//!     println!("[{}] {}", event.status, event.message);
//! }
//! let run = handle.await?;
//! println!("{} after {} attempts", run.terminal_state, run.attempts.len());
//! ```

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod run;

pub use config::PipelineConfig;
pub use events::{EventStatus, StreamEvent};
pub use orchestrator::{PipelineError, PipelineOrchestrator};
pub use run::{Attempt, PipelineRequest, PipelineRun, PipelineState, TerminalState};
