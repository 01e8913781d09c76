//! Verification portfolio scheduling.
//!
//! A [`PortfolioScheduler`] takes the adapter's ordered verification
//! schedule and runs it step by step: prepare the program (cached per
//! adapter, since step options only change the verifier command line),
//! invoke the verifier, classify its output, apply the step's result
//! filter. The first conclusive verdict wins; `Timeout`, `Unknown` and
//! `Error` move on to the next step. The step order is the adapter's
//! choice and is never reordered here.
//!
//! A step that cannot run at all — missing executable, missing artifact,
//! failed preparation — becomes an `Error` verdict for that step only.
//! Cancellation is the one thing that stops the whole schedule.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use sliceprove_adapters::{PortfolioStep, ResourceLimits, ToolAdapter};
use sliceprove_pipeline::{
    DefinitionResolver, DefinitionsCache, Pipeline, PipelineConfig, PipelineError,
};
use sliceprove_process::{CancelToken, CommandSpec, Executor, SupervisorError, SystemExecutor};
use sliceprove_result::Verdict;

/// Scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct PortfolioConfig {
    pub pipeline: PipelineConfig,
    /// Wall-clock budget for the whole schedule; `None` means unlimited.
    pub budget: Option<Duration>,
    /// Memory cap forwarded to verifier command lines.
    pub memory_mib: Option<u64>,
    /// Property file handed to verifiers that want one.
    pub property_file: Option<PathBuf>,
}

/// The scheduler only fails outright when the run is cancelled; everything
/// else degrades to a per-step `Error` verdict.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("interrupted")]
    Interrupted,
}

/// Runs an adapter's verification schedule to the first conclusive verdict.
pub struct PortfolioScheduler {
    config: PortfolioConfig,
    executor: Arc<dyn Executor>,
    resolver: Option<Arc<dyn DefinitionResolver>>,
    definitions: Arc<DefinitionsCache>,
    cancel: CancelToken,
}

impl PortfolioScheduler {
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            executor: Arc::new(SystemExecutor::new()),
            resolver: None,
            definitions: Arc::new(DefinitionsCache::new()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DefinitionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the schedule. `work_root` receives one scratch subdirectory per
    /// prepared adapter.
    pub async fn run(
        &self,
        adapter: Arc<dyn ToolAdapter>,
        sources: &[PathBuf],
        work_root: &Path,
    ) -> Result<Verdict, PortfolioError> {
        let started = Instant::now();
        let deadline = self.config.budget.map(|budget| started + budget);
        let steps = adapter.portfolio();
        if steps.is_empty() {
            return Ok(Verdict::Error("adapter produced an empty schedule".to_string()));
        }
        info!(tool = adapter.name(), steps = steps.len(), "starting schedule");

        // preparation outcome per adapter identity; step options only affect
        // the verifier invocation, and a failed preparation fails the same
        // way for every later step
        let mut prepared: HashMap<&'static str, Result<(PathBuf, PathBuf), String>> =
            HashMap::new();
        let mut last = Verdict::Unknown(None);

        for (n, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PortfolioError::Interrupted);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        info!("global budget exhausted");
                        last = Verdict::Timeout;
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match self.run_step(step, n, sources, work_root, remaining, &mut prepared).await {
                Ok(verdict) => {
                    info!(step = n + 1, verdict = %verdict, "step finished");
                    if verdict.is_conclusive() {
                        return Ok(verdict);
                    }
                    last = verdict;
                }
                Err(StepError::Interrupted) => return Err(PortfolioError::Interrupted),
                Err(StepError::Skipped(detail)) => {
                    warn!(step = n + 1, detail = %detail, "step failed to run");
                    last = Verdict::Error(detail);
                }
            }
        }
        // never silently report success when no step concluded
        Ok(last)
    }

    async fn run_step(
        &self,
        step: &PortfolioStep,
        n: usize,
        sources: &[PathBuf],
        work_root: &Path,
        remaining: Option<Duration>,
        prepared: &mut HashMap<&'static str, Result<(PathBuf, PathBuf), String>>,
    ) -> Result<Verdict, StepError> {
        let tool = &step.adapter;
        let executable = match tool.executable() {
            Ok(path) => path,
            Err(err) => return Err(StepError::Skipped(err.to_string())),
        };
        for artifact in tool.required_artifacts() {
            if !artifact.exists() {
                return Err(StepError::Skipped(format!(
                    "required artifact missing: {}",
                    artifact.display()
                )));
            }
        }

        let (program, step_dir) = match prepared.get(tool.name()) {
            Some(Ok(entry)) => entry.clone(),
            Some(Err(detail)) => return Err(StepError::Skipped(detail.clone())),
            None => match self.prepare(tool, n, sources, work_root).await {
                Ok(entry) => {
                    prepared.insert(tool.name(), Ok(entry.clone()));
                    entry
                }
                Err(StepError::Skipped(detail)) => {
                    prepared.insert(tool.name(), Err(detail.clone()));
                    return Err(StepError::Skipped(detail));
                }
                Err(StepError::Interrupted) => return Err(StepError::Interrupted),
            },
        };

        let budget = match (step.budget, remaining) {
            (Some(step_budget), Some(remaining)) => Some(step_budget.min(remaining)),
            (Some(step_budget), None) => Some(step_budget),
            (None, remaining) => remaining,
        };
        let rlimits = ResourceLimits {
            time: budget,
            memory_mib: self.config.memory_mib,
        };
        let argv = tool.cmdline(
            &executable,
            &step.options,
            &[program],
            self.config.property_file.as_deref(),
            &rlimits,
        );
        debug!(step = n + 1, command = %argv.join(" "), "verifying");

        let spec = CommandSpec::new(argv)
            .with_cwd(&step_dir)
            .with_budget(budget);
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut sink = |line: &[u8]| lines.push(line.to_vec());
        let outcome = match self.executor.run(&spec, &mut sink, &self.cancel).await {
            Ok(outcome) => outcome,
            Err(SupervisorError::Interrupted) => return Err(StepError::Interrupted),
            Err(err) => return Err(StepError::Skipped(err.to_string())),
        };

        let mut verdict = tool.parse_verdict(&outcome, &lines);
        if let Some(filter) = &step.filter {
            let unfiltered = verdict.clone();
            verdict = filter.apply(verdict);
            if verdict != unfiltered {
                debug!(step = n + 1, "verdict filtered to {}", verdict);
            }
        }
        Ok(verdict)
    }

    /// Prepare the program for one adapter in its own scratch directory.
    async fn prepare(
        &self,
        tool: &Arc<dyn ToolAdapter>,
        n: usize,
        sources: &[PathBuf],
        work_root: &Path,
    ) -> Result<(PathBuf, PathBuf), StepError> {
        let step_dir = work_root.join(format!("step-{}", n + 1));
        std::fs::create_dir_all(&step_dir)
            .map_err(|err| StepError::Skipped(format!("cannot create scratch dir: {err}")))?;

        let mut pipeline = Pipeline::new(
            Arc::clone(tool),
            self.config.pipeline.clone(),
            step_dir.clone(),
        )
        .with_executor(Arc::clone(&self.executor))
        .with_definitions_cache(Arc::clone(&self.definitions))
        .with_cancel(self.cancel.clone());
        if let Some(resolver) = &self.resolver {
            pipeline = pipeline.with_resolver(Arc::clone(resolver));
        }

        match pipeline.run(sources).await {
            Ok(program) => Ok((program, step_dir)),
            Err(PipelineError::Supervisor(SupervisorError::Interrupted)) => {
                Err(StepError::Interrupted)
            }
            Err(err) => Err(StepError::Skipped(err.to_string())),
        }
    }
}

enum StepError {
    Interrupted,
    Skipped(String),
}
