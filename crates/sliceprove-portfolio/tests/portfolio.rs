//! Scheduler behavior against a scripted verifier.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sliceprove_adapters::{
    AdapterError, PortfolioStep, ResourceLimits, ToolAdapter,
};
use sliceprove_portfolio::{PortfolioConfig, PortfolioError, PortfolioScheduler};
use sliceprove_process::{CancelToken, CommandSpec, Executor, LineSink, RunOutcome, SupervisorError};
use sliceprove_property::Property;
use sliceprove_result::{FalseKind, ResultFilter, Verdict};

/// One scripted verifier invocation.
#[derive(Clone)]
struct VerifyRun {
    lines: Vec<&'static str>,
    timed_out: bool,
}

impl VerifyRun {
    fn says(line: &'static str) -> Self {
        Self {
            lines: vec![line],
            timed_out: false,
        }
    }

    fn timeout() -> Self {
        Self {
            lines: Vec::new(),
            timed_out: true,
        }
    }
}

/// Succeeds silently for every preparation command; verifier invocations
/// replay a queue of scripted runs.
struct ScriptedExecutor {
    verify_runs: Mutex<VecDeque<VerifyRun>>,
    commands: Mutex<Vec<Vec<String>>>,
    failures: Vec<(String, i32)>,
}

impl ScriptedExecutor {
    fn new(runs: Vec<VerifyRun>) -> Self {
        Self {
            verify_runs: Mutex::new(runs.into()),
            commands: Mutex::new(Vec::new()),
            failures: Vec::new(),
        }
    }

    fn failing(mut self, program: &str, code: i32) -> Self {
        self.failures.push((program.to_string(), code));
        self
    }

    fn count_of(&self, program: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|argv| argv[0] == program)
            .count()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn LineSink,
        _cancel: &CancelToken,
    ) -> Result<RunOutcome, SupervisorError> {
        self.commands.lock().unwrap().push(spec.argv.clone());
        let exit_code = self
            .failures
            .iter()
            .find(|(name, _)| *name == spec.argv[0])
            .map(|(_, code)| *code)
            .unwrap_or(0);
        let mut timed_out = false;
        if spec.argv[0] == "mockverify" {
            let run = self
                .verify_runs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| VerifyRun::says("RESULT: unknown"));
            for line in run.lines {
                sink.line(format!("{line}\n").as_bytes());
            }
            timed_out = run.timed_out;
        }
        Ok(RunOutcome {
            exit_code,
            signal: 0,
            timed_out,
        })
    }
}

/// Schedule description for the mock: one entry per step.
#[derive(Clone)]
struct StepSpec {
    options: Vec<String>,
    filter: Option<ResultFilter>,
}

#[derive(Clone)]
struct MockAdapter {
    property: Arc<Property>,
    plan: Vec<StepSpec>,
}

impl MockAdapter {
    fn with_steps(plan: Vec<StepSpec>) -> Self {
        Self {
            property: Arc::new(Property::default_assertions()),
            plan,
        }
    }

    fn plain_steps(count: usize) -> Self {
        Self::with_steps(
            (0..count)
                .map(|_| StepSpec {
                    options: Vec::new(),
                    filter: None,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ToolAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mockverify"
    }

    fn property(&self) -> &Property {
        &self.property
    }

    fn executable(&self) -> Result<PathBuf, AdapterError> {
        Ok(PathBuf::from("mockverify"))
    }

    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        inputs: &[PathBuf],
        _property_file: Option<&Path>,
        _rlimits: &ResourceLimits,
    ) -> Vec<String> {
        let mut argv = vec![executable.display().to_string()];
        argv.extend(options.iter().cloned());
        argv.extend(inputs.iter().map(|p| p.display().to_string()));
        argv
    }

    fn parse_verdict(&self, outcome: &RunOutcome, output: &[Vec<u8>]) -> Verdict {
        if outcome.timed_out {
            return Verdict::Timeout;
        }
        for line in output {
            let line = String::from_utf8_lossy(line);
            if line.contains("RESULT: true") {
                return Verdict::True;
            }
            if line.contains("RESULT: false") {
                return Verdict::False(FalseKind::Reach);
            }
        }
        Verdict::Unknown(None)
    }

    fn portfolio(&self) -> Vec<PortfolioStep> {
        self.plan
            .iter()
            .map(|spec| {
                let mut step = PortfolioStep::new(Arc::new(self.clone()))
                    .with_options(spec.options.iter().cloned());
                if let Some(filter) = &spec.filter {
                    step = step.with_filter(filter.clone());
                }
                step
            })
            .collect()
    }
}

fn scheduler(executor: Arc<ScriptedExecutor>) -> PortfolioScheduler {
    PortfolioScheduler::new(PortfolioConfig::default()).with_executor(executor)
}

async fn run_schedule(
    adapter: MockAdapter,
    executor: Arc<ScriptedExecutor>,
) -> Result<Verdict, PortfolioError> {
    let work = tempfile::tempdir().unwrap();
    scheduler(executor)
        .run(Arc::new(adapter), &[PathBuf::from("prog.c")], work.path())
        .await
}

#[tokio::test]
async fn first_conclusive_verdict_short_circuits() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        VerifyRun::says("RESULT: unknown"),
        VerifyRun::says("RESULT: true"),
        VerifyRun::says("RESULT: false"),
    ]));
    let verdict = run_schedule(MockAdapter::plain_steps(3), Arc::clone(&executor))
        .await
        .unwrap();
    assert_eq!(verdict, Verdict::True);
    // the third step never ran
    assert_eq!(executor.count_of("mockverify"), 2);
}

#[tokio::test]
async fn exhausted_schedule_returns_the_last_inconclusive_verdict() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        VerifyRun::says("RESULT: unknown"),
        VerifyRun::says("RESULT: unknown"),
    ]));
    let verdict = run_schedule(MockAdapter::plain_steps(2), executor)
        .await
        .unwrap();
    assert!(!verdict.is_conclusive());
    assert!(matches!(verdict, Verdict::Unknown(_)));
}

#[tokio::test]
async fn filtered_bounded_true_does_not_win() {
    // step 1 is a bounded under-approximation, only its counterexamples
    // count; step 2 is unrestricted
    let adapter = MockAdapter::with_steps(vec![
        StepSpec {
            options: vec!["--bounded".to_string()],
            filter: Some(ResultFilter::false_only()),
        },
        StepSpec {
            options: Vec::new(),
            filter: None,
        },
    ]);
    let executor = Arc::new(ScriptedExecutor::new(vec![
        VerifyRun::says("RESULT: true"),
        VerifyRun::says("RESULT: false"),
    ]));
    let verdict = run_schedule(adapter, Arc::clone(&executor)).await.unwrap();
    assert_eq!(verdict, Verdict::False(FalseKind::Reach));
    assert_eq!(executor.count_of("mockverify"), 2);
}

#[tokio::test]
async fn timeout_is_inconclusive_and_the_schedule_continues() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        VerifyRun::timeout(),
        VerifyRun::says("RESULT: false"),
    ]));
    let verdict = run_schedule(MockAdapter::plain_steps(2), executor)
        .await
        .unwrap();
    assert_eq!(verdict, Verdict::False(FalseKind::Reach));
}

#[tokio::test]
async fn all_timeouts_end_as_timeout() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        VerifyRun::timeout(),
        VerifyRun::timeout(),
    ]));
    let verdict = run_schedule(MockAdapter::plain_steps(2), executor)
        .await
        .unwrap();
    assert_eq!(verdict, Verdict::Timeout);
}

#[tokio::test]
async fn preparation_runs_once_per_adapter() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        VerifyRun::says("RESULT: unknown"),
        VerifyRun::says("RESULT: unknown"),
    ]));
    run_schedule(MockAdapter::plain_steps(2), Arc::clone(&executor))
        .await
        .unwrap();
    // both steps verified, but the program was compiled only once
    assert_eq!(executor.count_of("mockverify"), 2);
    assert_eq!(executor.count_of("clang"), 1);
}

#[tokio::test]
async fn failed_preparation_is_not_retried_for_later_steps() {
    let executor = Arc::new(ScriptedExecutor::new(Vec::new()).failing("clang", 1));
    let verdict = run_schedule(MockAdapter::plain_steps(3), Arc::clone(&executor))
        .await
        .unwrap();
    assert!(matches!(verdict, Verdict::Error(_)));
    // the deterministically failing pipeline ran only once
    assert_eq!(executor.count_of("clang"), 1);
    assert_eq!(executor.count_of("mockverify"), 0);
}

#[tokio::test]
async fn cancellation_stops_the_whole_schedule() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
    let work = tempfile::tempdir().unwrap();
    let err = PortfolioScheduler::new(PortfolioConfig::default())
        .with_executor(executor)
        .with_cancel(cancel)
        .run(
            Arc::new(MockAdapter::plain_steps(2)),
            &[PathBuf::from("prog.c")],
            work.path(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PortfolioError::Interrupted));
}

/// An adapter whose binary cannot be found.
#[derive(Clone)]
struct AbsentTool {
    property: Arc<Property>,
}

#[async_trait]
impl ToolAdapter for AbsentTool {
    fn name(&self) -> &'static str {
        "absenttool"
    }

    fn property(&self) -> &Property {
        &self.property
    }

    fn executable(&self) -> Result<PathBuf, AdapterError> {
        Err(AdapterError::ToolNotFound("absenttool".to_string()))
    }

    fn cmdline(
        &self,
        executable: &Path,
        _options: &[String],
        _inputs: &[PathBuf],
        _property_file: Option<&Path>,
        _rlimits: &ResourceLimits,
    ) -> Vec<String> {
        vec![executable.display().to_string()]
    }

    fn parse_verdict(&self, _outcome: &RunOutcome, _output: &[Vec<u8>]) -> Verdict {
        Verdict::Unknown(None)
    }

    fn portfolio(&self) -> Vec<PortfolioStep> {
        vec![PortfolioStep::new(Arc::new(self.clone()))]
    }
}

#[tokio::test]
async fn missing_executable_degrades_to_an_error_verdict() {
    let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
    let work = tempfile::tempdir().unwrap();
    let adapter = AbsentTool {
        property: Arc::new(Property::default_assertions()),
    };
    let verdict = scheduler(executor)
        .run(Arc::new(adapter), &[PathBuf::from("prog.c")], work.path())
        .await
        .unwrap();
    match verdict {
        Verdict::Error(detail) => assert!(detail.contains("not found")),
        other => panic!("expected an error verdict, got {other}"),
    }
}
