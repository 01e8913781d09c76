//! Nidhugg adapter: stateless model checking for pthreads programs.
//!
//! Nidhugg explores thread interleavings under dynamic partial-order
//! reduction, but it bounds loops, so a clean exploration does not prove the
//! program correct. Its single portfolio step is therefore filtered to
//! {false}: only counterexamples are reported as real.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use sliceprove_process::RunOutcome;
use sliceprove_property::Property;
use sliceprove_result::{FalseKind, ResultFilter, Verdict};

use crate::traits::{
    AdapterError, HookError, LinkCategory, PipelineOps, PortfolioStep, ResourceLimits, ToolAdapter,
};

/// Configuration for the Nidhugg adapter.
#[derive(Debug, Clone, Default)]
pub struct NidhuggConfig {
    /// Path to `nidhugg`; `None` means PATH lookup.
    pub executable: Option<PathBuf>,
    /// Extra options appended to every invocation.
    pub extra_options: Vec<String>,
}

/// Nidhugg adapter.
#[derive(Debug, Clone)]
pub struct NidhuggAdapter {
    config: NidhuggConfig,
    property: Arc<Property>,
}

impl NidhuggAdapter {
    pub fn new(property: Arc<Property>) -> Self {
        Self::with_config(property, NidhuggConfig::default())
    }

    pub fn with_config(property: Arc<Property>, config: NidhuggConfig) -> Self {
        Self { config, property }
    }
}

#[async_trait]
impl ToolAdapter for NidhuggAdapter {
    fn name(&self) -> &'static str {
        "nidhugg"
    }

    fn property(&self) -> &Property {
        &self.property
    }

    fn executable(&self) -> Result<PathBuf, AdapterError> {
        match &self.config.executable {
            Some(path) => Ok(path.clone()),
            None => sliceprove_process::find_executable(self.name())
                .ok_or_else(|| AdapterError::ToolNotFound(self.name().to_string())),
        }
    }

    async fn actions_before_slicing(&self, ops: &mut dyn PipelineOps) -> Result<(), HookError> {
        // the atomic-section stubs must be present before slicing decides
        // what is reachable
        let atomics = [
            "__VERIFIER_atomic_begin".to_string(),
            "__VERIFIER_atomic_end".to_string(),
        ];
        ops.link_undefined(&[LinkCategory::Verifier], &atomics).await
    }

    async fn actions_after_slicing(&self, ops: &mut dyn PipelineOps) -> Result<(), HookError> {
        // unroll loops and rename the atomic markers; nidhugg mishandles the
        // originals
        let passes = [
            "-reg2mem".to_string(),
            "-sbt-loop-unroll".to_string(),
            "-sbt-loop-unroll-count".to_string(),
            "7".to_string(),
            "-sbt-loop-unroll-terminate".to_string(),
            "-replace-verifier-atomic".to_string(),
        ];
        ops.run_passes(&passes).await
    }

    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        inputs: &[PathBuf],
        _property_file: Option<&Path>,
        _rlimits: &ResourceLimits,
    ) -> Vec<String> {
        let mut cmd = vec![
            executable.display().to_string(),
            "-sc".to_string(),
            "-disable-mutex-init-requirement".to_string(),
        ];
        cmd.extend(self.config.extra_options.iter().cloned());
        cmd.extend(options.iter().cloned());
        cmd.extend(inputs.iter().map(|p| p.display().to_string()));
        cmd
    }

    fn parse_verdict(&self, outcome: &RunOutcome, output: &[Vec<u8>]) -> Verdict {
        if outcome.timed_out {
            return Verdict::Timeout;
        }
        let mut status = None;
        for raw in output {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line == "No errors were detected." {
                status = Some(Verdict::True);
            } else if line.contains("Error: Assertion violation at") {
                status = Some(Verdict::False(FalseKind::Reach));
            }
        }
        if let Some(verdict) = status {
            return verdict;
        }
        if outcome.signal != 0 {
            Verdict::Error(format!("nidhugg terminated by signal {}", outcome.signal))
        } else if outcome.exit_code != 0 {
            Verdict::Error(format!("nidhugg exited with code {}", outcome.exit_code))
        } else {
            Verdict::Error("no recognized output".to_string())
        }
    }

    fn portfolio(&self) -> Vec<PortfolioStep> {
        // bounded exploration: a clean run proves nothing
        vec![PortfolioStep::new(Arc::new(self.clone())).with_filter(ResultFilter::false_only())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(input: &[&str]) -> Vec<Vec<u8>> {
        input.iter().map(|l| l.as_bytes().to_vec()).collect()
    }

    fn outcome(exit_code: i32, signal: i32) -> RunOutcome {
        RunOutcome {
            exit_code,
            signal,
            timed_out: false,
        }
    }

    fn adapter() -> NidhuggAdapter {
        NidhuggAdapter::new(Arc::new(Property::parse("assert").unwrap()))
    }

    #[test]
    fn clean_exploration_reports_true() {
        let verdict = adapter().parse_verdict(&outcome(0, 0), &lines(&["No errors were detected."]));
        assert_eq!(verdict, Verdict::True);
    }

    #[test]
    fn assertion_violation_reports_false_reach() {
        let verdict = adapter().parse_verdict(
            &outcome(0, 0),
            &lines(&["Error: Assertion violation at main:12"]),
        );
        assert_eq!(verdict, Verdict::False(FalseKind::Reach));
    }

    #[test]
    fn signal_death_is_an_error() {
        let verdict = adapter().parse_verdict(&outcome(0, 11), &lines(&["..."]));
        assert_eq!(
            verdict,
            Verdict::Error("nidhugg terminated by signal 11".to_string())
        );
    }

    #[test]
    fn silent_zero_exit_is_an_error() {
        let verdict = adapter().parse_verdict(&outcome(0, 0), &[]);
        assert!(matches!(verdict, Verdict::Error(_)));
    }

    #[test]
    fn portfolio_filters_true_away() {
        let steps = adapter().portfolio();
        assert_eq!(steps.len(), 1);
        let filter = steps[0].filter.clone().unwrap();
        assert!(!filter.apply(Verdict::True).is_conclusive());
        assert!(filter
            .apply(Verdict::False(FalseKind::Reach))
            .is_conclusive());
    }

    #[test]
    fn cmdline_uses_source_dpor_flags() {
        let cmd = adapter().cmdline(
            Path::new("nidhugg"),
            &[],
            &[PathBuf::from("prog.bc")],
            None,
            &ResourceLimits::default(),
        );
        assert_eq!(cmd, ["nidhugg", "-sc", "-disable-mutex-init-requirement", "prog.bc"]);
    }
}
