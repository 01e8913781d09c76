//! CBMC adapter: incremental bounded model checking.
//!
//! A single bounded run cannot answer `true` (the bound may be too small) and
//! an unwinding-assertion run cannot answer `false` (the failed assertion is
//! about the bound, not the program). The portfolio therefore schedules every
//! unwind bound twice: a plain `--unwind N` step whose verdict is filtered to
//! {false}, and an `--unwind N --unwinding-assertions` step filtered to
//! {true}. The first conclusive verdict that survives its filter wins.
//!
//! CBMC consumes C, not bitcode, so the pre-verification hook translates the
//! prepared module back to C with `llvm2c` after linking the nontermination
//! marker definitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use sliceprove_process::RunOutcome;
use sliceprove_property::Property;
use sliceprove_result::{FalseKind, ResultFilter, Verdict};

use crate::traits::{
    default_instrumentation_plan, default_slicing_criterion, AdapterError, HookError,
    InstrumentationPlan, LinkCategory, PipelineOps, PortfolioStep, ResourceLimits,
    SlicingCriterion, ToolAdapter,
};

/// Unwind bounds tried in order, shallow to effectively unbounded.
pub const UNWIND_BOUNDS: [u64; 11] = [2, 6, 12, 17, 21, 40, 200, 400, 1025, 2049, 268_435_456];

/// Configuration for the CBMC adapter.
#[derive(Debug, Clone, Default)]
pub struct CbmcConfig {
    /// Path to `cbmc`; `None` means PATH lookup.
    pub executable: Option<PathBuf>,
    /// Verify under a 32-bit memory model.
    pub is_32bit: bool,
    /// Extra options appended to every invocation.
    pub extra_options: Vec<String>,
}

/// CBMC adapter.
#[derive(Debug, Clone)]
pub struct CbmcAdapter {
    config: CbmcConfig,
    property: Arc<Property>,
}

impl CbmcAdapter {
    pub fn new(property: Arc<Property>) -> Self {
        Self::with_config(property, CbmcConfig::default())
    }

    pub fn with_config(property: Arc<Property>, config: CbmcConfig) -> Self {
        Self { config, property }
    }

    fn classify_lines(&self, output: &[Vec<u8>]) -> Verdict {
        let prp = &self.property;
        let mut status: Option<Verdict> = None;
        for raw in output {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.contains("Unmodelled library functions have been called") {
                status = Some(Verdict::Unknown(Some(
                    "unmodelled library functions".to_string(),
                )));
            } else if line.contains("__CPROVER_memory_leak")
                || line.contains("allocated memory never freed")
            {
                let kind = if prp.memsafety().any() {
                    FalseKind::Memtrack
                } else {
                    FalseKind::Memcleanup
                };
                status = Some(Verdict::False(kind));
            } else if line.contains("double free")
                || line.contains("free called for stack-allocated object")
                || line.contains("free argument")
            {
                status = Some(Verdict::False(FalseKind::Free));
            } else if line.contains("dereference failure")
                || line.contains("bound in")
                || line.contains("source region")
            {
                status = Some(Verdict::False(FalseKind::Deref));
            } else if line.contains("arithmetic overflow on signed") {
                status = Some(Verdict::False(FalseKind::Overflow));
            } else if line.contains("VERIFICATION SUCCESSFUL") {
                // sanity check: a found error and a successful verification
                // cannot both be right
                status = match status {
                    None => Some(Verdict::True),
                    Some(_) => Some(Verdict::Error("contradictory output".to_string())),
                };
            } else if line.contains("VERIFICATION FAILED") {
                if status.is_none() {
                    status = if prp.termination() {
                        Some(Verdict::False(FalseKind::Termination))
                    } else if prp.reachability() {
                        Some(Verdict::False(FalseKind::Reach))
                    } else if prp.overflow() {
                        Some(Verdict::False(FalseKind::Overflow))
                    } else {
                        Some(Verdict::Error("unrecognized failure".to_string()))
                    };
                }
            }
        }
        status.unwrap_or_else(|| Verdict::Error("no verification result".to_string()))
    }
}

#[async_trait]
impl ToolAdapter for CbmcAdapter {
    fn name(&self) -> &'static str {
        "cbmc"
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

    fn slicing_criterion(&self) -> SlicingCriterion {
        if self.property.overflow() {
            // CBMC checks the assertions inside the marker function, not the
            // calls, so the criterion must keep the next instruction
            return SlicingCriterion::new(["__sliceprove_check_overflow"])
                .with_options(["-criteria-are-next-instr"]);
        }
        // do not slice bodies of the criterion functions away
        let mut criterion = default_slicing_criterion(&self.property);
        let preserved = format!("--preserved-functions={}", criterion.symbols.join(","));
        criterion.options.push(preserved);
        criterion
    }

    fn instrumentation_plan(&self) -> Option<InstrumentationPlan> {
        if self.property.overflow() {
            return Some(InstrumentationPlan::new(
                "int_overflows",
                "config-marker.json",
                "overflows-marker.c",
                false,
            ));
        }
        default_instrumentation_plan(&self.property)
    }

    fn passes_before_slicing(&self) -> Vec<String> {
        if self.property.termination() {
            vec!["-find-exits".to_string(), "-use-exit".to_string()]
        } else {
            Vec::new()
        }
    }

    fn passes_before_verification(&self) -> Vec<String> {
        let mut passes = Vec::new();
        if self.property.termination() {
            passes.push("-instrument-nontermination".to_string());
        }
        // the C backend does not handle switches or registers well
        passes.extend(
            ["-reg2mem", "-lowerswitch", "-simplifycfg"]
                .into_iter()
                .map(String::from),
        );
        passes
    }

    async fn actions_before_verification(
        &self,
        ops: &mut dyn PipelineOps,
    ) -> Result<(), HookError> {
        // our marker and exit definitions come from the verifier library
        let markers = [
            "__VERIFIER_silent_exit".to_string(),
            "__VERIFIER_exit".to_string(),
            "__INSTR_check_nontermination".to_string(),
            "__INSTR_fail".to_string(),
        ];
        ops.link_undefined(&[LinkCategory::Verifier], &markers).await?;

        // translate the prepared bitcode back to C
        let bitcode = ops.current_file().to_path_buf();
        let output = PathBuf::from(format!("{}.c", bitcode.display()));
        ops.run_command(vec![
            "llvm2c".to_string(),
            bitcode.display().to_string(),
            "--add-includes".to_string(),
            "--o".to_string(),
            output.display().to_string(),
        ])
        .await?;
        ops.set_current_file(output);
        Ok(())
    }

    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        inputs: &[PathBuf],
        _property_file: Option<&Path>,
        _rlimits: &ResourceLimits,
    ) -> Vec<String> {
        let prp = &self.property;
        let mut cmd = vec![executable.display().to_string()];
        cmd.extend(options.iter().cloned());
        cmd.extend(
            ["--stop-on-fail", "--object-bits", "11", "--compact-trace", "--verbosity", "5"]
                .into_iter()
                .map(String::from),
        );
        if self.config.is_32bit {
            cmd.push("--32".to_string());
        }
        if prp.memsafety().any() || prp.memcleanup() {
            cmd.extend(
                ["--pointer-check", "--memory-leak-check", "--bounds-check", "--no-assertions"]
                    .into_iter()
                    .map(String::from),
            );
        } else if prp.overflow() {
            cmd.extend(
                ["--signed-overflow-check", "--no-assertions"]
                    .into_iter()
                    .map(String::from),
            );
        } else if prp.termination() {
            cmd.push("--no-self-loops-to-assumptions".to_string());
        }
        cmd.extend(self.config.extra_options.iter().cloned());
        cmd.extend(inputs.iter().map(|p| p.display().to_string()));
        cmd
    }

    fn parse_verdict(&self, outcome: &RunOutcome, output: &[Vec<u8>]) -> Verdict {
        if outcome.timed_out {
            return Verdict::Timeout;
        }
        let contains = |needle: &str| {
            output
                .iter()
                .any(|line| String::from_utf8_lossy(line).contains(needle))
        };
        let verdict = if outcome.signal == 0 && (outcome.exit_code == 0 || outcome.exit_code == 10)
        {
            self.classify_lines(output)
        } else if outcome.exit_code == 64 && contains("Usage error!") {
            Verdict::Error("invalid arguments".to_string())
        } else if outcome.exit_code == 6 && contains("Out of memory") {
            Verdict::Error("out of memory".to_string())
        } else {
            Verdict::Error(format!(
                "cbmc exited with code {} (signal {})",
                outcome.exit_code, outcome.signal
            ))
        };
        debug!(%verdict, "classified cbmc output");
        verdict
    }

    fn portfolio(&self) -> Vec<PortfolioStep> {
        let shared: Arc<dyn ToolAdapter> = Arc::new(self.clone());
        let mut steps = Vec::with_capacity(UNWIND_BOUNDS.len() * 2);
        for bound in UNWIND_BOUNDS {
            // a counterexample at any bound is real
            steps.push(
                PortfolioStep::new(Arc::clone(&shared))
                    .with_options(["--unwind".to_string(), bound.to_string()])
                    .with_filter(ResultFilter::false_only()),
            );
            // a proof only counts when the unwinding assertions hold
            steps.push(
                PortfolioStep::new(Arc::clone(&shared))
                    .with_options([
                        "--unwind".to_string(),
                        bound.to_string(),
                        "--unwinding-assertions".to_string(),
                    ])
                    .with_filter(ResultFilter::true_only()),
            );
        }
        steps
    }
}
