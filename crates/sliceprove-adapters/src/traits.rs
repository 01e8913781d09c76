//! The tool adapter contract.
//!
//! A [`ToolAdapter`] describes everything tool-specific about a verification
//! backend: where its binary lives, how its command line is composed, which
//! compiler flags, instrumentation configs and slicing criteria the
//! preparation pipeline should use for it, and how its raw output maps onto
//! the verdict taxonomy. Everything the adapter does not override falls back
//! to property-derived defaults shared by all tools.
//!
//! Side-effecting hooks receive a [`PipelineOps`], the narrow interface onto
//! the running pipeline: the current bitcode file, command execution inside
//! the scratch directory, LLVM pass application and restricted
//! undefined-symbol linking with the categories passed explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use sliceprove_process::{find_executable, RunOutcome};
use sliceprove_property::Property;
use sliceprove_result::{ResultFilter, Verdict};

/// Resource limits forwarded to tool command lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    /// Wall-clock budget for the verification run.
    pub time: Option<Duration>,
    /// Memory cap in MiB, where the tool supports one.
    pub memory_mib: Option<u64>,
}

/// What the slicer should preserve: criterion symbols plus extra slicer
/// options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicingCriterion {
    pub symbols: Vec<String>,
    pub options: Vec<String>,
}

impl SlicingCriterion {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }
}

/// How to instrument the program for the active property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationPlan {
    /// Configuration domain directory (e.g. `memsafety`, `int_overflows`).
    pub domain: &'static str,
    /// Instrumentation config file inside the domain directory.
    pub config_file: String,
    /// C file with the definitions of the instrumented functions.
    pub definitions_file: String,
    /// Link the definitions right after instrumentation. Marker-style
    /// instrumentation leaves them unlinked so optimizations cannot remove
    /// the marker calls.
    pub link_definitions: bool,
}

impl InstrumentationPlan {
    pub fn new(
        domain: &'static str,
        config_file: &str,
        definitions_file: &str,
        link_definitions: bool,
    ) -> Self {
        Self {
            domain,
            config_file: config_file.to_string(),
            definitions_file: definitions_file.to_string(),
            link_definitions,
        }
    }
}

/// Library categories searched when resolving undefined symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkCategory {
    Verifier,
    Libc,
    Posix,
    Kernel,
    Svcomp,
}

impl LinkCategory {
    /// Subdirectory name under the library root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            LinkCategory::Verifier => "verifier",
            LinkCategory::Libc => "libc",
            LinkCategory::Posix => "posix",
            LinkCategory::Kernel => "kernel",
            LinkCategory::Svcomp => "svcomp",
        }
    }
}

/// Default search order for undefined-symbol resolution.
pub const DEFAULT_LINK_CATEGORIES: [LinkCategory; 3] = [
    LinkCategory::Verifier,
    LinkCategory::Libc,
    LinkCategory::Posix,
];

/// Adapter-level failures detected before a tool even runs.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("tool `{0}` not found in PATH")]
    ToolNotFound(String),
    #[error("required artifact missing: {0}")]
    MissingArtifact(PathBuf),
}

/// Failure inside an adapter hook; the pipeline turns this into a stage
/// error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// The pipeline surface available to adapter hooks.
#[async_trait]
pub trait PipelineOps: Send {
    /// Bitcode file the pipeline is currently working on.
    fn current_file(&self) -> &Path;

    /// Replace the working file with a tool-produced artifact.
    fn set_current_file(&mut self, path: PathBuf);

    /// Run an external command inside the scratch directory.
    async fn run_command(&mut self, argv: Vec<String>) -> Result<(), HookError>;

    /// Run LLVM passes over the working file.
    async fn run_passes(&mut self, passes: &[String]) -> Result<(), HookError>;

    /// Link definitions for the named undefined symbols, searching only the
    /// given categories. Does not re-query for newly introduced undefined
    /// symbols.
    async fn link_undefined(
        &mut self,
        categories: &[LinkCategory],
        only: &[String],
    ) -> Result<(), HookError>;
}

/// One entry of a tool's verification schedule.
#[derive(Clone)]
pub struct PortfolioStep {
    pub adapter: Arc<dyn ToolAdapter>,
    /// Extra tool options for this step (e.g. an unwind bound).
    pub options: Vec<String>,
    /// Restricts which verdict classes this step may report as real.
    pub filter: Option<ResultFilter>,
    /// Per-step wall-clock budget.
    pub budget: Option<Duration>,
}

impl PortfolioStep {
    pub fn new(adapter: Arc<dyn ToolAdapter>) -> Self {
        Self {
            adapter,
            options: Vec::new(),
            filter: None,
            budget: None,
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, filter: ResultFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Everything tool-specific about one verification backend.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tool name; also the default executable name and the subdirectory
    /// searched first for tool-specific symbol definitions.
    fn name(&self) -> &'static str;

    /// The property this adapter instance was built for.
    fn property(&self) -> &Property;

    /// Locate the tool binary.
    fn executable(&self) -> Result<PathBuf, AdapterError> {
        find_executable(self.name())
            .ok_or_else(|| AdapterError::ToolNotFound(self.name().to_string()))
    }

    /// Files that must exist for the tool to run at all.
    fn required_artifacts(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Extra compiler flags for this tool and property.
    fn compilation_options(&self) -> Vec<String> {
        let prp = self.property();
        let mut opts = Vec::new();
        if prp.undefinedness() {
            opts.push("-fsanitize=undefined".to_string());
            opts.push("-fno-sanitize=unsigned-integer-overflow".to_string());
        } else if prp.overflow() {
            opts.push("-fsanitize=signed-integer-overflow".to_string());
            opts.push("-fsanitize=shift".to_string());
        }
        opts
    }

    /// What the slicer keeps for this property.
    fn slicing_criterion(&self) -> SlicingCriterion {
        default_slicing_criterion(self.property())
    }

    /// Instrumentation to apply, or `None` when the property needs none.
    fn instrumentation_plan(&self) -> Option<InstrumentationPlan> {
        default_instrumentation_plan(self.property())
    }

    /// LLVM passes to run right after compilation.
    fn passes_after_compilation(&self, _sources: &[PathBuf]) -> Vec<String> {
        Vec::new()
    }

    /// LLVM passes to run just before slicing.
    fn passes_before_slicing(&self) -> Vec<String> {
        Vec::new()
    }

    /// LLVM passes to run right after slicing.
    fn passes_after_slicing(&self) -> Vec<String> {
        Vec::new()
    }

    /// LLVM passes to run as the last transformation before verification.
    fn passes_before_verification(&self) -> Vec<String> {
        Vec::new()
    }

    /// Hook before slicing (e.g. link atomic-section stubs first).
    async fn actions_before_slicing(&self, _ops: &mut dyn PipelineOps) -> Result<(), HookError> {
        Ok(())
    }

    /// Hook after slicing (e.g. unroll loops for a bounded tool).
    async fn actions_after_slicing(&self, _ops: &mut dyn PipelineOps) -> Result<(), HookError> {
        Ok(())
    }

    /// Hook right before verification (e.g. translate bitcode to C).
    async fn actions_before_verification(
        &self,
        _ops: &mut dyn PipelineOps,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Compose the verification command line. Pure: no filesystem access.
    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        inputs: &[PathBuf],
        property_file: Option<&Path>,
        rlimits: &ResourceLimits,
    ) -> Vec<String>;

    /// Classify the tool's output. Total: malformed output maps to
    /// [`Verdict::Error`], a timed-out run to [`Verdict::Timeout`].
    fn parse_verdict(&self, outcome: &RunOutcome, output: &[Vec<u8>]) -> Verdict;

    /// The tool's verification schedule for the active property.
    fn portfolio(&self) -> Vec<PortfolioStep>;
}

/// The property-derived slicing criterion shared by all tools.
pub fn default_slicing_criterion(property: &Property) -> SlicingCriterion {
    if property.memsafety().any() {
        // slice with respect to the memory handling operations
        SlicingCriterion::new([
            "__INSTR_mark_pointer",
            "__INSTR_mark_free",
            "__INSTR_mark_allocation",
        ])
        .with_options(["-criteria-are-next-instr"])
    } else if property.memcleanup() {
        SlicingCriterion::new(["__INSTR_mark_free", "__INSTR_mark_allocation"])
            .with_options(["-criteria-are-next-instr"])
    } else if property.termination() {
        // program exits are the criteria; the non-termination markers call
        // them, and the slicer needs the non-standard dominance algorithm
        SlicingCriterion::new(["__INSTR_fail", "__VERIFIER_exit"]).with_options(["-cd-alg=ntscd"])
    } else if property.reachability() {
        SlicingCriterion::new(property.error_calls().iter().map(String::as_str))
    } else {
        SlicingCriterion::new(["__assert_fail", "__VERIFIER_error"])
    }
}

/// The property-derived instrumentation plan shared by all tools.
///
/// Marker-style instrumentation (memsafety, memcleanup) leaves the
/// definitions unlinked until after slicing so that optimizations cannot
/// remove the marker calls.
pub fn default_instrumentation_plan(property: &Property) -> Option<InstrumentationPlan> {
    if property.memsafety().any() {
        Some(InstrumentationPlan::new(
            "memsafety",
            "config-marker.json",
            "marker.c",
            false,
        ))
    } else if property.memcleanup() {
        Some(InstrumentationPlan::new(
            "memsafety",
            "config-marker-memcleanup.json",
            "marker.c",
            false,
        ))
    } else if property.overflow() {
        Some(InstrumentationPlan::new(
            "int_overflows",
            "config.json",
            "overflows.c",
            true,
        ))
    } else if property.termination() {
        Some(InstrumentationPlan::new(
            "termination",
            "config.json",
            "termination.c",
            true,
        ))
    } else {
        None
    }
}
