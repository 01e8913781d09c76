//! Program preparation pipeline.
//!
//! One [`Pipeline`] run drives a set of C sources through a fixed stage
//! sequence: compile to bitcode, link unconditional definitions, prepare
//! passes, instrument, slice, optimize, tool-specific finishing. Every stage
//! produces a fresh bitcode file and advances the single-owner
//! [`PipelineState`]; adapter hooks observe and mutate the run only through
//! the [`PipelineOps`] interface.
//!
//! Undefined-symbol linking is a fixed-point computation: newly linked
//! definitions can themselves be undefined, so the pipeline re-queries
//! `llvm-nm` until a resolution round links nothing new. The loop is
//! iterative with an explicit termination check; the set of linked symbols
//! grows monotonically and the library is finite.

pub mod optimizations;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use sliceprove_adapters::{
    HookError, LinkCategory, PipelineOps, ToolAdapter, DEFAULT_LINK_CATEGORIES,
};
use sliceprove_process::{
    CancelToken, CommandSpec, Executor, RunOutcome, SupervisorError, SystemExecutor,
};
use sliceprove_property::Property;

pub use optimizations::OptPreset;

/// Warning groups silenced for every compile; benchmark sources are noisy.
const COMPILE_WARNING_OPTS: [&str; 5] = [
    "-Wno-unused-parameter",
    "-Wno-unknown-attributes",
    "-Wno-unused-label",
    "-Wno-unknown-pragmas",
    "-Wno-unused-command-line-argument",
];

/// Loop transformations applied before slicing so later optimizations cannot
/// make broken infinite loops syntactically infinite again. `-reg2mem` goes
/// first; loop breaking cannot handle PHI nodes.
const LOOP_BREAKING_BUNDLE: [&str; 6] = [
    "-reg2mem",
    "-break-infinite-loops",
    "-remove-infinite-loops",
    "-mem2reg",
    "-break-crit-loops",
    "-lowerswitch",
];

/// Pipeline configuration: tool names, library locations and stage policy.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub clang: String,
    pub opt: String,
    pub llvm_link: String,
    pub llvm_nm: String,
    pub instrumenter: String,
    pub slicer: String,
    /// Plugin loaded into `opt` for the project-specific passes.
    pub opt_plugin: Option<String>,
    pub is_32bit: bool,
    pub no_slice: bool,
    /// Treat slicer failure as a stage error instead of falling back to the
    /// unsliced file.
    pub require_slicer: bool,
    pub repeat_slicing: u32,
    /// Unroll every loop this many times right after compilation; 0 turns
    /// unrolling off.
    pub unroll_count: u32,
    pub no_optimize: bool,
    /// Optimization passes run before slicing.
    pub optimize_before: Vec<String>,
    /// Optimization passes run after slicing.
    pub optimize_after: Vec<String>,
    /// Root of the symbol definition library (`<root>/<category>/...`).
    pub lib_root: PathBuf,
    /// Root of the instrumentation configs (`<root>/<domain>/...`).
    pub instrumentation_root: PathBuf,
    /// Category search order for undefined-symbol resolution.
    pub link_categories: Vec<LinkCategory>,
    /// Symbols whose definitions are linked unconditionally after compilation.
    pub link_always: Vec<String>,
    pub slicer_budget: Option<Duration>,
    pub instrumenter_budget: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clang: "clang".to_string(),
            opt: "opt".to_string(),
            llvm_link: "llvm-link".to_string(),
            llvm_nm: "llvm-nm".to_string(),
            instrumenter: "sbt-instr".to_string(),
            slicer: "sbt-slicer".to_string(),
            opt_plugin: Some("LLVMsbt.so".to_string()),
            is_32bit: false,
            no_slice: false,
            require_slicer: false,
            repeat_slicing: 1,
            unroll_count: 0,
            no_optimize: false,
            optimize_before: Vec::new(),
            optimize_after: OptPreset::Klee
                .passes()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            lib_root: PathBuf::from("lib"),
            instrumentation_root: PathBuf::from("instrumentation"),
            link_categories: DEFAULT_LINK_CATEGORIES.to_vec(),
            link_always: Vec::new(),
            slicer_budget: Some(Duration::from_secs(300)),
            instrumenter_budget: Some(Duration::from_secs(120)),
        }
    }
}

/// Pipeline failures; each one aborts the current configuration only.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("`{command}` failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },
    #[error("`{command}` exceeded its time budget")]
    CommandTimeout { command: String },
    #[error("missing file: {0}")]
    MissingFile(PathBuf),
    #[error("slicing failed and this run requires the slicer")]
    SlicingRequired,
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("adapter hook failed: {0}")]
    Hook(#[from] HookError),
}

/// Finds the definition source for an undefined symbol.
pub trait DefinitionResolver: Send + Sync {
    fn resolve(&self, category: LinkCategory, tool: &str, symbol: &str) -> Option<PathBuf>;
}

/// Filesystem resolver over `<root>/<category>/[<tool>/]<symbol>.c`, most
/// specific location first.
#[derive(Debug, Clone)]
pub struct LibraryResolver {
    root: PathBuf,
}

impl LibraryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DefinitionResolver for LibraryResolver {
    fn resolve(&self, category: LinkCategory, tool: &str, symbol: &str) -> Option<PathBuf> {
        let file = format!("{symbol}.c");
        let specific = self.root.join(category.dir_name()).join(tool).join(&file);
        if specific.is_file() {
            return Some(specific);
        }
        let generic = self.root.join(category.dir_name()).join(&file);
        generic.is_file().then_some(generic)
    }
}

/// Read-mostly cache of compiled instrumentation definition modules, shared
/// across portfolio configurations.
#[derive(Debug, Default)]
pub struct DefinitionsCache {
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl DefinitionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, key: &str) -> Option<PathBuf> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn store(&self, key: &str, path: PathBuf) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), path);
        }
    }
}

/// Mutable record threaded through one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineState {
    current: PathBuf,
    sources: Vec<PathBuf>,
    linked: Vec<String>,
}

impl PipelineState {
    /// The bitcode file all later stages operate on.
    pub fn current_file(&self) -> &Path {
        &self.current
    }

    /// Symbols whose definitions were linked in, for diagnostics.
    pub fn linked_symbols(&self) -> &[String] {
        &self.linked
    }
}

/// One preparation run for one portfolio configuration.
pub struct Pipeline {
    config: PipelineConfig,
    adapter: Arc<dyn ToolAdapter>,
    executor: Arc<dyn Executor>,
    resolver: Arc<dyn DefinitionResolver>,
    definitions: Arc<DefinitionsCache>,
    cancel: CancelToken,
    work_dir: PathBuf,
    state: PipelineState,
    seq: u32,
}

impl Pipeline {
    pub fn new(adapter: Arc<dyn ToolAdapter>, config: PipelineConfig, work_dir: PathBuf) -> Self {
        let resolver = Arc::new(LibraryResolver::new(config.lib_root.clone()));
        Self {
            config,
            adapter,
            executor: Arc::new(SystemExecutor::new()),
            resolver,
            definitions: Arc::new(DefinitionsCache::new()),
            cancel: CancelToken::new(),
            work_dir,
            state: PipelineState::default(),
            seq: 0,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DefinitionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_definitions_cache(mut self, cache: Arc<DefinitionsCache>) -> Self {
        self.definitions = cache;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Run the whole preparation sequence and return the final bitcode file.
    pub async fn run(&mut self, sources: &[PathBuf]) -> Result<PathBuf, PipelineError> {
        let adapter = Arc::clone(&self.adapter);
        self.state.sources = sources.to_vec();

        self.compile_sources(sources).await?;
        self.apply_passes(&adapter.passes_after_compilation(sources))
            .await?;

        if self.config.unroll_count > 0 {
            let unroll = vec![
                "-reg2mem".to_string(),
                "-sbt-loop-unroll".to_string(),
                "-sbt-loop-unroll-count".to_string(),
                self.config.unroll_count.to_string(),
                "-sbt-loop-unroll-terminate".to_string(),
            ];
            self.apply_passes(&unroll).await?;
        }

        // link what must be present under any circumstances
        let always = self.config.link_always.clone();
        let categories = self.config.link_categories.clone();
        self.resolve_and_link(&categories, &always).await?;

        let prepare = prepare_passes(adapter.property());
        self.apply_passes(&to_owned(&prepare)).await?;

        let deferred_definitions = self.instrument().await?;

        let post_instr = post_instrumentation_passes(adapter.property());
        self.apply_passes(&to_owned(&post_instr)).await?;

        let mut before = self.config.optimize_before.clone();
        if !self.config.no_slice && !before.is_empty() {
            before.extend(LOOP_BREAKING_BUNDLE.iter().map(|s| s.to_string()));
        }
        self.optimize(&before).await?;

        adapter.actions_before_slicing(self).await?;
        self.apply_passes(&adapter.passes_before_slicing()).await?;

        if !self.config.no_slice {
            self.perform_slicing().await?;
        }
        adapter.actions_after_slicing(self).await?;

        // postprocessing: slicing and the sbt passes may have created new
        // loops and stripped attributes the verifiers rely on
        let mut passes = to_owned(&post_slice_passes(adapter.property()));
        passes.extend(adapter.passes_after_slicing());
        self.apply_passes(&passes).await?;

        // marker definitions deliberately left unlinked during
        // instrumentation get linked now, out of the optimizer's reach
        if let Some(definitions) = deferred_definitions {
            self.link(vec![definitions]).await?;
        }
        self.link_undefined_closure(&categories).await?;

        let after = self.config.optimize_after.clone();
        self.optimize(&after).await?;

        self.apply_passes(&adapter.passes_before_verification())
            .await?;
        adapter.actions_before_verification(self).await?;

        // pre-verification actions may have introduced fresh undefined
        // symbols (e.g. nondet stubs)
        self.link_undefined_closure(&categories).await?;

        info!(file = %self.state.current.display(), "preparation finished");
        Ok(self.state.current.clone())
    }

    fn next_output(&mut self, tag: &str) -> PathBuf {
        self.seq += 1;
        self.work_dir.join(format!("{:02}-{}.bc", self.seq, tag))
    }

    async fn exec(
        &self,
        argv: Vec<String>,
        budget: Option<Duration>,
    ) -> Result<(RunOutcome, Vec<Vec<u8>>), PipelineError> {
        let spec = CommandSpec::new(argv)
            .with_cwd(&self.work_dir)
            .with_budget(budget);
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut sink = |line: &[u8]| lines.push(line.to_vec());
        let outcome = self.executor.run(&spec, &mut sink, &self.cancel).await?;
        Ok((outcome, lines))
    }

    /// Run a command and require success.
    async fn checked(
        &self,
        argv: Vec<String>,
        budget: Option<Duration>,
    ) -> Result<Vec<Vec<u8>>, PipelineError> {
        let command = argv.join(" ");
        let (outcome, lines) = self.exec(argv, budget).await?;
        if outcome.timed_out {
            return Err(PipelineError::CommandTimeout { command });
        }
        if !outcome.success() {
            for line in &lines {
                debug!(command = %command, "{}", String::from_utf8_lossy(line).trim_end());
            }
            let code = if outcome.signal != 0 {
                128 + outcome.signal
            } else {
                outcome.exit_code
            };
            return Err(PipelineError::CommandFailed { command, code });
        }
        Ok(lines)
    }

    async fn compile_to_llvm(
        &self,
        source: &Path,
        output: &Path,
        with_debuginfo: bool,
        extra: &[String],
    ) -> Result<(), PipelineError> {
        let mut argv = vec![
            self.config.clang.clone(),
            "-c".to_string(),
            "-emit-llvm".to_string(),
            "-D__inline=".to_string(),
        ];
        if with_debuginfo {
            argv.push("-g".to_string());
        }
        if self.config.is_32bit {
            argv.push("-m32".to_string());
        }
        argv.extend(extra.iter().cloned());
        argv.push("-o".to_string());
        argv.push(output.display().to_string());
        argv.push(source.display().to_string());
        self.checked(argv, None).await?;
        Ok(())
    }

    async fn compile_sources(&mut self, sources: &[PathBuf]) -> Result<(), PipelineError> {
        let mut opts: Vec<String> = COMPILE_WARNING_OPTS.iter().map(|s| s.to_string()).collect();
        if self.adapter.property().memsafety().any() {
            // instrument scopes so stack lifetimes are visible
            opts.push("-Xclang".to_string());
            opts.push("-fsanitize-address-use-after-scope".to_string());
        }
        opts.extend(self.adapter.compilation_options());
        // the pipeline decides what gets optimized and when
        opts.push("-O0".to_string());
        opts.push("-disable-llvm-passes".to_string());

        let mut units = Vec::with_capacity(sources.len());
        for (n, source) in sources.iter().enumerate() {
            let stem = source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unit".to_string());
            let output = self.work_dir.join(format!("{stem}-{n}.bc"));
            self.compile_to_llvm(source, &output, true, &opts).await?;
            units.push(output);
        }
        let output = self.next_output("code");
        let mut argv = vec![
            self.config.llvm_link.clone(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        argv.extend(units.iter().map(|p| p.display().to_string()));
        self.checked(argv, None).await?;
        self.state.current = output;
        Ok(())
    }

    /// Link extra bitcode modules into the current file.
    async fn link(&mut self, modules: Vec<PathBuf>) -> Result<(), PipelineError> {
        let output = self.next_output("linked");
        let mut argv = vec![
            self.config.llvm_link.clone(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        argv.extend(modules.iter().map(|p| p.display().to_string()));
        argv.push(self.state.current.display().to_string());
        self.checked(argv, None).await?;
        self.state.current = output;
        Ok(())
    }

    async fn apply_passes(&mut self, passes: &[String]) -> Result<(), PipelineError> {
        if passes.is_empty() {
            return Ok(());
        }
        let output = self.next_output("opt");
        let mut argv = vec![self.config.opt.clone()];
        if let Some(plugin) = &self.config.opt_plugin {
            argv.push("-load".to_string());
            argv.push(plugin.clone());
        }
        argv.push("-o".to_string());
        argv.push(output.display().to_string());
        argv.push(self.state.current.display().to_string());
        argv.extend(passes.iter().cloned());
        self.checked(argv, None).await?;
        self.state.current = output;
        Ok(())
    }

    async fn optimize(&mut self, passes: &[String]) -> Result<(), PipelineError> {
        if self.config.no_optimize || passes.is_empty() {
            return Ok(());
        }
        let disabled = optimizations::disabled_for(self.adapter.property());
        let filtered = optimizations::filter_passes(passes, &disabled);
        if filtered.is_empty() {
            debug!("no optimization passes left after filtering");
            return Ok(());
        }
        self.apply_passes(&filtered).await
    }

    async fn undefined_symbols(&self) -> Result<Vec<String>, PipelineError> {
        let argv = vec![
            self.config.llvm_nm.clone(),
            "-undefined-only".to_string(),
            "-just-symbol-name".to_string(),
            self.state.current.display().to_string(),
        ];
        let lines = self.checked(argv, None).await?;
        Ok(lines
            .iter()
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|sym| !sym.is_empty() && !sym.starts_with("llvm."))
            .collect())
    }

    /// One resolution round: look the symbols up in the library, compile and
    /// link whatever was found. Returns the newly linked symbol names.
    async fn resolve_and_link(
        &mut self,
        categories: &[LinkCategory],
        symbols: &[String],
    ) -> Result<Vec<String>, PipelineError> {
        let mut compiled = Vec::new();
        let mut newly = Vec::new();
        for symbol in symbols {
            if self.state.linked.iter().any(|s| s == symbol) {
                continue;
            }
            let source = categories
                .iter()
                .find_map(|cat| self.resolver.resolve(*cat, self.adapter.name(), symbol));
            let Some(source) = source else { continue };
            let output = self.work_dir.join(format!("{symbol}.bc"));
            self.compile_to_llvm(&source, &output, true, &[]).await?;
            debug!(symbol = %symbol, source = %source.display(), "linking definition");
            compiled.push(output);
            newly.push(symbol.clone());
        }
        if !compiled.is_empty() {
            self.link(compiled).await?;
            self.state.linked.extend(newly.iter().cloned());
        }
        Ok(newly)
    }

    /// Resolve undefined symbols to a fixed point: freshly linked definitions
    /// may bring in new undefined symbols, so re-query until a round links
    /// nothing new.
    async fn link_undefined_closure(
        &mut self,
        categories: &[LinkCategory],
    ) -> Result<(), PipelineError> {
        loop {
            let undefined = self.undefined_symbols().await?;
            let newly = self.resolve_and_link(categories, &undefined).await?;
            if newly.is_empty() {
                return Ok(());
            }
        }
    }

    /// Instrument per the adapter's plan. Returns the compiled definitions
    /// module when the plan defers its linking until after slicing.
    async fn instrument(&mut self) -> Result<Option<PathBuf>, PipelineError> {
        let Some(plan) = self.adapter.instrumentation_plan() else {
            return Ok(None);
        };
        let config_path = self
            .config
            .instrumentation_root
            .join(plan.domain)
            .join(&plan.config_file);
        if !config_path.is_file() {
            return Err(PipelineError::MissingFile(config_path));
        }

        let key = format!("{}/{}", plan.domain, plan.definitions_file);
        let definitions_bc = match self.definitions.lookup(&key) {
            Some(path) => path,
            None => {
                let source = self
                    .config
                    .instrumentation_root
                    .join(plan.domain)
                    .join(&plan.definitions_file);
                if !source.is_file() {
                    return Err(PipelineError::MissingFile(source));
                }
                let stem = Path::new(&plan.definitions_file)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "definitions".to_string());
                let output = self.work_dir.join(format!("{stem}.bc"));
                self.compile_to_llvm(&source, &output, false, &["-O3".to_string()])
                    .await?;
                self.definitions.store(&key, output.clone());
                output
            }
        };

        info!(domain = plan.domain, config = %plan.config_file, "instrumenting");
        let output = self.next_output("inst");
        let mut argv = vec![
            self.config.instrumenter.clone(),
            config_path.display().to_string(),
            self.state.current.display().to_string(),
            definitions_bc.display().to_string(),
            output.display().to_string(),
        ];
        if !plan.link_definitions {
            argv.push("--no-linking".to_string());
        }
        self.checked(argv, self.config.instrumenter_budget).await?;
        self.state.current = output;

        Ok((!plan.link_definitions).then_some(definitions_bc))
    }

    /// One slicer invocation. Returns false when slicing failed and the run
    /// falls back to the unsliced file.
    async fn slice_once(&mut self) -> Result<bool, PipelineError> {
        let criterion = self.adapter.slicing_criterion();
        // the slicer writes <input stem>.sliced
        let output = self.state.current.with_extension("sliced");
        let mut argv = vec![
            self.config.slicer.clone(),
            "-c".to_string(),
            criterion.symbols.join(","),
        ];
        argv.extend(criterion.options.iter().cloned());
        argv.push(self.state.current.display().to_string());
        let command = argv.join(" ");

        let (outcome, lines) = self.exec(argv, self.config.slicer_budget).await?;
        if outcome.success() {
            self.state.current = output;
            return Ok(true);
        }
        if outcome.timed_out {
            warn!("slicing timed out, using the unsliced file");
        } else {
            for line in &lines {
                debug!(command = %command, "{}", String::from_utf8_lossy(line).trim_end());
            }
            warn!("slicing failed, using the unsliced file");
        }
        if self.config.require_slicer {
            return Err(PipelineError::SlicingRequired);
        }
        Ok(false)
    }

    async fn perform_slicing(&mut self) -> Result<(), PipelineError> {
        let rounds = self.config.repeat_slicing.max(1);
        for round in 0..rounds {
            debug!(round = round + 1, "slicing");
            if !self.slice_once().await? {
                return Ok(());
            }
            if rounds > 1 {
                // re-optimize so the next slicing round works on a reduced
                // program
                let mut passes = self.config.optimize_after.clone();
                passes.push("-remove-infinite-loops".to_string());
                self.optimize(&passes).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineOps for Pipeline {
    fn current_file(&self) -> &Path {
        &self.state.current
    }

    fn set_current_file(&mut self, path: PathBuf) {
        self.state.current = path;
    }

    async fn run_command(&mut self, argv: Vec<String>) -> Result<(), HookError> {
        self.checked(argv, None)
            .await
            .map(|_| ())
            .map_err(|err| HookError(err.to_string()))
    }

    async fn run_passes(&mut self, passes: &[String]) -> Result<(), HookError> {
        self.apply_passes(passes)
            .await
            .map_err(|err| HookError(err.to_string()))
    }

    async fn link_undefined(
        &mut self,
        categories: &[LinkCategory],
        only: &[String],
    ) -> Result<(), HookError> {
        self.resolve_and_link(categories, only)
            .await
            .map(|_| ())
            .map_err(|err| HookError(err.to_string()))
    }
}

/// Passes preparing the program for instrumentation. `-remove-error-calls`
/// must go first; the later passes may themselves insert error calls.
fn prepare_passes(property: &Property) -> Vec<&'static str> {
    let mut passes = Vec::new();
    if property.memsafety().any()
        || property.undefinedness()
        || property.overflow()
        || property.termination()
        || property.memcleanup()
    {
        passes.push("-remove-error-calls");
    }
    if property.memcleanup() {
        passes.push("-remove-error-calls-use-exit");
    }
    if !property.termination() {
        passes.push("-remove-infinite-loops");
    }
    if property.undefinedness() || property.overflow() {
        passes.push("-replace-ubsan");
    }
    if property.overflow() {
        passes.push("-prepare-overflows");
        passes.push("-mem2reg");
        passes.push("-break-crit-edges");
    }
    passes
}

/// Passes protecting instrumentation artifacts from the optimizer.
fn post_instrumentation_passes(property: &Property) -> Vec<&'static str> {
    let mut passes = Vec::new();
    if property.memsafety().any() {
        // lifetime intrinsics become scope calls; instrumented loads and
        // stores become volatile so optimizations keep them
        passes.push("-replace-lifetime-markers");
        passes.push("-mark-volatile");
    }
    passes
}

/// Cleanup passes after slicing, before the final optimization.
fn post_slice_passes(property: &Property) -> Vec<&'static str> {
    let mut passes = Vec::new();
    if !property.termination() {
        // slicing may have created new infinite loops
        passes.push("-remove-infinite-loops");
    }
    if property.memsafety().any() {
        passes.push("-remove-readonly-attr");
        passes.push("-dummy-marker");
    }
    passes
}

fn to_owned(passes: &[&str]) -> Vec<String> {
    passes.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use sliceprove_adapters::{PortfolioStep, ResourceLimits};
    use sliceprove_process::LineSink;
    use sliceprove_result::Verdict;

    /// Scripted executor: every command succeeds silently, except `llvm-nm`
    /// invocations which replay a queue of canned outputs, and programs
    /// listed in `failures` which exit non-zero.
    struct ScriptedExecutor {
        commands: Mutex<Vec<Vec<String>>>,
        nm_outputs: Mutex<VecDeque<Vec<&'static str>>>,
        failures: Vec<(String, i32)>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                nm_outputs: Mutex::new(VecDeque::new()),
                failures: Vec::new(),
            }
        }

        fn with_nm_rounds(self, rounds: Vec<Vec<&'static str>>) -> Self {
            *self.nm_outputs.lock().unwrap() = rounds.into();
            self
        }

        fn failing(mut self, program: &str, code: i32) -> Self {
            self.failures.push((program.to_string(), code));
            self
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }

        fn count_of(&self, program: &str) -> usize {
            self.commands()
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
            let program = spec.argv[0].as_str();
            if program == "llvm-nm" {
                if let Some(symbols) = self.nm_outputs.lock().unwrap().pop_front() {
                    for symbol in symbols {
                        sink.line(format!("{symbol}\n").as_bytes());
                    }
                }
            }
            let code = self
                .failures
                .iter()
                .find(|(name, _)| name == program)
                .map(|(_, code)| *code)
                .unwrap_or(0);
            Ok(RunOutcome {
                exit_code: code,
                signal: 0,
                timed_out: false,
            })
        }
    }

    /// Resolver backed by a fixed symbol table, no filesystem involved.
    struct TableResolver {
        known: Vec<&'static str>,
    }

    impl DefinitionResolver for TableResolver {
        fn resolve(&self, category: LinkCategory, _tool: &str, symbol: &str) -> Option<PathBuf> {
            if category != LinkCategory::Verifier {
                return None;
            }
            self.known
                .contains(&symbol)
                .then(|| PathBuf::from(format!("/defs/{symbol}.c")))
        }
    }

    struct FakeAdapter {
        property: Arc<Property>,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                property: Arc::new(Property::default_assertions()),
            }
        }
    }

    #[async_trait]
    impl ToolAdapter for FakeAdapter {
        fn name(&self) -> &'static str {
            "faketool"
        }

        fn property(&self) -> &Property {
            &self.property
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
            Verdict::True
        }

        fn portfolio(&self) -> Vec<PortfolioStep> {
            Vec::new()
        }
    }

    fn pipeline_with(executor: Arc<ScriptedExecutor>, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            Arc::new(FakeAdapter::new()),
            config,
            PathBuf::from("/tmp/work"),
        )
        .with_executor(executor)
        .with_resolver(Arc::new(TableResolver {
            known: vec!["fopen", "fclose"],
        }))
    }

    #[tokio::test]
    async fn linking_closure_reaches_a_fixed_point() {
        // round 1 uncovers fopen, linking it uncovers fclose, linking that
        // leaves only an unresolvable symbol
        let executor = Arc::new(ScriptedExecutor::new().with_nm_rounds(vec![
            vec!["fopen"],
            vec!["fclose"],
            vec!["frobnicate"],
        ]));
        let mut pipeline = pipeline_with(Arc::clone(&executor), PipelineConfig::default());
        pipeline.state.current = PathBuf::from("/tmp/work/code.bc");

        let categories = vec![LinkCategory::Verifier];
        pipeline.link_undefined_closure(&categories).await.unwrap();

        assert_eq!(pipeline.state().linked_symbols(), ["fopen", "fclose"]);
        assert_eq!(executor.count_of("llvm-nm"), 3);
        assert_eq!(executor.count_of("llvm-link"), 2);
    }

    #[tokio::test]
    async fn closure_stops_immediately_when_nothing_resolves() {
        let executor =
            Arc::new(ScriptedExecutor::new().with_nm_rounds(vec![vec!["frobnicate"]]));
        let mut pipeline = pipeline_with(Arc::clone(&executor), PipelineConfig::default());
        pipeline.state.current = PathBuf::from("/tmp/work/code.bc");

        let categories = vec![LinkCategory::Verifier];
        pipeline.link_undefined_closure(&categories).await.unwrap();

        assert!(pipeline.state().linked_symbols().is_empty());
        assert_eq!(executor.count_of("llvm-nm"), 1);
        assert_eq!(executor.count_of("llvm-link"), 0);
    }

    #[tokio::test]
    async fn restricted_link_does_not_requery() {
        let executor = Arc::new(ScriptedExecutor::new());
        let mut pipeline = pipeline_with(Arc::clone(&executor), PipelineConfig::default());
        pipeline.state.current = PathBuf::from("/tmp/work/code.bc");

        let categories = [LinkCategory::Verifier];
        let only = vec!["fopen".to_string(), "frobnicate".to_string()];
        PipelineOps::link_undefined(&mut pipeline, &categories, &only)
            .await
            .unwrap();

        assert_eq!(pipeline.state().linked_symbols(), ["fopen"]);
        assert_eq!(executor.count_of("llvm-nm"), 0);
    }

    #[tokio::test]
    async fn full_run_slices_once_by_default() {
        let executor = Arc::new(ScriptedExecutor::new());
        let mut pipeline = pipeline_with(Arc::clone(&executor), PipelineConfig::default());
        pipeline
            .run(&[PathBuf::from("prog.c")])
            .await
            .unwrap();
        assert_eq!(executor.count_of("sbt-slicer"), 1);
        assert_eq!(executor.count_of("clang"), 1);
    }

    #[tokio::test]
    async fn single_slicing_round_matches_the_plain_run() {
        let baseline = Arc::new(ScriptedExecutor::new());
        let mut pipeline = pipeline_with(Arc::clone(&baseline), PipelineConfig::default());
        pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap();

        let executor = Arc::new(ScriptedExecutor::new());
        let config = PipelineConfig {
            repeat_slicing: 1,
            ..PipelineConfig::default()
        };
        let mut pipeline = pipeline_with(Arc::clone(&executor), config);
        pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap();

        // one round slices once and skips the between-round optimization
        assert_eq!(executor.count_of("sbt-slicer"), 1);
        assert_eq!(executor.commands(), baseline.commands());
    }

    #[tokio::test]
    async fn repeat_slicing_reoptimizes_between_rounds() {
        let executor = Arc::new(ScriptedExecutor::new());
        let config = PipelineConfig {
            repeat_slicing: 3,
            ..PipelineConfig::default()
        };
        let opt_runs_single = {
            let executor = Arc::new(ScriptedExecutor::new());
            let mut pipeline = pipeline_with(Arc::clone(&executor), PipelineConfig::default());
            pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap();
            executor.count_of("opt")
        };
        let mut pipeline = pipeline_with(Arc::clone(&executor), config);
        pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap();
        assert_eq!(executor.count_of("sbt-slicer"), 3);
        // one extra optimization run after every slicing round
        assert_eq!(executor.count_of("opt"), opt_runs_single + 3);
    }

    #[tokio::test]
    async fn slicer_failure_falls_back_to_the_unsliced_file() {
        let executor = Arc::new(ScriptedExecutor::new().failing("sbt-slicer", 1));
        let mut pipeline = pipeline_with(Arc::clone(&executor), PipelineConfig::default());
        let result = pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap();
        // the run completes and the final file is not the slicer's output
        assert_eq!(result.extension().unwrap(), "bc");
        assert_eq!(executor.count_of("sbt-slicer"), 1);
    }

    #[tokio::test]
    async fn slicer_failure_is_fatal_when_the_slicer_is_required() {
        let executor = Arc::new(ScriptedExecutor::new().failing("sbt-slicer", 1));
        let config = PipelineConfig {
            require_slicer: true,
            ..PipelineConfig::default()
        };
        let mut pipeline = pipeline_with(executor, config);
        let err = pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::SlicingRequired));
    }

    #[tokio::test]
    async fn compile_failure_aborts_the_run() {
        let executor = Arc::new(ScriptedExecutor::new().failing("clang", 1));
        let mut pipeline = pipeline_with(executor, PipelineConfig::default());
        let err = pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::CommandFailed { code: 1, .. }));
    }

    #[tokio::test]
    async fn no_slice_skips_the_slicer_entirely() {
        let executor = Arc::new(ScriptedExecutor::new());
        let config = PipelineConfig {
            no_slice: true,
            ..PipelineConfig::default()
        };
        let mut pipeline = pipeline_with(Arc::clone(&executor), config);
        pipeline.run(&[PathBuf::from("prog.c")]).await.unwrap();
        assert_eq!(executor.count_of("sbt-slicer"), 0);
    }

    #[tokio::test]
    async fn hook_run_command_can_replace_the_current_file() {
        let executor = Arc::new(ScriptedExecutor::new());
        let mut pipeline = pipeline_with(executor, PipelineConfig::default());
        pipeline.state.current = PathBuf::from("/tmp/work/code.bc");

        let ops: &mut dyn PipelineOps = &mut pipeline;
        ops.run_command(vec!["llvm2c".to_string(), "code.bc".to_string()])
            .await
            .unwrap();
        ops.set_current_file(PathBuf::from("/tmp/work/code.bc.c"));
        assert_eq!(ops.current_file(), Path::new("/tmp/work/code.bc.c"));
    }

    #[test]
    fn prepare_passes_follow_the_property() {
        let reach = Property::default_assertions();
        assert_eq!(prepare_passes(&reach), ["-remove-infinite-loops"]);

        let memsafety = Property::parse("memsafety").unwrap();
        assert_eq!(
            prepare_passes(&memsafety),
            ["-remove-error-calls", "-remove-infinite-loops"]
        );

        let termination = Property::parse("termination").unwrap();
        assert_eq!(prepare_passes(&termination), ["-remove-error-calls"]);

        let overflow = Property::parse("no-overflow").unwrap();
        assert_eq!(
            prepare_passes(&overflow),
            [
                "-remove-error-calls",
                "-remove-infinite-loops",
                "-replace-ubsan",
                "-prepare-overflows",
                "-mem2reg",
                "-break-crit-edges"
            ]
        );
    }

    #[test]
    fn memsafety_keeps_markers_alive_after_slicing() {
        let memsafety = Property::parse("memsafety").unwrap();
        assert_eq!(
            post_slice_passes(&memsafety),
            ["-remove-infinite-loops", "-remove-readonly-attr", "-dummy-marker"]
        );
        let termination = Property::parse("termination").unwrap();
        assert!(post_slice_passes(&termination).is_empty());
    }

    #[test]
    fn library_resolver_prefers_the_tool_specific_definition() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("libc/faketool")).unwrap();
        std::fs::write(root.join("libc/fopen.c"), "int fopen;").unwrap();
        std::fs::write(root.join("libc/faketool/fopen.c"), "int fopen;").unwrap();

        let resolver = LibraryResolver::new(root);
        let found = resolver
            .resolve(LinkCategory::Libc, "faketool", "fopen")
            .unwrap();
        assert!(found.ends_with("libc/faketool/fopen.c"));

        let generic = resolver
            .resolve(LinkCategory::Libc, "othertool", "fopen")
            .unwrap();
        assert!(generic.ends_with("libc/fopen.c"));

        assert!(resolver
            .resolve(LinkCategory::Libc, "faketool", "frobnicate")
            .is_none());
    }

    #[test]
    fn definitions_cache_round_trips() {
        let cache = DefinitionsCache::new();
        assert!(cache.lookup("memsafety/marker.c").is_none());
        cache.store("memsafety/marker.c", PathBuf::from("/cache/marker.bc"));
        assert_eq!(
            cache.lookup("memsafety/marker.c"),
            Some(PathBuf::from("/cache/marker.bc"))
        );
    }
}
