//! KLEE adapter.
//!
//! KLEE is the primary backend: a symbolic executor that explores paths and
//! reports memory errors, leaks and assertion failures directly. Its output
//! is classified through an ordered pattern table; the first pattern that
//! matches a line decides what the line means. The `EINITVALS` pattern
//! ("unable to compute initial values") poisons any error found in the same
//! run, because the reported counterexample cannot be trusted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use sliceprove_process::RunOutcome;
use sliceprove_property::Property;
use sliceprove_result::{FalseKind, Verdict};

use crate::traits::{PortfolioStep, ResourceLimits, ToolAdapter};

/// Configuration for the KLEE adapter.
#[derive(Debug, Clone)]
pub struct KleeConfig {
    /// Path to `klee`; `None` means PATH lookup.
    pub executable: Option<PathBuf>,
    /// Memory cap passed as `-max-memory`, in MiB.
    pub max_memory_mib: u64,
    /// Stop on the first error of the sought kind.
    pub exit_on_error: bool,
    /// Extra options appended to every invocation.
    pub extra_options: Vec<String>,
}

impl Default for KleeConfig {
    fn default() -> Self {
        Self {
            executable: None,
            max_memory_mib: 8000,
            exit_on_error: true,
            extra_options: Vec::new(),
        }
    }
}

/// What a matched output line means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    /// An assertion failure; the violated property decides the sub-kind.
    Assertion,
    /// A definite violation of the given kind.
    False(FalseKind),
    /// Invalidates any error found in the same run.
    Poison,
    /// Noteworthy but inconclusive.
    Diagnostic,
}

#[derive(Debug, Clone)]
struct Pattern {
    key: &'static str,
    re: Regex,
    kind: LineKind,
}

/// One classified output line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Finding {
    label: String,
    kind: LineKind,
}

/// KLEE adapter.
#[derive(Debug, Clone)]
pub struct KleeAdapter {
    config: KleeConfig,
    property: Arc<Property>,
    patterns: Vec<Pattern>,
}

impl KleeAdapter {
    pub fn new(property: Arc<Property>) -> Self {
        Self::with_config(property, KleeConfig::default())
    }

    pub fn with_config(property: Arc<Property>, config: KleeConfig) -> Self {
        Self {
            config,
            property,
            patterns: Self::compile_patterns(),
        }
    }

    // Ordered: the first match per line wins.
    fn compile_patterns() -> Vec<Pattern> {
        use FalseKind::*;
        use LineKind::*;
        let table: [(&'static str, &'static str, LineKind); 29] = [
            ("ASSERTIONFAILED", "ASSERTION FAIL:", Assertion),
            ("ASSERTIONFAILED2", "Assertion .* failed", Assertion),
            ("ESTPTIMEOUT", r"query timed out \(resolve\)", Diagnostic),
            ("EKLEETIMEOUT", "HaltTimer invoked", Diagnostic),
            ("EEXTENCALL", "failed external call", Diagnostic),
            ("EEXTENCALLDIS", "external calls disallowed", Diagnostic),
            ("ELOADSYM", "ERROR: unable to load symbol", Diagnostic),
            (
                "EINVALINST",
                "LLVM ERROR: Code generator does not support",
                Diagnostic,
            ),
            ("EINITVALS", "unable to compute initial values", Poison),
            ("ESYMSOL", "unable to get symbolic solution", Diagnostic),
            ("ESILENTLYCONCRETIZED", "silently concretizing", Diagnostic),
            ("EEXTRAARGS", "calling .* with extra arguments", Diagnostic),
            ("EPTRCMP", "WARNING.*: comparison of two pointers", Diagnostic),
            ("EMALLOC", "found huge malloc, returning 0", Diagnostic),
            ("ESKIPFORK", "skipping fork", Diagnostic),
            ("EKILLSTATE", r"killing.*states \(over memory cap\)", Diagnostic),
            ("EMEMERROR", "memory error: out of bound pointer", False(Deref)),
            (
                "EMAKESYMBOLIC",
                "memory error: invalid pointer: make_symbolic",
                Diagnostic,
            ),
            ("EVECTORUNSUP", "XXX vector instructions unhandled", Diagnostic),
            ("EFREE", "memory error: invalid pointer: free", False(Free)),
            ("EMEMALLOC", "KLEE: WARNING: Allocating memory failed", Diagnostic),
            ("ESTACKOVFLW", "WARNING: Maximum stack size reached", Diagnostic),
            ("EROSYMB", "cannot make readonly object symbolic", Diagnostic),
            ("EMEMLEAK", "memory error: memory leak detected", False(Memtrack)),
            (
                "EMEMCLEANUP",
                "memory error: memory not cleaned up",
                False(Memcleanup),
            ),
            ("EFREEALLOCA", "ERROR:.*free of alloca", False(Free)),
            (
                "ERESOLVMEMCLN",
                "Failed resolving segment in memcleanup check",
                Diagnostic,
            ),
            (
                "ERESOLVMEMCLN2",
                "Cannot resolve non-constant segment in memcleanup check",
                Diagnostic,
            ),
            ("ERESOLV", "ERROR:.*Could not resolve", Diagnostic),
        ];
        table
            .into_iter()
            .map(|(key, re, kind)| Pattern {
                key,
                re: Regex::new(re).expect("static regex"),
                kind,
            })
            .collect()
    }

    /// The sub-kind an assertion failure means under the active property.
    fn assertion_kind(&self) -> FalseKind {
        if self.property.overflow() {
            FalseKind::Overflow
        } else if self.property.termination() {
            FalseKind::Termination
        } else {
            FalseKind::Reach
        }
    }

    fn classify_line(&self, line: &str) -> Option<Finding> {
        for pattern in &self.patterns {
            if pattern.re.is_match(line) {
                let kind = match pattern.kind {
                    LineKind::Assertion => LineKind::False(self.assertion_kind()),
                    other => other,
                };
                let label = match kind {
                    LineKind::False(false_kind) => Verdict::False(false_kind).to_string(),
                    _ => pattern.key.to_string(),
                };
                return Some(Finding { label, kind });
            }
        }
        None
    }

    /// Does this violation answer the question the run was asked?
    fn matches_property(&self, kind: FalseKind) -> bool {
        let prp = &self.property;
        match kind {
            FalseKind::Reach => prp.reachability(),
            FalseKind::Deref => prp.memsafety().valid_deref,
            FalseKind::Free => prp.memsafety().valid_free,
            FalseKind::Memtrack => prp.memsafety().valid_memtrack,
            FalseKind::Memcleanup => prp.memcleanup(),
            FalseKind::Overflow => prp.overflow(),
            FalseKind::Termination => prp.termination(),
            _ => false,
        }
    }
}

#[async_trait]
impl ToolAdapter for KleeAdapter {
    fn name(&self) -> &'static str {
        "klee"
    }

    fn property(&self) -> &Property {
        &self.property
    }

    fn executable(&self) -> Result<PathBuf, crate::traits::AdapterError> {
        match &self.config.executable {
            Some(path) => Ok(path.clone()),
            None => sliceprove_process::find_executable(self.name()).ok_or_else(|| {
                crate::traits::AdapterError::ToolNotFound(self.name().to_string())
            }),
        }
    }

    fn passes_after_compilation(&self, sources: &[PathBuf]) -> Vec<String> {
        // name the nondeterministic inputs so test cases can be mapped back
        // to source variables
        let mut passes = vec!["-make-nondet".to_string()];
        if let Some(source) = sources.first() {
            passes.push(format!("-make-nondet-source={}", source.display()));
        }
        passes
    }

    fn passes_before_verification(&self) -> Vec<String> {
        vec![
            // make uninitialized variables symbolic
            "-initialize-uninitialized".to_string(),
            "-delete-undefined".to_string(),
            // make external globals non-deterministic
            "-internalize-globals".to_string(),
        ]
    }

    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        inputs: &[PathBuf],
        _property_file: Option<&Path>,
        rlimits: &ResourceLimits,
    ) -> Vec<String> {
        let prp = &self.property;
        let mut cmd = vec![
            executable.display().to_string(),
            "-dump-states-on-halt=0".to_string(),
            "--output-stats=0".to_string(),
            "--use-call-paths=0".to_string(),
            "--optimize=false".to_string(),
            "-silent-klee-assume=1".to_string(),
            "-istats-write-interval=60s".to_string(),
            "-only-output-states-covering-new=1".to_string(),
            "-use-forked-solver=0".to_string(),
            "-external-calls=pure".to_string(),
            format!(
                "-max-memory={}",
                rlimits.memory_mib.unwrap_or(self.config.max_memory_mib)
            ),
        ];
        if let Some(time) = rlimits.time {
            cmd.push(format!("-max-time={}", time.as_secs()));
        }
        if prp.memsafety().any() {
            cmd.push("-check-leaks".to_string());
        } else if prp.memcleanup() {
            cmd.push("-check-memcleanup".to_string());
        }
        if self.config.exit_on_error {
            if prp.memsafety().any() {
                for kind in ["Ptr", "Leak", "ReadOnly", "Free", "BadVectorAccess"] {
                    cmd.push(format!("-exit-on-error-type={kind}"));
                }
            } else if prp.memcleanup() {
                cmd.push("-exit-on-error-type=Leak".to_string());
            } else {
                cmd.push("-exit-on-error-type=Assert".to_string());
            }
        }
        cmd.extend(self.config.extra_options.iter().cloned());
        cmd.extend(options.iter().cloned());
        cmd.extend(inputs.iter().map(|p| p.display().to_string()));
        cmd
    }

    fn parse_verdict(&self, outcome: &RunOutcome, output: &[Vec<u8>]) -> Verdict {
        if outcome.timed_out {
            return Verdict::Timeout;
        }

        let mut found: Vec<Finding> = Vec::new();
        for line in output {
            let text = String::from_utf8_lossy(line);
            if let Some(finding) = self.classify_line(&text) {
                found.push(finding);
            }
        }
        debug!(findings = found.len(), "classified klee output");

        if found.is_empty() {
            return if outcome.exit_code != 0 {
                Verdict::Error(format!("klee exited with code {}", outcome.exit_code))
            } else if outcome.signal != 0 {
                Verdict::Error(format!("klee terminated by signal {}", outcome.signal))
            } else {
                Verdict::True
            };
        }

        let labels = || {
            found
                .iter()
                .map(|f| f.label.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };

        // EINITVALS breaks the validity of any found error
        if found.iter().any(|f| f.kind == LineKind::Poison) {
            return Verdict::Unknown(Some(labels()));
        }

        for finding in &found {
            if let LineKind::False(kind) = finding.kind {
                if self.matches_property(kind) {
                    return Verdict::False(kind);
                }
            }
        }

        Verdict::Unknown(Some(labels()))
    }

    fn portfolio(&self) -> Vec<PortfolioStep> {
        vec![PortfolioStep::new(Arc::new(self.clone()))]
    }
}
