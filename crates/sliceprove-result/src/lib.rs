//! Verdict taxonomy shared by every sliceprove component.
//!
//! Tool adapters classify raw tool output into a [`Verdict`]; the portfolio
//! scheduler decides whether a verdict is conclusive and the CLI maps it to a
//! process exit code. Display strings follow the SV-COMP result vocabulary so
//! downstream tooling can grep for `false(valid-deref)` and friends.

use std::fmt;

/// Sub-kind of a `false` verdict: which class of violation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FalseKind {
    /// An error call (or assertion) is reachable.
    Reach,
    /// Invalid dereference.
    Deref,
    /// Invalid free.
    Free,
    /// Memory leak (lost pointer).
    Memtrack,
    /// Memory not freed before exit.
    Memcleanup,
    /// Signed integer overflow.
    Overflow,
    /// A non-terminating execution exists.
    Termination,
    /// A deadlock is reachable.
    Deadlock,
    /// The formula is satisfiable.
    Sat,
    /// The formula is unsatisfiable.
    Unsat,
}

impl FalseKind {
    /// The SV-COMP sub-property name used inside `false(...)`.
    fn as_str(&self) -> &'static str {
        match self {
            FalseKind::Reach => "unreach-call",
            FalseKind::Deref => "valid-deref",
            FalseKind::Free => "valid-free",
            FalseKind::Memtrack => "valid-memtrack",
            FalseKind::Memcleanup => "valid-memcleanup",
            FalseKind::Overflow => "no-overflow",
            FalseKind::Termination => "termination",
            FalseKind::Deadlock => "no-deadlock",
            FalseKind::Sat => "sat",
            FalseKind::Unsat => "unsat",
        }
    }
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The property holds.
    True,
    /// The property is violated; the kind says how.
    False(FalseKind),
    /// The tool could not decide. The annotation, if any, says why.
    Unknown(Option<String>),
    /// The tool failed (crash, bad invocation, unparseable output).
    Error(String),
    /// The time budget ran out before the tool decided.
    Timeout,
    /// The task finished but has no true/false answer (e.g. test generation).
    Done,
}

impl Verdict {
    /// A verdict that answers the verification question.
    ///
    /// `Unknown`, `Error` and `Timeout` are inconclusive; the portfolio
    /// scheduler keeps trying further configurations on these.
    pub fn is_conclusive(&self) -> bool {
        !matches!(
            self,
            Verdict::Unknown(_) | Verdict::Error(_) | Verdict::Timeout
        )
    }

    /// Process exit code for this verdict. `True` and `Done` are the only
    /// zero exits.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::True | Verdict::Done => 0,
            Verdict::False(_) => 10,
            Verdict::Unknown(_) => 2,
            Verdict::Timeout => 3,
            Verdict::Error(_) => 1,
        }
    }

    /// Coarse class of this verdict, used by result filters.
    pub fn class(&self) -> VerdictClass {
        match self {
            Verdict::True => VerdictClass::True,
            Verdict::False(_) => VerdictClass::False,
            Verdict::Unknown(_) => VerdictClass::Unknown,
            Verdict::Error(_) => VerdictClass::Error,
            Verdict::Timeout => VerdictClass::Timeout,
            Verdict::Done => VerdictClass::Done,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::True => write!(f, "true"),
            // sat/unsat are standalone result strings, not false(...)
            Verdict::False(FalseKind::Sat) => write!(f, "sat"),
            Verdict::False(FalseKind::Unsat) => write!(f, "unsat"),
            Verdict::False(kind) => write!(f, "false({})", kind.as_str()),
            Verdict::Unknown(None) => write!(f, "unknown"),
            Verdict::Unknown(Some(why)) => write!(f, "unknown ({})", why),
            Verdict::Error(detail) => write!(f, "ERROR ({})", detail),
            Verdict::Timeout => write!(f, "timeout"),
            Verdict::Done => write!(f, "done"),
        }
    }
}

/// Verdict class without payload, for filter membership tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictClass {
    True,
    False,
    Unknown,
    Error,
    Timeout,
    Done,
}

/// Restricts which verdict classes a portfolio step may report as real.
///
/// Incremental BMC needs this: a bounded `--unwind N` run may only report
/// `false` (a counterexample is real at any bound), while the matching
/// `--unwinding-assertions` run may only report `true`. Anything outside the
/// allowed set downgrades to `Unknown`, annotated with the suppressed
/// verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFilter {
    allowed: Vec<VerdictClass>,
}

impl ResultFilter {
    /// Filter that lets only the given classes through.
    pub fn only(allowed: &[VerdictClass]) -> Self {
        Self {
            allowed: allowed.to_vec(),
        }
    }

    /// Shorthand for a {False}-only filter.
    pub fn false_only() -> Self {
        Self::only(&[VerdictClass::False])
    }

    /// Shorthand for a {True}-only filter.
    pub fn true_only() -> Self {
        Self::only(&[VerdictClass::True])
    }

    /// Apply the filter: pass the verdict through or downgrade it to
    /// `Unknown` with the original verdict as the annotation.
    pub fn apply(&self, verdict: Verdict) -> Verdict {
        if self.allowed.contains(&verdict.class()) {
            verdict
        } else {
            Verdict::Unknown(Some(format!("filtered: {}", verdict)))
        }
    }
}
