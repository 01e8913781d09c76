//! Verification property model.
//!
//! A [`Property`] is a set of capability flags describing what the run is
//! looking for: reachability of error calls, memory safety (three separate
//! sub-kinds), memory cleanup, signed overflow, termination, deadlock or
//! undefined behavior. Properties are parsed either from SV-COMP `.prp`
//! files (one specification per non-empty line) or from shorthand keyword
//! strings like `memsafety` or `no-overflow`.
//!
//! The flags drive every later decision: which sanitizer flags to compile
//! with, which instrumentation config to apply, what to slice on and how to
//! interpret tool output.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Default error calls for the `assert`/`assertions` shorthand.
const ASSERTION_CALLS: [&str; 2] = ["__assert_fail", "__VERIFIER_error"];
/// Default error call for SV-COMP reachability.
const DEFAULT_REACH_CALL: &str = "reach_error";

/// The three memory-safety sub-kinds, individually selectable.
///
/// A `.prp` file may request any subset (`G valid-deref` alone is legal);
/// the aggregate property holds only when all three are requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemSafety {
    pub valid_deref: bool,
    pub valid_free: bool,
    pub valid_memtrack: bool,
}

impl MemSafety {
    /// All three sub-kinds requested; this is what the `memsafety` keyword
    /// sets.
    pub fn full() -> Self {
        Self {
            valid_deref: true,
            valid_free: true,
            valid_memtrack: true,
        }
    }

    /// The full composite property: deref AND free AND memtrack.
    pub fn aggregate(&self) -> bool {
        self.valid_deref && self.valid_free && self.valid_memtrack
    }

    /// At least one sub-kind requested.
    pub fn any(&self) -> bool {
        self.valid_deref || self.valid_free || self.valid_memtrack
    }
}

/// What a verification run checks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    reachability: bool,
    error_calls: Vec<String>,
    memsafety: MemSafety,
    memcleanup: bool,
    null_deref: bool,
    overflow: bool,
    termination: bool,
    deadlock: bool,
    undefinedness: bool,
    prp_file: Option<PathBuf>,
}

impl Property {
    fn empty(prp_file: Option<PathBuf>) -> Self {
        Self {
            reachability: false,
            error_calls: Vec::new(),
            memsafety: MemSafety::default(),
            memcleanup: false,
            null_deref: false,
            overflow: false,
            termination: false,
            deadlock: false,
            undefinedness: false,
            prp_file,
        }
    }

    /// The default property when none is given: assertion violations.
    pub fn default_assertions() -> Self {
        let mut p = Self::empty(None);
        p.reachability = true;
        p.error_calls = ASSERTION_CALLS.iter().map(|s| s.to_string()).collect();
        p
    }

    /// Parse a property given either as a path to a `.prp` file or as a
    /// whitespace-separated keyword string.
    pub fn parse(spec: &str) -> Result<Self, PropertyError> {
        let path = Path::new(spec.trim());
        if path.is_file() {
            return Self::parse_file(path);
        }
        // LTL formulae contain spaces, so try the whole string first
        let trimmed = spec.trim();
        let mut p = Self::empty(None);
        if p.apply_token(trimmed)? {
            p.check_consistency()?;
            return Ok(p);
        }
        let mut p = Self::empty(None);
        for token in spec.split_whitespace() {
            if !p.apply_token(token)? {
                return Err(PropertyError::Unsupported {
                    token: token.to_string(),
                });
            }
        }
        if p == Self::empty(None) {
            return Ok(Self::default_assertions());
        }
        p.check_consistency()?;
        Ok(p)
    }

    /// Parse a `.prp` file: one specification per non-empty trimmed line.
    pub fn parse_file(path: &Path) -> Result<Self, PropertyError> {
        let content = std::fs::read_to_string(path).map_err(|source| PropertyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "parsing property file");
        let mut p = Self::empty(Some(path.to_path_buf()));
        let mut seen = false;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            seen = true;
            if !p.apply_token(line)? {
                return Err(PropertyError::Unsupported {
                    token: line.to_string(),
                });
            }
        }
        if !seen {
            return Err(PropertyError::Empty {
                path: path.to_path_buf(),
            });
        }
        p.check_consistency()?;
        Ok(p)
    }

    /// Apply one keyword or LTL specification; returns false when the token
    /// is not recognized.
    fn apply_token(&mut self, token: &str) -> Result<bool, PropertyError> {
        match token {
            "assert" | "assertions" => {
                self.reachability = true;
                for call in ASSERTION_CALLS {
                    self.add_error_call(call);
                }
            }
            "valid-deref" => self.memsafety.valid_deref = true,
            "valid-free" => self.memsafety.valid_free = true,
            "valid-memtrack" => self.memsafety.valid_memtrack = true,
            "memsafety" => self.memsafety = MemSafety::full(),
            "memcleanup" | "valid-memcleanup" => self.memcleanup = true,
            "null-deref" => self.null_deref = true,
            "undefined-behavior" | "undef-behavior" | "undefined" => self.undefinedness = true,
            "signed-overflow" | "no-overflow" => self.overflow = true,
            "termination" => self.termination = true,
            "no-deadlock" => self.deadlock = true,

            "CHECK( init(main()), LTL(G valid-deref) )" => self.memsafety.valid_deref = true,
            "CHECK( init(main()), LTL(G valid-free) )" => self.memsafety.valid_free = true,
            "CHECK( init(main()), LTL(G valid-memtrack) )" => self.memsafety.valid_memtrack = true,
            "CHECK( init(main()), LTL(G valid-memcleanup) )" => self.memcleanup = true,
            "CHECK( init(main()), LTL(G ! overflow) )" => self.overflow = true,
            "CHECK( init(main()), LTL(G def-behavior) )" => self.undefinedness = true,
            "CHECK( init(main()), LTL(F end) )" => self.termination = true,
            "CHECK( init(main()), LTL(G ! deadlock) )" => self.deadlock = true,

            other => {
                // parametrized reachability: G ! call(<fun>())
                const PREFIX: &str = "CHECK( init(main()), LTL(G ! call(";
                if let Some(suffix) = other.strip_prefix(PREFIX) {
                    let fun = match suffix.find("()") {
                        Some(end) => &suffix[..end],
                        None => {
                            return Err(PropertyError::Unsupported {
                                token: other.to_string(),
                            })
                        }
                    };
                    self.reachability = true;
                    self.add_error_call(fun);
                    return Ok(true);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn add_error_call(&mut self, call: &str) {
        if !self.error_calls.iter().any(|c| c == call) {
            self.error_calls.push(call.to_string());
        }
    }

    /// At most one primary family may be requested per run.
    fn check_consistency(&self) -> Result<(), PropertyError> {
        let families: [(&str, bool); 8] = [
            ("reachability", self.reachability),
            ("memsafety", self.memsafety.any()),
            ("memcleanup", self.memcleanup),
            ("null-deref", self.null_deref),
            ("overflow", self.overflow),
            ("termination", self.termination),
            ("deadlock", self.deadlock),
            ("undefined-behavior", self.undefinedness),
        ];
        let requested: Vec<&str> = families
            .iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| *name)
            .collect();
        if requested.len() > 1 {
            return Err(PropertyError::Conflicting {
                families: requested.join(", "),
            });
        }
        Ok(())
    }

    /// Reachability of an error call (includes the `assert` shorthand).
    pub fn reachability(&self) -> bool {
        self.reachability
    }

    /// The error calls whose reachability is checked. Empty unless
    /// [`reachability`](Self::reachability) holds.
    pub fn error_calls(&self) -> &[String] {
        &self.error_calls
    }

    /// Requested memory-safety sub-kinds.
    pub fn memsafety(&self) -> MemSafety {
        self.memsafety
    }

    pub fn memcleanup(&self) -> bool {
        self.memcleanup
    }

    pub fn null_deref(&self) -> bool {
        self.null_deref
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn termination(&self) -> bool {
        self.termination
    }

    pub fn deadlock(&self) -> bool {
        self.deadlock
    }

    pub fn undefinedness(&self) -> bool {
        self.undefinedness
    }

    /// The `.prp` file this property was parsed from, if any. Some tools
    /// want it passed through on their command line.
    pub fn property_file(&self) -> Option<&Path> {
        self.prp_file.as_deref()
    }

    /// Default reachability property with the SV-COMP `reach_error` call.
    pub fn default_reachability() -> Self {
        let mut p = Self::empty(None);
        p.reachability = true;
        p.add_error_call(DEFAULT_REACH_CALL);
        p
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reachability {
            write!(f, "reachability of {}", self.error_calls.join(","))
        } else if self.memsafety.any() {
            write!(f, "memory safety")
        } else if self.memcleanup {
            write!(f, "memory cleanup")
        } else if self.null_deref {
            write!(f, "null dereferences")
        } else if self.overflow {
            write!(f, "signed overflow")
        } else if self.termination {
            write!(f, "termination")
        } else if self.deadlock {
            write!(f, "deadlock freedom")
        } else if self.undefinedness {
            write!(f, "undefined behavior")
        } else {
            write!(f, "unspecified property")
        }
    }
}

/// Errors from property parsing.
#[derive(Debug, Error)]
pub enum PropertyError {
    /// The token is not in the supported vocabulary.
    #[error("unknown or unsupported property: {token}")]
    Unsupported { token: String },
    /// More than one primary property family was requested.
    #[error("conflicting properties requested: {families}")]
    Conflicting { families: String },
    /// The property file holds no specification.
    #[error("property file `{path}` is empty")]
    Empty { path: PathBuf },
    /// The property file could not be read.
    #[error("cannot read property file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
