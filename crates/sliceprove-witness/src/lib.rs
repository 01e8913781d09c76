//! KTEST test-case decoding and violation witness rendering.
//!
//! Symbolic executors record the concrete inputs of a violating path in the
//! KTEST binary format. This crate decodes those files and renders the
//! assignments of the violating run in a human-readable form.
//!
//! Format: a 5-byte magic (`KTEST` or the older `BOUT\n`), a big-endian
//! version word (versions above 3 are rejected), the recorded argv (skipped),
//! two extra words for the symbolic-argv configuration in version >= 2
//! (skipped), then `(name, bytes)` object records, each field prefixed by a
//! big-endian length word.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// One recorded symbolic object: its name and concrete bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KtestObject {
    pub name: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// A decoded KTEST file.
#[derive(Debug, Clone)]
pub struct Ktest {
    pub version: u32,
    pub objects: Vec<KtestObject>,
}

/// Errors from KTEST decoding.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a KTEST file (bad magic)")]
    BadMagic,
    #[error("unsupported KTEST version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated KTEST file")]
    Truncated,
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Byte-slice cursor for the length-prefixed records.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        if end > self.data.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_record(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

impl Ktest {
    /// Decode a KTEST file from memory.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut cur = Cursor { data, pos: 0 };
        let magic = cur.take(5).map_err(|_| DecodeError::BadMagic)?;
        if magic != b"KTEST" && magic != b"BOUT\n" {
            return Err(DecodeError::BadMagic);
        }
        let version = cur.read_u32()?;
        if version > 3 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        // recorded argv is irrelevant for the witness
        let num_args = cur.read_u32()?;
        for _ in 0..num_args {
            cur.read_record()?;
        }

        if version >= 2 {
            // sym-argvs and sym-argv-len
            cur.read_u32()?;
            cur.read_u32()?;
        }

        let num_objects = cur.read_u32()?;
        let mut objects = Vec::new();
        for _ in 0..num_objects {
            let name = cur.read_record()?.to_vec();
            let bytes = cur.read_record()?.to_vec();
            objects.push(KtestObject { name, bytes });
        }
        debug!(version, objects = objects.len(), "decoded ktest");
        Ok(Self { version, objects })
    }

    /// Decode a KTEST file from disk.
    pub fn from_file(path: &Path) -> Result<Self, DecodeError> {
        let data = std::fs::read(path).map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data)
    }
}

/// A `function:variable:line:scopeid` object name, as produced by the
/// nondet-naming pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedName {
    pub function: String,
    pub variable: String,
    pub line: String,
    pub scope: String,
}

impl ScopedName {
    /// Split the four-field colon convention; names that do not conform are
    /// passed through undecomposed (returns `None`).
    pub fn parse(name: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(name);
        let fields: Vec<&str> = text.split(':').collect();
        if fields.len() != 4 {
            return None;
        }
        Some(Self {
            function: fields[0].to_string(),
            variable: fields[1].to_string(),
            line: fields[2].to_string(),
            scope: fields[3].to_string(),
        })
    }
}

/// Render an object's concrete bytes.
///
/// 1, 2, 4 and 8 byte records are shown as little-endian signed integers;
/// anything else as a run-length grouped byte dump.
pub fn render_value(bytes: &[u8]) -> String {
    match bytes.len() {
        1 => i8::from_le_bytes([bytes[0]]).to_string(),
        2 => i16::from_le_bytes([bytes[0], bytes[1]]).to_string(),
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string(),
        8 => i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
        .to_string(),
        _ => render_byte_dump(bytes),
    }
}

fn render_byte_dump(bytes: &[u8]) -> String {
    let mut out = format!("len {} bytes, |", bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&byte) = iter.next() {
        let mut count = 1usize;
        while iter.peek() == Some(&&byte) {
            iter.next();
            count += 1;
        }
        if count > 1 {
            out.push_str(&format!("{} times {:#x}|", count, byte));
        } else {
            out.push_str(&format!("{:#x}|", byte));
        }
    }
    out
}

/// One rendered input assignment of the violating path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub variable: String,
    pub line: u64,
    pub value: String,
}

/// Extract the witness assignments: `main`-scope scalar identifiers, sorted
/// by source line.
pub fn witness_assignments(ktest: &Ktest) -> Vec<Assignment> {
    // valid C identifiers only; array accesses would need a full path
    let identifier = Regex::new("^[_a-zA-Z$][_a-zA-Z$0-9]*$").expect("static regex");

    let mut assignments: Vec<Assignment> = ktest
        .objects
        .iter()
        .filter_map(|obj| {
            let name = ScopedName::parse(&obj.name)?;
            if name.function != "main" || !identifier.is_match(&name.variable) {
                return None;
            }
            let line = name.line.parse::<u64>().ok()?;
            Some(Assignment {
                variable: name.variable,
                line,
                value: render_value(&obj.bytes),
            })
        })
        .collect();
    assignments.sort_by_key(|a| a.line);
    assignments
}

/// Find the test case describing the reported error: symbolic executors drop
/// a `<test>.err` file next to the matching `<test>.ktest` in their output
/// directory.
pub fn find_error_test(output_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(output_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name()?.to_string_lossy().into_owned();
        if name.ends_with(".err") {
            let stem = &name[..name.find('.')?];
            let ktest = output_dir.join(format!("{stem}.ktest"));
            if ktest.is_file() {
                return Some(ktest);
            }
        }
    }
    None
}
