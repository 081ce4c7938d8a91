use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{GenesisError, Result};

const MAX_ADAPTIVE_PASSES: usize = 5;

static OPERATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\([^()]+\)\)").unwrap());

/// Whether deferred-value operators are evaluated or carried through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Full,
    Skip,
}

/// Failure report from the merge tool; `detail` is its raw error output,
/// which the adaptive loop mines for the failing operator text.
#[derive(Debug, Clone)]
pub struct MergeFailure {
    pub detail: String,
}

/// Seam over the external YAML merge tool.
pub trait Merger {
    fn merge(&self, files: &[PathBuf], mode: EvalMode) -> std::result::Result<String, MergeFailure>;
}

/// Default merger shelling out to `spruce`.
pub struct SpruceMerger {
    binary: PathBuf,
}

impl SpruceMerger {
    pub fn discover() -> Result<Self> {
        let binary = which::which("spruce").map_err(|_| GenesisError::DependencyMissing {
            binary: "spruce".into(),
            hint: "install spruce (https://github.com/geofffranks/spruce)".into(),
        })?;
        Ok(Self { binary })
    }
}

impl Merger for SpruceMerger {
    fn merge(&self, files: &[PathBuf], mode: EvalMode) -> std::result::Result<String, MergeFailure> {
        let mut command = Command::new(&self.binary);
        command.arg("merge");
        if mode == EvalMode::Skip {
            command.arg("--skip-eval");
        }
        command.args(files).stdin(Stdio::null());
        let output = command.output().map_err(|err| MergeFailure {
            detail: format!("could not run spruce: {err}"),
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(MergeFailure {
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Restores the process working directory on all exits.
pub struct ChdirGuard {
    previous: PathBuf,
}

impl ChdirGuard {
    pub fn enter(dir: &Path) -> Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for ChdirGuard {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.previous) {
            warn!("could not restore working directory: {err}");
        }
    }
}

/// Merge with up to five recovery passes: each unresolvable operator the
/// merge tool names is rewritten, in working copies, to its deferred form
/// and the merge retried. The first error text is preserved for reporting.
pub fn adaptive_merge(merger: &dyn Merger, files: &[PathBuf], mode: EvalMode) -> Result<String> {
    let workdir = tempfile::tempdir()?;
    let mut copies = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fragment.yml".to_string());
        let copy = workdir.path().join(format!("{index:03}-{name}"));
        fs::copy(file, &copy)?;
        copies.push(copy);
    }

    let mut original_error: Option<String> = None;
    for attempt in 1..=MAX_ADAPTIVE_PASSES {
        match merger.merge(&copies, mode) {
            Ok(output) => return Ok(output),
            Err(failure) => {
                let original = original_error.get_or_insert_with(|| failure.detail.clone());
                let rewritten = defer_failing_operators(&copies, &failure.detail)?;
                if rewritten == 0 {
                    return Err(GenesisError::Merge {
                        attempts: attempt,
                        detail: original.clone(),
                    });
                }
                debug!(attempt, rewritten, "deferred unresolvable operators");
            }
        }
    }
    Err(GenesisError::Merge {
        attempts: MAX_ADAPTIVE_PASSES,
        detail: original_error.unwrap_or_default(),
    })
}

/// Rewrite each operator named in the error report to `(( defer … ))`,
/// exactly as reported; returns how many replacements were made.
fn defer_failing_operators(copies: &[PathBuf], error_text: &str) -> Result<usize> {
    let mut operators: Vec<&str> = Vec::new();
    for found in OPERATOR_RE.find_iter(error_text) {
        let text = found.as_str();
        let inner = text.trim_start_matches("((").trim_end_matches("))").trim();
        if inner.starts_with("defer ") || operators.contains(&text) {
            continue;
        }
        operators.push(text);
    }
    if operators.is_empty() {
        return Ok(0);
    }
    let mut rewritten = 0;
    for copy in copies {
        let contents = fs::read_to_string(copy)?;
        let mut updated = contents.clone();
        for operator in &operators {
            if !updated.contains(*operator) {
                continue;
            }
            let inner = operator
                .trim_start_matches("((")
                .trim_end_matches("))")
                .trim();
            updated = updated.replace(*operator, &format!("(( defer {inner} ))"));
        }
        if updated != contents {
            rewritten += 1;
            fs::write(copy, updated)?;
        }
    }
    Ok(rewritten)
}
