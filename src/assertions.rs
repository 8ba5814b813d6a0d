//! Stateless assertion helpers shared by command test suites.

use std::path::{Path, PathBuf};

use crate::harness::{HarnessError, HarnessResult, RunOutcome};

/// Assert the outcome's recorded exit code equals `expected`.
///
/// A command that never touched the exit-code slot counts as 0. This only
/// reads the snapshot; clearing the live context slot is the chain
/// finalizer's job.
pub fn assert_exit_code(outcome: &RunOutcome, expected: i32) -> HarnessResult<()> {
    let actual = outcome.exit_code.unwrap_or(0);
    if actual == expected {
        Ok(())
    } else {
        Err(HarnessError::AssertionFailed(format!(
            "unexpected exit code: {actual}, expected: {expected}"
        )))
    }
}

/// Assert `substring` occurs exactly `expected` times in `text`
/// (non-overlapping).
pub fn assert_occurrences(text: &str, substring: &str, expected: usize) -> HarnessResult<()> {
    let actual = text.split(substring).count() - 1;
    if actual == expected {
        Ok(())
    } else {
        Err(HarnessError::AssertionFailed(format!(
            "unexpected occurrences of {substring:?}: {actual}, expected: {expected}"
        )))
    }
}

/// Check that the path joined from `parts` does not exist or is an empty
/// directory. Read-only, no side effects.
pub fn assert_missing_or_empty_directory<I, P>(parts: I) -> bool
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let path: PathBuf = parts.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
    if !path.exists() {
        return true;
    }
    match std::fs::read_dir(&path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}
