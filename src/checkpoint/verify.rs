//! Declared-output verification.
//!
//! A step declares its outputs as glob patterns relative to the data
//! directory. The core never inspects output content, only that each
//! pattern matches at least one non-empty file.

use std::path::Path;

/// Check every declared pattern. Returns a human-readable description of
/// the failures, one clause per pattern that matched nothing non-empty.
pub fn verify_outputs(data_dir: &Path, patterns: &[String]) -> Result<(), String> {
    let mut failures = Vec::new();

    for pattern in patterns {
        let absolute = data_dir.join(pattern);
        let absolute = absolute.to_string_lossy();
        match glob::glob(&absolute) {
            Ok(paths) => {
                let non_empty = paths
                    .flatten()
                    .any(|p| p.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false));
                if !non_empty {
                    failures.push(format!("'{pattern}' matched no non-empty file"));
                }
            }
            Err(e) => failures.push(format!("'{pattern}' is not a valid pattern: {e}")),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}
