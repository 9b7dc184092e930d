//! Verdict publication for the observatory control system.
//!
//! The control software polls a small key=value text file to decide whether
//! automated operation is permitted, so the file must never be observable in
//! a half-written state. [`write_status`] stages the new content in a
//! temporary file in the destination directory and atomically renames it
//! over the target.

use std::{
    io::Write,
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use tempfile::NamedTempFile;

/// The safety determination produced by one monitoring cycle.
///
/// Each cycle creates a fresh verdict; the previous one is superseded,
/// never merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether current conditions are safe for automated operation.
    pub is_safe: bool,
    /// The classified sky condition, or a failure reason such as
    /// "Transfer Error".
    pub condition: String,
    /// Classifier confidence in [0, 1]. Failure verdicts carry 1.0 for
    /// fetch-side failures and 0.0 for pipeline failures.
    pub confidence: f32,
    /// When the verdict was produced.
    pub timestamp: DateTime<Utc>,
}

impl Verdict {
    /// Build a verdict stamped with the current time.
    pub fn new(is_safe: bool, condition: impl Into<String>, confidence: f32) -> Self {
        Self {
            is_safe,
            condition: condition.into(),
            confidence,
            timestamp: Utc::now(),
        }
    }

    /// The standard unsafe verdict for a named failure stage.
    pub fn failure(condition: impl Into<String>, confidence: f32) -> Self {
        Self::new(false, condition, confidence)
    }
}

/// Render the status-file body for a verdict.
///
/// Exact contract with the control system: three lines, `IsSafe` spelled as
/// the words `True`/`False`, `Confidence` with two decimal places.
pub fn format_status(verdict: &Verdict) -> String {
    format!(
        "IsSafe={}\nCondition={}\nConfidence={:.2}\n",
        if verdict.is_safe { "True" } else { "False" },
        verdict.condition,
        verdict.confidence,
    )
}

/// Atomically publish a verdict to the status file.
///
/// Parent directories are created if absent. External readers see either
/// the previous complete file or the new complete file, never a mixture.
pub fn write_status<P: AsRef<Path>>(verdict: &Verdict, path: P) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create status directory {}", parent.display()))?;

    // Stage in the same directory so the final rename cannot cross devices.
    let mut staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create staging file in {}", parent.display()))?;
    staged
        .write_all(format_status(verdict).as_bytes())
        .context("failed to write staged status content")?;
    staged.flush().context("failed to flush staged status")?;
    staged
        .persist(path)
        .with_context(|| format!("failed to publish status file {}", path.display()))?;

    debug!(
        "published status to {}: IsSafe={} Condition={} Confidence={:.2}",
        path.display(),
        verdict.is_safe,
        verdict.condition,
        verdict.confidence
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };
    use tempfile::tempdir;

    #[test]
    fn formats_exact_field_layout() {
        let verdict = Verdict::new(true, "Clear", 0.914);
        assert_eq!(
            format_status(&verdict),
            "IsSafe=True\nCondition=Clear\nConfidence=0.91\n"
        );

        let verdict = Verdict::failure("Transfer Error", 1.0);
        assert_eq!(
            format_status(&verdict),
            "IsSafe=False\nCondition=Transfer Error\nConfidence=1.00\n"
        );
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/deeper/ASCOM_STATUS.txt");
        let verdict = Verdict::new(false, "Cloudy", 0.72);
        write_status(&verdict, &path).expect("write");

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(contents, "IsSafe=False\nCondition=Cloudy\nConfidence=0.72\n");
    }

    #[test]
    fn overwrites_previous_verdict() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("status.txt");
        write_status(&Verdict::new(true, "Clear", 0.9), &path).expect("first write");
        write_status(&Verdict::failure("Image Missing", 1.0), &path).expect("second write");

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert!(contents.starts_with("IsSafe=False\n"));
        assert!(contents.contains("Condition=Image Missing\n"));
    }

    #[test]
    fn concurrent_reader_never_sees_torn_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("status.txt");
        write_status(&Verdict::new(true, "Clear", 0.90), &path).expect("seed");

        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = stop.clone();
        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            while !reader_stop.load(Ordering::Relaxed) {
                let contents = std::fs::read_to_string(&reader_path).expect("read");
                let lines: Vec<&str> = contents.lines().collect();
                assert_eq!(lines.len(), 3, "torn status file: {contents:?}");
                assert!(lines[0] == "IsSafe=True" || lines[0] == "IsSafe=False");
                // Field values must come from the same verdict, never a mix.
                if lines[0] == "IsSafe=True" {
                    assert_eq!(lines[1], "Condition=Clear");
                } else {
                    assert_eq!(lines[1], "Condition=Cloudy");
                }
            }
        });

        for i in 0..200 {
            let verdict = if i % 2 == 0 {
                Verdict::new(true, "Clear", 0.90)
            } else {
                Verdict::new(false, "Cloudy", 0.75)
            };
            write_status(&verdict, &path).expect("write");
        }

        stop.store(true, Ordering::Relaxed);
        reader.join().expect("reader panicked");
    }
}
