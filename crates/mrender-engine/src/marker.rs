//! Artifact marker detection.
//!
//! Manim announces a finished movie with a line such as
//! `File ready at  /artifacts/<job>/media/videos/input/480p15/MyScene.mp4`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"File ready at  (.*\.mp4)").expect("valid marker regex"));

/// Extract the artifact path from a single output line.
pub fn scan_line(line: &str) -> Option<PathBuf> {
    let captured = MARKER_RE.captures(line)?.get(1)?.as_str();
    let trimmed = captured.trim();
    let path = trimmed.strip_prefix(['\'', '"']).unwrap_or(trimmed);
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Applies [`scan_line`] to every streamed line and remembers the latest match.
#[derive(Debug, Default, Clone)]
pub struct MarkerScanner {
    artifact: Option<PathBuf>,
    matches: usize,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect one line. Returns the path if this line was a marker.
    pub fn observe(&mut self, line: &str) -> Option<&Path> {
        let path = scan_line(line)?;
        self.matches += 1;
        self.artifact = Some(path);
        self.artifact.as_deref()
    }

    /// Latest artifact path seen so far.
    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    /// Number of marker lines seen.
    pub fn matches(&self) -> usize {
        self.matches
    }

    pub fn into_artifact(self) -> Option<PathBuf> {
        self.artifact
    }
}
