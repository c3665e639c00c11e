//! Conversion between the `.tar.bz2` and `.conda` package formats.
//!
//! With a `transmute:` section every target gets a final step that runs
//! `cph t` on each package lacking its counterpart, so both formats are
//! collected as artifacts.

use std::time::Duration;

use serde::Deserialize;

use super::entry::{BuildStep, Os};

pub const STEP_NAME: &str = "transmute";

const TAR_BZ2: &str = ".tar.bz2";
const CONDA: &str = ".conda";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransmuteDocument {
    /// Directory holding the built packages; a template like step commands
    pub dir: String,
    /// Runs first in the same shell, e.g. `conda activate sisyphus`
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TransmuteDocument {
    /// The step for one target, with `dir` already rendered.
    pub fn step(&self, os: Os, dir: &str) -> BuildStep {
        // Templates are usually written with `/`
        let dir = match os {
            Os::Windows => dir.replace('/', "\\"),
            Os::Linux | Os::Macos => dir.to_string(),
        };
        let dir = dir.as_str();
        let mut command = String::new();
        if let Some(prefix) = self.prefix.as_deref().filter(|p| !p.trim().is_empty()) {
            command.push_str(prefix.trim());
            command.push_str(" && ");
        }
        command.push_str(&transmute_command(os, dir));
        BuildStep {
            name: STEP_NAME.to_string(),
            command,
            artifacts: vec![
                os.join_path(&[dir, &format!("*{}", CONDA)]),
                os.join_path(&[dir, &format!("*{}", TAR_BZ2)]),
            ],
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Convert every package in `dir` whose other format is missing.
pub fn transmute_command(os: Os, dir: &str) -> String {
    match os {
        Os::Windows => format!(
            "cd /d \"{dir}\" && \
             (for %f in (*{bz2}) do @for %g in (\"%~nf\") do @if not exist \"%~ng{conda}\" cph t \"%f\" {conda}) & \
             (for %f in (*{conda}) do @if not exist \"%~nf{bz2}\" cph t \"%f\" {bz2})",
            dir = dir,
            bz2 = TAR_BZ2,
            conda = CONDA,
        ),
        Os::Linux | Os::Macos => format!(
            "cd '{dir}' && \
             for pkg in *{bz2}; do [ -e \"$pkg\" ] || continue; \
             [ -e \"${{pkg%{bz2}}}{conda}\" ] || cph t \"$pkg\" {conda} || exit 1; done && \
             for pkg in *{conda}; do [ -e \"$pkg\" ] || continue; \
             [ -e \"${{pkg%{conda}}}{bz2}\" ] || cph t \"$pkg\" {bz2} || exit 1; done",
            dir = dir,
            bz2 = TAR_BZ2,
            conda = CONDA,
        ),
    }
}
