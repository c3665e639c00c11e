use std::fmt::Write;

use super::MatrixReport;
use crate::matrix::BuildMatrix;
use crate::scheduler::job::JobState;

fn format_duration(ms: Option<u64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) => {
            let secs = ms / 1000;
            if secs >= 3600 {
                format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m{:02}s", secs / 60, secs % 60)
            } else {
                format!("{}.{}s", secs, (ms % 1000) / 100)
            }
        }
    }
}

/// Human-readable table, one row per target.
pub fn render_table(report: &MatrixReport) -> String {
    let mut rows: Vec<[String; 6]> = vec![[
        "TARGET".into(),
        "STATE".into(),
        "ATTEMPTS".into(),
        "HOST".into(),
        "DURATION".into(),
        "DETAIL".into(),
    ]];
    for t in &report.targets {
        let detail = match (&t.failure, t.artifacts.len()) {
            (Some(f), _) => f.to_string(),
            (None, 0) => String::new(),
            (None, 1) => "1 artifact".to_string(),
            (None, n) => format!("{} artifacts", n),
        };
        rows.push([
            t.key.clone(),
            t.state.to_string(),
            t.attempts.to_string(),
            t.host.clone().unwrap_or_else(|| "-".into()),
            format_duration(t.duration_ms),
            detail,
        ]);
    }
    for p in &report.pending {
        rows.push([
            p.key.clone(),
            p.state.to_string(),
            p.attempts.to_string(),
            p.host.clone().unwrap_or_else(|| "-".into()),
            "-".into(),
            String::new(),
        ]);
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                let _ = write!(line, "{:<width$}  ", cell, width = widths[i]);
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }

    let s = &report.summary;
    let _ = writeln!(
        out,
        "\n{} targets: {} succeeded, {} failed, {} retried, {} pending",
        s.total, s.succeeded, s.failed, s.retried, s.pending
    );

    for t in report.targets.iter().filter(|t| t.log_excerpt.is_some()) {
        let _ = writeln!(out, "\n--- {} ---", t.key);
        if let Some(excerpt) = &t.log_excerpt {
            out.push_str(excerpt);
            out.push('\n');
        }
    }
    out
}

/// Markdown summary for a pull request comment.
pub fn render_markdown(report: &MatrixReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    let headline = if report.all_succeeded() {
        ":white_check_mark: All builds succeeded"
    } else if report.complete {
        ":x: Some builds failed"
    } else {
        ":hourglass: Builds in progress"
    };
    let _ = writeln!(out, "### {}\n", headline);
    let _ = writeln!(
        out,
        "**{}** targets: **{}** succeeded, **{}** failed, {} retried, {} pending\n",
        s.total, s.succeeded, s.failed, s.retried, s.pending
    );
    out.push_str("| Target | State | Attempts | Duration | Artifacts |\n");
    out.push_str("|---|---|---|---|---|\n");
    for t in &report.targets {
        let icon = match t.state {
            JobState::Succeeded => ":heavy_check_mark:",
            _ => ":x:",
        };
        let _ = writeln!(
            out,
            "| `{}` | {} {} | {} | {} | {} |",
            t.key,
            icon,
            t.state,
            t.attempts,
            format_duration(t.duration_ms),
            t.artifacts.len()
        );
    }
    for p in &report.pending {
        let _ = writeln!(out, "| `{}` | {} | {} | - | - |", p.key, p.state, p.attempts);
    }

    for t in report.targets.iter().filter(|t| t.failure.is_some()) {
        let _ = writeln!(out, "\n<details><summary><code>{}</code></summary>\n", t.key);
        if let Some(failure) = &t.failure {
            let _ = writeln!(out, "{}\n", failure);
        }
        if let Some(excerpt) = &t.log_excerpt {
            let _ = writeln!(out, "```\n{}\n```", excerpt);
        }
        out.push_str("</details>\n");
    }
    out
}

/// Resolved matrix, printed by `run --dry-run`.
pub fn render_plan(matrix: &BuildMatrix) -> String {
    let mut out = String::new();
    for entry in matrix.entries() {
        let _ = writeln!(out, "{}", entry.key);
        let _ = writeln!(out, "  workdir: {}", entry.workdir);
        let tags: Vec<&str> = entry.required_tags.iter().map(String::as_str).collect();
        let _ = writeln!(out, "  requires: {}", tags.join(", "));
        for step in &entry.steps {
            let _ = writeln!(out, "  [{}] {}", step.name, step.command);
            for artifact in &step.artifacts {
                let _ = writeln!(out, "      -> {}", artifact);
            }
        }
    }
    let _ = writeln!(out, "{} targets", matrix.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{PendingTarget, Summary, TargetReport};
    use crate::scheduler::policy::{Failure, FailureKind};

    fn report() -> MatrixReport {
        let platform: crate::matrix::Platform = "linux-x86_64".parse().unwrap();
        let cuda: crate::matrix::CudaVersion = "12.4".parse().unwrap();
        MatrixReport {
            complete: true,
            generated_at: chrono::Utc::now(),
            summary: Summary {
                total: 2,
                succeeded: 1,
                failed: 1,
                retried: 1,
                pending: 0,
            },
            targets: vec![
                TargetReport {
                    key: "numpy/linux-x86_64/cuda-12.4".into(),
                    package: "numpy".into(),
                    platform: platform.clone(),
                    cuda: cuda.clone(),
                    state: JobState::Failed,
                    attempts: 1,
                    retries: 0,
                    host: Some("gpu-1".into()),
                    duration_ms: Some(75_000),
                    artifacts: vec![],
                    failure: Some(
                        Failure::permanent(FailureKind::Execution, "command exited with status 2")
                            .with_exit_code(2),
                    ),
                    log_excerpt: Some("error: undefined reference".into()),
                },
                TargetReport {
                    key: "zlib/linux-x86_64/cuda-12.4".into(),
                    package: "zlib".into(),
                    platform,
                    cuda,
                    state: JobState::Succeeded,
                    attempts: 2,
                    retries: 1,
                    host: Some("gpu-2".into()),
                    duration_ms: Some(4_200),
                    artifacts: vec![],
                    failure: None,
                    log_excerpt: None,
                },
            ],
            pending: Vec::<PendingTarget>::new(),
        }
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(4_200)), "4.2s");
        assert_eq!(format_duration(Some(75_000)), "1m15s");
        assert_eq!(format_duration(Some(3_723_000)), "1h02m");
    }

    #[test]
    fn table_lists_targets_and_excerpts() {
        let table = render_table(&report());
        assert!(table.starts_with("TARGET"));
        assert!(table.contains("numpy/linux-x86_64/cuda-12.4"));
        assert!(table.contains("1m15s"));
        assert!(table.contains("2 targets: 1 succeeded, 1 failed, 1 retried, 0 pending"));
        assert!(table.contains("--- numpy/linux-x86_64/cuda-12.4 ---\nerror: undefined reference"));
    }

    #[test]
    fn markdown_summary() {
        let md = render_markdown(&report());
        assert!(md.starts_with("### :x: Some builds failed"));
        assert!(md.contains("| `zlib/linux-x86_64/cuda-12.4` | :heavy_check_mark: succeeded | 2 | 4.2s | 0 |"));
        assert!(md.contains("<details><summary><code>numpy/linux-x86_64/cuda-12.4</code></summary>"));
        assert!(md.contains("```\nerror: undefined reference\n```"));
    }
}
