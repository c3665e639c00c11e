use std::collections::VecDeque;

/// Line buffer that keeps the most recent output up to a byte limit.
///
/// When older lines are dropped, rendering prefixes the kept tail with a
/// `[... N bytes truncated ...]` marker.
#[derive(Debug, Clone, Default)]
pub struct BoundedLog {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    truncated: usize,
}

impl BoundedLog {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
            truncated: 0,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let mut line = line.trim_end_matches(['\r', '\n']).to_string();
        // A single line larger than the whole buffer keeps its tail
        if line.len() + 1 > self.limit {
            let keep = self.limit.saturating_sub(1);
            let mut cut = line.len() - keep;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            self.truncated += cut;
            line = line.split_off(cut);
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.limit {
            match self.lines.pop_front() {
                Some(old) => {
                    self.bytes -= old.len() + 1;
                    self.truncated += old.len() + 1;
                }
                None => break,
            }
        }
    }

    pub fn push_str(&mut self, text: &str) {
        for line in text.lines() {
            self.push_line(line);
        }
    }

    /// Append everything kept by another buffer, carrying over its truncation count.
    pub fn extend(&mut self, other: &BoundedLog) {
        self.truncated += other.truncated;
        for line in &other.lines {
            self.push_line(line);
        }
    }

    pub fn truncated_bytes(&self) -> usize {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn as_string(&self) -> String {
        let mut out = String::with_capacity(self.bytes + 40);
        if self.truncated > 0 {
            out.push_str(&format!("[... {} bytes truncated ...]\n", self.truncated));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Last `lines` lines, newline-joined.
    pub fn excerpt(&self, lines: usize) -> String {
        let skip = self.lines.len().saturating_sub(lines);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
