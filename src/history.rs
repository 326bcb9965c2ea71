use crate::notifier::Speaker;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Max lines kept in history.jsonl.
const MAX_HISTORY_LINES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: String,
    pub speaker: Speaker,
    pub text: String,
}

/// Append-only conversation log, one JSON object per line.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
    max_lines: usize,
}

impl History {
    pub fn open_default() -> Result<Self, String> {
        Ok(Self::at(crate::settings::data_dir()?.join("history.jsonl")))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_lines: MAX_HISTORY_LINES,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, speaker: Speaker, text: &str) -> Result<(), String> {
        let entry = HistoryEntry {
            ts: chrono::Local::now().to_rfc3339(),
            speaker,
            text: text.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create history dir: {}", e))?;
        }
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| format!("Failed to serialize history entry: {}", e))?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| format!("Failed to append history: {}", e))?;
        truncate_log(&self.path, self.max_lines);
        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, max: usize) -> Vec<HistoryEntry> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return vec![],
        };
        text.lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .take(max)
            .collect()
    }
}

/// If `path` has more than `max_lines` lines, rewrite it keeping only the last `max_lines`.
fn truncate_log(path: &Path, max_lines: usize) {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return;
    }
    let keep = &lines[lines.len() - max_lines..];
    let mut out = keep.join("\n");
    out.push('\n');
    let _ = fs::write(path, out.as_bytes());
}
