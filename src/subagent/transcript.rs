//! Transcript-file parsing and fuzzy task correlation.
//!
//! Subagent transcripts are JSONL files written by independently spawned CLI
//! processes; nothing in them carries an authoritative link to the logical
//! task that spawned them. Correlation is therefore heuristic: the child's
//! first user prompt is fuzzy-matched against each target's free-text
//! description, with a loose first-unmatched-target fallback. The matching
//! windows below are tuned empirically, not load-bearing.

use std::io::SeekFrom;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::util::truncate_str;

/// Max chars of the child's first user prompt kept for matching.
const PROMPT_CAP: usize = 600;
/// Window of the target description compared against the prompt.
const DESC_WINDOW: usize = 120;
/// Window of the prompt compared against the description.
const PROMPT_WINDOW: usize = 200;
/// Prompt prefix used for the reverse containment check.
const PROMPT_PREFIX: usize = 80;

/// Max chars of a command or query shown in a status string.
const DETAIL_CAP: usize = 60;

/// A named logical subtask the watcher tries to attribute files to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTarget {
    pub name: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The most recent thing a subagent was seen doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    /// Tool name when the latest block was a tool invocation.
    pub tool: Option<String>,
    /// Human-readable status string.
    pub status: String,
}

/// Read the last `bytes` of a file via explicit seek — bounded I/O
/// regardless of transcript size.
pub async fn read_tail(path: &Path, bytes: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(bytes);
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity(usize::try_from(len - start).unwrap_or(0));
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read the first `bytes` of a file.
pub async fn read_head(path: &Path, bytes: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; bytes];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Gerund label for a tool name, or `None` for unknown tools.
fn tool_label(name: &str) -> Option<&'static str> {
    match name.to_lowercase().as_str() {
        "read" => Some("Reading"),
        "write" => Some("Writing"),
        "edit" => Some("Editing"),
        "multiedit" => Some("Multi-editing"),
        "bash" => Some("Running command"),
        "glob" => Some("Searching files"),
        "grep" => Some("Searching code"),
        "ls" => Some("Listing directory"),
        "task" => Some("Dispatching agent"),
        "taskoutput" => Some("Waiting for agent"),
        "webfetch" => Some("Fetching web"),
        "todoread" => Some("Reading TODOs"),
        "todowrite" => Some("Writing TODOs"),
        _ => None,
    }
}

/// Render a human-readable status for a tool invocation, falling back to the
/// raw tool name when no label is known.
pub fn format_tool_status(name: &str, input: &Value) -> String {
    let label = tool_label(name).map_or_else(|| name.to_string(), ToString::to_string);
    let detail = if let Some(path) = input.get("file_path").and_then(Value::as_str) {
        path.to_string()
    } else if let Some(command) = input.get("command").and_then(Value::as_str) {
        truncate_str(command, DETAIL_CAP)
    } else if let Some(pattern) = input.get("pattern").and_then(Value::as_str) {
        pattern.to_string()
    } else if let Some(query) = input.get("query").and_then(Value::as_str) {
        truncate_str(query, DETAIL_CAP)
    } else if let Some(path) = input.get("path").and_then(Value::as_str) {
        path.to_string()
    } else {
        String::new()
    };
    if detail.is_empty() {
        label
    } else {
        format!("{label}: {detail}")
    }
}

/// Scan transcript content backward for the latest assistant activity: the
/// most recent assistant entry's last tool-invocation, thinking, or text
/// block.
pub fn extract_latest_activity(content: &str) -> Option<Activity> {
    for line in content.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if obj.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(blocks) = obj
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            continue;
        };

        for block in blocks.iter().rev() {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    if let Some(name) = block.get("name").and_then(Value::as_str) {
                        let empty = Value::Object(serde_json::Map::new());
                        let input = block
                            .get("input")
                            .filter(|v| v.is_object())
                            .unwrap_or(&empty);
                        return Some(Activity {
                            tool: Some(name.to_string()),
                            status: format_tool_status(name, input),
                        });
                    }
                }
                Some("thinking") => {
                    return Some(Activity {
                        tool: None,
                        status: "Thinking…".to_string(),
                    });
                }
                Some("text") => {
                    if block
                        .get("text")
                        .and_then(Value::as_str)
                        .is_some_and(|t| !t.is_empty())
                    {
                        return Some(Activity {
                            tool: None,
                            status: "Writing…".to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Extract the first user-role message's text from transcript head content,
/// capped to [`PROMPT_CAP`] chars.
pub fn extract_first_prompt(head: &str) -> Option<String> {
    for line in head.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let kind = obj.get("type").and_then(Value::as_str);
        if kind != Some("user") && kind != Some("human") {
            continue;
        }
        if obj
            .get("message")
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            != Some("user")
        {
            continue;
        }
        let content = obj.get("message").and_then(|m| m.get("content"))?;
        if let Some(text) = content.as_str() {
            return Some(cap_chars(text, PROMPT_CAP));
        }
        if let Some(parts) = content.as_array() {
            for part in parts {
                if let Some(text) = part.as_str() {
                    return Some(cap_chars(text, PROMPT_CAP));
                }
                if part.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        return Some(cap_chars(text, PROMPT_CAP));
                    }
                }
            }
        }
    }
    None
}

/// Fuzzy-match a child's first prompt against target descriptions via
/// prefix/substring overlap. Returns the best (longest-overlap) target.
pub fn match_target<'a>(prompt: &str, targets: &'a [WatchTarget]) -> Option<&'a WatchTarget> {
    if prompt.is_empty() || targets.is_empty() {
        return None;
    }
    let prompt_lower = prompt.to_lowercase();
    let prompt_snippet = cap_chars(&prompt_lower, PROMPT_WINDOW);
    let prompt_prefix = cap_chars(&prompt_snippet, PROMPT_PREFIX);

    let mut best: Option<&WatchTarget> = None;
    let mut best_score = 0;

    for target in targets {
        let Some(description) = &target.description else {
            continue;
        };
        let desc_snippet = cap_chars(&description.to_lowercase(), DESC_WINDOW);

        if prompt_snippet.contains(&desc_snippet) || desc_snippet.contains(&prompt_prefix) {
            let score = desc_snippet
                .chars()
                .count()
                .min(prompt_snippet.chars().count());
            if score > best_score {
                best_score = score;
                best = Some(target);
            }
        }
    }
    best
}

/// Char-boundary-safe prefix.
fn cap_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
