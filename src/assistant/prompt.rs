//! Interactive prompt detection over raw terminal text.
//!
//! The assistant CLI normally emits one JSON object per line, but when it
//! needs interactive confirmation it prints free-form text and waits for a
//! keypress. [`detect_prompt`] classifies such text into a structured prompt
//! description the UI can render as buttons, or `None` when the text is just
//! informational output.
//!
//! Detection order encodes priority, not just a fallback chain: permission
//! requests beat numbered menus beat bare yes/no beats open input.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Minimum text length worth classifying.
const MIN_PROMPT_LEN: usize = 5;

/// Upper bound on trailing text after the last menu entry — anything longer
/// means the numbered lines are part of prose, not a menu.
const MAX_MENU_TRAILER: usize = 30;

/// Menu option count accepted as a real menu.
const MENU_OPTIONS: std::ops::RangeInclusive<usize> = 2..=10;

/// One selectable option of a detected prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptOption {
    pub label: String,
    pub value: String,
    pub key: String,
}

impl PromptOption {
    fn new(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            value: value.to_string(),
            key: value.to_string(),
        }
    }
}

/// Kind of interactive prompt found in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptType {
    /// Tool permission request (`Allow Bash(…)? (y/n/a)`).
    Permission,
    /// Numbered choice menu.
    Choice,
    /// Bare yes/no question.
    YesNo,
    /// Open-ended input request (`? Question:`).
    Input,
}

/// A structured description of an interactive prompt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedPrompt {
    pub prompt_type: PromptType,
    pub message: String,
    pub options: Vec<PromptOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
}

/// ANSI escape sequences: CSI, OSC (BEL- or ST-terminated), charset
/// selection, and any remaining bare ESC.
static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[A-Za-z]",
        r"|\x1b\][^\x07]*\x07",
        r"|\x1b\][^\x1b]*\x1b\\",
        r"|\x1b[()][A-Z0-9]",
        r"|\x1b",
    ))
    .unwrap()
});

/// Strip ANSI escape codes from text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// `Allow ToolName(args)? (y/n/a)` — tool call with explicit option letters.
static PERMISSION_TOOL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:Allow|Approve)\s+(\w+)\(([^)]+)\)\s*\?\s*\(([yYnNaA/\s]+)\)").unwrap()
});

/// `Allow <anything>? (y…)` — permission question without the strict
/// tool-call form.
static PERMISSION_GENERIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:Allow|Do you want to allow|Approve)\s+(.+?)\s*\?\s*\(([yYnNaA][^)]*)\)")
        .unwrap()
});

/// `<question> (y/n)` at end of text — letters separated by `/` or `|`.
static PERMISSION_TRAILING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(.+?)\s*\(([yYnNaA][/|][yYnNaA](?:[/|][yYnNaA])?)\)\s*$").unwrap()
});

/// Inner `Name(args)` form inside a generic permission question.
static TOOL_CALL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)\((.+)\)").unwrap());

/// A numbered menu line: `1. Option` or `2) Option`.
static MENU_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*(\d+)[.)]\s+(.+)$").unwrap());

/// Yes/no tail: `… [y/n]` or `… (N|y)` at end of text.
static YES_NO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(.+?)\s*[\[(]([yYnN][/|][yYnN])[\])]\s*$").unwrap());

/// Open input request: `? Question:`.
static INPUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\?\s+(.+?):\s*$").unwrap());

/// Build the Yes/No/Always-allow option list from an option-letter string.
/// Returns an empty vec when no recognized letter is present.
fn permission_options(letters: &str) -> Vec<PromptOption> {
    let lower = letters.to_lowercase();
    let mut options = Vec::new();
    if lower.contains('y') {
        options.push(PromptOption::new("Yes", "y"));
    }
    if lower.contains('n') {
        options.push(PromptOption::new("No", "n"));
    }
    if lower.contains('a') {
        options.push(PromptOption::new("Always allow", "a"));
    }
    options
}

/// Classify ANSI-stripped, trimmed terminal text as an interactive prompt.
///
/// Returns `None` for text shorter than [`MIN_PROMPT_LEN`] or when no
/// pattern matches (i.e. the text is plain informational output).
pub fn detect_prompt(clean: &str) -> Option<DetectedPrompt> {
    if clean.chars().count() < MIN_PROMPT_LEN {
        return None;
    }

    // 1. Permission request — three shapes, strictest first. A pattern that
    //    matches but yields zero recognized option letters is skipped rather
    //    than terminating detection.
    if let Some(caps) = PERMISSION_TOOL_RE.captures(clean) {
        let options = permission_options(&caps[3]);
        if !options.is_empty() {
            return Some(DetectedPrompt {
                prompt_type: PromptType::Permission,
                message: clean.to_string(),
                options,
                tool_name: Some(caps[1].to_string()),
                tool_input: Some(caps[2].to_string()),
            });
        }
    }
    for re in [&*PERMISSION_GENERIC_RE, &*PERMISSION_TRAILING_RE] {
        if let Some(caps) = re.captures(clean) {
            let options = permission_options(&caps[2]);
            if options.is_empty() {
                continue;
            }
            let (tool_name, tool_input) = match TOOL_CALL_RE.captures(&caps[1]) {
                Some(tc) => (Some(tc[1].to_string()), Some(tc[2].to_string())),
                None => (None, None),
            };
            return Some(DetectedPrompt {
                prompt_type: PromptType::Permission,
                message: clean.to_string(),
                options,
                tool_name,
                tool_input,
            });
        }
    }

    // 2. Numbered choice menu
    if let Some(prompt) = detect_menu(clean) {
        return Some(prompt);
    }

    // 3. Bare yes/no
    if let Some(caps) = YES_NO_RE.captures(clean) {
        return Some(DetectedPrompt {
            prompt_type: PromptType::YesNo,
            message: caps[1].trim().to_string(),
            options: vec![PromptOption::new("Yes", "y"), PromptOption::new("No", "n")],
            tool_name: None,
            tool_input: None,
        });
    }

    // 4. Open input
    if let Some(caps) = INPUT_RE.captures(clean) {
        return Some(DetectedPrompt {
            prompt_type: PromptType::Input,
            message: caps[1].trim().to_string(),
            options: Vec::new(),
            tool_name: None,
            tool_input: None,
        });
    }

    None
}

/// Two or more `N. text` lines form a menu, but only when the text after the
/// last numbered line is short — a long trailer means the numbers were part
/// of running prose.
fn detect_menu(clean: &str) -> Option<DetectedPrompt> {
    let matches: Vec<regex::Captures<'_>> = MENU_LINE_RE.captures_iter(clean).collect();
    if matches.len() < 2 {
        return None;
    }

    let last = matches.last()?.get(0)?;
    let after_last = clean[last.end()..].trim();
    if after_last.chars().count() >= MAX_MENU_TRAILER {
        return None;
    }

    let options: Vec<PromptOption> = matches
        .iter()
        .map(|caps| PromptOption::new(caps[2].trim(), &caps[1]))
        .collect();
    if !MENU_OPTIONS.contains(&options.len()) {
        return None;
    }

    let first_start = matches.first()?.get(0)?.start();
    let message = if first_start > 0 {
        clean[..first_start].trim().to_string()
    } else {
        String::new()
    };
    let message = if message.is_empty() {
        "Choose an option".to_string()
    } else {
        message
    };

    Some(DetectedPrompt {
        prompt_type: PromptType::Choice,
        message,
        options,
        tool_name: None,
        tool_input: None,
    })
}
