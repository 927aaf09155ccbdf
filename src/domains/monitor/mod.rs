use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use crate::domains::instance::Status;

/// How long the output must stay unchanged before an instance counts as
/// settled (Ready rather than Running).
pub const READY_SETTLE_WINDOW: Duration = Duration::from_millis(500);

/// Only the tail of a capture is scanned for prompts; assistants render them
/// at the bottom of the screen.
const PROMPT_TAIL_LINES: usize = 10;

/// Per-assistant prompt signatures. Matching is case-insensitive substring
/// search over the pane tail. New assistants are supported by adding an
/// entry, nothing else.
struct PromptSignatures {
    assistant: &'static str,
    patterns: &'static [&'static str],
}

const PROMPT_REGISTRY: &[PromptSignatures] = &[
    PromptSignatures {
        assistant: "claude",
        patterns: &[
            "do you trust the files in this folder",
            "do you want to proceed",
            "do you want to make this edit",
            "do you want to continue",
            "yes, proceed",
        ],
    },
    PromptSignatures {
        assistant: "aider",
        patterns: &["(y)es/(n)o", "add them to the chat", "proceed? (y/n)"],
    },
    PromptSignatures {
        assistant: "generic",
        patterns: &["[y/n]", "(y/n)", "press enter to continue"],
    },
];

const LOADING_PATTERNS: &[&str] = &["starting", "initializing", "loading"];

/// Watches one instance's session output. Keeps a SHA-256 fingerprint of the
/// last capture plus the time it last changed, and classifies the instance
/// from those two facts. The monitor never mutates the instance record.
#[derive(Debug)]
pub struct OutputMonitor {
    last_fingerprint: Option<[u8; 32]>,
    last_change: Instant,
    saw_output: bool,
}

impl Default for OutputMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputMonitor {
    pub fn new() -> Self {
        OutputMonitor {
            last_fingerprint: None,
            last_change: Instant::now(),
            saw_output: false,
        }
    }

    /// Feed one capture sample. Returns `(changed, has_prompt)`: whether the
    /// output moved since the previous sample, and whether a known assistant
    /// prompt is on screen.
    pub fn has_updated(&mut self, captured: &str) -> (bool, bool) {
        let fingerprint = fingerprint(captured.as_bytes());
        let changed = self.last_fingerprint != Some(fingerprint);
        if changed {
            self.last_fingerprint = Some(fingerprint);
            self.last_change = Instant::now();
            if !captured.trim().is_empty() {
                self.saw_output = true;
            }
        }
        (changed, detect_prompt(captured).is_some())
    }

    /// Time since the output last moved.
    pub fn since_last_change(&self) -> Duration {
        self.last_change.elapsed()
    }

    /// Classify from the most recent sample. `session_alive` comes from the
    /// session manager; a dead session means Paused regardless of history.
    pub fn classify(&self, session_alive: bool, captured: &str) -> Status {
        if !session_alive {
            return Status::Paused;
        }
        if !self.saw_output || matches_loading_banner(captured) {
            return Status::Loading;
        }
        if self.since_last_change() >= READY_SETTLE_WINDOW && detect_prompt(captured).is_none() {
            return Status::Ready;
        }
        Status::Running
    }
}

pub fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Which assistant's prompt (if any) is showing in the pane tail.
pub fn detect_prompt(captured: &str) -> Option<&'static str> {
    let tail: Vec<&str> = captured
        .lines()
        .rev()
        .take(PROMPT_TAIL_LINES)
        .collect();
    let tail = tail
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();

    for sig in PROMPT_REGISTRY {
        if sig.patterns.iter().any(|p| tail.contains(p)) {
            return Some(sig.assistant);
        }
    }
    None
}

fn matches_loading_banner(captured: &str) -> bool {
    let trimmed = captured.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    trimmed.lines().count() <= 2 && LOADING_PATTERNS.iter().any(|p| lower.contains(p))
}
