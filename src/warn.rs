//! Per-operation warning sink.
//!
//! Warnings are printed as they happen and recorded for a deduplicated
//! replay at the end of the operation. The sink is created by the
//! executor and passed down; there is no global warning state.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct WarningSink {
    recorded: Vec<String>,
    once: HashSet<String>,
}

impl WarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print and record a warning.
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        eprintln!("WARN: {}", msg);
        self.recorded.push(msg);
    }

    /// Print and record a warning, suppressing repeats of the same message.
    pub fn warn_once(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.once.contains(&msg) {
            return;
        }
        self.once.insert(msg.clone());
        eprintln!("WARN: {}", msg);
        self.recorded.push(msg);
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// All recorded warnings, deduplicated, in first-seen order.
    pub fn drain(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.recorded
            .iter()
            .filter(|msg| seen.insert(msg.as_str()))
            .cloned()
            .collect()
    }

    /// Replay the deduplicated batch to stderr.
    pub fn print_summary(&self) {
        let combined = self.drain();
        if combined.is_empty() {
            return;
        }
        eprintln!("All warnings combined:");
        for msg in combined {
            eprintln!("  {}", msg);
        }
    }
}
