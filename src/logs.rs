//! Per-server console log rings and typed log formatting.

use dashmap::DashMap;
use std::collections::VecDeque;

/// Maximum number of lines retained per server.
pub const RING_CAPACITY: usize = 100;

/// Severity/origin of a formatted console line. Formatting is cosmetic; the
/// ring stores plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Info,
    Success,
    Error,
    Warning,
    Daemon,
}

impl LogType {
    fn color(&self) -> &'static str {
        match self {
            LogType::Info => "\x1b[36m",
            LogType::Success => "\x1b[32m",
            LogType::Error => "\x1b[31m",
            LogType::Warning => "\x1b[33m",
            LogType::Daemon => "\x1b[35m",
        }
    }

    /// Renders a console line with its ANSI color. `Daemon` lines carry the
    /// daemon prefix.
    pub fn format(&self, message: &str) -> String {
        match self {
            LogType::Daemon => format!("{}[Krypton Daemon]\x1b[0m {message}", self.color()),
            _ => format!("{}{message}\x1b[0m", self.color()),
        }
    }
}

/// Bounded FIFO of recent console lines, deduplicating exact adjacent repeats.
#[derive(Debug, Default)]
pub struct LogRing {
    lines: VecDeque<String>,
}

impl LogRing {
    /// Appends a line. Returns false when the line was dropped as an exact
    /// duplicate of the previous entry.
    pub fn push(&mut self, line: String) -> bool {
        if self.lines.back() == Some(&line) {
            return false;
        }
        if self.lines.len() == RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        true
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Process-wide owner of all per-server rings. Callers never see the map.
#[derive(Debug, Default)]
pub struct LogRegistry {
    rings: DashMap<String, LogRing>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the server's ring, creating it on first use. Returns false
    /// for adjacent duplicates.
    pub fn append(&self, server_id: &str, line: &str) -> bool {
        self.rings
            .entry(server_id.to_string())
            .or_default()
            .push(line.to_string())
    }

    pub fn tail(&self, server_id: &str, n: usize) -> Vec<String> {
        self.rings
            .get(server_id)
            .map(|ring| ring.tail(n))
            .unwrap_or_default()
    }

    pub fn snapshot(&self, server_id: &str) -> Vec<String> {
        self.rings
            .get(server_id)
            .map(|ring| ring.snapshot())
            .unwrap_or_default()
    }

    pub fn clear(&self, server_id: &str) {
        if let Some(mut ring) = self.rings.get_mut(server_id) {
            ring.clear();
        }
    }

    pub fn remove(&self, server_id: &str) {
        self.rings.remove(server_id);
    }
}
