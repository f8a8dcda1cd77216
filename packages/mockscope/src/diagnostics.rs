//! Structured, non-fatal diagnostics recorded during resolution.
//!
//! Problems that must not fail the caller (nested test methods on one stack,
//! frameworks whose markers cannot be resolved, dead weak handles) are logged
//! through the `log` facade and kept here so hosts and tests can inspect them.

use std::collections::VecDeque;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::MethodId;
use crate::scope::ScopeKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// More than one distinct test method is active on the same stack.
    AmbiguousScope {
        chosen: MethodId,
        shadowed: Vec<MethodId>,
    },
    /// A framework adapter was skipped because its markers do not resolve.
    AdapterUnavailable { framework: String },
    /// A weak store found a reclaimed resource and dropped its entry.
    DeadHandlePurged { level: String, key: ScopeKey },
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

/// Entries kept by [`Diagnostics::new`] before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Ring {
    entries: VecDeque<Diagnostic>,
    dropped: u64,
}

/// Bounded sink: once full, each new record evicts the oldest one.
#[derive(Debug)]
pub struct Diagnostics {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Diagnostics {
            ring: Mutex::new(Ring {
                entries: VecDeque::new(),
                dropped: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, kind: DiagnosticKind) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut ring = self.ring.lock();
        if ring.entries.len() >= self.capacity {
            ring.entries.pop_front();
            ring.dropped += 1;
        }
        ring.entries.push_back(Diagnostic { timestamp_ms, kind });
    }

    /// Records evicted to stay within capacity.
    pub fn dropped(&self) -> u64 {
        self.ring.lock().dropped
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.ring
            .lock()
            .entries
            .iter()
            .map(|entry| entry.kind.clone())
            .collect()
    }

    pub fn drain(&self) -> Vec<Diagnostic> {
        self.ring.lock().entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every recorded diagnostic as one JSON object per line.
    pub fn write_json_lines(&self, writer: &mut impl Write) -> std::io::Result<()> {
        for entry in self.ring.lock().entries.iter() {
            let json = serde_json::to_string(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(writer, "{}", json)?;
        }
        writer.flush()
    }
}
