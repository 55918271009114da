//! Replay of recorded call events
//!
//! An event script is JSON lines, one event per line:
//!
//! ```text
//! {"kind":"module_load","module":"libc.so.6"}
//! {"kind":"memory","addr":4096,"bytes":"2f746d7000"}
//! {"kind":"entry","tid":1,"module":"libc.so.6","function":"getenv","args":["\"TMP\""],"ret":"c_string"}
//! {"kind":"exit","tid":1,"module":"libc.so.6","function":"getenv","value":4096}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. `memory` events
//! describe traced-process memory (hex-encoded) that string return values
//! may point into; they are gathered before replay starts.

use crate::memory::MemorySnapshot;
use crate::retval::ReturnHint;
use crate::session::{CallEntry, CallExit, TraceSession};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read event script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid event on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid memory bytes on line {line}: {source}")]
    Hex {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },
}

/// One recorded instrumentation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    ModuleLoad {
        module: Option<String>,
    },
    Entry {
        tid: Option<u32>,
        module: Option<String>,
        function: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        ret: ReturnHint,
    },
    Exit {
        tid: Option<u32>,
        module: Option<String>,
        function: String,
        value: usize,
    },
    Memory {
        addr: usize,
        bytes: String,
    },
}

/// A parsed event script
#[derive(Debug, Clone, Default)]
pub struct EventScript {
    events: Vec<TraceEvent>,
    memory: MemorySnapshot,
}

impl EventScript {
    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        let mut script = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }

            let event: TraceEvent =
                serde_json::from_str(raw).map_err(|source| ReplayError::Parse { line, source })?;

            match event {
                TraceEvent::Memory { addr, bytes } => {
                    let bytes =
                        hex::decode(bytes).map_err(|source| ReplayError::Hex { line, source })?;
                    script.memory.insert(addr, bytes);
                }
                other => script.events.push(other),
            }
        }

        Ok(script)
    }

    pub fn from_file(path: &Path) -> Result<Self, ReplayError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Call events in script order (memory events excluded)
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn memory(&self) -> &MemorySnapshot {
        &self.memory
    }

    /// Move the captured memory out, e.g. to hand it to a cache
    pub fn take_memory(&mut self) -> MemorySnapshot {
        std::mem::take(&mut self.memory)
    }
}

/// What a replay did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub entries: u64,
    pub exits: u64,
    pub traced: u64,
    /// Events dropped because their module was not instrumented
    pub uninstrumented: u64,
}

/// Feed every event of `script` through `session`.
///
/// A module is instrumented or not as decided on its first `module_load`
/// event, or on the first call into it if it was never announced.
pub fn replay(session: &TraceSession, script: &EventScript) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let mut modules: HashMap<Option<String>, bool> = HashMap::new();

    for event in script.events() {
        match event {
            TraceEvent::ModuleLoad { module } => {
                modules
                    .entry(module.clone())
                    .or_insert_with(|| session.on_module_load(module.as_deref()));
            }
            TraceEvent::Entry {
                tid,
                module,
                function,
                args,
                ret,
            } => {
                summary.entries += 1;
                if !instrumented(session, &mut modules, module) {
                    summary.uninstrumented += 1;
                    continue;
                }
                let entry = CallEntry {
                    thread_id: *tid,
                    module: module.clone(),
                    function: function.clone(),
                    args: args.clone(),
                    return_hint: *ret,
                };
                if session.on_call_entry(&entry) {
                    summary.traced += 1;
                }
            }
            TraceEvent::Exit {
                tid,
                module,
                function,
                value,
            } => {
                summary.exits += 1;
                if !instrumented(session, &mut modules, module) {
                    summary.uninstrumented += 1;
                    continue;
                }
                session.on_call_exit(&CallExit {
                    thread_id: *tid,
                    module: module.clone(),
                    function: function.clone(),
                    value: *value,
                });
            }
            // Collected at parse time
            TraceEvent::Memory { .. } => {}
        }
    }

    tracing::debug!(
        entries = summary.entries,
        exits = summary.exits,
        traced = summary.traced,
        uninstrumented = summary.uninstrumented,
        "replay complete"
    );

    summary
}

fn instrumented(
    session: &TraceSession,
    modules: &mut HashMap<Option<String>, bool>,
    module: &Option<String>,
) -> bool {
    *modules
        .entry(module.clone())
        .or_insert_with(|| session.on_module_load(module.as_deref()))
}
