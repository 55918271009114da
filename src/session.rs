//! Trace session: the instrumentation-layer side of the tracer
//!
//! A session owns one [`FilterEngine`] and one [`CorrelationCache`] and turns
//! call-entry/call-exit notifications into trace lines:
//!
//! ```text
//! entry ─► module filter ─► call filter ─► format ─► cache.append
//! exit  ─► signature ─────────────────────────────► cache.set_return_value
//! ```
//!
//! Argument decoding is not done here: arguments arrive already rendered.

use crate::cache::{CacheConfig, CacheError, CacheStats, CorrelationCache};
use crate::filter::{qualified_name, FilterEngine};
use crate::memory::MemoryReader;
use crate::retval::ReturnHint;
use crate::sink::TraceSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Thread id used when the host cannot identify the calling thread
pub const INVALID_THREAD_ID: u32 = 0;

/// An intercepted call entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEntry {
    /// Calling thread, if the host could identify it
    pub thread_id: Option<u32>,
    /// Module exporting the function, if it could be resolved
    pub module: Option<String>,
    pub function: String,
    /// Pre-rendered argument values, in ordinal order
    pub args: Vec<String>,
    pub return_hint: ReturnHint,
}

/// An intercepted call exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallExit {
    pub thread_id: Option<u32>,
    pub module: Option<String>,
    pub function: String,
    /// Raw pointer-sized return value
    pub value: usize,
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub calls_seen: u64,
    pub calls_traced: u64,
    pub calls_filtered: u64,
    pub exits_delivered: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
    calls_seen: AtomicU64,
    calls_traced: AtomicU64,
    calls_filtered: AtomicU64,
    exits_delivered: AtomicU64,
}

/// One tracing session over a single traced process
#[derive(Debug)]
pub struct TraceSession {
    filter: FilterEngine,
    cache: CorrelationCache,
    grepable: bool,
    counters: Counters,
}

impl TraceSession {
    pub fn new(
        filter: FilterEngine,
        cache_config: CacheConfig,
        sink: Arc<dyn TraceSink>,
        memory: Option<Arc<dyn MemoryReader>>,
    ) -> Result<Self, CacheError> {
        let cache = CorrelationCache::new(cache_config, sink, memory)?;
        Ok(Self {
            filter,
            cache,
            grepable: cache_config.grepable,
            counters: Counters::default(),
        })
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn cache(&self) -> &CorrelationCache {
        &self.cache
    }

    /// Decide whether a newly loaded module gets instrumented
    pub fn on_module_load(&self, module: Option<&str>) -> bool {
        let allowed = self.filter.module_allowed(module);
        tracing::debug!(module = module.unwrap_or("<unknown>"), allowed, "module load");
        allowed
    }

    /// Handle a call entry. Returns whether the call is traced.
    pub fn on_call_entry(&self, entry: &CallEntry) -> bool {
        self.counters.calls_seen.fetch_add(1, Ordering::Relaxed);

        let qualified = qualified_name(entry.module.as_deref(), &entry.function);
        if !self.filter.decide_qualified(&qualified) {
            self.counters.calls_filtered.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let call_text = self.format_call(entry.thread_id, &qualified, &entry.args);
        self.cache.append(
            entry.thread_id.unwrap_or(INVALID_THREAD_ID),
            &qualified,
            call_text,
            entry.return_hint,
        );
        self.counters.calls_traced.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Handle a call exit by delivering its return value to the cache
    pub fn on_call_exit(&self, exit: &CallExit) {
        self.counters.exits_delivered.fetch_add(1, Ordering::Relaxed);

        let qualified = qualified_name(exit.module.as_deref(), &exit.function);
        let signature = call_signature(exit.thread_id, &qualified);
        self.cache.set_return_value(
            exit.thread_id.unwrap_or(INVALID_THREAD_ID),
            &signature,
            exit.value,
        );
    }

    /// Flush everything and tear the cache down. Returns whether the cache
    /// was empty at teardown.
    pub fn finish(&self) -> bool {
        self.cache.flush_all();
        let stats = self.stats();
        tracing::debug!(
            seen = stats.calls_seen,
            traced = stats.calls_traced,
            filtered = stats.calls_filtered,
            exits = stats.exits_delivered,
            flushes = stats.cache.full_flushes,
            "trace session finished"
        );
        self.cache.shutdown()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            calls_seen: self.counters.calls_seen.load(Ordering::Relaxed),
            calls_traced: self.counters.calls_traced.load(Ordering::Relaxed),
            calls_filtered: self.counters.calls_filtered.load(Ordering::Relaxed),
            exits_delivered: self.counters.exits_delivered.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    fn format_call(&self, thread_id: Option<u32>, qualified: &str, args: &[String]) -> String {
        let mut out = call_signature(thread_id, qualified);
        for (ordinal, value) in args.iter().enumerate() {
            if self.grepable {
                out.push_str(&format!(" {{{}: {}}}", ordinal, value));
            } else {
                out.push_str(&format!("\n    arg {}: {}", ordinal, value));
            }
        }
        out
    }
}

/// Leading part of a call line, shared by entry formatting and exit matching
pub fn call_signature(thread_id: Option<u32>, qualified: &str) -> String {
    match thread_id {
        Some(tid) if tid != INVALID_THREAD_ID => format!("~~{}~~ {}", tid, qualified),
        _ => format!("~~calltrace~~ {}", qualified),
    }
}
