//! Return-value correlation cache
//!
//! A call is formatted at function entry, but its return value only shows up
//! at function exit, possibly much later and after any number of nested or
//! concurrent calls. The cache holds each formatted call until its return value
//! arrives, then writes the two out together.
//!
//! # Design
//!
//! ```text
//! entry ──► append() ──► [ t1:f1 | t2:g1 | t1:f2 | ... ]   (insertion order)
//!                              ▲
//! exit ───► set_return_value() ┘  newest-first search, same thread only
//!                │
//!                └──► output(tid): flush tid's records once its oldest
//!                     record is resolved, then compact the others down
//! ```
//!
//! - Capacity is fixed at construction; the backing store is allocated once.
//! - Hitting the capacity (or the configured soft limit) flushes everything,
//!   resolved or not, before the next record is stored.
//! - After such a flush, return values whose record is gone are expected and
//!   are dropped silently.
//!
//! All mutations happen under one mutex. A batch leaving the cache takes a
//! ticket under that mutex, is rendered with no lock held (string return
//! values are read from traced memory), and is written once every earlier
//! ticket has been written.

use crate::filter::prefix_eq;
use crate::memory::MemoryReader;
use crate::retval::{ReturnHint, NEVER_RETURNS, UNKNOWN_VALUE};
use crate::sink::TraceSink;
use std::collections::TryReserveError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Default number of records the cache can hold (128K)
pub const DEFAULT_CAPACITY: usize = 128 * 1024;

/// Calls whose exit is never observed; caching them would only leak slots
pub const NEVER_EXITS: &[&str] = &["libc.so.6!__libc_start_main", "libc.so.6!exit"];

/// Errors raised while setting up the cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Return value cache capacity must be > 0")]
    ZeroCapacity,

    #[error("Failed to allocate return value cache of {capacity} entries: {source}")]
    Allocation {
        capacity: usize,
        #[source]
        source: TryReserveError,
    },
}

/// Cache sizing and output style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Hard capacity `C`
    pub capacity: usize,
    /// Soft limit `M`; 0 disables it
    pub max_cache_size: usize,
    /// Single-line `call = value` output instead of `call\n    ret: value`
    pub grepable: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_cache_size: 0,
            grepable: false,
        }
    }
}

impl CacheConfig {
    /// Number of records that triggers a full flush on the next append
    pub fn flush_threshold(&self) -> usize {
        if self.max_cache_size > 0 {
            self.max_cache_size.min(self.capacity)
        } else {
            self.capacity
        }
    }

    fn return_separator(&self) -> &'static str {
        if self.grepable {
            " = "
        } else {
            "\n    ret: "
        }
    }
}

/// Whether unmatched return values are worth reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// No bulk flush has happened; an unmatched return value is an error
    Normal,
    /// Records were flushed in bulk, so unmatched return values are expected
    RecentlyFlushed,
}

/// Lifecycle of a cached record. `Emitted` records leave the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Resolved,
}

/// One formatted call waiting for its return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCall {
    thread_id: u32,
    call_text: Box<str>,
    return_hint: ReturnHint,
    return_value: Option<usize>,
}

impl CachedCall {
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn call_text(&self) -> &str {
        &self.call_text
    }

    pub fn return_hint(&self) -> ReturnHint {
        self.return_hint
    }

    pub fn return_value(&self) -> Option<usize> {
        self.return_value
    }

    pub fn state(&self) -> RecordState {
        if self.return_value.is_some() {
            RecordState::Resolved
        } else {
            RecordState::Pending
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Records stored
    pub appended: u64,
    /// Records that received their return value
    pub resolved: u64,
    /// Records written out (any path)
    pub emitted: u64,
    /// Bulk flushes (size limits or explicit flush-all)
    pub full_flushes: u64,
    /// Never-exiting calls written out immediately
    pub never_exits: u64,
    /// Return values reported as unmatched
    pub unmatched: u64,
    /// Return values dropped silently after a bulk flush
    pub orphans_suppressed: u64,
}

/// Something to write once the state lock is released
enum Emission {
    Record(CachedCall),
    NeverReturns(String),
    Unmatched { signature: String, value: usize },
}

/// Fixed-capacity slot arena; live records always occupy `slots[..len]`
struct CacheState {
    slots: Vec<Option<CachedCall>>,
    len: usize,
    status: CacheStatus,
    stats: CacheStats,
    next_ticket: u64,
}

impl CacheState {
    fn with_capacity(capacity: usize) -> Result<Self, CacheError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|source| CacheError::Allocation { capacity, source })?;
        slots.resize_with(capacity, || None);

        Ok(Self {
            slots,
            len: 0,
            status: CacheStatus::Normal,
            stats: CacheStats::default(),
            next_ticket: 0,
        })
    }

    fn push(&mut self, record: CachedCall) {
        self.slots[self.len] = Some(record);
        self.len += 1;
        self.stats.appended += 1;
    }

    fn live(&self) -> impl Iterator<Item = &CachedCall> {
        self.slots[..self.len].iter().flatten()
    }

    /// Move every record out, in insertion order
    fn drain_all(&mut self, batch: &mut Vec<Emission>) {
        for slot in &mut self.slots[..self.len] {
            if let Some(record) = slot.take() {
                batch.push(Emission::Record(record));
            }
        }
        self.stats.emitted += self.len as u64;
        self.stats.full_flushes += 1;
        self.len = 0;
        self.status = CacheStatus::RecentlyFlushed;
    }

    /// Resolve the newest pending record of `thread_id` matching `signature`
    fn resolve(&mut self, thread_id: u32, signature: &[u8], value: usize) -> bool {
        for slot in self.slots[..self.len].iter_mut().rev() {
            let Some(record) = slot else { continue };
            if record.return_value.is_some() || record.thread_id != thread_id {
                continue;
            }
            if prefix_eq(record.call_text.as_bytes(), signature) {
                record.return_value = Some(value);
                self.stats.resolved += 1;
                return true;
            }
        }
        false
    }

    /// Flush `thread_id`'s records once its oldest one is resolved, then
    /// shift the remaining records down over the freed slots.
    fn drain_thread(&mut self, thread_id: u32, batch: &mut Vec<Emission>) {
        let first = self.slots[..self.len]
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|r| r.thread_id == thread_id));

        let Some(first) = first else { return };

        let leading_resolved = self.slots[first]
            .as_ref()
            .is_some_and(|r| r.return_value.is_some());
        if !leading_resolved {
            return;
        }

        let mut free = first;
        for i in first..self.len {
            let belongs = self.slots[i]
                .as_ref()
                .is_some_and(|r| r.thread_id == thread_id);

            if belongs {
                if let Some(record) = self.slots[i].take() {
                    batch.push(Emission::Record(record));
                    self.stats.emitted += 1;
                }
            } else {
                if i != free {
                    self.slots[free] = self.slots[i].take();
                }
                free += 1;
            }
        }

        self.len = free;
    }
}

/// Writes rendered batches to the sink in ticket order
#[derive(Default)]
struct EmitOrder {
    next: Mutex<u64>,
    turn: Condvar,
}

impl EmitOrder {
    fn wait_for(&self, ticket: u64) -> MutexGuard<'_, u64> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        while *next != ticket {
            next = self.turn.wait(next).unwrap_or_else(PoisonError::into_inner);
        }
        next
    }

    fn advance(&self, mut next: MutexGuard<'_, u64>) {
        *next += 1;
        drop(next);
        self.turn.notify_all();
    }
}

/// A claimed ticket. Dropping it unwritten (a panic while rendering) still
/// passes the turn on, so later batches are not stuck behind it.
struct EmitTicket<'a> {
    order: &'a EmitOrder,
    ticket: u64,
    written: bool,
}

impl Drop for EmitTicket<'_> {
    fn drop(&mut self) {
        if !self.written {
            let next = self.order.wait_for(self.ticket);
            self.order.advance(next);
        }
    }
}

/// Bounded cache correlating call entries with their return values
pub struct CorrelationCache {
    state: Mutex<CacheState>,
    emit_order: EmitOrder,
    config: CacheConfig,
    sink: Arc<dyn TraceSink>,
    memory: Option<Arc<dyn MemoryReader>>,
}

impl CorrelationCache {
    /// Allocate the cache. `memory` is used to dereference string return
    /// values at flush time; without it only addresses are printed.
    pub fn new(
        config: CacheConfig,
        sink: Arc<dyn TraceSink>,
        memory: Option<Arc<dyn MemoryReader>>,
    ) -> Result<Self, CacheError> {
        if config.capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }

        let state = CacheState::with_capacity(config.capacity)?;

        tracing::debug!(
            capacity = config.capacity,
            max_cache_size = config.max_cache_size,
            grepable = config.grepable,
            "return value cache initialized"
        );

        Ok(Self {
            state: Mutex::new(state),
            emit_order: EmitOrder::default(),
            config,
            sink,
            memory,
        })
    }

    /// Store a formatted call until its return value arrives.
    ///
    /// `qualified_name` is the call's `module!function`; calls that never
    /// return are written out at once with a `??` value and not cached.
    pub fn append(
        &self,
        thread_id: u32,
        qualified_name: &str,
        call_text: String,
        return_hint: ReturnHint,
    ) {
        let mut state = self.lock_state();
        let mut batch = Vec::new();

        if self.config.max_cache_size > 0 && state.len >= self.config.max_cache_size {
            tracing::debug!(
                size = state.len,
                limit = self.config.max_cache_size,
                "soft cache limit reached, flushing"
            );
            state.drain_all(&mut batch);
        }

        if NEVER_EXITS.contains(&qualified_name) {
            state.stats.never_exits += 1;
            batch.push(Emission::NeverReturns(call_text));
            self.publish(state, batch);
            return;
        }

        if state.len >= self.config.capacity {
            tracing::debug!(capacity = self.config.capacity, "cache full, flushing");
            state.drain_all(&mut batch);
        }

        state.push(CachedCall {
            thread_id,
            call_text: call_text.into_boxed_str(),
            return_hint,
            return_value: None,
        });

        self.publish(state, batch);
    }

    /// Deliver the return value observed at a call exit.
    ///
    /// The newest pending record of `thread_id` whose text matches
    /// `signature` (compared over the shorter of the two) is resolved, and
    /// the thread's records are flushed if possible.
    pub fn set_return_value(&self, thread_id: u32, signature: &str, value: usize) {
        let mut state = self.lock_state();
        let mut batch = Vec::new();

        if state.resolve(thread_id, signature.as_bytes(), value) {
            state.drain_thread(thread_id, &mut batch);
        } else {
            match state.status {
                CacheStatus::Normal => {
                    state.stats.unmatched += 1;
                    batch.push(Emission::Unmatched {
                        signature: signature.to_string(),
                        value,
                    });
                }
                CacheStatus::RecentlyFlushed => {
                    state.stats.orphans_suppressed += 1;
                    tracing::trace!(thread_id, signature, "orphan return value after flush");
                }
            }
        }

        self.publish(state, batch);
    }

    /// Write out cached records.
    ///
    /// With `clear_all`, every record is written in insertion order and the
    /// cache is emptied. Otherwise only `thread_id`'s records are written, and
    /// only if its oldest record already has a return value.
    pub fn output(&self, thread_id: u32, clear_all: bool) {
        let mut state = self.lock_state();
        let mut batch = Vec::new();

        if clear_all {
            state.drain_all(&mut batch);
        } else {
            state.drain_thread(thread_id, &mut batch);
        }

        self.publish(state, batch);
    }

    /// Write out and remove every record
    pub fn flush_all(&self) {
        self.output(0, true);
    }

    /// Check the cache is empty before teardown.
    ///
    /// Returns `true` if it was. A non-empty cache is reported but left
    /// intact, so a later [`flush_all`](Self::flush_all) still writes it out.
    pub fn shutdown(&self) -> bool {
        let remaining = self.len();
        self.sink.flush();

        if remaining != 0 {
            tracing::warn!(remaining, "return value cache not empty at teardown");
            eprintln!(
                "WARNING: freeing return value cache even though it is not empty!: {}",
                remaining
            );
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.lock_state().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn status(&self) -> CacheStatus {
        self.lock_state().status
    }

    pub fn stats(&self) -> CacheStats {
        self.lock_state().stats
    }

    /// Copy of the live records, oldest first
    pub fn snapshot(&self) -> Vec<CachedCall> {
        self.lock_state().live().cloned().collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the batch to the sink. The ticket is taken under the state lock,
    /// so batches reach the sink in the order they left the cache, but no
    /// lock is held while the lines are rendered.
    fn publish(&self, mut state: MutexGuard<'_, CacheState>, batch: Vec<Emission>) {
        if batch.is_empty() {
            return;
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        drop(state);

        let mut ticket = EmitTicket {
            order: &self.emit_order,
            ticket,
            written: false,
        };

        let lines: Vec<String> = batch
            .into_iter()
            .map(|emission| self.render(emission))
            .collect();

        let next = self.emit_order.wait_for(ticket.ticket);
        for line in &lines {
            self.sink.emit_line(line);
        }
        ticket.written = true;
        self.emit_order.advance(next);
    }

    fn render(&self, emission: Emission) -> String {
        let sep = self.config.return_separator();
        match emission {
            Emission::Record(record) => {
                let value = match record.return_value {
                    Some(v) => record.return_hint.render(v, self.memory.as_deref()),
                    None => UNKNOWN_VALUE.to_string(),
                };
                format!("{}{}{}", record.call_text, sep, value)
            }
            Emission::NeverReturns(call_text) => format!("{}{}{}", call_text, sep, NEVER_RETURNS),
            Emission::Unmatched { signature, value } => format!(
                "ERROR: failed to find cache entry for [{}] (return value: {:#x})",
                signature, value
            ),
        }
    }
}

impl std::fmt::Debug for CorrelationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("status", &self.status())
            .finish()
    }
}
