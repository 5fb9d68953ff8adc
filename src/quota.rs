//! The quota manager: weighted-token accounting for a session tree.
//!
//! Token classes are weighted differently — output tokens cost more than
//! input, cached input less — and the session budget is expressed in
//! *weighted* tokens. One manager instance is the single authority for a
//! parent process and every nested agent invocation it registers: children
//! never hold their own limit, only a reference (through the FS-proxy) to
//! the parent's manager.
//!
//! The manager is thread-safe; `consume` and `can_call` are atomic with
//! respect to each other.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use crate::types::UsageBlock;

/// Per-class multipliers applied to raw token counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaWeights {
    /// Weight for uncached prompt tokens.
    pub input: f64,
    /// Weight for prompt tokens served from the provider cache.
    pub cached: f64,
    /// Weight for completion tokens.
    pub output: f64,
}

impl Default for QuotaWeights {
    fn default() -> Self {
        // Mirrors the usual relative pricing: cached input at a quarter of
        // input, output at four times input.
        Self {
            input: 1.0,
            cached: 0.25,
            output: 4.0,
        }
    }
}

/// Raw token counts by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QuotaUsage {
    /// Uncached prompt tokens.
    pub input: u64,
    /// Cached prompt tokens.
    pub cached: u64,
    /// Completion tokens.
    pub output: u64,
}

impl QuotaUsage {
    /// Builds usage from a wire usage block. Cached tokens come only from
    /// the explicit `prompt_tokens_details.cached_tokens` field; absence
    /// means zero, never a guess.
    pub fn from_usage_block(block: &UsageBlock) -> Self {
        Self {
            input: block.uncached_prompt_tokens(),
            cached: block.cached_tokens(),
            output: block.completion_tokens,
        }
    }

    /// Adds another usage record onto this one.
    pub fn add(&mut self, other: &QuotaUsage) {
        self.input += other.input;
        self.cached += other.cached;
        self.output += other.output;
    }

    /// The weighted total of this record.
    pub fn weighted(&self, weights: &QuotaWeights) -> f64 {
        self.input as f64 * weights.input
            + self.cached as f64 * weights.cached
            + self.output as f64 * weights.output
    }
}

/// One registered process in the shared manager.
#[derive(Debug)]
pub struct ProcessQuotaInfo {
    /// The process's own id.
    pub process_id: u32,
    /// Parent process id, if nested.
    pub parent_id: Option<u32>,
    /// When the process registered.
    pub start_time: Instant,
    /// Tokens consumed by this process alone.
    pub local_usage: QuotaUsage,
    /// False once unregistered; usage is retained for reporting.
    pub active: bool,
}

/// Point-in-time accounting summary.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    /// Raw counts by class.
    pub usage: QuotaUsage,
    /// `usage` folded through the weights.
    pub total_weighted: f64,
    /// `max_tokens - total_weighted`, or -1 when unlimited.
    pub remaining: i64,
    /// True when a limit is set and nothing remains.
    pub quota_exceeded: bool,
}

struct Inner {
    max_tokens: i64,
    weights: QuotaWeights,
    global: QuotaUsage,
    processes: HashMap<u32, ProcessQuotaInfo>,
}

/// The shared, thread-safe quota authority.
pub struct QuotaManager {
    inner: RwLock<Inner>,
}

impl QuotaManager {
    /// Creates a manager with the given weighted-token budget.
    /// `max_tokens <= 0` means unlimited.
    pub fn new(max_tokens: i64, weights: QuotaWeights) -> Self {
        Self {
            inner: RwLock::new(Inner {
                max_tokens,
                weights,
                global: QuotaUsage::default(),
                processes: HashMap::new(),
            }),
        }
    }

    /// An unlimited manager with default weights.
    pub fn unlimited() -> Self {
        Self::new(0, QuotaWeights::default())
    }

    /// Registers a process (the top-level session, or a nested child).
    pub fn register(&self, process_id: u32, parent_id: Option<u32>) {
        let mut inner = self.inner.write().unwrap();
        inner
            .processes
            .entry(process_id)
            .or_insert_with(|| ProcessQuotaInfo {
                process_id,
                parent_id,
                start_time: Instant::now(),
                local_usage: QuotaUsage::default(),
                active: true,
            });
    }

    /// Whether `process_id` may issue another LLM call under the global
    /// budget.
    pub fn can_call(&self, _process_id: u32) -> bool {
        let inner = self.inner.read().unwrap();
        if inner.max_tokens <= 0 {
            return true;
        }
        (inner.global.weighted(&inner.weights) as i64) < inner.max_tokens
    }

    /// Records usage against both the process and the global pool.
    pub fn consume(&self, process_id: u32, usage: &QuotaUsage) {
        let mut inner = self.inner.write().unwrap();
        inner.global.add(usage);
        if let Some(process) = inner.processes.get_mut(&process_id) {
            process.local_usage.add(usage);
        }
    }

    /// Marks a process inactive; its usage stays in the books.
    pub fn unregister(&self, process_id: u32) {
        let mut inner = self.inner.write().unwrap();
        if let Some(process) = inner.processes.get_mut(&process_id) {
            process.active = false;
        }
    }

    /// Current global accounting.
    pub fn snapshot(&self) -> QuotaSnapshot {
        let inner = self.inner.read().unwrap();
        let total_weighted = inner.global.weighted(&inner.weights);
        let remaining = if inner.max_tokens <= 0 {
            -1
        } else {
            inner.max_tokens - total_weighted as i64
        };
        QuotaSnapshot {
            usage: inner.global,
            total_weighted,
            remaining,
            quota_exceeded: inner.max_tokens > 0 && remaining <= 0,
        }
    }

    /// Weighted tokens still available, or -1 when unlimited.
    pub fn remaining(&self) -> i64 {
        self.snapshot().remaining
    }

    /// True when a limit is set and it has been reached.
    pub fn quota_exceeded(&self) -> bool {
        self.snapshot().quota_exceeded
    }

    /// The configured budget (`<= 0` means unlimited).
    pub fn max_tokens(&self) -> i64 {
        self.inner.read().unwrap().max_tokens
    }

    /// A process's own usage, if it ever registered.
    pub fn process_usage(&self, process_id: u32) -> Option<QuotaUsage> {
        self.inner
            .read()
            .unwrap()
            .processes
            .get(&process_id)
            .map(|p| p.local_usage)
    }

    /// One-line human summary, appended to user turns and served over the
    /// proxy's `LLM_QUOTA`.
    pub fn summary(&self) -> String {
        let snapshot = self.snapshot();
        let max = self.max_tokens();
        if max <= 0 {
            format!(
                "quota: {:.0} weighted tokens used (input {}, cached {}, output {}), no limit",
                snapshot.total_weighted,
                snapshot.usage.input,
                snapshot.usage.cached,
                snapshot.usage.output
            )
        } else {
            format!(
                "quota: {:.0}/{} weighted tokens used (input {}, cached {}, output {}), {} remaining",
                snapshot.total_weighted,
                max,
                snapshot.usage.input,
                snapshot.usage.cached,
                snapshot.usage.output,
                snapshot.remaining.max(0)
            )
        }
    }
}
