//! The dispatch layer between the core and the extender: every hook call
//! goes through here so invocation counts and elapsed time get recorded.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::context::UrlContext;
use crate::error::CrawlError;
use crate::extender::{DelayInfo, EnqueueSlot, Extender, FetchInfo, FetchResponse};

use super::EndReason;

/// The pipeline's extension points, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    Start,
    End,
    Error,
    ComputeDelay,
    Fetch,
    RequestGet,
    RequestRobots,
    FetchedRobots,
    Filter,
    Enqueued,
    Visit,
    Visited,
    Disallowed,
}

const HOOK_COUNT: usize = 13;

/// Per-run hook metrics: how many times each hook ran, and for how long
/// in total. Shared freely; all counters are atomic.
#[derive(Debug)]
pub struct HookStats {
    counts: [AtomicUsize; HOOK_COUNT],
    elapsed_ns: [AtomicU64; HOOK_COUNT],
}

impl Default for HookStats {
    fn default() -> HookStats {
        HookStats {
            counts: std::array::from_fn(|_| AtomicUsize::new(0)),
            elapsed_ns: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl HookStats {
    pub fn count(&self, hook: Hook) -> usize {
        self.counts[hook as usize].load(Ordering::Acquire)
    }

    pub fn elapsed(&self, hook: Hook) -> Duration {
        Duration::from_nanos(self.elapsed_ns[hook as usize].load(Ordering::Acquire))
    }

    fn record(&self, hook: Hook, elapsed: Duration) {
        self.counts[hook as usize].fetch_add(1, Ordering::Release);
        self.elapsed_ns[hook as usize].fetch_add(elapsed.as_nanos() as u64, Ordering::Release);
    }
}

/// Metered access to an extender. Cloning shares the stats.
pub(crate) struct Hooks {
    ext: Arc<dyn Extender>,
    pub stats: Arc<HookStats>,
}

impl Clone for Hooks {
    fn clone(&self) -> Hooks {
        Hooks {
            ext: self.ext.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl Hooks {
    pub fn new(ext: Arc<dyn Extender>) -> Hooks {
        Hooks {
            ext,
            stats: Arc::new(HookStats::default()),
        }
    }

    fn timed<T>(&self, hook: Hook, call: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = call();
        self.stats.record(hook, started.elapsed());
        out
    }

    pub fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        self.ext.enqueue_slot()
    }

    pub fn start(&self, seeds: Vec<Url>) -> Vec<Url> {
        self.timed(Hook::Start, || self.ext.start(seeds))
    }

    pub fn end(&self, reason: EndReason) {
        self.timed(Hook::End, || self.ext.end(reason))
    }

    pub fn error(&self, err: &CrawlError) {
        self.timed(Hook::Error, || self.ext.error(err))
    }

    pub fn compute_delay(
        &self,
        host: &str,
        info: &DelayInfo,
        last_fetch: Option<&FetchInfo>,
    ) -> Duration {
        self.timed(Hook::ComputeDelay, || {
            self.ext.compute_delay(host, info, last_fetch)
        })
    }

    pub async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        let started = Instant::now();
        let out = self.ext.fetch(ctx, agent, is_head).await;
        self.stats.record(Hook::Fetch, started.elapsed());
        out
    }

    pub fn request_get(&self, ctx: &UrlContext, head: &FetchResponse) -> bool {
        self.timed(Hook::RequestGet, || self.ext.request_get(ctx, head))
    }

    pub fn request_robots(&self, ctx: &UrlContext, agent: &str) -> (Option<Vec<u8>>, bool) {
        self.timed(Hook::RequestRobots, || self.ext.request_robots(ctx, agent))
    }

    pub fn fetched_robots(&self, ctx: &UrlContext, res: &FetchResponse) {
        self.timed(Hook::FetchedRobots, || self.ext.fetched_robots(ctx, res))
    }

    pub fn filter(&self, ctx: &UrlContext, is_visited: bool) -> bool {
        self.timed(Hook::Filter, || self.ext.filter(ctx, is_visited))
    }

    pub fn enqueued(&self, ctx: &UrlContext) {
        self.timed(Hook::Enqueued, || self.ext.enqueued(ctx))
    }

    pub fn visit(
        &self,
        ctx: &UrlContext,
        res: &FetchResponse,
        body: &[u8],
    ) -> (Option<Vec<Url>>, bool) {
        self.timed(Hook::Visit, || self.ext.visit(ctx, res, body))
    }

    pub fn visited(&self, ctx: &UrlContext, harvested: &[Url]) {
        self.timed(Hook::Visited, || self.ext.visited(ctx, harvested))
    }

    pub fn disallowed(&self, ctx: &UrlContext) {
        self.timed(Hook::Disallowed, || self.ext.disallowed(ctx))
    }
}
