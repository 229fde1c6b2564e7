//! The extension surface: the hook trait every caller implements, the
//! ready-made default extender, and the runtime enqueue channel.

use async_trait::async_trait;
use futures::channel::mpsc;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::context::{UrlContext, UserState};
use crate::crawler::{fetcher, EndReason};
use crate::error::{CrawlError, EnqueueError};

/// A fully-read HTTP response, as produced by the `fetch` hook. The body
/// is raw wire bytes; the core decodes content encodings itself.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Inputs to the `compute_delay` hook. All durations describe the host
/// the decision is being made for.
#[derive(Debug, Clone, Copy)]
pub struct DelayInfo {
    /// The delay configured in the options.
    pub opts_delay: Duration,
    /// The delay robots.txt advertises, when one was seen.
    pub robots_delay: Option<Duration>,
    /// What `compute_delay` returned last time, if it ran before.
    pub last_delay: Option<Duration>,
}

/// Summary of the most recent fetch on a host.
#[derive(Debug, Clone, Copy)]
pub struct FetchInfo {
    pub duration: Duration,
    pub status: StatusCode,
    pub is_head: bool,
}

/// A payload for the enqueue channel: one URL or many, raw or parsed,
/// with or without attached user state, or the graceful-stop sentinel.
pub enum Enqueue {
    /// A URL that still needs parsing.
    Raw(String),
    /// An already-parsed URL.
    Parsed(Url),
    /// Several payloads at once.
    List(Vec<Enqueue>),
    /// A parsed URL with user state to attach to its context.
    Stated(Url, UserState),
    /// Several stated URLs at once.
    StatedList(Vec<(Url, UserState)>),
    /// Ask the crawl to wind down once outstanding work drains.
    Stop,
}

impl From<&str> for Enqueue {
    fn from(raw: &str) -> Enqueue {
        Enqueue::Raw(raw.to_owned())
    }
}

impl From<String> for Enqueue {
    fn from(raw: String) -> Enqueue {
        Enqueue::Raw(raw)
    }
}

impl From<Url> for Enqueue {
    fn from(url: Url) -> Enqueue {
        Enqueue::Parsed(url)
    }
}

impl From<(Url, UserState)> for Enqueue {
    fn from((url, state): (Url, UserState)) -> Enqueue {
        Enqueue::Stated(url, state)
    }
}

impl From<Vec<String>> for Enqueue {
    fn from(raws: Vec<String>) -> Enqueue {
        Enqueue::List(raws.into_iter().map(Enqueue::Raw).collect())
    }
}

impl From<Vec<&str>> for Enqueue {
    fn from(raws: Vec<&str>) -> Enqueue {
        Enqueue::List(raws.into_iter().map(Enqueue::from).collect())
    }
}

impl From<Vec<Url>> for Enqueue {
    fn from(urls: Vec<Url>) -> Enqueue {
        Enqueue::List(urls.into_iter().map(Enqueue::Parsed).collect())
    }
}

impl From<Vec<(Url, UserState)>> for Enqueue {
    fn from(pairs: Vec<(Url, UserState)>) -> Enqueue {
        Enqueue::StatedList(pairs)
    }
}

impl From<HashMap<Url, UserState>> for Enqueue {
    fn from(map: HashMap<Url, UserState>) -> Enqueue {
        Enqueue::StatedList(map.into_iter().collect())
    }
}

impl From<()> for Enqueue {
    fn from(_: ()) -> Enqueue {
        Enqueue::List(Vec::new())
    }
}

/// What actually travels on the enqueue channel: the payload plus the
/// context that produced it, when a worker is re-submitting harvest.
pub(crate) struct EnqueueRequest {
    pub payload: Enqueue,
    pub source: Option<UrlContext>,
}

pub(crate) type EnqueueTx = mpsc::Sender<EnqueueRequest>;

/// The caller's end of the runtime enqueue channel. A crawl binds the
/// slot when a run starts; until then (and for extenders that expose no
/// slot at all) sends fail with [`EnqueueError::Unbound`].
#[derive(Default)]
pub struct EnqueueSlot {
    tx: Mutex<Option<EnqueueTx>>,
}

impl EnqueueSlot {
    pub fn new() -> EnqueueSlot {
        EnqueueSlot::default()
    }

    pub(crate) fn bind(&self, tx: EnqueueTx) {
        *self.tx.lock().expect("enqueue slot lock poisoned") = Some(tx);
    }

    pub fn is_bound(&self) -> bool {
        self.tx.lock().expect("enqueue slot lock poisoned").is_some()
    }

    /// Pushes a payload onto the running crawl's queue without blocking.
    pub fn send(&self, payload: impl Into<Enqueue>) -> Result<(), EnqueueError> {
        let mut guard = self.tx.lock().expect("enqueue slot lock poisoned");
        match guard.as_mut() {
            None => Err(EnqueueError::Unbound),
            Some(tx) => tx
                .try_send(EnqueueRequest {
                    payload: payload.into(),
                    source: None,
                })
                .map_err(|_| EnqueueError::Full),
        }
    }

    /// Requests a graceful stop of the running crawl.
    pub fn stop(&self) -> Result<(), EnqueueError> {
        self.send(Enqueue::Stop)
    }
}

/// Caller-supplied hooks for every stage of the pipeline.
///
/// Each hook has a default body implementing the stock behavior, so an
/// extender overrides only what it cares about. Compose rather than
/// inherit: a custom extender that wants the runtime enqueue channel
/// holds a [`DefaultExtender`] (or a bare [`EnqueueSlot`]) and forwards
/// [`Extender::enqueue_slot`] to it.
///
/// Hooks run on the crawl's threads: `fetch`, `visit`, `compute_delay`
/// and the robots hooks on the worker owning the URL's host, the rest on
/// the dispatcher. Per host, worker-side hooks are serialized.
#[async_trait]
pub trait Extender: Send + Sync + 'static {
    /// The slot to bind the runtime enqueue channel to, if this extender
    /// wants one.
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        None
    }

    /// Last chance to rewrite the seed list before anything is enqueued.
    fn start(&self, seeds: Vec<Url>) -> Vec<Url> {
        seeds
    }

    /// The run is over; all workers have retired.
    fn end(&self, _reason: EndReason) {}

    /// Some URL failed somewhere in the pipeline. Re-enqueue it through
    /// the enqueue slot to retry.
    fn error(&self, _err: &CrawlError) {}

    /// How long to wait before the next fetch on `host`.
    fn compute_delay(
        &self,
        _host: &str,
        info: &DelayInfo,
        _last_fetch: Option<&FetchInfo>,
    ) -> Duration {
        info.opts_delay.max(info.robots_delay.unwrap_or(Duration::ZERO))
    }

    /// Performs one HTTP exchange. The default delegates to a shared
    /// HTTPS client; tests routinely replace this with an in-memory map.
    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        fetcher::shared().fetch(ctx.url(), agent, is_head).await
    }

    /// After a successful HEAD: is the GET still worth it?
    fn request_get(&self, _ctx: &UrlContext, head: &FetchResponse) -> bool {
        !head.status.is_client_error() && !head.status.is_server_error()
    }

    /// Before the robots.txt fetch for a host. Return cached bytes to
    /// skip the fetch, or `(None, false)` to skip robots entirely.
    fn request_robots(&self, _ctx: &UrlContext, _agent: &str) -> (Option<Vec<u8>>, bool) {
        (None, true)
    }

    /// A robots.txt response just came back, whatever its status.
    fn fetched_robots(&self, _ctx: &UrlContext, _res: &FetchResponse) {}

    /// Pre-enqueue gate. `is_visited` means the URL is already in this
    /// run's visited set, processed or merely queued. The default turns
    /// away visited URLs and, when the crawl is same-host-only, URLs
    /// that left their source's host. Overriding replaces both
    /// judgments; the dispatcher takes the hook's verdict as final.
    fn filter(&self, ctx: &UrlContext, is_visited: bool) -> bool {
        if is_visited {
            return false;
        }
        !ctx.same_host_only() || ctx.same_host_as_source()
    }

    /// The URL was accepted into a worker queue.
    fn enqueued(&self, _ctx: &UrlContext) {}

    /// A page came back 2xx. Return harvested URLs, or `None` to let the
    /// core harvest `a[href]` itself; the flag says whether to follow.
    fn visit(
        &self,
        _ctx: &UrlContext,
        _res: &FetchResponse,
        _body: &[u8],
    ) -> (Option<Vec<Url>>, bool) {
        (None, true)
    }

    /// Harvesting for the page is settled.
    fn visited(&self, _ctx: &UrlContext, _harvested: &[Url]) {}

    /// robots.txt forbids this URL for our agent.
    fn disallowed(&self, _ctx: &UrlContext) {}
}

/// An extender that does the stock thing at every stage and carries an
/// enqueue slot ready for binding.
#[derive(Default)]
pub struct DefaultExtender {
    pub enqueue: EnqueueSlot,
}

#[async_trait]
impl Extender for DefaultExtender {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        Some(&self.enqueue)
    }
}
