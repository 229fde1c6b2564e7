//! The crawler façade.

mod dispatcher;
pub(crate) mod fetcher;
pub(crate) mod hooks;
mod parser;
mod robots;
mod worker;

pub use self::fetcher::{HttpFetcher, DEFAULT_MAX_BODY_SIZE};
pub use self::hooks::{Hook, HookStats};

use futures::channel::mpsc;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::context::UserState;
use crate::error::{CrawlError, EnqueueError, ErrorKind};
use crate::extender::{Enqueue, EnqueueRequest, EnqueueSlot, Extender};
use crate::options::{LogFlags, Options};

use self::dispatcher::Dispatcher;
use self::hooks::Hooks;

/// Why a run came to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// All queued work drained on its own.
    Done,
    /// The configured visit cap was reached.
    MaxVisits,
    /// The caller asked for a stop.
    Stopped,
}

/// Owns the options and the extender, and drives one crawl at a time.
///
/// Run state (visited set, workers, metrics) is re-initialized on every
/// [`Crawler::run`]; options and extender persist until replaced.
pub struct Crawler {
    opts: Arc<Options>,
    ext: Arc<dyn Extender>,
    stats: Arc<HookStats>,
    stop_slot: Arc<EnqueueSlot>,
    /// Keeps the most recent run's enqueue channel receivable, so slots
    /// bound during that run stay sendable after it ends.
    parked_enqueue: Option<mpsc::Receiver<EnqueueRequest>>,
}

impl Crawler {
    pub fn new(ext: impl Extender) -> Crawler {
        Crawler::with_options(Options::default(), ext)
    }

    pub fn with_options(opts: Options, ext: impl Extender) -> Crawler {
        Crawler {
            opts: Arc::new(opts),
            ext: Arc::new(ext),
            stats: Arc::new(HookStats::default()),
            stop_slot: Arc::new(EnqueueSlot::new()),
            parked_enqueue: None,
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn set_options(&mut self, opts: Options) {
        self.opts = Arc::new(opts);
    }

    pub fn set_extender(&mut self, ext: impl Extender) {
        self.ext = Arc::new(ext);
    }

    /// Hook metrics of the current (or most recent) run.
    pub fn hook_stats(&self) -> Arc<HookStats> {
        self.stats.clone()
    }

    /// A handle able to request a graceful stop from any thread. Valid
    /// across runs of this crawler.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            slot: self.stop_slot.clone(),
        }
    }

    /// Runs one crawl to completion. Seeds can be a single URL or
    /// string, a vector of either, `(Url, state)` pairs, or `()`.
    ///
    /// A panic in any hook resurfaces here.
    pub async fn run(&mut self, seeds: impl Into<Enqueue>) -> EndReason {
        crate::panic::log_panics();

        // The previous run's channel, if any, dies here.
        self.parked_enqueue.take();

        let hooks = Hooks::new(self.ext.clone());
        self.stats = hooks.stats.clone();

        let dispatcher = Dispatcher::new(self.opts.clone(), hooks.clone());

        let sender = dispatcher.enqueue_sender();
        match self.ext.enqueue_slot() {
            Some(slot) => slot.bind(sender.clone()),
            None => log::info!("extender exposes no enqueue slot; runtime enqueue disabled"),
        }
        self.stop_slot.bind(sender);

        let seed_requests = self.prepare_seeds(seeds.into(), &hooks);

        let (outcome, receiver) = dispatcher.run(seed_requests).await;
        self.parked_enqueue = Some(receiver);

        match outcome {
            Ok(reason) => reason,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Flattens the seed payload, gives the start hook one look at the
    /// parsed list, and re-attaches per-URL state afterwards.
    fn prepare_seeds(&self, seeds: Enqueue, hooks: &Hooks) -> Vec<EnqueueRequest> {
        let mut urls = vec![];
        let mut states: HashMap<String, UserState> = HashMap::new();
        self.flatten_seed(seeds, &mut urls, &mut states, hooks);

        let urls = hooks.start(urls);

        urls.into_iter()
            .map(|url| {
                let payload = match states.get(url.as_str()) {
                    Some(state) => Enqueue::Stated(url, state.clone()),
                    None => Enqueue::Parsed(url),
                };
                EnqueueRequest {
                    payload,
                    source: None,
                }
            })
            .collect()
    }

    fn flatten_seed(
        &self,
        seed: Enqueue,
        urls: &mut Vec<Url>,
        states: &mut HashMap<String, UserState>,
        hooks: &Hooks,
    ) {
        match seed {
            Enqueue::Raw(raw) => match raw.parse::<Url>() {
                Ok(url) => urls.push(url),
                Err(err) => {
                    let crawl_err = CrawlError::with_cause(
                        ErrorKind::Parse,
                        None,
                        format!("cannot parse seed {:?}", raw),
                        anyhow::Error::new(err),
                    );
                    if self.opts.log_flags.contains(LogFlags::ERROR) {
                        log::warn!("{}", crawl_err);
                    }
                    hooks.error(&crawl_err);
                }
            },
            Enqueue::Parsed(url) => urls.push(url),
            Enqueue::Stated(url, state) => {
                states.insert(url.as_str().to_owned(), state);
                urls.push(url);
            }
            Enqueue::List(items) => {
                for item in items {
                    self.flatten_seed(item, urls, states, hooks);
                }
            }
            Enqueue::StatedList(pairs) => {
                for (url, state) in pairs {
                    states.insert(url.as_str().to_owned(), state);
                    urls.push(url);
                }
            }
            // Stopping a run that has not started means nothing.
            Enqueue::Stop => {}
        }
    }
}

/// Requests a graceful stop of whatever run is active on the crawler
/// that handed this out.
#[derive(Clone)]
pub struct StopHandle {
    slot: Arc<EnqueueSlot>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), EnqueueError> {
        self.slot.stop()
    }
}
