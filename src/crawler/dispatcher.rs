//! The central coordinator: sole owner of the visited set, the host
//! table and the outstanding count. Everything reaches it over channels.

use futures::channel::mpsc;
use futures::prelude::*;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use url::Url;

use crate::context::{self, UrlContext, UserState};
use crate::error::{CrawlError, ErrorKind};
use crate::extender::{Enqueue, EnqueueRequest, EnqueueTx};
use crate::options::{LogFlags, Options};

use super::hooks::Hooks;
use super::worker::{self, Completion, WorkerHandle, WorkerLife};
use super::EndReason;

/// Capacity of the shared enqueue channel. Senders never block on it;
/// the dispatcher drains it with priority over everything else.
const ENQUEUE_BUFFER: usize = 128;
const COMPLETION_BUFFER: usize = 64;
const LIFE_BUFFER: usize = 16;

#[derive(Clone, Copy)]
enum RunState {
    Running,
    Draining(EndReason),
}

enum Incoming {
    Raw(String),
    Parsed(Url),
}

enum Event {
    Enqueue(EnqueueRequest),
    Completion(Completion),
    Life(WorkerLife),
}

pub(crate) struct Dispatcher {
    opts: Arc<Options>,
    hooks: Hooks,
    /// Canonical URL string to processed flag. Present-but-false means
    /// queued; true means done, whatever the outcome.
    visited: HashMap<String, bool>,
    hosts: HashMap<String, WorkerHandle>,
    /// Threads of retired workers, joined at the end of the run so a
    /// panicking hook still reaches the caller.
    graveyard: Vec<JoinHandle<()>>,
    outstanding: usize,
    visits: usize,
    state: RunState,
    panic: Option<Box<dyn Any + Send>>,
    enq_tx: EnqueueTx,
    enq_rx: mpsc::Receiver<EnqueueRequest>,
    comp_tx: mpsc::Sender<Completion>,
    comp_rx: mpsc::Receiver<Completion>,
    life_tx: mpsc::Sender<WorkerLife>,
    life_rx: mpsc::Receiver<WorkerLife>,
}

impl Dispatcher {
    pub fn new(opts: Arc<Options>, hooks: Hooks) -> Dispatcher {
        let (enq_tx, enq_rx) = mpsc::channel(ENQUEUE_BUFFER);
        let (comp_tx, comp_rx) = mpsc::channel(COMPLETION_BUFFER);
        let (life_tx, life_rx) = mpsc::channel(LIFE_BUFFER);

        Dispatcher {
            opts,
            hooks,
            visited: HashMap::new(),
            hosts: HashMap::new(),
            graveyard: vec![],
            outstanding: 0,
            visits: 0,
            state: RunState::Running,
            panic: None,
            enq_tx,
            enq_rx,
            comp_tx,
            comp_rx,
            life_tx,
            life_rx,
        }
    }

    /// The sender to bind into the extender's enqueue slot.
    pub fn enqueue_sender(&self) -> EnqueueTx {
        self.enq_tx.clone()
    }

    /// Drives the whole run. Returns the parked enqueue receiver along
    /// with the outcome so the facade can keep post-run sends alive.
    pub async fn run(
        mut self,
        seeds: Vec<EnqueueRequest>,
    ) -> (
        Result<EndReason, Box<dyn Any + Send>>,
        mpsc::Receiver<EnqueueRequest>,
    ) {
        for request in seeds {
            self.handle_enqueue(request);
        }

        let reason = loop {
            // The enqueue channel always goes first, both here and in
            // the select below, so caller-side growth stays bounded.
            self.drain_enqueue_now();

            match self.state {
                RunState::Running if self.outstanding == 0 => break EndReason::Done,
                RunState::Draining(reason) if self.hosts.is_empty() => break reason,
                _ => {}
            }

            let event = {
                let enq = &mut self.enq_rx;
                let completions = &mut self.comp_rx;
                let life = &mut self.life_rx;

                futures::select_biased! {
                    request = enq.next() => request.map(Event::Enqueue),
                    completion = completions.next() => completion.map(Event::Completion),
                    life = life.next() => life.map(Event::Life),
                }
            };

            match event {
                Some(Event::Enqueue(request)) => self.handle_enqueue(request),
                Some(Event::Completion(completion)) => self.handle_completion(completion),
                Some(Event::Life(life)) => self.handle_life(life),
                // We hold a sender to every channel, so they never close.
                None => {}
            }
        };

        self.shutdown(reason).await
    }

    fn drain_enqueue_now(&mut self) {
        while let Ok(Some(request)) = self.enq_rx.try_next() {
            self.handle_enqueue(request);
        }
    }

    fn handle_enqueue(&mut self, request: EnqueueRequest) {
        let EnqueueRequest { payload, source } = request;
        self.flatten(payload, source.as_ref());
    }

    fn flatten(&mut self, payload: Enqueue, source: Option<&UrlContext>) {
        match payload {
            Enqueue::Stop => {
                if self.opts.log_flags.contains(LogFlags::INFO) {
                    log::info!("stop requested; draining");
                }
                self.begin_drain(EndReason::Stopped);
            }
            Enqueue::Raw(raw) => self.ingest(Incoming::Raw(raw), None, source),
            Enqueue::Parsed(url) => self.ingest(Incoming::Parsed(url), None, source),
            Enqueue::Stated(url, state) => self.ingest(Incoming::Parsed(url), Some(state), source),
            Enqueue::List(items) => {
                for item in items {
                    self.flatten(item, source);
                }
            }
            Enqueue::StatedList(pairs) => {
                for (url, state) in pairs {
                    self.ingest(Incoming::Parsed(url), Some(state), source);
                }
            }
        }
    }

    fn ingest(&mut self, incoming: Incoming, state: Option<UserState>, source: Option<&UrlContext>) {
        if let RunState::Draining(_) = self.state {
            if self.opts.log_flags.contains(LogFlags::IGNORED) {
                log::info!("ignored while draining");
            }
            return;
        }

        let base = source.map(|ctx| ctx.url());
        let (url, original) = match incoming {
            Incoming::Raw(raw) => {
                match context::normalize(&raw, base, self.opts.normalization) {
                    Ok(url) => (url, raw),
                    Err(err) => {
                        self.report(CrawlError::with_cause(
                            ErrorKind::Parse,
                            None,
                            format!("cannot parse {:?}", raw),
                            anyhow::Error::new(err),
                        ));
                        return;
                    }
                }
            }
            Incoming::Parsed(mut url) => {
                let original = url.to_string();
                context::apply_flags(&mut url, self.opts.normalization);
                (url, original)
            }
        };

        if url.host_str().is_none() {
            self.report(CrawlError::new(
                ErrorKind::Parse,
                None,
                format!("no host in {}", url),
            ));
            return;
        }

        let key = url.as_str().to_owned();
        let is_visited = self.visited.contains_key(&key);
        let depth = source.map(|ctx| ctx.depth().saturating_add(1)).unwrap_or(0);

        // The same-host policy rides on the context; the default filter
        // enforces it, and an override's word is final either way.
        let ctx = UrlContext::new(
            url,
            original,
            source.map(|ctx| ctx.url().clone()),
            depth,
            self.opts.same_host_only,
        );
        if let Some(state) = state {
            ctx.set_state(Some(state));
        }

        if !self.hooks.filter(&ctx, is_visited) {
            self.log_ignored(&ctx, "filter policy");
            return;
        }

        self.visited.insert(key, false);
        self.outstanding += 1;

        if self.opts.log_flags.contains(LogFlags::ENQUEUED) {
            log::info!("enqueued: {}", ctx);
        }

        self.deliver(ctx, true);
    }

    /// Routes a context to its host's worker, spawning one when the host
    /// is new. `announce` is off when re-routing after an idle exit, so
    /// the enqueued hook fires once per acceptance.
    fn deliver(&mut self, ctx: UrlContext, announce: bool) {
        let host = host_key(ctx.url());

        if !self.hosts.contains_key(&host) {
            self.spawn_worker(&host, ctx.url());
        }

        let delivered = ctx.clone();
        let entry = self.hosts.get_mut(&host).expect("host entry just ensured");

        match entry.tx.as_mut() {
            Some(tx) if entry.pending.is_empty() => {
                if let Err(err) = tx.try_send(ctx) {
                    // Full or momentarily disconnected; park it. Idle
                    // notifications re-route parked work either way.
                    entry.pending.push_back(err.into_inner());
                }
            }
            Some(_) | None => entry.pending.push_back(ctx),
        }

        if announce {
            self.hooks.enqueued(&delivered);
        }
    }

    fn spawn_worker(&mut self, host: &str, sample_url: &Url) {
        if self.opts.log_flags.contains(LogFlags::INFO) {
            log::info!("spawning worker for `{}`", host);
        }

        let handle = worker::spawn(
            host.to_owned(),
            self.opts.clone(),
            self.hooks.clone(),
            self.enq_tx.clone(),
            self.comp_tx.clone(),
            self.life_tx.clone(),
        );
        self.hosts.insert(host.to_owned(), handle);

        // robots.txt rides the queue first, so the gate is in place
        // before any page fetch on this host.
        if let Ok(robots_url) = sample_url.join("/robots.txt") {
            let robots_ctx = UrlContext::robots(robots_url);
            self.outstanding += 1;

            let entry = self.hosts.get_mut(host).expect("host entry just inserted");
            if let Some(tx) = entry.tx.as_mut() {
                // A fresh channel always has room for this one.
                tx.try_send(robots_ctx.clone()).ok();
            }

            self.hooks.enqueued(&robots_ctx);
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            ctx,
            host,
            did_visit,
        } = completion;

        if !ctx.is_robots() {
            self.visited.insert(ctx.url().as_str().to_owned(), true);

            if did_visit {
                self.visits += 1;
                if self.opts.max_visits > 0 && self.visits >= self.opts.max_visits {
                    if self.opts.log_flags.contains(LogFlags::INFO) {
                        log::info!("visit cap of {} reached; draining", self.opts.max_visits);
                    }
                    self.begin_drain(EndReason::MaxVisits);
                }
            }
        }

        self.outstanding -= 1;

        if let Some(entry) = self.hosts.get_mut(&host) {
            entry.last_activity = Instant::now();

            if let Some(tx) = entry.tx.as_mut() {
                while let Some(next) = entry.pending.pop_front() {
                    if let Err(err) = tx.try_send(next) {
                        entry.pending.push_front(err.into_inner());
                        break;
                    }
                }
            }
        }
    }

    fn handle_life(&mut self, life: WorkerLife) {
        match life {
            WorkerLife::Idle { host, drained } => {
                let mut leftovers = drained;

                if let Some(entry) = self.hosts.remove(&host) {
                    log::debug!(
                        "worker for `{}` retired, {:?} after its last activity",
                        host,
                        entry.last_activity.elapsed(),
                    );
                    self.graveyard.push(entry.thread);
                    leftovers.extend(entry.pending);
                }

                // Anything the retiring worker never got to goes right
                // back through routing, which respawns as needed.
                if let RunState::Running = self.state {
                    for ctx in leftovers {
                        self.deliver(ctx, false);
                    }
                }
            }
            WorkerLife::Exited { host } => {
                if let Some(entry) = self.hosts.remove(&host) {
                    self.graveyard.push(entry.thread);
                }
            }
            WorkerLife::Panicked { host, payload } => {
                if let Some(entry) = self.hosts.remove(&host) {
                    self.graveyard.push(entry.thread);
                }
                if self.panic.is_none() {
                    self.panic = Some(payload);
                }
                self.begin_drain(EndReason::Stopped);
            }
        }
    }

    fn begin_drain(&mut self, reason: EndReason) {
        if let RunState::Draining(_) = self.state {
            return;
        }

        self.state = RunState::Draining(reason);

        for entry in self.hosts.values_mut() {
            entry.cancel.cancel();
            // Dropping the sender is what lets the worker see the end
            // of its queue and leave promptly.
            entry.tx = None;
        }
    }

    async fn shutdown(
        mut self,
        reason: EndReason,
    ) -> (
        Result<EndReason, Box<dyn Any + Send>>,
        mpsc::Receiver<EnqueueRequest>,
    ) {
        // Retire whatever is still alive. On the normal path these
        // workers are all sitting on empty queues.
        self.state = RunState::Draining(reason);
        for entry in self.hosts.values_mut() {
            entry.cancel.cancel();
            entry.tx = None;
        }

        while !self.hosts.is_empty() {
            let event = {
                let enq = &mut self.enq_rx;
                let completions = &mut self.comp_rx;
                let life = &mut self.life_rx;

                futures::select_biased! {
                    life = life.next() => life.map(Event::Life),
                    completion = completions.next() => completion.map(Event::Completion),
                    request = enq.next() => request.map(Event::Enqueue),
                }
            };

            // Late completions and enqueues have nothing left to affect.
            if let Some(Event::Life(life)) = event {
                self.handle_life(life);
            }
        }

        for thread in self.graveyard.drain(..) {
            if let Err(payload) = thread.join() {
                if self.panic.is_none() {
                    self.panic = Some(payload);
                }
            }
        }

        if let Some(payload) = self.panic.take() {
            return (Err(payload), self.enq_rx);
        }

        if self.opts.log_flags.contains(LogFlags::INFO) {
            log::info!(
                "crawl done: {} visited, {} known, reason {:?}",
                self.visits,
                self.visited.len(),
                reason,
            );
        }

        self.hooks.end(reason);

        (Ok(reason), self.enq_rx)
    }

    fn report(&self, err: CrawlError) {
        if self.opts.log_flags.contains(LogFlags::ERROR) {
            log::warn!("{}", err);
        }
        self.hooks.error(&err);
    }

    fn log_ignored(&self, ctx: &UrlContext, why: &str) {
        if self.opts.log_flags.contains(LogFlags::IGNORED) {
            log::info!("ignored on {}: {}", why, ctx);
        }
    }
}

/// Workers are keyed by host, port included when one is spelled out.
fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    }
}
