//! The per-host worker: one dedicated thread that owns all fetching for
//! its host, under robots and crawl-delay discipline.

use futures::channel::mpsc;
use futures::prelude::*;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::time;
use url::Url;

use crate::cancel::{sleep_cancellable, spawn_onto_thread, CancelToken};
use crate::context::{HeadPolicy, UrlContext};
use crate::error::{CrawlError, ErrorKind};
use crate::extender::{DelayInfo, Enqueue, EnqueueRequest, EnqueueTx, FetchInfo, FetchResponse};
use crate::options::{LogFlags, Options};

use super::fetcher;
use super::hooks::Hooks;
use super::parser;
use super::robots::RobotsPolicy;

/// One context fully processed, whatever the outcome. `did_visit` is
/// `true` only when the visit hook actually ran.
pub(crate) struct Completion {
    pub ctx: UrlContext,
    pub host: String,
    pub did_visit: bool,
}

/// Worker lifecycle notifications back to the dispatcher.
pub(crate) enum WorkerLife {
    /// Retired after sitting on an empty queue for the idle TTL.
    /// `drained` holds contexts that raced in while retiring.
    Idle {
        host: String,
        drained: Vec<UrlContext>,
    },
    /// Queue closed; worker is gone.
    Exited { host: String },
    /// A hook blew up; the payload is re-raised from `run`.
    Panicked {
        host: String,
        payload: Box<dyn Any + Send>,
    },
}

/// The dispatcher's grip on one worker.
pub(crate) struct WorkerHandle {
    /// `None` once the crawl starts draining; dropping it is what lets
    /// the worker see the end of its queue.
    pub tx: Option<mpsc::Sender<UrlContext>>,
    pub cancel: CancelToken,
    pub thread: JoinHandle<()>,
    /// Overflow the bounded inbound channel would not take yet.
    pub pending: VecDeque<UrlContext>,
    pub last_activity: Instant,
}

pub(crate) fn spawn(
    host: String,
    opts: Arc<Options>,
    hooks: Hooks,
    enqueue: EnqueueTx,
    completions: mpsc::Sender<Completion>,
    life: mpsc::Sender<WorkerLife>,
) -> WorkerHandle {
    let (tx, inbound) = mpsc::channel(opts.host_buffer());
    let cancel = CancelToken::new();

    let worker = Worker {
        host: host.clone(),
        opts,
        hooks,
        cancel: cancel.clone(),
        inbound,
        enqueue,
        completions,
        life,
        robots: None,
        last_fetch_start: None,
        last_delay: None,
        last_fetch: None,
    };

    let thread = spawn_onto_thread(format!("aranha-wrk-{}", host), move || worker.run());

    WorkerHandle {
        tx: Some(tx),
        cancel,
        thread,
        pending: VecDeque::new(),
        last_activity: Instant::now(),
    }
}

enum FetchOutcome {
    Response(FetchResponse),
    Failed(anyhow::Error),
    Cancelled,
}

struct Worker {
    host: String,
    opts: Arc<Options>,
    hooks: Hooks,
    cancel: CancelToken,
    inbound: mpsc::Receiver<UrlContext>,
    enqueue: EnqueueTx,
    completions: mpsc::Sender<Completion>,
    life: mpsc::Sender<WorkerLife>,
    /// `None` until the robots context is processed, or when robots.txt
    /// was unreachable; both mean permit-all.
    robots: Option<RobotsPolicy>,
    last_fetch_start: Option<Instant>,
    last_delay: Option<Duration>,
    last_fetch: Option<FetchInfo>,
}

impl Worker {
    async fn run(mut self) {
        if self.opts.log_flags.contains(LogFlags::INFO) {
            log::info!("worker for `{}` started", self.host);
        }

        loop {
            let ctx = match time::timeout(self.opts.worker_idle_ttl, self.inbound.next()).await {
                Err(_) => {
                    // Idle too long: retire, handing back whatever raced
                    // in while we decided.
                    self.inbound.close();
                    let mut drained = vec![];
                    while let Ok(Some(ctx)) = self.inbound.try_next() {
                        drained.push(ctx);
                    }
                    if self.opts.log_flags.contains(LogFlags::INFO) {
                        log::info!("worker for `{}` idle; retiring", self.host);
                    }
                    let host = self.host.clone();
                    self.life.send(WorkerLife::Idle { host, drained }).await.ok();
                    return;
                }
                Ok(None) => {
                    let host = self.host.clone();
                    self.life.send(WorkerLife::Exited { host }).await.ok();
                    return;
                }
                Ok(Some(ctx)) => ctx,
            };

            if self.cancel.is_cancelled() {
                // Draining: hand the context back as processed-but-skipped.
                self.complete(&ctx, false).await;
                continue;
            }

            let outcome = AssertUnwindSafe(self.process(&ctx)).catch_unwind().await;

            match outcome {
                Ok(did_visit) => self.complete(&ctx, did_visit).await,
                Err(payload) => {
                    log::error!("worker for `{}` panicked; aborting the crawl", self.host);
                    let host = self.host.clone();
                    self.life
                        .send(WorkerLife::Panicked { host, payload })
                        .await
                        .ok();
                    return;
                }
            }
        }
    }

    async fn process(&mut self, ctx: &UrlContext) -> bool {
        if ctx.is_robots() {
            self.process_robots(ctx).await;
            false
        } else {
            self.process_page(ctx).await
        }
    }

    async fn process_robots(&mut self, ctx: &UrlContext) {
        let agent = self.opts.robot_user_agent.clone();
        let (cached, do_request) = self.hooks.request_robots(ctx, &agent);

        if let Some(bytes) = cached {
            self.robots = Some(RobotsPolicy::parse(&String::from_utf8_lossy(&bytes), &agent));
            return;
        }

        if !do_request {
            return;
        }

        match self.fetch_paced(ctx, false).await {
            FetchOutcome::Response(res) => {
                self.hooks.fetched_robots(ctx, &res);

                if res.status.is_success() {
                    match fetcher::decode_body(&res.headers, &res.body) {
                        Ok(decoded) => {
                            let bytes = decoded.as_deref().unwrap_or(&res.body);
                            self.robots = Some(RobotsPolicy::parse(
                                &String::from_utf8_lossy(bytes),
                                &agent,
                            ));
                        }
                        Err(err) => self.report(CrawlError::with_cause(
                            ErrorKind::Robots,
                            Some(ctx.clone()),
                            format!("could not read robots.txt for {}", self.host),
                            err,
                        )),
                    }
                } else {
                    log::debug!("no robots.txt for `{}` (status {})", self.host, res.status);
                }
            }
            FetchOutcome::Failed(err) => self.report(CrawlError::with_cause(
                ErrorKind::Robots,
                Some(ctx.clone()),
                format!("robots.txt fetch for {} failed", self.host),
                err,
            )),
            FetchOutcome::Cancelled => {}
        }
    }

    async fn process_page(&mut self, ctx: &UrlContext) -> bool {
        if let Some(policy) = &self.robots {
            if !policy.allows(ctx.url()) {
                self.trace(ctx, "disallowed by robots.txt");
                self.hooks.disallowed(ctx);
                return false;
            }
        }

        let head_first = match ctx.head_policy() {
            HeadPolicy::Force => true,
            HeadPolicy::Skip => false,
            HeadPolicy::Default => self.opts.head_before_get,
        };

        if head_first {
            let head = match self.fetch_paced(ctx, true).await {
                FetchOutcome::Response(head) => head,
                FetchOutcome::Failed(err) => {
                    self.report(CrawlError::with_cause(
                        ErrorKind::Fetch,
                        Some(ctx.clone()),
                        format!("HEAD {} failed", ctx),
                        err,
                    ));
                    return false;
                }
                FetchOutcome::Cancelled => return false,
            };

            if !self.hooks.request_get(ctx, &head) {
                self.trace(ctx, "GET vetoed after HEAD");
                return false;
            }
        }

        let res = match self.fetch_paced(ctx, false).await {
            FetchOutcome::Response(res) => res,
            FetchOutcome::Failed(err) => {
                self.report(CrawlError::with_cause(
                    ErrorKind::Fetch,
                    Some(ctx.clone()),
                    format!("GET {} failed", ctx),
                    err,
                ));
                return false;
            }
            FetchOutcome::Cancelled => return false,
        };

        if res.status.is_redirection() {
            self.follow_redirect(ctx, &res).await;
            return false;
        }

        if !res.status.is_success() {
            self.report(CrawlError::new(
                ErrorKind::Fetch,
                Some(ctx.clone()),
                format!("{} returned status {}", ctx, res.status),
            ));
            return false;
        }

        let decoded = match fetcher::decode_body(&res.headers, &res.body) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.report(CrawlError::with_cause(
                    ErrorKind::Read,
                    Some(ctx.clone()),
                    format!("could not read body of {}", ctx),
                    err,
                ));
                return false;
            }
        };
        let body = decoded.as_deref().unwrap_or(&res.body);

        let (harvested, follow) = self.hooks.visit(ctx, &res, body);
        let harvested = match harvested {
            Some(urls) => urls,
            None if follow => self.harvest(ctx, body),
            None => vec![],
        };

        self.hooks.visited(ctx, &harvested);

        if follow && !harvested.is_empty() {
            self.submit(harvested, ctx).await;
        }

        true
    }

    /// Waits out the computed delay, measured from the previous fetch
    /// start. Returns `false` when cancelled.
    async fn pace(&mut self) -> bool {
        let info = DelayInfo {
            opts_delay: self.opts.crawl_delay,
            robots_delay: self.robots.as_ref().and_then(RobotsPolicy::crawl_delay),
            last_delay: self.last_delay,
        };
        let delay = self
            .hooks
            .compute_delay(&self.host, &info, self.last_fetch.as_ref());
        self.last_delay = Some(delay);

        let wait = match self.last_fetch_start {
            Some(last) => delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };

        if wait.is_zero() {
            !self.cancel.is_cancelled()
        } else {
            sleep_cancellable(wait, &self.cancel).await
        }
    }

    async fn fetch_paced(&mut self, ctx: &UrlContext, is_head: bool) -> FetchOutcome {
        if !self.pace().await {
            return FetchOutcome::Cancelled;
        }

        let started = Instant::now();
        self.last_fetch_start = Some(started);

        let opts = self.opts.clone();
        let agent = if ctx.is_robots() {
            &opts.robot_user_agent
        } else {
            &opts.user_agent
        };

        match time::timeout(opts.fetch_timeout, self.hooks.fetch(ctx, agent, is_head)).await {
            Ok(Ok(res)) => {
                self.last_fetch = Some(FetchInfo {
                    duration: started.elapsed(),
                    status: res.status,
                    is_head,
                });
                FetchOutcome::Response(res)
            }
            Ok(Err(err)) => FetchOutcome::Failed(err),
            Err(_) => FetchOutcome::Failed(anyhow::anyhow!(
                "timed out after {:?}",
                opts.fetch_timeout
            )),
        }
    }

    fn harvest(&self, ctx: &UrlContext, body: &[u8]) -> Vec<Url> {
        let mut found = vec![];

        for raw in parser::extract_raw_links(body) {
            // Section references and empty hrefs are ordinary page
            // furniture, not harvesting failures.
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }

            match parser::checked_join(ctx.url(), &raw) {
                Ok(url) => found.push(url),
                Err(err) => self.report(CrawlError::with_cause(
                    ErrorKind::LinkExtract,
                    Some(ctx.clone()),
                    format!("cannot harvest {:?} from {}", raw, ctx),
                    err,
                )),
            }
        }

        found
    }

    async fn follow_redirect(&mut self, ctx: &UrlContext, res: &FetchResponse) {
        let location = match res.headers.get(http::header::LOCATION) {
            Some(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
            None => {
                self.report(CrawlError::new(
                    ErrorKind::EnqueueRedirect,
                    Some(ctx.clone()),
                    format!("{} redirected without a Location header", ctx),
                ));
                return;
            }
        };

        match parser::checked_join(ctx.url(), &location) {
            Ok(target) => {
                self.trace(ctx, "requeueing redirect target");
                self.submit(vec![target], ctx).await;
            }
            Err(err) => self.report(CrawlError::with_cause(
                ErrorKind::EnqueueRedirect,
                Some(ctx.clone()),
                format!("cannot requeue redirect of {}", ctx),
                err,
            )),
        }
    }

    async fn submit(&mut self, urls: Vec<Url>, source: &UrlContext) {
        let request = EnqueueRequest {
            payload: Enqueue::List(urls.into_iter().map(Enqueue::Parsed).collect()),
            source: Some(source.clone()),
        };

        if self.enqueue.send(request).await.is_err() {
            log::debug!("dispatcher went away; dropping harvest of {}", source);
        }
    }

    async fn complete(&mut self, ctx: &UrlContext, did_visit: bool) {
        let completion = Completion {
            ctx: ctx.clone(),
            host: self.host.clone(),
            did_visit,
        };

        if self.completions.send(completion).await.is_err() {
            log::debug!("dispatcher went away; worker for `{}` has no one to report to", self.host);
        }
    }

    fn report(&self, err: CrawlError) {
        if self.opts.log_flags.contains(LogFlags::ERROR) {
            log::warn!("{}", err);
        }
        self.hooks.error(&err);
    }

    fn trace(&self, ctx: &UrlContext, what: &str) {
        if self.opts.log_flags.contains(LogFlags::TRACE) {
            log::debug!("{}: {}", ctx, what);
        }
    }
}
