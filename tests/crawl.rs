//! End-to-end crawls against the in-memory fixture site.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aranha::{
    anyhow, async_trait, CrawlError, Crawler, EndReason, EnqueueSlot, ErrorKind, Extender,
    FetchResponse, Hook, LogFlags, Options, UrlContext, UserState,
};
use common::{Site, SiteExtender};

fn test_options() -> Options {
    let mut opts = Options::default();
    opts.crawl_delay = Duration::ZERO;
    opts.log_flags = LogFlags::empty();
    opts
}

#[tokio::test]
async fn small_site_zero_delay() {
    let site = Arc::new(Site::new());
    let mut crawler = Crawler::with_options(test_options(), SiteExtender::new(site));

    let started = Instant::now();
    let reason = crawler
        .run(vec!["http://hosta/page1.html", "http://hosta/page4.html"])
        .await;
    let elapsed = started.elapsed();

    assert_eq!(reason, EndReason::Done);

    let stats = crawler.hook_stats();
    assert_eq!(stats.count(Hook::Visit), 5);
    assert_eq!(stats.count(Hook::Filter), 13);
    assert_eq!(stats.count(Hook::Start), 1);
    assert_eq!(stats.count(Hook::End), 1);
    assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);
}

struct GrowingDelay {
    base: SiteExtender,
    opts_delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Extender for GrowingDelay {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        self.base.enqueue_slot()
    }

    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.base.fetch(ctx, agent, is_head).await
    }

    fn compute_delay(
        &self,
        _host: &str,
        _info: &aranha::DelayInfo,
        _last_fetch: Option<&aranha::FetchInfo>,
    ) -> Duration {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.opts_delay * call as u32
    }
}

#[tokio::test]
async fn delay_grows_between_fetches() {
    let site = Arc::new(Site::new());
    let opts_delay = Duration::from_millis(15);

    let mut opts = test_options();
    opts.head_before_get = true;
    opts.crawl_delay = opts_delay;

    let ext = GrowingDelay {
        base: SiteExtender::new(site.clone()),
        opts_delay,
        calls: AtomicUsize::new(0),
    };
    let mut crawler = Crawler::with_options(opts, ext);
    let reason = crawler.run("http://hosta/page1.html").await;

    assert_eq!(reason, EndReason::Done);

    // robots.txt, then HEAD + GET for each of pages 1 through 3.
    let stats = crawler.hook_stats();
    assert_eq!(stats.count(Hook::Fetch), 7);
    assert_eq!(stats.count(Hook::ComputeDelay), 7);
    assert_eq!(stats.count(Hook::Visit), 3);

    let instants = site.fetch_instants();
    assert_eq!(instants.len(), 7);
    for (i, pair) in instants.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= opts_delay * i as u32,
            "gap {} was only {:?}",
            i,
            gap,
        );
    }
}

#[tokio::test]
async fn robots_fetches_use_the_robot_agent() {
    let site = Arc::new(Site::new());

    let mut opts = test_options();
    opts.user_agent = "aranha-test/1.0".to_owned();
    opts.robot_user_agent = "aranha-robot".to_owned();

    let mut crawler = Crawler::with_options(opts, SiteExtender::new(site.clone()));
    let reason = crawler.run("http://hostb/page1.html").await;
    assert_eq!(reason, EndReason::Done);

    let requests = site.snapshot();
    assert!(!requests.is_empty());
    for record in requests {
        if record.url.ends_with("/robots.txt") {
            assert_eq!(record.agent, "aranha-robot", "at {}", record.url);
        } else {
            assert_eq!(record.agent, "aranha-test/1.0", "at {}", record.url);
        }
    }
}

struct OnlyPage1 {
    base: SiteExtender,
}

#[async_trait]
impl Extender for OnlyPage1 {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        self.base.enqueue_slot()
    }

    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.base.fetch(ctx, agent, is_head).await
    }

    fn filter(&self, ctx: &UrlContext, is_visited: bool) -> bool {
        !is_visited && ctx.url().path() == "/page1.html"
    }
}

#[tokio::test]
async fn running_twice_reuses_the_instance() {
    let site = Arc::new(Site::new());
    let mut crawler = Crawler::with_options(test_options(), SiteExtender::new(site.clone()));

    let reason = crawler
        .run(vec!["http://hosta/page1.html", "http://hosta/page4.html"])
        .await;
    assert_eq!(reason, EndReason::Done);

    let stats = crawler.hook_stats();
    assert_eq!(stats.count(Hook::Visit), 5);
    assert_eq!(stats.count(Hook::Filter), 13);

    // Second run: only page1s anywhere, hosts no longer restricted.
    let mut opts = test_options();
    opts.same_host_only = false;
    crawler.set_options(opts);
    crawler.set_extender(OnlyPage1 {
        base: SiteExtender::new(site.clone()),
    });

    let reason = crawler
        .run(vec![
            "http://hosta/page1.html",
            "http://hosta/page4.html",
            "http://hostb/pageunlinked.html",
        ])
        .await;
    assert_eq!(reason, EndReason::Done);

    let stats = crawler.hook_stats();
    assert_eq!(stats.count(Hook::Visit), 3);
    assert_eq!(stats.count(Hook::Filter), 11);
}

struct CrossHostAnyway {
    base: SiteExtender,
}

#[async_trait]
impl Extender for CrossHostAnyway {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        self.base.enqueue_slot()
    }

    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.base.fetch(ctx, agent, is_head).await
    }

    // Deliberately ignores the same-host policy the context carries.
    fn filter(&self, _ctx: &UrlContext, is_visited: bool) -> bool {
        !is_visited
    }
}

#[tokio::test]
async fn custom_filter_outranks_the_same_host_policy() {
    // Stock filter under same_host_only: the crawl stays on hostb.
    let site = Arc::new(Site::new());
    let mut crawler = Crawler::with_options(test_options(), SiteExtender::new(site.clone()));
    let reason = crawler.run("http://hostb/page1.html").await;
    assert_eq!(reason, EndReason::Done);
    assert_eq!(crawler.hook_stats().count(Hook::Visit), 1);

    // Same options, custom filter: its accept of hostc stands.
    let site = Arc::new(Site::new());
    let ext = CrossHostAnyway {
        base: SiteExtender::new(site),
    };
    let mut crawler = Crawler::with_options(test_options(), ext);
    let reason = crawler.run("http://hostb/page1.html").await;
    assert_eq!(reason, EndReason::Done);
    assert_eq!(crawler.hook_stats().count(Hook::Visit), 2);
}

struct EnqueueOnce {
    base: SiteExtender,
    pushed: AtomicBool,
}

#[async_trait]
impl Extender for EnqueueOnce {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        self.base.enqueue_slot()
    }

    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.base.fetch(ctx, agent, is_head).await
    }

    fn enqueued(&self, _ctx: &UrlContext) {
        if !self.pushed.swap(true, Ordering::SeqCst) {
            self.base
                .enqueue
                .send("http://hostc/page1.html")
                .expect("enqueue channel takes the push");
        }
    }
}

#[tokio::test]
async fn runtime_enqueue_reaches_a_new_host() {
    let site = Arc::new(Site::new());

    let mut opts = test_options();
    opts.same_host_only = false;

    let ext = EnqueueOnce {
        base: SiteExtender::new(site),
        pushed: AtomicBool::new(false),
    };
    let mut crawler = Crawler::with_options(opts, ext);
    let reason = crawler.run("http://hostb/page1.html").await;

    assert_eq!(reason, EndReason::Done);

    let stats = crawler.hook_stats();
    assert_eq!(stats.count(Hook::Visit), 2);
    assert_eq!(stats.count(Hook::Filter), 7);
    // Two robots contexts and two accepted pages.
    assert_eq!(stats.count(Hook::Enqueued), 4);
}

struct RetryOnError {
    base: SiteExtender,
}

#[async_trait]
impl Extender for RetryOnError {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        self.base.enqueue_slot()
    }

    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.base.fetch(ctx, agent, is_head).await
    }

    fn error(&self, err: &CrawlError) {
        if err.kind != ErrorKind::Fetch {
            return;
        }
        let ctx = match &err.ctx {
            Some(ctx) => ctx,
            None => return,
        };

        // First failure: tag the context and put it back on the queue.
        if ctx.state().is_none() {
            let state: UserState = Arc::new("Error".to_owned());
            ctx.set_state(Some(state.clone()));
            self.base
                .enqueue
                .send((ctx.url().clone(), state))
                .expect("retry enqueue goes through");
        }
    }

    fn filter(&self, ctx: &UrlContext, is_visited: bool) -> bool {
        if !is_visited {
            return true;
        }
        ctx.state()
            .map(|state| state.downcast_ref::<String>().map(String::as_str) == Some("Error"))
            .unwrap_or(false)
    }
}

#[tokio::test]
async fn error_hook_can_retry_through_the_enqueue_channel() {
    let site = Arc::new(Site::new());
    let ext = RetryOnError {
        base: SiteExtender::new(site),
    };
    let mut crawler = Crawler::with_options(test_options(), ext);
    let reason = crawler.run("http://hosta/missing.html").await;

    assert_eq!(reason, EndReason::Done);

    let stats = crawler.hook_stats();
    assert_eq!(stats.count(Hook::Visit), 0);
    assert_eq!(stats.count(Hook::Filter), 2);
    // robots.txt, the original attempt, and the one retry.
    assert_eq!(stats.count(Hook::Enqueued), 3);
    // Both attempts 404ed.
    assert_eq!(stats.count(Hook::Error), 2);
}
