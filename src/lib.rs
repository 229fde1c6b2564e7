//! A polite, extensible web crawler: seed it with URLs, let it fetch
//! pages and discover links under per-host robots.txt and crawl-delay
//! discipline, and participate in every pipeline stage by overriding
//! hooks on an [`Extender`].
//!
//! ```no_run
//! use aranha::{Crawler, DefaultExtender, Options};
//!
//! # async fn example() {
//! let mut opts = Options::default();
//! opts.crawl_delay = std::time::Duration::from_secs(1);
//!
//! let mut crawler = Crawler::with_options(opts, DefaultExtender::default());
//! let reason = crawler.run("https://example.com/").await;
//! println!("crawl over: {:?}", reason);
//! # }
//! ```

mod cancel;
mod context;
mod error;
mod extender;
mod logger;
mod options;
mod panic;

mod crawler;

pub use context::{normalize, HeadPolicy, UrlContext, UserState};
pub use crawler::{
    Crawler, EndReason, Hook, HookStats, HttpFetcher, StopHandle, DEFAULT_MAX_BODY_SIZE,
};
pub use error::{CrawlError, EnqueueError, ErrorKind};
pub use extender::{
    DefaultExtender, DelayInfo, Enqueue, EnqueueSlot, Extender, FetchInfo, FetchResponse,
};
pub use logger::init_logger;
pub use options::{LogFlags, NormFlags, Options};

// What implementing a custom `fetch` hook needs in scope.
pub use anyhow;
pub use async_trait::async_trait;
pub use http;
pub use url;

pub const fn default_user_agent() -> &'static str {
    concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION"),
        " (+",
        env!("CARGO_PKG_HOMEPAGE"),
        ")",
    )
}
