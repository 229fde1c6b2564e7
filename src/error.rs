use std::fmt;

use thiserror::Error;

use crate::context::UrlContext;

/// What stage of the pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A seed or a harvested link failed to parse.
    Parse,
    /// robots.txt could not be fetched or understood.
    Robots,
    /// A HEAD or GET failed at the transport level, or came back non-2xx.
    Fetch,
    /// The response body could not be read or decoded.
    Read,
    /// Harvesting links out of a fetched document failed.
    LinkExtract,
    /// A redirect target could not be put back on the queue.
    EnqueueRedirect,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Robots => "robots",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Read => "read",
            ErrorKind::LinkExtract => "link-extract",
            ErrorKind::EnqueueRedirect => "enqueue-redirect",
        })
    }
}

/// An error on a single URL, as delivered to the `error` hook.
///
/// The crawl itself never aborts on one of these; the hook may re-enqueue
/// the offending context to retry.
#[derive(Debug, Error)]
#[error("{kind}: {msg}")]
pub struct CrawlError {
    pub kind: ErrorKind,
    /// The context being processed when the error happened. `None` only
    /// for raw input that never made it into a context.
    pub ctx: Option<UrlContext>,
    pub msg: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CrawlError {
    pub(crate) fn new(kind: ErrorKind, ctx: Option<UrlContext>, msg: impl Into<String>) -> CrawlError {
        CrawlError {
            kind,
            ctx,
            msg: msg.into(),
            cause: None,
        }
    }

    pub(crate) fn with_cause(
        kind: ErrorKind,
        ctx: Option<UrlContext>,
        msg: impl Into<String>,
        cause: anyhow::Error,
    ) -> CrawlError {
        CrawlError {
            kind,
            ctx,
            msg: msg.into(),
            cause: Some(cause.into()),
        }
    }
}

/// Failure to push a payload onto the runtime enqueue channel.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("enqueue channel is not bound to a running crawl")]
    Unbound,
    #[error("enqueue channel is full or disconnected")]
    Full,
}
