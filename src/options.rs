use bitflags::bitflags;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

bitflags! {
    /// Which internal crawl events get logged, on top of the plain
    /// lifecycle logging that is always on.
    #[derive(Serialize, Deserialize)]
    pub struct LogFlags: u32 {
        const ERROR = 1 << 0;
        const INFO = 1 << 1;
        const ENQUEUED = 1 << 2;
        const IGNORED = 1 << 3;
        const TRACE = 1 << 4;
        const ALL = Self::ERROR.bits
            | Self::INFO.bits
            | Self::ENQUEUED.bits
            | Self::IGNORED.bits
            | Self::TRACE.bits;
    }
}

impl Default for LogFlags {
    fn default() -> LogFlags {
        LogFlags::ERROR
    }
}

bitflags! {
    /// URL normalization steps applied before a URL enters the queue.
    ///
    /// The `url` crate already lowercases the scheme and host and elides
    /// default ports while parsing; those two flags exist so a caller can
    /// state the full policy in one place.
    #[derive(Serialize, Deserialize)]
    pub struct NormFlags: u32 {
        const LOWERCASE_SCHEME_HOST = 1 << 0;
        const REMOVE_DEFAULT_PORT = 1 << 1;
        const REMOVE_DUPLICATE_SLASHES = 1 << 2;
        const REMOVE_FRAGMENT = 1 << 3;
        const DECODE_UNRESERVED = 1 << 4;
    }
}

impl Default for NormFlags {
    fn default() -> NormFlags {
        NormFlags::all()
    }
}

/// Per-host inbound channels hold `host_buffer_factor` times this many
/// contexts before the dispatcher starts parking overflow locally.
const HOST_BUFFER_BASE: usize = 10;

/// See the `Default` implementation for default values on fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// User-agent sent on every non-robots fetch.
    pub user_agent: String,
    /// User-agent for robots.txt fetches and robots-rule matching.
    pub robot_user_agent: String,
    /// Upper bound on completed visits; 0 means unbounded.
    pub max_visits: usize,
    /// Default delay between two fetches on the same host. robots.txt may
    /// lengthen it, never shorten it.
    pub crawl_delay: Duration,
    /// How long a host worker waits on an empty queue before retiring.
    pub worker_idle_ttl: Duration,
    /// Have the default filter keep URLs on their source's host. The
    /// policy travels on each context; filter overrides may ignore it.
    pub same_host_only: bool,
    /// Issue a HEAD and consult the `request_get` hook before each GET.
    pub head_before_get: bool,
    /// Normalization steps applied to every incoming URL.
    pub normalization: NormFlags,
    /// Crawl-event logging selector.
    pub log_flags: LogFlags,
    /// Multiplier for per-host inbound channel capacity.
    pub host_buffer_factor: usize,
    /// Hard deadline on a single fetch, HEAD or GET, robots included.
    pub fetch_timeout: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            user_agent: crate::default_user_agent().to_owned(),
            robot_user_agent: env!("CARGO_PKG_NAME").to_owned(),
            max_visits: 0,
            crawl_delay: Duration::from_secs(5),
            worker_idle_ttl: Duration::from_secs(10),
            same_host_only: true,
            head_before_get: false,
            normalization: NormFlags::default(),
            log_flags: LogFlags::default(),
            host_buffer_factor: 10,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl Options {
    pub(crate) fn host_buffer(&self) -> usize {
        self.host_buffer_factor.max(1) * HOST_BUFFER_BASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_normalization_is_the_full_set() {
        assert!(NormFlags::default().contains(NormFlags::REMOVE_FRAGMENT));
        assert!(NormFlags::default().contains(NormFlags::DECODE_UNRESERVED));
    }

    #[test]
    fn host_buffer_never_zero() {
        let mut opts = Options::default();
        opts.host_buffer_factor = 0;
        assert!(opts.host_buffer() >= HOST_BUFFER_BASE);
    }
}
