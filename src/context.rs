use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};
use url::Url;

use crate::options::NormFlags;

/// Opaque per-URL state a caller can attach and inspect from its hooks.
pub type UserState = Arc<dyn Any + Send + Sync>;

/// Per-context override of the global `head_before_get` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPolicy {
    /// Follow whatever the options say.
    Default,
    /// HEAD before GET for this URL, no matter the options.
    Force,
    /// Go straight to GET for this URL.
    Skip,
}

struct Inner {
    url: Url,
    original: String,
    source: Option<Url>,
    depth: u16,
    is_robots: bool,
    same_host_only: bool,
    state: RwLock<Option<UserState>>,
    head_policy: RwLock<HeadPolicy>,
}

/// One normalized crawl target, plus its provenance.
///
/// Cheap to clone; all clones share the state slot and the head policy.
/// Identity, for deduplication, is the canonical URL string.
#[derive(Clone)]
pub struct UrlContext(Arc<Inner>);

impl UrlContext {
    pub(crate) fn new(
        url: Url,
        original: String,
        source: Option<Url>,
        depth: u16,
        same_host_only: bool,
    ) -> UrlContext {
        UrlContext(Arc::new(Inner {
            url,
            original,
            source,
            depth,
            is_robots: false,
            same_host_only,
            state: RwLock::new(None),
            head_policy: RwLock::new(HeadPolicy::Default),
        }))
    }

    pub(crate) fn robots(url: Url) -> UrlContext {
        let original = url.as_str().to_owned();
        UrlContext(Arc::new(Inner {
            url,
            original,
            source: None,
            depth: 0,
            is_robots: true,
            same_host_only: false,
            state: RwLock::new(None),
            head_policy: RwLock::new(HeadPolicy::Default),
        }))
    }

    /// The canonical URL after normalization.
    pub fn url(&self) -> &Url {
        &self.0.url
    }

    /// The URL exactly as it was handed in, before normalization.
    pub fn original(&self) -> &str {
        &self.0.original
    }

    /// The page this URL was harvested from; `None` for seeds.
    pub fn source(&self) -> Option<&Url> {
        self.0.source.as_ref()
    }

    /// Link distance from the seed that led here; seeds are at 0.
    pub fn depth(&self) -> u16 {
        self.0.depth
    }

    /// Whether this context targets a robots.txt resource.
    pub fn is_robots(&self) -> bool {
        self.0.is_robots
    }

    pub fn state(&self) -> Option<UserState> {
        self.0.state.read().expect("state lock poisoned").clone()
    }

    pub fn set_state(&self, state: Option<UserState>) {
        *self.0.state.write().expect("state lock poisoned") = state;
    }

    pub fn head_policy(&self) -> HeadPolicy {
        *self.0.head_policy.read().expect("head policy lock poisoned")
    }

    pub fn set_head_policy(&self, policy: HeadPolicy) {
        *self.0.head_policy.write().expect("head policy lock poisoned") = policy;
    }

    /// Whether this crawl's `same_host_only` option was on when the
    /// context was made. The default filter consults it; a custom
    /// filter is free to ignore it.
    pub fn same_host_only(&self) -> bool {
        self.0.same_host_only
    }

    /// `true` when this URL lives on the same host as the page that
    /// produced it. Seeds have no source and always pass.
    pub fn same_host_as_source(&self) -> bool {
        match &self.0.source {
            None => true,
            Some(source) => source.host_str() == self.0.url.host_str(),
        }
    }
}

impl fmt::Display for UrlContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0.url, f)
    }
}

impl fmt::Debug for UrlContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UrlContext")
            .field("url", &self.0.url.as_str())
            .field("source", &self.0.source.as_ref().map(Url::as_str))
            .field("depth", &self.0.depth)
            .field("is_robots", &self.0.is_robots)
            .finish()
    }
}

/// Parses `raw`, resolving against `base` when relative, and applies the
/// configured normalization steps.
pub fn normalize(raw: &str, base: Option<&Url>, flags: NormFlags) -> Result<Url, url::ParseError> {
    let mut url = raw.parse().or_else(|err| {
        if err == url::ParseError::RelativeUrlWithoutBase {
            match base {
                Some(base) => base.join(raw),
                None => Err(err),
            }
        } else {
            Err(err)
        }
    })?;

    apply_flags(&mut url, flags);

    Ok(url)
}

/// Applies the normalization steps to an already-parsed URL, in place.
pub(crate) fn apply_flags(url: &mut Url, flags: NormFlags) {
    // LOWERCASE_SCHEME_HOST and REMOVE_DEFAULT_PORT are enforced by the
    // parser itself; nothing to redo here.
    if flags.contains(NormFlags::REMOVE_FRAGMENT) {
        url.set_fragment(None);
    }

    if flags.contains(NormFlags::REMOVE_DUPLICATE_SLASHES) && url.path().contains("//") {
        let collapsed = collapse_slashes(url.path());
        url.set_path(&collapsed);
    }

    if flags.contains(NormFlags::DECODE_UNRESERVED) {
        if url.path().contains('%') {
            let decoded = decode_unreserved(url.path());
            url.set_path(&decoded);
        }
        if let Some(query) = url.query() {
            if query.contains('%') {
                let decoded = decode_unreserved(query);
                url.set_query(Some(&decoded));
            }
        }
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;

    for ch in path.chars() {
        if ch == '/' && last_was_slash {
            continue;
        }
        last_was_slash = ch == '/';
        out.push(ch);
    }

    out
}

/// Turns `%41`-style escapes of unreserved characters back into the
/// characters themselves. Everything else stays escaped.
fn decode_unreserved(component: &str) -> String {
    let bytes = component.as_bytes();
    let mut out = String::with_capacity(component.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi * 16 + lo;
                if is_unreserved(decoded) {
                    out.push(decoded as char);
                    i += 3;
                    continue;
                }
            }
        }

        // URL serializations are ASCII, so byte-at-a-time is safe.
        out.push(bytes[i] as char);
        i += 1;
    }

    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        normalize(raw, None, NormFlags::default())
            .expect("test url parses")
            .to_string()
    }

    #[test]
    fn strips_fragment_and_default_port() {
        assert_eq!(norm("HTTP://HostA:80/page1.html#middle"), "http://hosta/page1.html");
    }

    #[test]
    fn collapses_duplicate_slashes() {
        assert_eq!(norm("http://hosta//a///b/page.html"), "http://hosta/a/b/page.html");
    }

    #[test]
    fn decodes_unreserved_escapes_only() {
        assert_eq!(norm("http://hosta/%61%62%2Fc"), "http://hosta/ab%2Fc");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = norm("http://HostA:80//x/%7Euser/page.html#frag");
        assert_eq!(norm(&once), once);
    }

    #[test]
    fn resolves_relative_against_base() {
        let base = "http://hosta/dir/page1.html".parse().expect("test url parses");
        let url = normalize("page2.html", Some(&base), NormFlags::default()).expect("joins");
        assert_eq!(url.as_str(), "http://hosta/dir/page2.html");
    }

    #[test]
    fn relative_without_base_is_an_error() {
        assert!(normalize("page2.html", None, NormFlags::default()).is_err());
    }

    #[test]
    fn same_host_check_passes_for_seeds() {
        let ctx = UrlContext::new(
            "http://hosta/page1.html".parse().expect("test url parses"),
            "http://hosta/page1.html".to_owned(),
            None,
            0,
            true,
        );
        assert!(ctx.same_host_as_source());
    }
}
