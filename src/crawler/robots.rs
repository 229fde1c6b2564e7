//! Robot exclusion protocol (robots.txt) compliance.

use robots_txt::Robots;
use std::time::Duration;
use url::{Position, Url};

/// The rules robots.txt lays down for one agent on one host: an allow
/// predicate plus the advertised crawl delay, if any.
#[derive(Debug)]
pub(crate) struct RobotsPolicy {
    rules: Vec<PathRule>,
    crawl_delay: Option<Duration>,
}

impl RobotsPolicy {
    pub fn parse(robots_str: &str, agent: &str) -> RobotsPolicy {
        let robots = Robots::from_str_lossy(robots_str);
        let section = robots.choose_section(agent);

        // A bare `Disallow:` (or `Allow:`) line constrains nothing.
        let rules = section
            .rules
            .iter()
            .filter(|rule| !rule.path.is_empty())
            .map(|rule| PathRule::new(rule.allow, &rule.path))
            .collect();

        // Request-rate only stands in when no crawl-delay is given.
        let delay_secs = match (section.crawl_delay, section.req_rate) {
            (Some(delay), _) => Some(delay),
            (None, Some(rate)) if rate.requests > 0 => {
                Some(rate.seconds as f64 / rate.requests as f64)
            }
            _ => None,
        };

        RobotsPolicy {
            rules,
            crawl_delay: delay_secs
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
        }
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }

    /// The longest matching rule decides; on a length tie an Allow
    /// beats a Disallow. A path no rule matches is open.
    pub fn allows(&self, url: &Url) -> bool {
        let route = &url[Position::BeforePath..];

        self.rules
            .iter()
            .filter(|rule| rule.matches(route))
            .max_by_key(|rule| (rule.pattern.len(), rule.allow))
            .map(|rule| rule.allow)
            .unwrap_or(true)
    }
}

/// One Allow or Disallow line: a pattern matched against the start of
/// the path-and-query, with `*` spanning any run of characters and a
/// trailing `$` pinning the pattern to the end of the route.
#[derive(Debug)]
struct PathRule {
    allow: bool,
    pattern: String,
    anchored: bool,
}

impl PathRule {
    fn new(allow: bool, path: &str) -> PathRule {
        let (pattern, anchored) = match path.strip_suffix('$') {
            Some(stripped) => (stripped.to_owned(), true),
            None => (path.to_owned(), false),
        };

        PathRule {
            allow,
            pattern,
            anchored,
        }
    }

    fn matches(&self, route: &str) -> bool {
        wildcard_match(&self.pattern, route, self.anchored)
    }
}

/// Matches `pattern` against the beginning of `route`. Rules are
/// prefixes, so the first literal piece must sit at the very start;
/// later pieces ride the `*` gaps. `anchored` additionally requires
/// the match to use up the whole route.
fn wildcard_match(pattern: &str, route: &str, anchored: bool) -> bool {
    let pieces: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = pieces.split_first().expect("split yields at least one piece");

    if !route.starts_with(first) {
        return false;
    }
    let mut pos = first.len();

    for (i, piece) in rest.iter().enumerate() {
        let is_last = i + 1 == rest.len();

        if is_last && anchored {
            // The tail piece has to close out the route, not merely
            // occur somewhere past `pos`.
            return route.len() >= pos + piece.len() && route.ends_with(piece);
        }

        match route[pos..].find(piece) {
            Some(found) => pos += found + piece.len(),
            None => return false,
        }
    }

    !anchored || pos == route.len()
}
