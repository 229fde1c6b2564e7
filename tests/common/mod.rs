//! Shared fixture: an in-memory web of little HTML pages spanning three
//! hosts, served straight through the fetch hook.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use aranha::http::{HeaderMap, StatusCode};
use aranha::{anyhow, async_trait, EnqueueSlot, Extender, FetchResponse, UrlContext};

/// One request exactly as the fixture saw it.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub url: String,
    pub agent: String,
    pub is_head: bool,
    pub at: Instant,
}

pub struct Site {
    pages: HashMap<String, String>,
    requests: Mutex<Vec<RequestRecord>>,
}

fn page(links: &[&str]) -> String {
    let mut body = String::from("<html><head><title>fixture</title></head><body>\n");
    for link in links {
        body.push_str(&format!("<a href=\"{}\">{}</a>\n", link, link));
    }
    body.push_str("</body></html>\n");
    body
}

impl Site {
    /// The standard link graph the crawl tests run against. hosta is a
    /// little five-page site; hostb and hostc point at each other.
    pub fn new() -> Site {
        let mut pages = HashMap::new();

        pages.insert(
            "http://hosta/page1.html".to_owned(),
            page(&["page2.html", "page3.html", "http://hostb/page1.html"]),
        );
        pages.insert("http://hosta/page2.html".to_owned(), page(&["page1.html"]));
        pages.insert("http://hosta/page3.html".to_owned(), page(&[]));
        pages.insert(
            "http://hosta/page4.html".to_owned(),
            page(&["page5.html", "page1.html", "page2.html"]),
        );
        pages.insert(
            "http://hosta/page5.html".to_owned(),
            page(&["page1.html", "page2.html", "page3.html", "page4.html"]),
        );

        pages.insert(
            "http://hostb/page1.html".to_owned(),
            page(&["http://hostc/page1.html", "page1.html"]),
        );
        pages.insert("http://hostb/pageunlinked.html".to_owned(), page(&[]));

        pages.insert(
            "http://hostc/page1.html".to_owned(),
            page(&["http://hostb/page1.html", "page1.html#main", "page1.html#footer"]),
        );

        Site {
            pages,
            requests: Mutex::new(vec![]),
        }
    }

    /// Plays web server: known pages come back 200, the rest 404, and
    /// there is no robots.txt anywhere.
    pub fn serve(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.requests
            .lock()
            .expect("request log lock poisoned")
            .push(RequestRecord {
                url: ctx.url().to_string(),
                agent: agent.to_owned(),
                is_head,
                at: Instant::now(),
            });

        let (status, body) = match self.pages.get(ctx.url().as_str()) {
            Some(body) => (StatusCode::OK, body.clone()),
            None => (StatusCode::NOT_FOUND, "nothing here".to_owned()),
        };

        Ok(FetchResponse {
            status,
            headers: HeaderMap::new(),
            body: if is_head { vec![] } else { body.into_bytes() },
        })
    }

    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.requests
            .lock()
            .expect("request log lock poisoned")
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn fetch_instants(&self) -> Vec<Instant> {
        self.snapshot().into_iter().map(|record| record.at).collect()
    }
}

/// The baseline test extender: stock behavior at every stage, fetching
/// from the fixture, with an enqueue slot ready for binding.
pub struct SiteExtender {
    pub site: Arc<Site>,
    pub enqueue: EnqueueSlot,
}

impl SiteExtender {
    pub fn new(site: Arc<Site>) -> SiteExtender {
        SiteExtender {
            site,
            enqueue: EnqueueSlot::new(),
        }
    }
}

#[async_trait]
impl Extender for SiteExtender {
    fn enqueue_slot(&self) -> Option<&EnqueueSlot> {
        Some(&self.enqueue)
    }

    async fn fetch(
        &self,
        ctx: &UrlContext,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        self.site.serve(ctx, agent, is_head)
    }
}
