//! Link harvesting out of fetched HTML.

use lazy_static::lazy_static;
use scraper::{Html, Selector};
use url::{ParseError, Url};

lazy_static! {
    static ref ANCHOR: Selector = Selector::parse("a[href]").expect("static selector parses");
}

/// Pulls every `a[href]` value out of an HTML document, as written.
pub(crate) fn extract_raw_links(content: &[u8]) -> Vec<String> {
    let html = Html::parse_document(&String::from_utf8_lossy(content));

    html.select(&ANCHOR)
        .filter_map(|element| element.value().attr("href"))
        .map(str::to_owned)
        .collect()
}

/// Resolves a raw href against the page it came from, rejecting the
/// usual junk: empty strings, section references, non-HTTP schemes and
/// host-less results.
pub(crate) fn checked_join(base_url: &Url, raw: &str) -> Result<Url, anyhow::Error> {
    if raw.is_empty() || raw.starts_with('#') {
        anyhow::bail!("bad link: {:?}", raw);
    }

    let url: Url = raw
        .parse()
        .or_else(|err| {
            if err == ParseError::RelativeUrlWithoutBase {
                base_url.join(raw)
            } else {
                Err(err)
            }
        })
        .map_err(|err| anyhow::anyhow!("bad link {:?}: {}", raw, err))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("unaccepted scheme: {}", raw);
    }

    if url.host_str().is_none() {
        anyhow::bail!("no host: {}", raw);
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harvests_hrefs_in_document_order() {
        let html = br#"
            <html><body>
                <a href="page2.html">two</a>
                <a name="anchor-without-href">skip</a>
                <a href="http://hostb/page1.html">elsewhere</a>
            </body></html>
        "#;
        assert_eq!(
            extract_raw_links(html),
            vec!["page2.html".to_owned(), "http://hostb/page1.html".to_owned()],
        );
    }

    #[test]
    fn joins_relative_links() {
        let base = "http://hosta/sub/page1.html".parse().expect("test url parses");
        assert_eq!(
            checked_join(&base, "/page2.html").expect("joins").as_str(),
            "http://hosta/page2.html",
        );
    }

    #[test]
    fn rejects_section_references_and_mailto() {
        let base = "http://hosta/page1.html".parse().expect("test url parses");
        assert!(checked_join(&base, "#top").is_err());
        assert!(checked_join(&base, "").is_err());
        assert!(checked_join(&base, "mailto:someone@hosta").is_err());
    }
}
