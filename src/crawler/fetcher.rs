//! The stock HTTP transport behind the default `fetch` hook.

use futures::StreamExt;
use http::HeaderMap;
use hyper::body::HttpBody;
use hyper::{client::HttpConnector, Body, Client, Request};
use hyper_rustls::HttpsConnector;
use lazy_static::lazy_static;
use libflate::deflate::Decoder as DeflateDecoder;
use libflate::gzip::Decoder as GzipDecoder;
use std::io::Read;
use std::pin::Pin;
use url::Url;

use crate::extender::FetchResponse;

/// Bodies are cut off here, however much the server wants to say.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

lazy_static! {
    static ref SHARED: HttpFetcher = HttpFetcher::new(DEFAULT_MAX_BODY_SIZE);
}

/// The client every default-extender fetch goes through.
pub(crate) fn shared() -> &'static HttpFetcher {
    &SHARED
}

/// A hyper client that performs one HEAD or GET, reads the whole body,
/// and reports the response as-is. Redirects are not followed; the
/// worker re-enqueues redirect targets instead.
pub struct HttpFetcher {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    max_body_size: usize,
}

impl HttpFetcher {
    pub fn new(max_body_size: usize) -> HttpFetcher {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder()
            .pool_max_idle_per_host(1) // very stringent, but useful.
            .build(https);

        HttpFetcher {
            client,
            max_body_size,
        }
    }

    pub async fn fetch(
        &self,
        page_url: &Url,
        agent: &str,
        is_head: bool,
    ) -> Result<FetchResponse, anyhow::Error> {
        let uri: hyper::Uri = page_url.as_str().parse()?;
        let builder = if is_head {
            Request::head(uri)
        } else {
            Request::get(uri)
        };
        let request = builder
            .header("User-Agent", agent)
            .header("Accept-Encoding", "gzip, deflate")
            .body(Body::from(""))
            .expect("unreachable");

        let response = self.client.request(request).await?;

        let status = response.status();
        let headers = response.headers().clone();

        // Read the body out, up to the cap:
        let mut body = response.into_body();
        let mut stream = futures::stream::poll_fn(move |ctx| Pin::new(&mut body).poll_data(ctx));
        let mut content = vec![];

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;

            if content.len() + chunk.len() > self.max_body_size {
                log::debug!("at {}: very big body; truncating", page_url);
                content.extend(&chunk[..self.max_body_size - content.len()]);
                break;
            }

            content.extend(chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: content,
        })
    }
}

/// Undoes the response's Content-Encoding. `None` means the body is
/// already usable as-is.
pub(crate) fn decode_body(
    headers: &HeaderMap,
    content: &[u8],
) -> Result<Option<Vec<u8>>, anyhow::Error> {
    let encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_else(|| "identity".to_owned());

    match encoding.as_str() {
        "identity" => Ok(None),
        "gzip" => {
            let mut decoded = Vec::new();
            GzipDecoder::new(content)?.read_to_end(&mut decoded)?;
            Ok(Some(decoded))
        }
        "deflate" => {
            let mut decoded = Vec::new();
            DeflateDecoder::new(content).read_to_end(&mut decoded)?;
            Ok(Some(decoded))
        }
        _ => Err(anyhow::anyhow!("unknown content encoding {encoding}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libflate::gzip::Encoder as GzipEncoder;

    #[test]
    fn identity_bodies_pass_through_untouched() {
        let headers = HeaderMap::new();
        assert!(decode_body(&headers, b"<html></html>").expect("decodes").is_none());
    }

    #[test]
    fn gzip_bodies_round_trip() {
        let mut encoder = GzipEncoder::new(Vec::new()).expect("encoder builds");
        std::io::Write::write_all(&mut encoder, b"<html>hello</html>").expect("writes");
        let compressed = encoder.finish().into_result().expect("finishes");

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_ENCODING, "gzip".parse().expect("header value"));

        let decoded = decode_body(&headers, &compressed).expect("decodes");
        assert_eq!(decoded.as_deref(), Some(&b"<html>hello</html>"[..]));
    }

    #[test]
    fn unknown_encodings_are_an_error() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_ENCODING, "br".parse().expect("header value"));
        assert!(decode_body(&headers, b"x").is_err());
    }
}
