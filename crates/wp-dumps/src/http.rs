//! Shared code for making HTTP requests.

use anyhow::{bail, Context, format_err};
use crate::{
    Result,
    util::fmt::{Bytes, TransferStats},
};
use derive_builder::Builder;
use encoding_rs::{Encoding, UTF_8};
use futures::{
    future::Future,
    stream::{BoxStream, StreamExt},
};
use http_cache_reqwest::CacheMode;
use std::{
    convert::TryFrom,
    fmt::{self, Debug, Display},
    path::PathBuf,
    result::Result as StdResult,
    time::{Duration, Instant},
};
use tracing::Level;

pub type Client = reqwest_middleware::ClientWithMiddleware;

#[derive(Builder, Clone, Debug)]
pub struct Options {
    /// Directory for the on-disk HTTP cache used by the metadata client.
    cache_path: PathBuf,

    #[builder(default = "CacheMode::Default")]
    cache_mode: CacheMode,

    #[builder(default = "Duration::from_secs(10)")]
    connect_timeout: Duration,

    /// Whole-request timeout for metadata requests.
    #[builder(default = "Duration::from_secs(30)")]
    metadata_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct FetchTextResult {
    pub response_body: String,
    pub response_code: StatusCode,
    pub stats: TransferStats,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct StatusCode(pub reqwest::StatusCode);

/// The start of a file download response, returned by [`FileClient::get_file`].
pub struct FileResponse {
    pub status: StatusCode,

    /// Length of this response's body.
    pub content_length: Option<u64>,

    /// Parsed `Content-Range` header, present on `206 Partial Content` responses.
    pub content_range: Option<ContentRange>,

    pub body: BoxStream<'static, StdResult<bytes::Bytes, TransferError>>,
}

/// A parsed `Content-Range: bytes {start}-{end}/{total}` response header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContentRange {
    pub start: u64,

    /// Inclusive.
    pub end: u64,

    /// `None` when the server sent `*`.
    pub total: Option<u64>,
}

/// Errors making a file request or reading its body.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("HTTP response error code response_code={0:?}")]
    Status(StatusCode),

    #[error("error reading the response body: {0}")]
    Body(String),

    #[error("could not build or send the request: {0}")]
    Request(String),
}

/// Makes the requests the download engine needs.
///
/// Implemented for [`Client`]; tests use scripted implementations.
pub trait FileClient: Send + Sync + 'static {
    /// Start a GET of `url`. When `offset` is non-zero, request the bytes from `offset`
    /// to the end with a `Range` header.
    ///
    /// Returns the response whatever its status code; errors are connection-level only.
    fn get_file(
        &self,
        url: &str,
        offset: u64,
    ) -> impl Future<Output = StdResult<FileResponse, TransferError>> + Send;
}

impl Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StatusCode({code_int} = '{code_str}')",
               code_int = self.as_u16(),
               code_str = self.as_str())
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.as_str())
    }
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        self.0.as_u16()
    }

    pub fn as_str(&self) -> &'static str {
        self.0.canonical_reason().unwrap_or("")
    }

    /// Server-side conditions worth retrying: 408, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        self.0 == reqwest::StatusCode::REQUEST_TIMEOUT
            || self.0 == reqwest::StatusCode::TOO_MANY_REQUESTS
            || self.0.is_server_error()
    }
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Connection(_)
                | TransferError::Timeout(_)
                | TransferError::Body(_) => true,
            TransferError::Status(code) => code.is_transient(),
            TransferError::Request(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> TransferError {
        let msg = err.to_string();
        if err.is_timeout() {
            TransferError::Timeout(msg)
        } else if err.is_builder() || err.is_redirect() {
            TransferError::Request(msg)
        } else if err.is_body() || err.is_decode() {
            TransferError::Body(msg)
        } else {
            TransferError::Connection(msg)
        }
    }

    fn from_middleware(err: reqwest_middleware::Error) -> TransferError {
        match err {
            reqwest_middleware::Error::Reqwest(e) => TransferError::from_reqwest(e),
            reqwest_middleware::Error::Middleware(e) => TransferError::Request(format!("{e:#}")),
        }
    }
}

impl ContentRange {
    /// Parse a `Content-Range` header value like `bytes 100-199/200` or `bytes 100-199/*`.
    pub fn parse(s: &str) -> Option<ContentRange> {
        let cap = lazy_regex!(r"^bytes (?P<start>\d+)-(?P<end>\d+)/(?P<total>\d+|\*)$")
                      .captures(s.trim())?;
        let start: u64 = cap.name("start")?.as_str().parse().ok()?;
        let end: u64 = cap.name("end")?.as_str().parse().ok()?;
        let total = match cap.name("total")?.as_str() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };
        if end < start {
            return None;
        }
        Some(ContentRange { start, end, total })
    }
}

/// Constructs a `Client` suitable for fetching metadata.
///
/// Currently enables gzip compression, HTTP caching, and request and connection timeouts.
pub fn metadata_client(options: &Options) -> Result<Client> {
    let inner = inner_client_common(options)?
                    .timeout(options.metadata_timeout)
                    .gzip(true)
                    .build()?;

    let with_middleware =
        reqwest_middleware::ClientBuilder::new(inner)
            .with(cache(options)?)
            .build();

    Ok(with_middleware)
}

/// Constructs a `Client` suitable for downloading large files.
///
/// Disables gzip compression and HTTP caching; enables only a connection timeout,
/// the engine applies its own timeout to each body chunk.
pub fn download_client(options: &Options) -> Result<Client> {
    let inner = inner_client_common(options)?
                    .gzip(false)
                    .build()?;
    let with_middleware =
        reqwest_middleware::ClientBuilder::new(inner)
            .build();

    Ok(with_middleware)
}

fn inner_client_common(options: &Options) -> Result<reqwest::ClientBuilder> {
    Ok(reqwest::ClientBuilder::new()
           .user_agent(concat!(
               env!("CARGO_PKG_NAME"),
               "/",
               env!("CARGO_PKG_VERSION"),))
           .connect_timeout(options.connect_timeout))
}

fn cache(
    options: &Options,
) -> Result<http_cache_reqwest::Cache<http_cache_reqwest::CACacheManager>> {
    let cache_path = &options.cache_path;
    std::fs::create_dir_all(cache_path)
        .context("while creating HTTP cache directory")?;
    let cache_path_string = cache_path.to_str().ok_or_else(
                                || format_err!(
                                       "Couldn't convert HTTP cache path '{path}' to a String",
                                       path = cache_path.display()))?.to_string();

    Ok(http_cache_reqwest::Cache(
           http_cache_reqwest::HttpCache {
               mode: options.cache_mode,
               manager: http_cache_reqwest::CACacheManager {
                   path: cache_path_string,
               },
               options: None,
           }))
}

impl FileClient for Client {
    async fn get_file(
        &self,
        url: &str,
        offset: u64,
    ) -> StdResult<FileResponse, TransferError> {
        let mut request = self.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(TransferError::from_middleware)?;
        let status = StatusCode(response.status());

        let content_range = response.headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(ContentRange::parse);

        tracing::debug!(url,
                        offset,
                        response_code = %status,
                        content_length = ?response.content_length(),
                        ?content_range,
                        "http::get_file() response headers");

        Ok(FileResponse {
            status,
            content_length: response.content_length(),
            content_range,
            body: response.bytes_stream()
                          .map(|chunk| chunk.map_err(TransferError::from_reqwest))
                          .boxed(),
        })
    }
}

#[tracing::instrument(
    level = "trace",
    skip(client, request),
    fields(url = %request.url().clone(),
           method = %request.method().clone()))]
pub async fn fetch_text(
    client: &Client,
    request: reqwest::Request,
) -> Result<FetchTextResult> {

    let start_time = Instant::now();

    let url = request.url().clone();
    let method = request.method().clone();

    // Async block to add context to errors.
    async {
        tracing::debug!(%url, %method, "http::fetch_text() beginning");

        let response = client.execute(request).await?;

        let res_code = StatusCode(response.status());
        tracing::debug!(%url,
                        %method,
                        response_code = %res_code,
                        "HTTP response headers");

        // Text decoding copied from reqwest::Response::text(),
        // but tweaked to access the response body length.
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<mime::Mime>().ok());
        let encoding_name = content_type
            .as_ref()
            .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
            .unwrap_or("utf-8");
        let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);

        let response_body_bytes = response.bytes().await?;
        let (text, _, _) = encoding.decode(&response_body_bytes);
        let response_body = text.into_owned();

        if tracing::enabled!(Level::TRACE) {
            tracing::trace!(body_text = response_body.as_str(), "HTTP response body");
        }

        if !res_code.0.is_success() {
            bail!("HTTP response code error response_code={res_code:?}");
        }

        let len = u64::try_from(response_body_bytes.len()).expect("usize to convert to u64");
        let res = FetchTextResult {
            response_body,
            response_code: res_code,
            stats: TransferStats::new(Bytes(len), start_time.elapsed()),
        };

        tracing::debug!(%url,
                        %method,
                        response_code = %res_code,
                        stats = %res.stats,
                        "http::fetch_text() complete");

        Ok::<FetchTextResult, anyhow::Error>(res)
    }.await.with_context(|| format!("while fetching HTTP response as text \
                                     url='{url}' \
                                     method={method}"))
}

#[cfg(test)]
mod tests {
    use super::{ContentRange, StatusCode, TransferError};

    #[test]
    fn parse_content_range() {
        assert_eq!(ContentRange::parse("bytes 100-199/200"),
                   Some(ContentRange { start: 100, end: 199, total: Some(200) }));
        assert_eq!(ContentRange::parse("bytes 0-0/*"),
                   Some(ContentRange { start: 0, end: 0, total: None }));
        assert_eq!(ContentRange::parse("bytes */200"), None);
        assert_eq!(ContentRange::parse("bytes 10-5/200"), None);
        assert_eq!(ContentRange::parse("items 1-2/3"), None);
    }

    #[test]
    fn transient_classification() {
        let status = |code: u16| TransferError::Status(
            StatusCode(reqwest::StatusCode::from_u16(code).unwrap()));

        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
        assert!(TransferError::Timeout("read".to_string()).is_transient());
        assert!(TransferError::Connection("reset".to_string()).is_transient());
        assert!(!TransferError::Request("bad url".to_string()).is_transient());
    }
}
