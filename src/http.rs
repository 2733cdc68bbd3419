//! Fetching revocation data over HTTP.
//!
//! The caches talk to the network exclusively through the [`Fetch`] trait
//! so that the tests can count and fake fetches. The one real
//! implementation, [`HttpClient`], wraps a blocking _reqwest_ client with
//! the timeouts from the configuration. A slow or unreachable origin server
//! must only ever degrade the one lookup, so both connect and read timeouts
//! are always set.

use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::error;
use reqwest::{header, StatusCode};
use reqwest::blocking::{Client, RequestBuilder};
use crate::config::Config;
use crate::error::Failed;
use crate::utils::date::{format_http_date, parse_http_date};


//------------ Fetch ---------------------------------------------------------

/// Access to revocation data on the network.
pub trait Fetch: Send + Sync {
    /// Performs an unconditional GET request for the given URI.
    fn get(&self, uri: &str) -> Result<FetchedBody, FetchError>;

    /// Performs a conditional GET request for the given URI.
    ///
    /// Returns `Ok(None)` if the origin reported the resource as not
    /// modified. If neither `last_modified` nor `etag` is given, the
    /// request is sent unconditionally.
    fn get_conditional(
        &self,
        uri: &str,
        last_modified: Option<DateTime<Utc>>,
        etag: Option<&Bytes>,
    ) -> Result<Option<FetchedBody>, FetchError>;

    /// Posts a DER-encoded OCSP request to the given responder URI.
    fn post_ocsp(&self, uri: &str, request: &[u8])
        -> Result<Bytes, FetchError>;
}


//------------ FetchedBody ---------------------------------------------------

/// A successfully fetched response body plus its revalidation metadata.
#[derive(Clone, Debug)]
pub struct FetchedBody {
    /// The response body.
    pub body: Bytes,

    /// The value of the Last-Modified header if present and well-formed.
    pub last_modified: Option<DateTime<Utc>>,

    /// The value of the ETag header if present and well-formed.
    ///
    /// The value is kept complete, including the quotation marks and a
    /// possible `W/` prefix, so it can be sent back verbatim in
    /// `If-None-Match`.
    pub etag: Option<Bytes>,
}


//------------ FetchError ----------------------------------------------------

/// A fetch did not produce a usable response.
///
/// This covers network errors and non-success status codes alike. The
/// caches translate it into “revocation data unavailable” – it is never
/// fatal and never cached.
#[derive(Clone, Copy, Debug)]
pub struct FetchError;


//------------ HttpClient ----------------------------------------------------

/// The HTTP client used for all revocation fetches.
#[derive(Debug)]
pub struct HttpClient {
    /// The underlying blocking reqwest client.
    client: Client,

    /// The per-request timeout.
    timeout: Option<Duration>,
}

impl HttpClient {
    /// Creates a new client from the configuration.
    pub fn new(config: &Config) -> Result<Self, Failed> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .user_agent(config.http_user_agent.clone())
            .timeout(None); // Set per request.
        if let Some(timeout) = config.http_connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = match builder.build() {
            Ok(client) => client,
            Err(err) => {
                error!("Failed to initialize HTTP client: {}.", err);
                return Err(Failed)
            }
        };
        Ok(HttpClient {
            client,
            timeout: config.http_timeout,
        })
    }

    /// Sends a request and converts the response.
    ///
    /// Any status code other than 200 and 304 counts as a failed fetch.
    fn send(
        &self, uri: &str, mut request: RequestBuilder
    ) -> Result<Option<FetchedBody>, FetchError> {
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().map_err(|err| {
            log::warn!("{}: {}", uri, err);
            FetchError
        })?;
        match response.status() {
            StatusCode::OK => { }
            StatusCode::NOT_MODIFIED => return Ok(None),
            status => {
                log::warn!("{}: unexpected status {}", uri, status);
                return Err(FetchError)
            }
        }
        let last_modified = response.headers().get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);
        let etag = response.headers().get(header::ETAG)
            .map(|value| Bytes::copy_from_slice(value.as_bytes()));
        let body = response.bytes().map_err(|err| {
            log::warn!("{}: failed to read response: {}", uri, err);
            FetchError
        })?;
        Ok(Some(FetchedBody { body, last_modified, etag }))
    }
}

impl Fetch for HttpClient {
    fn get(&self, uri: &str) -> Result<FetchedBody, FetchError> {
        match self.send(uri, self.client.get(uri))? {
            Some(body) => Ok(body),
            // A 304 to an unconditional GET is an origin server bug.
            None => Err(FetchError),
        }
    }

    fn get_conditional(
        &self,
        uri: &str,
        last_modified: Option<DateTime<Utc>>,
        etag: Option<&Bytes>,
    ) -> Result<Option<FetchedBody>, FetchError> {
        let mut request = self.client.get(uri);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag.as_ref());
        }
        if let Some(last_modified) = last_modified {
            request = request.header(
                header::IF_MODIFIED_SINCE,
                format_http_date(last_modified)
            );
        }
        self.send(uri, request)
    }

    fn post_ocsp(
        &self, uri: &str, request: &[u8]
    ) -> Result<Bytes, FetchError> {
        let request = self.client.post(uri)
            .header(header::ACCEPT, "application/ocsp-response")
            .header(header::CONTENT_TYPE, "application/ocsp-request")
            .body(request.to_vec());
        match self.send(uri, request)? {
            Some(body) => Ok(body.body),
            None => Err(FetchError),
        }
    }
}
