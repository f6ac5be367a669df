use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

use crate::tls::{TlsConfig, TlsError};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Failed to build TLS connector: {0}")]
    BuildTlsConnector(#[from] TlsError),
    #[error("Failed to make HTTP(S) request: {0}")]
    CallRequest(#[from] hyper_util::client::legacy::Error),
    #[error("Failed to reading response: {0}")]
    ReadIncoming(#[from] hyper::Error),
    #[error("Failed to build HTTP request: {0}")]
    BuildRequest(#[from] http::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// A HTTP/1 client which speaks both plain HTTP and HTTPS. Responses are
/// collected into memory, the bodies this tool reads are small.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    user_agent: HeaderValue,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(tls_config: Option<&TlsConfig>, timeout: Duration) -> Result<HttpClient, HttpError> {
        let config = match tls_config {
            Some(config) => config.client_config()?,
            // plain HTTP only, no server certificate is trusted
            None => ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        };

        Ok(Self::new_with_tls_config(config, timeout))
    }

    pub fn new_with_tls_config(tls: ClientConfig, timeout: Duration) -> HttpClient {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let https = HttpsConnector::from((http, tls));
        let client = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = HeaderValue::from_static(concat!("puppetdb-sd/", env!("CARGO_PKG_VERSION")));

        HttpClient {
            client,
            user_agent,
            timeout,
        }
    }

    /// Send the request and read the whole response body, the timeout covers both.
    pub async fn send(&self, mut req: Request<Full<Bytes>>) -> Result<Response<Bytes>, HttpError> {
        if !req.headers().contains_key(USER_AGENT) {
            req.headers_mut().insert(USER_AGENT, self.user_agent.clone());
        }

        let uri = req.uri().clone();
        debug!(
            message = "sending HTTP request",
            method = %req.method(),
            %uri,
            headers = ?remove_sensitive(req.headers()),
            body = %FormatBody(req.body()),
        );

        let fut = async {
            let resp = self.client.request(req).await?;
            let (parts, incoming) = resp.into_parts();
            let body = incoming.collect().await?.to_bytes();

            Ok::<_, HttpError>(Response::from_parts(parts, body))
        };

        let resp = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))??;

        debug!(
            message = "HTTP response received",
            %uri,
            status = %resp.status(),
            version = ?resp.version(),
            headers = ?remove_sensitive(resp.headers()),
            body = resp.body().len(),
        );

        Ok(resp)
    }
}

/// Newtype placeholder to provide a formatter for the request body.
struct FormatBody<'a, B>(&'a B);

impl<B: Body> fmt::Display for FormatBody<'_, B> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let size = self.0.size_hint();
        match (size.lower(), size.upper()) {
            (0, None) => write!(fmt, "[unknown]"),
            (lower, None) => write!(fmt, "[>={} bytes]", lower),

            (0, Some(0)) => write!(fmt, "[empty]"),
            (0, Some(upper)) => write!(fmt, "[<={} bytes]", upper),

            (lower, Some(upper)) if lower == upper => write!(fmt, "[{} bytes]", lower),
            (lower, Some(upper)) => write!(fmt, "[{}..={} bytes]", lower, upper),
        }
    }
}

fn remove_sensitive(headers: &HeaderMap<HeaderValue>) -> HeaderMap<HeaderValue> {
    let mut headers = headers.clone();
    for name in &[AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE] {
        if let Some(value) = headers.get_mut(name) {
            value.set_sensitive(true);
        }
    }

    headers
}
