use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use crate::http::{HttpClient, HttpError};
use crate::resource::Resource;
use crate::tls::TlsConfig;

/// Exported `prometheus::scrape_job` resources of all nodes.
pub const DEFAULT_QUERY: &str =
    "resources[certname, parameters] { type = 'Prometheus::Scrape_job' and exported = true }";

const QUERY_PATH: &str = "/pdb/query/v4";
const MAX_BODY_EXCERPT: usize = 256;

fn default_url() -> String {
    "http://puppetdb:8080".to_string()
}

fn default_query() -> String {
    DEFAULT_QUERY.to_string()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URL of PuppetDB, `http` and `https` are supported.
    #[serde(default = "default_url")]
    pub url: String,

    /// PQL query, `{{name}}` placeholders are replaced with the value of
    /// `parameters.name`.
    #[serde(default = "default_query")]
    pub query: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Timeout of one query, including reading the response.
    #[serde(default = "default_timeout", with = "humanize::duration::serde")]
    pub timeout: Duration,

    /// Only used when `url` is `https`.
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: default_url(),
            query: default_query(),
            parameters: BTreeMap::new(),
            timeout: default_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("unexpected status {status}, body: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url {url:?}, {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("build http client failed, {0}")]
    Build(HttpError),

    #[error("query puppetdb failed, {0}")]
    Transport(#[from] TransportError),

    #[error("decode resources failed, {0}")]
    Decode(#[from] serde_json::Error),
}

/// Replace every `{{name}}` in the template with the parameter `name`. Unknown
/// placeholders are left as they are, values are inserted verbatim.
pub fn render_query(template: &str, parameters: &BTreeMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };

        let name = rest[start + 2..start + 2 + len].trim();
        output.push_str(&rest[..start]);
        match parameters.get(name) {
            Some(value) => output.push_str(value),
            None => output.push_str(&rest[start..start + len + 4]),
        }

        rest = &rest[start + len + 4..];
    }

    output.push_str(rest);
    output
}

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
}

/// Client of the PuppetDB v4 query API, it runs the configured query.
pub struct Client {
    http: HttpClient,
    endpoint: Uri,
    query: String,
    parameters: BTreeMap<String, String>,
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let invalid = |reason: String| Error::InvalidUrl {
            url: config.url.clone(),
            reason,
        };

        let url = config.url.parse::<Uri>().map_err(|err| invalid(err.to_string()))?;
        let tls = match url.scheme_str() {
            Some("http") => None,
            Some("https") => Some(&config.tls),
            Some(other) => return Err(invalid(format!("{other:?} is not a valid http scheme"))),
            None => return Err(invalid("scheme is required".to_string())),
        };

        let endpoint = format!("{}{}", config.url.trim_end_matches('/'), QUERY_PATH)
            .parse::<Uri>()
            .map_err(|err| invalid(err.to_string()))?;
        let http = HttpClient::new(tls, config.timeout).map_err(Error::Build)?;

        Ok(Client {
            http,
            endpoint,
            query: config.query.clone(),
            parameters: config.parameters.clone(),
        })
    }

    /// Run the query and decode the returned resources.
    pub async fn fetch(&self) -> Result<Vec<Resource>, Error> {
        let query = render_query(&self.query, &self.parameters);
        let body = serde_json::to_vec(&QueryBody { query: &query })?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| TransportError::Http(err.into()))?;

        let resp = self.http.send(req).await.map_err(TransportError::Http)?;
        let (parts, body) = resp.into_parts();
        if !parts.status.is_success() {
            return Err(TransportError::Status {
                status: parts.status,
                body: excerpt(&body),
            }
            .into());
        }

        let resources = serde_json::from_slice::<Vec<Resource>>(&body)?;
        debug!(
            message = "puppetdb query finished",
            endpoint = %self.endpoint,
            resources = resources.len(),
        );

        Ok(resources)
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use hyper::body::Incoming;

    use super::*;
    use crate::resource::Labels;

    fn client(url: String) -> Client {
        Client::new(&Config {
            url,
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn render() {
        let parameters = BTreeMap::from([
            ("env".to_string(), "production".to_string()),
            ("team".to_string(), "team-1".to_string()),
        ]);

        for (template, want) in [
            (DEFAULT_QUERY, DEFAULT_QUERY),
            (
                "resources { environment = '{{env}}' and tag = '{{ team }}' }",
                "resources { environment = 'production' and tag = 'team-1' }",
            ),
            ("nodes { name = '{{unknown}}' }", "nodes { name = '{{unknown}}' }"),
            ("{{env}}{{env}}", "productionproduction"),
            ("unclosed {{env", "unclosed {{env"),
            ("", ""),
        ] {
            assert_eq!(render_query(template, &parameters), want, "{template}");
        }
    }

    #[test]
    fn invalid_url() {
        for url in ["ftp://puppetdb:8080", "puppetdb:8080", "http://pup pet"] {
            let result = Client::new(&Config {
                url: url.to_string(),
                ..Default::default()
            });

            assert!(matches!(result, Err(Error::InvalidUrl { .. })), "{url}");
        }
    }

    #[tokio::test]
    async fn fetch() {
        let addr = testify::http::serve(|req: Request<Incoming>| async move {
            let (parts, body) = req.into_parts();
            assert_eq!(parts.method, Method::POST);
            assert_eq!(parts.uri.path(), "/pdb/query/v4");
            assert_eq!(parts.headers[CONTENT_TYPE], "application/json");

            let body = body.collect().await.unwrap().to_bytes();
            let value = serde_json::from_slice::<serde_json::Value>(&body).unwrap();
            assert_eq!(value["query"], DEFAULT_QUERY);

            testify::http::respond(
                StatusCode::OK,
                r#"[{"certname": "s1", "parameters": {"job_name": "node", "targets": ["s1:9100"], "labels": {"env": "prod"}}}]"#,
            )
        })
        .await;

        let resources = client(format!("http://{addr}/")).fetch().await.unwrap();
        assert_eq!(
            resources,
            vec![Resource {
                certname: "s1".into(),
                job_name: "node".into(),
                targets: vec!["s1:9100".into()],
                labels: Labels::from([("env".into(), "prod".into())]),
            }]
        );
    }

    #[tokio::test]
    async fn unexpected_status() {
        let addr = testify::http::serve(|_req| async {
            testify::http::respond(StatusCode::BAD_REQUEST, "PQL parse error at line 1")
        })
        .await;

        let err = client(format!("http://{addr}")).fetch().await.unwrap_err();
        match err {
            Error::Transport(TransportError::Status { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "PQL parse error at line 1");
            }
            err => panic!("unexpected error {err:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_response() {
        let addr = testify::http::serve(|_req| async {
            testify::http::respond(StatusCode::OK, r#"{"error": "not a list"}"#)
        })
        .await;

        let err = client(format!("http://{addr}")).fetch().await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable() {
        let addr = testify::next_addr();

        let err = client(format!("http://{addr}")).fetch().await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Http(_))));
    }

    #[test]
    fn long_body_excerpt() {
        let body = "x".repeat(1024);

        let text = excerpt(body.as_bytes());
        assert_eq!(text.len(), MAX_BODY_EXCERPT + 3);
        assert!(text.ends_with("..."));
    }
}
