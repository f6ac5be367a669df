use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use super::config::{Auth, Config};
use super::resource::Resource;
use super::version::Version;
use super::{ObjectList, config};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(config::Error),
    #[error("build http request failed, {0}")]
    BuildRequest(http::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(hyper::Error),
    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),
    #[error("invalid config, {0}")]
    Validation(String),
    #[error("api server error, status: {}, reason: {}, message: {}", .0.status, .0.reason, .0.message)]
    Api(ErrorResponse),
    #[error("serialize request failed, {0}")]
    Serialize(serde_json::Error),
    #[error("deserialize response failed, {0}")]
    Deserialize(serde_json::Error),
    #[error("refresh token failed, {0}")]
    RefreshToken(std::io::Error),
    #[error("api server did not respond in {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns true if the API server answered with `404 Not Found`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api(resp) if resp.code == StatusCode::NOT_FOUND.as_u16())
    }

    /// Returns true if the API server answered with `409 Conflict`, which is what
    /// happens on create of an existing object or on a stale `resourceVersion`.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Api(resp) if resp.code == StatusCode::CONFLICT.as_u16())
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::ReadResponse(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::BuildRequest(err)
    }
}

/// An error response from the API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// Build an error from a failed response whose body is not a `Status` object,
    /// e.g. replies of a proxy in front of the API server.
    pub(crate) fn from_status(status: StatusCode, body: &[u8]) -> Self {
        ErrorResponse {
            status: "Failure".to_string(),
            message: String::from_utf8_lossy(body).into_owned(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            code: status.as_u16(),
        }
    }
}

/// Common query parameters used in list calls on collections
#[derive(Debug, Default)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict the list of returned objects by their fields.
    pub field_selector: Option<String>,

    /// Limit the number of results
    ///
    /// If there are more results, the server will respond with a continue token
    /// which can be used to fetch another page of results.
    ///
    /// See [Kubernetes API docs](https://kubernetes.io/docs/reference/using-api/api-concepts/#retrieving-large-results-sets-in-chunks)
    pub limit: Option<u32>,

    /// Fetch a second page of results.
    pub continue_token: Option<String>,
}

impl ListParams {
    pub fn labels(label_selector: impl Into<String>) -> Self {
        ListParams {
            label_selector: Some(label_selector.into()),
            ..Default::default()
        }
    }

    fn query(&self) -> String {
        let mut builder = form_urlencoded::Serializer::new(String::new());

        if let Some(field_selector) = &self.field_selector {
            builder.append_pair("fieldSelector", field_selector);
        }
        if let Some(label_selector) = &self.label_selector {
            builder.append_pair("labelSelector", label_selector);
        }
        if let Some(limit) = &self.limit {
            builder.append_pair("limit", &limit.to_string());
        }
        if let Some(continue_token) = &self.continue_token {
            builder.append_pair("continue", continue_token);
        }

        builder.finish()
    }
}

/// Bounds every API call, the body included.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A typed client of the Kubernetes API server, every namespaced call is made
/// against the namespace the client is created with.
#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    auth: Auth,
    endpoint: String,
    namespace: String,
    timeout: Duration,
}

impl Client {
    /// Load the kube config and build a client. When `namespace` is None, the
    /// default namespace of the loaded config is used.
    pub fn new(namespace: Option<String>) -> Result<Self, Error> {
        let config = Config::load().map_err(Error::Config)?;

        Self::from_config(config, namespace)
    }

    pub fn from_config(config: Config, namespace: Option<String>) -> Result<Self, Error> {
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(config.tls)
            .https_or_http();
        let mut inner = HttpConnector::new();
        inner.enforce_http(false);
        let connector = builder.enable_http1().wrap_connector(inner);

        let http_client =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);

        let endpoint = config.cluster_url.to_string();
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::Validation("cluster url is empty".into()));
        }

        let namespace = match namespace {
            Some(namespace) if !namespace.is_empty() => namespace,
            _ => config.default_namespace,
        };

        Ok(Client {
            http_client,
            endpoint,
            auth: config.auth,
            namespace,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Retrieve version info of the API server, so we can check the compatibility
    /// and the reachability.
    pub async fn version(&self) -> Result<Version, Error> {
        self.request(Method::GET, format!("{}/version", self.endpoint), None)
            .await
    }

    /// List a collection of a resource, one page.
    pub async fn list<R: Resource>(&self, params: &ListParams) -> Result<ObjectList<R>, Error> {
        let uri = format!(
            "{}{}?{}",
            self.endpoint,
            R::url_path(Some(&self.namespace)),
            params.query()
        );

        self.request(Method::GET, uri, None).await
    }

    /// List every object of a resource matching the label selector, following
    /// continue tokens until the last page.
    pub async fn list_all<R: Resource>(&self, label_selector: &str) -> Result<Vec<R>, Error> {
        let mut params = ListParams {
            label_selector: Some(label_selector.to_string()),
            limit: Some(500),
            ..Default::default()
        };
        let mut items = Vec::new();

        loop {
            let list = self.list::<R>(&params).await?;
            items.extend(list.items);

            match list.metadata.r#continue {
                Some(token) if !token.is_empty() => params.continue_token = Some(token),
                _ => return Ok(items),
            }
        }
    }

    /// Get a named object, `Ok(None)` is returned when it does not exist.
    pub async fn get<R: Resource>(&self, name: &str) -> Result<Option<R>, Error> {
        let uri = format!(
            "{}{}",
            self.endpoint,
            R::object_path(Some(&self.namespace), name)
        );

        match self.request::<R>(Method::GET, uri, None).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn create<R: Resource>(&self, obj: &R) -> Result<R, Error> {
        let uri = format!("{}{}", self.endpoint, R::url_path(Some(&self.namespace)));
        let body = encode(obj)?;

        self.request(Method::POST, uri, Some(body)).await
    }

    /// Replace the named object, the `resourceVersion` in the object's metadata
    /// is used by the API server to detect concurrent modifications.
    pub async fn replace<R: Resource>(&self, name: &str, obj: &R) -> Result<R, Error> {
        let uri = format!(
            "{}{}",
            self.endpoint,
            R::object_path(Some(&self.namespace), name)
        );
        let body = encode(obj)?;

        self.request(Method::PUT, uri, Some(body)).await
    }

    pub async fn delete<R: Resource>(&self, name: &str) -> Result<(), Error> {
        let uri = format!(
            "{}{}",
            self.endpoint,
            R::object_path(Some(&self.namespace), name)
        );

        // the response is either the deleted object or a Status, neither is needed
        self.request::<serde_json::Value>(Method::DELETE, uri, None)
            .await
            .map(|_| ())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        uri: String,
        body: Option<Vec<u8>>,
    ) -> Result<T, Error> {
        trace!(message = "doing http request", %method, uri);

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::ACCEPT, "application/json");
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let mut req = builder.body(body.map(Full::from).unwrap_or_default())?;

        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        let fut = async {
            let resp = self.http_client.request(req).await.map_err(Error::Http)?;
            let (parts, incoming) = resp.into_parts();
            let body = incoming.collect().await?.to_bytes();

            Ok::<_, Error>((parts, body))
        };
        let (parts, body) = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        if !parts.status.is_success() {
            let err = serde_json::from_slice::<ErrorResponse>(&body)
                .unwrap_or_else(|_| ErrorResponse::from_status(parts.status, &body));
            return Err(Error::Api(err));
        }

        serde_json::from_slice(&body).map_err(Error::Deserialize)
    }
}

/// Serialize an object with the `apiVersion` and `kind` of its resource type.
pub(crate) fn encode<R: Resource>(obj: &R) -> Result<Vec<u8>, Error> {
    let mut value = serde_json::to_value(obj).map_err(Error::Serialize)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), R::api_version().into());
        map.insert("kind".to_string(), R::KIND.into());
    }

    serde_json::to_vec(&value).map_err(Error::Serialize)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ObjectMeta, ObjectStore, Secret};

    fn local_client(addr: SocketAddr) -> Client {
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let config = Config {
            cluster_url: format!("http://{addr}").parse().unwrap(),
            default_namespace: "monitoring".to_string(),
            auth: Auth::None,
            tls,
        };

        Client::from_config(config, None).unwrap()
    }

    #[tokio::test]
    async fn delete_through_store() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deleted);
        let addr = testify::http::serve(move |req| {
            let counter = Arc::clone(&counter);
            async move {
                if req.method() == Method::DELETE
                    && req.uri().path() == "/api/v1/namespaces/monitoring/secrets/foo"
                {
                    counter.fetch_add(1, Ordering::SeqCst);
                    testify::http::respond(StatusCode::OK, r#"{"kind": "Status"}"#)
                } else {
                    testify::http::not_found()
                }
            }
        })
        .await;

        let client = local_client(addr);
        ObjectStore::delete::<Secret>(&client, "foo").await.unwrap();
        assert_eq!(deleted.load(Ordering::SeqCst), 1);

        let err = ObjectStore::delete::<Secret>(&client, "bar")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn hung_api_server_times_out() {
        let addr = testify::http::serve(|_req| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            testify::http::respond(StatusCode::OK, "{}")
        })
        .await;

        let client = local_client(addr).with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        match client.get::<Secret>("foo").await {
            Err(Error::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(200)),
            Err(err) => panic!("unexpected error {err}"),
            Ok(_) => panic!("hung request succeeded"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn list_query() {
        let params = ListParams {
            label_selector: Some("prometheus-puppetdb=true".into()),
            limit: Some(500),
            continue_token: Some("abc".into()),
            ..Default::default()
        };

        assert_eq!(
            params.query(),
            "labelSelector=prometheus-puppetdb%3Dtrue&limit=500&continue=abc"
        );
        assert_eq!(ListParams::default().query(), "");
    }

    #[test]
    fn encode_injects_type_meta() {
        let secret = Secret {
            metadata: ObjectMeta::named("foo"),
            ..Default::default()
        };

        let data = encode(&secret).unwrap();
        let value = serde_json::from_slice::<serde_json::Value>(&data).unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["kind"], "Secret");
        assert_eq!(value["metadata"]["name"], "foo");
    }

    #[test]
    fn error_kinds() {
        let not_found = Error::Api(ErrorResponse::from_status(StatusCode::NOT_FOUND, b""));
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(conflict.is_conflict());
        assert!(!Error::Validation("foo".into()).is_not_found());
    }
}
