use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{trace, warn};

use crate::ObjectList;
use crate::config::{self, Auth, Config};

/// The API server closes watches after a while anyway, and it refuses anything
/// at or above this many seconds.
/// https://github.com/kubernetes/kubernetes/issues/6513
pub const MAX_WATCH_TIMEOUT: u32 = 295;

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
    #[error("invalid params, {0}")]
    Validation(String),
    #[error("api server error, code: {}, reason: {}, message: {}", .0.code, .0.reason, .0.message)]
    Api(ErrorResponse),
    #[error("deserialize response failed, {0}")]
    Deserialize(serde_json::Error),
    #[error("read watch event failed, {0}")]
    ReadEvents(std::io::Error),
    #[error("chunk line is too large")]
    LinesCodecMaxLineLengthExceeded,
    #[error("refresh token failed, {0}")]
    RefreshToken(std::io::Error),
}

impl Error {
    /// The resource version we asked for is too old, only a fresh list
    /// can recover from that.
    pub fn is_expired(&self) -> bool {
        match self {
            Error::Api(resp) => resp.is_expired(),
            _ => false,
        }
    }

    /// A payload from the API server could not be understood.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Deserialize(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialize(err)
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

/// An error response from the API, a `Status` object.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ErrorResponse {
    /// The status
    #[serde(default)]
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    #[serde(default)]
    pub code: u16,
}

impl ErrorResponse {
    fn from_status(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorResponse>(body) {
            Ok(mut resp) => {
                if resp.code == 0 {
                    resp.code = status.as_u16();
                }
                resp
            }
            Err(_) => ErrorResponse {
                status: "Failure".to_string(),
                message: String::from_utf8_lossy(body).into_owned(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                code: status.as_u16(),
            },
        }
    }

    pub fn is_expired(&self) -> bool {
        self.code == StatusCode::GONE.as_u16() || self.reason == "Expired" || self.reason == "Gone"
    }
}

/// Version information of the API server.
#[derive(Deserialize, Debug)]
pub struct Version {
    /// Major version of the ApiServer
    pub major: String,

    /// Minor version of the ApiServer
    pub minor: String,

    #[serde(default, rename = "gitVersion")]
    pub git_version: String,

    #[serde(default)]
    pub platform: String,
}

/// Common query parameters used in list calls on collections
#[derive(Clone, Debug, Default)]
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

    /// Fetch the next page of results.
    pub continue_token: Option<String>,
}

impl ListParams {
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

/// Common query parameters used in watch calls on collections
#[derive(Clone, Debug, Default)]
pub struct WatchParams {
    /// A selector to restrict returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict returned objects by their fields.
    pub field_selector: Option<String>,

    /// Timeout for the watch call.
    ///
    /// This limits the duration of the call, regardless of any activity or inactivity.
    /// If unset for a watch call, we will use 290s.
    pub timeout: Option<u32>,

    /// Enables watch events with type "BOOKMARK"
    ///
    /// Servers that do not implement bookmarks ignore this flag and bookmarks are sent
    /// at the server's discretion. Clients should not assume bookmarks are returned at
    /// any specific interval, nor may they assume the server will send any BOOKMARK
    /// event during a session.
    pub bookmarks: bool,
}

impl WatchParams {
    fn validate(&self) -> Result<(), Error> {
        if let Some(timeout) = self.timeout
            && timeout >= MAX_WATCH_TIMEOUT
        {
            return Err(Error::Validation(format!(
                "watch timeout must be less than {MAX_WATCH_TIMEOUT}s, got {timeout}s"
            )));
        }

        Ok(())
    }

    fn query(&self, resource_version: &str) -> String {
        let mut builder = form_urlencoded::Serializer::new(String::new());

        builder.append_pair("resourceVersion", resource_version);
        builder.append_pair("watch", "true");
        builder.append_pair(
            "timeoutSeconds",
            self.timeout.unwrap_or(290).to_string().as_str(),
        );

        if let Some(label_selector) = self.label_selector.as_ref() {
            builder.append_pair("labelSelector", label_selector);
        }
        if let Some(field_selector) = self.field_selector.as_ref() {
            builder.append_pair("fieldSelector", field_selector);
        }
        if self.bookmarks {
            builder.append_pair("allowWatchBookmarks", "true");
        }

        builder.finish()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BookmarkMeta {
    /// The only field we need from a Bookmark event.
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
}

/// Can only be relied upon to have metadata with resource version.
/// Bookmarks contain apiVersion + kind + basically empty metadata
///
/// See https://kubernetes.io/docs/reference/using-api/api-concepts/#watch-bookmarks
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Bookmark {
    /// Basically empty metadata
    pub metadata: BookmarkMeta,
}

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Resource bookmark. `Bookmark` is a slimmed down `K`
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    auth: Auth,
    endpoint: String,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, Error> {
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(config.tls)
            .https_or_http();
        let mut inner = HttpConnector::new();
        inner.enforce_http(false);
        let connector = builder.enable_http1().wrap_connector(inner);

        let http_client =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);

        let endpoint = config
            .cluster_url
            .to_string()
            .trim_end_matches('/')
            .to_string();
        if endpoint.is_empty() {
            return Err(Error::Validation("cluster url is empty".into()));
        }

        Ok(Client {
            http_client,
            endpoint,
            auth: config.auth,
        })
    }

    /// Build a client from whatever credentials [`Config::load`] finds.
    pub fn infer() -> Result<Self, Error> {
        let config = Config::load().map_err(Error::Config)?;
        Self::new(config)
    }

    fn request(&self, path_and_query: &str) -> Result<Request<Full<Bytes>>, Error> {
        let uri = format!("{}{}", self.endpoint, path_and_query);
        trace!(message = "doing http request", uri);

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;

        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        Ok(req)
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Bytes, Error> {
        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming.collect().await?.to_bytes();

        if parts.status.is_success() {
            Ok(body)
        } else {
            Err(Error::Api(ErrorResponse::from_status(parts.status, &body)))
        }
    }

    /// Retrieve version info of the API server, so we can check the compatibility
    pub async fn version(&self) -> Result<Version, Error> {
        let req = self.request("/version")?;
        let body = self.send(req).await?;

        serde_json::from_slice(&body).map_err(Error::Deserialize)
    }

    /// List one page of a collection, `path` is the collection path without
    /// any query, e.g. `/apis/apps/v1/deployments`
    pub async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &ListParams,
    ) -> Result<ObjectList<T>, Error> {
        let req = self.request(&format!("{path}?{}", params.query()))?;
        let body = self.send(req).await?;

        serde_json::from_slice::<ObjectList<T>>(&body).map_err(Error::Deserialize)
    }

    /// watch returns a stream the produce WatchEvent<T>, and it will stop if
    /// an error occurred or the connection timeout. So, user have to call this
    /// function again to get notified again.
    pub async fn watch<T: DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<T>, Error>>, Error> {
        params.validate()?;

        let req = self.request(&format!("{path}?{}", params.query(resource_version)))?;
        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        if !resp.status().is_success() {
            let (parts, incoming) = resp.into_parts();
            let body = incoming.collect().await?.to_bytes();
            return Err(Error::Api(ErrorResponse::from_status(parts.status, &body)));
        }

        let frames = FramedRead::new(
            StreamReader::new(resp.into_body().into_data_stream().map_err(|err| {
                // Unexpected EOF from chunked decoder.
                // Tends to happen when watching for 300+s. This will be ignored
                if err.to_string().contains("unexpected EOF during check") {
                    return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err);
                }

                std::io::Error::other(err)
            })),
            LinesCodec::new(),
        );

        Ok(Box::pin(frames.filter_map(|result| async {
            match result {
                Ok(line) => decode_event(&line),
                Err(LinesCodecError::Io(err)) => match err.kind() {
                    // Client timeout
                    std::io::ErrorKind::TimedOut => {
                        warn!(message = "timeout in poll", %err);
                        None
                    }
                    // Unexpected EOF from chunked decoder.
                    // Tends to happen after 300+s of watching.
                    std::io::ErrorKind::UnexpectedEof => {
                        warn!(message = "eof in poll", %err);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(err))),
                },

                // Reached the maximum line length without finding a newline.
                // This should never happen because we're using the default `usize::MAX`.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    Some(Err(Error::LinesCodecMaxLineLengthExceeded))
                }
            }
        })))
    }
}

/// Decode one line of a watch response.
fn decode_event<T: DeserializeOwned>(line: &str) -> Option<Result<WatchEvent<T>, Error>> {
    if line.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<WatchEvent<T>>(line) {
        Ok(event) => Some(Ok(event)),
        Err(err) => {
            // Ignore EOF error that can happen for incomplete line from `decode_eof`.
            if err.is_eof() {
                return None;
            }

            // Got general error response
            if let Ok(resp) = serde_json::from_str::<ErrorResponse>(line)
                && resp.code != 0
            {
                return Some(Err(Error::Api(resp)));
            }

            Some(Err(Error::Deserialize(err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::DynamicObject;

    #[test]
    fn list_query() {
        let params = ListParams {
            label_selector: Some("app=web".into()),
            field_selector: None,
            limit: Some(500),
            continue_token: Some("abc".into()),
        };

        assert_eq!(params.query(), "labelSelector=app%3Dweb&limit=500&continue=abc");
        assert_eq!(ListParams::default().query(), "");
    }

    #[test]
    fn watch_query() {
        let params = WatchParams {
            label_selector: None,
            field_selector: Some("metadata.name=web".into()),
            timeout: None,
            bookmarks: true,
        };

        assert_eq!(
            params.query("1234"),
            "resourceVersion=1234&watch=true&timeoutSeconds=290&fieldSelector=metadata.name%3Dweb&allowWatchBookmarks=true"
        );
    }

    #[test]
    fn watch_timeout_limit() {
        let params = WatchParams {
            timeout: Some(295),
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(Error::Validation(_))));

        let params = WatchParams {
            timeout: Some(294),
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn decode_added() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"web","namespace":"default","resourceVersion":"10"}}}"#;

        let event = decode_event::<DynamicObject>(line).unwrap().unwrap();
        let WatchEvent::Added(obj) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(obj.key().as_str(), "default/web");
        assert_eq!(obj.resource_version(), Some("10"));
    }

    #[test]
    fn decode_bookmark() {
        let line = r#"{"type":"BOOKMARK","object":{"kind":"Deployment","apiVersion":"apps/v1","metadata":{"resourceVersion":"12746"}}}"#;

        let event = decode_event::<DynamicObject>(line).unwrap().unwrap();
        assert_eq!(
            event,
            WatchEvent::Bookmark(Bookmark {
                metadata: BookmarkMeta {
                    resource_version: "12746".into()
                }
            })
        );
    }

    #[test]
    fn decode_expired() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","apiVersion":"v1","metadata":{},"status":"Failure","message":"too old resource version: 1 (2)","reason":"Expired","code":410}}"#;

        let event = decode_event::<DynamicObject>(line).unwrap().unwrap();
        let WatchEvent::Error(resp) = event else {
            panic!("unexpected event {event:?}");
        };
        assert!(resp.is_expired());
        assert!(Error::Api(resp).is_expired());
    }

    #[test]
    fn decode_status_object() {
        let line = r#"{"kind":"Status","status":"Failure","reason":"Forbidden","code":403}"#;

        let err = decode_event::<DynamicObject>(line).unwrap().unwrap_err();
        assert!(matches!(err, Error::Api(ref resp) if resp.code == 403));
        assert!(!err.is_expired());
    }

    #[test]
    fn decode_malformed() {
        let err = decode_event::<DynamicObject>(r#"{"type":"ADDED","object":42}"#)
            .unwrap()
            .unwrap_err();
        assert!(err.is_malformed());

        assert!(decode_event::<DynamicObject>("").is_none());
        // a truncated line at the end of the stream
        assert!(decode_event::<DynamicObject>(r#"{"type":"ADDED","obj"#).is_none());
    }

    #[test]
    fn error_response_from_status() {
        let resp = ErrorResponse::from_status(StatusCode::GONE, b"gone");
        assert_eq!(resp.code, 410);
        assert_eq!(resp.message, "gone");
        assert!(resp.is_expired());

        let resp = ErrorResponse::from_status(
            StatusCode::FORBIDDEN,
            br#"{"status":"Failure","reason":"Forbidden","message":"nope"}"#,
        );
        assert_eq!(resp.code, 403);
        assert_eq!(resp.reason, "Forbidden");
        assert!(!resp.is_expired());
    }
}
