use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde_json::{Value, map::Entry};
use tokio::{
    net::TcpListener,
    sync::{Mutex as AsyncMutex, oneshot},
};
use tracing::Instrument as _;

use crate::{
    archive::{ArchiveError, ResponseArchive},
    config::Config,
    matching::{self, QueryMap},
    naming,
    store::{Matcher, MatcherStore, RequestDescriptor, ResponseDescriptor},
};

type LiveHttpsConnector = HttpsConnector<HttpConnector>;
type LiveClient = Client<LiveHttpsConnector, Full<Bytes>>;

/// Override points for stub naming, matching, and artifact extension mapping.
/// The defaults implement the standard behavior; callers with special-case
/// stubs swap individual functions instead of subclassing anything.
#[derive(Debug, Clone, Copy)]
pub struct StubBehavior {
    /// Derives the artifact base name recorded for a request.
    pub matcher_name: fn(&RequestDescriptor) -> String,
    /// Decides whether an incoming request matches a stored descriptor.
    pub requests_match: fn(&RequestDescriptor, &RequestDescriptor) -> bool,
    /// Maps a live response content type to the artifact file extension.
    pub artifact_extension: fn(Option<&str>) -> &'static str,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            matcher_name: naming::matcher_name,
            requests_match: matching::requests_match,
            artifact_extension: naming::artifact_extension,
        }
    }
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    state: Arc<StubberState>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;

        let store = self.state.store.lock().await;
        tracing::info!(
            matched = ?store.matched_artifacts(),
            unmatched = ?store.unmatched_artifacts(),
            "stub usage at shutdown"
        );
    }

    /// How many requests the named artifact has satisfied since startup.
    pub async fn artifact_tally(&self, artifact_name: &str) -> u64 {
        self.state.store.lock().await.tally(artifact_name)
    }

    pub async fn matched_artifacts(&self) -> Vec<String> {
        self.state.store.lock().await.matched_artifacts()
    }

    pub async fn unmatched_artifacts(&self) -> Vec<String> {
        self.state.store.lock().await.unmatched_artifacts()
    }
}

#[derive(Debug)]
struct StubberState {
    // One mutex over matchers and tallies: name generation, the self-match
    // check, artifact persistence, and the append all happen under it, which
    // keeps artifact names unique when identical misses race.
    store: AsyncMutex<MatcherStore>,
    archive: ResponseArchive,
    live: Option<LiveSite>,
    behavior: StubBehavior,
    max_body_bytes: usize,
}

#[derive(Debug)]
struct LiveSite {
    base: String,
    client: LiveClient,
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    serve_with_behavior(config, StubBehavior::default()).await
}

pub async fn serve_with_behavior(
    config: &Config,
    behavior: StubBehavior,
) -> anyhow::Result<ProxyHandle> {
    let store = MatcherStore::load(&config.stubs.matchers_file)?;
    let archive = ResponseArchive::new(&config.stubs.responses_dir)?;
    let live = match config.stubs.live_site_base() {
        Some(base) => {
            ensure_rustls_crypto_provider()?;
            Some(LiveSite {
                base: base.to_owned(),
                client: build_live_client()?,
            })
        }
        None => None,
    };
    tracing::info!(
        matchers = store.len(),
        replay_only = live.is_none(),
        matchers_file = %config.stubs.matchers_file.display(),
        responses_dir = %archive.dir().display(),
        "loaded matcher store"
    );

    let listener = TcpListener::bind(config.proxy.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.proxy.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let state = Arc::new(StubberState {
        store: AsyncMutex::new(store),
        archive,
        live,
        behavior,
        max_body_bytes: config.proxy.max_body_bytes,
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let accept_state = Arc::clone(&state);
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&accept_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| stub_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
        state,
    })
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_live_client() -> anyhow::Result<LiveClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Errors a request can end in. Every variant surfaces as a 500 whose body is
/// the diagnostic built by `error_response`; none of them are retried.
#[derive(Debug)]
pub enum StubError {
    /// Replay-only mode and nothing matched: a test or configuration bug on
    /// the operator's side, not a transient fault.
    NoMatch,
    /// A matcher exists but its backing artifact cannot be read.
    Integrity(ArchiveError),
    /// The live-site call failed (network error or non-success status).
    Upstream(String),
    /// A freshly built matcher failed the self-match sanity check.
    Consistency,
    /// A stored matcher carries a status code outside the valid HTTP range.
    StoredStatus {
        artifact_name: String,
        status_code: u16,
    },
    /// Persisting the new artifact or matcher document failed.
    Persist(anyhow::Error),
}

impl std::fmt::Display for StubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMatch => f.write_str("request did not match any stub"),
            Self::Integrity(err) => write!(f, "{err}"),
            Self::Upstream(message) => f.write_str(message),
            Self::Consistency => f.write_str("created matcher must match the current request"),
            Self::StoredStatus {
                artifact_name,
                status_code,
            } => write!(
                f,
                "artifact `{artifact_name}` has invalid stored status code {status_code}"
            ),
            Self::Persist(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for StubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Integrity(err) => Some(err),
            Self::Persist(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

async fn stub_handler(
    req: Request<Incoming>,
    state: Arc<StubberState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let request_span = tracing::info_span!(
        "stubber.request",
        method = %req.method(),
        target = %req.uri(),
    );
    handle_incoming(req, state).instrument(request_span).await
}

async fn handle_incoming(
    req: Request<Incoming>,
    state: Arc<StubberState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let (parts, body) = req.into_parts();
    let body_bytes = match read_body_with_limit(body, state.max_body_bytes).await {
        Ok(BodyReadOutcome::Buffered(bytes)) => bytes,
        Ok(BodyReadOutcome::TooLarge { limit_bytes }) => {
            tracing::debug!("request body exceeded configured limit of {limit_bytes} bytes");
            return Ok(simple_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body exceeds configured proxy.max_body_bytes",
            ));
        }
        Err(err) => {
            tracing::debug!("failed to read request body: {err}");
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };

    let body_value = match parse_json_body(&parts.headers, &body_bytes) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!("invalid JSON request body: {err}");
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "invalid JSON request body",
            ));
        }
    };

    let descriptor = RequestDescriptor {
        method,
        path: parts.uri.path().to_owned(),
        query: parse_query(parts.uri.query()),
        body: body_value,
    };

    match handle_request(state.as_ref(), &descriptor, &target).await {
        Ok(response) => Ok(response),
        Err(err) => Ok(error_response(&err, &descriptor)),
    }
}

/// The per-request decision flow: replay a stored response, or forward to the
/// live site and record the result. Errors bubble to the single diagnostic
/// path in `stub_handler`.
async fn handle_request(
    state: &StubberState,
    descriptor: &RequestDescriptor,
    target: &str,
) -> Result<Response<Full<Bytes>>, StubError> {
    {
        let mut store = state.store.lock().await;
        let matched = store
            .find_match(descriptor, state.behavior.requests_match)
            .map(|matcher| matcher.res.clone());
        if let Some(res) = matched {
            let body = state.archive.read(&res.name).map_err(StubError::Integrity)?;
            store.increment_tally(&res.name);
            tracing::debug!(artifact = %res.name, status = res.status_code, "replaying stored response");
            return replay_response(&res, body);
        }
    }

    let Some(live) = state.live.as_ref() else {
        return Err(StubError::NoMatch);
    };
    tracing::debug!("no stub matched, forwarding to live site");
    let live_response = forward_to_live(live, descriptor, target).await?;

    let mut store = state.store.lock().await;
    let now_ms = naming::now_unix_ms().map_err(StubError::Persist)?;
    let raw_name = (state.behavior.matcher_name)(descriptor);
    let base_name = naming::shorten_and_make_unique(&raw_name, store.artifact_names(), now_ms);
    let extension = (state.behavior.artifact_extension)(live_response.content_type.as_deref());
    let matcher = Matcher {
        req: descriptor.clone(),
        res: ResponseDescriptor {
            name: format!("{base_name}{extension}"),
            status_code: live_response.status.as_u16(),
        },
    };
    if !(state.behavior.requests_match)(descriptor, &matcher.req) {
        return Err(StubError::Consistency);
    }

    state
        .archive
        .write(&matcher.res.name, &live_response.body)
        .map_err(StubError::Persist)?;
    let res = matcher.res.clone();
    store.append(matcher).map_err(StubError::Persist)?;
    store.set_tally(&res.name, 1);
    tracing::debug!(artifact = %res.name, status = res.status_code, "recorded new stub");

    Ok(live_reply(live_response))
}

#[derive(Debug)]
struct LiveResponse {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

async fn forward_to_live(
    live: &LiveSite,
    descriptor: &RequestDescriptor,
    target: &str,
) -> Result<LiveResponse, StubError> {
    let uri: Uri = format!("{}{target}", live.base)
        .parse()
        .map_err(|err| StubError::Upstream(format!("build live request uri: {err}")))?;
    let method = Method::from_bytes(descriptor.method.as_bytes())
        .map_err(|err| StubError::Upstream(format!("build live request method: {err}")))?;

    let mut builder = Request::builder().method(method).uri(uri);
    let body = match descriptor.body.as_ref() {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Bytes::from(
                serde_json::to_vec(body)
                    .map_err(|err| StubError::Upstream(format!("serialize live request body: {err}")))?,
            )
        }
        None => Bytes::new(),
    };
    let request = builder
        .body(Full::new(body))
        .map_err(|err| StubError::Upstream(format!("build live request: {err}")))?;

    let response = live
        .client
        .request(request)
        .await
        .map_err(|err| StubError::Upstream(format!("request live site: {err}")))?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| StubError::Upstream(format!("read live response body: {err}")))?
        .to_bytes();

    if !status.is_success() {
        return Err(StubError::Upstream(format!(
            "live site responded with status {status}"
        )));
    }

    Ok(LiveResponse {
        status,
        content_type,
        body,
    })
}

fn replay_response(
    res: &ResponseDescriptor,
    body: Bytes,
) -> Result<Response<Full<Bytes>>, StubError> {
    let status = StatusCode::from_u16(res.status_code).map_err(|_| StubError::StoredStatus {
        artifact_name: res.name.clone(),
        status_code: res.status_code,
    })?;

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if res.name.ends_with(".json") {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    Ok(response)
}

fn live_reply(live_response: LiveResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(live_response.body));
    *response.status_mut() = live_response.status;
    if let Some(content_type) = live_response
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

fn error_response(err: &StubError, descriptor: &RequestDescriptor) -> Response<Full<Bytes>> {
    tracing::error!(
        error = %err,
        method = %descriptor.method,
        path = %descriptor.path,
        "request failed"
    );

    let diagnostic = error_diagnostic(err, descriptor);
    let body = serde_json::to_string_pretty(&diagnostic).unwrap_or_else(|_| diagnostic.to_string());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Diagnostic payload for every error path: the message plus enough of the
/// offending request (path, query, body) to reproduce the call from the log
/// or response alone.
fn error_diagnostic(err: &StubError, descriptor: &RequestDescriptor) -> Value {
    let mut req = serde_json::Map::new();
    req.insert("path".to_owned(), Value::String(descriptor.path.clone()));
    req.insert("query".to_owned(), Value::Object(descriptor.query.clone()));
    if let Some(body) = descriptor.body.as_ref() {
        req.insert("body".to_owned(), body.clone());
    }

    let mut diagnostic = serde_json::Map::new();
    diagnostic.insert("error".to_owned(), Value::String(err.to_string()));
    diagnostic.insert("req".to_owned(), Value::Object(req));
    Value::Object(diagnostic)
}

enum BodyReadOutcome {
    Buffered(Bytes),
    TooLarge { limit_bytes: usize },
}

async fn read_body_with_limit(
    mut body: Incoming,
    limit_bytes: usize,
) -> Result<BodyReadOutcome, hyper::Error> {
    let mut buffered = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Ok(chunk) = frame.into_data() {
            if buffered.len() + chunk.len() > limit_bytes {
                return Ok(BodyReadOutcome::TooLarge { limit_bytes });
            }
            buffered.extend_from_slice(&chunk);
        }
    }
    Ok(BodyReadOutcome::Buffered(Bytes::from(buffered)))
}

/// Parses a raw query string into the descriptor's query mapping: form
/// decoding (`+` as space), repeated keys accumulated into arrays, insertion
/// order preserved.
fn parse_query(raw_query: Option<&str>) -> QueryMap {
    let mut query = QueryMap::new();
    let Some(raw_query) = raw_query else {
        return query;
    };

    for segment in raw_query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = segment.split_once('=').unwrap_or((segment, ""));
        let key = form_decode(raw_key);
        let value = Value::String(form_decode(raw_value));

        match query.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if let Value::Array(items) = existing {
                    items.push(value);
                } else {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }
    }
    query
}

fn form_decode(raw: &str) -> String {
    let unplussed = raw.replace('+', " ");
    match urlencoding::decode(&unplussed) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => unplussed,
    }
}

fn parse_json_body(
    headers: &hyper::HeaderMap,
    body_bytes: &[u8],
) -> Result<Option<Value>, serde_json::Error> {
    if body_bytes.is_empty() {
        return Ok(None);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if !naming::is_json_content_type(content_type) {
        return Ok(None);
    }
    serde_json::from_slice(body_bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{StubBehavior, StubError, error_diagnostic, parse_json_body, parse_query};
    use crate::store::RequestDescriptor;

    #[test]
    fn parse_query_preserves_insertion_order() {
        let query = parse_query(Some("b=2&a=1"));
        let keys: Vec<&str> = query.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn parse_query_accumulates_repeated_keys_into_arrays() {
        let query = parse_query(Some("fq=a&fq=b&x=1"));
        assert_eq!(query.get("fq"), Some(&json!(["a", "b"])));
        assert_eq!(query.get("x"), Some(&json!("1")));
    }

    #[test]
    fn parse_query_form_decodes_keys_and_values() {
        let query = parse_query(Some("q=hello+world&na%6De=a%2Fb"));
        assert_eq!(query.get("q"), Some(&json!("hello world")));
        assert_eq!(query.get("name"), Some(&json!("a/b")));
    }

    #[test]
    fn parse_query_handles_missing_values_and_empty_segments() {
        let query = parse_query(Some("a&&b="));
        assert_eq!(query.get("a"), Some(&json!("")));
        assert_eq!(query.get("b"), Some(&json!("")));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn json_bodies_require_a_json_content_type() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );

        let parsed = parse_json_body(&headers, br#"{"hello":"world"}"#).unwrap();
        assert_eq!(parsed, Some(json!({"hello": "world"})));

        let mut text_headers = hyper::HeaderMap::new();
        text_headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain"),
        );
        assert_eq!(parse_json_body(&text_headers, b"not json").unwrap(), None);

        assert_eq!(parse_json_body(&headers, b"").unwrap(), None);
        assert!(parse_json_body(&headers, b"{broken").is_err());
    }

    #[test]
    fn diagnostic_includes_request_and_omits_absent_body() {
        let descriptor = RequestDescriptor {
            method: "GET".to_owned(),
            path: "/comments".to_owned(),
            query: parse_query(Some("postId=3")),
            body: None,
        };

        let diagnostic = error_diagnostic(&StubError::NoMatch, &descriptor);
        assert_eq!(
            diagnostic.pointer("/error").and_then(Value::as_str),
            Some("request did not match any stub")
        );
        assert_eq!(
            diagnostic.pointer("/req/path").and_then(Value::as_str),
            Some("/comments")
        );
        assert_eq!(
            diagnostic.pointer("/req/query/postId").and_then(Value::as_str),
            Some("3")
        );
        assert!(diagnostic.pointer("/req/body").is_none());
    }

    #[test]
    fn diagnostic_carries_the_body_when_present() {
        let descriptor = RequestDescriptor {
            method: "POST".to_owned(),
            path: "/comments".to_owned(),
            query: parse_query(None),
            body: Some(json!({"hello": "world"})),
        };

        let diagnostic = error_diagnostic(&StubError::Consistency, &descriptor);
        assert_eq!(
            diagnostic.pointer("/req/body/hello").and_then(Value::as_str),
            Some("world")
        );
    }

    #[test]
    fn default_behavior_wires_the_standard_implementations() {
        let behavior = StubBehavior::default();
        assert_eq!((behavior.artifact_extension)(Some("application/json")), ".json");
        assert_eq!((behavior.artifact_extension)(Some("text/html")), "");

        let descriptor = RequestDescriptor {
            method: "GET".to_owned(),
            path: "/comments".to_owned(),
            query: parse_query(Some("postId=1")),
            body: None,
        };
        assert_eq!((behavior.matcher_name)(&descriptor), "comments_postId-1");
        assert!((behavior.requests_match)(&descriptor, &descriptor));
    }
}
