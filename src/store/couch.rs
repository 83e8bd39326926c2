use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::{Value, json};
use std::error::Error as _;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::changes::{ChangeFilter, ChangeStream, ChangesRequest, FeedLine, parse_feed_line};
use super::errors::StoreError;
use super::{DocumentStore, KeyCount, ViewName, ViewRow};
use crate::shared::config::StoreConfig;

const LOG_TARGET: &str = "couchbus::store::couch";
const UPSERT_ATTEMPTS: usize = 3;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// CouchDB database reached over HTTP.
#[derive(Clone)]
pub struct CouchStore {
    client: HttpClient,
    base: Url,
    config: Arc<StoreConfig>,
    authorization: Option<HeaderValue>,
}

impl std::fmt::Debug for CouchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchStore")
            .field("base", &self.base.as_str())
            .field("database", &self.config.database)
            .finish()
    }
}

impl CouchStore {
    /// Builds a handle without touching the network.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        if config.database.is_empty() {
            return Err(StoreError::InvalidRequest("database name is empty".to_string()));
        }
        let base = Url::parse(&config.uri)
            .map_err(|e| StoreError::InvalidRequest(format!("invalid store uri {}: {e}", config.uri)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::InvalidRequest(format!(
                "store uri {} cannot carry a path",
                config.uri
            )));
        }
        let authorization = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                let token = STANDARD.encode(format!("{user}:{pass}"));
                let value = HeaderValue::from_str(&format!("Basic {token}"))
                    .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
                Some(value)
            }
            _ => None,
        };

        Ok(Self {
            client: build_client(),
            base,
            config: Arc::new(config.clone()),
            authorization,
        })
    }

    /// Builds a handle and checks that the database is reachable with the
    /// configured credentials.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        let url = store.url(&[], &[])?;
        let resp = store.send(Method::GET, url, None, None).await?;
        let info = read_json(resp).await?;
        debug!(target: LOG_TARGET, database = %store.config.database, ?info, "Connected to store");
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// `<base>/<database>/<segments...>?<query>`
    pub fn url(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidRequest("store uri cannot carry a path".to_string()))?;
            path.pop_if_empty().push(&self.config.database).extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn update_handler_url(&self, id: Option<&str>) -> Result<Option<Url>, StoreError> {
        let Some(handler) = self.config.update_handler.as_deref() else {
            return Ok(None);
        };
        let mut segments = vec!["_design", self.config.design_doc.as_str(), "_update", handler];
        if let Some(id) = id {
            segments.push(id);
        }
        self.url(&segments, &[]).map(Some)
    }

    /// Query string of a continuous `_changes` request.
    pub fn changes_query(&self, request: &ChangesRequest) -> Result<Vec<(&'static str, String)>, StoreError> {
        let mut query = vec![
            ("feed", "continuous".to_string()),
            ("since", request.since.as_param().to_string()),
            ("include_docs", request.include_docs.to_string()),
            ("heartbeat", request.heartbeat.as_millis().to_string()),
        ];
        match &request.filter {
            ChangeFilter::Commands { names } => {
                query.push(("filter", self.config.command_filter.clone()));
                if !names.is_empty() {
                    query.push(("only_commands", serde_json::to_string(names)?));
                }
            }
            ChangeFilter::DocIds(ids) => {
                query.push(("filter", "_doc_ids".to_string()));
                query.push(("doc_ids", serde_json::to_string(ids)?));
            }
        }
        Ok(query)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        range: Option<(u64, u64)>,
    ) -> Result<Response<Incoming>, StoreError> {
        let uri: hyper::Uri = url
            .as_str()
            .parse()
            .map_err(|e| StoreError::InvalidRequest(format!("{url}: {e}")))?;
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::ACCEPT, "application/json");
        if let Some(auth) = &self.authorization {
            builder = builder.header(header::AUTHORIZATION, auth.clone());
        }
        if let Some((start, end)) = range {
            builder = builder.header(header::RANGE, format!("bytes={start}-{end}"));
        }
        let payload = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(value)?)
            }
            None => Bytes::new(),
        };
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;

        self.client.request(req).await.map_err(classify_client_error)
    }

    async fn get_json(&self, url: Url) -> Result<Value, StoreError> {
        let resp = self.send(Method::GET, url, None, None).await?;
        read_json(resp).await
    }

    async fn current_rev(&self, id: &str) -> Result<String, StoreError> {
        let doc = self.get_json(self.url(&[id], &[])?).await?;
        doc.get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidRequest(format!("document {id} has no _rev")))
    }

    async fn plain_upsert(&self, id: &str, fields: &Value) -> Result<(), StoreError> {
        let mut last = None;
        for attempt in 1..=UPSERT_ATTEMPTS {
            let url = self.url(&[id], &[])?;
            let mut doc = match self.get_json(url.clone()).await {
                Ok(existing) => existing,
                Err(StoreError::NotFound(_)) => json!({ "_id": id }),
                Err(e) => return Err(e),
            };
            if let (Some(target), Some(update)) = (doc.as_object_mut(), fields.as_object()) {
                for (key, value) in update {
                    target.insert(key.clone(), value.clone());
                }
            }
            let resp = self.send(Method::PUT, url, Some(&doc), None).await?;
            match read_json(resp).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(reason)) => {
                    debug!(target: LOG_TARGET, doc_id = id, attempt, "Update conflict, retrying");
                    last = Some(StoreError::Conflict(reason));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| StoreError::Conflict(id.to_string())))
    }
}

/// Classifies a failed request. Bodies cut short are transient, anything
/// else (refused, reset, DNS) is not.
fn classify_client_error(err: hyper_util::client::legacy::Error) -> StoreError {
    if !err.is_connect() {
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
                return classify_hyper_error(hyper_err);
            }
            source = cause.source();
        }
    }
    StoreError::Connection(err.to_string())
}

fn classify_hyper_error(err: &hyper::Error) -> StoreError {
    if err.is_incomplete_message() || err.is_body_write_aborted() {
        StoreError::Interrupted(err.to_string())
    } else {
        StoreError::Connection(err.to_string())
    }
}

async fn read_body(resp: Response<Incoming>) -> Result<(StatusCode, Bytes), StoreError> {
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| classify_hyper_error(&e))?
        .to_bytes();
    Ok((status, bytes))
}

fn status_error(status: StatusCode, body: &[u8]) -> StoreError {
    let reason = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error").and_then(Value::as_str)?.to_string();
            let reason = v.get("reason").and_then(Value::as_str).unwrap_or_default();
            Some(format!("{error}: {reason}"))
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    StoreError::from_status(status.as_u16(), reason)
}

async fn read_json(resp: Response<Incoming>) -> Result<Value, StoreError> {
    let (status, body) = read_body(resp).await?;
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&body)?)
}

struct FeedBody {
    body: Incoming,
    buffer: Vec<u8>,
    done: bool,
}

fn feed_stream(body: Incoming) -> ChangeStream {
    let state = FeedBody {
        body,
        buffer: Vec::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            if let Some(pos) = st.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buffer.drain(..=pos).collect();
                match parse_feed_line(&line) {
                    Ok(FeedLine::Notification(notification)) => return Some((Ok(notification), st)),
                    Ok(FeedLine::Skip) => continue,
                    Ok(FeedLine::End) => return None,
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
            }
            match st.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        st.buffer.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(classify_hyper_error(&e)), st));
                }
                None => {
                    st.done = true;
                    if !st.buffer.trim_ascii().is_empty() {
                        let err = StoreError::Interrupted("feed closed mid-line".to_string());
                        return Some((Err(err), st));
                    }
                    return None;
                }
            }
        }
    })
    .boxed()
}

fn rows(value: &Value) -> &[Value] {
    value
        .get("rows")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn changes(&self, request: ChangesRequest) -> Result<ChangeStream, StoreError> {
        let query = self.changes_query(&request)?;
        let url = self.url(&["_changes"], &query)?;
        debug!(target: LOG_TARGET, %url, "Opening change subscription");

        let resp = self.send(Method::GET, url, None, None).await?;
        if !resp.status().is_success() {
            let (status, body) = read_body(resp).await?;
            return Err(status_error(status, &body));
        }
        Ok(feed_stream(resp.into_body()))
    }

    async fn insert(&self, doc: Value) -> Result<String, StoreError> {
        let (url, via_handler) = match self.update_handler_url(None)? {
            Some(url) => (url, true),
            None => (self.url(&[], &[])?, false),
        };
        let resp = self.send(Method::POST, url, Some(&doc), None).await?;
        let header_id = resp
            .headers()
            .get("x-couch-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_json(resp).await?;
        if via_handler && body.get("ok").is_none() && header_id.is_none() {
            warn!(target: LOG_TARGET, ?body, "Update handler did not acknowledge insert");
        }
        header_id
            .or_else(|| body.get("id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| StoreError::InvalidRequest(format!("insert returned no id: {body}")))
    }

    async fn upsert(&self, id: &str, fields: Value) -> Result<(), StoreError> {
        match self.update_handler_url(Some(id))? {
            Some(url) => {
                let resp = self.send(Method::PUT, url, Some(&fields), None).await?;
                read_json(resp).await.map(|_| ())
            }
            None => self.plain_upsert(id, &fields).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        match self.get_json(self.url(&[id], &[])?).await {
            Ok(doc) => Ok(Some(doc)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let rev = self.current_rev(id).await?;
        let url = self.url(&[id], &[("rev", rev)])?;
        let resp = self.send(Method::DELETE, url, None, None).await?;
        read_json(resp).await.map(|_| ())
    }

    async fn aggregate(&self, view: &ViewName) -> Result<Vec<KeyCount>, StoreError> {
        let url = self.url(
            &["_design", view.design.as_str(), "_view", view.view.as_str()],
            &[("group", "true".to_string())],
        )?;
        let body = self.get_json(url).await?;
        Ok(rows(&body)
            .iter()
            .filter_map(|row| {
                Some(KeyCount {
                    key: row.get("key")?.as_str()?.to_string(),
                    count: row.get("value")?.as_u64()?,
                })
            })
            .collect())
    }

    async fn view_rows(
        &self,
        view: &ViewName,
        keys: &[String],
    ) -> Result<Vec<ViewRow>, StoreError> {
        let url = self.url(
            &["_design", view.design.as_str(), "_view", view.view.as_str()],
            &[("reduce", "false".to_string())],
        )?;
        let body = json!({ "keys": keys });
        let resp = self.send(Method::POST, url, Some(&body), None).await?;
        let body = read_json(resp).await?;
        Ok(rows(&body)
            .iter()
            .filter_map(|row| {
                Some(ViewRow {
                    id: row.get("id")?.as_str()?.to_string(),
                    key: row.get("key")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn attachment_length(&self, doc_id: &str, name: &str) -> Result<u64, StoreError> {
        let url = self.url(&[doc_id, name], &[])?;
        let resp = self.send(Method::HEAD, url, None, None).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::from_status(
                status.as_u16(),
                format!("{doc_id}/{name}"),
            ));
        }
        resp.headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StoreError::InvalidRequest(format!("{doc_id}/{name}: no content-length")))
    }

    async fn attachment_range(
        &self,
        doc_id: &str,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StoreError> {
        let url = self.url(&[doc_id, name], &[])?;
        let resp = self.send(Method::GET, url, None, Some((start, end))).await?;
        let (status, body) = read_body(resp).await?;
        match status {
            StatusCode::PARTIAL_CONTENT => Ok(body),
            // Server ignored the range and sent everything.
            StatusCode::OK => {
                let len = body.len() as u64;
                if start > end || start >= len {
                    return Err(StoreError::Http {
                        status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                        reason: format!("range {start}-{end} not satisfiable for length {len}"),
                    });
                }
                Ok(body.slice(start as usize..=end.min(len - 1) as usize))
            }
            _ => Err(status_error(status, &body)),
        }
    }

    fn reacquire(&self) -> Arc<dyn DocumentStore> {
        Arc::new(Self {
            client: build_client(),
            ..self.clone()
        })
    }
}
