//! Network-first cache for the application shell and static assets.
//!
//! Requests are intercepted only when they are `GET`s over `http`/`https` issued
//! from a page; everything else is handed back untouched. An intercepted request
//! goes to the network first. A success response is served and a copy is stored
//! in the background under the active generation. If the fetch fails or is
//! slower than the fetch timeout, the stored copy is served instead; with no
//! stored copy the fetch error propagates.
//!
//! Generations follow an install/activate lifecycle. A newly installed
//! generation becomes active right away when no client is connected; otherwise
//! it waits until the last client is released or a `SKIP_WAITING` control
//! message arrives. Activation purges every other generation in one transaction
//! and broadcasts `NEW_VERSION_AVAILABLE`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::store::{StoreError, open_pool};

const BROADCAST_CAPACITY: usize = 16;
const ACTIVE_GENERATION_KEY: &str = "active_generation";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        generation  TEXT NOT NULL,
        url         TEXT NOT NULL,
        status      INTEGER NOT NULL,
        headers     TEXT NOT NULL,
        body        BLOB NOT NULL,
        stored_at   INTEGER NOT NULL,
        PRIMARY KEY (generation, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_meta (
        key     TEXT PRIMARY KEY,
        value   TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum AssetCacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("asset store: {0}")]
    Store(#[from] StoreError),
}

/// Who issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestContext {
    /// A page of the application.
    Page,
    /// A browser extension or similar foreign context.
    Extension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub method: Method,
    pub url: String,
    pub context: RequestContext,
}

impl AssetRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            context: RequestContext::Page,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AssetResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// How an intercepted request was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Not ours to handle; the caller performs the request itself.
    PassThrough,
    /// Live response.
    Network(AssetResponse),
    /// Stored copy served because the network failed or was too slow.
    Cache(AssetResponse),
}

/// Message broadcast to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastMessage {
    NewVersionAvailable { version: String },
}

/// Message sent by a client to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
}

/// Result of installing a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Activated,
    /// Waiting for clients to be released or for `SKIP_WAITING`.
    Waiting,
    AlreadyActive,
}

pub type ClientId = u64;

/// Whether a request is handled by the cache at all.
pub fn should_intercept(request: &AssetRequest) -> bool {
    if request.method != Method::GET || request.context != RequestContext::Page {
        return false;
    }
    match Url::parse(&request.url) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, FetchError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, FetchError> {
        let url = Url::parse(&request.url).map_err(|_| FetchError::InvalidUrl(request.url.clone()))?;
        let resp = self
            .client
            .request(request.method.clone(), url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .to_vec();

        Ok(AssetResponse {
            status,
            headers,
            body,
        })
    }
}

/// SQLite-backed storage of cache entries and the active generation.
#[derive(Debug, Clone)]
pub struct AssetStore {
    pool: SqlitePool,
}

impl AssetStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let pool = open_pool(path.as_ref(), SCHEMA).await?;
        Ok(Self { pool })
    }

    pub async fn active_generation(&self) -> Result<Option<String>, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM cache_meta WHERE key = ?1")
            .bind(ACTIVE_GENERATION_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Store an entry unconditionally (precaching an installing generation).
    pub async fn put(&self, generation: &str, url: &str, response: &AssetResponse) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries (generation, url, status, headers, body, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(generation)
        .bind(url)
        .bind(i64::from(response.status))
        .bind(encode_headers(&response.headers)?)
        .bind(response.body.as_slice())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store an entry only while `generation` is still the active one.
    ///
    /// Returns `false` when the generation has been superseded.
    pub async fn put_if_active(
        &self,
        generation: &str,
        url: &str,
        response: &AssetResponse,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries (generation, url, status, headers, body, stored_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6
            WHERE EXISTS (SELECT 1 FROM cache_meta WHERE key = ?7 AND value = ?1)
            "#,
        )
        .bind(generation)
        .bind(url)
        .bind(i64::from(response.status))
        .bind(encode_headers(&response.headers)?)
        .bind(response.body.as_slice())
        .bind(Utc::now().timestamp_millis())
        .bind(ACTIVE_GENERATION_KEY)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, generation: &str, url: &str) -> Result<Option<AssetResponse>, StoreError> {
        let row = sqlx::query(
            "SELECT status, headers, body FROM cache_entries WHERE generation = ?1 AND url = ?2",
        )
        .bind(generation)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: i64 = row.try_get("status")?;
        let headers: String = row.try_get("headers")?;
        Ok(Some(AssetResponse {
            status: u16::try_from(status)
                .map_err(|_| StoreError::Corruption(format!("invalid cached status {status}")))?,
            headers: serde_json::from_str(&headers)
                .map_err(|e| StoreError::Corruption(format!("cached headers: {e}")))?,
            body: row.try_get("body")?,
        }))
    }

    /// Make `generation` active and delete every other generation atomically.
    ///
    /// Returns the number of purged entries.
    pub async fn activate(&self, generation: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?1, ?2)")
            .bind(ACTIVE_GENERATION_KEY)
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        let purged = sqlx::query("DELETE FROM cache_entries WHERE generation != ?1")
            .bind(generation)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(purged)
    }

    pub async fn entry_count(&self, generation: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE generation = ?1")
            .bind(generation)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn encode_headers(headers: &[(String, String)]) -> Result<String, StoreError> {
    serde_json::to_string(headers).map_err(|e| StoreError::Database(e.to_string()))
}

#[derive(Debug, Default)]
struct Lifecycle {
    active: Option<String>,
    waiting: Option<String>,
    clients: HashSet<ClientId>,
    next_client: ClientId,
}

/// The interceptor. Share it as `Arc<AssetCache>`.
pub struct AssetCache {
    store: AssetStore,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    broadcast: broadcast::Sender<BroadcastMessage>,
    pending_writes: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("store", &self.store)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("lifecycle", &*self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl AssetCache {
    /// Resume with the generation that was active when the store was last used.
    pub async fn new(
        store: AssetStore,
        fetcher: Arc<dyn Fetcher>,
        fetch_timeout: Duration,
    ) -> Result<Self, AssetCacheError> {
        let active = store.active_generation().await?;
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            store,
            fetcher,
            fetch_timeout,
            lifecycle: Mutex::new(Lifecycle {
                active,
                ..Lifecycle::default()
            }),
            broadcast,
            pending_writes: Mutex::new(JoinSet::new()),
        })
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn active_generation(&self) -> Option<String> {
        self.lifecycle().active.clone()
    }

    pub fn waiting_generation(&self) -> Option<String> {
        self.lifecycle().waiting.clone()
    }

    /// Answer a request network-first.
    pub async fn handle(&self, request: &AssetRequest) -> Result<Interception, AssetCacheError> {
        if !should_intercept(request) {
            return Ok(Interception::PassThrough);
        }

        let generation = self.active_generation();
        let fetch_err = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(request)).await
        {
            Ok(Ok(response)) => {
                if response.is_success() {
                    if let Some(generation) = generation {
                        self.store_in_background(generation, request.url.clone(), response.clone());
                    }
                }
                return Ok(Interception::Network(response));
            }
            Ok(Err(err)) => err,
            Err(_) => FetchError::Timeout(self.fetch_timeout),
        };

        tracing::debug!(url = %request.url, error = %fetch_err, "fetch failed, trying cache");
        if let Some(generation) = generation {
            match self.store.get(&generation, &request.url).await {
                Ok(Some(cached)) => return Ok(Interception::Cache(cached)),
                Ok(None) => {}
                Err(err) => tracing::warn!(url = %request.url, error = %err, "cache lookup failed"),
            }
        }
        Err(fetch_err.into())
    }

    fn store_in_background(&self, generation: String, url: String, response: AssetResponse) {
        let store = self.store.clone();
        let mut writes = self.pending_writes();
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            match store.put_if_active(&generation, &url, &response).await {
                Ok(true) => tracing::debug!(%url, %generation, "asset cached"),
                Ok(false) => tracing::debug!(%url, %generation, "generation superseded, cache write dropped"),
                Err(err) => tracing::warn!(%url, error = %err, "failed to cache asset"),
            }
        });
    }

    /// Wait for every background cache write, including ones started while
    /// the flush is running.
    pub async fn flush_pending_writes(&self) {
        loop {
            let mut writes = std::mem::take(&mut *self.pending_writes());
            if writes.is_empty() {
                break;
            }
            while let Some(result) = writes.join_next().await {
                if let Err(err) = result {
                    tracing::warn!("cache write task failed: {err}");
                }
            }
        }
    }

    /// Precache `shell_urls` into `generation`, then activate it or leave it
    /// waiting for connected clients.
    pub async fn install(
        &self,
        generation: &str,
        shell_urls: &[String],
    ) -> Result<InstallOutcome, AssetCacheError> {
        if self.active_generation().as_deref() == Some(generation) {
            tracing::debug!(generation, "generation already active");
            return Ok(InstallOutcome::AlreadyActive);
        }

        let mut cached = 0usize;
        for url in shell_urls {
            let request = AssetRequest::get(url.clone());
            match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&request)).await {
                Ok(Ok(response)) if response.is_success() => {
                    self.store.put(generation, url, &response).await?;
                    cached += 1;
                }
                Ok(Ok(response)) => {
                    tracing::warn!(%url, status = response.status, "shell asset not precached")
                }
                Ok(Err(err)) => tracing::warn!(%url, error = %err, "shell asset not precached"),
                Err(_) => tracing::warn!(%url, "shell asset precache timed out"),
            }
        }
        tracing::info!(generation, cached, total = shell_urls.len(), "generation installed");

        let activate_now = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.clients.is_empty() {
                true
            } else {
                lifecycle.waiting = Some(generation.to_string());
                false
            }
        };

        if activate_now {
            self.activate(generation).await?;
            Ok(InstallOutcome::Activated)
        } else {
            tracing::info!(generation, "generation waiting for clients to close");
            Ok(InstallOutcome::Waiting)
        }
    }

    /// Connect a client; it receives broadcast messages until released.
    pub fn register_client(&self) -> (ClientId, broadcast::Receiver<BroadcastMessage>) {
        let mut lifecycle = self.lifecycle();
        lifecycle.next_client += 1;
        let id = lifecycle.next_client;
        lifecycle.clients.insert(id);
        (id, self.broadcast.subscribe())
    }

    /// Disconnect a client. Activates a waiting generation once none are left.
    ///
    /// Returns the generation activated as a result, if any.
    pub async fn release_client(&self, id: ClientId) -> Result<Option<String>, AssetCacheError> {
        let ready = {
            let mut lifecycle = self.lifecycle();
            lifecycle.clients.remove(&id);
            if lifecycle.clients.is_empty() {
                lifecycle.waiting.take()
            } else {
                None
            }
        };

        match ready {
            Some(generation) => {
                self.activate(&generation).await?;
                Ok(Some(generation))
            }
            None => Ok(None),
        }
    }

    pub async fn handle_control(&self, message: ControlMessage) -> Result<Option<String>, AssetCacheError> {
        match message {
            ControlMessage::SkipWaiting => {
                let waiting = self.lifecycle().waiting.take();
                match waiting {
                    Some(generation) => {
                        tracing::info!(%generation, "skip-waiting requested");
                        self.activate(&generation).await?;
                        Ok(Some(generation))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    async fn activate(&self, generation: &str) -> Result<(), AssetCacheError> {
        let purged = self.store.activate(generation).await?;
        self.lifecycle().active = Some(generation.to_string());
        tracing::info!(generation, purged, "generation activated");

        // Informational; nobody listening is fine.
        let _ = self.broadcast.send(BroadcastMessage::NewVersionAvailable {
            version: generation.to_string(),
        });
        Ok(())
    }

    fn pending_writes(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.pending_writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const PAGE: &str = "https://pos.example.com/";
    const SCRIPT: &str = "https://pos.example.com/app.js";

    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, AssetResponse>>,
        offline: AtomicBool,
        slow: AtomicBool,
    }

    impl ScriptedFetcher {
        fn serve(&self, url: &str, response: AssetResponse) {
            self.responses.lock().unwrap().insert(url.to_string(), response);
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, FetchError> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(FetchError::Network("dns lookup failed".to_string()));
            }
            let response = self.responses.lock().unwrap().get(&request.url).cloned();
            Ok(response.unwrap_or_else(|| AssetResponse::ok("missing").with_status(404)))
        }
    }

    async fn cache(dir: &tempfile::TempDir) -> (AssetCache, Arc<ScriptedFetcher>) {
        let store = AssetStore::open(dir.path().join("assets.db")).await.unwrap();
        let fetcher = Arc::new(ScriptedFetcher::default());
        let cache = AssetCache::new(store, fetcher.clone(), Duration::from_millis(100))
            .await
            .unwrap();
        (cache, fetcher)
    }

    #[tokio::test]
    async fn network_first_then_cache_when_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        cache.install("g1", &[]).await.unwrap();
        fetcher.serve(PAGE, AssetResponse::ok("<html>v1</html>"));

        let live = cache.handle(&AssetRequest::get(PAGE)).await.unwrap();
        assert_eq!(live, Interception::Network(AssetResponse::ok("<html>v1</html>")));
        cache.flush_pending_writes().await;

        fetcher.set_offline(true);
        let offline = cache.handle(&AssetRequest::get(PAGE)).await.unwrap();
        assert_eq!(offline, Interception::Cache(AssetResponse::ok("<html>v1</html>")));
    }

    #[tokio::test]
    async fn live_response_does_not_wait_for_a_running_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        cache.install("g1", &[]).await.unwrap();
        fetcher.serve(PAGE, AssetResponse::ok("<html>v1</html>"));
        fetcher.serve(SCRIPT, AssetResponse::ok("console.log(1)"));

        // Hold the only connection so background writes cannot finish.
        let held = cache.store.pool.acquire().await.unwrap();
        cache.handle(&AssetRequest::get(PAGE)).await.unwrap();

        let flush = cache.flush_pending_writes();
        tokio::pin!(flush);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut flush)
            .await
            .is_err());

        let served = tokio::time::timeout(Duration::from_secs(1), cache.handle(&AssetRequest::get(SCRIPT)))
            .await
            .expect("response must not wait for the flush")
            .unwrap();
        assert_eq!(served, Interception::Network(AssetResponse::ok("console.log(1)")));

        drop(held);
        flush.await;
        assert_eq!(cache.store().entry_count("g1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn slow_network_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        fetcher.serve(SCRIPT, AssetResponse::ok("console.log(1)"));
        cache.install("g1", &[SCRIPT.to_string()]).await.unwrap();

        fetcher.slow.store(true, Ordering::SeqCst);
        let served = cache.handle(&AssetRequest::get(SCRIPT)).await.unwrap();
        assert_eq!(served, Interception::Cache(AssetResponse::ok("console.log(1)")));
    }

    #[tokio::test]
    async fn failure_without_cached_copy_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        cache.install("g1", &[]).await.unwrap();
        fetcher.set_offline(true);

        let err = cache.handle(&AssetRequest::get(PAGE)).await.unwrap_err();
        assert!(matches!(err, AssetCacheError::Fetch(FetchError::Network(_))));
    }

    #[tokio::test]
    async fn error_responses_are_served_but_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _fetcher) = cache(&dir).await;
        cache.install("g1", &[]).await.unwrap();

        let served = cache.handle(&AssetRequest::get(SCRIPT)).await.unwrap();
        assert!(matches!(served, Interception::Network(ref r) if r.status == 404));
        cache.flush_pending_writes().await;
        assert_eq!(cache.store().entry_count("g1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn foreign_requests_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        fetcher.set_offline(true);

        for request in [
            AssetRequest::get(PAGE).with_method(Method::POST),
            AssetRequest::get("chrome-extension://abc/popup.html"),
            AssetRequest::get(PAGE).with_context(RequestContext::Extension),
            AssetRequest::get("data:text/plain,hello"),
        ] {
            assert_eq!(cache.handle(&request).await.unwrap(), Interception::PassThrough);
        }
    }

    #[tokio::test]
    async fn activating_a_new_generation_purges_the_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        fetcher.serve(PAGE, AssetResponse::ok("v1"));
        assert_eq!(
            cache.install("g1", &[PAGE.to_string()]).await.unwrap(),
            InstallOutcome::Activated
        );
        assert_eq!(cache.store().entry_count("g1").await.unwrap(), 1);

        assert_eq!(cache.install("g1", &[]).await.unwrap(), InstallOutcome::AlreadyActive);
        assert_eq!(cache.install("g2", &[]).await.unwrap(), InstallOutcome::Activated);
        assert_eq!(cache.store().entry_count("g1").await.unwrap(), 0);
        assert_eq!(cache.store().get("g1", PAGE).await.unwrap(), None);

        fetcher.set_offline(true);
        assert!(cache.handle(&AssetRequest::get(PAGE)).await.is_err());
    }

    #[tokio::test]
    async fn new_generation_waits_for_clients() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, fetcher) = cache(&dir).await;
        fetcher.serve(PAGE, AssetResponse::ok("v1"));
        cache.install("g1", &[PAGE.to_string()]).await.unwrap();

        let (first, mut first_rx) = cache.register_client();
        let (second, _second_rx) = cache.register_client();
        fetcher.serve(PAGE, AssetResponse::ok("v2"));
        assert_eq!(
            cache.install("g2", &[PAGE.to_string()]).await.unwrap(),
            InstallOutcome::Waiting
        );
        assert_eq!(cache.active_generation().as_deref(), Some("g1"));
        assert_eq!(cache.waiting_generation().as_deref(), Some("g2"));

        fetcher.set_offline(true);
        assert_eq!(
            cache.handle(&AssetRequest::get(PAGE)).await.unwrap(),
            Interception::Cache(AssetResponse::ok("v1"))
        );

        assert_eq!(cache.release_client(first).await.unwrap(), None);
        assert_eq!(cache.release_client(second).await.unwrap().as_deref(), Some("g2"));
        assert_eq!(
            first_rx.recv().await.unwrap(),
            BroadcastMessage::NewVersionAvailable {
                version: "g2".to_string()
            }
        );
        assert_eq!(
            cache.handle(&AssetRequest::get(PAGE)).await.unwrap(),
            Interception::Cache(AssetResponse::ok("v2"))
        );
    }

    #[tokio::test]
    async fn skip_waiting_activates_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _fetcher) = cache(&dir).await;
        cache.install("g1", &[]).await.unwrap();
        let (_client, mut rx) = cache.register_client();
        cache.install("g2", &[]).await.unwrap();

        let activated = cache.handle_control(ControlMessage::SkipWaiting).await.unwrap();
        assert_eq!(activated.as_deref(), Some("g2"));
        assert_eq!(cache.active_generation().as_deref(), Some("g2"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            BroadcastMessage::NewVersionAvailable { version } if version == "g2"
        ));
        assert_eq!(cache.handle_control(ControlMessage::SkipWaiting).await.unwrap(), None);
    }

    #[tokio::test]
    async fn superseded_generation_writes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path().join("assets.db")).await.unwrap();
        store.activate("g1").await.unwrap();
        store.activate("g2").await.unwrap();

        assert!(!store.put_if_active("g1", PAGE, &AssetResponse::ok("old")).await.unwrap());
        assert!(store.put_if_active("g2", PAGE, &AssetResponse::ok("new")).await.unwrap());
        assert_eq!(store.entry_count("g1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn active_generation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cache, _fetcher) = cache(&dir).await;
            cache.install("g7", &[]).await.unwrap();
        }
        let (reopened, _fetcher) = cache(&dir).await;
        assert_eq!(reopened.active_generation().as_deref(), Some("g7"));
    }

    #[test]
    fn messages_use_the_documented_wire_shape() {
        assert_eq!(
            serde_json::to_value(BroadcastMessage::NewVersionAvailable {
                version: "g2".to_string()
            })
            .unwrap(),
            json!({ "type": "NEW_VERSION_AVAILABLE", "version": "g2" })
        );
        let control: ControlMessage = serde_json::from_value(json!({ "type": "SKIP_WAITING" })).unwrap();
        assert_eq!(control, ControlMessage::SkipWaiting);
    }

    proptest! {
        #[test]
        fn only_page_gets_over_http_are_intercepted(
            scheme in "[a-z][a-z0-9+.-]{0,9}",
            path in "[a-z0-9/]{0,16}",
            method in prop::sample::select(vec!["GET", "POST", "PUT", "DELETE", "HEAD"]),
            from_page in any::<bool>(),
        ) {
            let request = AssetRequest {
                method: Method::from_bytes(method.as_bytes()).unwrap(),
                url: format!("{scheme}://host.example/{path}"),
                context: if from_page { RequestContext::Page } else { RequestContext::Extension },
            };
            let expected = method == "GET"
                && from_page
                && (scheme == "http" || scheme == "https");
            prop_assert_eq!(should_intercept(&request), expected);
        }
    }
}
