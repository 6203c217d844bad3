//! Persistence (Postgres via sqlx) + HTTP fetch utilities for the shipment map.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use shipmap_core::{
    parse_shipment_date, ExistingLocationIndex, GeoLocation, ProductCategory, RecentShipment,
    Store, SyncError, SyncMode, SyncRun, SyncStatus,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shipmap-storage";

const ERROR_BODY_SNIPPET: usize = 512;

/// 5xx and 429 are worth another attempt; any other status is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Retry schedule shared by the spreadsheet export and Places calls.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based): doubles from `base_delay`, capped at `max_delay`.
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    fn allows(&self, retry: usize) -> bool {
        retry < self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("http client is shut down")]
    Closed,
}

/// Shared HTTP client used by the spreadsheet and places adapters.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        self.execute("GET", url, |client| client.get(url)).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<FetchedResponse, HttpError> {
        self.execute("POST", url, |client| {
            let mut req = client.post(url).json(body);
            for (name, value) in headers {
                req = req.header(*name, *value);
            }
            req
        })
        .await
    }

    async fn execute<F>(&self, method: &str, url: &str, build: F) -> Result<FetchedResponse, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;

        let span = info_span!("http_fetch", method, url);
        async {
            let mut retry = 0usize;
            loop {
                let outcome = build(&self.client).send().await;
                let transient = match &outcome {
                    Ok(resp) => is_transient_status(resp.status()),
                    Err(err) => is_transient_error(err),
                };
                if transient && self.backoff.allows(retry) {
                    match &outcome {
                        Ok(resp) => debug!(status = resp.status().as_u16(), retry, "transient http status"),
                        Err(err) => debug!(error = %err, retry, "transient transport error"),
                    }
                    tokio::time::sleep(self.backoff.delay(retry)).await;
                    retry += 1;
                    continue;
                }

                let resp = outcome?;
                let status = resp.status();
                let final_url = resp.url().to_string();
                if status.is_success() {
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                let body = resp.text().await.unwrap_or_default();
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: body.chars().take(ERROR_BODY_SNIPPET).collect(),
                });
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<PersistenceError> for SyncError {
    fn from(err: PersistenceError) -> Self {
        SyncError::persistence(err)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub stores: usize,
    pub shipments_written: usize,
    pub shipments_skipped: usize,
}

/// A shipment ready to be written under its (store, category, date) key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentRow {
    pub category: ProductCategory,
    pub shipment_date: NaiveDate,
    pub quantity: String,
    /// "No shipment" rows may overwrite an existing row but never create one.
    pub insertable: bool,
}

/// Parse every shipment date of a store, skipping (and logging) the unparseable ones.
pub fn prepare_shipment_rows(store: &Store) -> (Vec<ShipmentRow>, usize) {
    let mut rows = Vec::with_capacity(store.shipment_count());
    let mut skipped = 0usize;
    for (category, records) in &store.shipments {
        for record in records {
            match parse_shipment_date(&record.date) {
                Ok(shipment_date) => rows.push(ShipmentRow {
                    category: *category,
                    shipment_date,
                    quantity: record.quantity.trim().to_string(),
                    insertable: record.is_shipment(),
                }),
                Err(err) => {
                    warn!(store = %store.name, %category, error = %err, "skipping shipment with invalid date");
                    skipped += 1;
                }
            }
        }
    }
    (rows, skipped)
}

#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    /// Stores that already carry a non-empty place id and both coordinates.
    async fn existing_locations(&self) -> Result<ExistingLocationIndex, PersistenceError>;

    /// Upsert stores and their shipments as a single atomic batch.
    async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertReport, PersistenceError>;

    async fn start_sync_run(
        &self,
        mode: SyncMode,
        started_at: DateTime<Utc>,
        message: &str,
    ) -> Result<Uuid, PersistenceError>;

    async fn finish_sync_run(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        status: SyncStatus,
        message: &str,
    ) -> Result<(), PersistenceError>;

    async fn last_successful_sync(&self) -> Result<Option<SyncRun>, PersistenceError>;

    async fn sync_history(&self, limit: usize) -> Result<Vec<SyncRun>, PersistenceError>;

    /// Shipments within the last `days` days whose quantity is present and non-zero.
    async fn recent_shipments(&self, days: u32) -> Result<Vec<RecentShipment>, PersistenceError>;
}

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> Result<(), PersistenceError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct ExistingLocationRow {
    store_name: String,
    place_id: String,
    formatted_address: Option<String>,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct RecentShipmentRow {
    store_name: String,
    formatted_address: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    product_type: String,
    shipment_date: NaiveDate,
    quantity: String,
}

impl From<RecentShipmentRow> for RecentShipment {
    fn from(row: RecentShipmentRow) -> Self {
        RecentShipment {
            store_name: row.store_name,
            formatted_address: row.formatted_address,
            latitude: row.latitude,
            longitude: row.longitude,
            product_type: row.product_type,
            shipment_date: row.shipment_date,
            quantity: row.quantity,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SyncRunRow {
    id: Uuid,
    mode: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    message: String,
}

impl TryFrom<SyncRunRow> for SyncRun {
    type Error = PersistenceError;

    fn try_from(row: SyncRunRow) -> Result<Self, Self::Error> {
        let mode = row
            .mode
            .parse::<SyncMode>()
            .map_err(|e| PersistenceError::Decode(e.to_string()))?;
        let status = row
            .status
            .parse::<SyncStatus>()
            .map_err(PersistenceError::Decode)?;
        Ok(SyncRun {
            id: row.id,
            mode,
            started_at: row.start_time,
            ended_at: row.end_time,
            status,
            message: row.message,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ShipmentRepository for PgRepository {
    async fn existing_locations(&self) -> Result<ExistingLocationIndex, PersistenceError> {
        let rows = sqlx::query_as::<_, ExistingLocationRow>(
            r#"
            SELECT store_name, place_id, formatted_address, latitude, longitude
              FROM stores
             WHERE place_id IS NOT NULL
               AND place_id <> ''
               AND latitude IS NOT NULL
               AND longitude IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ExistingLocationIndex::from_entries(rows.into_iter().map(|row| {
            (
                row.store_name,
                GeoLocation {
                    place_id: row.place_id,
                    formatted_address: row.formatted_address.unwrap_or_default(),
                    latitude: row.latitude,
                    longitude: row.longitude,
                },
            )
        })))
    }

    async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertReport, PersistenceError> {
        let mut report = UpsertReport::default();
        let mut tx = self.pool.begin().await?;

        for store in stores {
            let location = store.location.as_ref();
            // A missing geocode never erases one that is already stored.
            let store_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO stores (store_name, place_id, formatted_address, latitude, longitude, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (store_name)
                DO UPDATE SET
                    place_id = COALESCE(EXCLUDED.place_id, stores.place_id),
                    formatted_address = COALESCE(EXCLUDED.formatted_address, stores.formatted_address),
                    latitude = COALESCE(EXCLUDED.latitude, stores.latitude),
                    longitude = COALESCE(EXCLUDED.longitude, stores.longitude),
                    updated_at = NOW()
                RETURNING id
                "#,
            )
            .bind(&store.name)
            .bind(location.map(|l| l.place_id.as_str()))
            .bind(location.map(|l| l.formatted_address.as_str()))
            .bind(location.map(|l| l.latitude))
            .bind(location.map(|l| l.longitude))
            .fetch_one(&mut *tx)
            .await?;

            let (rows, skipped) = prepare_shipment_rows(store);
            report.shipments_skipped += skipped;

            for row in rows {
                let result = if row.insertable {
                    sqlx::query(
                        r#"
                        INSERT INTO shipments (store_id, product_type, shipment_date, quantity)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (store_id, product_type, shipment_date)
                        DO UPDATE SET quantity = EXCLUDED.quantity
                        "#,
                    )
                } else {
                    sqlx::query(
                        r#"
                        UPDATE shipments
                           SET quantity = $4
                         WHERE store_id = $1
                           AND product_type = $2
                           AND shipment_date = $3
                        "#,
                    )
                }
                .bind(store_id)
                .bind(row.category.as_str())
                .bind(row.shipment_date)
                .bind(&row.quantity)
                .execute(&mut *tx)
                .await?;
                report.shipments_written += result.rows_affected() as usize;
            }

            report.stores += 1;
            debug!(store = %store.name, store_id, "store upserted");
        }

        tx.commit().await?;
        info!(
            stores = report.stores,
            shipments = report.shipments_written,
            skipped = report.shipments_skipped,
            "upsert batch committed"
        );
        Ok(report)
    }

    async fn start_sync_run(
        &self,
        mode: SyncMode,
        started_at: DateTime<Utc>,
        message: &str,
    ) -> Result<Uuid, PersistenceError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, mode, start_time, status, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(mode.as_str())
        .bind(started_at)
        .bind(SyncStatus::Running.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn finish_sync_run(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        status: SyncStatus,
        message: &str,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET end_time = $1,
                   status = $2,
                   message = $3
             WHERE id = $4
            "#,
        )
        .bind(ended_at)
        .bind(status.as_str())
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::Unavailable(format!("sync run {id} not found")));
        }
        Ok(())
    }

    async fn last_successful_sync(&self) -> Result<Option<SyncRun>, PersistenceError> {
        let row = sqlx::query_as::<_, SyncRunRow>(
            r#"
            SELECT id, mode, start_time, end_time, status, message
              FROM sync_runs
             WHERE status = 'success'
             ORDER BY start_time DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncRun::try_from).transpose()
    }

    async fn sync_history(&self, limit: usize) -> Result<Vec<SyncRun>, PersistenceError> {
        let rows = sqlx::query_as::<_, SyncRunRow>(
            r#"
            SELECT id, mode, start_time, end_time, status, message
              FROM sync_runs
             ORDER BY start_time DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncRun::try_from).collect()
    }

    async fn recent_shipments(&self, days: u32) -> Result<Vec<RecentShipment>, PersistenceError> {
        let rows = sqlx::query_as::<_, RecentShipmentRow>(
            r#"
            SELECT s.store_name,
                   s.formatted_address,
                   s.latitude,
                   s.longitude,
                   sh.product_type,
                   sh.shipment_date,
                   sh.quantity
              FROM stores s
              JOIN shipments sh ON sh.store_id = s.id
             WHERE sh.shipment_date >= CURRENT_DATE - $1::int
               AND btrim(sh.quantity) NOT IN ('', '0')
             ORDER BY s.store_name, sh.product_type, sh.shipment_date DESC
            "#,
        )
        .bind(days.min(i32::MAX as u32) as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RecentShipment::from).collect())
    }
}

#[cfg(feature = "memory")]
pub use memory::MemoryRepository;

#[cfg(feature = "memory")]
mod memory {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    struct MemoryStoreRow {
        id: i64,
        location: Option<GeoLocation>,
    }

    #[derive(Debug, Default)]
    struct MemoryState {
        next_store_id: i64,
        stores: BTreeMap<String, MemoryStoreRow>,
        shipments: BTreeMap<(i64, ProductCategory, NaiveDate), String>,
        runs: Vec<SyncRun>,
    }

    /// In-process repository with the same natural-key semantics as [`PgRepository`].
    #[derive(Debug, Default)]
    pub struct MemoryRepository {
        state: Mutex<MemoryState>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        fail_run_log: AtomicBool,
    }

    impl MemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `existing_locations` fail, as an unreachable database would.
        pub fn fail_location_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        /// Make `upsert_stores` fail before anything is written.
        pub fn fail_upserts(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Make every sync run log write fail.
        pub fn fail_run_log(&self, fail: bool) {
            self.fail_run_log.store(fail, Ordering::SeqCst);
        }

        pub async fn seed_location(&self, store_name: &str, location: GeoLocation) {
            let mut state = self.state.lock().await;
            if let Some(row) = state.stores.get_mut(store_name) {
                row.location = Some(location);
                return;
            }
            let id = state.next_store_id + 1;
            state.next_store_id = id;
            state.stores.insert(
                store_name.to_string(),
                MemoryStoreRow {
                    id,
                    location: Some(location),
                },
            );
        }

        /// Insert a shipment row directly, bypassing the "no shipment" insert rule.
        pub async fn seed_shipment(
            &self,
            store_name: &str,
            category: ProductCategory,
            shipment_date: NaiveDate,
            quantity: &str,
        ) {
            let mut state = self.state.lock().await;
            let id = match state.stores.get(store_name) {
                Some(row) => row.id,
                None => {
                    let id = state.next_store_id + 1;
                    state.next_store_id = id;
                    state.stores.insert(
                        store_name.to_string(),
                        MemoryStoreRow { id, location: None },
                    );
                    id
                }
            };
            state
                .shipments
                .insert((id, category, shipment_date), quantity.to_string());
        }

        pub async fn location_of(&self, store_name: &str) -> Option<GeoLocation> {
            let state = self.state.lock().await;
            state.stores.get(store_name).and_then(|s| s.location.clone())
        }

        /// Every persisted shipment as (store, category, date, quantity).
        pub async fn shipment_rows(&self) -> Vec<(String, ProductCategory, NaiveDate, String)> {
            let state = self.state.lock().await;
            let names: HashMap<i64, &String> =
                state.stores.iter().map(|(name, row)| (row.id, name)).collect();
            state
                .shipments
                .iter()
                .map(|((id, category, date), qty)| {
                    (
                        names.get(id).map(|n| n.to_string()).unwrap_or_default(),
                        *category,
                        *date,
                        qty.clone(),
                    )
                })
                .collect()
        }

        pub async fn runs(&self) -> Vec<SyncRun> {
            self.state.lock().await.runs.clone()
        }
    }

    #[async_trait]
    impl ShipmentRepository for MemoryRepository {
        async fn existing_locations(&self) -> Result<ExistingLocationIndex, PersistenceError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("location read disabled".into()));
            }
            let state = self.state.lock().await;
            Ok(ExistingLocationIndex::from_entries(
                state
                    .stores
                    .iter()
                    .filter_map(|(name, row)| row.location.clone().map(|loc| (name.clone(), loc))),
            ))
        }

        async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertReport, PersistenceError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("upsert disabled".into()));
            }
            let mut state = self.state.lock().await;
            let mut report = UpsertReport::default();
            for store in stores {
                let id = match state.stores.get_mut(&store.name) {
                    Some(row) => {
                        if store.location.is_some() {
                            row.location = store.location.clone();
                        }
                        row.id
                    }
                    None => {
                        let id = state.next_store_id + 1;
                        state.next_store_id = id;
                        state.stores.insert(
                            store.name.clone(),
                            MemoryStoreRow {
                                id,
                                location: store.location.clone(),
                            },
                        );
                        id
                    }
                };

                let (rows, skipped) = prepare_shipment_rows(store);
                report.shipments_skipped += skipped;
                for row in rows {
                    let key = (id, row.category, row.shipment_date);
                    if row.insertable || state.shipments.contains_key(&key) {
                        state.shipments.insert(key, row.quantity);
                        report.shipments_written += 1;
                    }
                }
                report.stores += 1;
            }
            Ok(report)
        }

        async fn start_sync_run(
            &self,
            mode: SyncMode,
            started_at: DateTime<Utc>,
            message: &str,
        ) -> Result<Uuid, PersistenceError> {
            if self.fail_run_log.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("run log disabled".into()));
            }
            let id = Uuid::new_v4();
            self.state.lock().await.runs.push(SyncRun {
                id,
                mode,
                started_at,
                ended_at: None,
                status: SyncStatus::Running,
                message: message.to_string(),
            });
            Ok(id)
        }

        async fn finish_sync_run(
            &self,
            id: Uuid,
            ended_at: DateTime<Utc>,
            status: SyncStatus,
            message: &str,
        ) -> Result<(), PersistenceError> {
            if self.fail_run_log.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("run log disabled".into()));
            }
            let mut state = self.state.lock().await;
            let run = state
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| PersistenceError::Unavailable(format!("sync run {id} not found")))?;
            run.ended_at = Some(ended_at);
            run.status = status;
            run.message = message.to_string();
            Ok(())
        }

        async fn last_successful_sync(&self) -> Result<Option<SyncRun>, PersistenceError> {
            let state = self.state.lock().await;
            Ok(state
                .runs
                .iter()
                .filter(|r| r.status == SyncStatus::Success)
                .max_by_key(|r| r.started_at)
                .cloned())
        }

        async fn sync_history(&self, limit: usize) -> Result<Vec<SyncRun>, PersistenceError> {
            let mut runs = self.state.lock().await.runs.clone();
            runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            runs.truncate(limit);
            Ok(runs)
        }

        async fn recent_shipments(&self, days: u32) -> Result<Vec<RecentShipment>, PersistenceError> {
            let today = Utc::now().date_naive();
            let cutoff = today
                .checked_sub_days(chrono::Days::new(u64::from(days)))
                .unwrap_or(NaiveDate::MIN);
            let state = self.state.lock().await;
            let mut out = Vec::new();
            for (name, row) in &state.stores {
                for ((id, category, date), qty) in &state.shipments {
                    if *id != row.id || *date < cutoff || !shipmap_core::is_shipment_quantity(qty) {
                        continue;
                    }
                    out.push(RecentShipment {
                        store_name: name.clone(),
                        formatted_address: row.location.as_ref().map(|l| l.formatted_address.clone()),
                        latitude: row.location.as_ref().map(|l| l.latitude),
                        longitude: row.location.as_ref().map(|l| l.longitude),
                        product_type: category.as_str().to_string(),
                        shipment_date: *date,
                        quantity: qty.clone(),
                    });
                }
            }
            out.sort_by(|a, b| {
                a.store_name
                    .cmp(&b.store_name)
                    .then_with(|| a.product_type.cmp(&b.product_type))
                    .then_with(|| b.shipment_date.cmp(&a.shipment_date))
            });
            Ok(out)
        }
    }
}
