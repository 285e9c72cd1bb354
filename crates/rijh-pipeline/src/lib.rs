//! Sink writers, run orchestration, and the timer-event handler for RIJH.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rijh_core::{JobRecord, IT_JOB_TITLES};
use rijh_extract::{harvest_all, SearchConfig};
use rijh_fetch::{
    Coordinates, GeocodeResolver, HttpClientConfig, HttpFetcher, NominatimClient, PageFetcher,
};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rijh-pipeline";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const OBJECT_KEY_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const GEOCODE_COUNTRY: &str = "United Kingdom";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
}

impl DbConfig {
    /// Typed connect options. Credentials pass through verbatim, so reserved
    /// URL characters in the password never corrupt the connection string.
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        let port = self
            .port
            .parse()
            .with_context(|| format!("DB_PORT is not a port number: {}", self.port))?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name))
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub db: DbConfig,
    /// Destination bucket/container for the CSV object.
    pub blob_bucket: String,
    /// Root directory of the filesystem-backed blob store.
    pub blob_root: PathBuf,
    pub search: SearchConfig,
    pub geocode_endpoint: String,
    /// Pause after every geocoding call (upstream allows one per second).
    pub geocode_delay: Duration,
    /// Pause per record during each writer's enrichment pass.
    pub enrich_delay: Duration,
    pub http: HttpClientConfig,
}

fn required_env(name: &'static str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("required environment variable {name} is not set"))
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl HarvestConfig {
    /// Read configuration from the environment. The database and bucket
    /// variables are required; everything else has a default tuned for the
    /// hosted run.
    pub fn from_env() -> anyhow::Result<Self> {
        let db = DbConfig {
            name: required_env("DB_NAME")?,
            user: required_env("DB_USER")?,
            password: required_env("DB_PASSWORD")?,
            host: required_env("DB_HOST")?,
            port: required_env("DB_PORT")?,
        };
        let blob_bucket = required_env("S3_BUCKET_NAME")?;

        let mut search = SearchConfig::default();
        if let Ok(base_url) = std::env::var("RIJH_SEARCH_BASE_URL") {
            search.base_url = base_url;
        }
        search.max_pages_per_term =
            env_parsed("RIJH_MAX_PAGES_PER_TERM").unwrap_or(search.max_pages_per_term);
        search.page_delay = env_parsed("RIJH_PAGE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(search.page_delay);

        let mut http = HttpClientConfig::default();
        if let Ok(user_agent) = std::env::var("RIJH_USER_AGENT") {
            http.user_agent = user_agent;
        }
        http.timeout = env_parsed("RIJH_HTTP_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(http.timeout);

        Ok(Self {
            db,
            blob_bucket,
            blob_root: std::env::var("RIJH_BLOB_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            search,
            geocode_endpoint: std::env::var("RIJH_GEOCODE_ENDPOINT")
                .unwrap_or_else(|_| NominatimClient::DEFAULT_ENDPOINT.to_string()),
            geocode_delay: env_parsed("RIJH_GEOCODE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1)),
            enrich_delay: env_parsed("RIJH_ENRICH_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(100)),
            http,
        })
    }
}

/// A record paired with its best-effort coordinates.
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub record: JobRecord,
    pub coordinates: Option<Coordinates>,
}

/// Sequential geocoding pass over a record set. Each writer runs its own
/// pass; the resolver's cache makes repeat passes cheap.
pub async fn enrich_records(
    records: &[JobRecord],
    resolver: &mut GeocodeResolver,
    pause: Duration,
) -> Vec<EnrichedRecord> {
    let mut enriched = Vec::with_capacity(records.len());
    for record in records {
        let coordinates = resolver.resolve(&record.location).await;
        enriched.push(EnrichedRecord {
            record: record.clone(),
            coordinates,
        });
        tokio::time::sleep(pause).await;
    }
    enriched
}

/// Put-object seam over the blob store. The production client is an external
/// collaborator; the filesystem implementation below covers local and test
/// runs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store one object and return its addressable location.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: &[u8],
    ) -> anyhow::Result<String>;
}

/// Filesystem-backed blob store with atomic temp-file-then-rename writes.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: &[u8],
    ) -> anyhow::Result<String> {
        let dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating bucket directory {}", dir.display()))?;

        let final_path = dir.join(key);
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp object {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }
        debug!(bucket, key, content_type, bytes = body.len(), "stored object");
        Ok(final_path.display().to_string())
    }
}

pub const CSV_HEADER: [&str; 11] = [
    "Job Title",
    "Company",
    "Location",
    "Latitude",
    "Longitude",
    "Experience Level",
    "Work Type",
    "Category",
    "Posted Date",
    "Job URL",
    "Date Scraped",
];

pub fn records_to_csv(enriched: &[EnrichedRecord]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER).context("writing csv header")?;
    for item in enriched {
        let latitude = item
            .coordinates
            .map(|c| c.latitude.to_string())
            .unwrap_or_default();
        let longitude = item
            .coordinates
            .map(|c| c.longitude.to_string())
            .unwrap_or_default();
        let scraped_at = item.record.scraped_at.format(TIMESTAMP_FORMAT).to_string();
        writer
            .write_record([
                item.record.title.as_str(),
                item.record.company.as_str(),
                item.record.location.as_str(),
                latitude.as_str(),
                longitude.as_str(),
                item.record.experience_level.as_str(),
                item.record.work_type.as_str(),
                item.record.category.as_str(),
                item.record.posted_date_text.as_str(),
                item.record.url.as_str(),
                scraped_at.as_str(),
            ])
            .context("writing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {err}"))
}

/// Enrich, serialize, and store the record set as one timestamped CSV object.
/// Returns the object location, or `None` when there is nothing to write or
/// the write fails; the pipeline continues either way.
pub async fn write_csv_blob(
    store: &dyn BlobStore,
    bucket: &str,
    records: &[JobRecord],
    resolver: &mut GeocodeResolver,
    pause: Duration,
) -> Option<String> {
    if records.is_empty() {
        info!("no jobs to write to the blob store");
        return None;
    }

    let enriched = enrich_records(records, resolver, pause).await;
    let body = match records_to_csv(&enriched) {
        Ok(body) => body,
        Err(err) => {
            error!(%err, "csv serialization failed");
            return None;
        }
    };

    let key = format!(
        "linkedin_recent_it_jobs_{}.csv",
        Utc::now().format(OBJECT_KEY_STAMP_FORMAT)
    );
    match store.put_object(bucket, &key, "text/csv", &body).await {
        Ok(location) => {
            info!(count = records.len(), %location, "wrote csv object");
            Some(location)
        }
        Err(err) => {
            error!(%err, "blob store write failed");
            None
        }
    }
}

const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS linkedin_jobs (
    id SERIAL PRIMARY KEY,
    job_title VARCHAR(255),
    company VARCHAR(255),
    location VARCHAR(255),
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    experience_level VARCHAR(50),
    work_type VARCHAR(50),
    category VARCHAR(100),
    posted_date VARCHAR(100),
    job_url TEXT,
    date_scraped TIMESTAMPTZ,
    created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
)";

const ADD_UNIQUE_URL_SQL: &str =
    "ALTER TABLE linkedin_jobs ADD CONSTRAINT unique_job_url UNIQUE (job_url)";

const INSERT_JOB_SQL: &str = "\
INSERT INTO linkedin_jobs
    (job_title, company, location, latitude, longitude, experience_level, work_type,
     category, posted_date, job_url, date_scraped)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (job_url) DO NOTHING";

/// Idempotent schema setup for the destination table.
pub async fn ensure_jobs_table(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(CREATE_TABLE_SQL)
        .execute(pool)
        .await
        .context("creating linkedin_jobs table")?;
    // Already present on every run after the first.
    if let Err(err) = sqlx::query(ADD_UNIQUE_URL_SQL).execute(pool).await {
        debug!(%err, "unique_job_url constraint not added");
    }
    Ok(())
}

/// Insert the record set in one transaction, skipping rows whose URL is
/// already stored. Any failure rolls the whole batch back.
pub async fn write_postgres(
    pool: &PgPool,
    records: &[JobRecord],
    resolver: &mut GeocodeResolver,
    pause: Duration,
) -> anyhow::Result<()> {
    if records.is_empty() {
        info!("no jobs to write to the database");
        return Ok(());
    }

    ensure_jobs_table(pool).await?;
    let enriched = enrich_records(records, resolver, pause).await;

    let mut tx = pool.begin().await.context("opening insert transaction")?;
    for item in &enriched {
        sqlx::query(INSERT_JOB_SQL)
            .bind(&item.record.title)
            .bind(&item.record.company)
            .bind(&item.record.location)
            .bind(item.coordinates.map(|c| c.latitude))
            .bind(item.coordinates.map(|c| c.longitude))
            .bind(item.record.experience_level.as_str())
            .bind(item.record.work_type.as_str())
            .bind(&item.record.category)
            .bind(&item.record.posted_date_text)
            .bind(&item.record.url)
            .bind(item.record.scraped_at)
            .execute(&mut *tx)
            .await
            .context("inserting job row")?;
    }
    tx.commit().await.context("committing job rows")?;

    info!(count = records.len(), "wrote jobs to postgres");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub total_jobs: usize,
    pub jobs_by_category: BTreeMap<String, usize>,
    pub output_file: Option<String>,
    pub timestamp: String,
}

pub fn build_summary(
    records: &[JobRecord],
    output_file: Option<String>,
    finished_at: DateTime<Utc>,
) -> HarvestSummary {
    let mut jobs_by_category: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        *jobs_by_category.entry(record.category.clone()).or_default() += 1;
    }
    HarvestSummary {
        total_jobs: records.len(),
        jobs_by_category,
        output_file,
        timestamp: finished_at.format(TIMESTAMP_FORMAT).to_string(),
    }
}

/// One bounded, single-pass harvest: paginate every category, then run the
/// two sink writers in sequence. A writer failure never stops the run.
pub struct HarvestPipeline {
    config: HarvestConfig,
    fetcher: Box<dyn PageFetcher>,
    blob_store: Box<dyn BlobStore>,
    resolver: GeocodeResolver,
}

impl HarvestPipeline {
    pub fn new(
        config: HarvestConfig,
        fetcher: Box<dyn PageFetcher>,
        blob_store: Box<dyn BlobStore>,
        resolver: GeocodeResolver,
    ) -> Self {
        Self {
            config,
            fetcher,
            blob_store,
            resolver,
        }
    }

    pub fn from_config(config: HarvestConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.http.clone())?;
        let blob_store = FsBlobStore::new(config.blob_root.clone());
        let lookup = NominatimClient::new(config.geocode_endpoint.clone(), config.http.timeout)?;
        let resolver = GeocodeResolver::new(Box::new(lookup), GEOCODE_COUNTRY)
            .with_call_delay(config.geocode_delay);
        Ok(Self::new(
            config,
            Box::new(fetcher),
            Box::new(blob_store),
            resolver,
        ))
    }

    pub async fn run_once(&mut self) -> anyhow::Result<HarvestSummary> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting harvest run");

        let records = harvest_all(&self.config.search, self.fetcher.as_ref(), IT_JOB_TITLES).await;

        let output_file = write_csv_blob(
            self.blob_store.as_ref(),
            &self.config.blob_bucket,
            &records,
            &mut self.resolver,
            self.config.enrich_delay,
        )
        .await;

        if let Err(err) = self.write_database(&records).await {
            warn!(%err, "database write failed; run continues");
        }

        let summary = build_summary(&records, output_file, Utc::now());
        info!(%run_id, total_jobs = summary.total_jobs, "harvest run complete");
        Ok(summary)
    }

    async fn write_database(&mut self, records: &[JobRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            info!("no jobs to write to the database");
            return Ok(());
        }
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.config.db.connect_options()?)
            .await
            .context("connecting to postgres")?;
        let result = write_postgres(
            &pool,
            records,
            &mut self.resolver,
            self.config.enrich_delay,
        )
        .await;
        pool.close().await;
        result
    }
}

/// Build everything from the environment and run one harvest.
pub async fn run_from_env() -> anyhow::Result<HarvestSummary> {
    let config = HarvestConfig::from_env()?;
    let mut pipeline = HarvestPipeline::from_config(config)?;
    pipeline.run_once().await
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

/// Timer-event entry point. The event payload is opaque and unused; any
/// propagated failure becomes the 500 envelope, the only user-visible error
/// surface.
pub async fn handle_timer_event(_event: serde_json::Value) -> HandlerResponse {
    match run_from_env().await {
        Ok(summary) => HandlerResponse {
            status_code: 200,
            body: serde_json::to_string(&summary)
                .unwrap_or_else(|_| "{}".to_string()),
        },
        Err(err) => {
            error!(%err, "harvest run failed");
            HandlerResponse {
                status_code: 500,
                body: serde_json::json!({ "error": err.to_string() }).to_string(),
            }
        }
    }
}
