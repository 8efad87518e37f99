//! Ingestion orchestration: scan for missing weeks, fetch, normalize, append.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use fs2::FileExt;
use rasff_adapters::{ColumnMapping, Normalizer, PayloadKind, Taxonomy};
use rasff_core::Period;
use rasff_storage::{
    AlertStore, ArtifactStore, BulletinSource, BulletinUrlTemplate, FetchOutcome, HttpClientConfig,
    HttpFetcher, StoreError, DEFAULT_BASE_URL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod export;
mod scanner;

pub use export::{export_snapshot, ParquetManifest, ParquetManifestFile, MANIFEST_FILE, SNAPSHOT_FILE};
pub use rasff_storage::DEFAULT_DATABASE_URL;
pub use scanner::{missing_periods, MissingPeriods, PeriodScanner};

pub const CRATE_NAME: &str = "rasff-sync";

pub const DEFAULT_EPOCH: &str = "2020-W01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    /// A missing bulletin means the source has nothing newer yet.
    #[default]
    StopOnFirstGap,
    /// Record the missing week and keep scanning up to the as-of week.
    SkipAndContinue,
}

impl GapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapPolicy::StopOnFirstGap => "stop-on-first-gap",
            GapPolicy::SkipAndContinue => "skip-and-continue",
        }
    }
}

impl fmt::Display for GapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "stop-on-first-gap" | "stop" => Ok(GapPolicy::StopOnFirstGap),
            "skip-and-continue" | "skip" => Ok(GapPolicy::SkipAndContinue),
            other => Err(format!(
                "unknown gap policy {other:?}; expected stop-on-first-gap or skip-and-continue"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub archive_raw: bool,
    pub base_url: String,
    pub file_prefix: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub epoch: Period,
    pub gap_policy: GapPolicy,
    pub rules_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let epoch = std::env::var("RASFF_EPOCH").unwrap_or_else(|_| DEFAULT_EPOCH.to_string());
        let gap_policy =
            std::env::var("RASFF_GAP_POLICY").unwrap_or_else(|_| GapPolicy::default().to_string());
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            archive_raw: env_flag("RASFF_ARCHIVE_RAW", true),
            base_url: std::env::var("RASFF_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            file_prefix: std::env::var("RASFF_FILE_PREFIX").unwrap_or_else(|_| "rasff".to_string()),
            user_agent: std::env::var("RASFF_USER_AGENT")
                .unwrap_or_else(|_| "rasff-ingest/0.1".to_string()),
            http_timeout_secs: std::env::var("RASFF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            epoch: epoch
                .parse::<Period>()
                .with_context(|| format!("parsing RASFF_EPOCH={epoch}"))?,
            gap_policy: gap_policy
                .parse::<GapPolicy>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing RASFF_GAP_POLICY={gap_policy}"))?,
            rules_dir: std::env::var("RASFF_RULES_DIR").ok().map(PathBuf::from),
            scheduler_enabled: env_flag("RASFF_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("RASFF_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * Mon".to_string()),
            workspace_root: PathBuf::from("."),
        })
    }

    pub fn url_template(&self) -> BulletinUrlTemplate {
        BulletinUrlTemplate {
            base_url: self.base_url.clone(),
            file_prefix: self.file_prefix.clone(),
            ..Default::default()
        }
    }

    pub fn taxonomy(&self) -> Result<Taxonomy> {
        match &self.rules_dir {
            Some(dir) => Taxonomy::from_rules_dir(dir),
            None => Taxonomy::builtin(),
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub async fn open_store(&self) -> Result<AlertStore> {
        AlertStore::connect(&self.database_url)
            .await
            .with_context(|| format!("opening {}", self.database_url))
    }
}

/// Filesystem path of a sqlite database url, or `None` for in-memory databases.
pub fn database_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// `<db>.lock` beside the database file.
pub fn lock_path_for(database_path: &Path) -> PathBuf {
    let mut name = database_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Cooperative cancellation, checked between periods.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transient failure fetching {period} from {url}: {message}")]
    FetchTransient {
        period: Period,
        url: String,
        message: String,
    },
    #[error("writing {period} to the store failed: {source}")]
    StoreWrite {
        period: Period,
        #[source]
        source: StoreError,
    },
    #[error("reading the latest stored period failed: {0}")]
    Scan(#[source] StoreError),
    #[error("another ingestion run holds {}", path.display())]
    Locked { path: PathBuf },
    #[error("preparing the alert table failed: {0}")]
    Schema(#[source] StoreError),
    #[error("locking {}: {source}", path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Advisory exclusive lock on `<db>.lock`, held for the duration of a run.
///
/// The OS drops the lock when the holding process exits, so a lock file left
/// behind by a killed run does not block the next one.
#[derive(Debug)]
pub struct IngestLock {
    path: PathBuf,
    file: File,
}

impl IngestLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let mut file = match OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path) {
            Ok(file) => file,
            Err(source) => return Err(IngestError::LockIo { path, source }),
        };
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(IngestError::Locked { path });
            }
            return Err(IngestError::LockIo { path, source: err });
        }
        if let Err(source) = record_owner(&mut file) {
            return Err(IngestError::LockIo { path, source });
        }
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn record_owner(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

impl Drop for IngestLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release ingest lock");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Scanning,
    Fetching,
    Normalizing,
    Appending,
    Done,
}

impl RunState {
    fn advance(&mut self, next: RunState, period: Option<Period>) {
        let from = *self;
        match period {
            Some(period) => debug!(?from, to = ?next, %period, "ingest state"),
            None => debug!(?from, to = ?next, "ingest state"),
        }
        *self = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeriodOutcome {
    Written { rows: u64 },
    Missing { http_status: u16 },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodReport {
    pub period: Period,
    pub url: String,
    #[serde(flatten)]
    pub outcome: PeriodOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Every period up to the as-of week was visited.
    CaughtUp,
    /// The source had no bulletin for this period yet.
    Gap { period: Period },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub periods: Vec<PeriodReport>,
    pub stop_reason: StopReason,
    pub rows_written: u64,
}

impl IngestRunSummary {
    pub fn count(&self, matches: impl Fn(&PeriodOutcome) -> bool) -> usize {
        self.periods.iter().filter(|p| matches(&p.outcome)).count()
    }
}

pub struct IngestPipeline {
    store: AlertStore,
    source: Arc<dyn BulletinSource>,
    normalizer: Normalizer,
    archive: Option<ArtifactStore>,
    scanner: PeriodScanner,
    gap_policy: GapPolicy,
    cancel: CancelFlag,
    lock_path: Option<PathBuf>,
}

impl IngestPipeline {
    pub fn new(store: AlertStore, source: Arc<dyn BulletinSource>, normalizer: Normalizer) -> Self {
        Self {
            store,
            source,
            normalizer,
            archive: None,
            scanner: PeriodScanner::new(Period::first_week(2020)),
            gap_policy: GapPolicy::default(),
            cancel: CancelFlag::default(),
            lock_path: None,
        }
    }

    /// Live pipeline: HTTP source, configured taxonomy, archive and lock file.
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let store = config.open_store().await?;
        let http = HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            },
            config.url_template(),
        )?;
        let normalizer = Normalizer::new(ColumnMapping::default(), config.taxonomy()?);
        let mut pipeline = Self::new(store, Arc::new(http), normalizer)
            .with_epoch(config.epoch)
            .with_gap_policy(config.gap_policy);
        if config.archive_raw {
            pipeline = pipeline.with_archive(ArtifactStore::new(config.artifacts_dir.clone()));
        }
        if let Some(db_path) = database_path(&config.database_url) {
            pipeline = pipeline.with_lock_path(lock_path_for(&db_path));
        }
        Ok(pipeline)
    }

    pub fn with_epoch(mut self, epoch: Period) -> Self {
        self.scanner = PeriodScanner::new(epoch);
        self
    }

    pub fn with_gap_policy(mut self, gap_policy: GapPolicy) -> Self {
        self.gap_policy = gap_policy;
        self
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn store(&self) -> &AlertStore {
        &self.store
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn acquire_lock(&self) -> Result<Option<IngestLock>, IngestError> {
        self.lock_path.as_ref().map(IngestLock::acquire).transpose()
    }

    /// Ingests every missing week up to the one containing `as_of`.
    ///
    /// Periods already written stay written when a later period aborts the run.
    pub async fn run_once(&self, as_of: NaiveDate) -> Result<IngestRunSummary, IngestError> {
        let _lock = self.acquire_lock()?;
        self.store.ensure_schema().await.map_err(IngestError::Schema)?;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut state = RunState::Scanning;

        let pending = self
            .scanner
            .scan(&self.store, as_of)
            .await
            .map_err(IngestError::Scan)?;

        let mut periods = Vec::new();
        let mut rows_written = 0u64;
        let mut stop_reason = StopReason::CaughtUp;
        for period in pending {
            if self.cancel.is_cancelled() {
                info!(%period, "ingestion cancelled");
                stop_reason = StopReason::Cancelled;
                break;
            }
            let span = info_span!("ingest_period", %period, %run_id);
            let report = self.ingest_period(period, &mut state).instrument(span).await?;
            let gap = matches!(report.outcome, PeriodOutcome::Missing { .. });
            if let PeriodOutcome::Written { rows } = report.outcome {
                rows_written += rows;
            }
            periods.push(report);
            if gap && self.gap_policy == GapPolicy::StopOnFirstGap {
                stop_reason = StopReason::Gap { period };
                break;
            }
        }
        state.advance(RunState::Done, None);

        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            as_of,
            periods,
            stop_reason,
            rows_written,
        };
        info!(
            %run_id,
            periods = summary.periods.len(),
            rows_written,
            stop_reason = ?summary.stop_reason,
            "ingestion finished"
        );
        Ok(summary)
    }

    async fn ingest_period(&self, period: Period, state: &mut RunState) -> Result<PeriodReport, IngestError> {
        state.advance(RunState::Fetching, Some(period));
        let fetched = self.source.fetch(period).await;
        let url = fetched.url;

        let outcome = match fetched.outcome {
            FetchOutcome::NotFound { status } => {
                info!(%period, status, url = %url, "bulletin not published");
                PeriodOutcome::Missing { http_status: status }
            }
            FetchOutcome::TransientError(message) => {
                return Err(IngestError::FetchTransient { period, url, message });
            }
            FetchOutcome::Found(bytes) => {
                self.archive_payload(period, &bytes).await;
                state.advance(RunState::Normalizing, Some(period));
                match self.normalizer.normalize_payload(&bytes) {
                    Err(err) => {
                        warn!(%period, url = %url, error = %err, "skipping malformed bulletin");
                        PeriodOutcome::Skipped {
                            reason: err.to_string(),
                        }
                    }
                    Ok(records) => {
                        state.advance(RunState::Appending, Some(period));
                        let rows = self
                            .store
                            .append(&records)
                            .await
                            .map_err(|source| IngestError::StoreWrite { period, source })?;
                        info!(%period, rows, "bulletin appended");
                        PeriodOutcome::Written { rows }
                    }
                }
            }
        };
        Ok(PeriodReport { period, url, outcome })
    }

    async fn archive_payload(&self, period: Period, bytes: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        let extension = PayloadKind::sniff(bytes).extension();
        match archive.store_bytes(period, extension, bytes).await {
            Ok(stored) => debug!(
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "archived raw bulletin"
            ),
            Err(err) => warn!(%period, error = %format!("{err:#}"), "failed to archive raw bulletin"),
        }
    }

    /// Loads a local bulletin file through the same decode and append path.
    pub async fn import_file(&self, path: &Path) -> Result<u64> {
        let _lock = self.acquire_lock()?;
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records = self
            .normalizer
            .normalize_payload(&bytes)
            .with_context(|| format!("decoding {}", path.display()))?;
        let rows = self
            .store
            .append(&records)
            .await
            .with_context(|| format!("storing rows from {}", path.display()))?;
        info!(path = %path.display(), rows, "imported bulletin file");
        Ok(rows)
    }

    pub async fn export_parquet_snapshot(&self, out_dir: &Path) -> Result<PathBuf> {
        let records = self.store.read_all().await.context("reading rasff_data")?;
        export_snapshot(out_dir, &records).await
    }
}

/// Writes `ingest_summary.json` and `ingest_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &IngestRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing ingest summary")?;
    fs::write(reports_dir.join("ingest_summary.json"), json)
        .await
        .context("writing ingest_summary.json")?;

    let stop = match &summary.stop_reason {
        StopReason::CaughtUp => "caught up".to_string(),
        StopReason::Gap { period } => format!("no bulletin yet for {period}"),
        StopReason::Cancelled => "cancelled".to_string(),
    };
    let lines = summary
        .periods
        .iter()
        .map(|p| match &p.outcome {
            PeriodOutcome::Written { rows } => format!("- {}: {rows} rows", p.period),
            PeriodOutcome::Missing { http_status } => format!("- {}: missing (HTTP {http_status})", p.period),
            PeriodOutcome::Skipped { reason } => format!("- {}: skipped ({reason})", p.period),
        })
        .collect::<Vec<_>>();
    let brief = format!(
        "# RASFF Ingestion Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- As of: {}\n- Rows written: {}\n- Stopped: {}\n\n## Periods\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.as_of,
        summary.rows_written,
        stop,
        if lines.is_empty() {
            "- none".to_string()
        } else {
            lines.join("\n")
        }
    );
    fs::write(reports_dir.join("ingest_brief.md"), brief)
        .await
        .context("writing ingest_brief.md")?;

    Ok(reports_dir)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub as_of: Option<NaiveDate>,
    pub write_report: bool,
    pub cancel: CancelFlag,
}

/// One full ingestion with the given config. The as-of date defaults to today.
pub async fn run_ingest(config: &IngestConfig, options: RunOptions) -> Result<IngestRunSummary> {
    let pipeline = IngestPipeline::from_config(config)
        .await?
        .with_cancel_flag(options.cancel);
    let as_of = options.as_of.unwrap_or_else(|| Local::now().date_naive());
    let summary = pipeline.run_once(as_of).await?;
    pipeline.store().close().await;
    if options.write_report {
        let dir = write_reports(&config.reports_root(), &summary).await?;
        info!(reports_dir = %dir.display(), "wrote ingest reports");
    }
    Ok(summary)
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env()?;
    run_ingest(
        &config,
        RunOptions {
            write_report: true,
            ..Default::default()
        },
    )
    .await
}

/// Weekly ingestion job, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(config: &IngestConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            let options = RunOptions {
                write_report: true,
                ..Default::default()
            };
            match run_ingest(&config, options).await {
                Ok(summary) => info!(run_id = %summary.run_id, rows = summary.rows_written, "scheduled ingestion done"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rasff_storage::FetchResult;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const HEADER: &str = "Date;Reference;Notifying Country;Origin;Category;Subject;Hazards;Classification\n";

    fn p(year: i32, week: u32) -> Period {
        Period::new(year, week).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// One bulletin row per `(dd/mm/yyyy, reference)`.
    fn bulletin(rows: &[(&str, &str)]) -> Vec<u8> {
        let mut text = HEADER.to_string();
        for (day, reference) in rows {
            text.push_str(&format!(
                "{day};{reference};France;Spain;Fruits and vegetables;Pesticide residues in peppers;chlorpyrifos;alert notification\n"
            ));
        }
        text.into_bytes()
    }

    #[derive(Default)]
    struct FakeSource {
        responses: HashMap<Period, FetchOutcome>,
        calls: Mutex<Vec<Period>>,
    }

    impl FakeSource {
        fn with(mut self, period: Period, outcome: FetchOutcome) -> Self {
            self.responses.insert(period, outcome);
            self
        }

        fn calls(&self) -> Vec<Period> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BulletinSource for FakeSource {
        fn url_for(&self, period: Period) -> String {
            format!("fake://{period}")
        }

        async fn fetch(&self, period: Period) -> FetchResult {
            self.calls.lock().unwrap().push(period);
            FetchResult {
                period,
                url: self.url_for(period),
                outcome: self
                    .responses
                    .get(&period)
                    .cloned()
                    .unwrap_or(FetchOutcome::NotFound { status: 404 }),
            }
        }
    }

    async fn pipeline(source: Arc<FakeSource>, epoch: Period) -> (TempDir, IngestPipeline) {
        let dir = tempdir().unwrap();
        let store = AlertStore::open_path(dir.path().join("rasff_data.db")).await.unwrap();
        let normalizer = Normalizer::new(ColumnMapping::default(), Taxonomy::builtin().unwrap());
        let pipeline = IngestPipeline::new(store, source, normalizer).with_epoch(epoch);
        (dir, pipeline)
    }

    #[tokio::test]
    async fn ingests_consecutive_weeks_until_the_first_gap() {
        let source = Arc::new(
            FakeSource::default()
                .with(p(2024, 10), FetchOutcome::Found(bulletin(&[("05/03/2024", "2024.1")])))
                .with(
                    p(2024, 11),
                    FetchOutcome::Found(bulletin(&[("12/03/2024", "2024.2"), ("13/03/2024", "2024.3")])),
                ),
        );
        let (_dir, pipeline) = pipeline(source.clone(), p(2024, 10)).await;

        let summary = pipeline.run_once(date(2024, 3, 27)).await.unwrap();
        assert_eq!(summary.rows_written, 3);
        assert_eq!(summary.stop_reason, StopReason::Gap { period: p(2024, 12) });
        assert_eq!(source.calls(), vec![p(2024, 10), p(2024, 11), p(2024, 12)]);

        let rows = pipeline.store().read_all().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].prodcat, "Fruits and vegetables");
        assert_eq!(rows[0].hazcat, "Chlorpyrifos");
        assert_eq!(pipeline.store().latest_period().await.unwrap(), Some(p(2024, 11)));
    }

    #[tokio::test]
    async fn second_run_resumes_after_latest_stored_week() {
        let source = Arc::new(
            FakeSource::default()
                .with(p(2024, 10), FetchOutcome::Found(bulletin(&[("05/03/2024", "2024.1")])))
                .with(p(2024, 11), FetchOutcome::Found(bulletin(&[("12/03/2024", "2024.2")]))),
        );
        let (_dir, pipeline) = pipeline(source.clone(), p(2024, 10)).await;
        pipeline.run_once(date(2024, 3, 13)).await.unwrap();
        assert_eq!(source.calls(), vec![p(2024, 10), p(2024, 11)]);

        let summary = pipeline.run_once(date(2024, 3, 27)).await.unwrap();
        assert_eq!(summary.periods.len(), 1);
        assert_eq!(summary.periods[0].period, p(2024, 12));
    }

    #[tokio::test]
    async fn missing_first_period_leaves_store_unchanged() {
        let source = Arc::new(FakeSource::default());
        let (_dir, pipeline) = pipeline(source, p(2024, 10)).await;

        let summary = pipeline.run_once(date(2024, 3, 27)).await.unwrap();
        assert_eq!(summary.rows_written, 0);
        assert_eq!(
            summary.periods,
            vec![PeriodReport {
                period: p(2024, 10),
                url: "fake://2024-W10".into(),
                outcome: PeriodOutcome::Missing { http_status: 404 },
            }]
        );
        assert_eq!(pipeline.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skip_and_continue_scans_past_gaps() {
        let source = Arc::new(
            FakeSource::default().with(p(2024, 12), FetchOutcome::Found(bulletin(&[("19/03/2024", "2024.9")]))),
        );
        let (_dir, pipeline) = pipeline(source, p(2024, 10)).await;
        let pipeline = pipeline.with_gap_policy(GapPolicy::SkipAndContinue);

        let summary = pipeline.run_once(date(2024, 3, 27)).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::CaughtUp);
        assert_eq!(summary.periods.len(), 4);
        assert_eq!(summary.count(|o| matches!(o, PeriodOutcome::Missing { .. })), 3);
        assert_eq!(summary.rows_written, 1);
    }

    #[tokio::test]
    async fn malformed_bulletin_is_skipped_and_the_run_continues() {
        let source = Arc::new(
            FakeSource::default()
                .with(
                    p(2024, 10),
                    FetchOutcome::Found(b"<html><title>Maintenance</title></html>".to_vec()),
                )
                .with(p(2024, 11), FetchOutcome::Found(bulletin(&[("12/03/2024", "2024.2")]))),
        );
        let (_dir, pipeline) = pipeline(source, p(2024, 10)).await;

        let summary = pipeline.run_once(date(2024, 3, 13)).await.unwrap();
        assert!(matches!(summary.periods[0].outcome, PeriodOutcome::Skipped { .. }));
        assert_eq!(summary.periods[1].outcome, PeriodOutcome::Written { rows: 1 });
        assert_eq!(summary.stop_reason, StopReason::CaughtUp);
    }

    #[tokio::test]
    async fn transient_error_aborts_but_keeps_earlier_weeks() {
        let source = Arc::new(
            FakeSource::default()
                .with(p(2024, 10), FetchOutcome::Found(bulletin(&[("05/03/2024", "2024.1")])))
                .with(p(2024, 11), FetchOutcome::TransientError("connection reset".into())),
        );
        let (_dir, pipeline) = pipeline(source, p(2024, 10)).await;

        let err = pipeline.run_once(date(2024, 3, 27)).await.unwrap_err();
        assert!(matches!(err, IngestError::FetchTransient { period, .. } if period == p(2024, 11)));
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_failure_rolls_back_the_period() {
        let source = Arc::new(FakeSource::default().with(
            p(2024, 10),
            FetchOutcome::Found(bulletin(&[("05/03/2024", "2024.1"), ("06/03/2024", "BOOM")])),
        ));
        let (_dir, pipeline) = pipeline(source, p(2024, 10)).await;
        pipeline.store().ensure_schema().await.unwrap();
        sqlx_trigger(pipeline.store()).await;

        let err = pipeline.run_once(date(2024, 3, 6)).await.unwrap_err();
        assert!(matches!(err, IngestError::StoreWrite { .. }));
        assert_eq!(pipeline.store().count().await.unwrap(), 0);
    }

    async fn sqlx_trigger(store: &AlertStore) {
        sqlx::query(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON rasff_data \
             WHEN NEW.reference = 'BOOM' BEGIN SELECT RAISE(ABORT, 'simulated write failure'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cancelled_run_fetches_nothing() {
        let source = Arc::new(FakeSource::default());
        let (_dir, pipeline) = pipeline(source.clone(), p(2024, 10)).await;
        let cancel = CancelFlag::new();
        let pipeline = pipeline.with_cancel_flag(cancel.clone());
        cancel.cancel();

        let summary = pipeline.run_once(date(2024, 3, 27)).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn held_lock_rejects_a_second_run() {
        let source = Arc::new(FakeSource::default());
        let (dir, pipeline) = pipeline(source, p(2024, 10)).await;
        let lock_path = lock_path_for(&dir.path().join("rasff_data.db"));
        let pipeline = pipeline.with_lock_path(&lock_path);

        let held = IngestLock::acquire(&lock_path).unwrap();
        let err = pipeline.run_once(date(2024, 3, 27)).await.unwrap_err();
        assert!(matches!(err, IngestError::Locked { .. }));
        assert!(matches!(IngestLock::acquire(&lock_path), Err(IngestError::Locked { .. })));

        drop(held);
        pipeline.run_once(date(2024, 3, 27)).await.unwrap();
        pipeline.run_once(date(2024, 3, 27)).await.unwrap();
    }

    #[tokio::test]
    async fn lock_file_left_by_a_killed_run_is_reclaimed() {
        let source = Arc::new(
            FakeSource::default().with(p(2024, 10), FetchOutcome::Found(bulletin(&[("05/03/2024", "2024.1")]))),
        );
        let (dir, pipeline) = pipeline(source, p(2024, 10)).await;
        let lock_path = lock_path_for(&dir.path().join("rasff_data.db"));
        std::fs::write(&lock_path, "999999\n").unwrap();
        let pipeline = pipeline.with_lock_path(&lock_path);

        let summary = pipeline.run_once(date(2024, 3, 6)).await.unwrap();
        assert_eq!(summary.rows_written, 1);
        let owner = std::fs::read_to_string(&lock_path).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
        pipeline.run_once(date(2024, 3, 6)).await.unwrap();
    }

    #[tokio::test]
    async fn found_bulletins_are_archived_by_hash() {
        let payload = bulletin(&[("05/03/2024", "2024.1")]);
        let source = Arc::new(FakeSource::default().with(p(2024, 10), FetchOutcome::Found(payload.clone())));
        let (dir, pipeline) = pipeline(source, p(2024, 10)).await;
        let pipeline = pipeline.with_archive(ArtifactStore::new(dir.path().join("artifacts")));

        pipeline.run_once(date(2024, 3, 6)).await.unwrap();
        let expected = dir
            .path()
            .join("artifacts/2024/W10")
            .join(format!("{}.csv", ArtifactStore::sha256_hex(&payload)));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn import_file_appends_local_bulletin() {
        let (dir, pipeline) = pipeline(Arc::new(FakeSource::default()), p(2024, 10)).await;
        let file = dir.path().join("upload.csv");
        std::fs::write(&file, bulletin(&[("05/03/2024", "2024.1"), ("06/03/2024", "2024.2")])).unwrap();

        assert_eq!(pipeline.import_file(&file).await.unwrap(), 2);
        assert_eq!(pipeline.store().count().await.unwrap(), 2);
        assert!(pipeline.import_file(&dir.path().join("absent.csv")).await.is_err());
    }

    #[tokio::test]
    async fn reports_are_written_per_run() {
        let source = Arc::new(
            FakeSource::default().with(p(2024, 10), FetchOutcome::Found(bulletin(&[("05/03/2024", "2024.1")]))),
        );
        let (dir, pipeline) = pipeline(source, p(2024, 10)).await;
        let summary = pipeline.run_once(date(2024, 3, 13)).await.unwrap();

        let reports_dir = write_reports(&dir.path().join("reports"), &summary).await.unwrap();
        assert!(reports_dir.ends_with(summary.run_id.to_string()));
        let parsed: IngestRunSummary =
            serde_json::from_slice(&std::fs::read(reports_dir.join("ingest_summary.json")).unwrap()).unwrap();
        assert_eq!(parsed.periods, summary.periods);
        let brief = std::fs::read_to_string(reports_dir.join("ingest_brief.md")).unwrap();
        assert!(brief.contains("2024-W10: 1 rows"));
        assert!(brief.contains("no bulletin yet for 2024-W11"));
    }

    #[test]
    fn gap_policy_parses_cli_and_env_spellings() {
        assert_eq!("stop-on-first-gap".parse::<GapPolicy>().unwrap(), GapPolicy::StopOnFirstGap);
        assert_eq!("SKIP_AND_CONTINUE".parse::<GapPolicy>().unwrap(), GapPolicy::SkipAndContinue);
        assert!("sometimes".parse::<GapPolicy>().is_err());
    }

    #[test]
    fn database_urls_map_to_lockable_paths() {
        assert_eq!(database_path("sqlite://rasff_data.db"), Some(PathBuf::from("rasff_data.db")));
        assert_eq!(database_path("sqlite:/var/lib/rasff.db?mode=rwc"), Some(PathBuf::from("/var/lib/rasff.db")));
        assert_eq!(database_path("sqlite::memory:"), None);
        assert_eq!(lock_path_for(Path::new("data/rasff.db")), PathBuf::from("data/rasff.db.lock"));
    }
}
