//! Bootstrap coordination.
//!
//! A `Bootstrapper` run goes through these steps inside one transaction scope:
//! 1. Load and validate the configuration
//! 2. Upsert events
//! 3. Upsert ticket types for each event
//! 4. Flatten and write settings
//! 5. Resolve and upsert admin access grants
//! 6. Verify integrity, then commit (or roll back on any failure)

use crate::config::LoaderConfig;
use crate::db::Database;
use crate::error::LoaderError;
use crate::loader::batch::{BatchInsertOptions, ConflictAction, DEFAULT_CHUNK_SIZE, safe_batch_insert};
use crate::loader::data_structures::{Record, Row, SqlValue, UpsertAction, UpsertResult};
use crate::loader::integrity::{
    ForeignKeyExpectation, IntegrityExpectations, IntegrityReport, UniqueExpectation,
    verify_integrity,
};
use crate::loader::settings::{flatten_settings, merge_settings};
use crate::loader::stats::{OperationStats, StatsSnapshot};
use crate::loader::transaction::TransactionOptions;
use crate::loader::upsert::{UpsertOptions, safe_upsert};
use crate::models::{BootstrapConfig, ConfigSource, EventSeed, TicketTypeSeed};
use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, retry, with_timeout};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub const EVENTS_TABLE: &str = "events";
pub const TICKET_TYPES_TABLE: &str = "ticket_types";
pub const SETTINGS_TABLE: &str = "event_settings";
pub const ACCESS_TABLE: &str = "admin_event_access";

const SETTINGS_COLUMNS: [&str; 3] = ["event_id", "key", "value"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapOptions {
    /// Rows per settings batch statement
    pub chunk_size: usize,
    /// Deadline and rollback policy for the load's single transaction
    pub transaction: TransactionOptions,
    /// Upsert settings instead of seeding them with INSERT OR IGNORE.
    /// Off by default so values edited after the first run survive.
    pub overwrite_settings: bool,
    /// Run and verify everything, then roll back.
    pub dry_run: bool,
    /// Attempts for the connectivity probe, including the first
    pub retry_attempts: usize,
    /// Backoff before the first probe retry
    pub retry_base_delay: Duration,
    /// Limit for each connectivity probe
    pub probe_timeout: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            transaction: TransactionOptions::default(),
            overwrite_settings: false,
            dry_run: false,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_BASE_DELAY,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&LoaderConfig> for BootstrapOptions {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            transaction: TransactionOptions {
                timeout: config.transaction_timeout,
                rollback_on_error: true,
            },
            overwrite_settings: config.overwrite_settings,
            dry_run: false,
            retry_attempts: config.retry_attempts,
            retry_base_delay: config.retry_base_delay,
            probe_timeout: config.connect_timeout,
        }
    }
}

/// How one configured event was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    /// Event slug from the configuration
    pub slug: String,
    /// Row id in the events table
    pub id: i64,
    /// Inserted on first load, updated afterwards
    pub action: UpsertAction,
}

/// Per-step write counts of one load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    /// New rows
    pub inserted: usize,
    /// Existing rows refreshed
    pub updated: usize,
    /// Existing rows left as they were
    pub skipped: usize,
}

impl StepCounts {
    fn add(&mut self, result: &UpsertResult) {
        match result.action {
            UpsertAction::Inserted => self.inserted += 1,
            UpsertAction::Updated => self.updated += 1,
            UpsertAction::Skipped => self.skipped += 1,
        }
    }
}

/// What a successful load wrote.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// One entry per configured event, in configuration order
    pub events: Vec<EventOutcome>,
    /// Ticket type writes
    pub ticket_types: StepCounts,
    /// Setting writes
    pub settings: StepCounts,
    /// Admin access grant writes, after wildcard expansion
    pub access_grants: StepCounts,
    /// Verification run before commit; always passed for a returned report
    pub integrity: IntegrityReport,
    /// False for dry runs
    pub committed: bool,
}

/// Result of one run: the statistics are always present, whatever the outcome.
#[derive(Debug)]
pub struct BootstrapRun {
    /// Counters gathered up to the point the run ended
    pub stats: StatsSnapshot,
    /// The report, or the error that stopped the run
    pub outcome: Result<LoadReport, LoaderError>,
}

impl BootstrapRun {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Process exit code for the invoking CLI or cron job.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn error_message(&self) -> Option<String> {
        self.outcome.as_ref().err().map(|err| err.to_string())
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            Ok(report) if report.committed => format!("bootstrap complete: {}", self.stats.summary()),
            Ok(_) => format!("bootstrap dry run rolled back: {}", self.stats.summary()),
            Err(err) => format!("bootstrap failed: {}; {}", err, self.stats.summary()),
        }
    }
}

/// One admin access grant after wildcard expansion and de-duplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGrant {
    /// Trimmed, lowercased email
    pub email: String,
    /// Role granted on the event
    pub role: String,
    /// Slug of a configured event
    pub event_slug: String,
}

/// Expand wildcard grants and drop duplicate (email, event) pairs; the last
/// role listed for a pair wins.
pub fn resolve_grants(config: &BootstrapConfig) -> Result<Vec<ResolvedGrant>, LoaderError> {
    let mut resolved: Vec<ResolvedGrant> = Vec::new();
    let mut positions: HashMap<(String, String), usize> = HashMap::new();

    for access in config.admin_access.as_slice() {
        let email = access.email.trim().to_lowercase();
        let slugs: Vec<&str> = if access.is_wildcard() {
            config.events.iter().map(|event| event.slug.as_str()).collect()
        } else {
            access.events.iter().map(String::as_str).collect()
        };

        for slug in slugs {
            if !config.events.iter().any(|event| event.slug == slug) {
                return Err(LoaderError::validation(format!(
                    "admin access for '{email}' references unknown event '{slug}'"
                )));
            }

            let grant = ResolvedGrant {
                email: email.clone(),
                role: access.role.clone(),
                event_slug: slug.to_string(),
            };
            match positions.get(&(email.clone(), slug.to_string())) {
                Some(&index) => resolved[index] = grant,
                None => {
                    positions.insert((email.clone(), slug.to_string()), resolved.len());
                    resolved.push(grant);
                }
            }
        }
    }

    Ok(resolved)
}

/// Settings each event receives: defaults deep-merged under the event's own.
fn event_settings(config: &BootstrapConfig, event: &EventSeed) -> Vec<(String, String)> {
    flatten_settings(&merge_settings(&config.defaults.settings, &event.settings))
}

/// Expectations a correct load of `config` must satisfy.
pub fn derive_expectations(
    config: &BootstrapConfig,
) -> Result<IntegrityExpectations, LoaderError> {
    let ticket_types: usize = config.events.iter().map(|e| e.ticket_types.len()).sum();
    let settings: usize = config
        .events
        .iter()
        .map(|event| event_settings(config, event).len())
        .sum();
    let grants = resolve_grants(config)?.len();

    let table_counts = BTreeMap::from([
        (EVENTS_TABLE.to_string(), config.events.len() as i64),
        (TICKET_TYPES_TABLE.to_string(), ticket_types as i64),
        (SETTINGS_TABLE.to_string(), settings as i64),
        (ACCESS_TABLE.to_string(), grants as i64),
    ]);

    Ok(IntegrityExpectations {
        table_counts,
        foreign_keys: vec![
            ForeignKeyExpectation::new(TICKET_TYPES_TABLE, "event_id", EVENTS_TABLE, "id"),
            ForeignKeyExpectation::new(SETTINGS_TABLE, "event_id", EVENTS_TABLE, "id"),
            ForeignKeyExpectation::new(ACCESS_TABLE, "event_id", EVENTS_TABLE, "id"),
        ],
        unique_constraints: vec![
            UniqueExpectation::new(EVENTS_TABLE, &["slug"]),
            UniqueExpectation::new(TICKET_TYPES_TABLE, &["event_id", "name"]),
            UniqueExpectation::new(SETTINGS_TABLE, &["event_id", "key"]),
            UniqueExpectation::new(ACCESS_TABLE, &["email", "event_id"]),
        ],
    })
}

fn json_or_null(map: &Map<String, Value>) -> Result<SqlValue, LoaderError> {
    if map.is_empty() {
        return Ok(SqlValue::Null);
    }
    serde_json::to_string(map)
        .map(SqlValue::Text)
        .map_err(|e| LoaderError::validation(format!("unserializable value: {e}")))
}

fn event_record(event: &EventSeed) -> Result<Record, LoaderError> {
    Ok(Record::new()
        .with("slug", &event.slug)
        .with("name", &event.name)
        .with("event_type", &event.event_type)
        .with("status", &event.status)
        .with("start_date", event.dates.start.clone())
        .with("end_date", event.dates.end.clone())
        .with("date_details", json_or_null(&event.dates.extra)?)
        .with("venue_name", event.venue.name.clone())
        .with("venue_details", json_or_null(&event.venue.details)?))
}

fn ticket_type_record(event_id: i64, ticket: &TicketTypeSeed) -> Result<Record, LoaderError> {
    Ok(Record::new()
        .with("event_id", event_id)
        .with("name", &ticket.name)
        .with("price", ticket.price)
        .with("capacity", ticket.capacity)
        .with("metadata", json_or_null(&ticket.metadata)?))
}

fn resolved_id(result: &UpsertResult, table: &str, key: &str) -> Result<i64, LoaderError> {
    result.id.ok_or_else(|| {
        LoaderError::validation(format!("no row id resolved for {table} '{key}'"))
    })
}

/// Drives bootstrap runs against one database handle.
pub struct Bootstrapper {
    db: Database,
    options: BootstrapOptions,
}

impl Bootstrapper {
    pub fn new(db: Database, options: BootstrapOptions) -> Self {
        Self { db, options }
    }

    pub fn options(&self) -> &BootstrapOptions {
        &self.options
    }

    /// Run one bootstrap. Never panics on loader errors; the outcome and the
    /// statistics gathered so far are returned together.
    pub async fn run(&self, source: &dyn ConfigSource) -> BootstrapRun {
        let stats = OperationStats::new();
        let outcome = self.execute(source, &stats).await;
        stats.finish();

        if let Err(err) = &outcome {
            log::error!("bootstrap failed: {}", err);
            stats.record_error(err.to_string());
        }

        let run = BootstrapRun {
            stats: stats.snapshot(),
            outcome,
        };
        log::info!("{}", run.summary());
        run
    }

    async fn execute(
        &self,
        source: &dyn ConfigSource,
        stats: &OperationStats,
    ) -> Result<LoadReport, LoaderError> {
        let config = source.load()?;
        config.validate()?;
        log::info!(
            "bootstrapping {} events (environment '{}', config version '{}')",
            config.events.len(),
            config.environment,
            config.version
        );

        let probe_timeout = self.options.probe_timeout;
        retry(
            || with_timeout(self.db.ping(), probe_timeout, "database connectivity probe"),
            self.options.retry_attempts,
            self.options.retry_base_delay,
        )
        .await?;

        let mut scope = self.db.coordinator().begin(self.options.transaction).await?;
        let remaining = scope.remaining();
        let loaded = with_timeout(
            self.load(scope.connection(), stats, &config),
            remaining,
            "bootstrap load",
        )
        .await;

        let report = match loaded {
            Ok(report) => report,
            Err(err) => {
                if let Err(rollback_err) = scope.rollback().await {
                    log::error!("rollback after failed load also failed: {}", rollback_err);
                }
                return Err(err);
            }
        };

        if let Err(err) = report.integrity.clone().into_result() {
            log::warn!("integrity verification failed, rolling back");
            scope.rollback().await?;
            return Err(err);
        }

        if self.options.dry_run {
            scope.rollback().await?;
            log::info!("dry run complete, all changes rolled back");
            return Ok(LoadReport {
                committed: false,
                ..report
            });
        }

        scope.commit().await?;
        Ok(report)
    }

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        stats: &OperationStats,
        config: &BootstrapConfig,
    ) -> Result<LoadReport, LoaderError> {
        let events = self.load_events(conn, stats, config).await?;
        let event_ids: HashMap<&str, i64> = events
            .iter()
            .map(|outcome| (outcome.slug.as_str(), outcome.id))
            .collect();

        let ticket_types = self.load_ticket_types(conn, stats, config, &event_ids).await?;
        let settings = self.load_settings(conn, stats, config, &event_ids).await?;
        let access_grants = self.load_access(conn, stats, config, &event_ids).await?;

        let expectations = derive_expectations(config)?;
        let integrity = verify_integrity(conn, stats, &expectations).await;

        Ok(LoadReport {
            events,
            ticket_types,
            settings,
            access_grants,
            integrity,
            committed: true,
        })
    }

    async fn load_events(
        &self,
        conn: &mut SqliteConnection,
        stats: &OperationStats,
        config: &BootstrapConfig,
    ) -> Result<Vec<EventOutcome>, LoaderError> {
        let mut outcomes = Vec::with_capacity(config.events.len());
        for event in &config.events {
            let record = event_record(event)?;
            let result = safe_upsert(
                conn,
                stats,
                EVENTS_TABLE,
                &record,
                &["slug"],
                &UpsertOptions::default(),
            )
            .await?;
            log::debug!("event '{}': {}", event.slug, result.action);

            outcomes.push(EventOutcome {
                slug: event.slug.clone(),
                id: resolved_id(&result, EVENTS_TABLE, &event.slug)?,
                action: result.action,
            });
        }

        log::info!("loaded {} events", outcomes.len());
        Ok(outcomes)
    }

    async fn load_ticket_types(
        &self,
        conn: &mut SqliteConnection,
        stats: &OperationStats,
        config: &BootstrapConfig,
        event_ids: &HashMap<&str, i64>,
    ) -> Result<StepCounts, LoaderError> {
        let mut counts = StepCounts::default();
        for event in &config.events {
            let event_id = event_ids[event.slug.as_str()];
            for ticket in &event.ticket_types {
                let result = safe_upsert(
                    conn,
                    stats,
                    TICKET_TYPES_TABLE,
                    &ticket_type_record(event_id, ticket)?,
                    &["event_id", "name"],
                    &UpsertOptions::default(),
                )
                .await?;
                counts.add(&result);
            }
        }

        log::info!(
            "ticket types: {} inserted, {} updated, {} skipped",
            counts.inserted,
            counts.updated,
            counts.skipped
        );
        Ok(counts)
    }

    async fn load_settings(
        &self,
        conn: &mut SqliteConnection,
        stats: &OperationStats,
        config: &BootstrapConfig,
        event_ids: &HashMap<&str, i64>,
    ) -> Result<StepCounts, LoaderError> {
        let mut counts = StepCounts::default();

        if self.options.overwrite_settings {
            for event in &config.events {
                let event_id = event_ids[event.slug.as_str()];
                for (key, value) in event_settings(config, event) {
                    let record = Record::new()
                        .with("event_id", event_id)
                        .with("key", key)
                        .with("value", value);
                    let result = safe_upsert(
                        conn,
                        stats,
                        SETTINGS_TABLE,
                        &record,
                        &["event_id", "key"],
                        &UpsertOptions::default(),
                    )
                    .await?;
                    counts.add(&result);
                }
            }
        } else {
            let mut rows: Vec<Row> = Vec::new();
            for event in &config.events {
                let event_id = event_ids[event.slug.as_str()];
                for (key, value) in event_settings(config, event) {
                    rows.push(vec![
                        SqlValue::Integer(event_id),
                        SqlValue::Text(key),
                        SqlValue::Text(value),
                    ]);
                }
            }

            let options = BatchInsertOptions {
                chunk_size: self.options.chunk_size,
                conflict_action: ConflictAction::Ignore,
                validate_data: true,
            };
            let result =
                safe_batch_insert(conn, stats, SETTINGS_TABLE, &SETTINGS_COLUMNS, &rows, &options)
                    .await?;
            counts.inserted = result.inserted;
            counts.skipped = result.skipped;
        }

        log::info!(
            "settings: {} inserted, {} updated, {} skipped",
            counts.inserted,
            counts.updated,
            counts.skipped
        );
        Ok(counts)
    }

    async fn load_access(
        &self,
        conn: &mut SqliteConnection,
        stats: &OperationStats,
        config: &BootstrapConfig,
        event_ids: &HashMap<&str, i64>,
    ) -> Result<StepCounts, LoaderError> {
        let mut counts = StepCounts::default();
        for grant in resolve_grants(config)? {
            let record = Record::new()
                .with("email", &grant.email)
                .with("role", &grant.role)
                .with("event_id", event_ids[grant.event_slug.as_str()]);
            let result = safe_upsert(
                conn,
                stats,
                ACCESS_TABLE,
                &record,
                &["email", "event_id"],
                &UpsertOptions::default(),
            )
            .await?;
            counts.add(&result);
        }

        log::info!(
            "access grants: {} inserted, {} updated, {} skipped",
            counts.inserted,
            counts.updated,
            counts.skipped
        );
        Ok(counts)
    }
}
