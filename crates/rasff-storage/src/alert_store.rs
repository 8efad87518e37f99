use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rasff_core::{AlertRecord, Period, UNKNOWN_LABEL};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const ALERTS_TABLE: &str = "rasff_data";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://rasff_data.db";

const NATURAL_KEY_INDEX: &str = "rasff_data_natural_key";

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS rasff_data (
    date_of_case TEXT,
    reference TEXT,
    notification_from TEXT,
    country_origin TEXT,
    product TEXT,
    product_category TEXT,
    hazard_substance TEXT,
    hazard_category TEXT,
    prodcat TEXT,
    groupprod TEXT,
    hazcat TEXT,
    grouphaz TEXT,
    year INTEGER,
    week INTEGER
)
"#;

/// Declared types for columns added to tables created by older releases.
const COLUMN_TYPES: [(&str, &str); 14] = [
    ("date_of_case", "TEXT"),
    ("reference", "TEXT"),
    ("notification_from", "TEXT"),
    ("country_origin", "TEXT"),
    ("product", "TEXT"),
    ("product_category", "TEXT"),
    ("hazard_substance", "TEXT"),
    ("hazard_category", "TEXT"),
    ("prodcat", "TEXT"),
    ("groupprod", "TEXT"),
    ("hazcat", "TEXT"),
    ("grouphaz", "TEXT"),
    ("year", "INTEGER"),
    ("week", "INTEGER"),
];

const COLLAPSE_DUPLICATES_SQL: &str = r#"
DELETE FROM rasff_data
 WHERE reference IS NOT NULL
   AND date_of_case IS NOT NULL
   AND rowid NOT IN (
       SELECT MIN(rowid)
         FROM rasff_data
        WHERE reference IS NOT NULL
          AND date_of_case IS NOT NULL
        GROUP BY reference, date_of_case
   )
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO rasff_data (
    date_of_case, reference, notification_from, country_origin,
    product, product_category, hazard_substance, hazard_category,
    prodcat, groupprod, hazcat, grouphaz, year, week
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(reference, date_of_case) DO UPDATE SET
    notification_from = excluded.notification_from,
    country_origin = excluded.country_origin,
    product = excluded.product,
    product_category = excluded.product_category,
    hazard_substance = excluded.hazard_substance,
    hazard_category = excluded.hazard_category,
    prodcat = excluded.prodcat,
    groupprod = excluded.groupprod,
    hazcat = excluded.hazcat,
    grouphaz = excluded.grouphaz,
    year = excluded.year,
    week = excluded.week
"#;

const NORMALIZE_LEGACY_DATES_SQL: &str = r#"
UPDATE rasff_data
   SET date_of_case = substr(date_of_case, 1, 10)
 WHERE length(date_of_case) > 10
"#;

const SELECT_ALL_SQL: &str = r#"
SELECT CAST(date_of_case AS TEXT) AS date_of_case,
       CAST(reference AS TEXT) AS reference,
       CAST(notification_from AS TEXT) AS notification_from,
       CAST(country_origin AS TEXT) AS country_origin,
       CAST(product AS TEXT) AS product,
       CAST(product_category AS TEXT) AS product_category,
       CAST(hazard_substance AS TEXT) AS hazard_substance,
       CAST(hazard_category AS TEXT) AS hazard_category,
       CAST(prodcat AS TEXT) AS prodcat,
       CAST(groupprod AS TEXT) AS groupprod,
       CAST(hazcat AS TEXT) AS hazcat,
       CAST(grouphaz AS TEXT) AS grouphaz,
       CAST(year AS INTEGER) AS year,
       CAST(week AS INTEGER) AS week
  FROM rasff_data
 ORDER BY rowid
"#;

const SELECT_PERIODS_SQL: &str = r#"
SELECT DISTINCT CAST(year AS INTEGER) AS year,
                CAST(week AS INTEGER) AS week
  FROM rasff_data
 WHERE year IS NOT NULL
   AND week IS NOT NULL
 ORDER BY 1 DESC, 2 DESC
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The `rasff_data` table. The schema is created on first use.
///
/// Writes are upserts on `(reference, date_of_case)`; rows missing either
/// part of that key never conflict and are always inserted.
#[derive(Debug, Clone)]
pub struct AlertStore {
    pool: SqlitePool,
    schema_ready: Arc<OnceCell<()>>,
}

impl AlertStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with(parse_url(database_url)?.create_if_missing(true)).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref()).create_if_missing(true)).await
    }

    /// Opens an existing database without write access. Nothing is created
    /// or migrated through this handle.
    pub async fn connect_read_only(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with(parse_url(database_url)?.read_only(true)).await
    }

    pub async fn open_path_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref()).read_only(true)).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.busy_timeout(Duration::from_secs(5)))
            .await?;
        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Idempotent. Also upgrades tables written by older releases: missing
    /// columns are added, dates truncated to `YYYY-MM-DD`, year/week
    /// re-derived from them and duplicate natural keys collapsed to the first row.
    ///
    /// Only write paths call this. Reads never alter the table.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema_ready
            .get_or_try_init(|| migrate(&self.pool))
            .await?;
        Ok(())
    }

    /// Writes all records in one transaction. On error nothing is committed.
    pub async fn append(&self, records: &[AlertRecord]) -> Result<u64, StoreError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for record in records {
            written += sqlx::query(UPSERT_SQL)
                .bind(record.date_of_case.map(|d| d.format("%Y-%m-%d").to_string()))
                .bind(record.reference.as_deref())
                .bind(record.notification_from.as_deref())
                .bind(record.country_origin.as_deref())
                .bind(record.product.as_deref())
                .bind(record.product_category.as_deref())
                .bind(record.hazard_substance.as_deref())
                .bind(record.hazard_category.as_deref())
                .bind(record.prodcat.as_str())
                .bind(record.groupprod.as_str())
                .bind(record.hazcat.as_str())
                .bind(record.grouphaz.as_str())
                .bind(record.year.map(i64::from))
                .bind(record.week.map(i64::from))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// All rows in insertion order. Empty when the table does not exist yet.
    pub async fn read_all(&self) -> Result<Vec<AlertRecord>, StoreError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(SELECT_ALL_SQL).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Greatest valid `(year, week)` among stored rows.
    pub async fn latest_period(&self) -> Result<Option<Period>, StoreError> {
        if !self.table_exists().await? {
            return Ok(None);
        }
        let rows = sqlx::query(SELECT_PERIODS_SQL).fetch_all(&self.pool).await?;
        for row in rows {
            let year: i64 = row.try_get("year")?;
            let week: i64 = row.try_get("week")?;
            let (Ok(year), Ok(week)) = (i32::try_from(year), u32::try_from(week)) else {
                continue;
            };
            if let Ok(period) = Period::new(year, week) {
                return Ok(Some(period));
            }
        }
        Ok(None)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        if !self.table_exists().await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rasff_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn table_exists(&self) -> Result<bool, StoreError> {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(ALERTS_TABLE)
        .fetch_one(&self.pool)
        .await?;
        Ok(found > 0)
    }
}

fn parse_url(database_url: &str) -> Result<SqliteConnectOptions, StoreError> {
    SqliteConnectOptions::from_str(database_url).map_err(|source| StoreError::InvalidUrl {
        url: database_url.to_string(),
        source,
    })
}

async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query(CREATE_TABLE_SQL).execute(&mut *tx).await?;

    let existing = sqlx::query("PRAGMA table_info(rasff_data)")
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<HashSet<_>, _>>()?;
    for (column, declared_type) in COLUMN_TYPES {
        if !existing.contains(column) {
            info!(table = ALERTS_TABLE, column, "adding missing column");
            sqlx::query(&format!("ALTER TABLE rasff_data ADD COLUMN {column} {declared_type}"))
                .execute(&mut *tx)
                .await?;
        }
    }

    let has_key_index: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?",
    )
    .bind(NATURAL_KEY_INDEX)
    .fetch_one(&mut *tx)
    .await?;
    if has_key_index == 0 {
        let truncated = sqlx::query(NORMALIZE_LEGACY_DATES_SQL)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if truncated > 0 {
            info!(truncated, "dropped time of day from legacy date_of_case values");
        }
        rederive_periods(&mut tx).await?;

        let collapsed = sqlx::query(COLLAPSE_DUPLICATES_SQL)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if collapsed > 0 {
            warn!(collapsed, "collapsed duplicate alerts before adding natural key index");
        }
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX {NATURAL_KEY_INDEX} ON rasff_data(reference, date_of_case)"
        ))
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("CREATE INDEX IF NOT EXISTS rasff_data_period ON rasff_data(year, week)")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Rewrites year/week as the ISO week of `date_of_case`, or NULL when it
/// does not parse.
async fn rederive_periods(tx: &mut Transaction<'_, Sqlite>) -> Result<(), StoreError> {
    let rows = sqlx::query("SELECT rowid AS id, CAST(date_of_case AS TEXT) AS date_of_case FROM rasff_data")
        .fetch_all(&mut **tx)
        .await?;
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let period = row
            .try_get::<Option<String>, _>("date_of_case")?
            .as_deref()
            .and_then(parse_stored_date)
            .map(Period::containing);
        sqlx::query("UPDATE rasff_data SET year = ?, week = ? WHERE rowid = ?")
            .bind(period.map(|p| i64::from(p.year())))
            .bind(period.map(|p| i64::from(p.week())))
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<AlertRecord, StoreError> {
    let label = |column: &str| -> Result<String, StoreError> {
        Ok(row
            .try_get::<Option<String>, _>(column)?
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string()))
    };
    let date_of_case = row
        .try_get::<Option<String>, _>("date_of_case")?
        .as_deref()
        .and_then(parse_stored_date);
    let year: Option<i64> = row.try_get("year")?;
    let week: Option<i64> = row.try_get("week")?;

    Ok(AlertRecord {
        date_of_case,
        reference: row.try_get("reference")?,
        notification_from: row.try_get("notification_from")?,
        country_origin: row.try_get("country_origin")?,
        product: row.try_get("product")?,
        product_category: row.try_get("product_category")?,
        hazard_substance: row.try_get("hazard_substance")?,
        hazard_category: row.try_get("hazard_category")?,
        prodcat: label("prodcat")?,
        groupprod: label("groupprod")?,
        hazcat: label("hazcat")?,
        grouphaz: label("grouphaz")?,
        year: year.and_then(|y| i32::try_from(y).ok()),
        week: week.and_then(|w| u32::try_from(w).ok()),
    })
}

/// Accepts `YYYY-MM-DD` with an optional time suffix.
fn parse_stored_date(text: &str) -> Option<NaiveDate> {
    let day = text.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}
