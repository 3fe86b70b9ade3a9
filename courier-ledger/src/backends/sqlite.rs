use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Address, internal};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use crate::{
    DeliveryRecord, DeliveryStatus, IdentityStats, IdentityStatus, LedgerError, SendingIdentity,
    r#trait::{AccountLedger, DeliveryLog, validate_limit},
};

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS identities (
        address         TEXT PRIMARY KEY COLLATE NOCASE,
        credential      TEXT NOT NULL,
        sent_count      INTEGER NOT NULL DEFAULT 0 CHECK (sent_count >= 0),
        max_send_limit  INTEGER NOT NULL CHECK (max_send_limit > 0),
        rate_limited    INTEGER NOT NULL DEFAULT 0,
        rate_limited_at TEXT,
        last_used_at    TEXT,
        status          TEXT NOT NULL DEFAULT 'active',
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS delivery_records (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        from_identity       TEXT NOT NULL,
        to_recipient        TEXT NOT NULL,
        subject             TEXT NOT NULL,
        sent_at             TEXT NOT NULL,
        status              TEXT NOT NULL,
        error_message       TEXT,
        provider_message_id TEXT,
        source_batch_file   TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_delivery_records_from_sent
        ON delivery_records (from_identity, sent_at)",
    "CREATE INDEX IF NOT EXISTS idx_delivery_records_recipient
        ON delivery_records (to_recipient)",
];

const IDENTITY_COLUMNS: &str = "address, credential, sent_count, max_send_limit, rate_limited, \
                                rate_limited_at, last_used_at, status, created_at, updated_at";

/// SQLite-backed ledger
///
/// Every mutation is a single `UPDATE`/`INSERT` statement, so counter
/// increments are atomic in the database regardless of how many sends race on
/// the same identity.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Connect using a `sqlite://` URL, creating the database file if needed
    ///
    /// # Errors
    /// If the URL is invalid, the database can't be opened, or the tables
    /// can't be created.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?;
        // Each connection to an in-memory database is its own database.
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            5
        };
        Self::connect_with(options, max_connections).await
    }

    /// Open (or create) a database file at `path`
    ///
    /// # Errors
    /// If the database can't be opened or the tables can't be created.
    pub async fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path), 5).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> crate::Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> crate::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        internal!("Ledger schema ready");
        Ok(())
    }

    /// Close the pool, waiting for in-flight statements
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(FromRow)]
struct IdentityRow {
    address: String,
    credential: String,
    sent_count: i64,
    max_send_limit: i64,
    rate_limited: bool,
    rate_limited_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for SendingIdentity {
    type Error = LedgerError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            address: parse_address(&row.address)?,
            credential: row.credential,
            sent_count: to_u64(row.sent_count, "sent_count")?,
            max_send_limit: to_u64(row.max_send_limit, "max_send_limit")?,
            rate_limited: row.rate_limited,
            rate_limited_at: row.rate_limited_at,
            last_used_at: row.last_used_at,
            status: IdentityStatus::parse(&row.status)
                .ok_or_else(|| LedgerError::Corrupted(format!("unknown status {}", row.status)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct StatsRow {
    #[sqlx(flatten)]
    identity: IdentityRow,
    delivered: i64,
}

#[derive(FromRow)]
struct DeliveryRow {
    from_identity: String,
    to_recipient: String,
    subject: String,
    sent_at: DateTime<Utc>,
    status: String,
    error_message: Option<String>,
    provider_message_id: Option<String>,
    source_batch_file: Option<String>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = LedgerError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            from_identity: parse_address(&row.from_identity)?,
            to_recipient: parse_address(&row.to_recipient)?,
            subject: row.subject,
            sent_at: row.sent_at,
            status: DeliveryStatus::parse(&row.status).ok_or_else(|| {
                LedgerError::Corrupted(format!("unknown delivery status {}", row.status))
            })?,
            error_message: row.error_message,
            provider_message_id: row.provider_message_id,
            source_batch_file: row.source_batch_file,
        })
    }
}

fn parse_address(raw: &str) -> crate::Result<Address> {
    Address::parse(raw).ok_or_else(|| LedgerError::Corrupted(format!("bad address {raw}")))
}

fn to_u64(value: i64, column: &str) -> crate::Result<u64> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupted(format!("negative {column}: {value}")))
}

fn to_i64(target: &str, value: u64) -> crate::Result<i64> {
    i64::try_from(value).map_err(|_| LedgerError::InvalidLimit {
        address: target.to_string(),
        limit: value,
    })
}

#[async_trait]
impl AccountLedger for SqliteLedger {
    async fn upsert(
        &self,
        address: &Address,
        credential: Option<&str>,
        max_send_limit: u64,
    ) -> crate::Result<SendingIdentity> {
        validate_limit(address, max_send_limit)?;
        let limit = to_i64(address, max_send_limit)?;
        let now = Utc::now();

        let row = match credential {
            Some(credential) => Some(
                sqlx::query_as::<_, IdentityRow>(&format!(
                    "INSERT INTO identities ({IDENTITY_COLUMNS})
                     VALUES (?1, ?2, 0, ?3, 0, NULL, NULL, 'active', ?4, ?4)
                     ON CONFLICT (address) DO UPDATE SET
                        credential = excluded.credential,
                        max_send_limit = excluded.max_send_limit,
                        rate_limited = 0,
                        rate_limited_at = NULL,
                        status = 'active',
                        updated_at = excluded.updated_at
                     RETURNING {IDENTITY_COLUMNS}"
                ))
                .bind(address.as_str())
                .bind(credential)
                .bind(limit)
                .bind(now)
                .fetch_one(&self.pool)
                .await?,
            ),
            None => {
                sqlx::query_as::<_, IdentityRow>(&format!(
                    "UPDATE identities SET
                        max_send_limit = ?2,
                        rate_limited = 0,
                        rate_limited_at = NULL,
                        status = 'active',
                        updated_at = ?3
                     WHERE address = ?1
                     RETURNING {IDENTITY_COLUMNS}"
                ))
                .bind(address.as_str())
                .bind(limit)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.ok_or_else(|| LedgerError::MissingCredential(address.to_string()))?
            .try_into()
    }

    async fn find_all_available(&self) -> crate::Result<Vec<SendingIdentity>> {
        sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities
             WHERE status = 'active' AND rate_limited = 0 AND sent_count < max_send_limit
             ORDER BY sent_count ASC, address ASC"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SendingIdentity::try_from)
        .collect()
    }

    async fn record_use(&self, address: &Address) -> crate::Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE identities
             SET sent_count = sent_count + 1, last_used_at = ?2, updated_at = ?2
             WHERE address = ?1",
        )
        .bind(address.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownIdentity(address.to_string()));
        }
        Ok(())
    }

    async fn mark_rate_limited(&self, address: &Address) -> crate::Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE identities
             SET rate_limited = 1, status = 'rate-limited', rate_limited_at = ?2, updated_at = ?2
             WHERE address = ?1 AND status <> 'disabled'",
        )
        .bind(address.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Zero rows is either a disabled identity (left alone) or an unknown one.
        if result.rows_affected() == 0 && self.get(address).await?.is_none() {
            return Err(LedgerError::UnknownIdentity(address.to_string()));
        }
        Ok(())
    }

    async fn reset_all(&self) -> crate::Result<u64> {
        let result = sqlx::query(
            "UPDATE identities
             SET sent_count = 0, rate_limited = 0, rate_limited_at = NULL,
                 status = 'active', updated_at = ?1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self, address: &Address) -> crate::Result<Option<IdentityStats>> {
        let row = sqlx::query_as::<_, StatsRow>(&format!(
            "SELECT {IDENTITY_COLUMNS},
                (SELECT COUNT(*) FROM delivery_records d
                 WHERE d.from_identity = identities.address AND d.status = 'success') AS delivered
             FROM identities WHERE address = ?1"
        ))
        .bind(address.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delivered = to_u64(row.delivered, "delivered")?;
        let identity = SendingIdentity::try_from(row.identity)?;
        Ok(Some(IdentityStats::from_identity(&identity, delivered)))
    }

    async fn list(&self) -> crate::Result<Vec<SendingIdentity>> {
        sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY address ASC"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SendingIdentity::try_from)
        .collect()
    }

    async fn get(&self, address: &Address) -> crate::Result<Option<SendingIdentity>> {
        sqlx::query_as::<_, IdentityRow>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE address = ?1"
        ))
        .bind(address.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(SendingIdentity::try_from)
        .transpose()
    }

    async fn set_limit_all(&self, max_send_limit: u64) -> crate::Result<u64> {
        validate_limit("*", max_send_limit)?;
        let limit = to_i64("*", max_send_limit)?;

        let result = sqlx::query("UPDATE identities SET max_send_limit = ?1, updated_at = ?2")
            .bind(limit)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn disable(&self, address: &Address) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE identities
             SET status = 'disabled', rate_limited = 0, rate_limited_at = NULL, updated_at = ?2
             WHERE address = ?1",
        )
        .bind(address.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownIdentity(address.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryLog for SqliteLedger {
    async fn append(&self, record: &DeliveryRecord) -> crate::Result<()> {
        sqlx::query(
            "INSERT INTO delivery_records
                (from_identity, to_recipient, subject, sent_at, status,
                 error_message, provider_message_id, source_batch_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(record.from_identity.as_str())
        .bind(record.to_recipient.as_str())
        .bind(&record.subject)
        .bind(record.sent_at)
        .bind(record.status.as_str())
        .bind(record.error_message.as_deref())
        .bind(record.provider_message_id.as_deref())
        .bind(record.source_batch_file.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn was_sent(
        &self,
        recipient: &Address,
        source_batch_file: Option<&str>,
    ) -> crate::Result<bool> {
        let sent = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS (
                SELECT 1 FROM delivery_records
                WHERE to_recipient = ?1 AND status = 'success'
                  AND (?2 IS NULL OR source_batch_file = ?2)
             )",
        )
        .bind(recipient.as_str())
        .bind(source_batch_file)
        .fetch_one(&self.pool)
        .await?;

        Ok(sent != 0)
    }

    async fn recent(&self, limit: usize) -> crate::Result<Vec<DeliveryRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query_as::<_, DeliveryRow>(
            "SELECT from_identity, to_recipient, subject, sent_at, status,
                    error_message, provider_message_id, source_batch_file
             FROM delivery_records ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(DeliveryRecord::try_from)
        .collect()
    }
}
