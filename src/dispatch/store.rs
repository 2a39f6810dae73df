//! Report history, stored in SQLite.
//!
//! Report rows are immutable once inserted. Each email attempt is appended
//! to a separate deliveries table, so a report's delivery status is derived
//! rather than updated in place.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};
use schemars::JsonSchema;
use tokio::sync::Mutex;

use crate::{prelude::*, report::AiAnalysis};

use super::email::{Attachment, EmailEnvelope};

/// A dispatched report.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub advertiser_id: String,
    pub advertiser_name: String,
    pub station: String,
    pub line: String,
    pub image_count: u32,
    /// Primary recipients, comma-separated.
    pub sent_to: String,
    /// `None` when the report was sent without an analysis.
    pub ai_analysis: Option<AiAnalysis>,
}

/// One attempt to email a report.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub attempted_at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A report as listed in the history.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    #[serde(flatten)]
    pub record: ReportRecord,
    /// Has any email attempt succeeded?
    pub delivered: bool,
}

/// A report with its full delivery history.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetail {
    #[serde(flatten)]
    pub record: ReportRecord,
    pub delivered: bool,
    pub deliveries: Vec<DeliveryAttempt>,
    /// Names of the attached files.
    pub attachments: Vec<String>,
}

/// Where reports are kept.
#[async_trait]
pub trait ReportStore: Send + Sync + 'static {
    /// Save a new report together with the email we are about to send.
    async fn insert(&self, record: &ReportRecord, envelope: &EmailEnvelope) -> Result<()>;

    /// Append an email attempt.
    async fn record_delivery(&self, report_id: &str, attempt: &DeliveryAttempt) -> Result<()>;

    /// The newest `limit` reports, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<ReportSummary>>;

    /// One report.
    async fn get(&self, id: &str) -> Result<Option<ReportDetail>>;

    /// The stored email for a report, including attachments.
    async fn envelope(&self, id: &str) -> Result<Option<EmailEnvelope>>;
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Raw `reports` columns, before parsing.
type RecordRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    u32,
    String,
    Option<String>,
    bool,
);

const RECORD_COLUMNS: &str = "r.id, r.created_at, r.advertiser_id, r.advertiser_name,
    r.station, r.line, r.image_count, r.sent_to, r.ai_analysis,
    EXISTS (SELECT 1 FROM report_deliveries d WHERE d.report_id = r.id AND d.ok = 1)";

fn read_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_record_row(raw: RecordRow) -> Result<(ReportRecord, bool)> {
    let (
        id,
        created_at,
        advertiser_id,
        advertiser_name,
        station,
        line,
        image_count,
        sent_to,
        ai_analysis,
        delivered,
    ) = raw;
    let ai_analysis = match ai_analysis {
        Some(json) => Some(
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt AI analysis in report {id:?}"))?,
        ),
        None => None,
    };
    let created_at = parse_timestamp(&created_at)
        .ok_or_else(|| anyhow!("Corrupt timestamp {created_at:?} in report {id:?}"))?;
    Ok((
        ReportRecord {
            id,
            created_at,
            advertiser_id,
            advertiser_name,
            station,
            line,
            image_count,
            sent_to,
            ai_analysis,
        },
        delivered,
    ))
}

/// SQLite-backed report store.
pub struct SqliteReportStore {
    conn: Mutex<Connection>,
}

impl SqliteReportStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open report database {:?}", path))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Report store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                advertiser_id TEXT NOT NULL,
                advertiser_name TEXT NOT NULL,
                station TEXT NOT NULL,
                line TEXT NOT NULL,
                image_count INTEGER NOT NULL,
                sent_to TEXT NOT NULL,
                ai_analysis TEXT,
                envelope TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_created_at ON reports(created_at);
            CREATE TABLE IF NOT EXISTS report_attachments (
                report_id TEXT NOT NULL REFERENCES reports(id),
                position INTEGER NOT NULL,
                filename TEXT NOT NULL,
                content BLOB NOT NULL,
                PRIMARY KEY (report_id, position)
            );
            CREATE TABLE IF NOT EXISTS report_deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_id TEXT NOT NULL REFERENCES reports(id),
                attempted_at TEXT NOT NULL,
                ok INTEGER NOT NULL,
                message_id TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_report_id ON report_deliveries(report_id);",
        )
        .context("Failed to initialize report database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ReportStore for SqliteReportStore {
    #[instrument(level = "debug", skip_all, fields(report_id = %record.id))]
    async fn insert(&self, record: &ReportRecord, envelope: &EmailEnvelope) -> Result<()> {
        let ai_analysis = record
            .ai_analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let envelope_json = serde_json::to_string(envelope)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO reports (id, created_at, advertiser_id, advertiser_name, station,
                line, image_count, sent_to, ai_analysis, envelope)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                timestamp(&record.created_at),
                record.advertiser_id,
                record.advertiser_name,
                record.station,
                record.line,
                record.image_count,
                record.sent_to,
                ai_analysis,
                envelope_json,
            ],
        )?;
        for (position, attachment) in envelope.attachments.iter().enumerate() {
            tx.execute(
                "INSERT INTO report_attachments (report_id, position, filename, content)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.id, position as i64, attachment.filename, attachment.content],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn record_delivery(&self, report_id: &str, attempt: &DeliveryAttempt) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO report_deliveries (report_id, attempted_at, ok, message_id, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report_id,
                timestamp(&attempt.attempted_at),
                attempt.ok,
                attempt.message_id,
                attempt.error,
            ],
        )?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ReportSummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM reports r
             ORDER BY r.created_at DESC, r.rowid DESC LIMIT ?1"
        ))?;
        let reports = stmt
            .query_map(params![limit as i64], read_record_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|raw| -> Result<ReportSummary> {
                let (record, delivered) = parse_record_row(raw)?;
                Ok(ReportSummary { record, delivered })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(reports)
    }

    async fn get(&self, id: &str) -> Result<Option<ReportDetail>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM reports r WHERE r.id = ?1"),
                params![id],
                read_record_row,
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let (record, delivered) = parse_record_row(raw)?;

        let mut stmt = conn.prepare(
            "SELECT attempted_at, ok, message_id, error FROM report_deliveries
             WHERE report_id = ?1 ORDER BY id ASC",
        )?;
        let deliveries = stmt
            .query_map(params![id], |row| {
                let attempted_at: String = row.get(0)?;
                let ok: bool = row.get(1)?;
                let message_id: Option<String> = row.get(2)?;
                let error: Option<String> = row.get(3)?;
                Ok((attempted_at, ok, message_id, error))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(attempted_at, ok, message_id, error)| -> Result<DeliveryAttempt> {
                let attempted_at = parse_timestamp(&attempted_at).ok_or_else(|| {
                    anyhow!("Corrupt delivery timestamp {attempted_at:?} for report {id:?}")
                })?;
                Ok(DeliveryAttempt {
                    attempted_at,
                    ok,
                    message_id,
                    error,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT filename FROM report_attachments WHERE report_id = ?1 ORDER BY position",
        )?;
        let attachments = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(ReportDetail {
            record,
            delivered,
            deliveries,
            attachments,
        }))
    }

    async fn envelope(&self, id: &str) -> Result<Option<EmailEnvelope>> {
        let conn = self.conn.lock().await;
        let json = conn
            .query_row(
                "SELECT envelope FROM reports WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        let Some(json) = json else {
            return Ok(None);
        };
        let mut envelope: EmailEnvelope =
            serde_json::from_str(&json).context("Corrupt stored envelope")?;

        let mut stmt = conn.prepare(
            "SELECT filename, content FROM report_attachments
             WHERE report_id = ?1 ORDER BY position",
        )?;
        envelope.attachments = stmt
            .query_map(params![id], |row| {
                Ok(Attachment {
                    filename: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(envelope))
    }
}
