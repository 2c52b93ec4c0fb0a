//! Process record repository: persistence for the `process_records` and
//! `processing_errors` tables.
//!
//! Each owned field group lives in its own column, so a [`FieldUpdate`] maps
//! to a single targeted `UPDATE`. Sub-fields (the processed file's storage
//! type, individual `jobs` entries) are patched in place with `json_set`.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Database, DatabaseError};
use crate::record::{
    FieldUpdate, ProcessRecord, ProcessingErrorEntry, RecordFiles, RecordId, RecordStatus,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn to_json<T: Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|source| DatabaseError::Json { column, source })
}

/// Serializes a unit-variant enum to its bare serde name.
fn enum_str<T: Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    match serde_json::to_value(value).map_err(|source| DatabaseError::Json { column, source })? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn conversion_error(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, name: &str) -> Result<Option<T>, rusqlite::Error> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| serde_json::from_str(&s).map_err(conversion_error))
        .transpose()
}

fn enum_col<T: DeserializeOwned>(row: &Row<'_>, name: &str) -> Result<Option<T>, rusqlite::Error> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| serde_json::from_value(serde_json::Value::String(s)).map_err(conversion_error))
        .transpose()
}

fn time_col(row: &Row<'_>, name: &str) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(conversion_error)
    })
    .transpose()
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, rusqlite::Error> {
    value.ok_or_else(|| rusqlite::Error::InvalidColumnName(format!("{} is NULL", name)))
}

fn record_from_row(row: &Row<'_>) -> Result<ProcessRecord, rusqlite::Error> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;

    Ok(ProcessRecord {
        id: id.parse().map_err(conversion_error)?,
        tenant_id: row.get("tenant_id")?,
        owner_id: row.get("owner_id")?,
        status: RecordStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnName(format!("unknown status '{}'", status))
        })?,
        processing_details: enum_col(row, "processing_details")?,
        progress: required(json_col(row, "progress")?, "progress")?,
        files: RecordFiles {
            original: json_col(row, "files_original")?,
            processed: json_col(row, "files_processed")?,
            audio: json_col(row, "files_audio")?,
        },
        pending_result: json_col(row, "pending_result")?,
        transcript: json_col(row, "transcript")?,
        tags: json_col(row, "tags")?,
        todo_list: json_col(row, "todo_list")?,
        title: row.get("title")?,
        embedding: json_col(row, "embedding")?,
        jobs: json_col(row, "jobs")?.unwrap_or_default(),
        processing_errors: Vec::new(),
        cancelled: row.get::<_, i64>("cancelled")? != 0,
        deleted_at: time_col(row, "deleted_at")?,
        created_at: required(time_col(row, "created_at")?, "created_at")?,
        updated_at: required(time_col(row, "updated_at")?, "updated_at")?,
        processing_started_at: time_col(row, "processing_started_at")?,
        completed_at: time_col(row, "completed_at")?,
        version: row.get::<_, i64>("version")? as u64,
    })
}

fn error_from_row(row: &Row<'_>) -> Result<ProcessingErrorEntry, rusqlite::Error> {
    Ok(ProcessingErrorEntry {
        step: row.get("step")?,
        message: row.get("message")?,
        details: row.get("details")?,
        attempt: row.get::<_, Option<i64>>("attempt")?.map(|a| a as u32),
        timestamp: required(time_col(row, "timestamp")?, "timestamp")?,
    })
}

/// SET clause and bound values for one field update. Placeholders start at
/// `?2`; `?1` is always the record id.
fn update_clause(update: &FieldUpdate) -> Result<(&'static str, Vec<Value>), DatabaseError> {
    let text = |s: String| Value::Text(s);
    let opt_text = |s: Option<String>| s.map(Value::Text).unwrap_or(Value::Null);

    let clause = match update {
        FieldUpdate::Status(status) => ("status = ?2", vec![text(status.as_str().to_string())]),
        FieldUpdate::ProcessingDetails(details) => (
            "processing_details = ?2",
            vec![opt_text(
                details
                    .as_ref()
                    .map(|d| enum_str("processing_details", d))
                    .transpose()?,
            )],
        ),
        FieldUpdate::Progress(progress) => {
            ("progress = ?2", vec![text(to_json("progress", progress)?)])
        }
        FieldUpdate::OriginalFile(file) => (
            "files_original = ?2",
            vec![text(to_json("files_original", file)?)],
        ),
        FieldUpdate::ProcessingStartedAt(at) => {
            ("processing_started_at = ?2", vec![text(format_timestamp(*at))])
        }
        FieldUpdate::CompletedAt(at) => ("completed_at = ?2", vec![text(format_timestamp(*at))]),
        FieldUpdate::Job { stage, job } => (
            "jobs = json_set(jobs, ?2, json(?3))",
            vec![
                text(format!("$.{}", stage.as_str())),
                text(to_json("jobs", job)?),
            ],
        ),
        FieldUpdate::Cancelled => ("cancelled = 1", vec![]),
        FieldUpdate::DeletedAt(at) => (
            "deleted_at = ?2, cancelled = 1",
            vec![text(format_timestamp(*at))],
        ),
        FieldUpdate::PendingResult(pending) => (
            "pending_result = ?2",
            vec![text(to_json("pending_result", pending)?)],
        ),
        FieldUpdate::PromotePending { processed } => (
            "files_processed = ?2, pending_result = NULL",
            vec![text(to_json("files_processed", processed)?)],
        ),
        FieldUpdate::AudioFile(file) => {
            ("files_audio = ?2", vec![text(to_json("files_audio", file)?)])
        }
        FieldUpdate::Transcript(transcript) => (
            "transcript = ?2",
            vec![text(to_json("transcript", transcript)?)],
        ),
        FieldUpdate::Tags(tags) => ("tags = ?2", vec![text(to_json("tags", tags)?)]),
        FieldUpdate::TodoList(items) => {
            ("todo_list = ?2", vec![text(to_json("todo_list", items)?)])
        }
        FieldUpdate::Title(title) => ("title = ?2", vec![text(title.clone())]),
        FieldUpdate::Embedding(embedding) => {
            ("embedding = ?2", vec![text(to_json("embedding", embedding)?)])
        }
        FieldUpdate::ProcessedStorage {
            storage_type,
            s3_location,
        } => (
            "files_processed = json_set(files_processed, '$.storageType', ?2, '$.s3Location', ?3)",
            vec![
                text(enum_str("files_processed", storage_type)?),
                opt_text(s3_location.clone()),
            ],
        ),
        FieldUpdate::OriginalStorage(storage_type) => (
            "files_original = json_set(files_original, '$.storageType', ?2)",
            vec![text(enum_str("files_original", storage_type)?)],
        ),
    };
    Ok(clause)
}

// ─── Queries ────────────────────────────────────────────────────────────────

/// Inserts a new record row together with any error entries it carries.
pub fn insert(db: &Database, record: &ProcessRecord) -> Result<(), DatabaseError> {
    let processing_details = record
        .processing_details
        .as_ref()
        .map(|d| enum_str("processing_details", d))
        .transpose()?;
    let files_original = record
        .files
        .original
        .as_ref()
        .map(|f| to_json("files_original", f))
        .transpose()?;
    let files_processed = record
        .files
        .processed
        .as_ref()
        .map(|f| to_json("files_processed", f))
        .transpose()?;
    let files_audio = record
        .files
        .audio
        .as_ref()
        .map(|f| to_json("files_audio", f))
        .transpose()?;
    let pending_result = record
        .pending_result
        .as_ref()
        .map(|p| to_json("pending_result", p))
        .transpose()?;
    let transcript = record
        .transcript
        .as_ref()
        .map(|t| to_json("transcript", t))
        .transpose()?;
    let tags = record.tags.as_ref().map(|t| to_json("tags", t)).transpose()?;
    let todo_list = record
        .todo_list
        .as_ref()
        .map(|t| to_json("todo_list", t))
        .transpose()?;
    let embedding = record
        .embedding
        .as_ref()
        .map(|e| to_json("embedding", e))
        .transpose()?;
    let progress = to_json("progress", &record.progress)?;
    let jobs = to_json("jobs", &record.jobs)?;

    db.with_transaction(|tx| {
        tx.execute(
            "INSERT INTO process_records (id, tenant_id, owner_id, status, processing_details,
             progress, files_original, files_processed, files_audio, pending_result, transcript,
             tags, todo_list, title, embedding, jobs, cancelled, deleted_at,
             created_at, updated_at, processing_started_at, completed_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                record.id.to_string(),
                record.tenant_id,
                record.owner_id,
                record.status.as_str(),
                processing_details,
                progress,
                files_original,
                files_processed,
                files_audio,
                pending_result,
                transcript,
                tags,
                todo_list,
                record.title,
                embedding,
                jobs,
                record.cancelled as i64,
                record.deleted_at.map(format_timestamp),
                format_timestamp(record.created_at),
                format_timestamp(record.updated_at),
                record.processing_started_at.map(format_timestamp),
                record.completed_at.map(format_timestamp),
                record.version as i64,
            ],
        )?;
        for entry in &record.processing_errors {
            insert_error(tx, &record.id, entry)?;
        }
        Ok(())
    })
}

/// Finds a record by id, including its error log.
pub fn find_by_id(db: &Database, id: &RecordId) -> Result<Option<ProcessRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let record = conn
            .query_row(
                "SELECT * FROM process_records WHERE id = ?1",
                params![id.to_string()],
                record_from_row,
            )
            .optional()?;

        let Some(mut record) = record else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT step, message, details, attempt, timestamp FROM processing_errors
             WHERE record_id = ?1 ORDER BY seq ASC",
        )?;
        record.processing_errors = stmt
            .query_map(params![id.to_string()], error_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(record))
    })
}

/// Applies a single field update. Returns the new version, or `None` if the
/// record does not exist.
pub fn apply_update(
    db: &Database,
    id: &RecordId,
    update: &FieldUpdate,
) -> Result<Option<u64>, DatabaseError> {
    let (clause, values) = update_clause(update)?;
    let updated_at_idx = values.len() + 2;
    let sql = format!(
        "UPDATE process_records SET {}, version = version + 1, updated_at = ?{} WHERE id = ?1",
        clause, updated_at_idx
    );

    let mut bound = Vec::with_capacity(values.len() + 2);
    bound.push(Value::Text(id.to_string()));
    bound.extend(values);
    bound.push(Value::Text(format_timestamp(Utc::now())));

    db.with_conn(|conn| {
        let changed = conn.execute(&sql, params_from_iter(bound.iter()))?;
        if changed == 0 {
            return Ok(None);
        }
        let version: i64 = conn.query_row(
            "SELECT version FROM process_records WHERE id = ?1",
            params![id.to_string()],
            |r| r.get(0),
        )?;
        Ok(Some(version as u64))
    })
}

fn insert_error(
    conn: &rusqlite::Connection,
    id: &RecordId,
    entry: &ProcessingErrorEntry,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO processing_errors (record_id, step, message, details, attempt, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            entry.step,
            entry.message,
            entry.details,
            entry.attempt.map(|a| a as i64),
            format_timestamp(entry.timestamp),
        ],
    )?;
    Ok(())
}

/// Appends an audit entry. Returns `false` if the record does not exist.
pub fn append_error(
    db: &Database,
    id: &RecordId,
    entry: &ProcessingErrorEntry,
) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM process_records WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }
        insert_error(tx, id, entry)?;
        tx.execute(
            "UPDATE process_records SET version = version + 1, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), format_timestamp(Utc::now())],
        )?;
        Ok(true)
    })
}

/// Lists record ids with the given status, oldest first.
pub fn list_ids_by_status(
    db: &Database,
    status: RecordStatus,
) -> Result<Vec<RecordId>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM process_records WHERE status = ?1 AND deleted_at IS NULL
             ORDER BY created_at ASC",
        )?;
        let ids = stmt
            .query_map(params![status.as_str()], |r| {
                let id: String = r.get(0)?;
                id.parse::<RecordId>().map_err(conversion_error)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}
