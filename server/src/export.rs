//! Data export jobs.
//!
//! An export turns one of the sample datasets into a CSV or JSON file,
//! reporting progress to the browser as `export-progress` events through
//! the [`Broker`]. Finished files are kept in an [`ExportStore`] for an hour
//! and served by the download endpoint.
//!
//! # Progress
//!
//! Every step publishes an [`ExportProgress`] payload:
//!
//! | Progress | Status |
//! |----------|--------|
//! | 0, 20, 50, 80 | `processing` |
//! | 100 | `completed`, with `fileName` and `downloadId` |
//! | 0 | `failed`, with `error` |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::broker::Broker;

/// SSE event name for progress updates.
pub const EXPORT_PROGRESS_EVENT: &str = "export-progress";

/// Pause between progress steps.
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(500);

/// How long a finished export can be downloaded, in seconds.
pub const EXPORT_TTL_SECS: i64 = 60 * 60;

/// Errors that can occur while producing an export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The dataset has no rows.
    #[error("no data to export")]
    EmptyDataset,

    /// JSON encoding failed.
    #[error("failed to encode export: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Csv => "text/csv",
            Self::Json => "application/json",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(format!("invalid format '{other}', use 'csv' or 'json'")),
        }
    }
}

/// Which dataset to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportDataType {
    Stats,
    Activity,
    All,
}

impl ExportDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::Activity => "activity",
            Self::All => "all",
        }
    }
}

impl FromStr for ExportDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stats" => Ok(Self::Stats),
            "activity" => Ok(Self::Activity),
            "all" => Ok(Self::All),
            other => Err(format!(
                "invalid data type '{other}', use 'stats', 'activity' or 'all'"
            )),
        }
    }
}

impl fmt::Display for ExportDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one export run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub job_id: String,
    pub user_id: String,
    pub format: ExportFormat,
    pub data_type: ExportDataType,
}

/// Lifecycle state reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Processing,
    Completed,
    Failed,
}

/// Payload of an `export-progress` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    pub job_id: String,
    pub status: ExportStatus,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportProgress {
    fn processing(job_id: &str, progress: u8, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: ExportStatus::Processing,
            progress,
            message: message.to_string(),
            file_name: None,
            download_id: None,
            error: None,
        }
    }
}

/// A finished export waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    pub data: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory store of finished exports.
#[derive(Debug, Clone, Default)]
pub struct ExportStore {
    exports: Arc<RwLock<HashMap<String, ExportResult>>>,
}

impl ExportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a finished export, first dropping every expired one.
    pub async fn insert(&self, id: impl Into<String>, result: ExportResult) {
        let mut exports = self.exports.write().await;
        let purged = purge_expired(&mut exports, Utc::now());
        if purged > 0 {
            debug!(purged, "Removed expired exports");
        }
        exports.insert(id.into(), result);
    }

    /// Removes every expired export. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        purge_expired(&mut *self.exports.write().await, Utc::now())
    }

    /// Looks up an export. Expired entries are removed and reported missing.
    pub async fn get(&self, id: &str) -> Option<ExportResult> {
        let mut exports = self.exports.write().await;
        match exports.get(id) {
            Some(result) if Utc::now() > result.expires_at => {
                exports.remove(id);
                None
            }
            Some(result) => Some(result.clone()),
            None => None,
        }
    }

    pub async fn remove(&self, id: &str) -> Option<ExportResult> {
        self.exports.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.exports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exports.read().await.is_empty()
    }
}

fn purge_expired(exports: &mut HashMap<String, ExportResult>, now: DateTime<Utc>) -> usize {
    let before = exports.len();
    exports.retain(|_, result| now <= result.expires_at);
    before - exports.len()
}

/// One exported record, keyed by column name.
pub type Row = Map<String, Value>;

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Sample dataset for `data_type`, dated relative to `now`.
pub fn sample_rows(data_type: ExportDataType, now: DateTime<Utc>) -> Vec<Row> {
    match data_type {
        ExportDataType::Stats => {
            let daily = [
                (12, 45, 38),
                (13, 52, 44),
                (13, 58, 51),
                (14, 61, 55),
                (14, 67, 60),
                (15, 72, 65),
                (15, 78, 70),
            ];
            daily
                .iter()
                .enumerate()
                .map(|(i, (projects, tasks, completed))| {
                    let day = now - chrono::Duration::days(6 - i as i64);
                    row(json!({
                        "date": day.format("%Y-%m-%d").to_string(),
                        "projects": projects,
                        "tasks": tasks,
                        "completed": completed,
                    }))
                })
                .collect()
        }
        ExportDataType::Activity => {
            let entries = [
                (120, "Project created", "New project 'Website Redesign'"),
                (60, "Task completed", "UI mockups finished"),
                (30, "Comment added", "Feedback on design drafts"),
                (15, "File uploaded", "final_design_v2.fig"),
            ];
            entries
                .iter()
                .map(|(minutes_ago, action, details)| {
                    let at = now - chrono::Duration::minutes(*minutes_ago);
                    row(json!({
                        "timestamp": at.format("%Y-%m-%d %H:%M").to_string(),
                        "action": action,
                        "details": details,
                    }))
                })
                .collect()
        }
        ExportDataType::All => vec![
            row(json!({"category": "Overview", "metric": "Active projects", "value": 15, "trend": "+2 this week"})),
            row(json!({"category": "Overview", "metric": "Open tasks", "value": 78, "trend": "-5 since yesterday"})),
            row(json!({"category": "Overview", "metric": "Completion rate", "value": "89%", "trend": "+3% this month"})),
            row(json!({"category": "Team", "metric": "Active members", "value": 8, "trend": "Unchanged"})),
        ],
    }
}

/// Renders rows as CSV. Columns come from the first row's keys, in sorted
/// order; fields containing separators, quotes or line breaks are quoted.
pub fn to_csv(rows: &[Row]) -> Result<Vec<u8>, ExportError> {
    let first = rows.first().ok_or(ExportError::EmptyDataset)?;
    let headers: Vec<&String> = first.keys().collect();

    let mut out = String::new();
    push_record(&mut out, headers.iter().map(|h| h.as_str().to_string()));
    for row in rows {
        push_record(
            &mut out,
            headers.iter().map(|h| match row.get(h.as_str()) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }),
        );
    }
    Ok(out.into_bytes())
}

fn push_record(out: &mut String, fields: impl Iterator<Item = String>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&field);
        }
    }
    out.push('\n');
}

/// Renders rows in the requested format.
pub fn render(format: ExportFormat, rows: &[Row]) -> Result<Vec<u8>, ExportError> {
    match format {
        ExportFormat::Csv => to_csv(rows),
        ExportFormat::Json => {
            if rows.is_empty() {
                return Err(ExportError::EmptyDataset);
            }
            Ok(serde_json::to_vec_pretty(rows)?)
        }
    }
}

/// Runs export jobs, publishing progress through the broker.
#[derive(Debug, Clone)]
pub struct ExportRunner {
    broker: Broker,
    store: ExportStore,
    step_delay: Duration,
}

impl ExportRunner {
    pub fn new(broker: Broker, store: ExportStore) -> Self {
        Self {
            broker,
            store,
            step_delay: DEFAULT_STEP_DELAY,
        }
    }

    /// Sets the pause between progress steps.
    #[must_use]
    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    /// Produces the export and stores it. Returns the download id.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if the data cannot be rendered; a `failed`
    /// progress event is published first.
    pub async fn run(&self, job: &ExportJob) -> Result<String, ExportError> {
        info!(
            job_id = %job.job_id,
            user_id = %job.user_id,
            format = job.format.extension(),
            data_type = %job.data_type,
            "Starting data export"
        );

        self.publish(&ExportProgress::processing(&job.job_id, 0, "Preparing export..."));

        tokio::time::sleep(self.step_delay).await;
        self.publish(&ExportProgress::processing(&job.job_id, 20, "Collecting data..."));
        let now = Utc::now();
        let rows = sample_rows(job.data_type, now);

        tokio::time::sleep(self.step_delay).await;
        self.publish(&ExportProgress::processing(&job.job_id, 50, "Processing data..."));

        let data = match render(job.format, &rows) {
            Ok(data) => data,
            Err(err) => {
                error!(job_id = %job.job_id, error = %err, "Export conversion failed");
                self.publish(&ExportProgress {
                    status: ExportStatus::Failed,
                    error: Some(err.to_string()),
                    ..ExportProgress::processing(&job.job_id, 0, "Export failed")
                });
                return Err(err);
            }
        };

        tokio::time::sleep(self.step_delay).await;
        self.publish(&ExportProgress::processing(&job.job_id, 80, "Finalizing export..."));

        let file_name = format!(
            "export_{}_{}.{}",
            job.data_type,
            now.format("%Y-%m-%d"),
            job.format.extension()
        );
        let stored_at = Utc::now();
        let download_id = format!(
            "{}_{}",
            job.job_id,
            stored_at.timestamp_nanos_opt().unwrap_or_default()
        );
        let size_bytes = data.len();

        self.store
            .insert(
                download_id.clone(),
                ExportResult {
                    data,
                    content_type: job.format.content_type().to_string(),
                    file_name: file_name.clone(),
                    created_at: stored_at,
                    expires_at: stored_at + chrono::Duration::seconds(EXPORT_TTL_SECS),
                },
            )
            .await;

        self.publish(&ExportProgress {
            status: ExportStatus::Completed,
            file_name: Some(file_name.clone()),
            download_id: Some(download_id.clone()),
            ..ExportProgress::processing(&job.job_id, 100, "Export complete!")
        });

        info!(
            job_id = %job.job_id,
            download_id = %download_id,
            file_name = %file_name,
            size_bytes,
            "Data export completed"
        );

        Ok(download_id)
    }

    fn publish(&self, progress: &ExportProgress) {
        match serde_json::to_string(progress) {
            Ok(data) => self.broker.broadcast(EXPORT_PROGRESS_EVENT, data),
            Err(err) => error!(error = %err, "Failed to encode export progress"),
        }
    }
}
