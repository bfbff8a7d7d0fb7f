use crate::estimator::{EstimationResult, EstimatorKind, Eta};
use crate::tracker::DownloadRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Column order of the exported logs. String fields are quoted. Numeric
/// fields are bare, except that `remaining_time` holds either seconds
/// (`12.34`) or the bare word `Unknown`.
const CSV_HEADER: &str = "id,filename,percentage,speed,remaining_time,estimator_type,total_bytes,received_bytes,start_time,current_time,session_id,browser,platform";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub id: u64,
    pub filename: String,
    pub percentage: u32,
    pub speed: f64,
    pub remaining_time: Eta,
    pub estimator_kind: EstimatorKind,
    pub total_bytes: i64,
    pub received_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub current_time: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn new(record: &DownloadRecord, result: &EstimationResult) -> Self {
        Self {
            id: record.id,
            filename: record.display_name().to_string(),
            percentage: record.percentage(),
            speed: result.speed_bytes_per_sec,
            remaining_time: result.remaining_seconds,
            estimator_kind: result.estimator_kind,
            total_bytes: record.total_bytes,
            received_bytes: record.bytes_received,
            start_time: result.sample_start_time,
            current_time: result.sample_time,
        }
    }
}

/// Columns appended to every exported row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportContext {
    pub session_id: String,
    pub browser: String,
    pub platform: String,
}

/// Per-download append-only sample logs.
#[derive(Default)]
pub struct StatsSink {
    logs: HashMap<u64, Vec<StatsSnapshot>>,
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, snapshot: StatsSnapshot) {
        self.logs.entry(snapshot.id).or_default().push(snapshot);
    }

    pub fn len(&self, id: u64) -> usize {
        self.logs.get(&id).map_or(0, Vec::len)
    }

    /// Serializes the log for `id` and deletes it. `None` when nothing was
    /// recorded.
    pub fn take_csv(&mut self, id: u64, context: &ExportContext) -> Option<String> {
        let rows = self.logs.remove(&id)?;
        if rows.is_empty() {
            return None;
        }
        Some(to_csv(&rows, context))
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn to_csv(rows: &[StatsSnapshot], context: &ExportContext) -> String {
    let mut out = String::from(CSV_HEADER);
    for row in rows {
        let fields = [
            row.id.to_string(),
            quote(&row.filename),
            row.percentage.to_string(),
            format!("{:.2}", row.speed),
            row.remaining_time.to_string(),
            quote(row.estimator_kind.label()),
            row.total_bytes.to_string(),
            row.received_bytes.to_string(),
            quote(&rfc3339(&row.start_time)),
            quote(&rfc3339(&row.current_time)),
            quote(&context.session_id),
            quote(&context.browser),
            quote(&context.platform),
        ];
        out.push('\n');
        out.push_str(&fields.join(","));
    }
    out
}

/// Hands flushed CSV logs to their destinations.
#[derive(Clone)]
pub struct CsvExporter {
    dir: Option<PathBuf>,
    upload_url: Option<String>,
    client: reqwest::Client,
}

impl CsvExporter {
    pub fn new(dir: Option<PathBuf>, upload_url: Option<String>) -> Self {
        Self {
            dir,
            upload_url,
            client: reqwest::Client::new(),
        }
    }

    /// Logs the CSV and, when configured, writes and uploads it in the
    /// background. Never blocks the caller.
    pub fn export(&self, id: u64, session_id: &str, csv: String) {
        info!("Download #{} stats:\n{}", id, csv);

        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}-{}.csv", session_id, id));
            let content = csv.clone();
            tokio::spawn(async move {
                if let Some(parent) = path.parent()
                    && let Err(e) = tokio::fs::create_dir_all(parent).await
                {
                    warn!("Failed to create stats directory {:?}: {}", parent, e);
                    return;
                }
                if let Err(e) = tokio::fs::write(&path, content).await {
                    warn!("Failed to write stats {:?}: {}", path, e);
                }
            });
        }

        if let Some(url) = &self.upload_url {
            let request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "text/csv")
                .body(csv);
            tokio::spawn(async move {
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!("Stats upload for #{} failed: status {}", id, resp.status()),
                    Err(e) => warn!("Stats upload for #{} failed: {}", id, e),
                }
            });
        }
    }
}
