//! Report persistence
//!
//! Rows live in memory, sorted by (model, context), and the whole file is
//! rewritten atomically after every model so an interrupted run leaves a
//! complete report of what was measured so far.

use crate::error::{ProbeError, Result};
use crate::probe::ProbeResult;
use crate::sweep::UsageSample;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ReportFormat {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(ProbeError::Config(format!(
                "unknown report format '{}' (expected csv or json)",
                other
            ))),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// A record type with a fixed CSV layout
pub trait ReportRow: Serialize + DeserializeOwned + Clone + Send {
    const HEADER: &'static [&'static str];

    fn model(&self) -> &str;

    fn context_size(&self) -> u32;

    /// Whether `other` is a newer measurement of the same thing
    fn supersedes(&self, other: &Self) -> bool;

    fn to_fields(&self) -> Vec<String>;

    fn from_fields(fields: &[String]) -> Result<Self>;
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_field<T: FromStr>(fields: &[String], idx: usize, name: &str) -> Result<T> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| ProbeError::Report(format!("missing column {}", name)))?;
    raw.parse()
        .map_err(|_| ProbeError::Report(format!("invalid {} '{}'", name, raw)))
}

fn parse_timestamp(fields: &[String], idx: usize) -> Result<DateTime<Utc>> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| ProbeError::Report("missing column timestamp".into()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ProbeError::Report(format!("invalid timestamp '{}'", raw)))
}

impl ReportRow for ProbeResult {
    const HEADER: &'static [&'static str] = &[
        "model_name",
        "context_size",
        "observed_vram_bytes",
        "status",
        "timestamp",
        "declared_max_context",
        "provisional",
        "is_model_max",
        "load_cycles",
        "over_budget_trials",
        "load_failed_trials",
        "detail",
    ];

    fn model(&self) -> &str {
        &self.model
    }

    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn supersedes(&self, other: &Self) -> bool {
        self.model == other.model
    }

    fn to_fields(&self) -> Vec<String> {
        vec![
            self.model.clone(),
            self.context_size.to_string(),
            self.observed_vram.to_string(),
            self.status.to_string(),
            timestamp(&self.timestamp),
            self.declared_max_context.to_string(),
            self.provisional.to_string(),
            self.is_model_max.to_string(),
            self.load_cycles.to_string(),
            self.over_budget_trials.to_string(),
            self.load_failed_trials.to_string(),
            self.detail.clone(),
        ]
    }

    fn from_fields(fields: &[String]) -> Result<Self> {
        let status: crate::probe::ProbeStatus = parse_field(fields, 3, "status")?;
        Ok(Self {
            model: parse_field(fields, 0, "model_name")?,
            context_size: parse_field(fields, 1, "context_size")?,
            observed_vram: parse_field(fields, 2, "observed_vram_bytes")?,
            fits_within_budget: status == crate::probe::ProbeStatus::Fits,
            status,
            timestamp: parse_timestamp(fields, 4)?,
            declared_max_context: parse_field(fields, 5, "declared_max_context")?,
            provisional: parse_field(fields, 6, "provisional")?,
            is_model_max: parse_field(fields, 7, "is_model_max")?,
            load_cycles: parse_field(fields, 8, "load_cycles")?,
            over_budget_trials: parse_field(fields, 9, "over_budget_trials")?,
            load_failed_trials: parse_field(fields, 10, "load_failed_trials")?,
            detail: fields.get(11).cloned().unwrap_or_default(),
        })
    }
}

impl ReportRow for UsageSample {
    const HEADER: &'static [&'static str] = &[
        "model_name",
        "context_size",
        "observed_vram_bytes",
        "status",
        "timestamp",
        "provisional",
        "detail",
    ];

    fn model(&self) -> &str {
        &self.model
    }

    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn supersedes(&self, other: &Self) -> bool {
        self.model == other.model && self.context_size == other.context_size
    }

    fn to_fields(&self) -> Vec<String> {
        vec![
            self.model.clone(),
            self.context_size.to_string(),
            self.observed_vram.to_string(),
            self.status.to_string(),
            timestamp(&self.timestamp),
            self.provisional.to_string(),
            self.detail.clone(),
        ]
    }

    fn from_fields(fields: &[String]) -> Result<Self> {
        Ok(Self {
            model: parse_field(fields, 0, "model_name")?,
            context_size: parse_field(fields, 1, "context_size")?,
            observed_vram: parse_field(fields, 2, "observed_vram_bytes")?,
            status: parse_field(fields, 3, "status")?,
            timestamp: parse_timestamp(fields, 4)?,
            provisional: parse_field(fields, 5, "provisional")?,
            detail: fields.get(6).cloned().unwrap_or_default(),
        })
    }
}

/// Quote a field containing a delimiter, quote or line break
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into records, honouring quoted fields
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(ProbeError::Report("unterminated quoted field".into()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

pub fn render_csv<R: ReportRow>(rows: &[R]) -> String {
    let mut csv = String::new();
    csv.push_str(&R::HEADER.join(","));
    csv.push('\n');
    for row in rows {
        let fields: Vec<String> = row.to_fields().iter().map(|f| escape_field(f)).collect();
        csv.push_str(&fields.join(","));
        csv.push('\n');
    }
    csv
}

fn rows_from_csv<R: ReportRow>(text: &str) -> Result<Vec<R>> {
    let mut records = parse_csv(text)?.into_iter();
    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    if header != R::HEADER {
        return Err(ProbeError::Report(format!(
            "unexpected header '{}'",
            header.join(",")
        )));
    }
    records
        .filter(|r| !(r.len() == 1 && r[0].is_empty()))
        .map(|r| R::from_fields(&r))
        .collect()
}

pub struct ReportWriter<R> {
    path: PathBuf,
    format: ReportFormat,
    rows: Vec<R>,
}

impl<R: ReportRow> ReportWriter<R> {
    pub fn new(path: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            path: path.into(),
            format,
            rows: Vec::new(),
        }
    }

    /// Start from the rows of an existing report, if there is one
    pub async fn resume(path: impl Into<PathBuf>, format: ReportFormat) -> Result<Self> {
        let mut writer = Self::new(path, format);
        if !writer.path.exists() {
            return Ok(writer);
        }

        let content = fs::read_to_string(&writer.path).await?;
        let rows: Vec<R> = match format {
            ReportFormat::Csv => rows_from_csv(&content)?,
            ReportFormat::Json if content.trim().is_empty() => Vec::new(),
            ReportFormat::Json => serde_json::from_str(&content)?,
        };

        tracing::info!(
            path = ?writer.path,
            rows = rows.len(),
            "Resuming from existing report"
        );
        writer.upsert(rows);
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    /// Add rows, replacing rows they supersede
    pub fn upsert(&mut self, rows: impl IntoIterator<Item = R>) {
        for row in rows {
            self.rows.retain(|existing| !row.supersedes(existing));
            self.rows.push(row);
        }
        self.rows.sort_by(|a, b| {
            a.model()
                .cmp(b.model())
                .then(a.context_size().cmp(&b.context_size()))
        });
    }

    pub fn render(&self) -> Result<String> {
        match self.format {
            ReportFormat::Csv => Ok(render_csv(&self.rows)),
            ReportFormat::Json => Ok(serde_json::to_string_pretty(&self.rows)?),
        }
    }

    /// Rewrite the report file atomically
    pub async fn flush(&self) -> Result<()> {
        let content = self.render()?;
        let temp_file = self.path.with_extension("tmp");
        let report_err =
            |e: std::io::Error| ProbeError::Report(format!("{:?}: {}", self.path, e));

        let mut file = fs::File::create(&temp_file).await.map_err(report_err)?;
        file.write_all(content.as_bytes())
            .await
            .map_err(report_err)?;
        file.sync_all().await.map_err(report_err)?;
        fs::rename(&temp_file, &self.path)
            .await
            .map_err(report_err)?;

        tracing::debug!(path = ?self.path, rows = self.rows.len(), "Report written");
        Ok(())
    }
}
