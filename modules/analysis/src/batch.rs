//! Batch input: a JSON array (or single object) or a CSV file with a header
//! row, one analysis per row.

use owl_core::{ClientError, Result, Tlp};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

use crate::orchestrator::{AnalyseRequest, CheckMode, TargetKind};
use crate::submit::AnalysisOptions;

/// One input row as read. List columns accept a JSON array or a
/// comma-separated string.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BatchRow {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub tlp: Option<String>,
    #[serde(default)]
    pub analyzers_list: Option<Value>,
    #[serde(default)]
    pub connectors_list: Option<Value>,
    /// Path to a JSON file holding the runtime configuration.
    #[serde(default)]
    pub runtime_config: Option<String>,
    #[serde(default)]
    pub tags_list: Option<Value>,
    #[serde(default)]
    pub should_poll: Option<Value>,
}

fn list(field: &str, v: Option<&Value>) -> Result<Vec<String>> {
    let split = |s: &str| -> Vec<String> {
        s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from).collect()
    };
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(split(s)),
        Some(Value::Number(n)) => Ok(vec![n.to_string()]),
        Some(Value::Bool(b)) => Ok(vec![b.to_string()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| match i {
                Value::String(s) => Ok(s.trim().to_string()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => {
                    Err(ClientError::Validation(format!("{field}: expected a string, got {other}")))
                }
            })
            .collect(),
        Some(other) => {
            Err(ClientError::Validation(format!("{field}: expected a list, got {other}")))
        }
    }
}

fn flag(v: Option<&Value>) -> Result<bool> {
    match v {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "" | "false" | "no" | "0" => Ok(false),
            "true" | "yes" | "1" => Ok(true),
            other => not_a_boolean(other),
        },
        Some(other) => not_a_boolean(other),
    }
}

fn not_a_boolean(v: impl std::fmt::Display) -> Result<bool> {
    Err(ClientError::Validation(format!("should_poll: '{v}' is not a boolean")))
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Reads a runtime configuration file; it must hold a JSON object.
pub fn load_runtime_config(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ClientError::NotFound { path: path.to_path_buf() },
        _ => ClientError::Config(format!("{}: {e}", path.display())),
    })?;
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ClientError::Validation(format!(
            "{}: runtime configuration must be a JSON object",
            path.display()
        ))),
        Err(e) => Err(ClientError::Validation(format!("{}: {e}", path.display()))),
    }
}

impl BatchRow {
    /// Converts the row into a request. Missing `tlp` leaves the submission
    /// default in place; missing `check` means [`CheckMode::Reported`].
    pub fn into_request(self) -> Result<AnalyseRequest> {
        let value = self.value.trim();
        if value.is_empty() {
            return Err(ClientError::Validation("row has an empty value".into()));
        }
        let kind: TargetKind = self.kind.parse()?;
        let check = match non_empty(&self.check) {
            Some(c) => c.parse()?,
            None => CheckMode::default(),
        };
        let tlp = non_empty(&self.tlp).map(str::parse::<Tlp>).transpose()?;
        let runtime_config = match non_empty(&self.runtime_config) {
            Some(p) => load_runtime_config(Path::new(p))?,
            None => Map::new(),
        };
        let options = AnalysisOptions {
            tlp,
            analyzers: list("analyzers_list", self.analyzers_list.as_ref())?,
            connectors: list("connectors_list", self.connectors_list.as_ref())?,
            tags: list("tags_list", self.tags_list.as_ref())?,
            runtime_config,
        };
        Ok(AnalyseRequest {
            target: value.to_string(),
            kind,
            check,
            classification: None,
            options,
            playbook: None,
            should_poll: flag(self.should_poll.as_ref())?,
            minutes_ago: None,
        })
    }
}

/// Parses batch rows from text. Text whose first non-blank character is `[`
/// or `{` is JSON; anything else is CSV with a header row.
pub fn parse_rows(text: &str) -> Result<Vec<BatchRow>> {
    match text.trim_start().chars().next() {
        None => Ok(Vec::new()),
        Some('[') => serde_json::from_str(text)
            .map_err(|e| ClientError::Validation(format!("batch JSON: {e}"))),
        Some('{') => serde_json::from_str::<BatchRow>(text)
            .map(|r| vec![r])
            .map_err(|e| ClientError::Validation(format!("batch JSON: {e}"))),
        Some(_) => {
            // Cells stay strings: type inference would turn a tag like `007` into 7.
            let mut rdr =
                csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(text.as_bytes());
            let headers = rdr
                .headers()
                .map_err(|e| ClientError::Validation(format!("batch CSV header: {e}")))?
                .clone();
            let mut rows = Vec::new();
            for (i, rec) in rdr.records().enumerate() {
                // header is line 1
                let invalid = |e: &dyn std::fmt::Display| {
                    ClientError::Validation(format!("batch CSV line {}: {e}", i + 2))
                };
                let rec = rec.map_err(|e| invalid(&e))?;
                let cells: Map<String, Value> = headers
                    .iter()
                    .zip(rec.iter())
                    .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                    .collect();
                rows.push(serde_json::from_value(Value::Object(cells)).map_err(|e| invalid(&e))?);
            }
            Ok(rows)
        }
    }
}

pub fn load_rows(path: &Path) -> Result<Vec<BatchRow>> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ClientError::NotFound { path: path.to_path_buf() },
        _ => ClientError::Config(format!("{}: {e}", path.display())),
    })?;
    let rows = parse_rows(&text)?;
    tracing::debug!(path = %path.display(), rows = rows.len(), "loaded batch");
    Ok(rows)
}
