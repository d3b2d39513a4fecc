use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ClientError;

/// Traffic Light Protocol marking attached to a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tlp {
    #[default]
    Clear,
    White,
    Green,
    Amber,
    Red,
}

impl Tlp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tlp::Clear => "CLEAR",
            Tlp::White => "WHITE",
            Tlp::Green => "GREEN",
            Tlp::Amber => "AMBER",
            Tlp::Red => "RED",
        }
    }
}

impl fmt::Display for Tlp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tlp {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLEAR" => Ok(Tlp::Clear),
            "WHITE" => Ok(Tlp::White),
            "GREEN" => Ok(Tlp::Green),
            "AMBER" => Ok(Tlp::Amber),
            "RED" => Ok(Tlp::Red),
            other => Err(ClientError::Validation(format!(
                "unknown TLP '{other}' (expected CLEAR, WHITE, GREEN, AMBER or RED)"
            ))),
        }
    }
}

/// Observable type as understood by the analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Ip,
    Domain,
    Url,
    Hash,
    Generic,
}

impl Classification {
    pub const ALL: [Classification; 5] = [
        Classification::Ip,
        Classification::Domain,
        Classification::Url,
        Classification::Hash,
        Classification::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Ip => "ip",
            Classification::Domain => "domain",
            Classification::Url => "url",
            Classification::Hash => "hash",
            Classification::Generic => "generic",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Classification::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                ClientError::Validation(format!(
                    "observable classification '{s}' is not one of \
                     'generic', 'hash', 'ip', 'domain' and 'url'"
                ))
            })
    }
}

/// Server-side job state. `Pending` and `Running` are the only non-terminal
/// states the client knows; anything it does not recognise lands in `Other`
/// and is treated as still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    ReportedWithoutFails,
    ReportedWithFails,
    Failed,
    Killed,
    #[serde(other)]
    Other,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::ReportedWithoutFails
                | JobStatus::ReportedWithFails
                | JobStatus::Failed
                | JobStatus::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::ReportedWithoutFails => "reported_without_fails",
            JobStatus::ReportedWithFails => "reported_with_fails",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Other => "other",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "reported_without_fails" => Ok(JobStatus::ReportedWithoutFails),
            "reported_with_fails" => Ok(JobStatus::ReportedWithFails),
            "failed" => Ok(JobStatus::Failed),
            "killed" => Ok(JobStatus::Killed),
            other => Err(ClientError::Validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Which family of plugin an action or health check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Analyzer,
    Connector,
}

impl PluginKind {
    /// Path segment used by the job plugin endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Analyzer => "analyzer",
            PluginKind::Connector => "connector",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analyzer" | "analyzers" => Ok(PluginKind::Analyzer),
            "connector" | "connectors" => Ok(PluginKind::Connector),
            other => Err(ClientError::Validation(format!(
                "unknown plugin type '{other}' (expected analyzer or connector)"
            ))),
        }
    }
}
