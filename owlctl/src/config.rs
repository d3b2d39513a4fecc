use analysis::CheckMode;
use anyhow::{Context, Result};
use jobs::PollSettings;
use owl_core::{ClientError, Tlp};
use owl_http::HttpOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "owlctl.yaml";

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PollConfig {
    pub max_tries: Option<u32>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct AnalyseConfig {
    pub tlp: Option<String>,
    pub check: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub instance_url: Option<String>,
    pub api_key: Option<String>,
    pub auth_scheme: Option<String>,
    pub certificate: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub poll: Option<PollConfig>,
    pub analyse: Option<AnalyseConfig>,
}

/// Values given on the command line or through the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub certificate: Option<PathBuf>,
}

/// Loads `path`, or `./owlctl.yaml` when no path is given and it exists.
/// An explicitly named file that is missing is an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(Some(cfg))
}

fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

impl Config {
    pub fn with_overrides(mut self, o: Overrides) -> Self {
        if o.url.is_some() { self.instance_url = o.url; }
        if o.api_key.is_some() { self.api_key = o.api_key; }
        if o.certificate.is_some() { self.certificate = o.certificate; }
        self
    }

    /// Copy safe to print: the API key keeps only its last characters.
    pub fn masked(&self) -> Config {
        let mut out = self.clone();
        out.api_key = self.api_key.as_deref().map(mask);
        out
    }

    pub fn http_options(&self) -> std::result::Result<HttpOptions, ClientError> {
        let url = self.instance_url.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let key = self.api_key.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let (Some(url), Some(key)) = (url, key) else {
            return Err(ClientError::Config(
                "instance URL and API key are required \
                 (--url/--api-key, OWLCTL_URL/OWLCTL_API_KEY or the config file)"
                    .into(),
            ));
        };
        let mut opts = HttpOptions::new(url, key);
        if let Some(scheme) = &self.auth_scheme { opts.auth_scheme = scheme.clone(); }
        opts.certificate = self.certificate.clone();
        opts.client_cert = self.client_cert.clone();
        if let Some(t) = self.timeout_ms { opts.timeout_ms = t; }
        Ok(opts)
    }

    pub fn poll_settings(&self) -> PollSettings {
        let mut s = PollSettings::default();
        if let Some(p) = &self.poll {
            if let Some(n) = p.max_tries { s.max_tries = n; }
            if let Some(i) = p.interval_secs { s.interval = Duration::from_secs(i); }
        }
        s
    }

    pub fn default_tlp(&self) -> std::result::Result<Option<Tlp>, ClientError> {
        self.analyse.as_ref().and_then(|a| a.tlp.as_deref()).map(str::parse).transpose()
    }

    pub fn default_check(&self) -> std::result::Result<CheckMode, ClientError> {
        match self.analyse.as_ref().and_then(|a| a.check.as_deref()) {
            Some(c) => c.parse(),
            None => Ok(CheckMode::default()),
        }
    }
}
