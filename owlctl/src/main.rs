use analysis::{AnalyseOutcome, AnalyseRequest, Analyser, AnalysisOptions, CheckMode};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use jobs::{Cancellation, JobListQuery, PollEnd, PollOutcome};
use owl_core::{Job, JobStatus, PluginKind, Tlp, Transport};
use owl_http::HttpTransport;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod config;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Args)]
struct AnalysisFlags {
    /// Analyzers to run (comma-separated or repeated). Default: all.
    #[arg(short = 'a', long = "analyzers", value_delimiter = ',')]
    analyzers: Vec<String>,
    /// Connectors to run (comma-separated or repeated). Default: all.
    #[arg(long, value_delimiter = ',')]
    connectors: Vec<String>,
    /// Tag labels to attach to the job
    #[arg(short = 't', long, value_delimiter = ',')]
    tags: Vec<String>,
    /// CLEAR, WHITE, GREEN, AMBER or RED
    #[arg(long)]
    tlp: Option<Tlp>,
    /// Reuse an existing job: reported, running or force-new
    #[arg(short = 'c', long)]
    check: Option<CheckMode>,
    /// Only reuse jobs from the last N minutes
    #[arg(long)]
    minutes_ago: Option<u32>,
    /// JSON file with per-plugin runtime configuration
    #[arg(long, value_name = "FILE")]
    runtime_config: Option<PathBuf>,
    /// Submit through a playbook instead of an explicit plugin list
    #[arg(long)]
    playbook: Option<String>,
    /// Wait for the job to finish
    #[arg(long, default_value_t = false)]
    poll: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCmd {
    /// Print the effective configuration (API key masked)
    Show,
}

#[derive(Debug, Subcommand)]
enum AnalyseCmd {
    /// Analyse an observable (IP, domain, URL, hash or generic value)
    Observable {
        value: String,
        #[command(flatten)]
        flags: AnalysisFlags,
        /// ip, domain, url, hash or generic. Detected when omitted.
        #[arg(long)]
        classification: Option<String>,
    },
    /// Analyse a local file
    File {
        path: PathBuf,
        #[command(flatten)]
        flags: AnalysisFlags,
    },
    /// Analyse every row of a CSV or JSON file
    Batch {
        file: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum JobsCmd {
    /// List jobs
    Ls {
        /// Only show jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Show one job
    View { id: u64 },
    /// Wait for a job to finish
    Poll {
        id: u64,
        #[arg(long)]
        max_tries: Option<u32>,
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
        /// Write the final job as JSON to this file
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Ask the instance to stop a running job
    Kill { id: u64 },
    /// Delete a job
    Rm { id: u64 },
    /// Download the sample a file job was created for
    Download {
        id: u64,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum PluginsCmd {
    /// Stop one plugin run inside a job
    Kill { job_id: u64, kind: PluginKind, name: String },
    /// Run one failed plugin of a job again
    Retry { job_id: u64, kind: PluginKind, name: String },
    /// Health-check a plugin
    #[cfg(feature = "catalog")]
    Health { kind: PluginKind, name: String },
    /// Print plugin or playbook configuration
    #[cfg(feature = "catalog")]
    Ls {
        #[arg(value_parser = ["analyzer", "connector", "playbook"])]
        what: String,
    },
}

#[cfg(feature = "catalog")]
#[derive(Debug, Subcommand)]
enum TagsCmd {
    Ls,
    View { id: u64 },
    Add { label: String, color: String },
    Edit { id: u64, label: String, color: String },
    Rm { id: u64 },
}

#[derive(Debug, Parser)]
#[command(
    name = "owlctl",
    version,
    about = "Client for submitting and tracking threat-intelligence analysis jobs"
)]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./owlctl.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Verbose logging (RUST_LOG still wins when set)
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    /// Instance base URL
    #[arg(long, global = true, env = "OWLCTL_URL")]
    url: Option<String>,
    #[arg(long, global = true, env = "OWLCTL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// CA bundle used to verify the instance
    #[arg(long, global = true, env = "OWLCTL_CERTIFICATE")]
    certificate: Option<PathBuf>,
    /// Output format: text, json, or jsonl
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Request an analysis, reusing an existing job when one matches
    Analyse {
        #[command(subcommand)]
        cmd: AnalyseCmd,
    },
    /// Inspect and manage jobs
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },
    /// Act on analyzers and connectors
    Plugins {
        #[command(subcommand)]
        cmd: PluginsCmd,
    },
    /// Manage tags
    #[cfg(feature = "catalog")]
    Tags {
        #[command(subcommand)]
        cmd: TagsCmd,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "debug"
    } else {
        "warn,owlctl=info,analysis=info,jobs=info,catalog=info,classify=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Prints one result. `text` is only rendered in text mode.
fn emit<S: Serialize>(
    format: OutputFormat,
    value: &S,
    text: impl FnOnce() -> String,
) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Jsonl => println!("{}", serde_json::to_string(value)?),
    }
    Ok(())
}

/// Prints a list: one line per item in text and jsonl, one array in json.
fn emit_list<S: Serialize>(
    format: OutputFormat,
    items: &[S],
    text: impl Fn(&S) -> String,
) -> Result<()> {
    match format {
        OutputFormat::Text => items.iter().for_each(|i| println!("{}", text(i))),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
        OutputFormat::Jsonl => {
            for i in items {
                println!("{}", serde_json::to_string(i)?);
            }
        }
    }
    Ok(())
}

fn job_line(job: &Job) -> String {
    let mut line = format!("#{} {} {}", job.id, job.status, job.target_name());
    let kind = job.target_kind();
    if !kind.is_empty() {
        line.push_str(&format!(" ({kind})"));
    }
    if let Some(owner) = job.owner() {
        line.push_str(&format!(" by {owner}"));
    }
    line
}

fn job_text(job: &Job) -> String {
    let mut lines = vec![job_line(job)];
    if let Some(t) = &job.tlp {
        lines.push(format!("  tlp: {t}"));
    }
    if !job.tags.is_empty() {
        let labels: Vec<&str> = job.tags.iter().map(|t| t.label.as_str()).collect();
        lines.push(format!("  tags: {}", labels.join(",")));
    }
    if let Some(t) = job.process_time {
        lines.push(format!("  process time: {t:.2}s"));
    }
    let plugins = [("analyzer", &job.analyzer_reports), ("connector", &job.connector_reports)];
    for (kind, reports) in plugins {
        for r in reports {
            let state = if r.succeeded() { "ok" } else { r.status.as_deref().unwrap_or("unknown") };
            lines.push(format!("  {kind} {}: {state}", r.name));
        }
    }
    lines.join("\n")
}

fn poll_json(p: &PollOutcome) -> Value {
    let end = match p.end {
        PollEnd::Terminal => "terminal",
        PollEnd::Exhausted => "exhausted",
        PollEnd::Cancelled => "cancelled",
    };
    json!({"attempts": p.attempts, "end": end, "job": p.job})
}

fn poll_text(p: &PollOutcome) -> String {
    match p.end {
        PollEnd::Terminal => {
            format!("job #{} {} after {} poll(s)", p.job.id, p.job.status, p.attempts)
        }
        PollEnd::Exhausted => {
            format!("job #{} still {} after {} poll(s)", p.job.id, p.job.status, p.attempts)
        }
        PollEnd::Cancelled => format!("job #{} polling cancelled while {}", p.job.id, p.job.status),
    }
}

fn outcome_json(o: &AnalyseOutcome) -> Result<Value> {
    Ok(match o {
        AnalyseOutcome::Existing { job_id, status } => {
            json!({"job_id": job_id, "status": status, "existing": true})
        }
        AnalyseOutcome::Submitted { submission, poll } => {
            let mut v = serde_json::to_value(submission)?;
            if let Value::Object(m) = &mut v {
                m.insert("existing".into(), json!(false));
                m.insert("poll".into(), poll.as_ref().map(poll_json).unwrap_or(Value::Null));
            }
            v
        }
    })
}

fn outcome_text(o: &AnalyseOutcome) -> String {
    match o {
        AnalyseOutcome::Existing { job_id, status } => {
            format!("job #{job_id} already exists ({status})")
        }
        AnalyseOutcome::Submitted { submission: s, poll } => {
            let mut line = format!("job #{} {}", s.job_id, s.status);
            if !s.analyzers_running.is_empty() {
                line.push_str(&format!(" analyzers: {}", s.analyzers_running.join(",")));
            }
            if !s.connectors_running.is_empty() {
                line.push_str(&format!(" connectors: {}", s.connectors_running.join(",")));
            }
            for w in &s.warnings {
                line.push_str(&format!("\n  warning: {w}"));
            }
            if let Some(p) = poll {
                line.push('\n');
                line.push_str(&poll_text(p));
            }
            line
        }
    }
}

/// Cancels polling on Ctrl-C. Must be called inside the runtime.
fn ctrl_c_cancellation() -> Cancellation {
    let (handle, cancel) = jobs::cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping after the current request");
            handle.cancel();
        }
    });
    cancel
}

fn analyse_request(
    cfg: &config::Config,
    target: String,
    is_file: bool,
    flags: AnalysisFlags,
) -> Result<AnalyseRequest> {
    let mut req =
        if is_file { AnalyseRequest::file(target) } else { AnalyseRequest::observable(target) };
    let runtime_config = match &flags.runtime_config {
        Some(p) => analysis::load_runtime_config(p)?,
        None => Default::default(),
    };
    req.options = AnalysisOptions {
        tlp: flags.tlp.or(cfg.default_tlp()?),
        analyzers: flags.analyzers,
        connectors: flags.connectors,
        tags: flags.tags,
        runtime_config,
    };
    req.check = match flags.check {
        Some(c) => c,
        None => cfg.default_check()?,
    };
    req.minutes_ago = flags.minutes_ago;
    req.playbook = flags.playbook;
    req.should_poll = flags.poll;
    Ok(req)
}

async fn run_analyse<T: Transport>(
    transport: &T,
    cfg: &config::Config,
    format: OutputFormat,
    cmd: AnalyseCmd,
) -> Result<()> {
    let analyser = Analyser::new(transport)
        .with_poll_settings(cfg.poll_settings())
        .with_cancellation(ctrl_c_cancellation());
    let req = match cmd {
        AnalyseCmd::Observable { value, flags, classification } => {
            let mut req = analyse_request(cfg, value, false, flags)?;
            req.classification = classification;
            req
        }
        AnalyseCmd::File { path, flags } => {
            analyse_request(cfg, path.to_string_lossy().into_owned(), true, flags)?
        }
        AnalyseCmd::Batch { file } => {
            let rows = analysis::load_rows(&file)?;
            let started = Instant::now();
            let started_at = now_rfc3339();
            let entries = analyser.analyse_batch(rows).await;
            let mut failed = 0usize;
            for e in &entries {
                match &e.result {
                    Ok(o) => {
                        let mut v = outcome_json(o)?;
                        if let Value::Object(m) = &mut v {
                            m.insert("row".into(), json!(e.row));
                            m.insert("value".into(), json!(e.value));
                        }
                        emit(format, &v, || {
                            format!("row {} {}: {}", e.row, e.value, outcome_text(o))
                        })?;
                    }
                    Err(err) => {
                        failed += 1;
                        let v = json!({"row": e.row, "value": e.value, "error": err.to_string()});
                        emit(format, &v, || format!("row {} {}: error: {err}", e.row, e.value))?;
                    }
                }
            }
            tracing::info!(
                rows = entries.len(),
                failed,
                started_at = %started_at,
                duration_ms = started.elapsed().as_millis() as u64,
                "batch finished"
            );
            if failed > 0 {
                return Err(anyhow!("{failed} of {} batch rows failed", entries.len()));
            }
            return Ok(());
        }
    };
    let outcome = analyser.analyse(req).await?;
    emit(format, &outcome_json(&outcome)?, || outcome_text(&outcome))
}

/// Actions report `false` rather than failing the command; the cause is logged.
fn action_result(what: &str, res: owl_core::Result<bool>) -> bool {
    match res {
        Ok(ok) => ok,
        Err(e) => {
            tracing::error!(error = %e, "{what} failed");
            false
        }
    }
}

async fn run_jobs<T: Transport>(
    transport: &T,
    cfg: &config::Config,
    format: OutputFormat,
    cmd: JobsCmd,
) -> Result<()> {
    match cmd {
        JobsCmd::Ls { status, page, page_size } => {
            let page = jobs::list_jobs(transport, &JobListQuery { page, page_size }).await?;
            tracing::debug!(count = page.count, total_pages = page.total_pages, "listed jobs");
            let shown: Vec<&Job> =
                page.results.iter().filter(|j| status.map_or(true, |s| j.status == s)).collect();
            emit_list(format, &shown, |j| job_line(j))
        }
        JobsCmd::View { id } => {
            let job = jobs::get_job(transport, id).await?;
            emit(format, &job, || job_text(&job))
        }
        JobsCmd::Poll { id, max_tries, interval, out } => {
            let mut settings = cfg.poll_settings();
            if let Some(n) = max_tries { settings.max_tries = n; }
            if let Some(i) = interval { settings.interval = Duration::from_secs(i); }
            let mut cancel = ctrl_c_cancellation();
            let outcome = jobs::poll_job_until(transport, id, settings, &mut cancel).await?;
            if let Some(path) = out {
                let body = serde_json::to_string_pretty(&outcome.job)?;
                std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
            }
            let mut v = poll_json(&outcome);
            if let Value::Object(m) = &mut v {
                m.insert("polled_at".into(), json!(now_rfc3339()));
            }
            emit(format, &v, || poll_text(&outcome))
        }
        JobsCmd::Kill { id } => {
            let ok = action_result("kill job", jobs::kill_job(transport, id).await);
            emit(format, &json!({"job_id": id, "killed": ok}), || format!("job #{id} killed: {ok}"))
        }
        JobsCmd::Rm { id } => {
            let ok = action_result("delete job", jobs::delete_job(transport, id).await);
            let v = json!({"job_id": id, "deleted": ok});
            emit(format, &v, || format!("job #{id} deleted: {ok}"))
        }
        JobsCmd::Download { id, out } => {
            let bytes = jobs::download_sample(transport, id).await?;
            std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
            let d = fingerprint::digest_file(&out)?;
            let v = json!({
                "job_id": id,
                "path": d.path,
                "size": d.size,
                "md5": d.md5,
                "sha256": d.sha256,
                "downloaded_at": now_rfc3339(),
            });
            emit(format, &v, || {
                format!("{} {} bytes md5 {} sha256 {}", d.path.display(), d.size, d.md5, d.sha256)
            })
        }
    }
}

async fn run_plugins<T: Transport>(
    transport: &T,
    format: OutputFormat,
    cmd: PluginsCmd,
) -> Result<()> {
    match cmd {
        PluginsCmd::Kill { job_id, kind, name } => {
            let res = jobs::kill_plugin(transport, job_id, kind, &name).await;
            let ok = action_result("kill plugin", res);
            let v = json!({"job_id": job_id, "kind": kind.as_str(), "name": name, "killed": ok});
            emit(format, &v, || format!("job #{job_id} {kind} {name} killed: {ok}"))
        }
        PluginsCmd::Retry { job_id, kind, name } => {
            let res = jobs::retry_plugin(transport, job_id, kind, &name).await;
            let ok = action_result("retry plugin", res);
            let v = json!({"job_id": job_id, "kind": kind.as_str(), "name": name, "retried": ok});
            emit(format, &v, || format!("job #{job_id} {kind} {name} retried: {ok}"))
        }
        #[cfg(feature = "catalog")]
        PluginsCmd::Health { kind, name } => {
            let healthy = catalog::plugin_health(transport, kind, &name).await?;
            let v = json!({"kind": kind.as_str(), "name": name, "healthy": healthy});
            let state = healthy.map(|h| h.to_string()).unwrap_or_else(|| "unknown".into());
            emit(format, &v, || format!("{kind} {name} healthy: {state}"))
        }
        #[cfg(feature = "catalog")]
        PluginsCmd::Ls { what } => {
            let doc = match what.as_str() {
                "playbook" => catalog::playbook_configs(transport).await?,
                other => catalog::plugin_configs(transport, other.parse()?).await?,
            };
            emit(format, &doc, || match &doc {
                Value::Object(m) => m.keys().cloned().collect::<Vec<_>>().join("\n"),
                other => other.to_string(),
            })
        }
    }
}

#[cfg(feature = "catalog")]
async fn run_tags<T: Transport>(transport: &T, format: OutputFormat, cmd: TagsCmd) -> Result<()> {
    let line = |t: &owl_core::Tag| format!("#{} {} {}", t.id, t.label, t.color);
    match cmd {
        TagsCmd::Ls => emit_list(format, &catalog::list_tags(transport).await?, line),
        TagsCmd::View { id } => {
            let tag = catalog::get_tag(transport, id).await?;
            emit(format, &tag, || line(&tag))
        }
        TagsCmd::Add { label, color } => {
            let tag = catalog::create_tag(transport, &label, &color).await?;
            emit(format, &tag, || line(&tag))
        }
        TagsCmd::Edit { id, label, color } => {
            let tag = catalog::edit_tag(transport, id, &label, &color).await?;
            emit(format, &tag, || line(&tag))
        }
        TagsCmd::Rm { id } => {
            let ok = action_result("delete tag", catalog::delete_tag(transport, id).await);
            let v = json!({"tag_id": id, "deleted": ok});
            emit(format, &v, || format!("tag #{id} deleted: {ok}"))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let cfg = config::load_config(cli.config.as_deref())?
        .unwrap_or_default()
        .with_overrides(config::Overrides {
            url: cli.url,
            api_key: cli.api_key,
            certificate: cli.certificate,
        });
    let format = cli.format;
    let command = match cli.command {
        Commands::Version => {
            println!("owlctl {} (core {})", env!("CARGO_PKG_VERSION"), owl_core::version());
            return Ok(());
        }
        Commands::Config { cmd: ConfigCmd::Show } => {
            let masked = cfg.masked();
            return match format {
                OutputFormat::Text => {
                    print!("{}", serde_yaml::to_string(&masked)?);
                    Ok(())
                }
                _ => emit(format, &masked, String::new),
            };
        }
        other => other,
    };

    let transport = HttpTransport::new(cfg.http_options()?)?;
    tracing::debug!(url = %transport.base_url(), "using instance");
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match command {
            Commands::Analyse { cmd } => run_analyse(&transport, &cfg, format, cmd).await,
            Commands::Jobs { cmd } => run_jobs(&transport, &cfg, format, cmd).await,
            Commands::Plugins { cmd } => run_plugins(&transport, format, cmd).await,
            #[cfg(feature = "catalog")]
            Commands::Tags { cmd } => run_tags(&transport, format, cmd).await,
            Commands::Version | Commands::Config { .. } => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn job() -> Job {
        serde_json::from_value(json!({
            "id": 12,
            "status": "reported_with_fails",
            "observable_name": "example.com",
            "observable_classification": "domain",
            "user": {"username": "analyst"},
            "tlp": "AMBER",
            "tags": [{"id": 1, "label": "phish", "color": "#ff0000"}],
            "analyzer_reports": [
                {"name": "Classic_DNS", "status": "SUCCESS"},
                {"name": "Shodan", "status": "FAILED"},
                {"name": "Yara"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "owlctl",
            "--format",
            "jsonl",
            "analyse",
            "observable",
            "8.8.8.8",
            "-a",
            "Shodan,Classic_DNS",
            "-c",
            "force-new",
            "--poll",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Jsonl);
        match cli.command {
            Commands::Analyse { cmd: AnalyseCmd::Observable { value, flags, .. } } => {
                assert_eq!(value, "8.8.8.8");
                assert_eq!(flags.analyzers, vec!["Shodan", "Classic_DNS"]);
                assert_eq!(flags.check, Some(CheckMode::ForceNew));
                assert!(flags.poll);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn job_line_names_target_and_owner() {
        assert_eq!(job_line(&job()), "#12 reported_with_fails example.com (domain) by analyst");
    }

    #[test]
    fn job_text_lists_plugin_states() {
        let text = job_text(&job());
        assert!(text.contains("  tlp: AMBER"));
        assert!(text.contains("  tags: phish"));
        assert!(text.contains("  analyzer Classic_DNS: ok"));
        assert!(text.contains("  analyzer Shodan: FAILED"));
        assert!(text.contains("  analyzer Yara: unknown"));
    }

    #[test]
    fn outcomes_render_in_text_and_json() {
        let existing = AnalyseOutcome::Existing { job_id: 4, status: "running".into() };
        assert_eq!(outcome_text(&existing), "job #4 already exists (running)");
        assert_eq!(outcome_json(&existing).unwrap()["existing"], true);

        let poll = PollOutcome { job: job(), attempts: 3, end: PollEnd::Terminal };
        assert_eq!(poll_text(&poll), "job #12 reported_with_fails after 3 poll(s)");
        assert_eq!(poll_json(&poll)["end"], "terminal");
    }
}
