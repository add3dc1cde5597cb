//! Thin CLI layer: parse args, styled output, and call into snag-core.
//! Progress and JSON renderers are pure consumers of the engine's events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::io::IsTerminal;

use snag_core::events::EventSink;
use snag_core::probe::ProbeResult;
use snag_core::request::{FetchOutcome, FetchRequest, OutputTarget};
use snag_core::{FetchPlan, Fetcher, HandlerConfig, HandlerRegistry, Target};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && std::env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

/// Progress bar renderer driven by engine events.
struct ProgressRenderer {
    bar: Mutex<Option<ProgressBar>>,
    quiet: bool,
}

impl ProgressRenderer {
    fn new(quiet: bool) -> Self {
        Self {
            bar: Mutex::new(None),
            quiet,
        }
    }
}

impl EventSink for ProgressRenderer {
    fn on_plan(&self, plan: &FetchPlan) {
        if self.quiet || !std::io::stderr().is_terminal() {
            return;
        }
        let bar = match plan.total_size {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{bar:30.cyan/dim} {bytes}/{total_bytes} {bytes_per_sec} eta {eta}")
                        .unwrap(),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.dim} {bytes} {bytes_per_sec}")
                        .unwrap(),
                );
                bar
            }
        };
        bar.set_position(plan.resume_offset);
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn on_progress(&self, bytes: u64, _total: Option<u64>, _rate: f64, _eta: Option<Duration>) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.set_position(bytes);
        }
    }

    fn on_concurrency_changed(&self, n: usize, reason: &'static str) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.set_message(format!("{n} conn ({reason})"));
        }
    }

    fn on_complete(&self, _outcome: &FetchOutcome) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }
}

/// Line-JSON renderer: one object per event on stdout.
struct JsonRenderer;

fn emit_json(value: serde_json::Value) {
    println!("{value}");
}

impl EventSink for JsonRenderer {
    fn on_probe(&self, probe: &ProbeResult) {
        emit_json(serde_json::json!({ "event": "probe", "probe": probe }));
    }

    fn on_plan(&self, plan: &FetchPlan) {
        emit_json(serde_json::json!({
            "event": "plan",
            "mode": format!("{:?}", plan.mode).to_lowercase(),
            "total_size": plan.total_size,
            "resume_offset": plan.resume_offset,
            "max_connections": plan.max_connections,
        }));
    }

    fn on_chunk_landed(&self, offset: u64, length: u64, duration: Duration) {
        emit_json(serde_json::json!({
            "event": "chunk_landed",
            "offset": offset,
            "length": length,
            "secs": duration.as_secs_f64(),
        }));
    }

    fn on_concurrency_changed(&self, n: usize, reason: &'static str) {
        emit_json(serde_json::json!({
            "event": "concurrency", "connections": n, "reason": reason,
        }));
    }

    fn on_retry(&self, category: &'static str, delay: Duration, attempt: u32) {
        emit_json(serde_json::json!({
            "event": "retry",
            "category": category,
            "delay_secs": delay.as_secs_f64(),
            "attempt": attempt,
        }));
    }

    fn on_progress(&self, bytes: u64, total: Option<u64>, rate: f64, eta: Option<Duration>) {
        emit_json(serde_json::json!({
            "event": "progress",
            "bytes": bytes,
            "total": total,
            "rate": rate,
            "eta_secs": eta.map(|d| d.as_secs_f64()),
        }));
    }

    fn on_complete(&self, outcome: &FetchOutcome) {
        emit_json(serde_json::json!({ "event": "complete", "outcome": outcome }));
    }
}

fn transfer_args() -> Vec<Arg> {
    vec![
        Arg::new("output")
            .short('o')
            .long("output")
            .help("Output path, or '-' for stdout"),
        Arg::new("connections")
            .short('c')
            .long("connections")
            .value_parser(clap::value_parser!(usize))
            .default_value("32")
            .help("Maximum parallel connections"),
        Arg::new("sha256")
            .long("sha256")
            .help("Expected SHA-256 of the object, hex"),
        Arg::new("resume")
            .long("resume")
            .action(ArgAction::SetTrue)
            .help("Resume a previous partial transfer"),
        Arg::new("timeout")
            .long("timeout")
            .value_parser(clap::value_parser!(u64))
            .default_value("30")
            .help("Per-request timeout in seconds"),
        Arg::new("min-chunk")
            .long("min-chunk")
            .value_parser(clap::value_parser!(u64))
            .help("Minimum chunk size in bytes"),
        Arg::new("max-chunk")
            .long("max-chunk")
            .value_parser(clap::value_parser!(u64))
            .help("Maximum chunk size in bytes"),
        Arg::new("insecure")
            .short('k')
            .long("insecure")
            .action(ArgAction::SetTrue)
            .help("Skip TLS certificate verification"),
        Arg::new("pin")
            .long("pin")
            .action(ArgAction::Append)
            .help("Pin a host to a leaf cert fingerprint: HOST=SHA256HEX"),
        Arg::new("header")
            .short('H')
            .long("header")
            .action(ArgAction::Append)
            .help("Extra request header: 'Name: value'"),
        Arg::new("cookie")
            .long("cookie")
            .help("Cookie string sent with every request"),
        Arg::new("proxy")
            .long("proxy")
            .help("Proxy URL (http, https or socks5)"),
        Arg::new("http3")
            .long("http3")
            .action(ArgAction::SetTrue)
            .help("Attempt HTTP/3 when the server advertises it"),
        Arg::new("quiet")
            .short('q')
            .long("quiet")
            .action(ArgAction::SetTrue)
            .help("No progress output"),
        Arg::new("json")
            .long("json")
            .action(ArgAction::SetTrue)
            .help("Emit line-delimited JSON events"),
    ]
}

fn cli() -> Command {
    Command::new("snag")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fast adaptive parallel downloader for HTTP, FTP and SSH")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("fetch")
                .about("Fetch one URL")
                .arg(Arg::new("url").required(true))
                .args(transfer_args()),
        )
        .subcommand(
            Command::new("mirror")
                .about("Fetch from the fastest of several mirrors")
                .arg(Arg::new("urls").required(true).num_args(2..))
                .args(transfer_args()),
        )
        .subcommand(
            Command::new("probe")
                .about("Probe a URL without transferring the body")
                .arg(Arg::new("url").required(true))
                .arg(
                    Arg::new("insecure")
                        .short('k')
                        .long("insecure")
                        .action(ArgAction::SetTrue),
                )
                .arg(Arg::new("json").long("json").action(ArgAction::SetTrue)),
        )
}

fn parse_pins(matches: &ArgMatches) -> Result<HashMap<String, String>, String> {
    let mut pins = HashMap::new();
    if let Some(values) = matches.get_many::<String>("pin") {
        for value in values {
            let (host, fpr) = value
                .split_once('=')
                .ok_or_else(|| format!("bad --pin '{value}', expected HOST=SHA256HEX"))?;
            pins.insert(host.to_string(), fpr.to_string());
        }
    }
    Ok(pins)
}

fn parse_headers(matches: &ArgMatches) -> Result<Vec<(String, String)>, String> {
    let mut headers = Vec::new();
    if let Some(values) = matches.get_many::<String>("header") {
        for value in values {
            let (name, val) = value
                .split_once(':')
                .ok_or_else(|| format!("bad --header '{value}', expected 'Name: value'"))?;
            headers.push((name.trim().to_string(), val.trim().to_string()));
        }
    }
    Ok(headers)
}

fn build_request(urls: Vec<String>, matches: &ArgMatches) -> Result<FetchRequest, String> {
    let output = match matches.get_one::<String>("output").map(String::as_str) {
        Some("-") => OutputTarget::Stdout,
        Some(path) => OutputTarget::File(PathBuf::from(path)),
        None => {
            let target = Target::parse(&urls[0]).map_err(|e| e.to_string())?;
            let name = target
                .file_name()
                .ok_or_else(|| "no output name derivable from URL, use -o".to_string())?;
            OutputTarget::File(PathBuf::from(name))
        }
    };

    let mut request = FetchRequest::mirror(urls, output);
    request.max_connections = *matches.get_one::<usize>("connections").unwrap();
    request.timeout = Duration::from_secs(*matches.get_one::<u64>("timeout").unwrap());
    if let Some(min) = matches.get_one::<u64>("min-chunk") {
        request.min_chunk = *min;
    }
    if let Some(max) = matches.get_one::<u64>("max-chunk") {
        request.max_chunk = *max;
    }
    request.expected_sha256 = matches.get_one::<String>("sha256").cloned();
    request.resume = matches.get_flag("resume");
    request.verify_tls = !matches.get_flag("insecure");
    request.pins = parse_pins(matches)?;
    request.headers = parse_headers(matches)?;
    request.cookie = matches.get_one::<String>("cookie").cloned();
    request.proxy = matches.get_one::<String>("proxy").cloned();
    request.http3 = matches.get_flag("http3");
    Ok(request)
}

async fn run_transfer(urls: Vec<String>, matches: &ArgMatches) -> i32 {
    let request = match build_request(urls, matches) {
        Ok(request) => request,
        Err(msg) => {
            error(&msg);
            return 2;
        }
    };
    let json = matches.get_flag("json");
    let quiet = matches.get_flag("quiet");
    let sink: Arc<dyn EventSink> = if json {
        Arc::new(JsonRenderer)
    } else {
        Arc::new(ProgressRenderer::new(quiet))
    };

    let (fetcher, cancel) = Fetcher::new(sink);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match fetcher.run(request).await {
        FetchOutcome::Success(summary) => {
            if !json && !quiet {
                success(&format!(
                    "done: {} in {:.1}s ({}/s) over {} [{} conn] sha256 {}",
                    HumanBytes(summary.bytes),
                    summary.duration.as_secs_f64(),
                    HumanBytes(summary.avg_throughput as u64),
                    summary.protocol_used,
                    summary.connections_used,
                    &summary.sha256[..16],
                ));
            }
            0
        }
        FetchOutcome::Failure(failure) => {
            if !json {
                error(&format!("fetch failed: {}", failure.message));
                if failure.can_resume {
                    info(&format!(
                        "{} landed; rerun with --resume to continue",
                        HumanBytes(failure.partial_bytes)
                    ));
                }
            }
            1
        }
    }
}

async fn run_probe(matches: &ArgMatches) -> i32 {
    let url = matches.get_one::<String>("url").unwrap();
    let target = match Target::parse(url) {
        Ok(target) => target,
        Err(e) => {
            error(&e.to_string());
            return 2;
        }
    };
    let config = HandlerConfig {
        verify_tls: !matches.get_flag("insecure"),
        ..HandlerConfig::default()
    };
    let registry = match HandlerRegistry::builtin(&config) {
        Ok(registry) => registry,
        Err(e) => {
            error(&e.to_string());
            return 1;
        }
    };
    let handler = match registry.for_target(&target) {
        Ok(handler) => handler,
        Err(e) => {
            error(&e.to_string());
            return 1;
        }
    };
    match handler.probe(&target).await {
        Ok(probe) => {
            if matches.get_flag("json") {
                emit_json(serde_json::json!({ "probe": probe }));
            } else {
                println!("protocol:  {}", probe.protocol);
                if let Some(addr) = probe.peer_addr {
                    println!("peer:      {addr}");
                }
                println!("latency:   {:.1} ms", probe.latency.as_secs_f64() * 1000.0);
                match probe.content_length {
                    Some(len) => println!("length:    {} ({len} bytes)", HumanBytes(len)),
                    None => println!("length:    unknown"),
                }
                println!("ranges:    {}", if probe.supports_range { "yes" } else { "no" });
                if let Some(ct) = &probe.content_type {
                    println!("type:      {ct}");
                }
                if let Some(etag) = &probe.validators.etag {
                    println!("etag:      {etag}");
                }
                if let Some(lm) = &probe.validators.last_modified {
                    println!("modified:  {lm}");
                }
                if let Some(tls) = &probe.tls {
                    println!("tls:       {} {}", tls.version, tls.cipher);
                    if let Some(issuer) = &tls.issuer {
                        println!("issuer:    {issuer}");
                    }
                    if let Some(na) = &tls.not_after {
                        println!("expires:   {na}");
                    }
                    println!("sha256:    {}", tls.sha256_fingerprint);
                }
            }
            0
        }
        Err(e) => {
            error(&format!("probe failed: {e}"));
            1
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("SNAG_LOG"))
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let matches = cli().get_matches();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    let code = runtime.block_on(async {
        match matches.subcommand() {
            Some(("fetch", sub)) => {
                let url = sub.get_one::<String>("url").unwrap().clone();
                run_transfer(vec![url], sub).await
            }
            Some(("mirror", sub)) => {
                let urls: Vec<String> = sub
                    .get_many::<String>("urls")
                    .unwrap()
                    .cloned()
                    .collect();
                run_transfer(urls, sub).await
            }
            Some(("probe", sub)) => run_probe(sub).await,
            _ => unreachable!("subcommand required"),
        }
    });
    std::process::exit(code);
}
