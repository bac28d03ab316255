//! chinachu-preview - preview images from a Chinachu recording server
//!
//! Fetches preview frames of recorded programs through a single-slot
//! scheduler backed by a persistent on-disk cache.

mod backend;
mod cache;
mod config;
mod preview;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use backend::{BackendClient, PreviewParams, PreviewRequest};
use cache::{DiskStore, MemoryStore, PreviewCache, PreviewStore};
use config::Settings;
use preview::PreviewScheduler;

/// CLI command
#[derive(Debug, PartialEq)]
enum Command {
    /// Fetch one preview
    Preview {
        id: String,
        format: String,
        params: PreviewParams,
        out: Option<PathBuf>,
    },
    /// Fetch several previews through the queue
    Previews {
        ids: Vec<String>,
        format: String,
        params: PreviewParams,
    },
    /// List recorded programs
    Recorded,
    /// Print raw JSON from API paths
    Get { paths: Vec<String> },
    /// Print a playable stream URL for an external player
    Stream { id: String },
    /// Show preview cache contents
    Cache,
    /// Show or change settings
    Config {
        key: Option<String>,
        value: Option<String>,
    },
    /// Show help
    Help,
}

/// Parsed command line
#[derive(Debug, PartialEq)]
struct Cli {
    command: Command,
    /// Keep the preview cache in memory only
    memory: bool,
}

fn print_help() {
    eprintln!(
        r#"chinachu-preview - Fetch preview images of recorded programs

USAGE:
    chinachu-preview preview <id> [--format <jpeg|png>] [--out <file>] [key=value ...]
    chinachu-preview previews <id> [<id> ...] [--format <jpeg|png>] [key=value ...]
    chinachu-preview recorded
    chinachu-preview get <path> [<path> ...]
    chinachu-preview stream <id>
    chinachu-preview cache
    chinachu-preview config [url|user|password|lifetime] [value]
    chinachu-preview help

COMMANDS:
    preview   Fetch one preview image (cached for the configured lifetime)
    previews  Queue several previews; the newest request is fetched first
    recorded  List recorded programs and their IDs
    get       Fetch API paths concurrently and print their JSON in order
    stream    Print the stream URL of a recording (credentials included)
    cache     Show cached previews after expiring old ones
    config    Show settings, or set one (lifetime is in milliseconds)
    help      Show this help message

OPTIONS:
    --format <fmt>  Image format, "jpeg" (default) or "png"
    --out <file>    Write the decoded image instead of printing a summary
    --memory        Do not read or write the on-disk preview cache
                    (preview and previews only)

EXAMPLES:
    chinachu-preview preview gr27-abc123 pos=30 --out frame.jpg
    chinachu-preview previews gr27-a gr27-b gr27-c --format png
    chinachu-preview config lifetime 86400000

ENVIRONMENT:
    CHINACHU_URL       Backend URL (overrides settings)
    CHINACHU_USER      Basic auth user (overrides settings)
    CHINACHU_PASSWORD  Basic auth password (overrides settings)
    RUST_LOG           Log level (trace, debug, info, warn, error)
"#
    );
}

/// Parse a `key=value` preview param; JSON scalars keep their type
fn parse_param(arg: &str, params: &mut PreviewParams) -> Result<()> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected key=value, got '{}'", arg))?;
    if key.is_empty() {
        return Err(anyhow!("Empty parameter name in '{}'", arg));
    }
    let value = match serde_json::from_str::<Value>(value) {
        Ok(parsed @ (Value::Number(_) | Value::Bool(_))) => parsed,
        _ => Value::String(value.to_string()),
    };
    params.insert(key.to_string(), value);
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut memory = false;
    let mut format = "jpeg".to_string();
    let mut out = None;
    let mut params = PreviewParams::new();
    let mut positional = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--memory" => memory = true,
            "--format" => {
                format = iter
                    .next()
                    .ok_or_else(|| anyhow!("--format needs a value"))?
                    .clone();
            }
            "--out" => {
                out = Some(PathBuf::from(
                    iter.next().ok_or_else(|| anyhow!("--out needs a file"))?,
                ));
            }
            "help" | "--help" | "-h" => {
                return Ok(Cli {
                    command: Command::Help,
                    memory,
                })
            }
            other => positional.push(other.to_string()),
        }
    }

    let Some((name, rest)) = positional.split_first() else {
        return Ok(Cli {
            command: Command::Help,
            memory,
        });
    };

    let command = match name.as_str() {
        "preview" | "previews" => {
            let mut ids = Vec::new();
            for arg in rest {
                if arg.contains('=') {
                    parse_param(arg, &mut params)?;
                } else {
                    ids.push(arg.clone());
                }
            }
            if ids.is_empty() {
                return Err(anyhow!("Usage: chinachu-preview {} <id> ...", name));
            }
            if name == "preview" {
                if ids.len() > 1 {
                    return Err(anyhow!("preview takes one id; use previews for several"));
                }
                Command::Preview {
                    id: ids.remove(0),
                    format,
                    params,
                    out,
                }
            } else {
                Command::Previews {
                    ids,
                    format,
                    params,
                }
            }
        }
        "recorded" => Command::Recorded,
        "get" => {
            if rest.is_empty() {
                return Err(anyhow!("Usage: chinachu-preview get <path> [<path> ...]"));
            }
            Command::Get {
                paths: rest.to_vec(),
            }
        }
        "stream" => match rest.first() {
            Some(id) => Command::Stream { id: id.clone() },
            None => return Err(anyhow!("Usage: chinachu-preview stream <id>")),
        },
        "cache" => Command::Cache,
        "config" => Command::Config {
            key: rest.first().cloned(),
            value: rest.get(1).cloned(),
        },
        other => {
            eprintln!("Unknown command: {}", other);
            Command::Help
        }
    };

    let uses_cache = matches!(command, Command::Preview { .. } | Command::Previews { .. });
    if memory && !uses_cache {
        return Err(anyhow!("--memory only applies to preview and previews"));
    }

    Ok(Cli { command, memory })
}

/// Open the preview cache on disk, or in memory with `--memory`
fn open_cache(settings: &Settings, memory: bool) -> Result<Arc<PreviewCache>> {
    let store: Arc<dyn PreviewStore> = if memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(DiskStore::open(Settings::cache_dir())?)
    };
    Ok(Arc::new(PreviewCache::open(
        store,
        settings.preview_cache_lifetime(),
    )))
}

/// Print a data URI without flooding the terminal
fn summarize(id: &str, data_uri: &cache::DataUri) -> String {
    let text = data_uri.as_str();
    let head: String = text.chars().take(48).collect();
    format!("{}: {}... ({} chars)", id, head, text.len())
}

fn show_config(settings: &Settings, key: Option<&str>) -> Result<()> {
    let masked = if settings.password.is_empty() { "" } else { "********" };
    match key {
        None => {
            println!("url:      {}", settings.url);
            println!("user:     {}", settings.user);
            println!("password: {}", masked);
            println!("lifetime: {} ms", settings.preview_cache_lifetime);
        }
        Some("url") => println!("{}", settings.url),
        Some("user") => println!("{}", settings.user),
        Some("password") => println!("{}", masked),
        Some("lifetime") | Some("previewCacheLifetime") => {
            println!("{}", settings.preview_cache_lifetime)
        }
        Some(other) => return Err(anyhow!("Unknown setting: {}", other)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::WARN);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let settings_path = Settings::default_path();

    match cli.command {
        Command::Preview {
            id,
            format,
            params,
            out,
        } => {
            let settings = Settings::load(&settings_path).with_env_overrides();
            let cache = open_cache(&settings, cli.memory)?;
            let client = BackendClient::new(&settings)?;
            let scheduler = PreviewScheduler::new(client, cache);

            let request = PreviewRequest::new(id.clone(), format, params);
            let data_uri = match scheduler.request_preview(request).await {
                Ok(data_uri) => data_uri,
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to fetch preview");
                    return Err(e.into());
                }
            };

            match out {
                Some(path) => {
                    let bytes = data_uri
                        .decode()
                        .context("Cached preview is not valid base64")?;
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    info!(
                        id = %id,
                        file = %path.display(),
                        mime = data_uri.mime(),
                        size = bytes.len(),
                        "Wrote preview"
                    );
                    println!("{} -> {} ({} bytes)", id, path.display(), bytes.len());
                }
                None => println!("{}", summarize(&id, &data_uri)),
            }
        }
        Command::Previews {
            ids,
            format,
            params,
        } => {
            let settings = Settings::load(&settings_path).with_env_overrides();
            let cache = open_cache(&settings, cli.memory)?;
            let client = BackendClient::new(&settings)?;
            let scheduler = PreviewScheduler::new(client, cache);

            let mut tasks = JoinSet::new();
            for id in ids {
                let scheduler = Arc::clone(&scheduler);
                let request = PreviewRequest::new(id.clone(), format.clone(), params.clone());
                tasks.spawn(async move { (id, scheduler.request_preview(request).await) });
            }
            info!(
                queued = scheduler.queue_len(),
                busy = scheduler.is_processing(),
                "Queued previews"
            );

            let mut failures = 0;
            while let Some(joined) = tasks.join_next().await {
                let (id, result) = joined.context("Preview task panicked")?;
                match result {
                    Ok(data_uri) => println!("{}", summarize(&id, &data_uri)),
                    Err(e) => {
                        failures += 1;
                        println!("{}: failed: {}", id, e);
                    }
                }
            }

            let stats = scheduler.cache().stats();
            info!(hits = stats.hits, misses = stats.misses, "Preview cache metrics");
            if failures > 0 {
                return Err(anyhow!("{} preview(s) failed", failures));
            }
        }
        Command::Recorded => {
            let settings = Settings::load(&settings_path).with_env_overrides();
            let client = BackendClient::new(&settings)?;
            let programs = client
                .list_recorded()
                .await
                .context("Failed to list recorded programs")?;
            if programs.is_empty() {
                println!("No recorded programs.");
            }
            for program in programs {
                let channel = backend::channel_from_legacy(&program.channel, &[]);
                let service = backend::service_from_legacy(&program.channel, &[]);
                let (service_id, name) = match &service {
                    Some(service) => (service.id.as_str(), service.name.as_str()),
                    None => ("", channel.name.as_str()),
                };
                println!(
                    "{:<24} {:>4} min  {:<3} {:<4} {:<10} {:<16} {:<12} {}",
                    program.id,
                    program.minutes(),
                    channel.channel_type,
                    channel.channel,
                    service_id,
                    name,
                    program.category.name(),
                    program.title
                );
            }
        }
        Command::Get { paths } => {
            let settings = Settings::load(&settings_path).with_env_overrides();
            let client = BackendClient::new(&settings)?;
            let bodies: Vec<Value> = client
                .request_all(&paths)
                .await
                .context("Failed to fetch API paths")?;
            for (path, body) in paths.iter().zip(bodies) {
                println!("# {}", path);
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
        }
        Command::Stream { id } => {
            let settings = Settings::load(&settings_path).with_env_overrides();
            let client = BackendClient::new(&settings)?;
            println!("{}", client.get_url(&backend::stream_path(&id)));
        }
        Command::Cache => {
            let settings = Settings::load(&settings_path).with_env_overrides();
            let cache = open_cache(&settings, false)?;
            let entries = cache.snapshot();
            println!(
                "{} cached preview(s) in {} (lifetime {} ms)",
                entries.len(),
                Settings::cache_dir().display(),
                cache.lifetime().as_millis()
            );
            for entry in entries {
                println!(
                    "  {:<24} {:<5} {:<24} key={} time={}",
                    entry.id, entry.format, entry.params, entry.key, entry.time
                );
            }
        }
        Command::Config { key, value } => {
            let mut settings = Settings::load(&settings_path);
            match (key, value) {
                (Some(key), Some(value)) => {
                    settings.set(&key, &value)?;
                    settings.save(&settings_path)?;
                    println!("Saved {} to {}", key, settings_path.display());
                }
                (key, _) => show_config(&settings, key.as_deref())?,
            }
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
