//! jobq CLI: run the broker, or talk to a running one.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jobq::config::{Config, presets};
use jobq::registry::Registry;
use jobq::telemetry::{TelemetryConfig, init_telemetry};
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "jobq", about = "In-memory job broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker (HTTP ingestion + WebSocket consumers)
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind (overrides JOBQ_BIND)
        #[arg(long)]
        bind: Option<IpAddr>,
        /// TOML file declaring queues at startup (overrides JOBQ_QUEUES)
        #[arg(long)]
        queues: Option<PathBuf>,
    },
    /// Submit a job (or a JSON array of jobs) to a queue
    Submit {
        queue: String,
        /// Job payload as JSON
        job: String,
        /// Broker base URL
        #[arg(long, default_value = "http://localhost:3000")]
        url: String,
    },
    /// Configure a queue
    Configure {
        queue: String,
        /// Per-subscriber delivery credit
        #[arg(long)]
        capacity: Option<u32>,
        /// Payload field making up the dedup key (repeatable, in order)
        #[arg(long = "dedup-key-field")]
        dedup_key_fields: Vec<String>,
        /// Create the queue in fanout mode
        #[arg(long)]
        fanout: bool,
        #[arg(long, default_value = "http://localhost:3000")]
        url: String,
    },
    /// Show a queue's state
    Stats {
        queue: String,
        #[arg(long, default_value = "http://localhost:3000")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, bind, queues } => cmd_serve(port, bind, queues).await,
        Command::Submit { queue, job, url } => cmd_submit(&url, queue, &job).await,
        Command::Configure {
            queue,
            capacity,
            dedup_key_fields,
            fanout,
            url,
        } => cmd_configure(&url, queue, capacity, dedup_key_fields, fanout).await,
        Command::Stats { queue, url } => cmd_stats(&url, &queue).await,
    }
}

async fn cmd_serve(
    port: Option<u16>,
    bind: Option<IpAddr>,
    queues: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if queues.is_some() {
        config.queues_file = queues;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let registry = Arc::new(Registry::with_default_capacity(config.default_capacity));
    if let Some(ref path) = config.queues_file {
        let presets = presets::load_from_file(path)?;
        tracing::info!(count = presets.len(), path = %path.display(), "applying queue presets");
        registry.apply_presets(&presets);
    }

    let listener = jobq::server::bind(config.listen_addr()).await?;
    jobq::server::serve(listener, registry, async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
    })
    .await?;
    Ok(())
}

async fn cmd_submit(url: &str, queue: String, job: &str) -> anyhow::Result<()> {
    let job: Value = serde_json::from_str(job).context("job must be valid JSON")?;
    post(url, "enqueue", json!({ "queue": queue, "job": job })).await
}

async fn cmd_configure(
    url: &str,
    queue: String,
    capacity: Option<u32>,
    dedup_key_fields: Vec<String>,
    fanout: bool,
) -> anyhow::Result<()> {
    let mut body = json!({ "queue": queue, "fanout": fanout });
    if let Some(capacity) = capacity {
        body["capacity"] = json!(capacity);
    }
    if !dedup_key_fields.is_empty() {
        body["dedupKeyFields"] = json!(dedup_key_fields);
    }
    post(url, "config", body).await
}

async fn cmd_stats(url: &str, queue: &str) -> anyhow::Result<()> {
    let resp = reqwest::get(format!("{}/queues/{queue}", url.trim_end_matches('/'))).await?;
    if !resp.status().is_success() {
        anyhow::bail!("{}: {}", resp.status(), resp.text().await?);
    }
    let stats: Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn post(url: &str, path: &str, body: Value) -> anyhow::Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("{}/{path}", url.trim_end_matches('/')))
        .json(&body)
        .send()
        .await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        anyhow::bail!("{status}: {text}");
    }
    println!("{text}");
    Ok(())
}
