use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use broker::{Broker, BrokerConfig, GridStore, HttpWorker, PgmStore, TurnExecutor};
use clap::{Parser, ValueEnum};
use controller::BrokerClient;
use futures::future::join_all;
use shared::protocol::{BrokerEvent, ControlKind, StartRequest};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{listen_addr, load_settings, parse_worker_list, require_workers, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Controller,
    Broker,
    Worker,
}

#[derive(Parser, Debug)]
#[command(name = "gol", about = "Distributed Game of Life")]
struct Args {
    #[arg(long, value_enum)]
    role: Role,
    /// Config file; `gol.toml` is read when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    /// Overrides only the port of the listen address.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    broker: Option<String>,
    /// Comma separated worker addresses.
    #[arg(long)]
    workers: Option<String>,
    #[arg(long)]
    image: Option<String>,
    #[arg(long)]
    turns: Option<u64>,
    #[arg(long)]
    threads: Option<usize>,
    /// Send one control command to a running broker instead of starting a run.
    #[arg(long)]
    command: Option<ControlKind>,
    #[arg(long)]
    task_timeout_ms: Option<u64>,
    #[arg(long)]
    images_dir: Option<PathBuf>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.listen {
            settings.listen = v.clone();
        }
        if let Some(v) = &self.broker {
            settings.broker_url = v.clone();
        }
        if let Some(v) = &self.workers {
            settings.worker_urls = parse_worker_list(v);
        }
        if let Some(v) = &self.image {
            settings.image_name = v.clone();
        }
        if let Some(v) = self.turns {
            settings.turns = v;
        }
        if let Some(v) = self.threads {
            settings.threads = v;
        }
        if let Some(v) = self.task_timeout_ms {
            settings.task_timeout_ms = v;
        }
        if let Some(v) = &self.images_dir {
            settings.images_dir = v.clone();
        }
        if let Some(v) = &self.out_dir {
            settings.out_dir = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    args.apply(&mut settings);

    match args.role {
        Role::Worker => run_worker(&settings, args.port).await,
        Role::Broker => run_broker(&settings, args.port).await,
        Role::Controller => run_controller(&settings, args.command).await,
    }
}

async fn run_worker(settings: &Settings, port: Option<u16>) -> Result<()> {
    let addr = listen_addr(settings, port)?;
    let app = worker::build_router(settings.max_body_bytes);
    info!(%addr, "worker listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_broker(settings: &Settings, port: Option<u16>) -> Result<()> {
    let addr = listen_addr(settings, port)?;
    let urls = require_workers(settings)?;

    let workers: Vec<Arc<HttpWorker>> = urls
        .iter()
        .map(|url| Arc::new(HttpWorker::new(url.as_str())))
        .collect();
    let pings = join_all(workers.iter().map(|w| w.ping())).await;
    let mut reachable = 0;
    for (url, ping) in urls.iter().zip(pings) {
        match ping {
            Ok(()) => reachable += 1,
            Err(e) => warn!(worker = %url, error = %e, "broker: worker unreachable at startup"),
        }
    }
    if reachable == 0 {
        bail!("none of the {} configured workers answered", urls.len());
    }
    info!(reachable, configured = urls.len(), "broker: workers connected");

    let store = PgmStore::new(&settings.images_dir, &settings.out_dir);
    let config = BrokerConfig {
        task_timeout: Duration::from_millis(settings.task_timeout_ms),
        status_interval: Duration::from_millis(settings.status_interval_ms),
        ..BrokerConfig::default()
    };
    let broker = Broker::new(
        workers
            .into_iter()
            .map(|w| w as Arc<dyn TurnExecutor>)
            .collect(),
        Arc::new(store) as Arc<dyn GridStore>,
        config,
    );
    let app = broker::build_router(Arc::new(broker), broker::DEFAULT_MAX_BODY_BYTES);

    info!(%addr, "broker listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_controller(settings: &Settings, command: Option<ControlKind>) -> Result<()> {
    let client = BrokerClient::new(&settings.broker_url)?;

    if let Some(kind) = command {
        let ack = client
            .control(kind)
            .await
            .with_context(|| format!("{kind:?} was not applied"))?;
        println!("{:?} applied after turn {} (state {:?})", ack.kind, ack.turn, ack.state);
        if let Some(name) = ack.saved_as {
            println!("Saved grid as {name}");
        }
        return Ok(());
    }

    let printer = match client.subscribe_events().await {
        Ok(mut events) => Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                log_event(&event);
            }
        })),
        Err(e) => {
            warn!(error = %e, "controller: running without broker events");
            None
        }
    };

    let req = StartRequest {
        image_name: settings.image_name.clone(),
        turns: settings.turns,
        threads: settings.threads,
    };
    info!(image = %req.image_name, turns = req.turns, threads = req.threads, "controller: starting run");
    let response = client.start_game(&req).await?;
    if let Some(printer) = printer {
        printer.abort();
    }

    if !response.success {
        let message = response
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown error".into());
        bail!(
            "run failed after turn {}: {message}",
            response.turns_completed
        );
    }

    let alive = response.summary.map(|s| s.alive_count).unwrap_or_default();
    println!(
        "Completed {} turns{} with {alive} alive cells",
        response.turns_completed,
        if response.quit_early { " (quit early)" } else { "" }
    );
    if let Some(name) = response.saved_as {
        println!("Final grid saved as {name}");
    }
    Ok(())
}

fn log_event(event: &BrokerEvent) {
    match event {
        BrokerEvent::RunStarted {
            run_id,
            width,
            height,
            turns,
            bands,
            ..
        } => info!(%run_id, width, height, turns, bands, "run started"),
        BrokerEvent::TurnComplete { .. } => {}
        BrokerEvent::AliveCellsCount { turn, count } => info!(turn, count, "alive cells"),
        BrokerEvent::StateChange { turn, state } => info!(turn, ?state, "state changed"),
        BrokerEvent::GridSaved { turn, name } => info!(turn, %name, "grid saved"),
        BrokerEvent::WorkerLost {
            worker,
            turn,
            reason,
        } => warn!(%worker, turn, %reason, "worker lost"),
        BrokerEvent::FinalTurnComplete {
            turn, alive_count, ..
        } => info!(turn, alive_count, "final turn complete"),
        BrokerEvent::RunFailed {
            last_committed_turn,
            message,
        } => error!(last_committed_turn, %message, "run failed"),
    }
}
