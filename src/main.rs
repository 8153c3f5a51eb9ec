// histmirror - history-table sync into an embedded analytics store
//
// The binary is a thin shell over the library: parse arguments, assemble
// the Config, pick a source reader, and drive the worker/scheduler verbs.
// Run events stream to stdout as JSON lines (the same wire format the
// event channel carries) so dashboards and shell pipelines see one format.

use anyhow::{bail, Context, Result};
use clap::Parser;
use histmirror::cli::{Cli, Commands};
use histmirror::config::VERSION;
use histmirror::source::memory::MemorySource;
use histmirror::source::{SourceColumn, SourceReader, Value};
use histmirror::{Config, JobOptions, RunKind, RunSpec, Scheduler, SyncWorker, TableBinding};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { show, reset, path } = &cli.command {
        return handle_config(cli.config.as_deref(), *show, *reset, *path);
    }

    histmirror::logging::init();
    let config = Config::load(cli.config.as_deref())?;
    print_startup(&config, cli.demo);

    if cli.demo {
        let reader = Arc::new(demo_source());
        return run(reader, config, cli).await;
    }

    #[cfg(feature = "odbc")]
    {
        let reader = Arc::new(histmirror::source::odbc::OdbcSourceReader::new(
            config.source.connection_string(),
        ));
        run(reader, config, cli).await
    }
    #[cfg(not(feature = "odbc"))]
    {
        bail!(
            "this build has no source connector; rebuild with --features odbc \
             or pass --demo to use the in-memory demo source"
        )
    }
}

async fn run<R: SourceReader + 'static>(reader: Arc<R>, config: Config, cli: Cli) -> Result<()> {
    let worker = Arc::new(SyncWorker::new(reader, config.worker_settings())?);

    match cli.command {
        Commands::Sync { table, full } => {
            let binding = binding_for(&config, &table, cli.demo)?;
            let kind = if full {
                RunKind::Full
            } else {
                RunKind::Incremental
            };
            run_and_stream(
                &worker,
                RunSpec {
                    kind,
                    binding,
                    max_rows: None,
                },
            )
            .await
        }
        Commands::Test { table, rows } => {
            let binding = binding_for(&config, &table, cli.demo)?;
            run_and_stream(
                &worker,
                RunSpec {
                    kind: RunKind::Test,
                    binding,
                    max_rows: Some(rows),
                },
            )
            .await
        }
        Commands::Daemon => daemon(worker, &config).await,
        Commands::Status { table } => {
            let state = worker.table_status(&table)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::Config { .. } => unreachable!("handled before config load"),
    }
}

/// Start one run and stream its events to stdout until the terminal event.
async fn run_and_stream<R: SourceReader + 'static>(
    worker: &Arc<SyncWorker<R>>,
    spec: RunSpec,
) -> Result<()> {
    let mut events = worker
        .events()
        .context("event stream already taken")?;
    worker.start(spec)?;

    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        if let histmirror::SyncEvent::Failed { message, .. } = &event {
            bail!("sync failed: {message}");
        }
        if event.is_terminal() {
            break;
        }
    }
    Ok(())
}

/// Register configured schedules and run until interrupted.
async fn daemon<R: SourceReader + 'static>(
    worker: Arc<SyncWorker<R>>,
    config: &Config,
) -> Result<()> {
    if config.schedules.is_empty() {
        bail!("no [[schedules]] configured");
    }

    let scheduler = Arc::new(Scheduler::new(worker.clone()));
    for schedule in &config.schedules {
        let bindings: Vec<TableBinding> = schedule
            .tables
            .iter()
            .filter_map(|t| config.binding(t).cloned())
            .collect();
        scheduler.register_recurring(
            &schedule.name,
            &schedule.cron,
            bindings,
            JobOptions::default(),
        )?;
        tracing::info!("registered schedule {} ({})", schedule.name, schedule.cron);
    }
    scheduler.start();

    // Stream events until ctrl-c.
    let mut events = worker.events().context("event stream already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("{json}");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down scheduler");
    scheduler.stop(Duration::from_secs(10)).await;
    worker.stop("process shutdown");
    printer.abort();
    Ok(())
}

fn binding_for(config: &Config, table: &str, demo: bool) -> Result<TableBinding> {
    if let Some(binding) = config.binding(table) {
        return Ok(binding.clone());
    }
    if demo && table == "events" {
        return Ok(demo_binding());
    }
    bail!("table {table:?} is not configured under [[tables]]")
}

fn print_startup(config: &Config, demo: bool) {
    tracing::info!("histmirror v{VERSION}");
    tracing::info!(
        "analytics store: {} (database {})",
        config.analytics.path.display(),
        config.analytics.database
    );
    tracing::info!("state dir: {}", config.state_dir.display());
    if demo {
        tracing::info!("demo mode: in-memory source with sample data");
    } else {
        tracing::info!(
            "source: {}:{}/{}",
            config.source.host,
            config.source.port,
            config.source.service
        );
    }
}

fn handle_config(file: Option<&std::path::Path>, show: bool, reset: bool, path: bool) -> Result<()> {
    let config_path = file
        .map(std::path::PathBuf::from)
        .or_else(Config::config_path)
        .context("could not determine config path")?;

    if path {
        println!("{}", config_path.display());
        return Ok(());
    }
    if reset {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, Config::default().to_toml())?;
        println!("config written to {}", config_path.display());
        return Ok(());
    }
    if show {
        let config = Config::load(file)?;
        print!("{}", config.to_toml());
        if config_path.exists() {
            println!("\n# Source: {}", config_path.display());
        } else {
            println!("\n# Source: defaults (no config file)");
        }
        return Ok(());
    }
    println!("Usage: histmirror config [--show|--reset|--path]");
    Ok(())
}

/// Built-in sample source so the pipeline can be exercised end to end
/// without a reachable source database.
fn demo_source() -> MemorySource {
    let source = MemorySource::new();
    source.add_table(
        "EVENTS",
        vec![
            SourceColumn {
                name: "ID".into(),
                source_type: "NUMBER(10,0)".into(),
                nullable: false,
            },
            SourceColumn {
                name: "TS".into(),
                source_type: "TIMESTAMP".into(),
                nullable: false,
            },
            SourceColumn {
                name: "V".into(),
                source_type: "NUMBER(18,4)".into(),
                nullable: true,
            },
            SourceColumn {
                name: "NOTE".into(),
                source_type: "VARCHAR2(200)".into(),
                nullable: true,
            },
        ],
        (1..=2_500i64)
            .map(|i| {
                vec![
                    Value::Integer(i),
                    Value::Text(format!(
                        "2024-01-01T{:02}:{:02}:{:02}Z",
                        (i / 3600) % 24,
                        (i / 60) % 60,
                        i % 60
                    )),
                    Value::Text(format!("{}.{:04}", i * 3, i % 10_000)),
                    Value::Text(format!("demo row {i}")),
                ]
            })
            .collect(),
    );
    source
}

fn demo_binding() -> TableBinding {
    TableBinding {
        source_schema: None,
        source_table: "EVENTS".into(),
        target_table: "events".into(),
        primary_key: vec!["ID".into()],
        temporal_key: vec!["TS".into()],
        batch_size: 500,
    }
}
