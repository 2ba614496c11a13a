use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use livequery_core::{
    field, ChangeType, FieldValue, Initiator, Model, ObserveQueryOptions, QueryPredicate, QuerySnapshot, QuerySortBy,
    SyncType,
};
use livequery_persist::{now_ms, SqliteStore};
use livequery_store::{channel_sink, MetadataSyncStatus, ObserveEvent, ObserveQueryConfig, ObserveQueryExecutor};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

mod models;

use models::{BlogOwner, ModelKind, Post};

#[derive(Parser, Debug)]
#[command(name = "lqctl", version, about = "livequery CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path (default: $LQ_DB_PATH or ~/.livequery/livequery.db)
    #[arg(long = "db", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save a row given as a JSON object with an "id" field
    Put {
        model: String,
        json: String,
        /// Record the write as coming from the sync engine
        #[arg(long = "from-sync", action = ArgAction::SetTrue)]
        from_sync: bool,
    },
    /// Delete a row by id
    Delete {
        model: String,
        id: String,
        #[arg(long = "from-sync", action = ArgAction::SetTrue)]
        from_sync: bool,
    },
    /// Query rows of a model
    Ls {
        model: String,
        /// Filter, e.g. "rating>=3", "name^=Al", "tags~=rust", "wea=null"
        #[arg(long = "where")]
        filters: Vec<String>,
        /// Sort key, e.g. "name" or "rating:desc"; repeat for tie-breakers
        #[arg(long = "sort")]
        sort: Vec<String>,
    },
    /// Record a completed sync for a model
    MarkSynced {
        model: String,
        #[arg(long = "delta", action = ArgAction::SetTrue)]
        delta: bool,
    },
    /// Show whether a model counts as synced
    SyncStatus { model: String },
    /// Observe a live query, applying JSON-line mutations read from stdin
    Observe {
        #[arg(value_enum)]
        model: ModelKind,
        #[arg(long = "where")]
        filters: Vec<String>,
        #[arg(long = "sort")]
        sort: Vec<String>,
        #[arg(long = "max-records")]
        max_records: Option<usize>,
        #[arg(long = "max-time-ms")]
        max_time_ms: Option<u64>,
        /// End the observation once stdin is exhausted
        #[arg(long = "exit-on-eof", action = ArgAction::SetTrue)]
        exit_on_eof: bool,
    },
}

/// One line of `observe` input.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Mutation {
    Put {
        model: String,
        item: serde_json::Value,
        #[serde(default)]
        sync: bool,
    },
    Delete {
        model: String,
        id: String,
        #[serde(default)]
        sync: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("LQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LQ_METRICS_ADDR; expected host:port");
        }
    }
}

const FILTER_OPS: [&str; 8] = ["!=", ">=", "<=", "^=", "~=", "=", ">", "<"];

/// Parse `field<op>value`; values are read as JSON when they parse, else as text.
fn parse_filter(raw: &str) -> Result<QueryPredicate> {
    let (name, op, value) = FILTER_OPS
        .iter()
        .find_map(|op| raw.split_once(op).map(|(f, v)| (f.trim(), *op, v.trim())))
        .ok_or_else(|| anyhow!("filter {:?} has no operator", raw))?;
    if name.is_empty() {
        bail!("filter {:?} has no field", raw);
    }
    let f = field(name);
    let parsed = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(v) => FieldValue::from_json(&v),
        Err(_) => FieldValue::Text(value.to_string()),
    };
    Ok(match op {
        "!=" => f.ne(parsed),
        ">=" => f.ge(parsed),
        "<=" => f.le(parsed),
        ">" => f.gt(parsed),
        "<" => f.lt(parsed),
        "^=" => f.begins_with(value),
        "~=" => f.contains(value),
        _ => f.eq(parsed),
    })
}

fn parse_sort(raw: &str) -> Result<QuerySortBy> {
    match raw.split_once(':') {
        None => Ok(QuerySortBy::ascending(raw)),
        Some((name, "asc")) => Ok(QuerySortBy::ascending(name)),
        Some((name, "desc")) => Ok(QuerySortBy::descending(name)),
        Some((_, dir)) => bail!("unknown sort direction {:?} (expected asc or desc)", dir),
    }
}

fn build_options(filters: &[String], sort: &[String]) -> Result<ObserveQueryOptions> {
    let mut options = ObserveQueryOptions::new();
    for f in filters {
        options.predicate = std::mem::take(&mut options.predicate).and(parse_filter(f)?);
    }
    for s in sort {
        options = options.sorted_by(parse_sort(s)?);
    }
    Ok(options)
}

fn item_id(item: &serde_json::Value) -> Result<String> {
    match item.get("id") {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => bail!("item has no string \"id\" field"),
    }
}

fn apply_mutation(store: &SqliteStore, m: Mutation) -> Result<()> {
    let initiator = |sync: bool| if sync { Initiator::SyncEngine } else { Initiator::DataStoreApi };
    match m {
        Mutation::Put { model, item, sync } => {
            let id = item_id(&item)?;
            store.save_raw(&model, &id, item, initiator(sync))?;
        }
        Mutation::Delete { model, id, sync } => {
            if !store.delete_raw(&model, &id, initiator(sync))? {
                warn!(model = %model, id = %id, "delete of unknown row ignored");
            }
        }
    }
    counter!("lqctl_mutations_total", 1u64);
    Ok(())
}

/// Read mutations until EOF. Bad lines are reported and skipped.
fn feed_mutations(store: &SqliteStore, input: impl BufRead) {
    for (n, line) in input.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let applied = serde_json::from_str::<Mutation>(&line)
            .context("parsing mutation")
            .and_then(|m| apply_mutation(store, m));
        if let Err(e) = applied {
            warn!(line = n + 1, error = %format!("{:#}", e), "skipping mutation");
        }
    }
}

#[derive(Serialize)]
struct SnapshotOut<'a, T> {
    items: &'a [T],
    changes: Vec<ChangeOut<'a>>,
    synced: bool,
}

#[derive(Serialize)]
struct ChangeOut<'a> {
    #[serde(rename = "type")]
    change_type: ChangeType,
    initiator: Initiator,
    id: &'a str,
}

fn print_snapshot<T: Model>(snap: &QuerySnapshot<T>, keys: &[String], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("-- {} items, {} changes, synced={}", snap.items.len(), snap.item_changes.len(), snap.is_synced);
            for (c, id) in snap.item_changes.iter().zip(keys) {
                let mark = match c.change_type {
                    ChangeType::Create => '+',
                    ChangeType::Update => '~',
                    ChangeType::Delete => '-',
                };
                println!("{} {}", mark, id);
            }
            for item in &snap.items {
                println!("   {:<20} {}", item.primary_key(), serde_json::to_string(item)?);
            }
        }
        Output::Json => {
            let changes = snap
                .item_changes
                .iter()
                .zip(keys)
                .map(|(c, id)| ChangeOut { change_type: c.change_type, initiator: c.initiator, id })
                .collect();
            println!("{}", serde_json::to_string(&SnapshotOut { items: &snap.items, changes, synced: snap.is_synced })?);
        }
    }
    Ok(())
}

async fn observe<T: Model>(
    store: Arc<SqliteStore>,
    options: ObserveQueryOptions,
    config: ObserveQueryConfig,
    output: Output,
    exit_on_eof: bool,
) -> Result<()> {
    let subject = store.changes();
    let sync = Arc::new(MetadataSyncStatus::from_env(store.clone()));
    let exec =
        ObserveQueryExecutor::new(Arc::new(subject.clone()), store.clone(), sync, tokio::runtime::Handle::current(), config);
    let (sink, mut rx) = channel_sink::<T>();
    let handle = exec.observe_query(options, sink);

    // a plain thread: a blocked stdin read must not hold up runtime shutdown
    std::thread::spawn(move || {
        feed_mutations(&store, std::io::stdin().lock());
        if exit_on_eof {
            subject.complete();
        }
    });

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ObserveEvent::Started(_)) => info!(model = T::MODEL_NAME, "observation started"),
                Some(ObserveEvent::Snapshot(snap)) => {
                    let keys: Vec<String> = snap.item_changes.iter().map(|c| c.item.primary_key()).collect();
                    print_snapshot(&snap, &keys, output)?;
                }
                Some(ObserveEvent::Error(e)) => return Err(e).context("observation failed"),
                Some(ObserveEvent::Complete) | None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; cancelling observation");
                handle.cancel();
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = Arc::new(match &cli.db {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    });

    match cli.command {
        Commands::Put { model, json, from_sync } => {
            let item: serde_json::Value = serde_json::from_str(&json).context("parsing item JSON")?;
            let id = item_id(&item)?;
            let initiator = if from_sync { Initiator::SyncEngine } else { Initiator::DataStoreApi };
            let kind = store.save_raw(&model, &id, item, initiator)?;
            info!(model = %model, id = %id, ?kind, "put");
            match cli.output {
                Output::Human => println!("{:?} {}/{}", kind, model, id),
                Output::Json => println!("{}", serde_json::json!({ "model": model, "id": id, "type": kind })),
            }
        }
        Commands::Delete { model, id, from_sync } => {
            let initiator = if from_sync { Initiator::SyncEngine } else { Initiator::DataStoreApi };
            let deleted = store.delete_raw(&model, &id, initiator)?;
            match cli.output {
                Output::Human if deleted => println!("Delete {}/{}", model, id),
                Output::Human => eprintln!("{}/{} not found", model, id),
                Output::Json => println!("{}", serde_json::json!({ "model": model, "id": id, "deleted": deleted })),
            }
        }
        Commands::Ls { model, filters, sort } => {
            let options = build_options(&filters, &sort)?;
            let rows = store.query_raw(&model, &options)?;
            match cli.output {
                Output::Human => {
                    println!("ID                   DATA");
                    for row in &rows {
                        println!("{:<20} {}", item_id(row).unwrap_or_else(|_| "-".to_string()), row);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::MarkSynced { model, delta } => {
            let sync_type = if delta { SyncType::Delta } else { SyncType::Base };
            let at = now_ms();
            store.record_sync(&model, sync_type, at)?;
            info!(model = %model, ?sync_type, at, "sync recorded");
        }
        Commands::SyncStatus { model } => {
            let status = MetadataSyncStatus::from_env(store.clone());
            let synced = status.check(&model)?;
            let meta = store.sync_metadata(&model)?;
            match cli.output {
                Output::Human => {
                    println!("{}: {}", model, if synced { "synced" } else { "not synced" });
                    for m in &meta {
                        println!("  last {:?} sync at {}", m.sync_type, m.last_sync_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into()));
                    }
                }
                Output::Json => println!("{}", serde_json::json!({ "model": model, "synced": synced, "metadata": meta })),
            }
        }
        Commands::Observe { model, filters, sort, max_records, max_time_ms, exit_on_eof } => {
            let options = build_options(&filters, &sort)?;
            let mut config = ObserveQueryConfig::from_env();
            if let Some(n) = max_records {
                config = config.with_max_records(n);
            }
            if let Some(ms) = max_time_ms {
                config = config.with_max_time(std::time::Duration::from_millis(ms));
            }
            info!(model = model.model_name(), ?config, "observe invoked");
            match model {
                ModelKind::BlogOwner => observe::<BlogOwner>(store, options, config, cli.output, exit_on_eof).await?,
                ModelKind::Post => observe::<Post>(store, options, config, cli.output, exit_on_eof).await?,
            }
        }
    }

    Ok(())
}
