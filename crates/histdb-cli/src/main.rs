use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use histdb_core::{order_conditions, DefinitionSnapshot, DEFAULT_SAVE_SET};
use histdb_store_sqlite::{DefinitionStore, SaveSet};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "histdb.v1";

#[derive(Debug, Parser)]
#[command(name = "histdb")]
#[command(about = "Histogram definition database CLI")]
struct Cli {
    #[arg(long, default_value = "./histdb.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_SAVE_SET)]
    save_set: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create missing tables and list them.
    Schema,
    SaveSets,
    /// Write a snapshot file into the save-set.
    Save(SaveArgs),
    Load,
    /// Print the dependency-safe condition order of a snapshot file.
    Order(OrderArgs),
    Delete,
    Check,
}

#[derive(Debug, Args)]
struct SaveArgs {
    #[arg(long)]
    input: PathBuf,
    /// Add to the existing save-set instead of replacing it.
    #[arg(long, default_value_t = false)]
    append: bool,
}

#[derive(Debug, Args)]
struct OrderArgs {
    #[arg(long)]
    input: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init().ok();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Command::Order(args) => run_order(&args),
        command => {
            let mut store = DefinitionStore::open(&cli.db)
                .with_context(|| format!("failed to open {}", cli.db.display()))?;
            run_store_command(command, &cli.save_set, &mut store)
        }
    }
}

fn run_store_command(command: Command, save_set: &str, store: &mut DefinitionStore) -> Result<()> {
    match command {
        Command::Schema => run_schema(store),
        Command::SaveSets => run_save_sets(store),
        Command::Save(args) => run_save(&args, save_set, store),
        Command::Load => run_load(save_set, store),
        Command::Order(args) => run_order(&args),
        Command::Delete => run_delete(save_set, store),
        Command::Check => run_check(store),
    }
}

fn run_schema(store: &DefinitionStore) -> Result<()> {
    store.ensure_schema()?;
    emit_json(serde_json::json!({ "tables": store.table_names()? }))
}

fn run_save_sets(store: &DefinitionStore) -> Result<()> {
    let save_sets = store
        .list_save_sets()?
        .iter()
        .map(save_set_json)
        .collect::<Result<Vec<_>>>()?;
    emit_json(serde_json::json!({ "save_sets": save_sets }))
}

fn run_save(args: &SaveArgs, save_set: &str, store: &mut DefinitionStore) -> Result<()> {
    let snapshot = read_snapshot_file(&args.input)?;
    let summary = if args.append {
        store.writer(save_set)?.save_snapshot(&snapshot)?
    } else {
        store.replace_save_set(save_set, &snapshot)?
    };
    info!(save_set, input = %args.input.display(), append = args.append, "saved snapshot");

    emit_json(serde_json::json!({
        "save_set": save_set,
        "appended": args.append,
        "written": summary
    }))
}

fn run_load(save_set: &str, store: &DefinitionStore) -> Result<()> {
    let reader = store.reader(save_set)?;
    let snapshot = reader.read_snapshot()?;
    emit_json(serde_json::json!({
        "save_set": save_set_json(reader.save_set())?,
        "snapshot": snapshot
    }))
}

fn run_order(args: &OrderArgs) -> Result<()> {
    let snapshot = read_snapshot_file(&args.input)?;
    let ordered = order_conditions(&snapshot.conditions)
        .with_context(|| format!("failed to order conditions of {}", args.input.display()))?;
    let names = ordered.iter().map(|definition| definition.name.as_str()).collect::<Vec<_>>();
    emit_json(serde_json::json!({ "order": names, "conditions": ordered }))
}

fn run_delete(save_set: &str, store: &mut DefinitionStore) -> Result<()> {
    let deleted = store.delete_save_set(save_set)?;
    emit_json(serde_json::json!({ "save_set": save_set, "deleted": deleted }))
}

fn run_check(store: &DefinitionStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(report)?)
}

fn save_set_json(save_set: &SaveSet) -> Result<Value> {
    let created_at = OffsetDateTime::from_unix_timestamp(save_set.timestamp)
        .with_context(|| format!("invalid timestamp on save set `{}`", save_set.name))?
        .format(&Rfc3339)
        .context("failed to format save set timestamp")?;
    Ok(serde_json::json!({
        "id": save_set.id,
        "name": save_set.name,
        "timestamp": save_set.timestamp,
        "created_at": created_at
    }))
}

fn read_snapshot_file(path: &Path) -> Result<DefinitionSnapshot> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| matches!(extension, "yaml" | "yml"));

    if is_yaml {
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse YAML snapshot {}", path.display()))
    } else {
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse JSON snapshot {}", path.display()))
    }
}
