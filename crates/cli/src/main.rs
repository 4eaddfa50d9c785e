use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sieve_api::{LimitPolicy, MemoryRecords, ParamNode, ReadParams, SchemaConfig, Sieve, SieveError};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sievectl", version, about = "Sanitize request trees against a schema config")]
struct Cli {
    /// Schema config file (YAML, or JSON with a .json extension)
    #[arg(short = 's', long = "schema", env = "SIEVE_SCHEMA", global = true)]
    schema: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Pretty)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Pretty, Compact }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the schema config and list registered types
    Check,
    /// Sanitize a write payload (JSON on stdin or --input) for a type
    Params {
        /// Root entity type, e.g. "property"
        type_name: String,
        #[arg(long = "input")]
        input: Option<PathBuf>,
        /// Existing records as JSON: {"photo": [{"id": 1, ...}], ...}
        #[arg(long = "records")]
        records: Option<PathBuf>,
    },
    /// Sanitize an include tree against the type's include whitelist
    Includes {
        type_name: String,
        /// Raw include value as JSON, e.g. '{"photos": ["account"]}'
        raw: String,
    },
    /// Sanitize an order against the type's order whitelist
    Order {
        type_name: String,
        /// Raw order value as JSON; omit to use the type's default order
        raw: Option<String>,
    },
    /// Plan a read request: {"include": ..., "order": ..., "limit": ...} on stdin or --input
    Read {
        type_name: String,
        #[arg(long = "input")]
        input: Option<PathBuf>,
        /// Largest page size; 0 disables the cap
        #[arg(long = "resource-limit", env = "SIEVE_RESOURCE_LIMIT", default_value_t = 1000)]
        resource_limit: u64,
        #[arg(long = "default-limit", env = "SIEVE_DEFAULT_LIMIT")]
        default_limit: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("SIEVE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn load_sieve(path: Option<&PathBuf>) -> Result<Sieve> {
    let path = path.ok_or_else(|| anyhow!("no schema config given; pass --schema or set SIEVE_SCHEMA"))?;
    let registry = SchemaConfig::load(path)?
        .into_registry()
        .with_context(|| format!("building registry from {}", path.display()))?;
    Ok(Sieve::new(Arc::new(registry)))
}

fn read_json(input: Option<&PathBuf>) -> Result<ParamNode> {
    let raw = match input {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?,
        None => {
            let mut s = String::new();
            std::io::stdin().read_to_string(&mut s).context("reading stdin")?;
            s
        }
    };
    serde_json::from_str(&raw).context("parsing JSON input")
}

fn parse_arg(raw: &str) -> Result<ParamNode> {
    // Bare names are accepted without JSON quoting.
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| ParamNode::String(raw.to_string())))
}

fn load_records(path: Option<&PathBuf>) -> Result<MemoryRecords> {
    let mut store = MemoryRecords::new();
    let Some(path) = path else { return Ok(store) };
    let by_type: serde_json::Map<String, ParamNode> =
        serde_json::from_str(&std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?)
            .context("parsing records file")?;
    for (type_name, rows) in by_type {
        let rows = match rows {
            ParamNode::Array(rows) => rows,
            _ => return Err(anyhow!("records for `{}` must be a list", type_name)),
        };
        for row in rows {
            store = store.with_record(&type_name, row);
        }
    }
    Ok(store)
}

fn print(output: Output, value: &ParamNode) -> Result<()> {
    let s = match output {
        Output::Pretty => serde_json::to_string_pretty(value)?,
        Output::Compact => serde_json::to_string(value)?,
    };
    println!("{}", s);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let sieve = load_sieve(cli.schema.as_ref())?;
    match cli.command {
        Commands::Check => {
            let mut names: Vec<&str> = sieve.registry().type_names().collect();
            names.sort_unstable();
            info!(types = names.len(), "schema config ok");
            print(cli.output, &serde_json::json!(names))?;
        }
        Commands::Params { type_name, input, records } => {
            let raw = read_json(input.as_ref())?;
            let store = load_records(records.as_ref())?;
            let out = sieve.sanitize_params(&raw, &type_name, &store, &store)?;
            print(cli.output, &out.to_value())?;
        }
        Commands::Includes { type_name, raw } => {
            let tree = sieve.includes_for(&type_name, &parse_arg(&raw)?)?;
            print(cli.output, &tree.to_value())?;
        }
        Commands::Order { type_name, raw } => {
            let raw = raw.as_deref().map(parse_arg).transpose()?;
            let order = sieve.orders_for(&type_name, raw.as_ref())?;
            print(cli.output, &order.to_value())?;
        }
        Commands::Read { type_name, input, resource_limit, default_limit } => {
            let params: ReadParams = serde_json::from_value(read_json(input.as_ref())?).context("parsing read params")?;
            let limits = LimitPolicy { resource_limit: (resource_limit > 0).then_some(resource_limit), default_limit };
            let plan = sieve.with_limits(limits).plan_read(&type_name, &params)?;
            let rendered = serde_json::json!({
                "include": plan.includes.to_value(),
                "order": plan.order.to_value(),
                "limit": plan.limit,
                "order_sql": plan.order.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            print(cli.output, &rendered)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(SieveError::UnpermittedParameters(keys)) = e.downcast_ref::<SieveError>() {
                error!(keys = ?keys, "request rejected");
            }
            Err(e)
        }
    }
}
