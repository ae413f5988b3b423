use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use futures::StreamExt;
use querygraph_ai::LlmMappingExtractor;
use querygraph_core::{
    ConfigManager, ConnectionDetails, InMemorySessionStore, LoggingConfig, SessionStore,
    StructuredMapping,
};
use querygraph_engine::DatabricksConnector;
use querygraph_graph::{find_cycle, plan_build_order, resolve_cycles, DependencyGraph};
use querygraph_orchestrator::{Orchestrator, ProgressEvent, RunOutcome};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "querygraph")]
#[command(about = "QueryGraph - Incremental SQL generation from mapping documents", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (pretty, json)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Configuration file (defaults to ./.querygraph.toml, then ~/.querygraph/config.toml)
    #[arg(short, long, global = true, env = "QUERYGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a validated SQL query, streaming progress as it runs
    Generate {
        /// Mapping text to analyze; `-` reads stdin
        #[arg(short, long, conflicts_with = "mapping")]
        input: Option<String>,

        /// Structured mapping JSON; skips extraction
        #[arg(short, long)]
        mapping: Option<PathBuf>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Show the dependency graph, broken cycles and build order of a mapping
    Plan {
        /// Structured mapping JSON; `-` reads stdin
        #[arg(short, long)]
        mapping: String,
    },

    /// Write the default configuration file
    InitConfig {
        /// Target path (defaults to ~/.querygraph/config.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct ConnectionArgs {
    /// Databricks workspace hostname
    #[arg(long, env = "DATABRICKS_SERVER_HOSTNAME")]
    server_hostname: Option<String>,

    /// SQL warehouse HTTP path, e.g. /sql/1.0/warehouses/<id>
    #[arg(long, env = "DATABRICKS_HTTP_PATH")]
    http_path: Option<String>,

    /// Personal access token
    #[arg(long, env = "DATABRICKS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Default catalog for unqualified tables
    #[arg(long)]
    catalog: Option<String>,

    /// Default schema for unqualified tables
    #[arg(long)]
    database: Option<String>,
}

impl From<ConnectionArgs> for ConnectionDetails {
    fn from(args: ConnectionArgs) -> Self {
        ConnectionDetails {
            server_hostname: args.server_hostname,
            http_path: args.http_path,
            access_token: args.access_token,
            catalog: args.catalog,
            database: args.database,
        }
    }
}

#[derive(Serialize)]
struct PlanResult {
    entities: Vec<String>,
    dependencies: Vec<(String, String)>,
    ignored_relationships: Vec<String>,
    cycle: Option<Vec<String>>,
    broken_edges: Vec<String>,
    build_order: Vec<String>,
    unresolved: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path, force } = &cli.command {
        return init_config(path.clone(), *force).map(|_| ());
    }

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from_path(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;
    init_tracing(&manager.config().logging, cli.verbose);
    if let Some(path) = manager.config_path() {
        debug!("Using configuration from {}", path.display());
    }

    let result = match cli.command {
        Commands::Generate {
            input,
            mapping,
            connection,
        } => generate(&manager, cli.output, input, mapping, connection.into()).await,
        Commands::Plan { mapping } => plan(cli.output, &mapping).await,
        Commands::InitConfig { .. } => Ok(true),
    };

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let directive = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only events and results
    let initialized = match logging.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    initialized.ok();
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<bool> {
    let path = match path.or_else(ConfigManager::user_config_path) {
        Some(path) => path,
        None => bail!("Could not determine a home directory; pass --path"),
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    ConfigManager::create_default_config(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} {}", "✅ Wrote default configuration to".green(), path.display());
    Ok(true)
}

async fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("Failed to read {}", source))
}

async fn read_mapping(source: &str) -> Result<StructuredMapping> {
    let text = read_source(source).await?;
    StructuredMapping::from_json(&text).with_context(|| format!("Invalid mapping in {}", source))
}

async fn generate(
    manager: &ConfigManager,
    output: OutputFormat,
    input: Option<String>,
    mapping: Option<PathBuf>,
    details: ConnectionDetails,
) -> Result<bool> {
    let config = manager.config();
    let sessions = Arc::new(InMemorySessionStore::new(config.session.ttl_secs));
    let orchestrator = Orchestrator::new(
        Arc::new(DatabricksConnector::new(config.engine.clone())),
        config.orchestrator.clone(),
    )
    .with_session_store(sessions.clone());

    let handle = match (mapping, input) {
        (Some(path), _) => {
            let mapping = read_mapping(&path.to_string_lossy()).await?;
            orchestrator.stream_mapping(mapping, details)
        }
        (None, Some(source)) => {
            let raw_text = read_source(&source).await?;
            let extractor = LlmMappingExtractor::from_config(&config.llm)
                .context("Failed to set up mapping extraction")?;
            orchestrator
                .with_extractor(Arc::new(extractor))
                .stream(raw_text, details)
        }
        (None, None) => bail!("Either --input or --mapping is required"),
    };

    let (events, outcome) = handle.into_stream();
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
        print_event(output, &event)?;
    }
    let outcome = outcome.await.context("Generation task failed")?;

    let version = sessions
        .prior_versions(outcome.run_id)
        .await
        .ok()
        .and_then(|versions| versions.last().map(|v| v.version));
    print_outcome(output, &outcome, version)?;
    Ok(outcome.is_success())
}

fn print_event(output: OutputFormat, event: &ProgressEvent) -> Result<()> {
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        ProgressEvent::Status(text) => println!("{}", text),
        ProgressEvent::Warning(text) => println!("{}", text.yellow()),
        ProgressEvent::SqlGenerated(sql) => {
            println!("\n{}", "Generated SQL:".green().bold());
            println!("{}\n", sql.bright_white());
        }
        ProgressEvent::Error(text) => println!("{}", text.red().bold()),
        ProgressEvent::Close(text) => println!("{}", text.dimmed()),
    }
    Ok(())
}

fn print_outcome(output: OutputFormat, outcome: &RunOutcome, version: Option<u32>) -> Result<()> {
    if output == OutputFormat::Json {
        let line = serde_json::json!({ "event": "outcome", "data": outcome, "version": version });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    let failed = outcome.fragments.iter().filter(|f| !f.validation.is_passed()).count();
    println!(
        "{} {:?} ({} fragments, {} failed, {} warnings)",
        "Result:".bold(),
        outcome.status,
        outcome.fragments.len(),
        failed,
        outcome.warnings.len()
    );
    if let Some(version) = version {
        println!("{} {} v{}", "Session:".bold(), outcome.run_id, version);
    }
    Ok(())
}

async fn plan(output: OutputFormat, source: &str) -> Result<bool> {
    let mapping = read_mapping(source).await?;
    let mut graph = DependencyGraph::from_mapping(&mapping);
    let cycle = find_cycle(&graph);
    let broken = resolve_cycles(&mut graph);
    let order = plan_build_order(&graph);

    let result = PlanResult {
        entities: mapping.entities.iter().map(|e| e.qualified_name()).collect(),
        dependencies: graph.edges(),
        ignored_relationships: graph
            .skipped_relationships()
            .iter()
            .map(|&i| {
                let rel = &mapping.relationships[i];
                format!("{} -> {}", rel.left, rel.right)
            })
            .collect(),
        cycle,
        broken_edges: broken.iter().map(|edge| edge.describe()).collect(),
        build_order: order.order.clone(),
        unresolved: order.unresolved.clone(),
    };

    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(true);
    }

    println!("{}", "📊 Entities".bold());
    for entity in &result.entities {
        println!("  {}", entity);
    }
    println!("{}", "🔗 Dependencies".bold());
    for (dependent, dependency) in &result.dependencies {
        println!("  {} {} {}", dependent, "depends on".dimmed(), dependency);
    }
    for ignored in &result.ignored_relationships {
        println!("  {} {}", "ignored (unknown entity):".yellow(), ignored);
    }
    match &result.cycle {
        Some(cycle) => {
            println!("{} {}", "⚠️ Cycle:".yellow().bold(), cycle.join(" -> "));
            for edge in &result.broken_edges {
                println!("  {} {}", "dropped".yellow(), edge);
            }
        }
        None => println!("{}", "✅ No cyclic references".green()),
    }
    println!("{}", "📋 Build order".bold());
    for (step, name) in result.build_order.iter().chain(&result.unresolved).enumerate() {
        println!("  {}. {}", step + 1, name);
    }
    Ok(true)
}
