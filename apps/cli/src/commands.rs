//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use schemaflow_core::{
    ExtensionRegistry, HandlerCatalog, Pipeline, PipelineStatus, ProgressReporter, RunSummary,
    StablePolicy, SyncConductor, builtin_descriptors, raw_from_rfc822,
};
use schemaflow_shared::{
    AppConfig, FeedOptions, PipelineConfig, PipelineError, init_config, load_config,
    load_config_from,
};
use schemaflow_storage::LibsqlStore;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// schemaflow: run extensions over a revisioned document store.
#[derive(Parser)]
#[command(
    name = "schemaflow",
    version,
    about = "Derive schemas from raw documents with a checkpointed extension pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.schemaflow/schemaflow.toml.
    #[arg(long, global = true, env = "SCHEMAFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configured store path.
    #[arg(long, global = true, env = "SCHEMAFLOW_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ingest RFC 822 message files as raw documents.
    Ingest {
        /// Message files to read.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// rd_key kind for the raw documents.
        #[arg(long, default_value = "msg")]
        category: String,
    },

    /// Run the extension queues.
    Run {
        /// Stop once every queue has caught up instead of waiting for input.
        #[arg(long)]
        until_stable: bool,

        /// Stop the whole run on the first extension failure.
        #[arg(long)]
        stop_on_error: bool,

        /// Only run these extensions (repeatable).
        #[arg(long = "ext")]
        only: Vec<String>,
    },

    /// Show each queue's position and lag.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List the loaded extensions.
    Extensions,

    /// Retry error records and failed outgoing deliveries.
    RetryErrors,

    /// Force every existing source through every extension.
    Reprocess,

    /// Remove everything the extensions wrote and reset their checkpoints.
    Unprocess {
        /// Required; this cannot be undone.
        #[arg(long)]
        yes: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "schemaflow=info",
        1 => "schemaflow=debug",
        _ => "schemaflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = Context {
        config_path: cli.config,
        db: cli.db,
    };
    match cli.command {
        Command::Ingest { files, category } => cmd_ingest(&ctx, &files, &category).await,
        Command::Run {
            until_stable,
            stop_on_error,
            only,
        } => cmd_run(&ctx, until_stable, stop_on_error, only).await,
        Command::Status { json } => cmd_status(&ctx, json).await,
        Command::Extensions => cmd_extensions(&ctx).await,
        Command::RetryErrors => cmd_retry_errors(&ctx).await,
        Command::Reprocess => cmd_reprocess(&ctx).await,
        Command::Unprocess { yes } => cmd_unprocess(&ctx, yes).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&ctx).await,
        },
    }
}

/// Global flags every command resolves against.
struct Context {
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
}

impl Context {
    fn config(&self) -> Result<AppConfig> {
        let config = match &self.config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        Ok(config)
    }

    async fn store(&self, config: &AppConfig) -> Result<Arc<LibsqlStore>> {
        let path = match &self.db {
            Some(path) => path.clone(),
            None => config.store.resolved_path()?,
        };
        Ok(Arc::new(LibsqlStore::open(&path).await?))
    }

    /// Build a pipeline from config, with the built-in extensions when the
    /// config lists none.
    async fn pipeline(
        &self,
        pipeline_config: impl FnOnce(&mut PipelineConfig),
    ) -> Result<Pipeline> {
        let config = self.config()?;
        let store = self.store(&config).await?;

        let descriptors = if config.extensions.is_empty() {
            builtin_descriptors()
        } else {
            config.extensions.clone()
        };
        let (registry, report) = ExtensionRegistry::load(&descriptors, &HandlerCatalog::builtin());
        for rejected in &report.rejected {
            warn!(ext_id = %rejected.id, reason = %rejected.reason, "extension not loaded");
        }
        if registry.is_empty() {
            return Err(eyre!(
                "no extensions loaded; check the [[extensions]] entries in the config"
            ));
        }

        let mut runtime = PipelineConfig::from(&config);
        pipeline_config(&mut runtime);
        Ok(Pipeline::new(store, registry, runtime, FeedOptions::from(&config)))
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ingest(ctx: &Context, files: &[PathBuf], category: &str) -> Result<()> {
    let config = ctx.config()?;
    let store = ctx.store(&config).await?;
    let model = Arc::new(schemaflow_core::DocModel::new(
        store,
        PipelineConfig::from(&config).view_refresh_every,
    ));

    let mut raws = Vec::with_capacity(files.len());
    for path in files {
        let bytes = read_file(path)?;
        let mut raw = raw_from_rfc822(&bytes).map_err(|e| eyre!("{}: {e}", path.display()))?;
        raw.category = category.to_string();
        raws.push(raw);
    }

    info!(files = files.len(), category, "ingesting messages");
    let refs = SyncConductor::new(model).ingest(raws).await?;
    println!("Ingested {} document(s).", refs.len());
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| eyre!("cannot read '{}': {e}", path.display()))
}

async fn cmd_run(
    ctx: &Context,
    until_stable: bool,
    stop_on_error: bool,
    only: Vec<String>,
) -> Result<()> {
    let pipeline = ctx
        .pipeline(|c| {
            c.stop_on_error |= stop_on_error;
            c.only = only;
        })
        .await?;

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    info!(until_stable, queues = pipeline.processors().len(), "running pipeline");
    let reporter = CliProgress::new();
    let policy = if until_stable {
        StablePolicy::Stop
    } else {
        StablePolicy::Continue
    };
    let summary = pipeline.run(|_| policy, &reporter).await?;

    println!();
    println!("  Items written: {}", summary.created);
    println!("  Stable:        {}", if summary.stable { "yes" } else { "no" });
    for (queue, error) in &summary.failures {
        println!("  Failed:        {queue}: {error}");
    }
    println!();
    Ok(())
}

async fn cmd_status(ctx: &Context, json: bool) -> Result<()> {
    let pipeline = ctx.pipeline(|_| {}).await?;
    let status = pipeline.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Global sequence: {}", status.global_seq);
    println!("{:<44} {:<8} {:>8} {:>8}", "QUEUE", "STATUS", "SEQ", "LAG");
    for q in &status.queues {
        println!("{:<44} {:<8} {:>8} {:>8}", q.name, q.status.to_string(), q.seq, q.lag);
    }
    Ok(())
}

async fn cmd_extensions(ctx: &Context) -> Result<()> {
    let pipeline = ctx.pipeline(|_| {}).await?;
    for (id, category, sources) in pipeline.describe() {
        println!("{id:<44} {:<9} {}", category.to_string(), sources.join(", "));
    }
    Ok(())
}

async fn cmd_retry_errors(ctx: &Context) -> Result<()> {
    let pipeline = ctx.pipeline(|_| {}).await?;
    let report = pipeline.retry_errors().await?;
    println!(
        "Retried {}, cleared {}, still failing {}.",
        report.retried, report.cleared, report.remaining
    );
    Ok(())
}

async fn cmd_reprocess(ctx: &Context) -> Result<()> {
    let pipeline = ctx.pipeline(|_| {}).await?;
    let created = pipeline.reprocess().await?;
    println!("Reprocessed; {created} item(s) written.");
    Ok(())
}

async fn cmd_unprocess(ctx: &Context, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!("unprocess removes every derived item; pass --yes to confirm"));
    }
    let pipeline = ctx.pipeline(|_| {}).await?;
    let report = pipeline.unprocess().await?;
    println!(
        "Removed {} item(s) and {} checkpoint(s).",
        report.removed, report.checkpoints
    );
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(ctx: &Context) -> Result<()> {
    let mut config = ctx.config()?;
    if config.extensions.is_empty() {
        config.extensions = builtin_descriptors();
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        spinner.set_message("starting queues");
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn status(&self, status: &PipelineStatus) {
        let message = if status.is_stable() {
            format!("stable at seq {}", status.global_seq)
        } else {
            match status.slowest() {
                Some(q) => format!(
                    "seq {} | slowest {} (lag {})",
                    status.global_seq, q.name, q.lag
                ),
                None => format!("seq {}", status.global_seq),
            }
        };
        self.spinner.set_message(message);
    }

    fn queue_failed(&self, queue: &str, error: &PipelineError) {
        self.spinner.println(format!("  queue {queue} failed: {error}"));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
