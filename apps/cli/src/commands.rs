//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use leadharvest_core::harness::{
    Harness, HarvestOptions, ProgressReporter, RunOutcome, RunReport, Shard, scope_name,
};
use leadharvest_core::{
    DirectoryDetailSource, EnrichmentCache, ExportFormat, OrganizationSiteSource, export_to_path,
};
use leadharvest_fetcher::{Fetcher, FormDirectory, RetryPolicy};
use leadharvest_shared::{
    AppConfig, Provenance, Record, RecordQuery, RecordStatus, RecordStore, RunCounts, RunType,
    init_config, load_config, load_config_from,
};
use leadharvest_storage::{CheckpointStore, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// leadharvest: resumable lead harvesting with contact enrichment.
#[derive(Parser)]
#[command(
    name = "leadharvest",
    version,
    about = "Harvest, deduplicate and enrich licensee listings from a public directory.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.leadharvest/leadharvest.toml).
    #[arg(long, global = true, env = "LEADHARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Record database (overrides `harvest.database`).
    #[arg(long, global = true, env = "LEADHARVEST_DB")]
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
    /// Sweep the directory and merge listings into the database.
    Harvest {
        /// Re-query last names already stored instead of every prefix.
        #[arg(long)]
        incremental: bool,

        /// Continue from the last checkpoint.
        #[arg(long)]
        resume: bool,

        /// Restrict the sweep to these initial letters.
        #[arg(long, num_args = 1..)]
        letters: Vec<char>,

        /// Process only shard i of n (e.g. 0/4).
        #[arg(long)]
        shard: Option<Shard>,

        /// Skip contact enrichment of new records.
        #[arg(long)]
        no_enrich: bool,

        /// Records processed between checkpoints.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Minimum delay between directory requests, in ms.
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Resolve contact details for stored records lacking an email.
    Enrich {
        /// Also retry records previously left unresolved.
        #[arg(long)]
        retry_unresolved: bool,

        /// Maximum number of records to enrich.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List stored records.
    List {
        #[command(flatten)]
        filters: FilterArgs,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show one record and its change history.
    Show {
        /// External identifier.
        id: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export records to CSV or JSON.
    Export {
        /// Output format: csv or json.
        #[arg(long, default_value = "csv")]
        format: ExportFormat,

        /// Output file.
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Summarize the database.
    Stats,

    /// Inspect or reset run checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Record filters shared by `list` and `export`.
#[derive(Args, Debug, Clone)]
pub(crate) struct FilterArgs {
    /// licensed, suspended or cancelled.
    #[arg(long)]
    status: Option<RecordStatus>,

    #[arg(long)]
    city: Option<String>,

    /// Substring of the organization name.
    #[arg(long)]
    organization: Option<String>,

    /// Minimum email confidence (0-1).
    #[arg(long)]
    min_confidence: Option<f64>,

    #[arg(long)]
    has_email: bool,

    #[arg(long)]
    has_phone: bool,

    #[arg(long)]
    min_quality: Option<u32>,

    /// Include records missing from the last full sweep.
    #[arg(long)]
    include_stale: bool,
}

impl FilterArgs {
    fn to_query(&self) -> RecordQuery {
        RecordQuery {
            status: self.status,
            city: self.city.clone(),
            organization: self.organization.clone(),
            min_email_confidence: self.min_confidence,
            has_email: self.has_email,
            has_phone: self.has_phone,
            min_quality: self.min_quality,
            include_stale: self.include_stale,
            limit: None,
            offset: 0,
        }
    }
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum CheckpointAction {
    /// Print the checkpoint for a run scope.
    Show(ScopeArgs),
    /// Delete the checkpoint for a run scope.
    Clear(ScopeArgs),
}

#[derive(Args)]
pub(crate) struct ScopeArgs {
    #[arg(long)]
    incremental: bool,

    #[arg(long)]
    shard: Option<Shard>,
}

impl ScopeArgs {
    fn scope(&self) -> String {
        let run_type = if self.incremental {
            RunType::Incremental
        } else {
            RunType::Full
        };
        scope_name(run_type, self.shard)
    }
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
        0 => "leadharvest=info",
        1 => "leadharvest=debug",
        _ => "leadharvest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    let db = cli.db.clone();
    let settings = || load_settings(config_path.as_deref(), db.as_deref());

    match cli.command {
        Command::Harvest {
            incremental,
            resume,
            letters,
            shard,
            no_enrich,
            batch_size,
            delay_ms,
        } => {
            let mut config = settings()?;
            if let Some(ms) = delay_ms {
                config.fetch.min_delay_ms = ms;
            }
            if let Some(size) = batch_size {
                config.harvest.batch_size = size;
            }
            config.validate()?;

            let options = HarvestOptions {
                run_type: if incremental {
                    RunType::Incremental
                } else {
                    RunType::Full
                },
                resume,
                letters,
                shard,
                enrich: !no_enrich,
                batch_size: config.harvest.batch_size,
            };
            cmd_harvest(&config, &options).await
        }
        Command::Enrich {
            retry_unresolved,
            limit,
        } => cmd_enrich(&settings()?, retry_unresolved, limit).await,
        Command::List {
            filters,
            limit,
            offset,
        } => cmd_list(&settings()?, &filters, limit, offset).await,
        Command::Show { id, json } => cmd_show(&settings()?, &id, json).await,
        Command::Export {
            format,
            out,
            filters,
        } => cmd_export(&settings()?, format, &out, &filters).await,
        Command::Stats => cmd_stats(&settings()?).await,
        Command::Checkpoint { action } => cmd_checkpoint(&settings()?, action),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path.as_deref()),
            ConfigAction::Show => cmd_config_show(&settings()?),
        },
    }
}

/// Load the config file (or defaults) and apply global overrides.
fn load_settings(config: Option<&Path>, db: Option<&Path>) -> Result<AppConfig> {
    let mut settings = match config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(db) = db {
        settings.harvest.database = Some(db.to_string_lossy().into_owned());
    }
    Ok(settings)
}

/// Contact enrichment over the directory detail view and, if enabled,
/// organization websites.
fn build_enrichment(
    config: &AppConfig,
    fetcher: Arc<Fetcher<FormDirectory>>,
    storage: Arc<Storage>,
) -> Result<EnrichmentCache> {
    let mut cache = EnrichmentCache::new(&config.enrichment, &config.quality, storage)
        .with_source(Arc::new(DirectoryDetailSource::new(fetcher, &config.enrichment)));
    if config.enrichment.site_lookup {
        cache = cache.with_source(Arc::new(OrganizationSiteSource::new(
            &config.enrichment,
            &config.fetch,
        )?));
    }
    Ok(cache)
}

fn directory_fetcher(config: &AppConfig) -> Result<Arc<Fetcher<FormDirectory>>> {
    let directory = Arc::new(FormDirectory::new(&config.fetch)?);
    Ok(Arc::new(Fetcher::new(
        directory,
        config.fetch.min_delay(),
        RetryPolicy::from(&config.retry),
    )))
}

// ---------------------------------------------------------------------------
// harvest / enrich
// ---------------------------------------------------------------------------

async fn cmd_harvest(config: &AppConfig, options: &HarvestOptions) -> Result<()> {
    let db_path = config.database_path()?;
    let state_dir = config.state_dir()?;
    let storage = Arc::new(Storage::open(&db_path).await?);
    let fetcher = directory_fetcher(config)?;

    info!(
        db = %db_path.display(),
        run_type = %options.run_type,
        resume = options.resume,
        shard = ?options.shard.map(|s| s.to_string()),
        "starting harvest"
    );

    let mut harness = Harness::new(
        fetcher.clone(),
        storage.clone(),
        CheckpointStore::new(&state_dir),
        &config.quality,
    );
    if options.enrich {
        harness = harness.with_enrichment(build_enrichment(config, fetcher, storage)?);
    }

    let reporter = CliProgress::new();
    let report = harness.run(options, &reporter).await?;
    print_report(&report);

    match &report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Failed { cause, .. } => Err(eyre!(
            "harvest halted: {cause} (rerun with --resume to continue)"
        )),
    }
}

fn print_report(report: &RunReport) {
    let c = &report.counts;
    println!();
    match &report.outcome {
        RunOutcome::Completed => println!("  Harvest complete ({})", report.scope),
        RunOutcome::Failed { cause, checkpoint } => {
            println!("  Harvest halted ({})", report.scope);
            println!("  Cause:      {cause}");
            match checkpoint {
                Some(cp) => println!(
                    "  Resume at:  key {} {}",
                    cp.key,
                    match (&cp.cursor, cp.key_done) {
                        (_, true) => "(after this key)".to_string(),
                        (Some(cursor), false) => format!("(page {cursor})"),
                        (None, false) => "(first page)".to_string(),
                    }
                ),
                None => println!("  Resume at:  start (no checkpoint written)"),
            }
        }
    }
    println!("  Pages:      {}", c.pages);
    println!("  Created:    {}", c.created);
    println!("  Updated:    {} ({} field changes)", c.updated, c.change_events);
    println!("  Unchanged:  {}", c.unchanged);
    println!("  Enriched:   {}", c.enriched);
    println!("  Unresolved: {}", c.unresolved);
    if c.conflicts > 0 {
        println!("  Conflicts:  {}", c.conflicts);
    }
    if report.stale_marked > 0 {
        println!("  Stale:      {}", report.stale_marked);
    }
    if !report.failed_keys.is_empty() {
        println!("  Failed keys: {}", report.failed_keys.join(", "));
    }
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

async fn cmd_enrich(config: &AppConfig, retry_unresolved: bool, limit: Option<usize>) -> Result<()> {
    config.validate()?;
    let storage = Arc::new(Storage::open(&config.database_path()?).await?);
    let cache = build_enrichment(config, directory_fetcher(config)?, storage.clone())?;

    let all = storage
        .query_records(&RecordQuery {
            include_stale: true,
            ..Default::default()
        })
        .await?;
    let mut pending: Vec<Record> = all
        .into_iter()
        .filter(|r| match &r.email {
            None => true,
            Some(email) => retry_unresolved && email.provenance == Provenance::NotFound,
        })
        .collect();
    if let Some(limit) = limit {
        pending.truncate(limit);
    }
    info!(records = pending.len(), retry_unresolved, "enriching records");

    let bar = ProgressBar::new(pending.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut counts = RunCounts::default();
    let mut by_provenance = [0u64; 4];
    for mut record in pending {
        bar.set_message(record.display_name.clone());
        let provenance = cache.enrich(&mut record, Utc::now()).await?;
        storage
            .update_contacts(
                &record.external_id,
                record.email.as_ref(),
                record.phone.as_ref(),
                record.quality_score,
            )
            .await?;
        if provenance == Provenance::NotFound {
            counts.unresolved += 1;
        } else {
            counts.enriched += 1;
        }
        by_provenance[provenance as usize] += 1;
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!();
    println!("  Enriched:   {}", counts.enriched);
    println!("    direct:   {}", by_provenance[Provenance::Direct as usize]);
    println!("    pattern:  {}", by_provenance[Provenance::Pattern as usize]);
    println!("    guess:    {}", by_provenance[Provenance::Guess as usize]);
    println!("  Unresolved: {}", counts.unresolved);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Read-only commands
// ---------------------------------------------------------------------------

async fn open_readonly(config: &AppConfig) -> Result<Storage> {
    Ok(Storage::open_readonly(&config.database_path()?).await?)
}

async fn cmd_list(config: &AppConfig, filters: &FilterArgs, limit: usize, offset: usize) -> Result<()> {
    let storage = open_readonly(config).await?;
    let query = RecordQuery {
        limit: Some(limit),
        offset,
        ..filters.to_query()
    };
    let records = storage.query_records(&query).await?;

    if records.is_empty() {
        println!("No records match.");
        return Ok(());
    }

    println!(
        "{:<10} {:<28} {:<32} {:<14} {:<10} {:<36} {:<15} {:>3}",
        "ID", "NAME", "ORGANIZATION", "CITY", "STATUS", "EMAIL", "PHONE", "Q"
    );
    for r in &records {
        let email = match &r.email {
            Some(e) if e.is_resolved() => format!(
                "{} ({:.2})",
                e.value.as_deref().unwrap_or_default(),
                e.confidence
            ),
            _ => "-".to_string(),
        };
        let phone = r
            .phone
            .as_ref()
            .and_then(|p| p.value.as_deref())
            .unwrap_or("-");
        println!(
            "{:<10} {:<28} {:<32} {:<14} {:<10} {:<36} {:<15} {:>3}",
            r.external_id,
            truncate(&r.display_name, 28),
            truncate(&r.organization, 32),
            truncate(&r.city, 14),
            r.status,
            truncate(&email, 36),
            phone,
            r.quality_score
        );
    }
    println!("\n{} record(s), offset {offset}", records.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

async fn cmd_show(config: &AppConfig, id: &str, json: bool) -> Result<()> {
    let storage = open_readonly(config).await?;
    let record = storage
        .get_record(id)
        .await?
        .ok_or_else(|| eyre!("no record with id '{id}'"))?;
    let events = storage.list_change_events(id).await?;

    if json {
        let value = serde_json::json!({ "record": record, "changes": events });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("  {} ({})", record.display_name, record.external_id);
    if let Some(aka) = &record.aka {
        println!("  AKA:          {aka}");
    }
    println!("  Organization: {}", record.organization);
    println!("  City:         {}", record.city);
    if let Some(sector) = &record.sector {
        println!("  Sector:       {sector}");
    }
    println!("  Status:       {}", record.status);
    for (label, field) in [("Email", &record.email), ("Phone", &record.phone)] {
        match field {
            Some(f) if f.is_resolved() => println!(
                "  {label:<13} {} [{}{}, {:.2}]",
                f.value.as_deref().unwrap_or_default(),
                f.provenance,
                f.method.as_deref().map(|m| format!("/{m}")).unwrap_or_default(),
                f.confidence
            ),
            Some(_) => println!("  {label:<13} not found"),
            None => println!("  {label:<13} -"),
        }
    }
    println!("  Quality:      {}", record.quality_score);
    println!("  First seen:   {}", record.first_seen_at.to_rfc3339());
    println!("  Last seen:    {}", record.last_seen_at.to_rfc3339());
    if record.stale {
        println!("  Stale:        yes");
    }

    if !events.is_empty() {
        println!();
        println!("  Changes:");
        for e in &events {
            println!(
                "    {}  {}: '{}' -> '{}'",
                e.detected_at.format("%Y-%m-%d %H:%M"),
                e.field,
                e.old_value,
                e.new_value
            );
        }
    }
    println!();
    Ok(())
}

async fn cmd_export(
    config: &AppConfig,
    format: ExportFormat,
    out: &Path,
    filters: &FilterArgs,
) -> Result<()> {
    let storage = open_readonly(config).await?;
    let records = storage.query_records(&filters.to_query()).await?;
    let written = export_to_path(&records, format, out)?;
    println!("Exported {written} record(s) to {}", out.display());
    Ok(())
}

async fn cmd_stats(config: &AppConfig) -> Result<()> {
    let storage = open_readonly(config).await?;
    let stats = storage.stats().await?;

    println!();
    println!("  Records:        {}", stats.total);
    println!("  Stale:          {}", stats.stale);
    println!("  With email:     {}", stats.with_email);
    println!("  With phone:     {}", stats.with_phone);
    println!("  Avg quality:    {:.1}", stats.average_quality);
    println!("  Patterns:       {}", stats.patterns);
    println!("  Change events:  {}", stats.change_events);
    if !stats.by_status.is_empty() {
        println!("  By status:");
        for (status, n) in &stats.by_status {
            println!("    {status:<12} {n}");
        }
    }
    if !stats.by_email_provenance.is_empty() {
        println!("  Email source:");
        for (provenance, n) in &stats.by_email_provenance {
            println!("    {provenance:<12} {n}");
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// checkpoint / config
// ---------------------------------------------------------------------------

fn cmd_checkpoint(config: &AppConfig, action: CheckpointAction) -> Result<()> {
    let checkpoints = CheckpointStore::new(&config.state_dir()?);
    match action {
        CheckpointAction::Show(args) => {
            let scope = args.scope();
            match checkpoints.read_raw(&scope)? {
                Some(raw) => println!("{raw}"),
                None => println!("No checkpoint for scope '{scope}'."),
            }
        }
        CheckpointAction::Clear(args) => {
            let scope = args.scope();
            if checkpoints.clear(&scope)? {
                println!("Cleared checkpoint '{scope}'.");
            } else {
                println!("No checkpoint for scope '{scope}'.");
            }
        }
    }
    Ok(())
}

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
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
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn key_started(&self, key: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Harvesting [{current}/{total}] {key}"));
    }

    fn page_processed(&self, key: &str, counts: &RunCounts) {
        self.spinner.set_message(format!(
            "Harvesting {key}: {} new, {} updated, {} unchanged",
            counts.created, counts.updated, counts.unchanged
        ));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
