use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use pointsync_core::db::Database;
use pointsync_core::dump::MysqlDump;
use pointsync_core::model::{HealthStatus, RestoringHealth};
use pointsync_core::util::{resolve_home, HomePaths};
use pointsync_core::{
    AppConfig, PointAssembly, PointStore, Reconciler, RemoteRegistry, SourceRoots, SyncOptions,
    SystemConfig, ZipArchiver,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pointsync",
    version,
    about = "Build restoring points and keep remote instances in sync with them"
)]
struct Cli {
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Create(CreateArgs),
    List,
    Show(PointArgs),
    Verify(PointArgs),
    Sync(SyncArgs),
}

#[derive(Parser, Debug)]
struct CreateArgs {
    /// Include the full user data directory.
    #[arg(long)]
    complete: bool,
}

#[derive(Parser, Debug)]
struct PointArgs {
    #[arg(value_name = "POINT")]
    point: String,
}

#[derive(Parser, Debug)]
struct SyncArgs {
    #[arg(value_name = "POINT")]
    point: String,
    /// Instance to reconcile with; repeatable. Defaults to every configured instance.
    #[arg(long = "instance", value_name = "NAME")]
    instances: Vec<String>,
    /// Ask instances to recompute health before comparing.
    #[arg(long)]
    refresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let home_paths = resolve_home(cli.home.as_deref())?;
    home_paths.ensure().await?;
    debug!(home = %home_paths.base.display(), "resolved home");
    let config = AppConfig::load(&home_paths.config_path).await?;

    match cli.command {
        Commands::Create(args) => handle_create(&home_paths, &config, args).await,
        Commands::List => handle_list(&home_paths).await,
        Commands::Show(args) => handle_show(&home_paths, args).await,
        Commands::Verify(args) => handle_verify(&home_paths, args).await,
        Commands::Sync(args) => handle_sync(&home_paths, &config, args).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pointsync_core=info,pointsync_cli=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn point_store(home_paths: &HomePaths) -> PointStore {
    PointStore::local(home_paths.appdata_dir.clone())
}

async fn handle_create(home_paths: &HomePaths, config: &AppConfig, args: CreateArgs) -> Result<()> {
    let system_path = config
        .system_config
        .as_deref()
        .context("no system_config configured")?;
    let system = SystemConfig::load(system_path).await?;
    let store = point_store(home_paths);
    let archive = ZipArchiver::new(
        store.clone(),
        SourceRoots::from_system(&system),
        &config.archive,
    );
    let db = Database::connect(&home_paths.state_db_path).await?;
    let assembly = PointAssembly::new(
        store,
        Arc::new(archive),
        Arc::new(MysqlDump::default()),
        system,
    )
    .with_database(db);
    let point = assembly
        .create(args.complete)
        .await
        .context("creating restoring point")?;
    println!("Created restoring point {}", point.id());
    Ok(())
}

async fn handle_list(home_paths: &HomePaths) -> Result<()> {
    let points = point_store(home_paths).list().await?;
    if points.is_empty() {
        println!("No restoring points");
        return Ok(());
    }
    for point in points {
        let date = point
            .date_time()
            .map_or_else(|| point.date().to_string(), |date| date.to_rfc3339());
        println!(
            "{}\t{}\t{}\t{} chunks\t{}",
            point.id(),
            date,
            if point.is_complete() { "complete" } else { "partial" },
            point.chunk_count(),
            point.nc_version()
        );
    }
    Ok(())
}

async fn handle_show(home_paths: &HomePaths, args: PointArgs) -> Result<()> {
    let point = point_store(home_paths)
        .load(&args.point)
        .await
        .with_context(|| format!("loading restoring point {}", args.point))?;
    println!("ID: {}", point.id());
    if let Some(date) = point.date_time() {
        println!("Created: {}", date.to_rfc3339());
    }
    println!("Version: {}", point.nc_version());
    println!("Complete: {}", point.is_complete());
    println!("Datasets:");
    for data in point.restoring_data() {
        let chunks = point.chunks_of(data.name());
        let size: u64 = chunks.iter().map(|chunk| chunk.size()).sum();
        println!(
            "  {}\t{} chunks\t{}",
            data.name(),
            chunks.len(),
            HumanBytes(size)
        );
    }
    match point.health() {
        Some(health) => print_health(health),
        None => println!("Health: not computed"),
    }
    Ok(())
}

async fn handle_verify(home_paths: &HomePaths, args: PointArgs) -> Result<()> {
    let point = point_store(home_paths)
        .refresh_health(&args.point)
        .await
        .with_context(|| format!("verifying restoring point {}", args.point))?;
    if let Some(health) = point.health() {
        print_health(health);
    }
    Ok(())
}

fn print_health(health: &RestoringHealth) {
    let status = match health.status() {
        HealthStatus::Ok => "OK",
        HealthStatus::Degraded => "DEGRADED",
        HealthStatus::Unknown => "UNKNOWN",
    };
    println!("Health: {status} ({})", health.counts());
}

async fn handle_sync(home_paths: &HomePaths, config: &AppConfig, args: SyncArgs) -> Result<()> {
    let store = point_store(home_paths);
    let point = store
        .load(&args.point)
        .await
        .with_context(|| format!("loading restoring point {}", args.point))?;

    let instances = if args.instances.is_empty() {
        config.instance_names()
    } else {
        args.instances
    };
    anyhow::ensure!(!instances.is_empty(), "no remote instance configured");

    let registry = RemoteRegistry::from_config(&config.instances)?;
    let mut options = SyncOptions::from(&config.sync);
    options.force_health_refresh |= args.refresh;
    let archive = ZipArchiver::new(store, SourceRoots::default(), &config.archive);
    let reconciler = Reconciler::new(Arc::new(archive), Arc::new(registry), options);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.set_message(format!(
        "reconciling {} with {} instance(s)",
        point.id(),
        instances.len()
    ));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let reports = reconciler.reconcile_all(&instances, &point).await;
    spinner.finish_and_clear();

    for report in reports {
        println!("{report}");
        for upload in &report.uploads {
            println!("  {upload}");
        }
    }
    Ok(())
}
