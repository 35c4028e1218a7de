// ABOUTME: CLI entry point for tablesync
// ABOUTME: Parses commands, loads configuration, and maps run outcomes to exit codes

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tablesync::commands::{self, Endpoints};
use tablesync::config::{FileConfig, LockScope, SignatureType, SyncOptions};
use tablesync::engine::{RunStatus, StateStore};

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "Row-level table sync between MySQL, PostgreSQL and SQLite databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// TOML file with [sync] and [bisync] settings; flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct EndpointArgs {
    /// Source database URL (mysql://, postgres://, sqlite:// or a .db path)
    #[arg(long, env = "SOURCE_DATABASE_URL")]
    source: String,
    /// Target database URL
    #[arg(long, env = "TARGET_DATABASE_URL")]
    target: String,
    /// Accept mysql:// URLs on port 5432
    #[arg(long)]
    allow_mysql_port_5432: bool,
    /// File holding the last committed signature of each database pair
    #[arg(long, default_value_os_t = StateStore::default_path())]
    state_file: PathBuf,
}

impl From<EndpointArgs> for Endpoints {
    fn from(args: EndpointArgs) -> Self {
        Endpoints {
            source: args.source,
            target: args.target,
            allow_mysql_port_5432: args.allow_mysql_port_5432,
            state_file: args.state_file,
        }
    }
}

#[derive(Args, Clone, Debug, Default)]
struct SyncArgs {
    /// Sync only these tables (comma-separated)
    #[arg(long, value_delimiter = ',')]
    include: Option<Vec<String>>,
    /// Skip these tables (comma-separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Option<Vec<String>>,
    /// Maximum rows per applied batch (default: 1000)
    #[arg(long)]
    batch_size: Option<usize>,
    /// Rows per page while streaming row signatures (default: 5000)
    #[arg(long)]
    page_size: Option<usize>,
    /// Report planned changes without writing to the target
    #[arg(long)]
    dry_run: bool,
    /// Keep foreign key checks enabled while applying
    #[arg(long)]
    keep_fk_checks: bool,
    /// Always diff every table, even when the source looks unchanged
    #[arg(long)]
    no_change_detector: bool,
    /// Number of concurrent table workers (default: based on CPU count)
    #[arg(long, env = "SYNC_MAX_WORKERS")]
    max_workers: Option<usize>,
    /// Change detection strategy: log-position, content-hash or auto
    #[arg(long)]
    signature_type: Option<SignatureType>,
    /// Skip inserts whose key already exists on the target instead of failing the batch
    #[arg(long)]
    insert_ignore: bool,
}

impl SyncArgs {
    /// Defaults, then the config file, then flags.
    fn into_options(self, file: &FileConfig) -> SyncOptions {
        let mut options = SyncOptions::default().merge_file(&file.sync);
        if self.include.is_some() {
            options.include = self.include;
        }
        if self.exclude.is_some() {
            options.exclude = self.exclude;
        }
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(page_size) = self.page_size {
            options.page_size = page_size;
        }
        if self.max_workers.is_some() {
            options.max_workers = self.max_workers;
        }
        if let Some(signature_type) = self.signature_type {
            options.signature_type = signature_type;
        }
        options.dry_run |= self.dry_run;
        options.keep_fk_checks |= self.keep_fk_checks;
        options.insert_ignore |= self.insert_ignore;
        if self.no_change_detector {
            options.change_detector = false;
        }
        options
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Make the target's tables match the source once
    Sync {
        #[command(flatten)]
        endpoints: EndpointArgs,
        #[command(flatten)]
        sync: SyncArgs,
    },
    /// Report whether the source changed since the last successful sync
    ///
    /// Exit code 0 means unchanged, 1 means changed.
    Check {
        #[command(flatten)]
        endpoints: EndpointArgs,
        #[command(flatten)]
        sync: SyncArgs,
        /// Store the current signature as the baseline and exit 0
        #[arg(long)]
        write_current_signature: bool,
    },
    /// Sync repeatedly until Ctrl+C, skipping passes where nothing changed
    Watch {
        #[command(flatten)]
        endpoints: EndpointArgs,
        #[command(flatten)]
        sync: SyncArgs,
        /// Seconds between passes
        #[arg(long, default_value_t = 1)]
        interval: u64,
    },
    /// Sync in both directions concurrently (source = A, target = B)
    Bisync {
        #[command(flatten)]
        endpoints: EndpointArgs,
        #[command(flatten)]
        sync: SyncArgs,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Seconds between passes (default: 1, or interval_secs from the config file)
        #[arg(long)]
        interval: Option<u64>,
        /// Seconds to wait for a table lock before skipping the table (default: 30)
        #[arg(long)]
        lock_timeout: Option<u64>,
        /// Lock granularity
        #[arg(long, value_enum)]
        lock_scope: Option<LockScope>,
    },
}

fn status_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::Partial => ExitCode::from(1),
        RunStatus::Failed => ExitCode::from(2),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // Initialize TLS policy using thread-safe OnceLock
    tablesync::db::postgres::init_tls_policy(cli.allow_self_signed_certs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => FileConfig::default(),
    };

    match cli.command {
        Commands::Sync { endpoints, sync } => {
            let options = sync.into_options(&file);
            options.validate().context("Invalid sync options")?;
            let status = commands::sync(&endpoints.into(), options).await?;
            Ok(status_code(status))
        }
        Commands::Check {
            endpoints,
            sync,
            write_current_signature,
        } => {
            let options = sync.into_options(&file);
            options.validate().context("Invalid sync options")?;
            let changed = commands::check(&endpoints.into(), options, write_current_signature).await?;
            Ok(if changed {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Watch {
            endpoints,
            sync,
            interval,
        } => {
            let options = sync.into_options(&file);
            options.validate().context("Invalid sync options")?;
            if interval == 0 {
                anyhow::bail!("--interval must be at least 1 second");
            }
            commands::watch(&endpoints.into(), options, Duration::from_secs(interval)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Bisync {
            endpoints,
            sync,
            once,
            interval,
            lock_timeout,
            lock_scope,
        } => {
            let options = sync.into_options(&file);
            options.validate().context("Invalid sync options")?;

            let mut bisync = file.bisync_options();
            if let Some(secs) = lock_timeout {
                bisync.lock_timeout = Duration::from_secs(secs);
            }
            if let Some(scope) = lock_scope {
                bisync.lock_scope = scope;
            }

            let interval = interval.or(file.bisync.interval_secs).unwrap_or(1);
            if interval == 0 {
                anyhow::bail!("--interval must be at least 1 second");
            }
            let interval = (!once).then(|| Duration::from_secs(interval));

            let status = commands::bisync(&endpoints.into(), options, bisync, interval).await?;
            Ok(status_code(status))
        }
    }
}
