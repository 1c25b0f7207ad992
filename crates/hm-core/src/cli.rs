//! Command surface of the `hm-import` driver.
//!
//! `import` loads one or more export documents, one transaction each.
//! `watch` polls a directory and imports each export once it is complete.
//! `purge` removes an instrument's rows, or only its older datapoints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info, warn};

use hm_config::{
    resolve_config, ConfigError, ConfigPaths, HmConfig, ImportConfig, InstrumentRegistry, LoadMode,
    RowErrorPolicy,
};
use hm_store::{PostgresStore, PurgeReport, StoreError, StoreGateway};

use crate::exit_codes::ExitCode;
use crate::logging::LogFormat;
use crate::pipeline::{dedup_paths, ImportError, ImportReport, Importer, PreparedImport};
use crate::watch::{DirectoryWatcher, WatchConfig};

/// Import health monitor exports into the time-series store.
#[derive(Parser, Debug)]
#[command(name = "hm-import", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options accepted by every subcommand
#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Human, global = true)]
    pub log_format: LogFormat,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (TOML); defaults to $HM_CONFIG, then the user config dir
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
}

/// Driver subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import export documents (.xml or .xml.gz)
    Import(ImportArgs),
    /// Import exports as they appear in a directory
    Watch(WatchArgs),
    /// Delete an instrument's stored rows
    Purge(PurgeArgs),
}

/// Arguments for `import`
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Export documents, imported in the given order
    #[arg(short, long = "input", value_name = "FILE", num_args = 1.., required = true)]
    pub inputs: Vec<PathBuf>,

    /// Instrument settings file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub settings: PathBuf,

    #[command(flatten)]
    pub load: LoadOpts,

    /// Print one JSON report per document on stdout
    #[arg(long)]
    pub json: bool,
}

/// Load options shared by `import` and `watch`
#[derive(Args, Debug, Default)]
pub struct LoadOpts {
    /// Use conflict-ignore inserts instead of the bulk-copy channel
    #[arg(long)]
    pub no_copy: bool,

    /// Abort on the first datapoint that cannot be converted
    #[arg(long)]
    pub strict: bool,

    /// Bulk-copy flush threshold in bytes
    #[arg(long, value_name = "BYTES")]
    pub chunk_bytes: Option<usize>,
}

/// Arguments for `watch`
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Directory receiving `*_data.xml` / `*_data.xml.gz` exports
    #[arg(short, long = "input", value_name = "DIR")]
    pub dir: PathBuf,

    /// Instrument settings file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub settings: PathBuf,

    /// Seconds between directory scans
    #[arg(long, value_name = "SECS", default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Unchanged scans before a file counts as complete
    #[arg(long, value_name = "N", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub stable_polls: u32,

    #[command(flatten)]
    pub load: LoadOpts,

    /// Print one JSON report per document on stdout
    #[arg(long)]
    pub json: bool,
}

impl WatchArgs {
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            interval: Duration::from_secs(self.interval),
            stable_polls: self.stable_polls,
        }
    }
}

/// Arguments for `purge`
#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Serial number of the instrument
    #[arg(long)]
    pub serial: i64,

    /// Instrument settings file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub settings: PathBuf,

    /// Only delete datapoints older than this date (YYYY-MM-DD, UTC)
    #[arg(long, value_name = "DATE", value_parser = parse_date)]
    pub before: Option<NaiveDate>,

    /// Print the purge report as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

/// Run the parsed command line and return the process exit code.
pub fn run(cli: &Cli) -> ExitCode {
    let config = match load_config(cli.global.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::ConfigError;
        }
    };
    match &cli.command {
        Commands::Import(args) => run_import(args, config),
        Commands::Watch(args) => run_watch(args, config),
        Commands::Purge(args) => run_purge(args, config),
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<HmConfig, ConfigError> {
    let (mut config, source) = resolve_config(&ConfigPaths::discover(explicit))?;
    config.store.apply_env()?;
    config.validate()?;
    info!(source = ?source, "configuration loaded");
    Ok(config)
}

/// Apply command-line overrides on top of the `[import]` table.
pub fn import_config(args: &LoadOpts, base: &ImportConfig) -> Result<ImportConfig, ConfigError> {
    let mut config = base.clone();
    if args.no_copy {
        config = config.with_mode(LoadMode::Fallback);
    }
    if args.strict {
        config = config.with_row_errors(RowErrorPolicy::Fail);
    }
    if let Some(bytes) = args.chunk_bytes {
        config = config.with_copy_chunk_bytes(bytes);
    }
    config.validate()?;
    Ok(config)
}

fn load_registry(settings: &Path) -> Result<InstrumentRegistry, ExitCode> {
    InstrumentRegistry::load(settings).map_err(|e| {
        error!(settings = %settings.display(), error = %e, "cannot load settings");
        ExitCode::ConfigError
    })
}

fn load_import_config(load: &LoadOpts, config: &HmConfig) -> Result<ImportConfig, ExitCode> {
    import_config(load, &config.import).map_err(|e| {
        error!(error = %e, "invalid import options");
        ExitCode::ConfigError
    })
}

fn run_import(args: &ImportArgs, config: HmConfig) -> ExitCode {
    let registry = match load_registry(&args.settings) {
        Ok(registry) => registry,
        Err(code) => return code,
    };
    let import = match load_import_config(&args.load, &config) {
        Ok(import) => import,
        Err(code) => return code,
    };

    let mut failure: Option<ExitCode> = None;
    let mut partial = false;
    for path in dedup_paths(&args.inputs) {
        match import_one(&path, &registry, &import, &config) {
            Ok(report) => {
                partial |= !report.is_clean();
                print_import(&report, args.json);
            }
            Err(e) => {
                log_import_failure(&path, &e);
                failure.get_or_insert(e.exit_code());
            }
        }
    }

    match failure {
        Some(code) => code,
        None if partial => ExitCode::PartialImport,
        None => ExitCode::Clean,
    }
}

/// Watch a directory until the process is stopped.
///
/// Each complete file is imported in its own transaction; a failed import is
/// logged and the watch continues.
fn run_watch(args: &WatchArgs, config: HmConfig) -> ExitCode {
    let registry = match load_registry(&args.settings) {
        Ok(registry) => registry,
        Err(code) => return code,
    };
    let import = match load_import_config(&args.load, &config) {
        Ok(import) => import,
        Err(code) => return code,
    };
    let mut watcher = match DirectoryWatcher::new(&args.dir, args.watch_config()) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(error = %e, "cannot watch directory");
            return ExitCode::ConfigError;
        }
    };

    watcher.run_until(
        |path| match import_one(path, &registry, &import, &config) {
            Ok(report) => print_import(&report, args.json),
            Err(e) => log_import_failure(path, &e),
        },
        || false,
    );
    ExitCode::Clean
}

fn log_import_failure(path: &Path, e: &ImportError) {
    error!(
        source = %path.display(),
        code = e.code(),
        category = %e.category(),
        error = %e,
        "import failed"
    );
}

fn import_one(
    path: &Path,
    registry: &InstrumentRegistry,
    import: &ImportConfig,
    config: &HmConfig,
) -> Result<ImportReport, ImportError> {
    let prepared = PreparedImport::open(path, registry)?;
    let database = config.store.database_for(prepared.identity().database);
    let store = PostgresStore::connect(&config.store, &database).map_err(connect_error)?;

    let mut importer = Importer::new(store, import.clone(), registry);
    let result = importer.import_prepared(prepared);
    if let Err(e) = importer.into_gateway().close() {
        warn!(database = %database, error = %e, "closing connection failed");
    }
    result
}

fn connect_error(e: StoreError) -> ImportError {
    match e {
        StoreError::Config(config) => ImportError::Config(config),
        other => ImportError::Store(other),
    }
}

fn print_import(report: &ImportReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => error!(error = %e, "cannot serialize report"),
        }
        return;
    }
    println!(
        "{}: {} ({}) {} rows read, {} dropped, {} blocks skipped, {} stored [{}]",
        report.source,
        report.instrument.name,
        report.serial,
        report.rows_yielded,
        report.rows_dropped,
        report.blocks_skipped,
        report.stored_rows(),
        report.mode(),
    );
}

fn run_purge(args: &PurgeArgs, config: HmConfig) -> ExitCode {
    let registry = match InstrumentRegistry::load(&args.settings) {
        Ok(registry) => registry,
        Err(e) => {
            error!(settings = %args.settings.display(), error = %e, "cannot load settings");
            return ExitCode::ConfigError;
        }
    };
    let Some(identity) = registry.find_by_serial(args.serial) else {
        error!(serial = args.serial, "serial not listed in settings");
        return ExitCode::ConfigError;
    };
    let database = config.store.database_for(identity.database);
    let before = args.before.map(start_of_day);

    let mut store = match PostgresStore::connect(&config.store, &database) {
        Ok(store) => store,
        Err(e) => {
            let e = connect_error(e);
            error!(database = %database, error = %e, "cannot connect");
            return e.exit_code();
        }
    };
    let outcome = purge(&mut store, args.serial, before);
    if let Err(e) = store.close() {
        warn!(database = %database, error = %e, "closing connection failed");
    }

    match outcome {
        Ok(report) => {
            print_purge(&report, args.json);
            ExitCode::Clean
        }
        Err(e) => {
            error!(serial = args.serial, error = %e, "purge failed");
            ExitCode::StoreError
        }
    }
}

/// Purge inside one transaction.
pub fn purge<G: StoreGateway + ?Sized>(
    gateway: &mut G,
    serial: i64,
    before: Option<DateTime<Utc>>,
) -> Result<PurgeReport, StoreError> {
    gateway.begin()?;
    match gateway.purge_instrument(serial, before) {
        Ok(report) => {
            gateway.commit()?;
            info!(
                serial,
                data_rows = report.data_rows,
                parameters = report.parameters,
                enum_rows = report.enum_rows,
                instrument_removed = report.instrument_removed,
                "purge committed"
            );
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = gateway.rollback() {
                error!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn print_purge(report: &PurgeReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => error!(error = %e, "cannot serialize report"),
        }
        return;
    }
    println!(
        "serial {}: {} datapoints, {} parameters, {} enumeration rows deleted{}",
        report.serial,
        report.data_rows,
        report.parameters,
        report.enum_rows,
        if report.instrument_removed { ", instrument removed" } else { "" },
    );
}
