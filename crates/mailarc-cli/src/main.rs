//! mailarc CLI
//!
//! Archives IMAP accounts into a local directory and searches the archive.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use mailarc_core::config::{AccountConfig, AccountList, Config};
use mailarc_core::index::{open_index, spawn_incremental_index, IndexEngine, IndexRunReport};
use mailarc_core::search::{SearchPage, SearchService};
use mailarc_core::sync::{archive_account, ArchiveReport};
use mailarc_core::Error;

/// Exit code when archiving an account fails
const EXIT_ARCHIVE_FAILED: u8 = 1;
/// Exit code when the configuration or batch file cannot be read
const EXIT_CONFIG_READ: u8 = 2;
/// Exit code when the configuration or batch file cannot be decoded
const EXIT_CONFIG_PARSE: u8 = 3;
/// Exit code when the index cannot be opened
const EXIT_INDEX_INIT: u8 = 4;

#[derive(Parser)]
#[command(name = "mailarc")]
#[command(about = "mailarc - Archive IMAP mailboxes to disk and search them")]
#[command(long_about = "mailarc mirrors every mailbox of an IMAP account into a local directory. \
Each message is stored once as <dir>/<mailbox>/<id>.eml, where the id is derived from the \
message header, so repeated runs only download what is missing.

EXAMPLES:
  mailarc archive --server imap.example.com --login me --password secret --tls --dir ./mail
  mailarc archive --config-file accounts.json
  mailarc index --dir ./mail
  mailarc search --dir ./mail \"invoice march\"
  mailarc download --dir ./mail <id> --output message.eml")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ~/.config/mailarc/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output in human-readable format instead of JSON
    #[arg(long, global = true)]
    human: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every mailbox of one account, or of all accounts in a batch file
    Archive {
        /// IMAP server host name
        #[arg(long, required_unless_present = "config_file")]
        server: Option<String>,

        /// IMAP port
        #[arg(long, default_value_t = 993)]
        port: u16,

        /// Login name
        #[arg(long, required_unless_present = "config_file")]
        login: Option<String>,

        /// Password
        #[arg(long, default_value = "")]
        password: String,

        /// Connect with implicit TLS
        #[arg(long)]
        tls: bool,

        /// Target directory (defaults to the configured data directory)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Batch configuration in JSON format
        #[arg(long, conflicts_with_all = ["server", "login"])]
        config_file: Option<PathBuf>,
    },
    /// Bring the search index of an archive directory up to date
    Index {
        /// Archive directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Search an archive directory
    Search {
        /// Query, e.g. "invoice" or "subject:invoice AND from:shop"
        query: String,

        /// Archive directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Query the existing index without indexing new messages first
        #[arg(long)]
        no_index: bool,
    },
    /// Write the raw message for an id to stdout or a file
    Download {
        /// Message id as shown in a search download link
        id: String,

        /// Archive directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Output file (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging depends on the configuration, so failures here go to stderr only
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(failure) => {
            eprintln!("{:#}", failure.error);
            return ExitCode::from(failure.code);
        }
    };
    let _guard = init_logging(&config);

    let result = match cli.command {
        Commands::Archive {
            server,
            port,
            login,
            password,
            tls,
            dir,
            config_file,
        } => match config_file {
            Some(path) => archive_batch(&config, &path, cli.human).await,
            None => {
                let account = AccountConfig {
                    name: String::new(),
                    server: server.unwrap_or_default(),
                    port,
                    login: login.unwrap_or_default(),
                    password,
                    tls,
                };
                let dir = dir.unwrap_or_else(|| config.general.data_dir.clone());
                archive_single(&config, &account, &dir, cli.human).await
            }
        },
        Commands::Index { dir } => {
            let dir = dir.unwrap_or_else(|| config.general.data_dir.clone());
            run_index(&config, &dir, cli.human).await
        }
        Commands::Search {
            query,
            dir,
            no_index,
        } => {
            let dir = dir.unwrap_or_else(|| config.general.data_dir.clone());
            run_search(&config, &dir, &query, !no_index, cli.human).await
        }
        Commands::Download { id, dir, output } => {
            let dir = dir.unwrap_or_else(|| config.general.data_dir.clone());
            run_download(&config, &dir, &id, output.as_deref()).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!("{:#}", failure.error);
            eprintln!("{:#}", failure.error);
            ExitCode::from(failure.code)
        }
    }
}

/// An error together with the process exit code it maps to
struct Failure {
    code: u8,
    error: anyhow::Error,
}

impl Failure {
    fn new(code: u8, error: impl Into<anyhow::Error>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }
}

type CliResult = std::result::Result<(), Failure>;

/// Exit code for a failure to load a configuration or batch file
fn config_failure(error: Error) -> Failure {
    let code = match error {
        Error::ConfigRead { .. } => EXIT_CONFIG_READ,
        _ => EXIT_CONFIG_PARSE,
    };
    Failure::new(code, error)
}

fn load_config(path: Option<&Path>) -> std::result::Result<Config, Failure> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .map_err(config_failure)
}

/// Console logging filtered by RUST_LOG or the configured level, plus an
/// optional daily log file under the data directory
fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.as_str()))
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    if !config.general.log_to_file {
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    let log_dir = config.logs_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        tracing_subscriber::registry().with(console_layer).init();
        warn!("Cannot create log directory {:?}: {}", log_dir, e);
        return None;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "mailarc.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
    Some(guard)
}

// ============================================================================
// Archive
// ============================================================================

async fn archive_single(
    config: &Config,
    account: &AccountConfig,
    dir: &Path,
    human: bool,
) -> CliResult {
    let report = archive_account(account, dir, &config.sync)
        .await
        .with_context(|| format!("failed to archive {} on {}", account.login, account.server))
        .map_err(|e| Failure::new(EXIT_ARCHIVE_FAILED, e))?;
    print_archive_report(&report, human);
    Ok(())
}

async fn archive_batch(config: &Config, path: &Path, human: bool) -> CliResult {
    let list = AccountList::load(path).map_err(config_failure)?;

    for account in &list.accounts {
        let dir = list.account_dir(account);
        info!("Archiving account '{}' into {:?}", account.name, dir);
        archive_single(config, account, &dir, human).await?;
    }
    info!("Archive completed");
    Ok(())
}

fn print_archive_report(report: &ArchiveReport, human: bool) {
    if !human {
        print_json(report);
        return;
    }

    println!("\n{} ({})", report.login, report.server);
    for mailbox in &report.mailboxes {
        println!("  {:<40} {:>8} mails", mailbox.name, mailbox.message_count);
    }
    println!("  Total:     {}", report.total_messages);
    println!("  Archived:  {}", report.archived);
    println!("  Present:   {}", report.skipped);
    if !report.unprocessable.is_empty() {
        println!("  Ignored {} unprocessable mails:", report.unprocessable.len());
        for record in &report.unprocessable {
            println!("    {}: {}", record.mailbox, record);
        }
    }
}

// ============================================================================
// Index & Search
// ============================================================================

fn open_archive_index(config: &Config, dir: &Path) -> std::result::Result<Arc<IndexEngine>, Failure> {
    open_index(dir, &config.index)
        .with_context(|| format!("cannot create new or open existing index in {:?}", dir))
        .map_err(|e| Failure::new(EXIT_INDEX_INIT, e))
}

async fn update_index(config: &Config, dir: &Path, engine: Arc<IndexEngine>) -> Result<IndexRunReport> {
    let report = spawn_incremental_index(dir.to_path_buf(), engine, config.index.clone())
        .await
        .context("index task panicked")??;
    Ok(report)
}

async fn run_index(config: &Config, dir: &Path, human: bool) -> CliResult {
    let engine = open_archive_index(config, dir)?;
    let report = update_index(config, dir, Arc::clone(&engine))
        .await
        .map_err(|e| Failure::new(EXIT_INDEX_INIT, e))?;

    if human {
        println!("Found {} new mails to index", report.candidates);
        println!("  Already indexed: {}", report.already_indexed);
        println!("  Indexed:         {}", report.pipeline.indexed);
        println!("  Failed:          {}", report.pipeline.failed);
        println!("  Documents:       {}", engine.num_docs());
    } else {
        print_json(&report);
    }
    Ok(())
}

async fn run_search(config: &Config, dir: &Path, query: &str, index_first: bool, human: bool) -> CliResult {
    let engine = open_archive_index(config, dir)?;
    if index_first {
        update_index(config, dir, Arc::clone(&engine))
            .await
            .map_err(|e| Failure::new(EXIT_INDEX_INIT, e))?;
    }

    let service = SearchService::new(engine, &config.search);
    let page = service
        .search(query)
        .with_context(|| format!("search for {:?} failed", query))
        .map_err(|e| Failure::new(EXIT_ARCHIVE_FAILED, e))?;

    if human {
        print_search_page(&page);
    } else {
        print_json(&page);
    }
    Ok(())
}

fn print_search_page(page: &SearchPage) {
    if page.entries.is_empty() {
        println!("No mails found.");
        return;
    }
    println!(
        "\nShowing {} of {} mails for \"{}\":\n",
        page.shown_count, page.total_count, page.query
    );
    for entry in &page.entries {
        println!("{}", entry.title);
        println!("   {}", entry.body_preview);
        println!(
            "   {} | {} attachments | {}",
            entry.size_label, entry.attachment_count, entry.download_link
        );
        println!();
    }
}

async fn run_download(config: &Config, dir: &Path, id: &str, output: Option<&Path>) -> CliResult {
    let engine = open_archive_index(config, dir)?;
    let service = SearchService::new(engine, &config.search);

    let raw = service
        .download(id)
        .map_err(|e| Failure::new(EXIT_ARCHIVE_FAILED, e))?
        .ok_or_else(|| Failure::new(EXIT_ARCHIVE_FAILED, anyhow::anyhow!("no archived mail with id {}", id)))?;

    let written = match output {
        Some(path) => std::fs::write(path, &raw).with_context(|| format!("cannot write {:?}", path)),
        None => std::io::stdout()
            .write_all(&raw)
            .context("cannot write to stdout"),
    };
    written.map_err(|e| Failure::new(EXIT_ARCHIVE_FAILED, e))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Cannot serialize output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_config_fails_with_parse_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general\nlog_level = ").unwrap();

        let failure = load_config(Some(path.as_path())).err().unwrap();
        assert_eq!(failure.code, EXIT_CONFIG_PARSE);
    }

    #[test]
    fn test_unreadable_config_fails_with_read_code() {
        let dir = tempfile::tempdir().unwrap();
        let failure = load_config(Some(dir.path())).err().unwrap();
        assert_eq!(failure.code, EXIT_CONFIG_READ);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path().join("absent.toml").as_path()))
            .ok()
            .unwrap();
        assert_eq!(config.search.max_hits, 1000);
    }
}
