use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use blindbox_sync::{
    CatalogSource, FileCatalogSource, HttpCatalogSource, StaticCatalog, TransportConfig,
};

mod commands;
mod render;

#[derive(Parser)]
#[command(name = "blindbox")]
#[command(about = "Blind-box stock picking for the classroom", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Relay,
    Poll,
    Local,
}

/// Where the shared session lives.
#[derive(Debug, Clone, Args)]
struct BackendArgs {
    /// Backend variant
    #[arg(long, global = true, value_enum, default_value_t = TransportArg::Relay)]
    transport: TransportArg,

    /// Relay (ws://) or key/value (http://) URL
    #[arg(long, global = true)]
    url: Option<String>,

    /// Relay room
    #[arg(long, global = true, default_value = "defaultRoom")]
    room: String,

    /// Pull period for the poll backend
    #[arg(long, global = true, default_value_t = 3000)]
    poll_interval_ms: u64,

    /// Snapshot file for the local backend
    #[arg(long, global = true)]
    local_path: Option<PathBuf>,

    /// JSON transport config; overrides the flags above
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9090";

impl BackendArgs {
    fn transport_config(&self) -> Result<TransportConfig> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return TransportConfig::from_json(&text)
                .with_context(|| format!("parsing {}", path.display()));
        }

        let config = match self.transport {
            TransportArg::Relay => TransportConfig::Relay {
                url: self.url.clone().unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
                room: self.room.clone(),
                request_timeout_ms: 5_000,
            },
            TransportArg::Poll => {
                let Some(url) = self.url.clone() else {
                    bail!("--transport poll needs --url");
                };
                TransportConfig::Poll {
                    url,
                    poll_interval_ms: self.poll_interval_ms,
                    request_timeout_ms: 5_000,
                }
            }
            TransportArg::Local => TransportConfig::Local {
                path: self.local_path.clone(),
            },
        };
        Ok(config)
    }
}

/// Where a new catalog comes from.
#[derive(Debug, Clone, Args)]
struct CatalogArgs {
    /// Download the catalog CSV from this URL
    #[arg(long, conflicts_with = "catalog_file")]
    catalog_url: Option<String>,

    /// Read the catalog CSV from this file
    #[arg(long)]
    catalog_file: Option<PathBuf>,
}

impl CatalogArgs {
    /// The catalog `action` works with. Actions that load a catalog need a
    /// source; the rest get an empty one they never fetch.
    fn source_for(&self, action: &TeacherAction) -> Result<Arc<dyn CatalogSource>> {
        let source: Arc<dyn CatalogSource> = match (&self.catalog_url, &self.catalog_file) {
            (Some(url), _) => Arc::new(HttpCatalogSource::new(url.as_str(), Duration::from_secs(10))),
            (None, Some(path)) => Arc::new(FileCatalogSource::new(path.clone())),
            (None, None) if action.loads_catalog() => {
                bail!("this action loads a catalog; pass --catalog-url or --catalog-file")
            }
            (None, None) => Arc::new(StaticCatalog::default()),
        };
        Ok(source)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket relay
    Relay {
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,

        #[arg(long, default_value_t = 200)]
        max_subscribers: usize,
    },
    /// Session controls
    Teacher {
        #[command(flatten)]
        catalog: CatalogArgs,

        #[command(subcommand)]
        action: TeacherAction,
    },
    /// Open a box
    Student {
        #[command(subcommand)]
        action: StudentAction,
    },
    /// Print every change to the session until interrupted
    Watch,
}

#[derive(Subcommand)]
enum TeacherAction {
    /// Seed an empty backend with an idle session and a catalog
    Init,
    /// Start a session over a fresh catalog
    Start,
    /// Stop accepting claims
    End,
    /// Back to idle, dropping all claims
    Reset {
        /// Fetch a new catalog instead of clearing it
        #[arg(long)]
        refetch: bool,
    },
    /// Write the results CSV
    Export {
        /// Output file; defaults to results_<date>.csv
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long, default_value = "symbol")]
        symbol_header: String,

        #[arg(long, default_value = "claimant")]
        claimant_header: String,
    },
    /// Phase, progress and claims
    Status,
    /// Remove the session from the backend
    Clear,
}

impl TeacherAction {
    fn loads_catalog(&self) -> bool {
        matches!(
            self,
            Self::Init | Self::Start | Self::Reset { refetch: true }
        )
    }
}

#[derive(Subcommand)]
enum StudentAction {
    /// List the boxes
    Boxes {
        #[arg(long)]
        name: String,
    },
    /// Claim a box by number or symbol
    Claim {
        #[arg(value_name = "BOX")]
        entry: String,

        #[arg(long)]
        name: String,
    },
    /// Show the box you hold
    Mine {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Relay {
            bind,
            max_subscribers,
        } => commands::relay(bind, max_subscribers).await?,
        Commands::Teacher { catalog, action } => {
            let ctx = commands::Context::new(
                cli.backend.transport_config()?,
                catalog.source_for(&action)?,
            );
            match action {
                TeacherAction::Init => commands::initialize(&ctx).await?,
                TeacherAction::Start => commands::start(&ctx).await?,
                TeacherAction::End => commands::end(&ctx).await?,
                TeacherAction::Reset { refetch } => commands::reset(&ctx, refetch).await?,
                TeacherAction::Export {
                    out,
                    symbol_header,
                    claimant_header,
                } => commands::export(&ctx, out, symbol_header, claimant_header).await?,
                TeacherAction::Status => commands::status(&ctx).await?,
                TeacherAction::Clear => commands::clear(&ctx).await,
            }
        }
        Commands::Student { action } => {
            let ctx = commands::Context::new(
                cli.backend.transport_config()?,
                Arc::new(StaticCatalog::default()),
            );
            match action {
                StudentAction::Boxes { name } => commands::boxes(&ctx, &name).await?,
                StudentAction::Claim { entry, name } => commands::claim(&ctx, &entry, &name).await?,
                StudentAction::Mine { name } => commands::mine(&ctx, &name).await?,
            }
        }
        Commands::Watch => {
            let ctx = commands::Context::new(
                cli.backend.transport_config()?,
                Arc::new(StaticCatalog::default()),
            );
            commands::watch(&ctx).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("blindbox").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_backend_is_relay_on_localhost() {
        let cli = parse(&["watch"]);
        assert_eq!(
            cli.backend.transport_config().unwrap(),
            TransportConfig::relay(DEFAULT_RELAY_URL)
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&[
            "student", "claim", "AAPL", "--name", "Alice", "--transport", "poll", "--url",
            "http://kv/session", "--poll-interval-ms", "500",
        ]);
        assert_eq!(
            cli.backend.transport_config().unwrap(),
            TransportConfig::Poll {
                url: "http://kv/session".to_string(),
                poll_interval_ms: 500,
                request_timeout_ms: 5_000,
            }
        );
        match cli.command {
            Commands::Student {
                action: StudentAction::Claim { entry, name },
            } => {
                assert_eq!(entry, "AAPL");
                assert_eq!(name, "Alice");
            }
            _ => panic!("expected student claim"),
        }
    }

    #[test]
    fn test_poll_requires_url() {
        let cli = parse(&["watch", "--transport", "poll"]);
        assert!(cli.backend.transport_config().is_err());
    }

    #[test]
    fn test_config_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.json");
        std::fs::write(&path, r#"{"kind":"local","path":"/tmp/x.json"}"#).unwrap();

        let cli = parse(&["watch", "--transport", "relay", "--config", path.to_str().unwrap()]);
        assert_eq!(
            cli.backend.transport_config().unwrap(),
            TransportConfig::Local {
                path: Some(PathBuf::from("/tmp/x.json"))
            }
        );
    }

    #[test]
    fn test_teacher_reset_flags() {
        let cli = parse(&["teacher", "--catalog-file", "stocks.csv", "reset", "--refetch"]);
        match cli.command {
            Commands::Teacher {
                catalog,
                action: TeacherAction::Reset { refetch },
            } => {
                assert!(refetch);
                assert_eq!(catalog.catalog_file, Some(PathBuf::from("stocks.csv")));
            }
            _ => panic!("expected teacher reset"),
        }
    }

    #[test]
    fn test_loading_actions_need_a_catalog_source() {
        let teacher = |args: &[&str]| match parse(args).command {
            Commands::Teacher { catalog, action } => catalog.source_for(&action).map(|_| ()),
            _ => panic!("expected teacher command"),
        };

        assert!(teacher(&["teacher", "start"]).is_err());
        assert!(teacher(&["teacher", "init"]).is_err());
        assert!(teacher(&["teacher", "reset", "--refetch"]).is_err());
        assert!(teacher(&["teacher", "--catalog-file", "stocks.csv", "start"]).is_ok());
        assert!(teacher(&["teacher", "reset"]).is_ok());
        assert!(teacher(&["teacher", "status"]).is_ok());
        assert!(teacher(&["teacher", "end"]).is_ok());
    }

    #[test]
    fn test_catalog_sources_conflict() {
        let result = Cli::try_parse_from([
            "blindbox",
            "teacher",
            "--catalog-url",
            "http://x/a.csv",
            "--catalog-file",
            "a.csv",
            "start",
        ]);
        assert!(result.is_err());
    }
}
