//! # strata CLI
//!
//! The `strata` binary runs the daemon (`strata serve`) and offers thin
//! HTTP-client subcommands against a running instance.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `strata init` | Create the data directory and databases |
//! | `strata serve` | Run the daemon (watcher, queue, control plane) |
//! | `strata stop` | Graceful shutdown via `POST /shutdown` |
//! | `strata ping` / `health` / `status` | Liveness and status probes |
//! | `strata query "<text>"` | Vector search over indexed chunks |
//! | `strata excavate` | Enqueue a batch extraction over all sources |
//! | `strata correlate [--wait]` | Queue (or run) a correlation batch |
//! | `strata entities` / `patterns` / `discoveries` | Browse correlation output |
//! | `strata feedback <id> confirm\|dismiss` | Lock a discovery |
//! | `strata jobs [--recent N]` | Queue statistics |
//!
//! Exit codes: 0 ok, 1 failure, 2 daemon unreachable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use strata::config::{self, Config};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Cognitive-archaeology daemon: index a file tree, correlate entities, surface discoveries",
    version
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to
    /// `$HOME/.strata/config.toml`; missing file means built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and initialize all databases.
    Init,

    /// Run the daemon in the foreground.
    Serve,

    /// Ask a running daemon to shut down gracefully.
    Stop,

    /// Check that the daemon answers.
    Ping,

    /// Daemon liveness and version.
    Health,

    /// Daemon, catalog, and queue status rollup.
    Status,

    /// Operation, system, GPU, and storage telemetry.
    Telemetry,

    /// Vector search over indexed chunks.
    Query {
        /// The query text.
        query: String,
        /// Maximum results.
        #[arg(long, default_value_t = 10)]
        k: usize,
    },

    /// List surfaced discoveries.
    Discoveries {
        /// Include dismissed discoveries.
        #[arg(long)]
        all: bool,
    },

    /// Confirm or dismiss a discovery.
    Feedback {
        /// Discovery id.
        id: String,
        /// `confirm` or `dismiss`.
        action: String,
        /// Optional notes stored with the feedback.
        #[arg(long)]
        notes: Option<String>,
    },

    /// List consolidated entities.
    Entities {
        /// Filter by type (PERSON, ORG, PROJECT, TECH, DATE, LOCATION).
        #[arg(long = "type")]
        entity_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// List detected patterns.
    Patterns {
        #[arg(long, default_value_t = 0.0)]
        min_confidence: f64,
    },

    /// Queue a correlation batch (or run it synchronously with --wait).
    Correlate {
        /// Run synchronously and print the result.
        #[arg(long)]
        wait: bool,
    },

    /// Enqueue a batch extraction over the configured sources.
    Excavate {
        /// Restrict to paths under this prefix.
        #[arg(long)]
        scope: Option<String>,
    },

    /// Job queue statistics.
    Jobs {
        /// Show the N most recent terminal jobs instead.
        #[arg(long)]
        recent: Option<usize>,
    },
}

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
        .join("config.toml")
}

/// Errors that map to the documented exit codes.
enum CliError {
    Unreachable(String),
    Other(anyhow::Error),
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e)
    }
}

struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    fn new(config: &Config) -> Self {
        Self {
            base: format!("http://{}/api/v1", config.server.bind),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, CliError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CliError::Unreachable(format!("cannot reach daemon at {}: {}", url, e)))?;
        parse_response(response).await
    }

    async fn post(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CliError> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.post(&url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req
            .send()
            .await
            .map_err(|e| CliError::Unreachable(format!("cannot reach daemon at {}: {}", url, e)))?;
        parse_response(response).await
    }
}

async fn parse_response(response: reqwest::Response) -> Result<serde_json::Value, CliError> {
    let status = response.status();
    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| CliError::Other(anyhow::anyhow!("invalid response: {}", e)))?;
    if status.is_success() {
        Ok(value)
    } else {
        Err(CliError::Other(anyhow::anyhow!(
            "daemon returned {}: {}",
            status,
            value
        )))
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{}", value),
    }
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    let file = std::fs::create_dir_all(&config.storage.data_dir)
        .ok()
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.storage.log_path())
                .ok()
        });

    match file {
        Some(file) => registry
            .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
            .init(),
        None => registry.init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = config::load_config_or_default(&config_path).map_err(CliError::Other)?;

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(config.storage.vectors_dir())
                .map_err(|e| CliError::Other(e.into()))?;

            let catalog = strata::db::connect(&config.storage.catalog_path()).await?;
            strata::migrate::migrate_catalog(&catalog).await?;
            catalog.close().await;

            let jobs = strata::db::connect(&config.storage.jobs_path()).await?;
            strata::migrate::migrate_jobs(&jobs).await?;
            jobs.close().await;

            let vectors = strata::db::connect(&config.storage.vectors_path()).await?;
            strata::migrate::migrate_vectors(&vectors).await?;
            vectors.close().await;

            println!(
                "Data directory initialized: {}",
                config.storage.data_dir.display()
            );
        }

        Commands::Serve => {
            init_logging(&config);
            strata::daemon::run(config).await?;
        }

        Commands::Stop => {
            let value = Client::new(&config).post("/shutdown", None).await?;
            print_json(&value);
        }

        Commands::Ping => {
            Client::new(&config).get("/health").await?;
            println!("pong");
        }

        Commands::Health => {
            let value = Client::new(&config).get("/health").await?;
            print_json(&value);
        }

        Commands::Status => {
            let value = Client::new(&config).get("/status").await?;
            print_json(&value);
        }

        Commands::Telemetry => {
            let value = Client::new(&config).get("/telemetry").await?;
            print_json(&value);
        }

        Commands::Query { query, k } => {
            let path = format!(
                "/query?q={}&k={}",
                urlencode(&query),
                k
            );
            let value = Client::new(&config).get(&path).await?;
            print_json(&value);
        }

        Commands::Discoveries { all } => {
            let path = if all {
                "/discoveries?include_dismissed=true"
            } else {
                "/discoveries"
            };
            let value = Client::new(&config).get(path).await?;
            print_json(&value);
        }

        Commands::Feedback { id, action, notes } => {
            let body = serde_json::json!({ "action": action, "notes": notes });
            let value = Client::new(&config)
                .post(&format!("/discoveries/{}/feedback", id), Some(body))
                .await?;
            print_json(&value);
        }

        Commands::Entities { entity_type, limit } => {
            let mut path = format!("/entities?limit={}", limit);
            if let Some(t) = entity_type {
                path.push_str(&format!("&type={}", urlencode(&t)));
            }
            let value = Client::new(&config).get(&path).await?;
            print_json(&value);
        }

        Commands::Patterns { min_confidence } => {
            let path = format!("/patterns?min_confidence={}", min_confidence);
            let value = Client::new(&config).get(&path).await?;
            print_json(&value);
        }

        Commands::Correlate { wait } => {
            let client = Client::new(&config);
            let value = if wait {
                client.post("/correlate/run", None).await?
            } else {
                client.post("/correlate", None).await?
            };
            print_json(&value);
        }

        Commands::Excavate { scope } => {
            let body = scope.map(|s| serde_json::json!({ "scope": s }));
            let value = Client::new(&config).post("/excavate", body).await?;
            print_json(&value);
        }

        Commands::Jobs { recent } => {
            let client = Client::new(&config);
            let value = match recent {
                Some(n) => client.get(&format!("/jobs/recent?limit={}", n)).await?,
                None => client.get("/jobs").await?,
            };
            print_json(&value);
        }
    }

    Ok(())
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(CliError::Unreachable(message)) => {
            eprintln!("error: {}", message);
            std::process::exit(2);
        }
        Err(CliError::Other(e)) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}
