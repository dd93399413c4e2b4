mod source;
mod terminal;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use runbox_core::{ClientConfig, Language};
use runbox_executor::{HttpFallback, SnippetClient};
use runbox_session::{OrchestratorOptions, RunController, SessionOrchestrator, storage::MemoryStorage};
use runbox_transport::{Connector, StreamTransport, WebSocketConnector};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::{source::SourceBuffer, terminal::ConsoleTerminal};

const DEFAULT_CONFIG: &str = "runbox.toml";

/// Run code on a remote sandbox and stream its output.
#[derive(Parser)]
#[command(name = "runbox", version, about, long_about = None)]
struct Cli {
    /// Config file (TOML). Defaults to ./runbox.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// STOMP WebSocket endpoint. Empty disables streaming.
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Base URL of the HTTP API.
    #[arg(long, global = true)]
    api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a file or a shared snippet
    Run {
        /// Source file to run
        #[arg(required_unless_present = "share")]
        file: Option<PathBuf>,

        /// Language (python, javascript). Inferred from the extension when omitted.
        #[arg(short, long)]
        language: Option<Language>,

        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// Run the snippet shared under this id instead of a file
        #[arg(long, conflicts_with = "file")]
        share: Option<String>,

        /// Skip streaming and use the synchronous API
        #[arg(long)]
        no_stream: bool,
    },
    /// Check that the API and broker are reachable
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Run {
            file,
            language,
            stdin_file,
            share,
            no_stream,
        } => {
            let source = Source {
                file,
                share,
                language,
                stdin_file,
            };
            run(config, source, no_stream).await
        }
        Commands::Health => health(&config).await,
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG).is_file() => ClientConfig::load(Path::new(DEFAULT_CONFIG))?,
        None => ClientConfig::default(),
    }
    .with_env_overrides();

    if let Some(broker) = &cli.broker {
        config.broker_url.clone_from(broker);
    }
    if let Some(api) = &cli.api {
        config.api_base_url.clone_from(api);
    }
    Ok(config)
}

struct Source {
    file: Option<PathBuf>,
    share: Option<String>,
    language: Option<Language>,
    stdin_file: Option<PathBuf>,
}

impl Source {
    async fn load(self, snippets: &SnippetClient) -> Result<(SourceBuffer, Option<String>)> {
        let buffer = match (self.share, self.file) {
            (Some(share_id), _) => {
                let snippet = snippets
                    .fetch_shared(&share_id)
                    .await
                    .with_context(|| format!("Failed to fetch snippet {share_id}"))?
                    .ok_or_else(|| anyhow!("No snippet is shared as {share_id}"))?;
                info!(share_id = %share_id, title = %snippet.title, "running shared snippet");
                SourceBuffer::from_snippet(snippet, self.language)
            }
            (None, Some(path)) => SourceBuffer::from_file(&path, self.language)?,
            (None, None) => return Err(anyhow!("Nothing to run: pass a file or --share")),
        };
        let stdin = self
            .stdin_file
            .map(|path| {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))
            })
            .transpose()?;
        Ok((buffer, stdin))
    }
}

async fn run(config: ClientConfig, source: Source, no_stream: bool) -> Result<ExitCode> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let (buffer, stdin) = source
        .load(&SnippetClient::new(http.clone(), &config.api_base_url))
        .await?;

    let transport = (!no_stream && config.streaming_enabled()).then(|| {
        let connector = WebSocketConnector::new(&config.broker_url, config.connect_timeout());
        let transport = StreamTransport::new(connector, config.reconnect_delay());
        transport.activate();
        transport
    });
    let mut options = OrchestratorOptions::from_config(&config);
    // A one-shot run must not wait forever on an unreachable broker.
    options.queue_timeout.get_or_insert(config.connect_timeout());

    let orchestrator = SessionOrchestrator::new(
        transport,
        MemoryStorage::new(),
        HttpFallback::with_client(http, &config.api_base_url),
        options,
    );
    let terminal = Arc::new(ConsoleTerminal::stdio());
    let controller = RunController::new(Arc::new(orchestrator), terminal);

    let Some(relay) = controller.run_from_editor(&buffer, stdin).await else {
        return Ok(ExitCode::from(2));
    };

    let interrupted = tokio::select! {
        result = relay => {
            result.context("Output relay failed")?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        controller.shutdown();
        return Ok(ExitCode::from(130));
    }
    if let Some(transport) = controller.orchestrator().transport() {
        transport.deactivate();
    }

    let state = controller.state();
    let Some(code) = state.last_exit_code else {
        return Ok(ExitCode::FAILURE);
    };
    eprintln!(
        "[exit {code} in {} ms]",
        state.last_execution_time_ms.unwrap_or_default()
    );
    Ok(ExitCode::from(exit_status(code)))
}

/// Process status for a program exit code. Out-of-range codes map to 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn health(config: &ClientConfig) -> Result<ExitCode> {
    let fallback = HttpFallback::new(&config.api_base_url, config.request_timeout())?;
    let api_ok = match fallback.health().await {
        Ok(()) => {
            println!("api     {}  ok", config.api_base_url);
            true
        }
        Err(e) => {
            println!("api     {}  unreachable ({e})", config.api_base_url);
            false
        }
    };

    if config.streaming_enabled() {
        let connector = WebSocketConnector::new(&config.broker_url, config.connect_timeout());
        match connector.connect().await {
            Ok(_link) => println!("broker  {}  ok", config.broker_url),
            Err(e) => println!("broker  {}  unreachable ({e})", config.broker_url),
        }
    } else {
        println!("broker  disabled");
    }

    Ok(if api_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
