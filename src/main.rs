use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waav_realtime::ClientConfig;
use waav_realtime::core::descriptor::{ingest, lint, load_descriptors};
use waav_realtime::core::executor::{
    ChannelUiHook, DirectEgress, HttpToolExecutor, ProxyEgress, ToolEgress, UiEvent,
    install_tenant_tools,
};
use waav_realtime::core::realtime::transport::TransportKind;
use waav_realtime::core::realtime::{
    ConversationItem, HttpTokenProvider, RealtimeSession, SessionConfig, StaticTokenProvider,
    TokenProvider, WebSocketTransport,
};
use waav_realtime::core::registry::ToolRegistry;
use waav_realtime::core::template::EnvSecrets;

/// Prefix of environment variables holding tenant secrets for direct egress
const SECRET_ENV_PREFIX: &str = "WAAV_SECRET_";

/// WaaV Realtime - realtime session client with templated HTTP tools
#[derive(Parser, Debug)]
#[command(name = "waav-realtime")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lint a descriptor file (JSON or YAML) and print the results as JSON
    Lint {
        file: PathBuf,

        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },

    /// Run a text-mode session over WebSocket
    Session {
        /// Descriptor file with the tenant's tools (overrides config)
        #[arg(short = 't', long = "tools", value_name = "FILE")]
        tools: Option<PathBuf>,

        /// Use this ephemeral token instead of the token endpoint
        #[arg(long, env = "REALTIME_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Wait for the user instead of letting the agent speak first
        #[arg(long)]
        quiet_start: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Initialize crypto provider for TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Lint { file, pretty } => run_lint(file, pretty),
        Commands::Session {
            tools,
            token,
            quiet_start,
        } => {
            let config = match &cli.config {
                Some(path) => ClientConfig::from_file(path)?,
                None => ClientConfig::from_env()?,
            };
            run_session(config, tools, token, quiet_start).await
        }
    }
}

fn run_lint(file: PathBuf, pretty: bool) -> anyhow::Result<()> {
    let descriptors = load_descriptors(&file)?;
    let results = lint(&descriptors);
    let output = if pretty {
        serde_json::to_string_pretty(&results)?
    } else {
        serde_json::to_string(&results)?
    };
    println!("{}", output);

    let failed = results.iter().filter(|r| r.has_errors()).count();
    if failed > 0 {
        bail!("{} of {} descriptors have errors", failed, results.len());
    }
    Ok(())
}

async fn run_session(
    config: ClientConfig,
    tools_path: Option<PathBuf>,
    token: Option<String>,
    quiet_start: bool,
) -> anyhow::Result<()> {
    if config.transport != TransportKind::WebSocket {
        bail!("the CLI only drives the websocket transport; set REALTIME_TRANSPORT=websocket");
    }

    let tokens: Arc<dyn TokenProvider> = match (token, &config.token_endpoint) {
        (Some(token), _) => Arc::new(StaticTokenProvider::new(token)),
        (None, Some(endpoint)) => {
            let mut provider = HttpTokenProvider::new(endpoint.clone())
                .with_body(serde_json::json!({"model": config.model}));
            if let Some(key) = &config.token_api_key {
                provider = provider.with_bearer(key.clone());
            }
            Arc::new(provider)
        }
        (None, None) => bail!("set TOKEN_ENDPOINT or pass --token"),
    };

    // Tool pipeline
    let egress: Arc<dyn ToolEgress> = match &config.proxy_url {
        Some(url) => {
            let mut proxy = ProxyEgress::new(url.clone())?;
            if let Some(token) = &config.proxy_token {
                proxy = proxy.with_bearer(token.clone());
            }
            if let Some(tenant) = &config.tenant_id {
                proxy = proxy.with_tenant(tenant.clone());
            }
            Arc::new(proxy)
        }
        None => {
            warn!("No tool proxy configured, tools call upstream APIs directly");
            Arc::new(DirectEgress::new(config.url_policy())?)
        }
    };
    let (ui_hook, mut ui_events) = ChannelUiHook::new();
    let mut executor = HttpToolExecutor::new(egress)
        .with_secrets(Arc::new(EnvSecrets::new(SECRET_ENV_PREFIX)))
        .with_ui_hook(Arc::new(ui_hook))
        .with_url_policy(config.url_policy());
    if let Some(tenant) = &config.tenant_id {
        executor = executor.with_tenant(tenant.clone());
    }
    if let Some(timeout) = config.tool_timeout {
        executor = executor.with_default_timeout(timeout);
    }

    let registry = ToolRegistry::new();
    let _mirror = registry.publish_to_mirror();
    let mut definitions = Vec::new();
    if let Some(path) = tools_path.or_else(|| config.descriptors_path.clone()) {
        let raw = load_descriptors(&path)
            .with_context(|| format!("loading tools from {}", path.display()))?;
        let ingested = ingest(&raw);
        for result in ingested.rejected() {
            for issue in result.errors() {
                warn!(descriptor = ?result.name, "{}", issue);
            }
        }
        definitions = install_tenant_tools(&registry, &executor, &ingested.tools, &config.tool_prefix);
    }

    let mut options = config.session_options();
    options.capture_audio = false;
    options.agent_speaks_first = !quiet_start;
    options.agent.modalities = Some(vec!["text".to_string()]);

    let session = RealtimeSession::builder(options)
        .transport(Arc::new(WebSocketTransport::new()))
        .token_provider(tokens)
        .registry(registry)
        .build()?;

    let (conv_tx, mut conv_rx) = mpsc::unbounded_channel::<Vec<ConversationItem>>();
    session.on_conversation(Arc::new(move |items| {
        let conv_tx = conv_tx.clone();
        Box::pin(async move {
            let _ = conv_tx.send(items);
        })
    }));
    session.on_error(Arc::new(|err| {
        Box::pin(async move {
            eprintln!("! {}", err);
        })
    }));

    if !definitions.is_empty() {
        session
            .update_session(SessionConfig {
                tools: Some(definitions),
                tool_choice: Some(serde_json::json!("auto")),
                ..Default::default()
            })
            .await?;
    }

    session.connect().await?;
    info!(session_id = session.id(), "Session ready, type a message (/quit to exit)");

    let printer = tokio::spawn(async move {
        let mut printed = HashSet::new();
        loop {
            tokio::select! {
                Some(items) = conv_rx.recv() => {
                    for item in items.iter().filter(|i| i.is_final) {
                        if printed.insert(item.id.clone()) {
                            println!("[{}] {}", item.role, item.text);
                        }
                    }
                }
                Some(event) = ui_events.recv() => {
                    if let UiEvent::Loading { tool, message } = &event {
                        println!("({}) {}", tool, message);
                    } else if let Ok(json) = serde_json::to_string(&event) {
                        println!("(ui) {}", json);
                    }
                }
                else => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                session.send_text(line).await?;
                session.create_response().await?;
            }
        }
    }

    session.disconnect();
    printer.abort();
    Ok(())
}
