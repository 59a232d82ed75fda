// Relay CLI - run commands on many hosts over SSH

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use relay::config::{EngineConfig, RuntimeDefaults};
use relay::executor::{BatchDispatcher, SshConnector};
use relay::output::{create_progress_channel, OutputFormat, OutputWriter};
use relay::request::{LimitValue, OneOrMany, RawRequest};

#[derive(Parser)]
#[command(
    name = "relay",
    about = "Run shell commands on many hosts over SSH",
    version,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (stream command output, debug logs)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show the recap and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,

    /// YAML config file with connection defaults
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run commands on one or more hosts
    Run {
        /// Comma-separated host list
        #[arg(short = 'H', long)]
        hosts: Option<String>,

        /// Command to run (repeat for several, run in order)
        #[arg(short, long = "command")]
        commands: Vec<String>,

        /// File with one command per line
        #[arg(long)]
        script: Option<PathBuf>,

        /// JSON request file (same fields as the HTTP payload)
        #[arg(long, conflicts_with_all = ["hosts", "commands", "script"])]
        request: Option<PathBuf>,

        /// Maximum hosts in flight
        #[arg(short, long)]
        limit: Option<usize>,

        /// SSH port of the target hosts
        #[arg(short, long)]
        port: Option<u16>,

        /// Jump host to tunnel through
        #[arg(short, long)]
        tunnel: Option<String>,

        /// SSH user
        #[arg(short, long, env = "RELAY_SSH_USERNAME")]
        user: Option<String>,

        /// Default SSH password (insecure - prefer --ask-pass)
        #[arg(long, env = "RELAY_SSH_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Prompt for SSH password
        #[arg(short = 'k', long)]
        ask_pass: bool,

        /// Path to SSH private key for this run
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Default private key text
        #[arg(long, env = "RELAY_SSH_KEY", hide_env_values = true)]
        ssh_key: Option<String>,

        /// Default private key file
        #[arg(long, env = "RELAY_SSH_KEY_FILE")]
        ssh_key_file: Option<PathBuf>,

        /// SSH agent socket
        #[arg(long, env = "SSH_AUTH_SOCK", hide_env_values = true)]
        ssh_auth_sock: Option<String>,

        /// Forward the SSH agent to target hosts
        #[arg(short = 'A', long)]
        forward_agent: bool,

        /// SSH connection timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "relay=debug" } else { "relay=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output_format = OutputFormat::from_str(&cli.output_format).unwrap_or_else(|_| {
        eprintln!("Invalid output format: {}. Using 'text'.", cli.output_format);
        OutputFormat::Text
    });

    let result = match cli.command {
        Commands::Run { .. } => run(cli, output_format).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {:#}", "ERROR".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, output_format: OutputFormat) -> Result<i32> {
    let Commands::Run {
        hosts,
        commands,
        script,
        request,
        limit,
        port,
        tunnel,
        user,
        password,
        ask_pass,
        private_key,
        ssh_key,
        ssh_key_file,
        ssh_auth_sock,
        forward_agent,
        timeout,
    } = cli.command;

    let file_config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let config = file_config.merge(EngineConfig {
        ssh_username: user.clone(),
        ssh_password: password,
        ssh_key,
        ssh_key_file,
        ssh_auth_sock,
        connect_timeout_secs: timeout,
        ..Default::default()
    });
    let defaults = RuntimeDefaults::resolve(&config);
    tracing::debug!(?defaults, "resolved defaults");

    let mut raw = match request {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read request {}", path.display()))?;
            serde_json::from_str::<RawRequest>(&content)
                .with_context(|| format!("invalid request {}", path.display()))?
        }
        None => {
            let script = match script {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read script {}", path.display()))?,
                ),
                None => None,
            };
            RawRequest {
                hosts: hosts.map(OneOrMany::One),
                commands: (!commands.is_empty()).then_some(OneOrMany::Many(commands)),
                script: script.map(OneOrMany::One),
                ..Default::default()
            }
        }
    };

    // Flags win over the request file
    if user.is_some() {
        raw.username = user;
    }
    if let Some(limit) = limit {
        raw.limit = Some(LimitValue::Number(limit as i64));
    }
    raw.port = port.or(raw.port);
    raw.tunnel = tunnel.or(raw.tunnel);
    raw.private_key_file = private_key.or(raw.private_key_file);
    if forward_agent {
        raw.agent_forward = Some(true);
    }
    if ask_pass {
        raw.password =
            Some(rpassword::prompt_password("SSH password: ").context("failed to read password")?);
    }

    let batch_request = raw.into_batch(&defaults)?;
    if batch_request.commands.is_empty() {
        anyhow::bail!("no commands given; use --command, --script or --request");
    }

    let output = Arc::new(OutputWriter::new(output_format, cli.verbose, cli.quiet));
    output.print_batch_header(
        batch_request.hosts.len(),
        batch_request.commands.len(),
        batch_request.options.tunnel.as_ref().map(|t| t.host.as_str()),
    );

    let bar = output.create_batch_progress(batch_request.hosts.len());
    let (emitter, mut events) = create_progress_channel();
    let printer = {
        let output = output.clone();
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                output.print_progress(&bar, &event);
            }
        })
    };

    let dispatcher =
        BatchDispatcher::new(Arc::new(SshConnector::new())).with_progress(Arc::new(emitter));
    let batch = dispatcher.dispatch(batch_request).await?;

    // Dropping the dispatcher drops the last emitter and ends the printer
    drop(dispatcher);
    let _ = printer.await;
    bar.finish_and_clear();

    output.print_batch(&batch);
    Ok(if batch.all_ok() { 0 } else { 2 })
}
