use clap::{Parser, Subcommand};
use codeharness::config::AppConfig;
use codeharness::connection::Timeouts;
use codeharness::eager::EagerPromptQueue;
use codeharness::execution::{ExecOutcome, ExecRequest, ExecutionEngine, Phase};
use codeharness::history::HistoryStore;
use codeharness::manager::ConnectionManager;
use serde_json::Value;
use std::error::Error;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "codeharness",
    version,
    about = "Tool-server and code-execution runtime for coding agents"
)]
struct Cli {
    /// Path to the harness configuration file.
    #[arg(long)]
    config: Option<String>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List every tool advertised by the configured servers.
    Tools,
    /// Invoke one tool and print its result.
    Call {
        /// Tool name, optionally qualified as `server/tool`.
        tool: String,
        /// Route through a specific connection or capability pool.
        #[arg(long)]
        server: Option<String>,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        arguments: String,
    },
    /// Execute code under a runtime, following background output to the end.
    Exec {
        #[arg(long, default_value = "python")]
        runtime: String,
        /// Read the code from a file instead of the command line.
        #[arg(long)]
        file: Option<String>,
        /// Override the synchronous capture window in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        code: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    info!(servers = config.servers.len(), "starting harness");

    let history = Arc::new(HistoryStore::new(config.history.clone()));
    let manager = Arc::new(
        ConnectionManager::start(&config.servers, Timeouts::default(), Arc::clone(&history))
            .await,
    );

    let outcome = run(cli.command, Arc::clone(&manager), history, &config).await;
    manager.shutdown().await;
    outcome
}

async fn run(
    command: CliCommand,
    manager: Arc<ConnectionManager>,
    history: Arc<HistoryStore>,
    config: &AppConfig,
) -> Result<(), Box<dyn Error>> {
    match command {
        CliCommand::Tools => {
            for tool in manager.list_all_tools().await {
                match &tool.descriptor.description {
                    Some(text) => {
                        println!("{}/{}: {text}", tool.server, tool.descriptor.name)
                    }
                    None => println!("{}/{}", tool.server, tool.descriptor.name),
                }
            }
            Ok(())
        }
        CliCommand::Call {
            tool,
            server,
            arguments,
        } => {
            let arguments: Value = serde_json::from_str(&arguments)?;
            let (target, tool) = match server {
                Some(server) => (server, tool),
                None => manager.resolve_tool(&tool).await?,
            };
            let result = manager.call(&target, &tool, arguments).await?;
            println!("{result}");
            Ok(())
        }
        CliCommand::Exec {
            runtime,
            file,
            timeout_ms,
            code,
        } => {
            let code = read_code(file.as_deref(), &code)?;
            let queue = Arc::new(EagerPromptQueue::new());
            let engine = ExecutionEngine::new(
                manager,
                Arc::clone(&queue),
                history,
                config.execution.clone(),
            );
            let request = ExecRequest {
                code,
                runtime,
                timeout_ms,
            };
            match engine.execute(request).await? {
                ExecOutcome::Completed(report) => finish(report),
                ExecOutcome::Handover {
                    execution_id,
                    output_so_far,
                } => {
                    print!("{output_so_far}");
                    eprintln!("[execution {execution_id} continues in the background]");
                    follow(&engine, &queue, &execution_id).await
                }
            }
        }
    }
}

/// Poll a handed-over execution to completion, relaying background prompts
/// and output deltas as they arrive.
async fn follow(
    engine: &ExecutionEngine,
    queue: &EagerPromptQueue,
    execution_id: &str,
) -> Result<(), Box<dyn Error>> {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        for prompt in queue.drain() {
            print!("{}", prompt.log_delta);
            eprintln!("[{}]", prompt.message);
        }
        let Some(status) = engine.status(execution_id) else {
            return Err(format!("execution '{execution_id}' disappeared").into());
        };
        print!("{}", status.new_output);
        match status.phase {
            Phase::Completed => return Ok(()),
            Phase::Failed => {
                return Err(format!(
                    "execution '{execution_id}' failed with exit code {:?}",
                    status.exit_code
                )
                .into());
            }
            Phase::Synchronous | Phase::Backgrounded => {}
        }
    }
}

fn finish(report: codeharness::execution::ExecReport) -> Result<(), Box<dyn Error>> {
    print!("{}", report.output);
    if report.success {
        return Ok(());
    }
    if !report.error.is_empty() {
        eprintln!("{}", report.error.trim_end());
    }
    Err(format!(
        "execution '{}' failed with exit code {:?}",
        report.execution_id, report.exit_code
    )
    .into())
}

fn read_code(file: Option<&str>, inline: &[String]) -> Result<String, Box<dyn Error>> {
    if let Some(path) = file {
        return Ok(fs::read_to_string(path)?);
    }
    if !inline.is_empty() {
        return Ok(inline.join(" "));
    }
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer)
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
