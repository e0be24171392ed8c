//! `conductor` command-line entry point.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

use conductor::agent::{AgentRef, AgentRegistry, ExecutorDeps, TaskExecutor};
use conductor::bus::{InMemoryBroker, RealtimeBus, Topic};
use conductor::config::Config;
use conductor::error::SessionError;
use conductor::llm::ProviderSet;
use conductor::orchestrator::{Network, NetworkDeps};
use conductor::sandbox::LocalSandbox;
use conductor::session::SessionManager;
use conductor::store::InMemoryStore;
use conductor::tools::{ToolRegistry, ToolRunner};

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Run sandboxed coding agents and agent networks")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task with one agent
    Task {
        /// System agent id
        #[arg(short, long, default_value = "coder")]
        agent: String,

        /// Workspace directory the agent works in
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Print realtime events to stderr
        #[arg(long)]
        events: bool,

        /// What the agent should do
        input: String,
    },

    /// Run an instruction through the orchestration network
    Network {
        #[arg(short, long, default_value = "local")]
        team: String,

        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        #[arg(long)]
        events: bool,

        instruction: String,
    },

    /// Open an interactive session and forward stdin lines to it
    Session {
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Sent as the first message after the session starts
        #[arg(long)]
        context: Option<String>,
    },

    /// List the system agents
    Agents,

    /// Mint a read-only subscription token
    Token {
        /// Workspace channel
        channel: String,

        /// Topics to grant (messages, status, file-change, terminal-output)
        #[arg(short, long = "topic", default_values_t = vec!["messages".to_string(), "status".to_string()])]
        topics: Vec<String>,
    },

    /// Serve the realtime SSE endpoint
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: SocketAddr,
    },
}

/// Everything a local run needs, wired together.
struct Engine {
    config: Config,
    bus: Arc<RealtimeBus>,
    sandbox: Arc<LocalSandbox>,
    executor: Arc<TaskExecutor>,
}

impl Engine {
    fn build(config: Config, root: PathBuf) -> anyhow::Result<Self> {
        let registry = AgentRegistry::load(
            &config.network.default_model,
            config.agents_dir.as_deref(),
        )
        .context("loading agent definitions")?;
        let bus = Arc::new(RealtimeBus::new(
            Arc::new(InMemoryBroker::new()),
            config.bus.clone(),
        ));
        let sandbox = Arc::new(LocalSandbox::with_root(root));
        let executor = Arc::new(TaskExecutor::new(ExecutorDeps {
            providers: Arc::new(ProviderSet::from_config(&config.llm, &config.rate_limit)),
            tools: ToolRunner::new(Arc::new(ToolRegistry::with_builtins())),
            sandbox: sandbox.clone(),
            store: Arc::new(InMemoryStore::new()),
            registry: Arc::new(registry),
            bus: Some(bus.clone()),
            config: config.executor.clone(),
        }));
        Ok(Self {
            config,
            bus,
            sandbox,
            executor,
        })
    }

    /// Print every event on a workspace channel to stderr.
    async fn echo_events(&self, workspace: &str) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let token = self
            .bus
            .issue_token(workspace, &[Topic::Messages, Topic::Status]);
        let mut sub = self.bus.subscribe(&token).await?;
        Ok(tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                eprintln!("[{}] {}", msg.topic, msg.payload);
            }
        }))
    }
}

fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conductor=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Command::Task {
            agent,
            root,
            events,
            input,
        } => {
            let engine = Engine::build(config, root)?;
            let workspace = Uuid::new_v4().to_string();
            let printer = if events {
                Some(engine.echo_events(&workspace).await?)
            } else {
                None
            };

            let task = engine
                .executor
                .submit(AgentRef::System(agent), &workspace, &input)
                .await?;
            let result = engine.executor.run_task(task.id).await;
            if let Some(printer) = printer {
                printer.abort();
            }
            println!("{}", result?);
        }

        Command::Network {
            team,
            root,
            events,
            instruction,
        } => {
            let engine = Engine::build(config, root)?;
            let workspace = Uuid::new_v4().to_string();
            let printer = if events {
                Some(engine.echo_events(&workspace).await?)
            } else {
                None
            };

            let network = Network::new(NetworkDeps {
                executor: engine.executor.clone(),
                bus: engine.bus.clone(),
                config: engine.config.network.clone(),
            });
            let result = network.run(&team, &workspace, &instruction).await;
            if let Some(printer) = printer {
                printer.abort();
            }
            let run = result?;
            tracing::info!(
                "Execution {} stopped after {} turns ({})",
                run.execution_id,
                run.turns,
                run.stop.as_str()
            );
            println!("{}", run.output);
        }

        Command::Session { root, context } => {
            let engine = Engine::build(config, root)?;
            let workspace = Uuid::new_v4().to_string();
            let manager =
                SessionManager::new(engine.sandbox.clone(), engine.bus.clone(), engine.config.session.clone());

            let token = engine
                .bus
                .issue_token(&workspace, &[Topic::TerminalOutput]);
            let mut output = engine.bus.subscribe(&token).await?;
            let printer = tokio::spawn(async move {
                let mut stdout = std::io::stdout();
                while let Some(msg) = output.next().await {
                    if let Some(chunk) = msg.payload.as_str() {
                        let _ = stdout.write_all(chunk.as_bytes());
                        let _ = stdout.flush();
                    }
                }
            });

            manager.start(&workspace).await?;
            if let Some(context) = context {
                manager.send(&workspace, &context).await?;
            }

            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                match manager.send(&workspace, &line).await {
                    Ok(()) => {}
                    Err(SessionError::SessionExpired(_)) => {
                        eprintln!("session ended");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            manager.shutdown().await;
            printer.abort();
        }

        Command::Agents => {
            let registry = AgentRegistry::load(
                &config.network.default_model,
                config.agents_dir.as_deref(),
            )?;
            for agent in registry.all() {
                println!(
                    "{:<14} {:<10} {:<24} {}",
                    agent.reference.to_string().trim_start_matches("system:"),
                    agent.provider,
                    agent.model,
                    agent.role
                );
            }
        }

        Command::Token { channel, topics } => {
            let topics: Vec<Topic> = topics.into_iter().map(Topic::from).collect();
            let bus = RealtimeBus::new(Arc::new(InMemoryBroker::new()), config.bus);
            println!("{}", bus.issue_token(&channel, &topics));
        }

        Command::Serve { addr } => {
            let bus = Arc::new(RealtimeBus::new(
                Arc::new(InMemoryBroker::new()),
                config.bus,
            ));
            conductor::bus::sse::serve(bus, addr)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }
    }

    Ok(())
}
