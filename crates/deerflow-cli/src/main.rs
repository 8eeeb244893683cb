use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deerflow_agent::{
    AgentAction, AgentFactory, EventKind, EventStream, MessageOutput, RequestOptions, ResumeState,
    Runner, feedback_message,
};
use deerflow_core::config::{Config, LoggingConfig};
use deerflow_core::prompts::PromptStore;
use deerflow_core::types::{Message, Role, concat_messages};
use deerflow_gateway::GatewayState;
use deerflow_providers::ConfiguredModels;
use deerflow_tools::{StdioToolProvider, ToolProvider, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "deerflow",
    about = "Multi-agent deep research: a coordinator, its planner, researchers and writers, \
             streamed over HTTP",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: conf/deer-go.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Prompt template directory
    #[arg(short, long, global = true, default_value = "prompts")]
    prompts: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: PORT, then server.port, then 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one request in the console
    Chat {
        /// Request to run (omit to be asked)
        #[arg(short, long)]
        message: Option<String>,

        /// Accept the plan without asking
        #[arg(long)]
        auto_accept: bool,
    },
}

const MISSING_CREDENTIALS: &str = "Please set OPENAI_API_KEY or ARK_API_KEY environment variable.";

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        logging.and_then(|l| l.level.as_deref()).unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(level);
        for directive in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
            }
        }
        filter
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.is_some_and(|l| l.format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Bring up every configured stdio tool provider. Failures are logged and skipped.
async fn start_tool_providers(config: &Config) -> BTreeMap<String, Arc<dyn ToolProvider>> {
    let mut providers: BTreeMap<String, Arc<dyn ToolProvider>> = BTreeMap::new();
    for (name, server) in &config.mcp.servers {
        let provider = StdioToolProvider::new(name.clone(), server.clone());
        match provider.initialize().await {
            Ok(()) => {
                info!(server = %name, "Tool provider initialized");
                providers.insert(name.clone(), Arc::new(provider));
            }
            Err(e) => warn!(server = %name, %e, "Failed to initialize tool provider, skipping"),
        }
    }
    providers
}

async fn close_tool_providers(providers: &BTreeMap<String, Arc<dyn ToolProvider>>) {
    for provider in providers.values() {
        if let Err(e) = provider.close().await {
            warn!(server = %provider.name(), %e, "Failed to close tool provider");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    init_logging(config.logging.as_ref(), cli.verbose);
    info!(path = %config_path.display(), "Loaded config");

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }

    let prompts = PromptStore::load_dir(&cli.prompts)?;
    info!(templates = prompts.len(), dir = %cli.prompts.display(), "Loaded prompt templates");

    let providers = start_tool_providers(&config).await;
    let registry = ToolRegistry::build(&providers).await;
    info!(
        research = registry.research_tools().len(),
        execution = registry.execution_tools().len(),
        "Tool registry ready"
    );

    let models = ConfiguredModels::new(config.resolve_model());
    let factory = Arc::new(AgentFactory::new(
        Arc::new(prompts),
        Arc::new(registry),
        Arc::new(models),
        config.setting.clone(),
    ));

    let result = match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.listen_addr().1);
            let state = Arc::new(GatewayState::new(Arc::new(config), factory));
            deerflow_gateway::start_gateway(state, port).await
        }
        Commands::Chat { message, auto_accept } => run_console(factory, message, auto_accept).await,
    };

    close_tool_providers(&providers).await;
    result
}

async fn prompt_line(lines: &mut Lines<BufReader<Stdin>>, prompt: &str) -> anyhow::Result<String> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?.unwrap_or_default().trim().to_string())
}

async fn run_console(
    factory: Arc<AgentFactory>,
    message: Option<String>,
    auto_accept: bool,
) -> anyhow::Result<()> {
    if !factory.has_credentials() {
        println!("{MISSING_CREDENTIALS}");
        return Ok(());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let query = match message {
        Some(message) => message,
        None => prompt_line(&mut stdin, "Enter your request: ").await?,
    };
    if query.is_empty() {
        return Ok(());
    }
    println!("--------------------------------------------------");

    let options = RequestOptions {
        auto_accepted_plan: auto_accept,
        ..Default::default()
    };
    let runner = Runner::new(factory.build(&options)?);
    let cancel = CancellationToken::new();
    let mut events = runner.query(&query, cancel.clone());

    loop {
        let Some(resume) = print_events(events).await else {
            return Ok(());
        };
        let answer = prompt_line(&mut stdin, "Accept the plan? [y]es / [e]dit <comment>: ").await?;
        let (choice, comment) = answer.split_once(' ').unwrap_or((answer.as_str(), ""));
        let feedback = if choice.to_lowercase().starts_with('e') {
            feedback_message("edit_plan", comment)
        } else {
            feedback_message("accepted", comment)
        };
        events = runner.resume(resume, feedback, cancel.clone());
    }
}

fn print_message(agent: &str, message: &Message) {
    if !message.content.is_empty() {
        match message.role {
            Role::Tool => println!("[{agent}] tool result: {}", message.content),
            _ => println!("[{agent}] {}", message.content),
        }
    }
    for call in &message.tool_calls {
        println!("[{agent}] tool call: {}({})", call.name(), call.arguments());
    }
}

/// Print a run as it happens. Returns the resume state if the run stopped for approval.
async fn print_events(mut events: EventStream) -> Option<ResumeState> {
    let mut suspended = None;
    while let Some(event) = events.next_event().await {
        let agent = event.agent_name;
        match event.kind {
            EventKind::Output(MessageOutput::Message(message)) => print_message(&agent, &message),
            EventKind::Output(MessageOutput::Stream(mut chunks)) => {
                let mut collected = Vec::new();
                let mut started = false;
                while let Some(chunk) = chunks.recv().await {
                    match chunk {
                        Ok(chunk) => {
                            if !chunk.content.is_empty() {
                                if !started {
                                    print!("[{agent}] ");
                                    started = true;
                                }
                                print!("{}", chunk.content);
                                let _ = std::io::stdout().flush();
                            }
                            collected.push(chunk);
                        }
                        Err(e) => {
                            println!("\n[{agent}] error: {e}");
                            break;
                        }
                    }
                }
                if started {
                    println!();
                }
                let message = concat_messages(&collected);
                for call in &message.tool_calls {
                    println!("[{agent}] tool call: {}({})", call.name(), call.arguments());
                }
            }
            EventKind::Action(AgentAction::TransferToAgent { dest }) => {
                println!("[{agent}] -> {dest}");
            }
            EventKind::Action(AgentAction::Exit) => println!("[{agent}] done"),
            EventKind::Action(AgentAction::Interrupted(interrupt)) => {
                for context in &interrupt.contexts {
                    if let Some(plan) = context.info.get("plan").and_then(|p| p.as_str()) {
                        println!("\n=== Plan for approval ===\n{plan}\n");
                    }
                }
                suspended = Some(interrupt.resume);
            }
            EventKind::Error(e) => println!("[{agent}] error: {e}"),
        }
    }
    suspended
}
