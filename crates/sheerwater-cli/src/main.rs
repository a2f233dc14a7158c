//! sheerwater - chat with a forecasting assistant backed by an MCP tool server

mod config;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use sheerwater_agent::{
    FileSettingsStore, JsonlStore, McpClient, Orchestrator, SettingsScope, SettingsUpdate,
    TurnEvent, TurnRequest, TurnResult,
};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

/// sheerwater - forecasting assistant chat
#[derive(Parser, Debug)]
#[command(name = "sheerwater")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// User id to act as (default: config `user`, then $USER)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with the assistant (interactive unless -c is given)
    Chat {
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Send a single message and exit
        #[arg(short = 'c', long)]
        command: Option<String>,
    },
    /// Show or change model and system prompt settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// List, show or delete conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationsAction,
    },
    /// List the tools the tool server offers
    Tools,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Show effective settings
    Show {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Update settings; fields left out are kept
    Set {
        #[arg(long, value_enum, default_value_t = Scope::User)]
        scope: Scope,
        /// Required for the conversation scope
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, conflicts_with = "system_prompt_file")]
        system_prompt: Option<String>,
        #[arg(long)]
        system_prompt_file: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConversationsAction {
    /// List conversations, most recent first
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print a conversation
    Show { id: String },
    /// Delete a conversation
    Delete { id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scope {
    Global,
    User,
    Conversation,
}

struct App {
    orchestrator: Orchestrator,
    tools: Arc<McpClient>,
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("sheerwater=debug")
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let command = args.command.unwrap_or(Command::Chat {
        conversation: None,
        command: None,
    });

    let api_key = cfg.anthropic_api_key();
    if matches!(command, Command::Chat { .. }) && api_key.is_none() {
        eprintln!("Error: No Anthropic API key found");
        eprintln!();
        eprintln!("Set your API key with: export ANTHROPIC_API_KEY=your-key");
        eprintln!("Or add it to config file: sheerwater --init-config");
        std::process::exit(1);
    }

    let app = build_app(&cfg, args.user, api_key.unwrap_or_default())?;

    match command {
        Command::Chat {
            conversation,
            command,
        } => {
            warm_up(&app, cfg.connect_attempts()).await;
            match command {
                Some(message) => {
                    let result = send(&app, conversation, message).await?;
                    print_result(&result);
                    Ok(())
                }
                None => run_interactive(&app, conversation).await,
            }
        }
        Command::Settings { action } => run_settings(&app, action),
        Command::Conversations { action } => run_conversations(&app, action).await,
        Command::Tools => list_tools(&app).await,
    }
}

fn build_app(cfg: &config::Config, user: Option<String>, api_key: String) -> anyhow::Result<App> {
    let data_dir = cfg.data_dir();
    let transcripts = JsonlStore::open(data_dir.join("conversations"))
        .with_context(|| format!("opening conversation store in {}", data_dir.display()))?;
    let settings = FileSettingsStore::open(data_dir.join("settings.json"))
        .context("opening settings store")?;

    // The key is only used by `chat`, which checks it is present
    let model = cfg.provider(api_key);
    let tools = Arc::new(McpClient::new(cfg.mcp_config()));

    let orchestrator = Orchestrator::new(
        Arc::new(model),
        tools.clone(),
        Arc::new(transcripts),
        Arc::new(settings),
        cfg.orchestrator_config(),
    );

    Ok(App {
        orchestrator,
        tools,
        user_id: user.unwrap_or_else(|| cfg.user_id()),
    })
}

/// Connect to the tool server up front; chat still works without it
async fn warm_up(app: &App, attempts: u32) {
    match app
        .tools
        .connect_with_retry(attempts, Duration::from_secs(2))
        .await
    {
        Ok(count) => tracing::info!("{} tools available from {}", count, app.tools.url()),
        Err(e) => eprintln!(
            "Warning: tool server at {} unavailable ({}); continuing without tools",
            app.tools.url(),
            e
        ),
    }
}

async fn send(app: &App, conversation: Option<String>, message: String) -> anyhow::Result<TurnResult> {
    let mut request = TurnRequest::new(app.user_id.as_str(), message);
    request.conversation_id = conversation;

    // Show tool progress while the turn runs
    let mut events = app.orchestrator.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TurnEvent::ToolExecutionStart { tool_name, .. } => {
                    eprintln!("[Running {}...]", tool_name);
                }
                TurnEvent::ToolExecutionEnd {
                    tool_name,
                    is_error: true,
                    ..
                } => eprintln!("[{} failed]", tool_name),
                event if event.is_terminal() => break,
                _ => {}
            }
        }
    });

    let result = app.orchestrator.run_turn(request).await;
    progress.abort();

    result.map_err(|e| anyhow::anyhow!("{} ({})", e.user_message(), e))
}

fn print_result(result: &TurnResult) {
    println!("{}", result.text);
    for url in &result.chart_urls {
        println!("[chart: {}]", url);
    }

    let mut footer = format!(
        "[{} tool call(s), {} in / {} out tokens",
        result.tool_calls.len(),
        result.usage.input,
        result.usage.output
    );
    if let Some(limit) = &result.rate_limit {
        footer.push_str(&format!(
            ", {}/{} input tokens left until {}",
            limit.remaining,
            limit.limit,
            limit.reset.with_timezone(&chrono::Local).format("%H:%M:%S")
        ));
    }
    footer.push(']');
    eprintln!("{}", footer);
    if result.is_incomplete() {
        eprintln!("[turn incomplete: step limit reached]");
    }
}

async fn run_interactive(app: &App, mut conversation: Option<String>) -> anyhow::Result<()> {
    eprintln!("sheerwater ({}). Type /new for a new conversation, /quit to exit.", app.user_id);

    let stdin = io::stdin();
    loop {
        eprint!("> ");
        io::stderr().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                conversation = None;
                eprintln!("Started a new conversation.");
                continue;
            }
            _ => {}
        }

        match send(app, conversation.clone(), input.to_string()).await {
            Ok(result) => {
                print_result(&result);
                conversation = Some(result.conversation_id);
            }
            Err(e) => eprintln!("Error: {:#}", e),
        }
    }
    Ok(())
}

fn run_settings(app: &App, action: SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Show { conversation } => {
            let settings = app
                .orchestrator
                .settings(&app.user_id, conversation.as_deref())?;
            println!("model: {}", settings.model);
            println!("system prompt:\n{}", settings.system_prompt);
        }
        SettingsAction::Set {
            scope,
            conversation,
            model,
            system_prompt,
            system_prompt_file,
        } => {
            let scope = match (scope, conversation) {
                (Scope::Global, _) => SettingsScope::Global,
                (Scope::User, _) => SettingsScope::User(app.user_id.clone()),
                (Scope::Conversation, Some(id)) => {
                    // Ownership check
                    app.orchestrator.get_conversation(&app.user_id, &id)?;
                    SettingsScope::Conversation(id)
                }
                (Scope::Conversation, None) => {
                    anyhow::bail!("--conversation is required for the conversation scope")
                }
            };
            let system_prompt = match system_prompt_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading system prompt from {}", path))?,
                ),
                None => system_prompt,
            };
            let update = SettingsUpdate {
                model,
                system_prompt,
            };
            if update.is_empty() {
                anyhow::bail!("nothing to update: pass --model or --system-prompt");
            }
            app.orchestrator.update_settings(&scope, update)?;
            println!("Settings updated.");
        }
    }
    Ok(())
}

async fn run_conversations(app: &App, action: ConversationsAction) -> anyhow::Result<()> {
    match action {
        ConversationsAction::List { limit } => {
            let conversations = app.orchestrator.list_conversations(&app.user_id, limit)?;
            if conversations.is_empty() {
                println!("No conversations.");
                return Ok(());
            }
            for c in conversations {
                let updated = chrono::DateTime::from_timestamp_millis(c.updated_at)
                    .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "{}  {}  {:>3} msgs  {}",
                    c.id,
                    updated,
                    c.message_count,
                    c.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        ConversationsAction::Show { id } => {
            let transcript = app.orchestrator.get_conversation(&app.user_id, &id)?;
            println!(
                "# {}\n",
                transcript.info.title.as_deref().unwrap_or("(untitled)")
            );
            for message in &transcript.messages {
                match message {
                    sheerwater_ai::Message::ToolResult { results, .. } => {
                        for r in results {
                            let status = if r.is_error { "error" } else { "ok" };
                            println!("[tool result {} ({})]", r.tool_call_id, status);
                        }
                    }
                    _ => {
                        if !message.text().is_empty() {
                            println!("{}: {}\n", message.role(), message.text());
                        }
                        for call in message.tool_calls() {
                            println!("[tool call {} {}]", call.name, call.arguments);
                        }
                    }
                }
            }
        }
        ConversationsAction::Delete { id } => {
            app.orchestrator
                .delete_conversation(&app.user_id, &id)
                .await?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

async fn list_tools(app: &App) -> anyhow::Result<()> {
    let tools = app
        .orchestrator
        .tool_catalog()
        .await
        .map_err(|e| anyhow::anyhow!("tool server at {}: {}", app.tools.url(), e))?;
    if tools.is_empty() {
        println!("No tools available.");
    }
    for tool in tools {
        println!("{}", tool.name);
        if !tool.description.is_empty() {
            println!("    {}", tool.description.lines().next().unwrap_or_default());
        }
    }
    Ok(())
}
