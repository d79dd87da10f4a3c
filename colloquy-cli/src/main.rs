//! Colloquy CLI - Command-line tools for branching conversations

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colloquy_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(about = "Colloquy conversation engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Session store directory (overrides configuration)
    #[arg(long, global = true, env = "COLLOQUY_STORE")]
    store: Option<PathBuf>,

    /// Configuration file (defaults to colloquy.toml and COLLOQUY_* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Version information
    Version,
    /// Create an empty session
    New {
        #[arg(short, long)]
        topic: String,
        /// System prompt
        #[arg(short, long)]
        system: Option<String>,
        /// Echo model answering this session by default
        #[arg(long)]
        model: Option<String>,
    },
    /// List stored sessions
    List,
    /// Delete a session
    Delete { session: String },
    /// Submit a turn answered by the offline echo model
    Say {
        session: String,
        text: String,
        /// Echo model name (defaults to the session's, then the configured one)
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the timeline
    Show { session: String },
    /// Print the messages that would be replayed
    Context {
        session: String,
        /// Anchor request index (defaults to the history of a new turn)
        #[arg(long)]
        at: Option<usize>,
    },
    /// Insert an erase marker
    Erase {
        session: String,
        /// Insert position (defaults to the end)
        #[arg(long)]
        at: Option<usize>,
    },
    /// Export one interaction
    Export {
        session: String,
        /// Index of the request or response group
        index: usize,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Paste an exported interaction ("-" reads stdin)
    Import {
        session: String,
        file: PathBuf,
        #[arg(long)]
        at: Option<usize>,
    },
    /// Drop response groups with no usable answer
    Prune { session: String },
    /// Re-run a prefix of the conversation with the echo model
    Chain {
        session: String,
        #[arg(long)]
        from: Option<usize>,
        /// End of the range, exclusive
        #[arg(long)]
        to: Option<usize>,
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so exported payloads stay clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("colloquy {}", env!("CARGO_PKG_VERSION"));
        println!("colloquy-core {}", colloquy_core::VERSION);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(dir) = cli.store {
        config = config.with_store_dir(dir);
    }
    let store = JsonFileStore::open(&config.store.dir).await?;

    match cli.command {
        Commands::Version => {}
        Commands::New {
            topic,
            system,
            model,
        } => {
            let mut session = Session::new(topic).with_estimator(config.estimator());
            if let Some(system) = system {
                session = session.with_system_prompt(system);
            }
            if let Some(model) = model {
                session = session.with_default_client(ClientIdentity::new("local", model));
            }
            store.save(&session.snapshot()).await?;
            tracing::info!(session_id = %session.id(), "Session created");
            println!("{}", session.id());
        }
        Commands::List => {
            for summary in store.list().await? {
                println!(
                    "{}  {:>4} items  {}  {}",
                    summary.id,
                    summary.items,
                    summary.updated_at.format("%Y-%m-%d %H:%M"),
                    summary.topic
                );
            }
        }
        Commands::Delete { session } => {
            if !store.delete(&session).await? {
                bail!("session {} not found", session);
            }
            tracing::info!(session_id = %session, "Session deleted");
        }
        Commands::Say {
            session,
            text,
            model,
        } => {
            let session = open_session(&store, &session, &config).await?;
            let client = echo_client(&session, &config, model)?;
            let handle =
                SessionHandle::new(session, ClientRegistry::new().with_client(client.clone()));

            let outcome = handle.submit(text, client, cancel_on_ctrl_c()).await;
            let session = handle.lock().await;
            store.save(&session.snapshot()).await?;

            let (group, candidate) = outcome?;
            if let Some((_, group)) = session.timeline().group(group) {
                if let Some(candidate) = group.candidate(candidate) {
                    print_candidate(candidate);
                }
            }
        }
        Commands::Show { session } => {
            let session = open_session(&store, &session, &config).await?;
            print_timeline(&session);
        }
        Commands::Context { session, at } => {
            let mut session = open_session(&store, &session, &config).await?;
            check_index(&session, at)?;
            let messages = match at {
                Some(index) => session.prepare_messages(Some(index))?,
                // Without an anchor, show what a new turn would carry
                None => {
                    let timeline = session.timeline();
                    let history: Vec<TimelineItem> = timeline
                        .history_indices(timeline.len())
                        .into_iter()
                        .map(|i| timeline.items()[i].clone())
                        .collect();
                    to_messages(&history)
                }
            };
            if let Some(prompt) = session.system_prompt() {
                println!("system: {}", prompt);
            }
            for message in messages {
                println!("{:?}: {}", message.role, message.content);
            }
        }
        Commands::Erase { session, at } => {
            let mut session = open_session(&store, &session, &config).await?;
            if let Some(index) = at {
                if index > session.len() {
                    bail!("index {} is past the end (len {})", index, session.len());
                }
            }
            session.insert_erase_marker(at);
            store.save(&session.snapshot()).await?;
        }
        Commands::Export {
            session,
            index,
            out,
        } => {
            let session = open_session(&store, &session, &config).await?;
            check_index(&session, Some(index))?;
            let group = group_at(&session, index)?;
            let text = export_interaction(&session, group)?.to_text()?;
            match out {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", text),
            }
        }
        Commands::Import { session, file, at } => {
            let mut session = open_session(&store, &session, &config).await?;
            if let Some(index) = at {
                if index > session.len() {
                    bail!("index {} is past the end (len {})", index, session.len());
                }
            }
            let text = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?
            };
            let payload = InteractionPayload::from_text(&text)?;
            match import_interaction(&mut session, &payload, at)? {
                ImportOutcome::Inserted { index, .. } => {
                    store.save(&session.snapshot()).await?;
                    println!("inserted at {}", index);
                }
                ImportOutcome::Duplicate => {
                    tracing::warn!(session_id = %session.id(), "Interaction already present");
                    println!("already present; nothing imported");
                }
            }
        }
        Commands::Prune { session } => {
            let mut session = open_session(&store, &session, &config).await?;
            let removed = session.prune_unavailable();
            store.save(&session.snapshot()).await?;
            println!("removed {} item(s)", removed.len());
        }
        Commands::Chain {
            session,
            from,
            to,
            model,
        } => {
            let session = open_session(&store, &session, &config).await?;
            let from = from.unwrap_or(0);
            let to = to.unwrap_or(session.len());
            if from > to || to > session.len() {
                bail!("range {}..{} is invalid (len {})", from, to, session.len());
            }

            let client = echo_client(&session, &config, model)?;
            let handle =
                SessionHandle::new(session, ClientRegistry::new().with_client(client.clone()));
            let runner = ChainRunner::new(handle.clone(), client).with_config(config.chain.clone());

            let outcome = runner.run(from..to, cancel_on_ctrl_c()).await;
            store.save(&handle.lock().await.snapshot()).await?;

            let report = outcome?;
            println!(
                "chain completed: {} step(s), attempts {:?}",
                report.steps_completed, report.attempts_per_step
            );
        }
    }

    Ok(())
}

async fn open_session(store: &JsonFileStore, id: &str, config: &EngineConfig) -> Result<Session> {
    let snapshot = store
        .load(id)
        .await?
        .with_context(|| format!("session {} not found", id))?;
    Ok(Session::from_snapshot(snapshot, config.event_buffer)?.with_estimator(config.estimator()))
}

/// The echo model to answer with: `--model`, then the session's default,
/// then the configured default
fn echo_client(
    session: &Session,
    config: &EngineConfig,
    model: Option<String>,
) -> Result<Arc<dyn ChatClient>> {
    let model = match model {
        Some(model) => model,
        None => match session
            .default_client()
            .cloned()
            .or(config.default_client_identity()?)
        {
            Some(identity) if identity.provider == "local" => identity.model,
            Some(identity) => bail!("default client {} is not available offline", identity),
            None => "echo".to_string(),
        },
    };
    tracing::debug!(model = %model, "Answering with echo model");
    Ok(Arc::new(EchoClient::new(model)))
}

fn check_index(session: &Session, index: Option<usize>) -> Result<()> {
    if let Some(index) = index {
        if index >= session.len() {
            bail!("index {} is out of range (len {})", index, session.len());
        }
    }
    Ok(())
}

/// The response group at `index`, or the one following the request there
fn group_at(session: &Session, index: usize) -> Result<ItemId> {
    let items = session.items();
    match &items[index] {
        TimelineItem::Response(group) => Ok(group.id),
        TimelineItem::Request(request) => match items.get(index + 1) {
            Some(TimelineItem::Response(group))
                if group.interaction_id == request.interaction_id =>
            {
                Ok(group.id)
            }
            _ => bail!("request at {} has no response group", index),
        },
        TimelineItem::Erase(_) => bail!("item {} is an erase marker", index),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

fn print_candidate(candidate: &ResponseCandidate) {
    for message in &candidate.messages {
        println!("{}", message.content);
    }
    if let FinishState::Error { reason } = &candidate.finish_state {
        eprintln!("error: {}", reason);
    }
}

fn print_timeline(session: &Session) {
    println!("{} ({})", session.topic(), session.id());
    if let Some(prompt) = session.system_prompt() {
        println!("system: {}", prompt);
    }
    println!(
        "{} turn(s), {} tokens consumed, ${:.4}, {} context tokens",
        session.derived().turn_count,
        session.tokens_consumed(),
        session.total_price(),
        session.derived().current_context_tokens
    );

    for (index, item) in session.items().iter().enumerate() {
        match item {
            TimelineItem::Request(request) => {
                let interaction = request.interaction_id.to_string();
                println!("[{:>3}] request   {}  {}", index, &interaction[..8], request.text);
            }
            TimelineItem::Response(group) => {
                let interaction = group.interaction_id.to_string();
                let state = match group.accepted() {
                    Some(candidate) => format!(
                        "{}/{} accepted from {}, {:?}{}",
                        group.accepted_index().unwrap_or(0) + 1,
                        group.len(),
                        candidate.source,
                        candidate.finish_state,
                        if candidate.is_available_in_context() {
                            ""
                        } else {
                            " (excluded)"
                        }
                    ),
                    None => "empty".to_string(),
                };
                println!("[{:>3}] response  {}  {}", index, &interaction[..8], state);
            }
            TimelineItem::Erase(_) => println!("[{:>3}] ─── erase ───", index),
        }
    }
}
