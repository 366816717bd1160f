use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kbchat::auth::TokenStore;
use kbchat::chat::{Attachment, ChatStore, MessageSource, RemoteStatus, StreamUpdate};
use kbchat::config::{self, ClientConfig};
use kbchat::types::{FeedbackKind, Role};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Parser)]
#[command(name = "kbchat", about = "Knowledge-base chat client", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations grouped by date
    List,
    /// Print the messages of a conversation
    Show { id: String },
    /// Ask a question, optionally continuing a conversation or attaching a file
    Ask {
        question: String,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Delete a conversation here and on the server
    Delete { id: String },
    /// Rate an answer
    Feedback {
        message_id: String,
        #[arg(value_enum)]
        kind: FeedbackArg,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Store the bearer token used for every request
    Token {
        value: Option<String>,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FeedbackArg {
    Like,
    Dislike,
}

impl From<FeedbackArg> for FeedbackKind {
    fn from(arg: FeedbackArg) -> Self {
        match arg {
            FeedbackArg::Like => FeedbackKind::Like,
            FeedbackArg::Dislike => FeedbackKind::Dislike,
        }
    }
}

fn main() -> Result<()> {
    // Environment first: the runtime's worker threads must not exist yet.
    config::load_env();
    tokio::runtime::Runtime::new()?.block_on(run_cli())
}

async fn run_cli() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env();

    if let Command::Token { value, clear } = &cli.command {
        let tokens = TokenStore::new(Arc::new(config.store("secure")));
        if *clear {
            tokens.invalidate();
            println!("token cleared");
        } else {
            let value = value.as_deref().context("pass a token or --clear")?;
            tokens.set_token(value)?;
            println!("token saved");
        }
        return Ok(());
    }

    let store = ChatStore::open(config);
    let result = run(&store, cli.command).await;
    store.dispose();
    result
}

async fn run(store: &ChatStore, command: Command) -> Result<()> {
    match command {
        Command::List => {
            if let MessageSource::CacheFallback(err) = store.load_conversations().await? {
                eprintln!("offline: {err}");
            }
            for group in store.grouped_conversations(OffsetDateTime::now_utc()) {
                println!("{}", group.bucket.label());
                for conversation in group.conversations {
                    let marker = if conversation.synced { ' ' } else { '*' };
                    println!("  {marker} {}  {}", conversation.id, conversation.title);
                }
            }
        }
        Command::Show { id } => {
            store.load_conversations().await?;
            let selection = store.select_conversation(&id).await?;
            for message in selection.messages {
                let label = match message.role {
                    Role::User => "you",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                println!("[{label}] {}", message.content);
                if !message.citations.is_empty() {
                    println!("  ({} sources)", message.citations.len());
                }
            }
        }
        Command::Ask {
            question,
            conversation,
            file,
        } => {
            if let Some(id) = conversation {
                store.load_conversations().await?;
                store.select_conversation(&id).await?;
            }
            if let Some(path) = file {
                store.attach(Attachment::from_path(path))?;
            }
            ask(store, &question).await?;
        }
        Command::Delete { id } => match store.delete_conversation(&id).await? {
            RemoteStatus::Failed(err) => eprintln!("deleted locally; server delete failed: {err}"),
            RemoteStatus::LocalOnly => println!("deleted (local only)"),
            RemoteStatus::Synced | RemoteStatus::AlreadyGone => println!("deleted"),
        },
        Command::Feedback {
            message_id,
            kind,
            reason,
        } => {
            let outcome = store
                .record_feedback(&message_id, kind.into(), reason.as_deref())
                .await?;
            match outcome.feedback {
                Some(feedback) => println!("feedback set: {}", feedback.kind().as_str()),
                None => println!("feedback cleared"),
            }
            if let RemoteStatus::Failed(err) = outcome.remote {
                eprintln!("not sent to server: {err}");
            }
        }
        Command::Token { .. } => {}
    }
    Ok(())
}

async fn ask(store: &ChatStore, question: &str) -> Result<()> {
    let mut answer = store.send_message(question)?;
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    while let Some(update) = answer.next().await {
        match update {
            StreamUpdate::Content { content, .. } => {
                if let Some(delta) = content.get(printed..) {
                    write!(stdout, "{delta}")?;
                    stdout.flush()?;
                }
                printed = content.len();
            }
            StreamUpdate::Citations(citations) => {
                tracing::debug!(count = citations.len(), "citations received");
            }
            StreamUpdate::Completed(message) => {
                if let Some(rest) = message.content.get(printed..) {
                    write!(stdout, "{rest}")?;
                }
                writeln!(stdout)?;
                for citation in &message.citations {
                    let title = citation.title.as_deref().unwrap_or("untitled");
                    writeln!(stdout, "  - {title}")?;
                }
            }
            StreamUpdate::Failed(err) => bail!("answer failed: {err}"),
        }
    }

    if let Some(id) = store.current_conversation_id() {
        // Give the background push a chance to land before the process exits.
        if let Err(err) = store.retry_sync(&id).await? {
            tracing::warn!(error = %err, "conversation not synced");
        }
    }
    Ok(())
}
