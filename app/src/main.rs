use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use exemi::{format_message, ExemiApp, TranscriptPrinter};
use exemi_core::telemetry;
use exemi_core::{AuthPhase, ChatEvent, ClientConfig, ClientError};
use std::future::Future;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "exemi", version, about = "Terminal client for the Exemi study assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and validate the session.
    Login {
        #[arg(long)]
        username: String,
        /// Prompted for when omitted.
        #[arg(long)]
        password: Option<String>,
    },
    Logout,
    /// Show the current session state.
    Status,
    /// Link your university account with an access token.
    Magic { token: String },
    /// List conversations, your own unless an owner is given.
    Conversations {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print a saved conversation.
    Show { id: i64 },
    /// Chat interactively, continuing a conversation when one is given.
    Chat {
        #[arg(long)]
        conversation: Option<i64>,
    },
    Delete { id: i64 },
    /// List participant accounts (administrators only).
    Users,
    /// Create a participant account (administrators only).
    AddUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::env_filter_or("warn"))?;

    let cli = Cli::parse();
    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err.user_message());
            std::process::exit(2);
        }
    };
    let support_contact = config.support_contact.clone();
    let app = ExemiApp::from_config(config)?;
    let runtime = Runtime::new()?;

    match runtime.block_on(run(&app, cli.command)) {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<ClientError>() {
            Some(client) => {
                eprintln!("{}", client.user_message(&support_contact));
                std::process::exit(1);
            }
            None => Err(err),
        },
    }
}

async fn run(app: &ExemiApp, command: Command) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => prompt("Password: ")?,
            };
            app.session.log_in(&username, &password).await?;
            report_status(app).await
        }
        Command::Logout => {
            app.session.log_out();
            println!("Logged out.");
            Ok(())
        }
        Command::Status => report_status(app).await,
        Command::Magic { token } => {
            app.session.submit_magic(&token).await?;
            report_status(app).await
        }
        Command::Conversations { owner } => {
            ensure_ready(app).await?;
            let conversations = match owner {
                Some(owner) => app.chat.list_conversations(&owner).await?,
                None => app.chat.list_own_conversations().await?,
            };
            if conversations.is_empty() {
                println!("No conversations yet.");
            }
            for conversation in conversations {
                println!("{:>6}  {}", conversation.id, conversation.title());
            }
            Ok(())
        }
        Command::Show { id } => {
            ensure_ready(app).await?;
            let messages = app.chat.load_messages(Some(id)).await?;
            for message in messages.iter().filter(|message| message.is_visible()) {
                println!("{}", format_message(message));
            }
            Ok(())
        }
        Command::Chat { conversation } => {
            ensure_ready(app).await?;
            chat_loop(app, conversation).await
        }
        Command::Delete { id } => {
            ensure_ready(app).await?;
            app.chat.delete_conversation(id).await?;
            println!("Deleted conversation {id}.");
            Ok(())
        }
        Command::Users => {
            ensure_ready(app).await?;
            for user in app.admin.non_admin_users().await? {
                let flag = if user.disabled { " (disabled)" } else { "" };
                println!("{:>6}  {}{flag}", user.id, user.username);
            }
            Ok(())
        }
        Command::AddUser { username, password } => {
            ensure_ready(app).await?;
            let password = match password {
                Some(password) => password,
                None => prompt("Password for the new account: ")?,
            };
            let user = app.admin.create_user(&username, &password).await?;
            println!("Created {} (id {}).", user.username, user.id);
            Ok(())
        }
    }
}

async fn report_status(app: &ExemiApp) -> Result<()> {
    app.session.reconcile().await?;
    match app.session.phase() {
        AuthPhase::LoggedOut => println!("Not logged in."),
        AuthPhase::Authenticating => println!("Still checking your session."),
        AuthPhase::Onboarding => {
            if let Some(notice) = app.session.notice() {
                println!("{notice}");
            }
            println!("Link your university account with `exemi magic <token>`.");
        }
        AuthPhase::Ready => match app.session.user() {
            Some(user) => println!("Logged in as {}.", user.username),
            None => println!("Logged in."),
        },
    }
    Ok(())
}

async fn ensure_ready(app: &ExemiApp) -> Result<()> {
    match app.session.reconcile().await? {
        AuthPhase::Ready => Ok(()),
        AuthPhase::Onboarding => {
            bail!("Your university account is not linked yet. Run `exemi magic <token>` first.")
        }
        AuthPhase::LoggedOut | AuthPhase::Authenticating => Err(ClientError::NotReady.into()),
    }
}

async fn chat_loop(app: &ExemiApp, conversation: Option<i64>) -> Result<()> {
    let mut events = app.chat.subscribe();
    let mut printer = TranscriptPrinter::new();

    if conversation.is_some() {
        app.chat.select_conversation(conversation).await?;
        for message in app.chat.visible_transcript() {
            println!("{}", format_message(&message));
        }
    }
    println!("Type a message, or /new, /list, /open ID, /delete ID, /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let outcome = match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => continue,
            ("/quit" | "/exit", _) => break,
            ("/new", _) => {
                let outcome = drive(app.chat.select_conversation(None), &mut events, &mut printer).await;
                if outcome.is_ok() {
                    println!("Started a new chat.");
                }
                outcome
            }
            ("/list", _) => drive(app.chat.list_own_conversations(), &mut events, &mut printer)
                .await
                .map(|conversations| {
                    for conversation in conversations {
                        println!("{:>6}  {}", conversation.id, conversation.title());
                    }
                }),
            ("/open", raw) => match raw.trim().parse::<i64>() {
                Ok(id) => {
                    let outcome =
                        drive(app.chat.select_conversation(Some(id)), &mut events, &mut printer).await;
                    if outcome.is_ok() {
                        for message in app.chat.visible_transcript() {
                            println!("{}", format_message(&message));
                        }
                    }
                    outcome
                }
                Err(_) => {
                    println!("Usage: /open ID");
                    continue;
                }
            },
            ("/delete", raw) => match raw.trim().parse::<i64>() {
                Ok(id) => drive(app.chat.delete_conversation(id), &mut events, &mut printer).await,
                Err(_) => {
                    println!("Usage: /delete ID");
                    continue;
                }
            },
            _ => drive(app.chat.send(line), &mut events, &mut printer).await,
        };
        if let Err(err) = outcome {
            debug!(%err, "chat command failed");
        }
    }
    Ok(())
}

/// Runs `operation` while echoing the chat events it produces, so streamed replies appear
/// as they arrive.
async fn drive<F: Future>(
    operation: F,
    events: &mut UnboundedReceiver<ChatEvent>,
    printer: &mut TranscriptPrinter,
) -> F::Output {
    tokio::pin!(operation);
    let output = loop {
        tokio::select! {
            output = &mut operation => break output,
            Some(event) = events.recv() => echo(printer, &event),
        }
    };
    while let Ok(event) = events.try_recv() {
        echo(printer, &event);
    }
    output
}

fn echo(printer: &mut TranscriptPrinter, event: &ChatEvent) {
    if let Some(text) = printer.render(event) {
        print!("{text}");
        io::stdout().flush().ok();
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
