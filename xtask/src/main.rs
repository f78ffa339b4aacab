use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use exemi_core::config::ClientConfig;
use exemi_core::telemetry;
use exemi_core::{
    AuthPhase, ConversationClient, MagicFailurePolicy, MemorySessionStore, Method, MockReply,
    MockTransport, SessionController,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Exemi")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive login, onboarding and a streamed chat reply against a scripted backend.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn scripted_backend() -> MockTransport {
    let user = json!({ "id": 1, "username": "smoke", "university_name": "swinburne" });
    let check = "\u{2713}".as_bytes();
    let mock = MockTransport::new();
    mock.on(
        Method::Post,
        "/login",
        MockReply::ok(json!({ "access_token": "smoke-token", "user_id": 1, "user": user })),
    )
    .on(Method::Get, "/users/self", MockReply::ok(user.clone()))
    .on(Method::Get, "/magic_valid", MockReply::detail(401, "Magic not linked"))
    .on(Method::Get, "/magic_valid", MockReply::ok(json!(true)))
    .on(Method::Patch, "/users/self", MockReply::ok(user))
    .on(
        Method::Post,
        "/conversation",
        MockReply::ok(json!({
            "id": 1,
            "created_at": "2025-03-01T09:30:00",
            "messages": [{ "role": "user", "content": "ping from xtask" }],
        })),
    )
    .on(
        Method::Get,
        "/conversation_stream_reply/1",
        MockReply::chunks([
            b"po".to_vec(),
            [b"ng ".as_slice(), &check[..1]].concat(),
            check[1..].to_vec(),
        ]),
    );
    mock
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let mock = scripted_backend();
    let mut config = ClientConfig::new("http://smoke.invalid".parse()?);
    config.magic_failure = MagicFailurePolicy::Onboard;
    let session = SessionController::new(
        Arc::new(mock.clone()),
        Arc::new(MemorySessionStore::new()),
        config,
    );
    let chat = ConversationClient::new(session.clone());

    runtime.block_on(async {
        session.log_in("smoke", "smoke").await?;
        let phase = session.reconcile().await?;
        ensure!(phase == AuthPhase::Onboarding, "expected onboarding, got {phase:?}");

        let phase = session.submit_magic("smoke-magic").await?;
        ensure!(phase == AuthPhase::Ready, "expected ready, got {phase:?}");

        chat.send("ping from xtask").await?;
        Ok::<_, anyhow::Error>(())
    })?;

    let reply = chat
        .transcript()
        .last()
        .map(|message| message.content.clone())
        .unwrap_or_default();
    ensure!(reply == "pong \u{2713}", "unexpected reply {reply:?}");
    info!(
        "requests" = mock.calls().len(),
        "messages" = chat.transcript().len(),
        "smoke test conversation streamed"
    );

    Ok(())
}
