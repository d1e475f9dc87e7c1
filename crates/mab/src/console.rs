//! Line-oriented console transport: `identity room text` in, replies on stdout.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use mab_core::{
    domain::{Identity, RoomId},
    ports::MessagingPort,
    router::CommandRouter,
};

pub struct ConsoleMessenger {
    out: Mutex<tokio::io::Stdout>,
}

impl ConsoleMessenger {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl MessagingPort for ConsoleMessenger {
    async fn send_text(&self, room: &RoomId, text: &str) -> mab_core::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(format!("[{room}] {text}\n").as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Split `@alice:x !room:x !ask hi` into its three parts.
fn parse_line(line: &str) -> Option<(Identity, RoomId, &str)> {
    let line = line.trim();
    let (identity, rest) = line.split_once(char::is_whitespace)?;
    let (room, text) = rest.trim_start().split_once(char::is_whitespace)?;
    Some((Identity::new(identity), RoomId::new(room), text.trim_start()))
}

/// Feed stdin lines to `router` until EOF or `shutdown` fires.
pub async fn run(router: Arc<CommandRouter>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some((identity, room, text)) = parse_line(&line) else {
            warn!("expected `identity room text`, got {line:?}");
            continue;
        };

        if let Err(e) = router.handle_text(identity, room, text).await {
            error!(error = %e, "failed to deliver reply");
        }
    }

    Ok(())
}
