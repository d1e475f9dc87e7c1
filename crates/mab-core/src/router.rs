//! Command dispatch behind the [`Gatekeeper`].

use std::{fmt::Write as _, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    cache::ResponseCache,
    domain::{Identity, IncomingCommand, RoomId},
    errors::Error,
    gatekeeper::{Denial, Gatekeeper},
    ports::{DocumentRef, DocumentStore, Generator, MessagingPort},
    retry::{with_retry, RetryPresets},
    Result,
};

const SEARCH_LIMIT: usize = 10;

/// What happened to one inbound line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Not a command (no prefix).
    Ignored,
    Denied(Denial),
    Unknown(String),
    Handled,
    /// The handler failed; the caller got a generic notice.
    Failed,
}

#[derive(Clone)]
pub struct Ports {
    pub messenger: Arc<dyn MessagingPort>,
    pub generator: Arc<dyn Generator>,
    pub documents: Arc<dyn DocumentStore>,
}

pub struct CommandRouter {
    gatekeeper: Arc<Gatekeeper>,
    cache: ResponseCache,
    ports: Ports,
    retry: RetryPresets,
    prefix: String,
}

impl CommandRouter {
    pub fn new(
        gatekeeper: Arc<Gatekeeper>,
        cache: ResponseCache,
        ports: Ports,
        retry: RetryPresets,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            gatekeeper,
            cache,
            ports,
            retry,
            prefix: prefix.into(),
        }
    }

    /// Parse and handle one chat line.
    pub async fn handle_text(&self, identity: Identity, room: RoomId, text: &str) -> Result<Outcome> {
        match IncomingCommand::from_text(identity, room, text, &self.prefix) {
            Some(cmd) => self.handle(&cmd).await,
            None => Ok(Outcome::Ignored),
        }
    }

    /// Admit `cmd` and run its handler. Only messenger failures surface as `Err`.
    pub async fn handle(&self, cmd: &IncomingCommand) -> Result<Outcome> {
        let room = &cmd.room_id;
        info!(identity = %cmd.identity, %room, action = %cmd.action, "command");

        let decision = self.gatekeeper.check(cmd);
        if let Some(denial) = decision.denial {
            self.reply(room, &denial.user_notice(self.gatekeeper.limiter().now_ms())).await?;
            return Ok(Outcome::Denied(denial));
        }

        let result = match cmd.action.as_str() {
            "help" => Ok(self.help_text()),
            "ping" => Ok("Pong!".to_string()),
            "status" => Ok(self.status_text()),
            "ask" => self.ask(&cmd.identity, &cmd.args).await,
            "find" | "search" => self.find(&cmd.args).await,
            "read" => self.read(&cmd.args).await,
            "admin_metrics" => Ok(self.metrics_text().await),
            "admin_cache_clear" => {
                let removed = self.cache.clear_all().await;
                Ok(format!("Cleared {removed} cache entries."))
            }
            other => {
                warn!(action = other, "unknown command");
                let text = format!(
                    "Unknown command: {other}\nUse {}help for the list of commands.",
                    self.prefix
                );
                self.reply(room, &text).await?;
                return Ok(Outcome::Unknown(other.to_string()));
            }
        };

        match result {
            Ok(text) => {
                self.reply(room, &text).await?;
                Ok(Outcome::Handled)
            }
            Err(e) => {
                error!(action = %cmd.action, error = %e, "command failed");
                self.reply(
                    room,
                    "Something went wrong while running the command. Please try again later.",
                )
                .await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn reply(&self, room: &RoomId, text: &str) -> Result<()> {
        self.ports.messenger.send_text(room, text).await
    }

    fn help_text(&self) -> String {
        let p = &self.prefix;
        format!(
            "Commands:\n\
             {p}ask <question> - ask the assistant\n\
             {p}find <name> - search documents\n\
             {p}read <name> [n] - read the n-th matching document\n\
             {p}status - bot status\n\
             {p}ping - check the bot is alive\n\
             {p}help - this text"
        )
    }

    fn status_text(&self) -> String {
        let up = |ok: bool| if ok { "up" } else { "down" };
        format!(
            "Status:\nbot: up\nassistant: {}\ndocuments: {}\ncache: {}",
            up(self.ports.generator.is_available()),
            up(self.ports.documents.is_configured()),
            up(self.cache.is_available()),
        )
    }

    async fn metrics_text(&self) -> String {
        let access = self.gatekeeper.access().stats();
        let cache = self.cache.stats().await;
        format!(
            "Metrics:\nassigned users: {}\nallowed rooms: {}\nblocked users: {}\n\
             rate-limit keys: {}\ncache keys: {} (prefix {}, ttl {}s, {})",
            access.assigned_users,
            access.allowed_rooms,
            access.blocked_users,
            self.gatekeeper.limiter().active_keys(),
            cache.keys,
            cache.prefix,
            cache.default_ttl_secs,
            if cache.available { "available" } else { "unavailable" },
        )
    }

    async fn ask(&self, identity: &Identity, args: &[String]) -> Result<String> {
        let question = args.join(" ");

        if let Some(cached) = self.cache.get_response(identity.as_str(), &question).await {
            debug!(%identity, "answer served from cache");
            return Ok(format!("Answer (cached):\n\n{cached}"));
        }

        let generator = &self.ports.generator;
        if !generator.is_available() {
            return Err(Error::External("generator is not available".to_string()));
        }
        let answer = with_retry(&self.retry.llm, || generator.generate(&question)).await?;

        self.cache
            .set_response(identity.as_str(), &question, &answer)
            .await;
        Ok(format!("Answer:\n\n{answer}"))
    }

    async fn find(&self, args: &[String]) -> Result<String> {
        let query = args.join(" ");
        let files = self.search(&query).await?;
        if files.is_empty() {
            return Ok(format!("No documents match \"{query}\"."));
        }

        let mut out = String::from("Documents:\n");
        for (i, f) in files.iter().enumerate() {
            let _ = writeln!(out, "{}. {} ({})", i + 1, f.name, f.mime_type);
        }
        let _ = write!(out, "Use {}read {query} <n> to read one.", self.prefix);
        Ok(out)
    }

    async fn read(&self, args: &[String]) -> Result<String> {
        let (name, index) = split_index(args);
        let files = self.search(&name).await?;
        if files.is_empty() {
            return Ok(format!("No documents match \"{name}\"."));
        }
        let Some(doc) = index.checked_sub(1).and_then(|i| files.get(i)) else {
            return Ok(format!(
                "Pick a number between 1 and {} (see {}find {name}).",
                files.len(),
                self.prefix
            ));
        };

        let content = self.read_document(doc).await?;
        let mut out = format!("{} ({})\n", doc.name, doc.mime_type);
        if files.len() > 1 {
            let _ = writeln!(out, "Showing {index} of {} matches.", files.len());
        }
        out.push('\n');
        out.push_str(&content);
        Ok(out)
    }

    async fn search(&self, query: &str) -> Result<Vec<DocumentRef>> {
        let documents = &self.ports.documents;
        if !documents.is_configured() {
            return Err(Error::External("document store is not configured".to_string()));
        }
        Ok(with_retry(&self.retry.drive, || documents.search(query, SEARCH_LIMIT)).await?)
    }

    async fn read_document(&self, doc: &DocumentRef) -> Result<String> {
        if let Some(cached) = self.cache.get_file(&doc.id).await {
            return Ok(cached);
        }

        let documents = &self.ports.documents;
        let content = with_retry(&self.retry.drive, || documents.read(&doc.id)).await?;
        self.cache.set_file(&doc.id, &content).await;
        Ok(content)
    }
}

/// `read quarterly report 2` → ("quarterly report", 2). The index is 1-based and defaults to 1.
fn split_index(args: &[String]) -> (String, usize) {
    if let [rest @ .., last] = args {
        if !rest.is_empty() && !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = last.parse::<usize>() {
                return (rest.join(" "), n);
            }
        }
    }
    (args.join(" "), 1)
}
