use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{domain::RoomId, errors::UpstreamError, Result};

/// Outbound chat port. One implementation per transport.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_text(&self, room: &RoomId, text: &str) -> Result<()>;
}

/// Text generation upstream (LLM).
#[async_trait]
pub trait Generator: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &str) -> std::result::Result<String, UpstreamError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub name: String,
    pub mime_type: String,
}

/// Document storage upstream: name search and plain-text read.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<DocumentRef>, UpstreamError>;

    async fn read(&self, id: &str) -> std::result::Result<String, UpstreamError>;
}
