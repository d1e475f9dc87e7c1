//! Stand-ins for upstreams that are not wired into the console build.

use async_trait::async_trait;

use mab_core::{
    errors::UpstreamError,
    ports::{DocumentRef, DocumentStore, Generator},
};

pub struct NoGenerator;

#[async_trait]
impl Generator for NoGenerator {
    fn is_available(&self) -> bool {
        false
    }

    async fn generate(&self, _prompt: &str) -> Result<String, UpstreamError> {
        Err(UpstreamError::new("no generator configured"))
    }
}

pub struct NoDocuments;

#[async_trait]
impl DocumentStore for NoDocuments {
    fn is_configured(&self) -> bool {
        false
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<DocumentRef>, UpstreamError> {
        Err(UpstreamError::new("no document store configured"))
    }

    async fn read(&self, _id: &str) -> Result<String, UpstreamError> {
        Err(UpstreamError::new("no document store configured"))
    }
}
