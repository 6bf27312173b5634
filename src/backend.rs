//! Seam between the engine and the generation server.

use async_trait::async_trait;
use chat_api::{
    ByteStream, CancellationSignal, ChatApiClient, ChatApiConfig, ChatApiError, GenerationRequest,
    Transcript,
};

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue a generation request and return the raw response body.
    ///
    /// Must fail with [`ChatApiError::Cancelled`] once `cancellation` is raised
    /// while the request is still pending.
    async fn open_stream(
        &self,
        request: &GenerationRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<ByteStream, ChatApiError>;

    async fn fetch_transcript(&self, conversation_id: &str) -> Result<Transcript, ChatApiError>;
}

/// [`ChatBackend`] over HTTP.
#[derive(Debug)]
pub struct HttpBackend {
    client: ChatApiClient,
}

impl HttpBackend {
    pub fn new(config: ChatApiConfig) -> Result<Self, ChatApiError> {
        Ok(Self {
            client: ChatApiClient::new(config)?,
        })
    }

    pub fn client(&self) -> &ChatApiClient {
        &self.client
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn open_stream(
        &self,
        request: &GenerationRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<ByteStream, ChatApiError> {
        self.client.open_stream(request, cancellation).await
    }

    async fn fetch_transcript(&self, conversation_id: &str) -> Result<Transcript, ChatApiError> {
        self.client.fetch_transcript(conversation_id).await
    }
}
