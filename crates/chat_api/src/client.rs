use std::future::Future;
use std::pin::Pin;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::ChatApiConfig;
use crate::error::{parse_error_message, ChatApiError};
use crate::headers::{build_json_headers, build_stream_headers};
use crate::payload::{GenerationRequest, Transcript};
use crate::retry::{is_retryable_http_error, retry_delay, MAX_RETRIES};
use crate::url::{generation_url, transcript_url};

/// Shared cancellation flag checked by request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

/// Raw response body of a generation stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatApiError>> + Send>>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct ChatApiClient {
    http: Client,
    config: ChatApiConfig,
}

impl ChatApiClient {
    pub fn new(config: ChatApiConfig) -> Result<Self, ChatApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            // Generations run for minutes; only the connect phase is bounded here.
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ChatApiConfig {
        &self.config
    }

    pub fn build_generation_request(
        &self,
        request: &GenerationRequest,
    ) -> Result<RequestBuilder, ChatApiError> {
        let url = generation_url(&self.config.base_url)?;
        let headers = to_header_map(build_stream_headers(&self.config))?;
        Ok(self.http.post(url).headers(headers).json(request))
    }

    pub fn build_transcript_request(
        &self,
        conversation_id: &str,
    ) -> Result<RequestBuilder, ChatApiError> {
        let url = transcript_url(&self.config.base_url, conversation_id)?;
        let headers = to_header_map(build_json_headers(&self.config))?;
        let mut builder = self.http.get(url).headers(headers);
        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }

    /// Send the generation request, retrying statuses that mean no work started.
    pub async fn send_with_retry(
        &self,
        request: &GenerationRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, ChatApiError> {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if is_cancelled(cancellation) {
                return Err(ChatApiError::Cancelled);
            }

            let pending = self.build_generation_request(request)?.send();
            match await_or_cancel(pending, cancellation).await? {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if attempt < MAX_RETRIES && is_retryable_http_error(status.as_u16(), &body) {
                        warn!(%status, attempt, "generation request rejected; retrying");
                        await_or_cancel(tokio::time::sleep(retry_delay(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(ChatApiError::Status { status, message });
                }
                Err(error) if error.is_connect() && attempt < MAX_RETRIES => {
                    warn!(%error, attempt, "generation request could not connect; retrying");
                    last_error = Some(error.to_string());
                    await_or_cancel(tokio::time::sleep(retry_delay(attempt)), cancellation).await?;
                }
                Err(error) => return Err(ChatApiError::Request(error)),
            }
        }

        Err(ChatApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Open a generation stream and hand back its raw body.
    pub async fn open_stream(
        &self,
        request: &GenerationRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<ByteStream, ChatApiError> {
        let response = self.send_with_retry(request, cancellation).await?;
        if response.content_length() == Some(0) {
            return Err(ChatApiError::MissingBody);
        }

        debug!(
            conversation_id = %request.conversation_id,
            status = %response.status(),
            "generation stream opened"
        );
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| ChatApiError::StreamRead(error.to_string())));
        Ok(Box::pin(body))
    }

    pub async fn fetch_transcript(
        &self,
        conversation_id: &str,
    ) -> Result<Transcript, ChatApiError> {
        let response = self.build_transcript_request(conversation_id)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatApiError::Status {
                status,
                message: parse_error_message(status, &body),
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Transcript::default());
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

fn to_header_map(
    headers: impl IntoIterator<Item = (String, String)>,
) -> Result<HeaderMap, ChatApiError> {
    let mut out = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|error| {
            ChatApiError::InvalidHeader {
                name: key.clone(),
                reason: error.to_string(),
            }
        })?;
        let value = HeaderValue::from_str(&value).map_err(|error| ChatApiError::InvalidHeader {
            name: key.clone(),
            reason: error.to_string(),
        })?;
        out.insert(name, value);
    }
    Ok(out)
}

pub fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

/// Await `future` while polling `cancellation`, failing with
/// [`ChatApiError::Cancelled`] as soon as the flag is raised.
pub async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, ChatApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(ChatApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(ChatApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::{await_or_cancel, to_header_map};
    use crate::error::ChatApiError;

    #[test]
    fn header_map_rejects_invalid_names() {
        let error = to_header_map([("bad header".to_string(), "x".to_string())])
            .expect_err("space in header name must fail");
        assert!(matches!(error, ChatApiError::InvalidHeader { .. }));
    }

    #[tokio::test]
    async fn await_or_cancel_returns_output_without_signal() {
        let value = await_or_cancel(async { 7 }, None).await.expect("no cancel");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn await_or_cancel_stops_pending_future_once_raised() {
        let cancel = Arc::new(AtomicBool::new(false));
        let raiser = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            raiser.store(true, Ordering::Release);
        });

        let result = await_or_cancel(std::future::pending::<()>(), Some(&cancel)).await;
        assert!(matches!(result, Err(ChatApiError::Cancelled)));
    }
}
