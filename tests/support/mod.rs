#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chat_api::client::await_or_cancel;
use chat_api::{
    ByteStream, CancellationSignal, ChatApiError, GenerationRequest, Transcript,
    TranscriptMessage,
};
use chat_engine::{ChatBackend, Engine, EngineConfig};
use chat_state::{KeyValueStore, MemoryStore};
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

/// How the scripted backend answers the next generation request.
pub enum Reply {
    /// Body delivered as these pushes, then end of stream.
    Body(Vec<Vec<u8>>),
    /// Body delivered as these pushes, then nothing ever again.
    BodyThenStall(Vec<Vec<u8>>),
    /// The request never gets a response.
    NoResponse,
    /// Body pushes arrive through the channel; the body ends when it closes.
    Fed(mpsc::UnboundedReceiver<Vec<u8>>),
    Status(u16, &'static str),
    MissingBody,
}

/// A [`Reply::Fed`] and the sender driving it.
pub fn fed_reply() -> (Reply, mpsc::UnboundedSender<Vec<u8>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Reply::Fed(receiver), sender)
}

#[derive(Default)]
struct TranscriptScript {
    transcript: Option<Transcript>,
    /// Fetches that fail or return nothing before `transcript` is served.
    hidden_for: usize,
    fail: bool,
    stall: bool,
}

#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    transcript: Mutex<TranscriptScript>,
    transcript_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reply(&self, reply: Reply) {
        lock_unpoisoned(&self.replies).push_back(reply);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn set_transcript(&self, transcript: Transcript) {
        self.set_transcript_after(0, transcript);
    }

    /// Serve `transcript` only once `hidden_for` earlier fetches have happened.
    pub fn set_transcript_after(&self, hidden_for: usize, transcript: Transcript) {
        let mut script = lock_unpoisoned(&self.transcript);
        script.transcript = Some(transcript);
        script.hidden_for = hidden_for;
    }

    pub fn fail_transcripts(&self) {
        lock_unpoisoned(&self.transcript).fail = true;
    }

    /// Transcript fetches never complete.
    pub fn stall_transcripts(&self) {
        lock_unpoisoned(&self.transcript).stall = true;
    }

    pub fn transcript_calls(&self) -> usize {
        self.transcript_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn open_stream(
        &self,
        request: &GenerationRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<ByteStream, ChatApiError> {
        lock_unpoisoned(&self.requests).push(request.clone());
        let reply = lock_unpoisoned(&self.replies)
            .pop_front()
            .unwrap_or(Reply::Status(500, "no scripted reply"));

        match reply {
            Reply::Body(pushes) => Ok(Box::pin(stream::iter(into_items(pushes)))),
            Reply::BodyThenStall(pushes) => Ok(Box::pin(
                stream::iter(into_items(pushes)).chain(stream::pending()),
            )),
            Reply::Fed(receiver) => Ok(Box::pin(stream::unfold(
                receiver,
                |mut receiver| async move {
                    let push = receiver.recv().await?;
                    Some((Ok(Bytes::from(push)), receiver))
                },
            ))),
            Reply::NoResponse => {
                await_or_cancel(futures_util::future::pending::<()>(), cancellation).await?;
                Err(ChatApiError::MissingBody)
            }
            Reply::Status(status, message) => Err(ChatApiError::Status {
                status: reqwest_status(status),
                message: message.to_string(),
            }),
            Reply::MissingBody => Err(ChatApiError::MissingBody),
        }
    }

    async fn fetch_transcript(&self, _conversation_id: &str) -> Result<Transcript, ChatApiError> {
        let call = self.transcript_calls.fetch_add(1, Ordering::SeqCst);
        let stall = lock_unpoisoned(&self.transcript).stall;
        if stall {
            futures_util::future::pending::<()>().await;
        }
        let script = lock_unpoisoned(&self.transcript);
        if script.fail {
            return Err(ChatApiError::StreamRead("connection refused".to_string()));
        }
        if call < script.hidden_for {
            return Ok(Transcript::default());
        }
        Ok(script.transcript.clone().unwrap_or_default())
    }
}

fn into_items(pushes: Vec<Vec<u8>>) -> Vec<Result<Bytes, ChatApiError>> {
    pushes.into_iter().map(|push| Ok(Bytes::from(push))).collect()
}

fn reqwest_status(status: u16) -> chat_api::StatusCode {
    chat_api::StatusCode::from_u16(status)
        .unwrap_or(chat_api::StatusCode::INTERNAL_SERVER_ERROR)
}

/// Engine over `backend` and a fresh in-memory store, with fast polling.
pub fn engine_with(backend: &Arc<ScriptedBackend>) -> (Engine, Arc<dyn KeyValueStore>) {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let engine = engine_on(backend, &store);
    (engine, store)
}

/// A second engine sharing `store`, as another process would.
pub fn engine_on(backend: &Arc<ScriptedBackend>, store: &Arc<dyn KeyValueStore>) -> Engine {
    let config = EngineConfig::default().with_sync_policy(Duration::from_millis(5), 3);
    let backend: Arc<dyn ChatBackend> = Arc::clone(backend) as Arc<dyn ChatBackend>;
    Engine::new(config, backend, Arc::clone(store))
}

pub fn content_line(text: &str) -> String {
    format!("data: {}\n\n", json!({ "content": text }))
}

pub fn payload_line(payload: serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

pub const DONE_LINE: &str = "data: [DONE]\n\n";

/// Each string becomes one push of the response body.
pub fn pushes<S: AsRef<str>>(parts: &[S]) -> Vec<Vec<u8>> {
    parts
        .iter()
        .map(|part| part.as_ref().as_bytes().to_vec())
        .collect()
}

/// The whole body delivered one byte at a time.
pub fn byte_pushes(body: &str) -> Vec<Vec<u8>> {
    body.as_bytes().iter().map(|byte| vec![*byte]).collect()
}

pub fn assistant_entry(id: &str, content: &str, ts: i64) -> TranscriptMessage {
    TranscriptMessage {
        id: id.to_string(),
        role: "assistant".to_string(),
        content: content.to_string(),
        ts,
        model: Some("sonnet".to_string()),
    }
}

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
