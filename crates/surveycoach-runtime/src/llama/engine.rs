//! llama-server engine and session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use serde::Serialize;
use surveycoach_core::{
    Backend, EngineError, InferenceEngine, InferenceSession, ModelInput, NativeCallback,
    NativeEvent, SamplingParams,
};
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::sse::{CompletionEvent, LineBuffer, parse_line};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One running llama-server process.
pub struct LlamaServerEngine {
    backend: Backend,
    base_url: String,
    child: Mutex<Option<Child>>,
    context_size: u32,
    client: reqwest::Client,
    runtime: Handle,
}

impl LlamaServerEngine {
    pub(super) fn new(
        backend: Backend,
        base_url: String,
        child: Child,
        context_size: u32,
        client: reqwest::Client,
        runtime: Handle,
    ) -> Self {
        Self {
            backend,
            base_url,
            child: Mutex::new(Some(child)),
            context_size,
            client,
            runtime,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl InferenceEngine for LlamaServerEngine {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn create_session(
        &self,
        params: &SamplingParams,
    ) -> Result<Arc<dyn InferenceSession>, EngineError> {
        if lock(&self.child).is_none() {
            return Err(EngineError::SessionFailed("engine closed".to_string()));
        }
        Ok(Arc::new(LlamaServerSession {
            completion_url: format!("{}/completion", self.base_url),
            client: self.client.clone(),
            runtime: self.runtime.clone(),
            params: *params,
            transcript: Arc::new(Mutex::new(Transcript::new(prompt_budget(
                self.context_size,
                params.max_tokens,
            )))),
            task: Mutex::new(None),
        }))
    }

    /// Kill the child without waiting; reaping happens on the runtime.
    fn close(&self) -> Result<(), EngineError> {
        let Some(mut child) = lock(&self.child).take() else {
            return Ok(());
        };
        child
            .start_kill()
            .map_err(|e| EngineError::CloseFailed(e.to_string()))?;
        self.runtime.spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%status, "llama-server exited"),
                Err(e) => warn!(error = %e, "Failed to reap llama-server"),
            }
        });
        Ok(())
    }
}

/// Rough characters per token, used to size the prompt budget.
const CHARS_PER_TOKEN: usize = 4;

/// Smallest prompt budget in tokens, whatever the generation cap.
const MIN_PROMPT_TOKENS: u32 = 256;

/// Prompt budget in characters for a context of `context_size` tokens
/// that must leave room for `max_tokens` of output.
fn prompt_budget(context_size: u32, max_tokens: u32) -> usize {
    let tokens = context_size.saturating_sub(max_tokens).max(MIN_PROMPT_TOKENS);
    tokens as usize * CHARS_PER_TOKEN
}

/// Turns sent as the prompt, oldest first.
///
/// Whole turns are dropped from the front once the total exceeds the
/// budget. The latest turn is always kept.
#[derive(Debug)]
struct Transcript {
    turns: VecDeque<String>,
    chars: usize,
    budget: usize,
}

impl Transcript {
    const fn new(budget: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            chars: 0,
            budget,
        }
    }

    fn push(&mut self, turn: &str) {
        if turn.is_empty() {
            return;
        }
        self.chars += turn.len();
        self.turns.push_back(turn.to_string());
        while self.chars > self.budget && self.turns.len() > 1 {
            if let Some(dropped) = self.turns.pop_front() {
                self.chars -= dropped.len();
            }
        }
    }

    fn prompt(&self) -> String {
        let mut prompt = String::with_capacity(self.chars);
        for turn in &self.turns {
            prompt.push_str(turn);
        }
        prompt
    }
}

/// Conversation state for one llama-server engine.
///
/// The server is stateless between requests, so the session keeps the
/// transcript and sends it with every generation, dropping the oldest
/// turns once it outgrows the context window.
pub struct LlamaServerSession {
    completion_url: String,
    client: reqwest::Client,
    runtime: Handle,
    params: SamplingParams,
    transcript: Arc<Mutex<Transcript>>,
    task: Mutex<Option<AbortHandle>>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    top_k: i32,
    top_p: f32,
    temperature: f32,
    stream: bool,
    cache_prompt: bool,
}

impl InferenceSession for LlamaServerSession {
    fn add_input(&self, input: &ModelInput) -> Result<(), EngineError> {
        if input.audio.is_some() {
            return Err(EngineError::InputRejected(
                "audio input is not supported by llama-server".to_string(),
            ));
        }
        lock(&self.transcript).push(&input.text);
        Ok(())
    }

    fn generate_async(&self, callback: NativeCallback) -> Result<(), EngineError> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(EngineError::GenerationFailed(
                "generation already running".to_string(),
            ));
        }

        let prompt = lock(&self.transcript).prompt();
        let body = serde_json::to_value(CompletionRequest {
            prompt: &prompt,
            n_predict: self.params.max_tokens,
            top_k: self.params.top_k,
            top_p: self.params.top_p,
            temperature: self.params.temperature,
            stream: true,
            cache_prompt: true,
        })
        .map_err(|e| EngineError::GenerationFailed(e.to_string()))?;

        let request = self.client.post(&self.completion_url).json(&body);
        let transcript = Arc::clone(&self.transcript);
        let handle = self.runtime.spawn(async move {
            if let Some(response) = stream_completion(request, &callback).await {
                lock(&transcript).push(&response);
            }
        });
        *task = Some(handle.abort_handle());
        Ok(())
    }

    fn cancel(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }

    fn close(&self) -> Result<(), EngineError> {
        self.cancel();
        Ok(())
    }
}

/// Drive one streaming completion, pushing events into `callback`.
///
/// Returns the full response text when generation ended normally.
async fn stream_completion(
    request: reqwest::RequestBuilder,
    callback: &NativeCallback,
) -> Option<String> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            callback(NativeEvent::Failed(e.to_string()));
            return None;
        }
    };
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        callback(NativeEvent::Failed(format!("HTTP {status}: {body}")));
        return None;
    }

    let mut generated = String::new();
    let mut lines = LineBuffer::default();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => lines.push(&bytes),
            Err(e) => {
                callback(NativeEvent::Failed(e.to_string()));
                return None;
            }
        }
        while let Some(line) = lines.next_line() {
            match parse_line(&line) {
                Some(CompletionEvent::Content(text)) => {
                    generated.push_str(&text);
                    callback(NativeEvent::Partial(text));
                }
                Some(CompletionEvent::Stop(text)) => {
                    generated.push_str(&text);
                    callback(NativeEvent::Done(text));
                    return Some(generated);
                }
                Some(CompletionEvent::Error(message)) => {
                    callback(NativeEvent::Failed(message));
                    return None;
                }
                None => {}
            }
        }
    }

    // Stream closed without a stop event.
    callback(NativeEvent::Done(String::new()));
    Some(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use surveycoach_core::AudioPayload;

    fn session() -> LlamaServerSession {
        LlamaServerSession {
            completion_url: "http://127.0.0.1:1/completion".to_string(),
            client: reqwest::Client::new(),
            runtime: Handle::current(),
            params: SamplingParams::default(),
            transcript: Arc::new(Mutex::new(Transcript::new(1024))),
            task: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn audio_input_is_rejected() {
        let session = session();
        let input = ModelInput::text("hello").with_audio(AudioPayload {
            samples: vec![0.0; 16],
            sample_rate: 16_000,
        });
        assert!(matches!(
            session.add_input(&input),
            Err(EngineError::InputRejected(_))
        ));
    }

    #[tokio::test]
    async fn text_input_accumulates() {
        let session = session();
        session.add_input(&ModelInput::text("a")).unwrap();
        session.add_input(&ModelInput::text("b")).unwrap();
        assert_eq!(lock(&session.transcript).prompt(), "ab");
    }

    #[test]
    fn oldest_turns_are_dropped_past_budget() {
        let mut transcript = Transcript::new(10);
        transcript.push("aaaa");
        transcript.push("bbbb");
        assert_eq!(transcript.prompt(), "aaaabbbb");

        transcript.push("cccc");
        assert_eq!(transcript.prompt(), "bbbbcccc");

        transcript.push("a long latest turn");
        assert_eq!(transcript.prompt(), "a long latest turn");
        assert_eq!(transcript.chars, 18);
    }

    #[test]
    fn budget_leaves_room_for_output() {
        assert_eq!(prompt_budget(4096, 1024), 3072 * CHARS_PER_TOKEN);
        assert_eq!(prompt_budget(2048, 2048), 256 * CHARS_PER_TOKEN);
    }

    #[tokio::test]
    async fn unreachable_server_reports_failure() {
        let session = session();
        session.add_input(&ModelInput::text("hi")).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: NativeCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        session.generate_async(callback).unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, NativeEvent::Failed(_)));
    }
}
