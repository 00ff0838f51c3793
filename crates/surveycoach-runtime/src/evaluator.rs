//! Answer evaluation: the surface a survey UI talks to.
//!
//! Renders a survey answer into a prompt, streams the model's evaluation
//! through the [`StreamingBridge`], extracts score and follow-ups from the
//! final text and appends records. Record failures are logged, never
//! surfaced.

use std::sync::{Arc, Mutex, PoisonError};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use surveycoach_core::{
    AnswerRecord, AnswerSubmission, Backend, Evaluation, FollowupExtractor, InferenceConfig,
    InferenceError, ModelInput, SurveyRecordSink, TranscriptEntry, normalize_error_message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::StreamingBridge;
use crate::manager::BusyPolicy;

/// One update for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationUpdate {
    /// Text generated so far.
    Partial(String),
    /// Generation finished; score and follow-ups extracted.
    Final(Evaluation),
    /// Generation ended early. Show `partial_text` with the error.
    Failed {
        partial_text: String,
        error: InferenceError,
    },
}

impl EvaluationUpdate {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Partial(_))
    }
}

pub struct AnswerEvaluator {
    bridge: StreamingBridge,
    extractor: Arc<dyn FollowupExtractor>,
    records: Arc<dyn SurveyRecordSink>,
    policy: BusyPolicy,
    current: Mutex<Option<CancellationToken>>,
}

impl AnswerEvaluator {
    pub fn new(
        bridge: StreamingBridge,
        extractor: Arc<dyn FollowupExtractor>,
        records: Arc<dyn SurveyRecordSink>,
    ) -> Self {
        Self {
            bridge,
            extractor,
            records,
            policy: BusyPolicy::Reject,
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: BusyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn bridge(&self) -> &StreamingBridge {
        &self.bridge
    }

    /// Build the engine/session pair on the blocking pool.
    pub async fn initialize(&self, config: InferenceConfig) -> Result<Backend, InferenceError> {
        let manager = Arc::clone(self.bridge.manager());
        let handle = Arc::clone(self.bridge.handle());
        tokio::task::spawn_blocking(move || manager.initialize(&handle, config))
            .await
            .map_err(|e| InferenceError::ConstructionFailed(normalize_error_message(&e.to_string())))?
    }

    /// Evaluate one answer.
    ///
    /// Supersedes any evaluation still streaming. The returned stream yields
    /// partials and ends with exactly one `Final` or `Failed`. Dropping it
    /// cancels the generation.
    pub fn submit_answer(
        &self,
        submission: AnswerSubmission,
    ) -> impl Stream<Item = EvaluationUpdate> + Send + 'static {
        let framing = self.bridge.handle().config().framing;
        let prompt = framing.render(&submission.question, &submission.answer);
        let max_followups = framing.max_followups;

        let mut inner = self.bridge.stream(ModelInput::text(prompt), self.policy);
        if let Some(previous) = self.swap_current(Some(inner.canceller())) {
            debug!(node_id = %submission.node_id, "Superseding in-flight evaluation");
            previous.cancel();
        }

        let extractor = Arc::clone(&self.extractor);
        let records = Arc::clone(&self.records);

        stream! {
            append_answer(records.as_ref(), &submission).await;

            while let Some(chunk) = inner.next().await {
                if !chunk.is_final {
                    yield EvaluationUpdate::Partial(chunk.text);
                    continue;
                }

                let update = match chunk.error {
                    None => {
                        let evaluation = Evaluation {
                            score: extractor.extract_score(&chunk.text),
                            followups: extractor.extract_followups(&chunk.text, max_followups),
                            text: chunk.text,
                        };
                        info!(
                            node_id = %submission.node_id,
                            score = ?evaluation.score,
                            followups = evaluation.followups.len(),
                            "Evaluation complete"
                        );
                        append_transcript(
                            records.as_ref(),
                            TranscriptEntry::assistant(&submission.node_id, &evaluation.text),
                        )
                        .await;
                        EvaluationUpdate::Final(evaluation)
                    }
                    Some(error) => {
                        info!(node_id = %submission.node_id, reason = error.kind(), "Evaluation ended early");
                        append_transcript(
                            records.as_ref(),
                            TranscriptEntry::assistant(&submission.node_id, &chunk.text)
                                .with_error(error.user_message()),
                        )
                        .await;
                        EvaluationUpdate::Failed {
                            partial_text: chunk.text,
                            error,
                        }
                    }
                };
                yield update;
                break;
            }
        }
    }

    /// Cancel the evaluation currently streaming, if any.
    pub fn cancel_current(&self) {
        if let Some(token) = self.swap_current(None) {
            token.cancel();
        }
    }

    /// Cancel, wait for the handle to settle, then start a fresh session.
    ///
    /// Returns whether the session was reset.
    pub async fn reset_transient_state(&self) -> bool {
        self.cancel_current();
        self.bridge.reset_session().await
    }

    /// Cancel any evaluation and release the model.
    pub async fn shutdown(&self) {
        self.cancel_current();
        let manager = Arc::clone(self.bridge.manager());
        let handle = Arc::clone(self.bridge.handle());
        let released = tokio::task::spawn_blocking(move || {
            manager.cleanup(&handle, || debug!("Cleanup requested"));
        })
        .await;
        if let Err(e) = released {
            warn!(error = %e, "Cleanup task failed");
        }
    }

    fn swap_current(&self, next: Option<CancellationToken>) -> Option<CancellationToken> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }
}

async fn append_answer(records: &dyn SurveyRecordSink, submission: &AnswerSubmission) {
    if let Err(e) = records
        .append_answer(AnswerRecord::from_submission(submission))
        .await
    {
        warn!(node_id = %submission.node_id, error = %e, "Failed to append answer record");
    }
    if let Err(e) = records
        .append_transcript(TranscriptEntry::user(&submission.node_id, &submission.answer))
        .await
    {
        warn!(node_id = %submission.node_id, error = %e, "Failed to append transcript entry");
    }
}

async fn append_transcript(records: &dyn SurveyRecordSink, entry: TranscriptEntry) {
    let node_id = entry.node_id.clone();
    if let Err(e) = records.append_transcript(entry).await {
        warn!(node_id = %node_id, error = %e, "Failed to append transcript entry");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::mock;
    use surveycoach_core::{RecordSinkError, SurveyRecordSink};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::bridge::BridgeSettings;
    use crate::handle::ModelHandle;
    use crate::manager::SessionManager;
    use crate::testing::{GenerationScript, ScriptEnding, ScriptedEngineFactory};

    mock! {
        Extractor {}
        impl FollowupExtractor for Extractor {
            fn extract_score(&self, final_text: &str) -> Option<i32>;
            fn extract_followups(&self, final_text: &str, max: usize) -> Vec<String>;
        }
    }

    mock! {
        Sink {}
        #[async_trait]
        impl SurveyRecordSink for Sink {
            async fn append_answer(&self, record: AnswerRecord) -> Result<(), RecordSinkError>;
            async fn append_transcript(&self, entry: TranscriptEntry) -> Result<(), RecordSinkError>;
        }
    }

    fn fast_settings() -> BridgeSettings {
        BridgeSettings {
            poll_interval: Duration::from_millis(5),
            idle_grace: Duration::from_millis(20),
            watchdog_timeout: Duration::from_millis(500),
            settle_timeout: Duration::from_millis(200),
            ..BridgeSettings::default()
        }
    }

    async fn evaluator(
        factory: &ScriptedEngineFactory,
        extractor: MockExtractor,
        sink: MockSink,
    ) -> AnswerEvaluator {
        let manager = Arc::new(SessionManager::new(factory.as_factory()));
        let config = InferenceConfig::for_model("/models/eval.bin");
        let handle = ModelHandle::new("eval", config.clone());
        let bridge = StreamingBridge::new(manager, handle)
            .with_gate(Arc::new(Semaphore::new(1)))
            .with_settings(fast_settings());
        let evaluator = AnswerEvaluator::new(bridge, Arc::new(extractor), Arc::new(sink));
        evaluator.initialize(config).await.unwrap();
        evaluator
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn final_update_carries_extraction() {
        let factory = ScriptedEngineFactory::new().with_script(GenerationScript::chunks([
            "Solid answer. ",
            "{\"score\": 80}",
        ]));

        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract_score()
            .withf(|text| text == "Solid answer. {\"score\": 80}")
            .times(1)
            .returning(|_| Some(80));
        extractor
            .expect_extract_followups()
            .withf(|_, max| *max == 3)
            .times(1)
            .returning(|_, _| vec!["Why?".to_string()]);

        let mut sink = MockSink::new();
        sink.expect_append_answer()
            .withf(|r| r.node_id == "q1" && r.answer == "It scales.")
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_append_transcript()
            .times(2)
            .returning(|_| Ok(()));

        let evaluator = evaluator(&factory, extractor, sink).await;
        let updates: Vec<_> = evaluator
            .submit_answer(AnswerSubmission::new("q1", "Why Rust?", "It scales."))
            .collect()
            .await;

        let last = updates.last().unwrap();
        assert_eq!(
            last,
            &EvaluationUpdate::Final(Evaluation {
                text: "Solid answer. {\"score\": 80}".to_string(),
                score: Some(80),
                followups: vec!["Why?".to_string()],
            })
        );
        assert!(updates[..updates.len() - 1]
            .iter()
            .all(|u| matches!(u, EvaluationUpdate::Partial(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_failure_is_annotated_not_extracted() {
        let factory = ScriptedEngineFactory::new().with_script(
            GenerationScript::chunks(["Half "]).ending(ScriptEnding::Fail("Error: oom\ntrace".into())),
        );

        let mut extractor = MockExtractor::new();
        extractor.expect_extract_score().never();
        extractor.expect_extract_followups().never();

        let mut sink = MockSink::new();
        sink.expect_append_answer().returning(|_| Ok(()));
        sink.expect_append_transcript()
            .withf(|e| e.role == surveycoach_core::TranscriptRole::User)
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_append_transcript()
            .withf(|e| e.error.as_deref() == Some("streaming failed: oom"))
            .times(1)
            .returning(|_| Ok(()));

        let evaluator = evaluator(&factory, extractor, sink).await;
        let updates: Vec<_> = evaluator
            .submit_answer(AnswerSubmission::new("q2", "Q", "A"))
            .collect()
            .await;

        assert_eq!(
            updates.last(),
            Some(&EvaluationUpdate::Failed {
                partial_text: "Half ".to_string(),
                error: InferenceError::StreamingFailed("oom".to_string()),
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn record_failures_do_not_break_the_stream() {
        let factory = ScriptedEngineFactory::new();
        let mut extractor = MockExtractor::new();
        extractor.expect_extract_score().returning(|_| None);
        extractor.expect_extract_followups().returning(|_, _| Vec::new());

        let mut sink = MockSink::new();
        sink.expect_append_answer()
            .returning(|_| Err(RecordSinkError::Io(std::io::Error::other("disk full"))));
        sink.expect_append_transcript()
            .returning(|_| Err(RecordSinkError::Io(std::io::Error::other("disk full"))));

        let evaluator = evaluator(&factory, extractor, sink).await;
        let updates: Vec<_> = evaluator
            .submit_answer(AnswerSubmission::new("q3", "Q", "A"))
            .collect()
            .await;
        assert!(matches!(updates.last(), Some(EvaluationUpdate::Final(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_current_ends_with_cancelled() {
        let factory = ScriptedEngineFactory::new().with_script(
            GenerationScript::chunks(["a", "b", "c", "d"]).with_delay(Duration::from_millis(50)),
        );
        let mut extractor = MockExtractor::new();
        extractor.expect_extract_score().never();
        extractor.expect_extract_followups().never();
        let mut sink = MockSink::new();
        sink.expect_append_answer().returning(|_| Ok(()));
        sink.expect_append_transcript().returning(|_| Ok(()));

        let evaluator = evaluator(&factory, extractor, sink).await;
        let mut updates = Box::pin(evaluator.submit_answer(AnswerSubmission::new("q4", "Q", "A")));

        let first = updates.next().await.unwrap();
        assert!(matches!(first, EvaluationUpdate::Partial(_)));
        evaluator.cancel_current();

        let mut last = first;
        while let Some(update) = updates.next().await {
            last = update;
        }
        assert!(matches!(
            last,
            EvaluationUpdate::Failed {
                error: InferenceError::Cancelled,
                ..
            }
        ));
        assert!(evaluator.bridge().handle().is_idle());
        assert!(evaluator.reset_transient_state().await);
    }
}
