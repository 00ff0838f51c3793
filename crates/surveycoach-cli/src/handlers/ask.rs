//! `ask`: evaluate one survey answer against a llama-server model.

use std::io::Write;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use surveycoach_core::{
    AnswerSubmission, Evaluation, JsonFollowupExtractor, NoopRecordSink, SurveyRecordSink,
};
use surveycoach_runtime::{
    AnswerEvaluator, BridgeSettings, EvaluationUpdate, JsonlRecordSink, LlamaServerFactory,
    LlamaServerSettings, ModelHandle, SessionManager, StreamingBridge,
};
use tracing::{debug, info};

use super::load_config;

pub struct AskArgs {
    pub config: PathBuf,
    pub node: String,
    pub question: String,
    pub answer: String,
    pub timeout_secs: u64,
    pub records: Option<PathBuf>,
    pub server_path: PathBuf,
    pub ctx_size: u32,
}

pub async fn execute(args: AskArgs) -> Result<()> {
    let config = load_config(&args.config)?;

    let factory = LlamaServerFactory::new(
        LlamaServerSettings::new(&args.server_path).with_context_size(args.ctx_size),
        tokio::runtime::Handle::current(),
    )
    .context("Failed to set up llama-server launcher")?;
    let manager = Arc::new(SessionManager::new(Arc::new(factory)));
    let handle = ModelHandle::new(args.node.clone(), config.clone());
    let settings = BridgeSettings::default()
        .with_request_timeout(Some(Duration::from_secs(args.timeout_secs.max(1))));
    let bridge = StreamingBridge::new(manager, handle).with_settings(settings);

    let records: Arc<dyn SurveyRecordSink> = match &args.records {
        Some(path) => Arc::new(JsonlRecordSink::new(path)),
        None => Arc::new(NoopRecordSink::new()),
    };
    let evaluator = AnswerEvaluator::new(bridge, Arc::new(JsonFollowupExtractor::new()), records);

    eprintln!("Loading {} ...", config.model_path.display());
    let backend = evaluator
        .initialize(config)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    info!(%backend, "Model ready");

    let submission = AnswerSubmission::new(args.node, args.question, args.answer);
    let outcome = stream_evaluation(&evaluator, submission).await;
    evaluator.shutdown().await;

    let evaluation = outcome?;
    print_summary(&evaluation);
    Ok(())
}

/// Print partials as they arrive; Ctrl-C cancels the generation.
async fn stream_evaluation(
    evaluator: &AnswerEvaluator,
    submission: AnswerSubmission,
) -> Result<Evaluation> {
    let mut updates = pin!(evaluator.submit_answer(submission));
    let mut printed = String::new();
    let mut interrupted = false;

    loop {
        let update = tokio::select! {
            update = updates.next() => update,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                debug!("Interrupt received, cancelling");
                interrupted = true;
                evaluator.cancel_current();
                continue;
            }
        };
        let Some(update) = update else {
            return Err(anyhow!("evaluation ended without a result"));
        };

        match update {
            EvaluationUpdate::Partial(text) => print_progress(&mut printed, &text)?,
            EvaluationUpdate::Final(evaluation) => {
                print_progress(&mut printed, &evaluation.text)?;
                println!();
                return Ok(evaluation);
            }
            EvaluationUpdate::Failed {
                partial_text,
                error,
            } => {
                print_progress(&mut printed, &partial_text)?;
                println!();
                return Err(anyhow!(error.user_message()));
            }
        }
    }
}

/// Write whatever `text` adds beyond what is already on screen.
///
/// Chunks carry the accumulated text; when the new text does not extend
/// the printed text the whole of it is printed on a fresh line.
fn print_progress(printed: &mut String, text: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match text.strip_prefix(printed.as_str()) {
        Some(rest) => out.write_all(rest.as_bytes())?,
        None => write!(out, "\n{text}")?,
    }
    out.flush()?;
    printed.clear();
    printed.push_str(text);
    Ok(())
}

fn print_summary(evaluation: &Evaluation) {
    println!();
    match evaluation.score {
        Some(score) => println!("Score: {score}"),
        None => println!("Score: (none)"),
    }
    if evaluation.followups.is_empty() {
        println!("No follow-up questions.");
        return;
    }
    println!("Follow-up questions:");
    for (i, question) in evaluation.followups.iter().enumerate() {
        println!("  {}. {question}", i + 1);
    }
}
