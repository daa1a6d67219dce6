use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rolelens_provider::InferenceClient;
use rolelens_schema::{
    ClassificationRecord, Conversation, ProvenanceMetadata, RoleSide, TaxonomyRegistry,
};
use rolelens_store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::confirm::{AlwaysYes, Confirmation, Interactive};
use crate::few_shot::load_few_shot;
use crate::prompt::PromptBuilder;
use crate::retry::{FailureKind, ItemFailure, ItemOutcome, RetryController, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub concurrency: usize,
    pub force: bool,
    pub preserve_existing: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            force: false,
            preserve_existing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub id: String,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl FailureEntry {
    fn new(id: &str, failure: ItemFailure) -> Self {
        Self {
            id: id.to_string(),
            kind: failure.kind,
            reason: failure.reason,
            attempts: failure.attempts,
            raw_response: failure.raw_response,
        }
    }
}

/// End-of-run accounting. Every corpus item lands in exactly one counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub provider: String,
    pub model: String,
    pub taxonomy_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub failures: Vec<FailureEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl RunSummary {
    pub fn accounted(&self) -> usize {
        self.succeeded + self.skipped + self.failed + self.cancelled
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run aborted: {reason}")]
    Aborted {
        reason: String,
        summary: Box<RunSummary>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("confirmation failed: {0}")]
    Confirmation(String),
    #[error("worker task failed: {0}")]
    Worker(String),
}

struct WorkUnit {
    id: String,
    /// Every corpus occurrence of `id`, in corpus order.
    items: Vec<(usize, Conversation)>,
    overwrites: bool,
}

enum Decision {
    Skip(&'static str),
    Classify { overwrites: bool },
    Fail(String),
}

struct Completion {
    index: usize,
    conversation: Conversation,
    outcome: ItemOutcome,
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    cancelled: usize,
    failures: Vec<(usize, FailureEntry)>,
}

pub struct Orchestrator {
    client: Arc<dyn InferenceClient>,
    store: Arc<dyn RecordStore>,
    registry: Arc<TaxonomyRegistry>,
    builder: Arc<PromptBuilder>,
    policy: Arc<RetryPolicy>,
    options: RunOptions,
    confirm: Arc<dyn Confirmation>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// `builder` must render prompts for the registry's active taxonomy.
    pub fn new(
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn RecordStore>,
        registry: Arc<TaxonomyRegistry>,
        builder: Arc<PromptBuilder>,
        policy: RetryPolicy,
    ) -> Self {
        debug_assert_eq!(builder.taxonomy_version(), registry.active_version());
        Self {
            client,
            store,
            registry,
            builder,
            policy: Arc::new(policy),
            options: RunOptions::default(),
            confirm: Arc::new(AlwaysYes),
            cancel: CancellationToken::new(),
        }
    }

    /// Wire up taxonomy, few-shot set, prompt options and retry policy from
    /// the run configuration.
    pub fn from_config(
        config: &RunConfig,
        client: Arc<dyn InferenceClient>,
        store: Arc<dyn RecordStore>,
    ) -> anyhow::Result<Self> {
        let registry = config.taxonomy_registry()?;
        let taxonomy = registry.active().clone();
        let examples = match &config.few_shot_path {
            Some(path) => load_few_shot(path, &taxonomy)?,
            None => Vec::new(),
        };
        let builder = PromptBuilder::new(taxonomy, examples, config.prompt_options());
        let confirm: Arc<dyn Confirmation> = if config.assume_yes {
            Arc::new(AlwaysYes)
        } else {
            Arc::new(Interactive)
        };
        Ok(Self::new(
            client,
            store,
            Arc::new(registry),
            Arc::new(builder),
            config.retry_policy(),
        )
        .with_options(RunOptions {
            concurrency: config.concurrency,
            force: config.force,
            preserve_existing: config.preserve_existing,
        })
        .with_confirmation(confirm))
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_confirmation(mut self, confirm: Arc<dyn Confirmation>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, corpus: Vec<Conversation>) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let total = corpus.len();
        let mut skipped = 0usize;
        let mut cancelled = 0usize;

        let units = group_by_id(corpus);
        let mut queue = VecDeque::with_capacity(units.len());
        let mut planning_failures = Vec::new();
        for mut unit in units {
            let decision = match self.decide(&unit.id).await {
                Ok(decision) => decision,
                Err(err) if err.is_record_error() => self.unreadable(&unit.id, &err),
                Err(err) => return Err(err.into()),
            };
            match decision {
                Decision::Skip(reason) => {
                    tracing::debug!(conversation_id = %unit.id, reason, "skipping");
                    skipped += unit.items.len();
                }
                Decision::Fail(reason) => {
                    for (index, _) in &unit.items {
                        planning_failures.push((
                            *index,
                            FailureEntry::new(
                                &unit.id,
                                ItemFailure {
                                    kind: FailureKind::Storage,
                                    reason: reason.clone(),
                                    attempts: 0,
                                    raw_response: None,
                                },
                            ),
                        ));
                    }
                }
                Decision::Classify { overwrites } => {
                    unit.overwrites = overwrites;
                    queue.push_back(unit);
                }
            }
        }

        if self.options.force {
            skipped += self.confirm_overwrites(&mut queue).await?;
        }

        tracing::info!(
            total,
            queued = queue.iter().map(|u| u.items.len()).sum::<usize>(),
            skipped,
            concurrency = self.options.concurrency,
            provider = self.client.provider_id(),
            model = self.client.model(),
            taxonomy = self.builder.taxonomy_version(),
            "starting classification run"
        );

        let run_token = self.cancel.child_token();
        let abort: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let queue = Arc::new(Mutex::new(queue));
        let workers = self.options.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<Completion>(workers * 2);

        let writer = tokio::spawn(write_loop(
            rx,
            Arc::clone(&self.store),
            self.client.provider_id().to_string(),
            self.client.model().to_string(),
            self.builder.taxonomy_version().to_string(),
            self.builder.windowing().turns(),
        ));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                tx: tx.clone(),
                client: Arc::clone(&self.client),
                builder: Arc::clone(&self.builder),
                policy: Arc::clone(&self.policy),
                cancel: run_token.clone(),
                abort: Arc::clone(&abort),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(tx);

        let mut worker_error = None;
        for handle in handles {
            if let Err(err) = handle.await {
                run_token.cancel();
                worker_error.get_or_insert_with(|| err.to_string());
            }
        }
        let tally = writer
            .await
            .map_err(|err| RunError::Worker(err.to_string()))?;
        if let Some(err) = worker_error {
            return Err(RunError::Worker(err));
        }

        for unit in queue.lock().await.drain(..) {
            cancelled += unit.items.len();
        }
        cancelled += tally.cancelled;

        let mut failures = tally.failures;
        failures.extend(planning_failures);
        failures.sort_by_key(|(index, _)| *index);
        let failures: Vec<FailureEntry> = failures.into_iter().map(|(_, f)| f).collect();

        let aborted = abort.lock().await.take();
        let summary = RunSummary {
            provider: self.client.provider_id().to_string(),
            model: self.client.model().to_string(),
            taxonomy_version: self.builder.taxonomy_version().to_string(),
            started_at,
            finished_at: Utc::now(),
            total,
            succeeded: tally.succeeded,
            skipped,
            failed: failures.len(),
            cancelled,
            failures,
            aborted: aborted.clone(),
        };
        debug_assert_eq!(summary.accounted(), summary.total);

        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "classification run finished"
        );

        match aborted {
            Some(reason) => Err(RunError::Aborted {
                reason,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }

    async fn decide(&self, id: &str) -> Result<Decision, StoreError> {
        let existing = self.store.get(id).await?;
        let Some(record) = existing.filter(ClassificationRecord::is_classified) else {
            return Ok(Decision::Classify { overwrites: false });
        };
        if self.options.force {
            return Ok(Decision::Classify { overwrites: true });
        }
        if self.options.preserve_existing {
            return Ok(Decision::Skip("preserving existing classification"));
        }

        let Some(meta) = record.metadata.as_ref() else {
            tracing::info!(conversation_id = id, "classification has no provenance; re-classifying");
            return Ok(Decision::Classify { overwrites: true });
        };
        if !self.registry.is_known(&meta.prompt_version) {
            tracing::warn!(
                conversation_id = id,
                version = %meta.prompt_version,
                "classification uses an unknown taxonomy version; re-classifying"
            );
        } else if !self.registry.is_current(meta) {
            tracing::info!(
                conversation_id = id,
                version = %meta.prompt_version,
                active = self.registry.active_version(),
                "stale classification; re-classifying"
            );
        } else if !meta.same_backend(self.client.provider_id(), self.client.model()) {
            tracing::info!(
                conversation_id = id,
                provider = %meta.provider,
                model = %meta.model,
                "classified by a different backend; re-classifying"
            );
        } else if meta.window != self.builder.windowing().turns() {
            tracing::info!(
                conversation_id = id,
                window = ?meta.window,
                "classified with a different transcript window; re-classifying"
            );
        } else {
            return Ok(Decision::Skip("current"));
        }
        Ok(Decision::Classify { overwrites: true })
    }

    /// A stored record that cannot be read is replaced by a fresh
    /// classification, unless existing results must be preserved.
    fn unreadable(&self, id: &str, err: &StoreError) -> Decision {
        if self.options.preserve_existing {
            tracing::error!(conversation_id = id, "existing record is unreadable: {err}");
            return Decision::Fail(format!("existing record is unreadable: {err}"));
        }
        tracing::warn!(
            conversation_id = id,
            "existing record is unreadable; re-classifying: {err}"
        );
        Decision::Classify { overwrites: false }
    }

    /// Ask before a forced run replaces existing results. Returns the number
    /// of items skipped because the overwrite was declined.
    async fn confirm_overwrites(&self, queue: &mut VecDeque<WorkUnit>) -> Result<usize, RunError> {
        let overwrites = queue.iter().filter(|u| u.overwrites).count();
        if overwrites == 0 {
            return Ok(0);
        }
        let confirm = Arc::clone(&self.confirm);
        let prompt = format!("Overwrite {overwrites} existing classification(s)?");
        let approved = tokio::task::spawn_blocking(move || confirm.confirm(&prompt))
            .await
            .map_err(|e| RunError::Confirmation(e.to_string()))?
            .map_err(|e| RunError::Confirmation(e.to_string()))?;
        if approved {
            return Ok(0);
        }

        let mut skipped = 0;
        queue.retain(|unit| {
            if unit.overwrites {
                skipped += unit.items.len();
                false
            } else {
                true
            }
        });
        tracing::info!(skipped, "overwrite declined; keeping existing classifications");
        Ok(skipped)
    }
}

fn group_by_id(corpus: Vec<Conversation>) -> Vec<WorkUnit> {
    let mut units: Vec<WorkUnit> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for (index, conversation) in corpus.into_iter().enumerate() {
        match by_id.get(&conversation.id) {
            Some(&slot) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    "duplicate id in corpus; the later occurrence overwrites the earlier"
                );
                units[slot].items.push((index, conversation));
            }
            None => {
                by_id.insert(conversation.id.clone(), units.len());
                units.push(WorkUnit {
                    id: conversation.id.clone(),
                    items: vec![(index, conversation)],
                    overwrites: false,
                });
            }
        }
    }
    units
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<WorkUnit>>>,
    tx: mpsc::Sender<Completion>,
    client: Arc<dyn InferenceClient>,
    builder: Arc<PromptBuilder>,
    policy: Arc<RetryPolicy>,
    cancel: CancellationToken,
    abort: Arc<Mutex<Option<String>>>,
}

impl Worker {
    async fn run(self) {
        let controller = RetryController::new(
            self.client.as_ref(),
            &self.builder,
            &self.policy,
            self.cancel.clone(),
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(unit) = self.queue.lock().await.pop_front() else {
                break;
            };
            tracing::debug!(worker = self.id, conversation_id = %unit.id, "picked up work unit");

            for (index, conversation) in unit.items {
                let outcome = if self.cancel.is_cancelled() {
                    ItemOutcome::Cancelled { attempts: 0 }
                } else {
                    controller.classify(&conversation).await
                };

                if let ItemOutcome::Error(failure) = &outcome {
                    if failure.kind == FailureKind::Authentication {
                        let mut abort = self.abort.lock().await;
                        if abort.is_none() {
                            tracing::error!(
                                conversation_id = %conversation.id,
                                "authentication failed; aborting run: {}",
                                failure.reason
                            );
                            *abort = Some(failure.reason.clone());
                        }
                        self.cancel.cancel();
                    }
                }

                let completion = Completion {
                    index,
                    conversation,
                    outcome,
                };
                if self.tx.send(completion).await.is_err() {
                    tracing::error!(worker = self.id, "result writer stopped; worker exiting");
                    return;
                }
            }
        }
    }
}

/// Sole writer to the store for the duration of a run.
async fn write_loop(
    mut rx: mpsc::Receiver<Completion>,
    store: Arc<dyn RecordStore>,
    provider: String,
    model: String,
    taxonomy_version: String,
    window: Option<usize>,
) -> Tally {
    let mut tally = Tally::default();
    while let Some(Completion {
        index,
        conversation,
        outcome,
    }) = rx.recv().await
    {
        match outcome {
            ItemOutcome::Done {
                result,
                attempts,
                elapsed,
            } => {
                let id = conversation.id.clone();
                let human = result
                    .role(RoleSide::Human)
                    .dominant()
                    .map(|(r, _)| r.to_string());
                let ai = result
                    .role(RoleSide::Ai)
                    .dominant()
                    .map(|(r, _)| r.to_string());
                let metadata = ProvenanceMetadata {
                    model: model.clone(),
                    provider: provider.clone(),
                    prompt_version: taxonomy_version.clone(),
                    timestamp: Utc::now(),
                    processing_time_ms: elapsed.as_millis() as u64,
                    attempts,
                    window,
                };
                let record = ClassificationRecord::classified(conversation, result, metadata);
                match store.put(&record).await {
                    Ok(()) => {
                        tally.succeeded += 1;
                        tracing::info!(
                            conversation_id = %id,
                            attempts,
                            human_role = human.as_deref().unwrap_or("-"),
                            ai_role = ai.as_deref().unwrap_or("-"),
                            "classified"
                        );
                    }
                    Err(err) => {
                        tracing::error!(conversation_id = %id, "failed to persist record: {err}");
                        tally.failures.push((
                            index,
                            FailureEntry::new(
                                &id,
                                ItemFailure {
                                    kind: FailureKind::Storage,
                                    reason: err.to_string(),
                                    attempts,
                                    raw_response: None,
                                },
                            ),
                        ));
                    }
                }
            }
            ItemOutcome::Error(failure) => {
                tally
                    .failures
                    .push((index, FailureEntry::new(&conversation.id, failure)));
            }
            ItemOutcome::Cancelled { .. } => tally.cancelled += 1,
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolelens_schema::Message;

    fn conv(id: &str) -> Conversation {
        Conversation::new(id, vec![Message::user(format!("hello from {id}"))])
    }

    #[test]
    fn duplicates_form_one_unit_in_corpus_order() {
        let units = group_by_id(vec![conv("a"), conv("b"), conv("a"), conv("c")]);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].id, "a");
        let positions: Vec<usize> = units[0].items.iter().map(|(i, _)| *i).collect();
        assert_eq!(positions, vec![0, 2]);
        assert_eq!(units[2].id, "c");
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = RunSummary {
            provider: "ollama".into(),
            model: "m".into(),
            taxonomy_version: "v".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total: 3,
            succeeded: 1,
            skipped: 1,
            failed: 1,
            cancelled: 0,
            failures: vec![FailureEntry {
                id: "x".into(),
                kind: FailureKind::SchemaValidation,
                reason: "bad".into(),
                attempts: 2,
                raw_response: Some("{}".into()),
            }],
            aborted: None,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["taxonomyVersion"], "v");
        assert_eq!(value["failures"][0]["kind"], "schema_validation");
        assert_eq!(value["failures"][0]["rawResponse"], "{}");
        assert!(value.get("aborted").is_none());
        assert_eq!(summary.accounted(), 3);
    }
}
