use std::time::{Duration, Instant};

use rolelens_provider::{InferenceClient, InferenceError, ProviderErrorKind};
use rolelens_schema::{ClassificationResult, Conversation};
use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::parser::{parse_response, SchemaValidationError};
use crate::prompt::PromptBuilder;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            rate_limit_multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based). Never shorter than
    /// `previous`, never longer than `max_delay`.
    pub fn delay(
        &self,
        retry: u32,
        kind: FailureKind,
        retry_after: Option<Duration>,
        previous: Duration,
    ) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let mut delay = self.base_delay.saturating_mul(1u32 << exponent);
        if kind == FailureKind::RateLimit {
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * self.rate_limit_multiplier)
                .unwrap_or(self.max_delay);
            if let Some(after) = retry_after {
                delay = delay.max(after);
            }
        }
        delay.min(self.max_delay).max(previous)
    }
}

/// Attempt budget for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    max_schema_retries: u32,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl RetryPolicy {
    /// `max_retries` counts every attempt, the first included. Zero still
    /// allows the first attempt.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            max_schema_retries: 1,
            timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_schema_retries(mut self, retries: u32) -> Self {
        self.max_schema_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_schema_retries(&self) -> u32 {
        self.max_schema_retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

/// Why an item ended in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    RateLimit,
    Authentication,
    Backend,
    SchemaValidation,
    Storage,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::SchemaValidation
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Backend => "backend",
            Self::SchemaValidation => "schema_validation",
            Self::Storage => "storage",
        }
    }
}

impl From<ProviderErrorKind> for FailureKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::Network => Self::Network,
            ProviderErrorKind::RateLimit => Self::RateLimit,
            ProviderErrorKind::Authentication => Self::Authentication,
            ProviderErrorKind::Backend => Self::Backend,
        }
    }
}

/// Lifecycle of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Sent,
    Succeeded,
    RetryableFailed,
    FatalFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Done {
        result: ClassificationResult,
        attempts: u32,
        elapsed: Duration,
    },
    Error(ItemFailure),
    /// The run was cancelled while this item waited to retry.
    Cancelled { attempts: u32 },
}

impl ItemOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Done { attempts, .. } | Self::Cancelled { attempts } => *attempts,
            Self::Error(failure) => failure.attempts,
        }
    }
}

enum Failure {
    Inference(InferenceError),
    Schema(SchemaValidationError),
}

/// Drives one conversation through build, submit, parse and retry.
pub struct RetryController<'a> {
    client: &'a dyn InferenceClient,
    builder: &'a PromptBuilder,
    policy: &'a RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> RetryController<'a> {
    pub fn new(
        client: &'a dyn InferenceClient,
        builder: &'a PromptBuilder,
        policy: &'a RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            builder,
            policy,
            cancel,
        }
    }

    pub async fn classify(&self, conversation: &Conversation) -> ItemOutcome {
        let id = conversation.id.as_str();
        let started = Instant::now();
        let base_request = self.builder.build(conversation);
        let mut request = base_request.clone();
        let mut attempts = 0u32;
        let mut schema_retries = 0u32;
        let mut delay = Duration::ZERO;
        let mut state = AttemptState::Pending;

        loop {
            attempts += 1;
            state = transition(id, state, AttemptState::Sent, attempts);

            let failure = match self.client.submit(&request, self.policy.timeout).await {
                Ok(raw) => match parse_response(&raw, self.builder.taxonomy()) {
                    Ok(result) => {
                        transition(id, state, AttemptState::Succeeded, attempts);
                        return ItemOutcome::Done {
                            result,
                            attempts,
                            elapsed: started.elapsed(),
                        };
                    }
                    Err(err) => Failure::Schema(err),
                },
                Err(err) => Failure::Inference(err),
            };

            let (kind, reason, raw_response, retry_after) = match &failure {
                Failure::Inference(err) => (
                    FailureKind::from(err.kind()),
                    err.to_string(),
                    None,
                    err.retry_after(),
                ),
                Failure::Schema(err) => (
                    FailureKind::SchemaValidation,
                    err.reason.clone(),
                    Some(err.raw.clone()),
                    None,
                ),
            };

            let budget_left = attempts < self.policy.max_attempts;
            let retry = kind.is_retryable()
                && budget_left
                && (kind != FailureKind::SchemaValidation
                    || schema_retries < self.policy.max_schema_retries);
            if !retry {
                state = transition(id, state, AttemptState::FatalFailed, attempts);
                tracing::warn!(
                    conversation_id = id,
                    attempts,
                    kind = kind.as_str(),
                    ?state,
                    "classification failed: {reason}"
                );
                return ItemOutcome::Error(ItemFailure {
                    kind,
                    reason,
                    attempts,
                    raw_response,
                });
            }

            state = transition(id, state, AttemptState::RetryableFailed, attempts);
            if let Failure::Schema(err) = &failure {
                schema_retries += 1;
                request = self.builder.corrective(&base_request, &err.raw, err);
            }

            delay = self
                .policy
                .backoff
                .delay(attempts, kind, retry_after, delay);
            tracing::warn!(
                conversation_id = id,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                kind = kind.as_str(),
                backoff_ms = delay.as_millis() as u64,
                "retryable failure: {reason}"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(conversation_id = id, attempts, "cancelled during backoff");
                    return ItemOutcome::Cancelled { attempts };
                }
                _ = time::sleep(delay) => {}
            }
        }
    }
}

fn transition(id: &str, from: AttemptState, to: AttemptState, attempt: u32) -> AttemptState {
    tracing::trace!(conversation_id = id, attempt, ?from, ?to, "attempt state");
    to
}
