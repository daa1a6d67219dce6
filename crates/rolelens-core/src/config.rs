use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rolelens_provider::{ProviderConfig, ProviderType};
use rolelens_schema::TaxonomyRegistry;
use rolelens_store::{OutputLayout, DEFAULT_GROUP};
use serde::{Deserialize, Serialize};

use crate::prompt::{PromptOptions, Windowing};
use crate::retry::{BackoffPolicy, RetryPolicy};

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_validation_turns() -> usize {
    6
}

fn default_max_schema_retries() -> u32 {
    1
}

fn default_concurrency() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    rolelens_provider::default_max_tokens()
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSection {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Name recorded in provenance. Defaults to the provider type.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Anthropic,
            id: None,
            base_url: None,
            api_key_env: None,
        }
    }
}

impl ProviderSection {
    pub fn api_key_env(&self) -> Option<&str> {
        if let Some(name) = self.api_key_env.as_deref().filter(|n| !n.is_empty()) {
            return Some(name);
        }
        match self.provider_type {
            ProviderType::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderType::OpenAI => Some("OPENAI_API_KEY"),
            ProviderType::Ollama | ProviderType::Custom => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub rate_limit_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            rate_limit_multiplier: 2.0,
        }
    }
}

/// Run configuration, built once at startup and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub model: String,
    /// Upper bound on attempts per conversation, first attempt included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub individual_output: bool,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default)]
    pub preserve_existing: bool,
    #[serde(default)]
    pub windowed: bool,
    #[serde(default = "default_validation_turns")]
    pub validation_turns: usize,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub taxonomy_version: Option<String>,
    #[serde(default)]
    pub few_shot_path: Option<PathBuf>,
    #[serde(default = "default_max_schema_retries")]
    pub max_schema_retries: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub max_message_chars: Option<usize>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub assume_yes: bool,
    #[serde(default)]
    pub force: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_retries: default_max_retries(),
            individual_output: true,
            output_directory: default_output_directory(),
            preserve_existing: false,
            windowed: false,
            validation_turns: default_validation_turns(),
            provider: ProviderSection::default(),
            taxonomy_version: None,
            few_shot_path: None,
            max_schema_retries: default_max_schema_retries(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            max_message_chars: None,
            backoff: BackoffConfig::default(),
            group: default_group(),
            assume_yes: false,
            force: false,
        }
    }
}

impl RunConfig {
    pub fn new(provider_type: ProviderType, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: ProviderSection {
                provider_type,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn output_layout(&self) -> OutputLayout {
        if self.individual_output {
            OutputLayout::Individual
        } else {
            OutputLayout::Combined
        }
    }

    pub fn windowing(&self) -> Windowing {
        if self.windowed {
            Windowing::Trailing {
                turns: self.validation_turns,
            }
        } else {
            Windowing::Full
        }
    }

    pub fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            windowing: self.windowing(),
            max_message_chars: self.max_message_chars,
            max_tokens: self.max_tokens,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_schema_retries(self.max_schema_retries)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_backoff(BackoffPolicy {
                base_delay: Duration::from_millis(self.backoff.base_ms),
                max_delay: Duration::from_millis(self.backoff.max_ms),
                rate_limit_multiplier: self.backoff.rate_limit_multiplier,
            })
    }

    /// Built-in taxonomies with the configured version active.
    pub fn taxonomy_registry(&self) -> Result<TaxonomyRegistry> {
        let registry = TaxonomyRegistry::builtin();
        match self.taxonomy_version.as_deref() {
            Some(version) => registry
                .with_active(version)
                .with_context(|| format!("invalid taxonomyVersion: {version}")),
            None => Ok(registry),
        }
    }

    pub fn provider_config(&self, api_key: Option<String>) -> ProviderConfig {
        let mut config = ProviderConfig::new(self.provider.provider_type, &self.model);
        if let Some(id) = self.provider.id.as_deref().filter(|id| !id.is_empty()) {
            config = config.with_id(id);
        }
        if let Some(base_url) = &self.provider.base_url {
            config = config.with_base_url(base_url);
        }
        config.api_key = api_key;
        config
    }

    /// Read the provider credential from the environment. Hosted providers
    /// fail when it is absent.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        let Some(var) = self.provider.api_key_env() else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Ok(Some(key)),
            _ if self.provider.provider_type.requires_api_key() => Err(anyhow!(
                "environment variable {var} is not set (required by {} provider)",
                self.provider.provider_type.as_str()
            )),
            _ => Ok(None),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_directory.join("logs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output_directory.join("reports")
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub provider_type: Option<ProviderType>,
    pub base_url: Option<String>,
    pub output_directory: Option<PathBuf>,
    pub max_retries: Option<u32>,
    pub concurrency: Option<usize>,
    pub taxonomy_version: Option<String>,
    pub few_shot_path: Option<PathBuf>,
    pub group: Option<String>,
    pub windowed: Option<bool>,
    pub validation_turns: Option<usize>,
    pub combined_output: bool,
    pub preserve_existing: bool,
    pub force: bool,
    pub assume_yes: bool,
}

impl ConfigOverrides {
    pub fn apply(self, mut config: RunConfig) -> Result<RunConfig> {
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(provider_type) = self.provider_type {
            if provider_type != config.provider.provider_type {
                config.provider = ProviderSection {
                    provider_type,
                    ..Default::default()
                };
            }
        }
        if let Some(base_url) = self.base_url {
            config.provider.base_url = Some(base_url);
        }
        if let Some(dir) = self.output_directory {
            config.output_directory = dir;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(version) = self.taxonomy_version {
            config.taxonomy_version = Some(version);
        }
        if let Some(path) = self.few_shot_path {
            config.few_shot_path = Some(path);
        }
        if let Some(group) = self.group {
            config.group = group;
        }
        if let Some(windowed) = self.windowed {
            config.windowed = windowed;
        }
        if let Some(turns) = self.validation_turns {
            config.validation_turns = turns;
        }
        config.individual_output &= !self.combined_output;
        config.preserve_existing |= self.preserve_existing;
        config.force |= self.force;
        config.assume_yes |= self.assume_yes;

        validate_config(&config)?;
        Ok(config)
    }
}

pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_path_env(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(raw) => PathBuf::from(resolve_env_var(raw)),
        None => path.to_path_buf(),
    }
}

fn resolve_config_env(config: &mut RunConfig) {
    config.model = resolve_env_var(&config.model);
    config.group = resolve_env_var(&config.group);
    config.output_directory = resolve_path_env(&config.output_directory);

    if let Some(path) = &mut config.few_shot_path {
        *path = resolve_path_env(path);
    }
    if let Some(version) = &mut config.taxonomy_version {
        *version = resolve_env_var(version);
    }
    if let Some(id) = &mut config.provider.id {
        *id = resolve_env_var(id);
    }
    if let Some(base_url) = &mut config.provider.base_url {
        *base_url = resolve_env_var(base_url);
    }
    if let Some(var) = &mut config.provider.api_key_env {
        *var = resolve_env_var(var);
    }
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let mut config: RunConfig = read_yaml_file(path)?;
    resolve_config_env(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Checks that do not depend on the model being known yet; the model may
/// still come from the command line.
pub fn validate_config(config: &RunConfig) -> Result<()> {
    if config.force && config.preserve_existing {
        bail!("force and preserveExisting are mutually exclusive");
    }
    if config.concurrency == 0 {
        bail!("concurrency must be at least 1");
    }
    if config.windowed && config.validation_turns == 0 {
        bail!("validationTurns must be at least 1 when windowed is enabled");
    }
    if config.timeout_secs == 0 {
        bail!("timeoutSecs must be greater than 0");
    }
    if config.max_tokens == 0 {
        bail!("maxTokens must be greater than 0");
    }
    if config.max_message_chars == Some(0) {
        bail!("maxMessageChars must be greater than 0 when set");
    }
    if config.backoff.base_ms > config.backoff.max_ms {
        bail!(
            "backoff.baseMs ({}) exceeds backoff.maxMs ({})",
            config.backoff.base_ms,
            config.backoff.max_ms
        );
    }
    if !config.backoff.rate_limit_multiplier.is_finite()
        || config.backoff.rate_limit_multiplier < 1.0
    {
        bail!("backoff.rateLimitMultiplier must be a finite number >= 1");
    }
    if config.provider.provider_type == ProviderType::Custom && config.provider.base_url.is_none()
    {
        bail!("custom provider requires provider.baseUrl");
    }
    if let Some(version) = config.taxonomy_version.as_deref() {
        let registry = TaxonomyRegistry::builtin();
        if !registry.is_known(version) {
            bail!(
                "unknown taxonomyVersion: {version} (known: {})",
                registry.versions().join(", ")
            );
        }
    }
    let group_ok = !config.group.is_empty()
        && !config.group.starts_with('.')
        && config
            .group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !rolelens_store::file_store::RESERVED_DIRS.contains(&config.group.as_str())
        && config.group != "manifest";
    if !group_ok {
        bail!("invalid group name: {:?}", config.group);
    }
    Ok(())
}

/// Final check once every override is in.
pub fn require_model(config: &RunConfig) -> Result<()> {
    if config.model.trim().is_empty() {
        bail!("model is not set (use the config file or --model)");
    }
    Ok(())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}
