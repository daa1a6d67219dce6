pub mod taxonomy;
pub mod taxonomy_presets;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use taxonomy::{Dimension, RoleDefinition, Taxonomy, TaxonomyError, TaxonomyRegistry};
pub use taxonomy_presets::{INTERACTION_ROLES_VERSION, SOCIAL_ROLE_THEORY_VERSION};

/// Allowed deviation of a role distribution's sum from 1.0.
pub const DISTRIBUTION_TOLERANCE: f64 = 0.01;

// ============================================================
// Corpus
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
    /// Fields written by ingestion or other tooling, carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages,
            extra: serde_json::Map::new(),
        }
    }
}

// ============================================================
// Classification results
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoleSide {
    Human,
    Ai,
}

impl RoleSide {
    /// Key of this side's distribution inside a persisted classification.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Human => "humanRole",
            Self::Ai => "aiRole",
        }
    }
}

impl fmt::Display for RoleSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Ai => write!(f, "ai"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionJudgment {
    pub category: String,
    pub confidence: f64,
}

/// Probability assigned to each role of one vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RoleDistribution(BTreeMap<String, f64>);

impl RoleDistribution {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self(values)
    }

    pub fn get(&self, role: &str) -> Option<f64> {
        self.0.get(role).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= DISTRIBUTION_TOLERANCE
    }

    /// Role with the highest probability. Ties resolve to the first role in key order.
    pub fn dominant(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (role, p) in self.iter() {
            match best {
                Some((_, bp)) if p <= bp => {}
                _ => best = Some((role, p)),
            }
        }
        best
    }

    /// Rescale so the values sum to exactly 1.0. Returns the sum before rescaling.
    pub fn rescale(&mut self) -> f64 {
        let sum = self.sum();
        if sum > 0.0 {
            for value in self.0.values_mut() {
                *value /= sum;
            }
        }
        sum
    }

    pub fn into_inner(self) -> BTreeMap<String, f64> {
        self.0
    }
}

impl FromIterator<(String, f64)> for RoleDistribution {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleJudgment {
    pub distribution: RoleDistribution,
}

/// Non-fatal corrections applied while validating a backend answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Diagnostic {
    DistributionNormalized { side: RoleSide, original_sum: f64 },
    ConfidenceClamped { dimension: String, original: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    #[serde(flatten)]
    pub dimensions: BTreeMap<String, DimensionJudgment>,
    #[serde(rename = "humanRole")]
    pub human_role: RoleJudgment,
    #[serde(rename = "aiRole")]
    pub ai_role: RoleJudgment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl ClassificationResult {
    pub fn role(&self, side: RoleSide) -> &RoleDistribution {
        match side {
            RoleSide::Human => &self.human_role.distribution,
            RoleSide::Ai => &self.ai_role.distribution,
        }
    }

    pub fn judgment(&self, dimension: &str) -> Option<&DimensionJudgment> {
        self.dimensions.get(dimension)
    }
}

fn default_attempts() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceMetadata {
    pub model: String,
    #[serde(default)]
    pub provider: String,
    /// Taxonomy version the prompt was built from.
    pub prompt_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Trailing message count shown to the backend. Absent when the whole
    /// transcript was shown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<usize>,
}

impl ProvenanceMetadata {
    pub fn same_backend(&self, provider: &str, model: &str) -> bool {
        self.provider == provider && self.model == model
    }
}

// ============================================================
// Persistence
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationRecord {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResult>,
    #[serde(
        rename = "classificationMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<ProvenanceMetadata>,
}

impl ClassificationRecord {
    pub fn unclassified(conversation: Conversation) -> Self {
        Self {
            conversation,
            classification: None,
            metadata: None,
        }
    }

    pub fn classified(
        conversation: Conversation,
        classification: ClassificationResult,
        metadata: ProvenanceMetadata,
    ) -> Self {
        Self {
            conversation,
            classification: Some(classification),
            metadata: Some(metadata),
        }
    }

    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    pub fn is_classified(&self) -> bool {
        self.classification.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: String,
    pub file: String,
}

/// Authoritative index of persisted records, grouped by logical source name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Manifest {
    groups: BTreeMap<String, Vec<ManifestEntry>>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `id` at `file` under `group`. An existing entry keeps its position;
    /// an entry for the same id under another group is removed.
    pub fn upsert(&mut self, group: &str, id: &str, file: &str) {
        for (name, entries) in self.groups.iter_mut() {
            if name != group {
                entries.retain(|e| e.id != id);
            }
        }
        self.groups.retain(|name, entries| name == group || !entries.is_empty());

        let entries = self.groups.entry(group.to_string()).or_default();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry.file = file.to_string(),
            None => entries.push(ManifestEntry {
                id: id.to_string(),
                file: file.to_string(),
            }),
        }
    }

    pub fn locate(&self, id: &str) -> Option<(&str, &ManifestEntry)> {
        self.groups.iter().find_map(|(group, entries)| {
            entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| (group.as_str(), e))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.locate(id).is_some()
    }

    /// Every id, grouped by name and in insertion order within a group.
    pub fn ids(&self) -> Vec<String> {
        self.entries().map(|(_, e)| e.id.clone()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.groups
            .iter()
            .flat_map(|(group, entries)| entries.iter().map(move |e| (group.as_str(), e)))
    }

    pub fn group(&self, name: &str) -> Option<&[ManifestEntry]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A worked example shown to the backend ahead of the conversation under test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FewShotExample {
    pub transcript: String,
    pub classification: serde_json::Value,
}
