//! Versioned taxonomies and the registry that resolves them.

use serde::{Deserialize, Serialize};

use crate::taxonomy_presets::{TaxonomyPreset, SOCIAL_ROLE_THEORY_VERSION, TAXONOMY_PRESETS};
use crate::{ProvenanceMetadata, RoleSide};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaxonomyError {
    #[error("unknown taxonomy version: {0}")]
    UnknownVersion(String),
    #[error("taxonomy version already registered: {0}")]
    DuplicateVersion(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
}

impl Dimension {
    pub fn allows(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleDefinition {
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Taxonomy {
    pub version: String,
    pub dimensions: Vec<Dimension>,
    pub human_roles: Vec<RoleDefinition>,
    pub ai_roles: Vec<RoleDefinition>,
}

impl Taxonomy {
    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn roles(&self, side: RoleSide) -> &[RoleDefinition] {
        match side {
            RoleSide::Human => &self.human_roles,
            RoleSide::Ai => &self.ai_roles,
        }
    }

    /// Role labels for one side, in vocabulary order.
    pub fn role_labels(&self, side: RoleSide) -> Vec<&str> {
        self.roles(side).iter().map(|r| r.label.as_str()).collect()
    }

    pub fn has_role(&self, side: RoleSide, label: &str) -> bool {
        self.roles(side).iter().any(|r| r.label == label)
    }
}

impl From<&TaxonomyPreset> for Taxonomy {
    fn from(preset: &TaxonomyPreset) -> Self {
        let roles = |defs: &[crate::taxonomy_presets::RolePreset]| {
            defs.iter()
                .map(|r| RoleDefinition {
                    label: r.label.to_string(),
                    description: r.description.to_string(),
                })
                .collect()
        };
        Self {
            version: preset.version.to_string(),
            dimensions: preset
                .dimensions
                .iter()
                .map(|d| Dimension {
                    name: d.name.to_string(),
                    description: d.description.to_string(),
                    categories: d.categories.iter().map(|c| c.to_string()).collect(),
                })
                .collect(),
            human_roles: roles(preset.human_roles),
            ai_roles: roles(preset.ai_roles),
        }
    }
}

/// Holds every known taxonomy version and which one is active.
#[derive(Debug, Clone)]
pub struct TaxonomyRegistry {
    taxonomies: Vec<Taxonomy>,
    active: usize,
}

impl TaxonomyRegistry {
    /// Registry with every built-in version, `2.0-social-role-theory` active.
    pub fn builtin() -> Self {
        let taxonomies: Vec<Taxonomy> = TAXONOMY_PRESETS.iter().map(Taxonomy::from).collect();
        let active = taxonomies
            .iter()
            .position(|t| t.version == SOCIAL_ROLE_THEORY_VERSION)
            .unwrap_or(0);
        Self { taxonomies, active }
    }

    pub fn register(&mut self, taxonomy: Taxonomy) -> Result<(), TaxonomyError> {
        if self.get(&taxonomy.version).is_some() {
            return Err(TaxonomyError::DuplicateVersion(taxonomy.version));
        }
        tracing::debug!(version = %taxonomy.version, "registered taxonomy");
        self.taxonomies.push(taxonomy);
        Ok(())
    }

    pub fn set_active(&mut self, version: &str) -> Result<(), TaxonomyError> {
        self.active = self
            .taxonomies
            .iter()
            .position(|t| t.version == version)
            .ok_or_else(|| TaxonomyError::UnknownVersion(version.to_string()))?;
        Ok(())
    }

    pub fn with_active(mut self, version: &str) -> Result<Self, TaxonomyError> {
        self.set_active(version)?;
        Ok(self)
    }

    pub fn get(&self, version: &str) -> Option<&Taxonomy> {
        self.taxonomies.iter().find(|t| t.version == version)
    }

    pub fn active(&self) -> &Taxonomy {
        &self.taxonomies[self.active]
    }

    pub fn active_version(&self) -> &str {
        &self.active().version
    }

    pub fn versions(&self) -> Vec<&str> {
        self.taxonomies.iter().map(|t| t.version.as_str()).collect()
    }

    pub fn dimensions(&self, version: &str) -> Option<&[Dimension]> {
        self.get(version).map(|t| t.dimensions.as_slice())
    }

    pub fn role_vocabulary(&self, version: &str, side: RoleSide) -> Option<Vec<&str>> {
        self.get(version).map(|t| t.role_labels(side))
    }

    pub fn is_known(&self, version: &str) -> bool {
        self.get(version).is_some()
    }

    /// True iff the metadata was produced under the active taxonomy version.
    pub fn is_current(&self, metadata: &ProvenanceMetadata) -> bool {
        metadata.prompt_version == self.active_version()
    }
}

impl Default for TaxonomyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
