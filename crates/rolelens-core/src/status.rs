use std::collections::BTreeMap;

use rolelens_schema::{ProvenanceMetadata, TaxonomyRegistry};
use rolelens_store::{RecordStore, StoreError};
use serde::Serialize;

/// Classification coverage of an output store relative to the active taxonomy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub total: usize,
    pub classified: usize,
    pub current: usize,
    pub stale: usize,
    /// Active taxonomy, but another provider, model or transcript window.
    pub different_settings: usize,
    pub unknown_version: usize,
    pub unclassified: usize,
    /// Classified record count per taxonomy version.
    pub by_version: BTreeMap<String, usize>,
}

/// Backend and prompt settings a record must match to count as current.
/// A classify run with the same settings skips exactly the current records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTarget<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub window: Option<usize>,
}

impl StatusTarget<'_> {
    fn matches(&self, meta: &ProvenanceMetadata) -> bool {
        meta.same_backend(self.provider, self.model) && meta.window == self.window
    }
}

pub async fn collect_status(
    store: &dyn RecordStore,
    registry: &TaxonomyRegistry,
    target: StatusTarget<'_>,
) -> Result<StatusReport, StoreError> {
    let mut report = StatusReport::default();
    for id in store.list_ids().await? {
        let Some(record) = store.get(&id).await? else {
            continue;
        };
        report.total += 1;
        if !record.is_classified() {
            report.unclassified += 1;
            continue;
        }
        report.classified += 1;
        let version = record
            .metadata
            .as_ref()
            .map(|meta| meta.prompt_version.clone())
            .unwrap_or_default();
        match record.metadata.as_ref() {
            Some(meta) if registry.is_current(meta) && target.matches(meta) => report.current += 1,
            Some(meta) if registry.is_current(meta) => report.different_settings += 1,
            Some(meta) if registry.is_known(&meta.prompt_version) => report.stale += 1,
            _ => report.unknown_version += 1,
        }
        *report.by_version.entry(version).or_default() += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rolelens_schema::{
        ClassificationRecord, ClassificationResult, Conversation, Message, RoleDistribution,
        RoleJudgment,
    };
    use rolelens_store::MemoryStore;

    const TARGET: StatusTarget<'static> = StatusTarget {
        provider: "ollama",
        model: "m",
        window: None,
    };

    fn record(id: &str, version: Option<&str>) -> ClassificationRecord {
        backend_record(id, version, "ollama", "m")
    }

    fn backend_record(
        id: &str,
        version: Option<&str>,
        provider: &str,
        model: &str,
    ) -> ClassificationRecord {
        let conversation = Conversation::new(id, vec![Message::user("hi")]);
        let Some(version) = version else {
            return ClassificationRecord::unclassified(conversation);
        };
        let judgment = RoleJudgment {
            distribution: RoleDistribution::from_iter([("x".to_string(), 1.0)]),
        };
        let result = ClassificationResult {
            dimensions: BTreeMap::new(),
            human_role: judgment.clone(),
            ai_role: judgment,
            diagnostics: Vec::new(),
        };
        let meta = ProvenanceMetadata {
            model: model.into(),
            provider: provider.into(),
            prompt_version: version.into(),
            timestamp: Utc::now(),
            processing_time_ms: 0,
            attempts: 1,
            window: None,
        };
        ClassificationRecord::classified(conversation, result, meta)
    }

    #[tokio::test]
    async fn buckets_records_by_currency() {
        let registry = TaxonomyRegistry::builtin();
        let active = registry.active_version().to_string();
        let other = registry
            .versions()
            .into_iter()
            .find(|v| *v != active)
            .unwrap()
            .to_string();
        let store = MemoryStore::with_records(vec![
            record("a", Some(&active)),
            record("b", Some(&other)),
            record("c", Some("0.1-retired")),
            record("d", None),
        ]);

        let report = collect_status(&store, &registry, TARGET).await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.classified, 3);
        assert_eq!(report.current, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(report.unknown_version, 1);
        assert_eq!(report.unclassified, 1);
        assert_eq!(report.different_settings, 0);
        assert_eq!(report.by_version["0.1-retired"], 1);
    }

    #[tokio::test]
    async fn active_version_from_another_backend_is_not_current() {
        let registry = TaxonomyRegistry::builtin();
        let active = registry.active_version().to_string();
        let mut windowed = record("d", Some(&active));
        if let Some(meta) = windowed.metadata.as_mut() {
            meta.window = Some(6);
        }
        let store = MemoryStore::with_records(vec![
            record("a", Some(&active)),
            backend_record("b", Some(&active), "openai", "m"),
            backend_record("c", Some(&active), "ollama", "llama3"),
            windowed,
        ]);

        let report = collect_status(&store, &registry, TARGET).await.unwrap();
        assert_eq!(report.classified, 4);
        assert_eq!(report.current, 1);
        assert_eq!(report.different_settings, 3);
        assert_eq!(report.stale, 0);

        let windowed_target = StatusTarget {
            window: Some(6),
            ..TARGET
        };
        let report = collect_status(&store, &registry, windowed_target).await.unwrap();
        assert_eq!(report.current, 1);
        assert_eq!(report.different_settings, 3);
    }
}
