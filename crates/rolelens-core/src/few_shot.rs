use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rolelens_schema::{FewShotExample, Taxonomy};

use crate::parser::validate_value;

/// Load an ordered few-shot set and check each example against `taxonomy`.
pub fn load_few_shot(path: &Path, taxonomy: &Taxonomy) -> Result<Vec<FewShotExample>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read few-shot file: {}", path.display()))?;
    let examples: Vec<FewShotExample> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse few-shot file: {}", path.display()))?;
    validate_examples(&examples, taxonomy).with_context(|| {
        format!(
            "few-shot file {} does not fit taxonomy {}",
            path.display(),
            taxonomy.version
        )
    })?;
    tracing::info!(count = examples.len(), path = %path.display(), "loaded few-shot examples");
    Ok(examples)
}

pub fn validate_examples(examples: &[FewShotExample], taxonomy: &Taxonomy) -> Result<()> {
    for (index, example) in examples.iter().enumerate() {
        if example.transcript.trim().is_empty() {
            anyhow::bail!("example {} has an empty transcript", index + 1);
        }
        let result = validate_value(&example.classification, taxonomy)
            .with_context(|| format!("example {} is invalid", index + 1))?;
        if !result.diagnostics.is_empty() {
            anyhow::bail!(
                "example {} needed corrections ({} diagnostics); fix it at the source",
                index + 1,
                result.diagnostics.len()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolelens_schema::{RoleSide, TaxonomyRegistry};
    use serde_json::{json, Map, Value};

    fn classification(taxonomy: &Taxonomy) -> Value {
        let mut object = Map::new();
        for dim in &taxonomy.dimensions {
            object.insert(
                dim.name.clone(),
                json!({"category": dim.categories[0], "confidence": 0.9}),
            );
        }
        for side in [RoleSide::Human, RoleSide::Ai] {
            let role = taxonomy.role_labels(side)[0];
            object.insert(side.field_name().into(), json!({"distribution": {role: 1.0}}));
        }
        Value::Object(object)
    }

    #[test]
    fn valid_examples_load_in_order() {
        let taxonomy = TaxonomyRegistry::builtin().active().clone();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("few_shot.json");
        let payload = json!([
            {"transcript": "USER: one", "classification": classification(&taxonomy)},
            {"transcript": "USER: two", "classification": classification(&taxonomy)}
        ]);
        fs::write(&path, payload.to_string()).unwrap();

        let examples = load_few_shot(&path, &taxonomy).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].transcript, "USER: two");
    }

    #[test]
    fn example_outside_taxonomy_is_a_config_error() {
        let taxonomy = TaxonomyRegistry::builtin().active().clone();
        let mut bad = classification(&taxonomy);
        bad[&taxonomy.dimensions[0].name] = json!({"category": "invented", "confidence": 0.5});
        let examples = vec![FewShotExample {
            transcript: "USER: hi".into(),
            classification: bad,
        }];
        let err = validate_examples(&examples, &taxonomy).unwrap_err();
        assert!(format!("{err:#}").contains("invented"));
    }

    #[test]
    fn example_needing_normalization_is_rejected() {
        let taxonomy = TaxonomyRegistry::builtin().active().clone();
        let mut bad = classification(&taxonomy);
        let role = taxonomy.role_labels(RoleSide::Human)[0];
        bad["humanRole"] = json!({"distribution": {role: 0.5}});
        let examples = vec![FewShotExample {
            transcript: "USER: hi".into(),
            classification: bad,
        }];
        assert!(validate_examples(&examples, &taxonomy).is_err());
    }
}
