use std::collections::BTreeMap;

use rolelens_schema::{
    ClassificationResult, Diagnostic, DimensionJudgment, RoleDistribution, RoleJudgment, RoleSide,
    Taxonomy, DISTRIBUTION_TOLERANCE,
};
use serde_json::{Map, Value};

/// A backend answer that does not fit the taxonomy. Retryable with a
/// corrective prompt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct SchemaValidationError {
    pub reason: String,
    /// Dimension or role field the problem was found in.
    pub dimension: Option<String>,
    pub raw: String,
}

impl SchemaValidationError {
    pub fn new(reason: impl Into<String>, dimension: Option<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            dimension,
            raw: raw.into(),
        }
    }
}

/// Locate the JSON object in free text: a ```json fence, any fence holding
/// an object, or the span from the first `{` to the last `}`.
pub fn extract_json_block(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Some(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') {
                return Some(block);
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&trimmed[start..=end]),
        _ => None,
    }
}

/// Parse and validate a raw backend answer against `taxonomy`.
pub fn parse_response(
    raw: &str,
    taxonomy: &Taxonomy,
) -> Result<ClassificationResult, SchemaValidationError> {
    if raw.trim().is_empty() {
        return Err(SchemaValidationError::new("response was empty", None, raw));
    }
    let block = extract_json_block(raw)
        .ok_or_else(|| SchemaValidationError::new("no JSON object found in response", None, raw))?;
    let value: Value = serde_json::from_str(block).map_err(|e| {
        SchemaValidationError::new(format!("response is not valid JSON: {e}"), None, raw)
    })?;
    Validator { taxonomy, raw }.validate(&value)
}

/// Validate an already-parsed classification object, e.g. a few-shot example.
pub fn validate_value(
    value: &Value,
    taxonomy: &Taxonomy,
) -> Result<ClassificationResult, SchemaValidationError> {
    let raw = value.to_string();
    Validator {
        taxonomy,
        raw: &raw,
    }
    .validate(value)
}

struct Validator<'a> {
    taxonomy: &'a Taxonomy,
    raw: &'a str,
}

impl Validator<'_> {
    fn fail(&self, reason: impl Into<String>, field: Option<&str>) -> SchemaValidationError {
        SchemaValidationError::new(reason, field.map(str::to_string), self.raw)
    }

    fn validate(&self, value: &Value) -> Result<ClassificationResult, SchemaValidationError> {
        let object = value
            .as_object()
            .ok_or_else(|| self.fail("top-level JSON value is not an object", None))?;

        for key in object.keys() {
            let known = self.taxonomy.dimension(key).is_some()
                || key == RoleSide::Human.field_name()
                || key == RoleSide::Ai.field_name();
            if !known {
                return Err(self.fail(format!("unexpected key \"{key}\""), Some(key.as_str())));
            }
        }

        let mut diagnostics = Vec::new();
        let mut dimensions = BTreeMap::new();
        for dim in &self.taxonomy.dimensions {
            let judgment = object.get(&dim.name).ok_or_else(|| {
                self.fail(
                    format!("missing dimension \"{}\"", dim.name),
                    Some(dim.name.as_str()),
                )
            })?;
            let judgment = self.judgment(&dim.name, judgment, &mut diagnostics)?;
            if !dim.allows(&judgment.category) {
                return Err(self.fail(
                    format!(
                        "unknown category \"{}\" for dimension \"{}\"",
                        judgment.category, dim.name
                    ),
                    Some(dim.name.as_str()),
                ));
            }
            dimensions.insert(dim.name.clone(), judgment);
        }

        let human_role = self.role(RoleSide::Human, object, &mut diagnostics)?;
        let ai_role = self.role(RoleSide::Ai, object, &mut diagnostics)?;

        Ok(ClassificationResult {
            dimensions,
            human_role,
            ai_role,
            diagnostics,
        })
    }

    fn judgment(
        &self,
        name: &str,
        value: &Value,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<DimensionJudgment, SchemaValidationError> {
        let shape_error = || {
            self.fail(
                format!("dimension \"{name}\" must be {{\"category\": string, \"confidence\": number}}"),
                Some(name),
            )
        };
        let object = value.as_object().ok_or_else(shape_error)?;
        if object.len() != 2 {
            return Err(shape_error());
        }
        let category = object
            .get("category")
            .and_then(Value::as_str)
            .ok_or_else(shape_error)?;
        let confidence = object
            .get("confidence")
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite())
            .ok_or_else(shape_error)?;

        let clamped = confidence.clamp(0.0, 1.0);
        if clamped != confidence {
            diagnostics.push(Diagnostic::ConfidenceClamped {
                dimension: name.to_string(),
                original: confidence,
            });
        }
        Ok(DimensionJudgment {
            category: category.to_string(),
            confidence: clamped,
        })
    }

    fn role(
        &self,
        side: RoleSide,
        object: &Map<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<RoleJudgment, SchemaValidationError> {
        let field = side.field_name();
        let shape_error = || {
            self.fail(
                format!("\"{field}\" must be {{\"distribution\": {{role: number}}}}"),
                Some(field),
            )
        };

        let wrapper = object
            .get(field)
            .ok_or_else(|| self.fail(format!("missing \"{field}\""), Some(field)))?
            .as_object()
            .ok_or_else(shape_error)?;
        if wrapper.len() != 1 {
            return Err(shape_error());
        }
        let given = wrapper
            .get("distribution")
            .and_then(Value::as_object)
            .ok_or_else(shape_error)?;

        for role in given.keys() {
            if !self.taxonomy.has_role(side, role) {
                return Err(self.fail(
                    format!("unknown {side} role \"{role}\" in {field}"),
                    Some(field),
                ));
            }
        }

        let mut values = BTreeMap::new();
        for role in self.taxonomy.role_labels(side) {
            let p = match given.get(role) {
                None => 0.0,
                Some(v) => v.as_f64().filter(|p| p.is_finite()).ok_or_else(|| {
                    self.fail(
                        format!("probability for \"{role}\" in {field} is not a number"),
                        Some(field),
                    )
                })?,
            };
            if p < 0.0 {
                return Err(self.fail(
                    format!("negative probability {p} for \"{role}\" in {field}"),
                    Some(field),
                ));
            }
            values.insert(role.to_string(), p);
        }

        let mut distribution = RoleDistribution::new(values);
        let sum = distribution.sum();
        if sum <= 0.0 {
            return Err(self.fail(format!("{field} distribution is all zero"), Some(field)));
        }
        if (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
            let original_sum = distribution.rescale();
            tracing::debug!(side = %side, original_sum, "normalized role distribution");
            diagnostics.push(Diagnostic::DistributionNormalized { side, original_sum });
        }
        Ok(RoleJudgment { distribution })
    }
}
