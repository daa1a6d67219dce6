use std::fmt::Write as _;

use rolelens_provider::{InferenceRequest, PromptMessage};
use rolelens_schema::{Conversation, FewShotExample, Message, MessageRole, RoleSide, Taxonomy};

use crate::parser::SchemaValidationError;

pub const TRUNCATION_MARKER: &str = "[truncated]";

/// Which part of a transcript is shown to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Windowing {
    #[default]
    Full,
    /// Only the last `turns` messages.
    Trailing { turns: usize },
}

impl Windowing {
    pub fn apply<'a>(&self, messages: &'a [Message]) -> &'a [Message] {
        match *self {
            Self::Full => messages,
            Self::Trailing { turns } => &messages[messages.len().saturating_sub(turns)..],
        }
    }

    /// Trailing message count, or `None` for the full transcript.
    pub fn turns(&self) -> Option<usize> {
        match *self {
            Self::Full => None,
            Self::Trailing { turns } => Some(turns),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptOptions {
    pub windowing: Windowing,
    pub max_message_chars: Option<usize>,
    pub max_tokens: u32,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            windowing: Windowing::Full,
            max_message_chars: None,
            max_tokens: rolelens_provider::default_max_tokens(),
        }
    }
}

/// Renders classification requests for one taxonomy version.
///
/// The system prompt depends only on the taxonomy and the few-shot set, so it
/// is rendered once and shared by every request.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    taxonomy: Taxonomy,
    options: PromptOptions,
    system: String,
}

impl PromptBuilder {
    pub fn new(taxonomy: Taxonomy, examples: Vec<FewShotExample>, options: PromptOptions) -> Self {
        let system = render_system_prompt(&taxonomy, &examples);
        Self {
            taxonomy,
            options,
            system,
        }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn taxonomy_version(&self) -> &str {
        &self.taxonomy.version
    }

    pub fn windowing(&self) -> Windowing {
        self.options.windowing
    }

    pub fn system_prompt(&self) -> &str {
        &self.system
    }

    pub fn build(&self, conversation: &Conversation) -> InferenceRequest {
        let transcript = self.render_transcript(conversation);
        let user = format!(
            "Classify the following conversation.\n\n<transcript>\n{transcript}</transcript>\n\n\
             Respond with a single JSON object and nothing else."
        );
        InferenceRequest {
            system: Some(self.system.clone()),
            messages: vec![PromptMessage::user(user)],
            max_tokens: self.options.max_tokens,
            temperature: Some(0.0),
        }
    }

    /// Follow-up to `previous` that shows the backend its invalid answer and
    /// asks for a corrected object.
    pub fn corrective(
        &self,
        previous: &InferenceRequest,
        raw_answer: &str,
        error: &SchemaValidationError,
    ) -> InferenceRequest {
        let mut correction = format!(
            "Your previous answer could not be accepted: {}.\n",
            error.reason
        );
        if let Some(dimension) = error.dimension.as_deref() {
            if let Some(dim) = self.taxonomy.dimension(dimension) {
                let _ = writeln!(
                    correction,
                    "Allowed categories for \"{}\": {}.",
                    dim.name,
                    dim.categories.join(", ")
                );
            } else if let Some(side) = side_for_field(dimension) {
                let _ = writeln!(
                    correction,
                    "Allowed roles for \"{}\": {}.",
                    dimension,
                    self.taxonomy.role_labels(side).join(", ")
                );
            }
        }
        correction.push_str(
            "Reply again with one corrected JSON object that follows the required format exactly.",
        );

        let mut request = previous.clone();
        // Chat backends reject an empty assistant turn.
        if !raw_answer.trim().is_empty() {
            request
                .messages
                .push(PromptMessage::assistant(raw_answer.to_string()));
        }
        request.messages.push(PromptMessage::user(correction));
        request
    }

    pub fn render_transcript(&self, conversation: &Conversation) -> String {
        let all = &conversation.messages;
        let shown = self.options.windowing.apply(all);
        let mut out = String::new();
        if shown.len() < all.len() {
            let _ = writeln!(
                out,
                "(showing the last {} of {} messages)",
                shown.len(),
                all.len()
            );
        }
        for message in shown {
            let speaker = match message.role {
                MessageRole::User => "USER",
                MessageRole::Assistant => "ASSISTANT",
            };
            let content = truncate(&message.content, self.options.max_message_chars);
            let _ = writeln!(out, "{speaker}: {content}");
        }
        out
    }
}

fn side_for_field(field: &str) -> Option<RoleSide> {
    [RoleSide::Human, RoleSide::Ai]
        .into_iter()
        .find(|side| side.field_name() == field)
}

fn truncate(content: &str, max_chars: Option<usize>) -> String {
    match max_chars {
        Some(max) if content.chars().count() > max => {
            let kept: String = content.chars().take(max).collect();
            format!("{kept} {TRUNCATION_MARKER}")
        }
        _ => content.to_string(),
    }
}

fn render_system_prompt(taxonomy: &Taxonomy, examples: &[FewShotExample]) -> String {
    let mut out = String::new();
    out.push_str(
        "You analyse conversations between a human and an AI assistant. \
         Judge the conversation as a whole along every dimension below, then \
         describe the social role each participant plays as a probability \
         distribution over the listed roles.\n\n",
    );
    let _ = writeln!(out, "Taxonomy version: {}\n", taxonomy.version);

    out.push_str("## Dimensions\n");
    for dim in &taxonomy.dimensions {
        let _ = writeln!(out, "- {}: {}", dim.name, dim.description);
        let _ = writeln!(out, "  categories: {}", dim.categories.join(", "));
    }

    for side in [RoleSide::Human, RoleSide::Ai] {
        let _ = writeln!(out, "\n## {} roles ({})", side_title(side), side.field_name());
        for role in taxonomy.roles(side) {
            let _ = writeln!(out, "- {}: {}", role.label, role.description);
        }
    }

    out.push_str("\n## Output format\n");
    out.push_str(
        "Return exactly one JSON object with these keys and no others. Each \
         dimension maps to {\"category\": <one allowed category>, \"confidence\": \
         <number between 0 and 1>}. humanRole and aiRole map to {\"distribution\": \
         {<role>: <probability>}} covering only the listed roles, with \
         probabilities that sum to 1.\n",
    );
    out.push_str(&output_skeleton(taxonomy));
    out.push('\n');

    if !examples.is_empty() {
        out.push_str("\n## Examples\n");
        for (index, example) in examples.iter().enumerate() {
            let classification = serde_json::to_string_pretty(&example.classification)
                .unwrap_or_else(|_| example.classification.to_string());
            let _ = writeln!(
                out,
                "\n### Example {}\n<transcript>\n{}\n</transcript>\n{}",
                index + 1,
                example.transcript.trim_end(),
                classification
            );
        }
    }
    out
}

fn side_title(side: RoleSide) -> &'static str {
    match side {
        RoleSide::Human => "Human",
        RoleSide::Ai => "AI",
    }
}

fn output_skeleton(taxonomy: &Taxonomy) -> String {
    let mut lines = Vec::new();
    for dim in &taxonomy.dimensions {
        let first = dim.categories.first().map(String::as_str).unwrap_or("");
        lines.push(format!(
            "  \"{}\": {{\"category\": \"{first}\", \"confidence\": 0.8}}",
            dim.name
        ));
    }
    for side in [RoleSide::Human, RoleSide::Ai] {
        let roles = taxonomy.role_labels(side);
        let share = if roles.is_empty() {
            0.0
        } else {
            1.0 / roles.len() as f64
        };
        let entries: Vec<String> = roles
            .iter()
            .map(|role| format!("\"{role}\": {share:.2}"))
            .collect();
        lines.push(format!(
            "  \"{}\": {{\"distribution\": {{{}}}}}",
            side.field_name(),
            entries.join(", ")
        ));
    }
    format!("{{\n{}\n}}", lines.join(",\n"))
}
