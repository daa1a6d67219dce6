use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rolelens_schema::Conversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusFormat {
    JsonArray,
    JsonLines,
}

impl CorpusFormat {
    /// `.jsonl` / `.ndjson` by extension, otherwise sniffed from the first
    /// non-blank character.
    fn detect(path: &Path, content: &str) -> Self {
        let by_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("jsonl") || ext.eq_ignore_ascii_case("ndjson"));
        match by_extension {
            Some(true) => Self::JsonLines,
            _ if content.trim_start().starts_with('[') => Self::JsonArray,
            _ => Self::JsonLines,
        }
    }
}

pub fn load_corpus(path: &Path) -> Result<Vec<Conversation>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus: {}", path.display()))?;
    let conversations = parse_corpus(path, &content)?;
    tracing::info!(
        count = conversations.len(),
        path = %path.display(),
        "loaded corpus"
    );
    Ok(conversations)
}

pub fn parse_corpus(path: &Path, content: &str) -> Result<Vec<Conversation>> {
    let conversations: Vec<Conversation> = match CorpusFormat::detect(path, content) {
        CorpusFormat::JsonArray => serde_json::from_str(content)
            .with_context(|| format!("failed to parse corpus array: {}", path.display()))?,
        CorpusFormat::JsonLines => content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("failed to parse {} line {}", path.display(), index + 1)
                })
            })
            .collect::<Result<_>>()?,
    };

    for (index, conversation) in conversations.iter().enumerate() {
        if conversation.id.trim().is_empty() {
            bail!("corpus item {} has an empty id", index + 1);
        }
        if conversation.messages.is_empty() {
            tracing::warn!(conversation_id = %conversation.id, "conversation has no messages");
        }
    }
    Ok(conversations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolelens_schema::MessageRole;

    #[test]
    fn parses_json_array() {
        let content = r#"[
            {"id": "a", "messages": [{"role": "user", "content": "hi"}]},
            {"id": "b", "messages": [{"role": "assistant", "content": "hello"}], "source": "x"}
        ]"#;
        let corpus = parse_corpus(Path::new("corpus.json"), content).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus[1].messages[0].role, MessageRole::Assistant);
        assert_eq!(corpus[1].extra["source"], "x");
    }

    #[test]
    fn parses_json_lines_and_skips_blank_lines() {
        let content = concat!(
            "{\"id\": \"a\", \"messages\": []}\n",
            "\n",
            "{\"id\": \"b\", \"messages\": [{\"role\": \"user\", \"content\": \"q\"}]}\n"
        );
        let corpus = parse_corpus(Path::new("corpus.jsonl"), content).unwrap();
        assert_eq!(corpus.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn sniffs_jsonl_without_extension() {
        let content = "{\"id\": \"a\", \"messages\": []}\n";
        assert_eq!(parse_corpus(Path::new("corpus"), content).unwrap().len(), 1);
    }

    #[test]
    fn reports_bad_line_number() {
        let content = "{\"id\": \"a\", \"messages\": []}\nnot json\n";
        let err = parse_corpus(Path::new("c.jsonl"), content).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn empty_id_is_rejected() {
        let content = r#"[{"id": " ", "messages": []}]"#;
        assert!(parse_corpus(Path::new("c.json"), content).is_err());
    }

    #[test]
    fn load_corpus_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        fs::write(&path, r#"[{"id": "a", "messages": []}]"#).unwrap();
        assert_eq!(load_corpus(&path).unwrap().len(), 1);
    }
}
