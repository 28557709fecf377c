//! Decoding of the agent CLI's stream-json output.
//!
//! Each stdout line is one self-contained JSON record. Only assistant text
//! records carry a delta we forward to viewers; tool-call records, result
//! records, and malformed lines are dropped without error — one corrupt line
//! must never abort a stage.

use serde::Deserialize;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamRecord {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        #[allow(dead_code)]
        session_id: String,
    },
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

/// Incremental parser over agent stdout lines.
///
/// Stateful because the CLI re-emits the complete message as one final
/// cumulative record after streaming it in fragments; a record whose text
/// starts with everything emitted so far is collapsed into a single newline
/// delta instead of repeating the message.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one raw line into a text delta, or `None` for any record shape
    /// we don't forward (tool calls, status records, malformed JSON).
    pub fn parse(&mut self, raw_line: &str) -> Option<String> {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let record: StreamRecord = serde_json::from_str(trimmed).ok()?;
        let StreamRecord::Assistant { message, .. } = record;
        let text = match message.content.into_iter().next()? {
            ContentBlock::Text { text } => text,
        };
        if text.is_empty() {
            return None;
        }

        if !self.buffer.is_empty() && text.starts_with(&self.buffer) {
            // Final cumulative record; the fragments were already emitted.
            self.buffer.clear();
            return Some("\n".to_string());
        }

        self.buffer.push_str(&text);
        Some(text)
    }
}
