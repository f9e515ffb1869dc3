//! Pulling structure out of free-form model replies.

use std::sync::LazyLock;

use delio_core::ToolCall;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());

static THOUGHT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<thought>.*?</thought>").unwrap());

/// Tool calls and user-facing text split out of a model reply.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ParsedReply {
    pub tool_calls: Vec<ToolCall>,
    pub response: String,
}

/// Split a reply into tool calls and the text meant for the user.
///
/// The tool-call object is the span between the first `{` and the last `}`
/// carrying a `tool_calls` array; when it parses, that span is removed from
/// the response. Fenced ```json blocks never reach the user.
pub(crate) fn parse_reply(text: &str) -> ParsedReply {
    let mut parsed = ParsedReply::default();
    let mut response = text.to_string();

    if let Some((start, end)) = json_span(text) {
        if let Some(calls) = tool_calls_in(&text[start..=end]) {
            parsed.tool_calls = calls;
            response.replace_range(start..=end, "");
        }
    }

    let response = FENCED_JSON.replace_all(&response, "");
    parsed.response = response
        .trim()
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string();
    parsed
}

/// Drop `<thought>` blocks from deep-reasoning output.
pub(crate) fn strip_thoughts(text: &str) -> String {
    THOUGHT_BLOCK.replace_all(text, "").trim().to_string()
}

fn json_span(text: &str) -> Option<(usize, usize)> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then_some((start, end))
}

fn tool_calls_in(candidate: &str) -> Option<Vec<ToolCall>> {
    let value: Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "reply carries no parsable JSON object");
            return None;
        }
    };
    let calls = value.get("tool_calls")?.as_array()?;
    Some(
        calls
            .iter()
            .filter_map(|call| match serde_json::from_value::<ToolCall>(call.clone()) {
                Ok(call) => Some(call),
                Err(e) => {
                    debug!(error = %e, "skipping malformed tool call");
                    None
                }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_is_the_response() {
        let parsed = parse_reply("  Hello there.  ");
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.response, "Hello there.");
    }

    #[test]
    fn extracts_tool_calls_and_strips_fence() {
        let text = "Let me check.\n```json\n\
            {\"tool_calls\": [{\"name\": \"weather\", \"arguments\": {\"city\": \"Oslo\"}}]}\n```";
        let parsed = parse_reply(text);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "weather");
        assert_eq!(parsed.tool_calls[0].arguments["city"], json!("Oslo"));
        assert_eq!(parsed.response, "Let me check.");
    }

    #[test]
    fn bare_object_is_removed_from_response() {
        let parsed = parse_reply(r#"{"tool_calls": [{"name": "search"}]}"#);
        assert_eq!(parsed.tool_calls, vec![ToolCall::new("search")]);
        assert!(parsed.response.is_empty());
    }

    #[test]
    fn json_without_tool_calls_stays_in_response() {
        let parsed = parse_reply(r#"Config is {"a": 1}"#);
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.response, r#"Config is {"a": 1}"#);
    }

    #[test]
    fn malformed_calls_are_skipped() {
        let parsed = parse_reply(r#"{"tool_calls": [{"arguments": {}}, {"name": "ok"}]}"#);
        assert_eq!(parsed.tool_calls, vec![ToolCall::new("ok")]);
    }

    #[test]
    fn thoughts_are_stripped() {
        assert_eq!(strip_thoughts("<thought>hmm\nmaybe</thought>\nAnswer: 42"), "Answer: 42");
    }
}
