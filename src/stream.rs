//! Typed model of the agent CLI's `stream-json` output and a parser that
//! extracts display text, token usage, and cost from it.
//!
//! The CLI emits one JSON object per line. Usage fields arrive in either
//! snake_case or camelCase depending on the message, so every field carries
//! an alias.

use serde::Deserialize;
use std::collections::HashMap;

/// Token recorded as breaker activity for valid protocol lines that carry no
/// displayable text (system/control messages). Without it, a long run of
/// tool-use events would look like inactivity.
pub const CONTROL_LINE_TOKEN: &str = "[control]";

const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        usage: Option<UsageBlock>,
        #[serde(default, rename = "modelUsage")]
        model_usage: Option<HashMap<String, ModelUsage>>,
        #[serde(default, alias = "totalCostUsd")]
        total_cost_usd: Option<f64>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<UsageBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageBlock {
    #[serde(default, alias = "inputTokens")]
    pub input_tokens: Option<u64>,
    #[serde(default, alias = "outputTokens")]
    pub output_tokens: Option<u64>,
    #[serde(default, alias = "cacheReadInputTokens")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, alias = "cacheCreationInputTokens")]
    pub cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ModelUsage {
    #[serde(default, rename = "contextWindow")]
    pub context_window: Option<u64>,
}

/// Running token-usage snapshot for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub context_window: u64,
}

impl Default for TokenUsage {
    fn default() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Context window utilization as a percentage (0-100).
    pub fn context_utilization(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.total_tokens() as f64 / self.context_window as f64) * 100.0
    }
}

/// What one protocol line amounts to for the stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Displayable text, forwarded to output and recorded verbatim.
    Text(String),
    /// A syntactically valid protocol line with no visible text. Still
    /// counts as activity.
    Control,
}

pub type UsageHook = Box<dyn Fn(&TokenUsage, f64) + Send>;

/// Incremental parser over stream-json lines, accumulating usage and cost.
pub struct StreamParser {
    usage: TokenUsage,
    total_cost: f64,
    on_usage: Option<UsageHook>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StreamParser {
    pub fn new(on_usage: Option<UsageHook>) -> Self {
        Self {
            usage: TokenUsage::default(),
            total_cost: 0.0,
            on_usage,
        }
    }

    /// Parse one line. Returns None for blank lines; a non-JSON line passes
    /// through as text.
    pub fn parse_line(&mut self, line: &str) -> Option<ParsedLine> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => return Some(ParsedLine::Text(line.to_string())),
        };
        match event {
            StreamEvent::Assistant { message } => {
                if let Some(usage) = &message.usage {
                    self.apply_usage(usage);
                }
                let text_parts: Vec<&str> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if text_parts.is_empty() {
                    Some(ParsedLine::Control)
                } else {
                    Some(ParsedLine::Text(text_parts.join("\n")))
                }
            }
            StreamEvent::Result {
                usage,
                model_usage,
                total_cost_usd,
            } => {
                if let Some(usage) = &usage {
                    self.apply_usage(usage);
                }
                if let Some(models) = &model_usage {
                    if let Some(window) = models.values().find_map(|m| m.context_window) {
                        self.usage.context_window = window;
                    }
                }
                if let Some(cost) = total_cost_usd {
                    self.total_cost = cost;
                }
                self.emit_usage();
                Some(ParsedLine::Control)
            }
            StreamEvent::Other => Some(ParsedLine::Control),
        }
    }

    fn apply_usage(&mut self, block: &UsageBlock) {
        if let Some(value) = block.input_tokens {
            self.usage.input_tokens = value;
        }
        if let Some(value) = block.output_tokens {
            self.usage.output_tokens = value;
        }
        if let Some(value) = block.cache_read_input_tokens {
            self.usage.cache_read_tokens = value;
        }
        if let Some(value) = block.cache_creation_input_tokens {
            self.usage.cache_creation_tokens = value;
        }
        self.emit_usage();
    }

    fn emit_usage(&self) {
        if let Some(hook) = &self.on_usage {
            hook(&self.usage, self.total_cost);
        }
    }

    pub fn token_usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_is_ignored() {
        let mut parser = StreamParser::default();
        assert!(parser.parse_line("").is_none());
        assert!(parser.parse_line("   ").is_none());
    }

    #[test]
    fn non_json_line_passes_through_as_text() {
        let mut parser = StreamParser::default();
        assert_eq!(
            parser.parse_line("plain stderr noise"),
            Some(ParsedLine::Text("plain stderr noise".into()))
        );
    }

    #[test]
    fn assistant_text_blocks_are_joined() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"first"},
            {"type":"tool_use","name":"Bash","input":{}},
            {"type":"text","text":"second"}
        ]}}"#
            .replace('\n', "");
        assert_eq!(
            parser.parse_line(&line),
            Some(ParsedLine::Text("first\nsecond".into()))
        );
    }

    #[test]
    fn assistant_without_text_is_control_activity() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{}}]}}"#;
        assert_eq!(parser.parse_line(line), Some(ParsedLine::Control));
    }

    #[test]
    fn system_messages_count_as_control() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"system","subtype":"init"}"#;
        assert_eq!(parser.parse_line(line), Some(ParsedLine::Control));
    }

    #[test]
    fn snake_case_usage_is_accumulated() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"assistant","message":{"content":[],"usage":{
            "input_tokens":1200,"output_tokens":340,
            "cache_read_input_tokens":90,"cache_creation_input_tokens":15}}}"#
            .replace('\n', "");
        parser.parse_line(&line);
        let usage = parser.token_usage();
        assert_eq!(usage.input_tokens, 1200);
        assert_eq!(usage.output_tokens, 340);
        assert_eq!(usage.cache_read_tokens, 90);
        assert_eq!(usage.cache_creation_tokens, 15);
    }

    #[test]
    fn camel_case_usage_is_accumulated() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"assistant","message":{"content":[],"usage":{
            "inputTokens":10,"outputTokens":20,
            "cacheReadInputTokens":30,"cacheCreationInputTokens":40}}}"#
            .replace('\n', "");
        parser.parse_line(&line);
        let usage = parser.token_usage();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_tokens, 30);
        assert_eq!(usage.cache_creation_tokens, 40);
    }

    #[test]
    fn result_sets_context_window_and_cost() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"result","usage":{"input_tokens":5000,"output_tokens":900},
            "modelUsage":{"claude-sonnet":{"contextWindow":500000}},
            "total_cost_usd":1.25}"#
            .replace('\n', "");
        assert_eq!(parser.parse_line(&line), Some(ParsedLine::Control));
        assert_eq!(parser.token_usage().context_window, 500_000);
        assert!((parser.total_cost() - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn result_accepts_camel_case_cost() {
        let mut parser = StreamParser::default();
        let line = r#"{"type":"result","totalCostUsd":0.5}"#;
        parser.parse_line(line);
        assert!((parser.total_cost() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn usage_hook_sees_updates() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU64, Ordering};
        let seen = Arc::new(AtomicU64::new(0));
        let seen_ref = Arc::clone(&seen);
        let mut parser = StreamParser::new(Some(Box::new(move |usage, _cost| {
            seen_ref.store(usage.input_tokens, Ordering::SeqCst);
        })));
        parser.parse_line(
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":77}}}"#,
        );
        assert_eq!(seen.load(Ordering::SeqCst), 77);
    }

    #[test]
    fn context_utilization_math() {
        let usage = TokenUsage {
            input_tokens: 50_000,
            output_tokens: 50_000,
            ..Default::default()
        };
        assert!((usage.context_utilization() - 50.0).abs() < f64::EPSILON);

        let zero_window = TokenUsage {
            context_window: 0,
            ..Default::default()
        };
        assert_eq!(zero_window.context_utilization(), 0.0);
    }
}
