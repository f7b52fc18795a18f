//! Channel/message segment parser for raw generations
//!
//! Harmony-style models interleave their output with special markers:
//!
//! ```text
//! <|channel|>analysis<|message|>thinking...<|end|><|start|>assistant<|channel|>final<|message|>B<|return|>
//! ```
//!
//! Every `<|channel|> LABEL <|message|> BODY` occurrence becomes one
//! [`MessagePair`]. The body runs up to the first following special marker
//! (or the end of the text) and that marker is left in place, so it can open
//! the next pair.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Any special marker, e.g. `<|channel|>`, `<|end|>`, `<|foo|>`
static SPECIAL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\|[^|>]+?\|>").expect("special marker pattern is valid"));

/// `<|channel|>` LABEL `<|message|>`, label captured lazily
static PAIR_OPENING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<\|channel\|>\s*(.*?)\s*<\|message\|>").expect("pair opening pattern is valid")
});

/// One channel/message segment of a generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePair {
    /// Channel label, e.g. "analysis" or "final"
    pub channel: String,
    /// Message body, trimmed
    pub message: String,
}

/// Parser options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Remove special markers found anywhere inside a message body
    pub strip_inner_markers: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            strip_inner_markers: true,
        }
    }
}

/// Parse all channel/message pairs with default options
pub fn parse_message_pairs(text: &str) -> Vec<MessagePair> {
    parse_message_pairs_with(text, ParseOptions::default())
}

/// Parse all channel/message pairs, in order of appearance
///
/// Text without a pair-opening sequence yields an empty list. Pairs whose
/// message is empty are kept.
pub fn parse_message_pairs_with(text: &str, options: ParseOptions) -> Vec<MessagePair> {
    let mut pairs = Vec::new();
    let mut cursor = 0;

    while let Some(caps) = PAIR_OPENING.captures_at(text, cursor) {
        let Some(opening) = caps.get(0) else { break };
        let channel = caps.get(1).map_or("", |m| m.as_str()).trim();

        // Shortest body: stop at the first marker after the opening,
        // without consuming it.
        let body_start = opening.end();
        let body_end = SPECIAL_MARKER
            .find_at(text, body_start)
            .map_or(text.len(), |m| m.start());

        let mut message = text[body_start..body_end].trim().to_string();
        if options.strip_inner_markers {
            message = strip_special_markers(&message);
        }

        pairs.push(MessagePair {
            channel: channel.to_string(),
            message,
        });
        cursor = body_end;
    }

    pairs
}

/// Remove every special marker from `text` and trim the result
pub fn strip_special_markers(text: &str) -> String {
    SPECIAL_MARKER.replace_all(text, "").trim().to_string()
}

/// Check whether `text` contains any special marker
pub fn contains_special_marker(text: &str) -> bool {
    SPECIAL_MARKER.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(channel: &str, message: &str) -> MessagePair {
        MessagePair {
            channel: channel.into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_analysis_then_final() {
        let text = "<|channel|>analysis<|message|>think think<|channel|>final<|message|>B";
        let pairs = parse_message_pairs(text);
        assert_eq!(
            pairs,
            vec![pair("analysis", "think think"), pair("final", "B")]
        );
    }

    #[test]
    fn test_single_final() {
        let pairs = parse_message_pairs("<|channel|>final<|message|>A");
        assert_eq!(pairs, vec![pair("final", "A")]);
    }

    #[test]
    fn test_no_markers() {
        assert!(parse_message_pairs("The answer is 2.").is_empty());
        assert!(parse_message_pairs("").is_empty());
    }

    #[test]
    fn test_markers_without_pair_opening() {
        assert!(parse_message_pairs("<|start|>assistant<|message|>hello<|end|>").is_empty());
        assert!(parse_message_pairs("<|channel|>final but no message marker").is_empty());
    }

    #[test]
    fn test_full_harmony_generation() {
        let text = "<|channel|>analysis<|message|>We need to compare the stories. Option 3 matches.<|end|>\
                    <|start|>assistant<|channel|>final<|message|>3<|return|>";
        let pairs = parse_message_pairs(text);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].channel, "analysis");
        assert_eq!(
            pairs[0].message,
            "We need to compare the stories. Option 3 matches."
        );
        assert_eq!(pairs[1], pair("final", "3"));
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let text = "<|channel|>  final \n<|message|>\n  A  \n<|end|>";
        assert_eq!(parse_message_pairs(text), vec![pair("final", "A")]);
    }

    #[test]
    fn test_empty_message_is_kept() {
        let text = "<|channel|>analysis<|message|><|end|><|channel|>final<|message|>C";
        let pairs = parse_message_pairs(text);
        assert_eq!(pairs, vec![pair("analysis", ""), pair("final", "C")]);
    }

    #[test]
    fn test_multiline_message() {
        let text = "<|channel|>analysis<|message|>line one\nline two\n<|end|>";
        let pairs = parse_message_pairs(text);
        assert_eq!(pairs, vec![pair("analysis", "line one\nline two")]);
    }

    #[test]
    fn test_prefix_text_is_ignored() {
        let text = "garbage before <|channel|>final<|message|>D";
        assert_eq!(parse_message_pairs(text), vec![pair("final", "D")]);
    }

    #[test]
    fn test_channel_label_stops_at_first_message_marker() {
        let text = "<|channel|>commentary to=tool <|constrain|>json<|message|>{}<|call|>";
        let pairs = parse_message_pairs(text);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].channel, "commentary to=tool <|constrain|>json");
        assert_eq!(pairs[0].message, "{}");
    }

    #[test]
    fn test_many_pairs_preserve_order() {
        let text: String = (0..5)
            .map(|i| format!("<|channel|>c{i}<|message|>m{i}<|end|>"))
            .collect();
        let pairs = parse_message_pairs(&text);
        assert_eq!(pairs.len(), 5);
        for (i, p) in pairs.iter().enumerate() {
            assert_eq!(p.channel, format!("c{i}"));
            assert_eq!(p.message, format!("m{i}"));
        }
    }

    #[test]
    fn test_pipe_in_body_is_not_a_marker() {
        let text = "<|channel|>final<|message|>a | b > c";
        assert_eq!(parse_message_pairs(text), vec![pair("final", "a | b > c")]);
    }

    #[test]
    fn test_strip_special_markers() {
        assert_eq!(strip_special_markers(" <|end|>x<|foo|>y <|return|> "), "xy");
        assert_eq!(strip_special_markers("no markers"), "no markers");
    }

    #[test]
    fn test_strip_is_idempotent() {
        for input in ["<|a|> x <|b|>", "plain", "", "<|x|><|y|>", "a<|b|>c |> <|"] {
            let once = strip_special_markers(input);
            assert_eq!(strip_special_markers(&once), once);
        }
    }

    #[test]
    fn test_without_stripping() {
        let options = ParseOptions {
            strip_inner_markers: false,
        };
        let pairs = parse_message_pairs_with("<|channel|>final<|message|> B <|end|>", options);
        assert_eq!(pairs, vec![pair("final", "B")]);
    }

    #[test]
    fn test_contains_special_marker() {
        assert!(contains_special_marker("x<|end|>"));
        assert!(!contains_special_marker("x<||>"));
        assert!(!contains_special_marker("a | b"));
    }
}
