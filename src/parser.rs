//! Response parser: extracts an action directive from raw backend text.
//!
//! Backends are asked to answer in prose and, when an action applies, to
//! embed one of two markers:
//!
//! ```text
//! ACTION: <kind> [PARAM <key>=<value>]...
//! ```
//!
//! where further `PARAM` items may also appear on their own following lines
//! and values may be double-quoted, or a JSON object:
//!
//! ```text
//! {"action_type": "<kind>", "suggested_action": "...", "confidence": 0.8,
//!  "reasoning": "...", "parameters": {"<key>": "<value>"}}
//! ```
//!
//! Parsing is total. Text without a usable marker becomes the answer verbatim
//! with no action and low confidence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::backend::Tier;
use crate::config::ConfidenceSettings;

/// How well the action marker parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseQuality {
    /// Marker found and every part valid
    Clean,
    /// Marker found; some parameters were malformed and skipped
    Partial,
    /// No usable marker
    Absent,
}

/// Action name and parameters as written by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDirective {
    pub kind: String,
    pub parameters: BTreeMap<String, String>,
}

/// Parsed backend output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    /// Text for the user; the raw text verbatim when `action` is `None`
    pub answer_text: String,
    /// Backend output exactly as received
    pub raw_text: String,
    pub action: Option<ActionDirective>,
    /// In [0, 1]
    pub confidence: f64,
    pub quality: ParseQuality,
    /// Backend-supplied explanation, JSON schema only
    pub reasoning: Option<String>,
    /// Tier that produced the raw text
    pub source_attribution: Option<Tier>,
}

impl StructuredResult {
    pub fn with_source(mut self, tier: Option<Tier>) -> Self {
        self.source_attribution = tier;
        self
    }
}

static ACTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*ACTION:[ \t]*(?P<kind>[A-Za-z][\w-]*)?(?P<rest>[^\n]*)$")
        .expect("invalid regex")
});

static PARAM_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[ \t]*PARAM\b").expect("invalid regex"));

static PARAM_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^(?P<key>[A-Za-z_][\w-]*)\s*=\s*(?:"(?P<quoted>[^"]*)"|(?P<bare>\S.*?))\s*$"#)
        .expect("invalid regex")
});

/// Whitespace-separated words, keeping double-quoted runs intact.
fn words(text: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = None;
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => {
                quoted = !quoted;
                start.get_or_insert(i);
            }
            c if c.is_whitespace() && !quoted => {
                if let Some(s) = start.take() {
                    words.push(&text[s..i]);
                }
            }
            _ => {
                start.get_or_insert(i);
            }
        }
    }
    if let Some(s) = start {
        words.push(&text[s..]);
    }
    words
}

/// Parameters from the text following `ACTION: <kind>`.
///
/// `None` when that text is not a PARAM list, meaning the line was prose
/// rather than a marker. The flag is false if any item was malformed.
fn parse_params(rest: &str) -> Option<(BTreeMap<String, String>, bool)> {
    let mut items: Vec<Vec<&str>> = Vec::new();
    for word in words(rest) {
        if word.eq_ignore_ascii_case("PARAM") {
            items.push(Vec::new());
        } else {
            items.last_mut()?.push(word);
        }
    }

    let mut params = BTreeMap::new();
    let mut clean = true;
    for item in items {
        let item = item.join(" ");
        match PARAM_PAIR.captures(&item) {
            Some(caps) => {
                let value = caps
                    .name("quoted")
                    .or_else(|| caps.name("bare"))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                params.insert(caps["key"].to_lowercase(), value);
            }
            None => clean = false,
        }
    }
    Some((params, clean))
}

struct Extracted {
    directive: ActionDirective,
    quality: ParseQuality,
    reported_confidence: Option<f64>,
    reasoning: Option<String>,
    summary: Option<String>,
    /// Byte range of the marker in the raw text
    span: (usize, usize),
}

/// First `ACTION:` line whose remainder is empty or a PARAM list.
fn extract_action_line(raw: &str) -> Option<Extracted> {
    ACTION_LINE
        .captures_iter(raw)
        .find_map(|caps| marker_at(raw, &caps))
}

fn marker_at(raw: &str, caps: &regex::Captures<'_>) -> Option<Extracted> {
    let whole = caps.get(0)?;
    let kind = caps.name("kind")?.as_str().to_string();

    let mut rest = caps.name("rest").map(|m| m.as_str()).unwrap_or("").to_string();
    let mut end = whole.end();

    // Continuation lines that start with PARAM.
    while end < raw.len() {
        let line_start = end + 1;
        let line_end = raw[line_start..]
            .find('\n')
            .map(|i| line_start + i)
            .unwrap_or(raw.len());
        let line = &raw[line_start..line_end];
        if !PARAM_LINE.is_match(line) {
            break;
        }
        rest.push(' ');
        rest.push_str(line.trim());
        end = line_end;
    }

    let (parameters, clean) = parse_params(&rest)?;
    Some(Extracted {
        directive: ActionDirective { kind, parameters },
        quality: if clean {
            ParseQuality::Clean
        } else {
            ParseQuality::Partial
        },
        reported_confidence: None,
        reasoning: None,
        summary: None,
        span: (whole.start(), end),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn extract_json(raw: &str) -> Option<Extracted> {
    for (start, _) in raw.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        let Some(Ok(Value::Object(object))) = stream.next() else {
            continue;
        };
        let end = start + stream.byte_offset();

        let Some(kind) = object
            .get("action_type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
        else {
            continue;
        };

        let mut clean = true;
        let mut parameters = BTreeMap::new();
        match object.get("parameters") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    match scalar_to_string(value) {
                        Some(v) => {
                            parameters.insert(key.to_lowercase(), v);
                        }
                        None => clean = false,
                    }
                }
            }
            Some(_) => clean = false,
        }

        let reported_confidence = match object.get("confidence") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_f64() {
                Some(c) => Some(c.clamp(0.0, 1.0)),
                None => {
                    clean = false;
                    None
                }
            },
        };

        let text_field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        return Some(Extracted {
            directive: ActionDirective {
                kind: kind.to_string(),
                parameters,
            },
            quality: if clean {
                ParseQuality::Clean
            } else {
                ParseQuality::Partial
            },
            reported_confidence,
            reasoning: text_field("reasoning"),
            summary: text_field("suggested_action"),
            span: (start, end),
        });
    }
    None
}

/// Strip a fenced code block wrapper left behind around a removed marker.
fn tidy_residual(text: &str) -> String {
    text.replace("```json\n\n```", "")
        .replace("```json\n```", "")
        .replace("```\n```", "")
        .trim()
        .to_string()
}

/// Turns raw backend text into a [`StructuredResult`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseParser {
    levels: ConfidenceSettings,
}

impl ResponseParser {
    pub fn new(levels: ConfidenceSettings) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &ConfidenceSettings {
        &self.levels
    }

    /// Parse raw text. Never fails.
    pub fn parse(&self, raw: &str) -> StructuredResult {
        let extracted = extract_action_line(raw).or_else(|| extract_json(raw));

        let Some(extracted) = extracted else {
            return StructuredResult {
                answer_text: raw.to_string(),
                raw_text: raw.to_string(),
                action: None,
                confidence: self.levels.low,
                quality: ParseQuality::Absent,
                reasoning: None,
                source_attribution: None,
            };
        };

        let level = match extracted.quality {
            ParseQuality::Clean => self.levels.high,
            ParseQuality::Partial => self.levels.moderate,
            ParseQuality::Absent => self.levels.low,
        };
        // A backend may lower confidence but not raise it above what the
        // parse quality supports.
        let confidence = extracted
            .reported_confidence
            .map_or(level, |reported| reported.min(level));

        let (start, end) = extracted.span;
        let residual = tidy_residual(&format!("{}{}", &raw[..start], &raw[end..]));
        let answer_text = if !residual.is_empty() {
            residual
        } else {
            extracted
                .summary
                .clone()
                .or_else(|| extracted.reasoning.clone())
                .unwrap_or_else(|| raw.trim().to_string())
        };

        StructuredResult {
            answer_text,
            raw_text: raw.to_string(),
            action: Some(extracted.directive),
            confidence,
            quality: extracted.quality,
            reasoning: extracted.reasoning,
            source_attribution: None,
        }
    }
}

/// Parse with the default confidence levels.
pub fn parse(raw: &str) -> StructuredResult {
    ResponseParser::default().parse(raw)
}
