//! Stored workflow templates with `${tag}` placeholders.
//!
//! A template is workflow JSON text in which values are replaced by
//! `${tag}` or `${tag:default}`. Filling substitutes each placeholder with
//! a request parameter, JSON-escaping strings and choosing literal or
//! quoted insertion by where the placeholder sits:
//!
//! - `"${steps}"` resolving to a number or boolean becomes `20` (quotes
//!   dropped); resolving to a string stays quoted.
//! - `"${prefix}_final"` inserts escaped text into the surrounding string.
//! - a bare `${prompt}` resolving to a string becomes `"..."`.
//!
//! Unresolved placeholders become the empty string.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TemplateError;
use crate::graph::Workflow;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Regex pattern matching `${tag}` and `${tag:default}`.
pub const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z0-9_.\- ]+?)(?::([^}]*))?\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Groups of normalized tag names that refer to the same parameter.
/// The first entry of each group is the canonical name.
const ALIASES: &[&[&str]] = &[
    &["negativeprompt", "negative", "neg", "negprompt"],
    &["prompt", "positiveprompt", "positive", "pos", "text"],
    &["cfg", "guidance", "cfgscale", "guidancescale"],
    &["steps", "numsteps", "samplingsteps"],
    &["width", "w"],
    &["height", "h"],
    &["seed", "noiseseed"],
    &["sampler", "samplername"],
    &["scheduler", "schedulername"],
    &["model", "modelname", "checkpoint", "ckpt", "ckptname", "unetname"],
    &["frames", "length", "framecount", "numframes"],
    &["fps", "framerate"],
    &["filenameprefix", "prefix", "outputprefix"],
];

/// Fallbacks for well-known numeric tags with no value and no default.
fn builtin_default(canonical: &str) -> Option<Value> {
    match canonical {
        "steps" => Some(Value::from(20)),
        "cfg" => Some(Value::from(7.0)),
        "width" | "height" => Some(Value::from(1024)),
        "denoise" => Some(Value::from(1.0)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Placeholder listing
// ---------------------------------------------------------------------------

/// A placeholder declared in a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placeholder {
    pub tag: String,
    pub default: Option<String>,
}

/// Distinct placeholders in order of first appearance.
///
/// When a tag appears more than once, the first declared default wins.
pub fn placeholders(template_text: &str) -> Vec<Placeholder> {
    let mut found: Vec<Placeholder> = Vec::new();
    for caps in PLACEHOLDER_RE.captures_iter(template_text) {
        let tag = caps[1].trim().to_string();
        let default = caps.get(2).map(|m| m.as_str().to_string());
        match found.iter_mut().find(|p| p.tag == tag) {
            Some(existing) => {
                if existing.default.is_none() {
                    existing.default = default;
                }
            }
            None => found.push(Placeholder { tag, default }),
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Strip `_`, `-`, `.` and spaces, then lower-case.
fn normalize(tag: &str) -> String {
    tag.chars()
        .filter(|c| !matches!(c, '_' | '-' | '.' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether a placeholder or parameter name refers to a seed.
pub fn is_seed_tag(tag: &str) -> bool {
    normalize(tag).contains("seed")
}

fn alias_group(normalized: &str) -> Option<&'static [&'static str]> {
    ALIASES
        .iter()
        .copied()
        .find(|group| group.contains(&normalized))
}

/// Parse a declared default: JSON when it parses, otherwise plain text.
fn parse_default(raw: &str) -> Value {
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn is_random_marker(value: &Value) -> bool {
    value.as_i64() == Some(-1) || value.as_str().map(str::trim) == Some("-1")
}

/// Resolve one placeholder against the parameters.
fn resolve(tag: &str, default: Option<&str>, params: &Map<String, Value>) -> Option<Value> {
    let tag = tag.trim();
    let normalized = normalize(tag);
    let group = alias_group(&normalized);

    let value = params
        .get(tag)
        .or_else(|| {
            params
                .iter()
                .find(|(key, _)| normalize(key) == normalized)
                .map(|(_, v)| v)
        })
        .or_else(|| {
            let group = group?;
            params
                .iter()
                .find(|(key, _)| group.contains(&normalize(key).as_str()))
                .map(|(_, v)| v)
        })
        .cloned()
        .or_else(|| default.map(parse_default))
        .or_else(|| builtin_default(group.map(|g| g[0]).unwrap_or(normalized.as_str())))?;

    if normalized.contains("seed") && is_random_marker(&value) {
        return Some(Value::from(rand::random::<u32>()));
    }
    Some(value)
}

/// JSON-escaped string contents, without the surrounding quotes.
fn escape(text: &str) -> String {
    let quoted = Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Text form of a value when spliced into a larger string.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Lexical position tracking
// ---------------------------------------------------------------------------

/// Tracks whether a byte offset in the template lies inside a JSON string.
#[derive(Default)]
struct JsonCursor {
    in_string: bool,
    escaped: bool,
    string_start: usize,
}

impl JsonCursor {
    fn advance(&mut self, bytes: &[u8], from: usize, to: usize) {
        for (offset, &b) in bytes[from..to].iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else if b == b'"' {
                self.in_string = true;
                self.string_start = from + offset;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Filling
// ---------------------------------------------------------------------------

/// Substitute every placeholder and return the filled text.
pub fn fill_text(template_text: &str, params: &Map<String, Value>) -> String {
    let bytes = template_text.as_bytes();
    let mut out = String::with_capacity(template_text.len());
    let mut cursor = JsonCursor::default();
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(template_text) {
        let Some(whole) = caps.get(0) else { continue };
        let (start, end) = (whole.start(), whole.end());
        if start < last {
            continue;
        }

        cursor.advance(bytes, last, start);
        out.push_str(&template_text[last..start]);
        last = end;

        let value = resolve(&caps[1], caps.get(2).map(|m| m.as_str()), params);
        let whole_string = cursor.in_string
            && cursor.string_start + 1 == start
            && bytes.get(end) == Some(&b'"');

        match value {
            Some(Value::String(s)) if cursor.in_string => out.push_str(&escape(&s)),
            Some(other) if whole_string => {
                // Literal insertion: drop the surrounding quotes.
                out.pop();
                out.push_str(&other.to_string());
                last = end + 1;
                cursor.in_string = false;
            }
            Some(other) if cursor.in_string => out.push_str(&escape(&as_text(&other))),
            Some(other) => out.push_str(&other.to_string()),
            None if cursor.in_string => {}
            None => out.push_str("\"\""),
        }
    }

    out.push_str(&template_text[last..]);
    out
}

/// Fill a template and parse the result as a validated workflow.
pub fn fill(template_text: &str, params: &Map<String, Value>) -> Result<Workflow, TemplateError> {
    let filled = fill_text(template_text, params);
    let value: Value = serde_json::from_str(&filled)?;
    Ok(Workflow::from_value(&value)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
