use std::collections::BTreeMap;

use chrono::NaiveDate;
use relay_contracts::{
    PhidRecord, BODY_END, BODY_START, PHID_MARKER, STORY_TEXT_FIELD, STORY_TYPE_FIELD,
    TAGGED_STORY_TYPE, TAG_KEY, TITLE_KEY,
};
use serde_json::Value;
use thiserror::Error;

/// Longest key path `dig` will follow.
pub const MAX_DIG_DEPTH: usize = 8;

pub const ACTIVITY_SERIES: &str = "phab-http";
pub const ERROR_CATEGORY: &str = "error";
pub const STARTUP_CATEGORY: &str = "startup";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigError {
    #[error("missing path segment {segment:?} at depth {depth}")]
    MissingSegment { segment: String, depth: usize },
    #[error("path of {0} segments exceeds the dig limit")]
    TooDeep(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaggedStoryError {
    #[error("tagged story is not a JSON object of strings: {0}")]
    InvalidJson(String),
    #[error("tagged story has no tag")]
    MissingTag,
    #[error("tagged story has no title")]
    MissingTitle,
}

pub fn is_resolvable(token: &str, allowed_types: &[String]) -> bool {
    let Some(rest) = token.strip_prefix(PHID_MARKER) else {
        return false;
    };
    allowed_types.iter().any(|t| {
        !t.is_empty()
            && rest
                .strip_prefix(t.as_str())
                .is_some_and(|tail| tail.starts_with('-'))
    })
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Walks `path` through nested objects (by key) and arrays (by index).
pub fn dig<'a>(value: &'a Value, path: &[&str]) -> Result<&'a Value, DigError> {
    if path.len() > MAX_DIG_DEPTH {
        return Err(DigError::TooDeep(path.len()));
    }
    path.iter()
        .enumerate()
        .try_fold(value, |current, (depth, segment)| {
            let next = match current {
                Value::Object(map) => map.get(*segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            next.ok_or_else(|| DigError::MissingSegment {
                segment: segment.to_string(),
                depth,
            })
        })
}

pub fn link_fragment(uri: &str, name: &str) -> String {
    format!("<a href='{uri}'>{}</a>", escape_html(name))
}

pub fn alias_fragment(alias: &str) -> String {
    format!("aka: {}", alias.replace(',', " "))
}

pub fn render_fragments(record: &PhidRecord, alias: Option<&str>) -> Vec<String> {
    let mut out = vec![link_fragment(&record.uri, &record.name)];
    if let Some(alias) = alias {
        out.push(alias_fragment(alias));
    }
    out
}

pub fn formatted_body(text: &str, references: &[String]) -> String {
    let mut val = escape_html(text);
    if !references.is_empty() {
        val.push_str("<br /> (references: ");
        val.push_str(&references.join(", "));
        val.push(')');
    }
    format!("{BODY_START}{val}{BODY_END}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedEvent {
    /// Concatenated `storyText` values; `None` when the event is not a story.
    pub story: Option<String>,
    pub identifiers: Vec<String>,
    pub tagged: bool,
}

pub fn classify_fields(fields: &[(String, String)], allowed_types: &[String]) -> ClassifiedEvent {
    let mut out = ClassifiedEvent::default();
    for (key, value) in fields {
        if key == STORY_TEXT_FIELD {
            out.story.get_or_insert_with(String::new).push_str(value);
        } else if is_resolvable(value, allowed_types) {
            out.identifiers.push(value.clone());
        } else if key == STORY_TYPE_FIELD && value == TAGGED_STORY_TYPE {
            out.tagged = true;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedStory {
    pub room: String,
    pub text: String,
}

impl TaggedStory {
    /// Every value must be a string. Extra keys are appended as
    /// ` (key -> value)` in key order.
    pub fn parse(story_text: &str) -> Result<Self, TaggedStoryError> {
        let mut fields: BTreeMap<String, String> = serde_json::from_str(story_text)
            .map_err(|e| TaggedStoryError::InvalidJson(e.to_string()))?;
        let room = fields.remove(TAG_KEY).ok_or(TaggedStoryError::MissingTag)?;
        let mut text = fields
            .remove(TITLE_KEY)
            .ok_or(TaggedStoryError::MissingTitle)?;
        for (key, value) in &fields {
            text.push_str(&format!(" ({key} -> {value})"));
        }
        Ok(Self { room, text })
    }
}

pub fn activity_line(category: &str, message: &str) -> String {
    format!("{category} -> {message}\n")
}

pub fn activity_file_name(category: &str, date: NaiveDate) -> String {
    let day = date.format("%Y-%m-%d");
    if category == ERROR_CATEGORY {
        format!("{ERROR_CATEGORY}.{ACTIVITY_SERIES}.{day}.log")
    } else {
        format!("{ACTIVITY_SERIES}.{day}.log")
    }
}

/// First `(category, message)` in a day's log whose category starts with
/// `prefix`.
pub fn first_mention<'a>(log_text: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    log_text.lines().find_map(|line| {
        let (category, message) = line.split_once(" -> ").unwrap_or((line, ""));
        category
            .starts_with(prefix)
            .then_some((category, message.trim_end()))
    })
}
