//! Field checks shared by the mappers.

use super::{ColumnSpec, RowIssues};
use crate::dataset::Row;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
static USERNAME_REGEX: OnceLock<Regex> = OnceLock::new();
static URL_REGEX: OnceLock<Regex> = OnceLock::new();

fn email_regex() -> &'static Regex {
    EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid email regex")
    })
}

fn username_regex() -> &'static Regex {
    USERNAME_REGEX
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("Invalid username regex"))
}

fn url_regex() -> &'static Regex {
    URL_REGEX.get_or_init(|| {
        Regex::new(r"^(?i)https?://[^\s/?#]+\.[^\s/?#]+(?:[/?#]\S*)?$").expect("Invalid url regex")
    })
}

/// Read a required column, recording a blocking error when it is blank or
/// longer than the column allows.
pub(crate) fn required<'a>(
    row: &Row<'a>,
    column: &ColumnSpec,
    issues: &mut RowIssues,
) -> Option<&'a str> {
    let Some(value) = row.optional(column.name) else {
        issues.blocking(format!("{} is required", column.name));
        return None;
    };

    if exceeds(value, column) {
        issues.blocking(too_long(column));
        return None;
    }
    Some(value)
}

/// Read an optional text column; overlong values are a soft error.
pub(crate) fn optional_text<'a>(
    row: &Row<'a>,
    column: &ColumnSpec,
    issues: &mut RowIssues,
) -> Option<&'a str> {
    let value = row.optional(column.name)?;
    if exceeds(value, column) {
        issues.soft(too_long(column));
    }
    Some(value)
}

/// Read an optional column whose overlong values block the row.
pub(crate) fn optional_bounded<'a>(
    row: &Row<'a>,
    column: &ColumnSpec,
    issues: &mut RowIssues,
) -> Option<&'a str> {
    let value = row.optional(column.name)?;
    if exceeds(value, column) {
        issues.blocking(too_long(column));
        return None;
    }
    Some(value)
}

/// Optional text as stored: trimmed and cut to the column's limit.
pub(crate) fn stored_text(row: &Row<'_>, column: &ColumnSpec) -> Option<String> {
    row.optional(column.name).map(|value| match column.max_length {
        Some(max) => value.chars().take(max).collect(),
        None => value.to_string(),
    })
}

fn exceeds(value: &str, column: &ColumnSpec) -> bool {
    column
        .max_length
        .is_some_and(|max| value.chars().count() > max)
}

fn too_long(column: &ColumnSpec) -> String {
    format!(
        "{} must be at most {} characters",
        column.name,
        column.max_length.unwrap_or_default()
    )
}

pub(crate) fn is_email(value: &str) -> bool {
    email_regex().is_match(value)
}

pub(crate) fn is_username(value: &str) -> bool {
    username_regex().is_match(value)
}

pub(crate) fn is_url(value: &str) -> bool {
    url_regex().is_match(value)
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// RFC 3339 first, then the looser formats `dateparser` understands.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
        .or_else(|| dateparser::parse(value).ok())
}

/// Soft check of an optional boolean column.
pub(crate) fn check_bool(row: &Row<'_>, column: &ColumnSpec, issues: &mut RowIssues) {
    if let Some(value) = row.optional(column.name) {
        if parse_bool(value).is_none() {
            issues.soft(format!("{} '{}' is not a valid boolean", column.name, value));
        }
    }
}

/// Boolean as stored: parsed value, else the column default, else `fallback`.
pub(crate) fn stored_bool(row: &Row<'_>, column: &ColumnSpec, fallback: bool) -> bool {
    row.optional(column.name)
        .and_then(parse_bool)
        .or_else(|| column.default_value.and_then(parse_bool))
        .unwrap_or(fallback)
}
