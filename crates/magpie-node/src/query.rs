//! Search query compiler.
//!
//! Parses the social search syntax into a structured query: free-text
//! terms, `@user` mention filters, `#tag` hashtag filters, and the
//! `from:`/`to:`/`near:`/`since:`/`until:` modifiers, plus a half-open
//! time range and an auto-selected histogram interval for time-bucketed
//! aggregations.
//!
//! Malformed clauses (an unparseable date, an empty modifier) are skipped
//! and the remainder of the query is compiled; a search should degrade,
//! not fail, on a sloppy query string.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use magpie_core::Message;
use std::collections::HashMap;

/// Time-bucket width for histogram aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramInterval {
    Day,
    Hour,
    Minute,
}

impl HistogramInterval {
    /// The date format used to label buckets of this width.
    pub fn bucket_format(&self) -> &'static str {
        match self {
            HistogramInterval::Day => "%Y-%m-%d",
            HistogramInterval::Hour | HistogramInterval::Minute => "%Y-%m-%d %H:%M",
        }
    }
}

/// A compiled search query.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// The raw query string as given.
    pub original: String,

    /// Free-text clause, trimmed; empty if the query was modifiers only.
    pub text: String,

    /// Free-text terms for matching; a quoted span is one term.
    text_terms: Vec<String>,

    /// Mention filters (`@user` and `to:user`), without the `@`.
    pub mentions: Vec<String>,

    /// Hashtag filters, case-folded, without the `#`.
    pub hashtags: Vec<String>,

    /// Author-equality filter from `from:`.
    pub author: Option<String>,

    /// Place filter from `near:`; matches place name or free text.
    pub near: Option<String>,

    /// Unrecognized `key:value` modifiers, retained but unused.
    pub modifiers: HashMap<String, String>,

    /// Start of the half-open time range `[since, until)`.
    pub since: DateTime<Utc>,

    /// End of the half-open time range.
    pub until: DateTime<Utc>,
}

impl CompiledQuery {
    /// Compile a raw query string.
    ///
    /// `timezone_offset_minutes` is the caller's offset from UTC; `since:`
    /// and `until:` values are expressed in the caller's local time, so the
    /// offset is subtracted to reach UTC. An `until:` value resolving to
    /// midnight means end-of-day: one day is added so the named day is
    /// included in the range.
    pub fn parse(raw: &str, timezone_offset_minutes: i32) -> Self {
        let mut text_terms: Vec<String> = Vec::new();
        let mut mentions: Vec<String> = Vec::new();
        let mut hashtags: Vec<String> = Vec::new();
        let mut author: Option<String> = None;
        let mut near: Option<String> = None;
        let mut modifiers: HashMap<String, String> = HashMap::new();
        let mut since: Option<DateTime<Utc>> = None;
        let mut until: Option<DateTime<Utc>> = None;

        for token in tokenize(raw) {
            if let Some(user) = token.strip_prefix('@') {
                if !user.is_empty() {
                    mentions.push(user.to_string());
                }
                continue;
            }
            if let Some(tag) = token.strip_prefix('#') {
                if !tag.is_empty() {
                    hashtags.push(tag.to_lowercase());
                }
                continue;
            }
            if let Some((key, value)) = split_modifier(&token) {
                match key.as_str() {
                    "from" => author = Some(value),
                    "to" => mentions.push(value),
                    "near" => near = Some(value),
                    "since" => match parse_local_date(&value, timezone_offset_minutes, false) {
                        Some(t) => since = Some(t),
                        None => {
                            tracing::warn!(value = %value, "unparseable since: clause skipped")
                        }
                    },
                    "until" => match parse_local_date(&value, timezone_offset_minutes, true) {
                        Some(t) => until = Some(t),
                        None => {
                            tracing::warn!(value = %value, "unparseable until: clause skipped")
                        }
                    },
                    _ => {
                        modifiers.insert(key, value);
                    }
                }
                continue;
            }
            text_terms.push(token);
        }

        let now = Utc::now();
        let since = since.unwrap_or(DateTime::UNIX_EPOCH);
        let until = until.unwrap_or(now);

        Self {
            original: raw.to_string(),
            text: text_terms.join(" "),
            text_terms,
            mentions,
            hashtags,
            author,
            near,
            modifiers,
            since,
            until,
        }
    }

    /// Whether a message satisfies every clause of this query.
    pub fn matches(&self, message: &Message) -> bool {
        if message.created_at < self.since || message.created_at >= self.until {
            return false;
        }
        if let Some(author) = &self.author {
            if !message.screen_name.eq_ignore_ascii_case(author) {
                return false;
            }
        }
        let text_lower = message.text.to_lowercase();
        for term in &self.text_terms {
            if !text_lower.contains(&term.to_lowercase()) {
                return false;
            }
        }
        for mention in &self.mentions {
            if !message
                .mentions
                .iter()
                .any(|m| m.eq_ignore_ascii_case(mention))
            {
                return false;
            }
        }
        for hashtag in &self.hashtags {
            if !message
                .hashtags
                .iter()
                .any(|h| h.eq_ignore_ascii_case(hashtag))
            {
                return false;
            }
        }
        if let Some(near) = &self.near {
            let near_lower = near.to_lowercase();
            let place_hit = message
                .place_name
                .as_deref()
                .is_some_and(|p| p.to_lowercase().contains(&near_lower));
            if !place_hit && !text_lower.contains(&near_lower) {
                return false;
            }
        }
        true
    }

    /// Bucket width for a time-bucketed aggregation over this query's range.
    pub fn histogram_interval(&self) -> HistogramInterval {
        let span = self.until - self.since;
        if span > Duration::days(7) {
            HistogramInterval::Day
        } else if span > Duration::hours(3) {
            HistogramInterval::Hour
        } else {
            HistogramInterval::Minute
        }
    }
}

/// Split a query string into tokens, treating a double-quoted span as one
/// token (quotes stripped).
fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in raw.chars() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Split `key:value` at the first colon. The key must be non-empty and
/// purely alphabetic, and URLs are never modifiers.
fn split_modifier(token: &str) -> Option<(String, String)> {
    if token.contains("://") {
        return None;
    }
    let idx = token.find(':')?;
    if idx == 0 || idx == token.len() - 1 {
        return None;
    }
    let key = &token[..idx];
    if !key.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((key.to_lowercase(), token[idx + 1..].to_string()))
}

/// Parse a `since:`/`until:` value: a bare date or a date with time,
/// expressed in the caller's local time.
fn parse_local_date(value: &str, timezone_offset_minutes: i32, end_of_day: bool) -> Option<DateTime<Utc>> {
    let mut naive: NaiveDateTime = if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        date.and_time(NaiveTime::MIN)
    } else {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d_%H:%M").ok()?
    };
    // until at exactly midnight means the whole day is wanted.
    if end_of_day && naive.time() == NaiveTime::MIN {
        naive = naive + Duration::days(1);
    }
    let utc = Utc.from_utc_datetime(&naive) - Duration::minutes(timezone_offset_minutes as i64);
    Some(utc)
}
