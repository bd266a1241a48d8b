//! Message and author records.
//!
//! These are the units stored in the index and exchanged with peers. A
//! [`Message`] is immutable once stored: the write path never updates an
//! existing identifier, and records are only removed by administrative
//! query retirement.
//!
//! Field names follow the peer wire format (`id_str`, `screen_name`, ...)
//! so the same structs serialize directly into push/search documents.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Where a message entered this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SourceType {
    /// Scraped from the public source by this node.
    #[serde(rename = "SCRAPED")]
    #[default]
    Scraped,
    /// Received from a peer node by push or pull.
    #[serde(rename = "PEER")]
    Peer,
    /// Read from a dump file in the import directory.
    #[serde(rename = "IMPORT")]
    Import,
}

impl SourceType {
    /// The uppercase wire tag for this source.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Scraped => "SCRAPED",
            SourceType::Peer => "PEER",
            SourceType::Import => "IMPORT",
        }
    }

    /// Parse a wire tag, falling back to [`SourceType::Peer`] for unknown
    /// tags (inbound data is untrusted; an unknown tag is not worth
    /// dropping the record for).
    pub fn parse(tag: &str) -> Self {
        match tag.to_ascii_uppercase().as_str() {
            "SCRAPED" => SourceType::Scraped,
            "IMPORT" => SourceType::Import,
            _ => SourceType::Peer,
        }
    }
}

/// An author record, keyed by screen name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    /// Unique screen name; the author key referenced by messages.
    pub screen_name: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Avatar URL; empty if the source did not provide one.
    #[serde(default)]
    pub profile_image_url: String,

    /// When this node first saw a message from this author.
    pub appearance_first: DateTime<Utc>,

    /// When this node last saw a message from this author.
    pub appearance_latest: DateTime<Utc>,
}

impl Author {
    /// Create a minimal author record first seen now.
    pub fn new(screen_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            screen_name: screen_name.into(),
            name: String::new(),
            profile_image_url: String::new(),
            appearance_first: now,
            appearance_latest: now,
        }
    }

    /// Whether this record carries an avatar. Used when merging timelines:
    /// an author with an avatar is never replaced by one without.
    pub fn has_avatar(&self) -> bool {
        !self.profile_image_url.is_empty()
    }
}

/// A harvested message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique string identifier.
    #[serde(rename = "id_str")]
    pub id: String,

    /// Author key; must resolve to an [`Author`] in any timeline carrying
    /// this message.
    pub screen_name: String,

    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Free text.
    pub text: String,

    /// Mentioned user keys, in order of appearance.
    #[serde(default)]
    pub mentions: Vec<String>,

    /// Hashtags, in order of appearance, without the `#`.
    #[serde(default)]
    pub hashtags: Vec<String>,

    /// Outbound links, in order of appearance.
    #[serde(default)]
    pub links: Vec<String>,

    /// Place name the message was tagged with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,

    /// How this message entered the node.
    #[serde(rename = "source_type", default)]
    pub source: SourceType,
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9_]{2,})").expect("static regex"))
}

fn hashtag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#([\p{L}0-9_]{2,})").expect("static regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("static regex"))
}

impl Message {
    /// Re-extract mentions, hashtags and links from the text.
    ///
    /// Peer and import records may arrive without entity lists, or with
    /// lists produced by an outdated extractor. Only empty lists are
    /// filled; lists that already carry entries are trusted.
    pub fn analyse(&mut self) {
        if self.mentions.is_empty() {
            self.mentions = mention_re()
                .captures_iter(&self.text)
                .map(|c| c[1].to_string())
                .collect();
        }
        if self.hashtags.is_empty() {
            self.hashtags = hashtag_re()
                .captures_iter(&self.text)
                .map(|c| c[1].to_string())
                .collect();
        }
        if self.links.is_empty() {
            self.links = link_re()
                .find_iter(&self.text)
                .map(|m| m.as_str().to_string())
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_message(id: &str, text: &str) -> Message {
        Message {
            id: id.to_string(),
            screen_name: "alice".to_string(),
            created_at: Utc.with_ymd_and_hms(2015, 4, 1, 12, 0, 0).unwrap(),
            text: text.to_string(),
            mentions: Vec::new(),
            hashtags: Vec::new(),
            links: Vec::new(),
            place_name: None,
            source: SourceType::Scraped,
        }
    }

    #[test]
    fn test_analyse_extracts_entities() {
        let mut m = test_message("1", "hi @bob check #fossasia at https://fossasia.org now");
        m.analyse();
        assert_eq!(m.mentions, vec!["bob"]);
        assert_eq!(m.hashtags, vec!["fossasia"]);
        assert_eq!(m.links, vec!["https://fossasia.org"]);
    }

    #[test]
    fn test_analyse_keeps_existing_entities() {
        let mut m = test_message("1", "hi @bob");
        m.mentions = vec!["carol".to_string()];
        m.analyse();
        // Pre-filled lists are trusted over re-extraction.
        assert_eq!(m.mentions, vec!["carol"]);
    }

    #[test]
    fn test_source_type_round_trip() {
        for s in [SourceType::Scraped, SourceType::Peer, SourceType::Import] {
            assert_eq!(SourceType::parse(s.as_str()), s);
        }
        // Unknown tags default to PEER.
        assert_eq!(SourceType::parse("RSS"), SourceType::Peer);
    }

    #[test]
    fn test_message_json_field_names() {
        let m = test_message("42", "hello");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["id_str"], "42");
        assert_eq!(json["screen_name"], "alice");
        assert_eq!(json["source_type"], "SCRAPED");
        assert!(json.get("place_name").is_none());
    }

    #[test]
    fn test_message_json_round_trip() {
        let mut m = test_message("42", "hello #world");
        m.analyse();
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
