//! Peer HTTP client: push, search and hello.
//!
//! Peers exchange timelines as JSON documents with a `statuses` array and
//! `search_metadata`. Every request carries a deadline; a peer that does
//! not answer in time is a transient failure for the caller to retry or
//! drop, never something to block a loop on.

use crate::error::{Error, Result};
use magpie_core::Timeline;
use std::time::{Duration, Instant};
use tracing::debug;

/// HTTP client for talking to peer nodes.
#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::blocking::Client,
    /// Result cap for peer searches.
    count_max: usize,
}

impl PeerClient {
    pub fn new(timeout: Duration, count_max: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client, count_max })
    }

    /// Push a timeline to one peer. The timeline is serialized once by the
    /// caller side; a non-success status is an error.
    pub fn push(&self, peer: &str, timeline: &Timeline) -> Result<()> {
        let start = Instant::now();
        metrics::counter!("peer_push_total").increment(1);

        let body = timeline.to_json().to_string();
        let response = self
            .client
            .post(api_url(peer, "/api/push.json"))
            .form(&[("data", body.as_str())])
            .send()?;
        record_duration(start);

        if !response.status().is_success() {
            metrics::counter!("peer_push_errors_total").increment(1);
            return Err(Error::PeerResponse {
                peer: peer.to_string(),
                reason: format!("push answered {}", response.status()),
            });
        }
        debug!(peer, count = timeline.len(), "pushed timeline");
        Ok(())
    }

    /// Search one peer and parse the result timeline.
    pub fn search(&self, peer: &str, query: &str, timezone_offset: i32) -> Result<Timeline> {
        let start = Instant::now();
        metrics::counter!("peer_search_total").increment(1);

        let response = self
            .client
            .get(api_url(peer, "/api/search.json"))
            .query(&self.search_params(query, timezone_offset))
            .send()?;
        record_duration(start);

        if !response.status().is_success() {
            return Err(Error::PeerResponse {
                peer: peer.to_string(),
                reason: format!("search answered {}", response.status()),
            });
        }
        let doc: serde_json::Value = response.json()?;
        let timeline = Timeline::from_json(&doc)?;
        debug!(peer, query, results = timeline.len(), "peer search");
        Ok(timeline)
    }

    /// Announce this node to one peer.
    pub fn hello(&self, peer: &str, peername: &str, http_port: u16, https_port: u16) -> Result<()> {
        let start = Instant::now();
        let response = self
            .client
            .get(api_url(peer, "/api/hello.json"))
            .query(&[
                ("peername", peername),
                ("port.http", &http_port.to_string()),
                ("port.https", &https_port.to_string()),
            ])
            .send()?;
        record_duration(start);

        if !response.status().is_success() {
            return Err(Error::PeerResponse {
                peer: peer.to_string(),
                reason: format!("hello answered {}", response.status()),
            });
        }
        Ok(())
    }

    /// Query string for a peer search. `source=all` lets the peer answer
    /// from its cache or scrape on our behalf, whichever it prefers.
    fn search_params(&self, query: &str, timezone_offset: i32) -> [(&'static str, String); 5] {
        [
            ("q", query.to_string()),
            ("source", "all".to_string()),
            ("timezoneOffset", timezone_offset.to_string()),
            ("count", self.count_max.to_string()),
            ("minified", "true".to_string()),
        ]
    }
}

fn api_url(peer: &str, path: &str) -> String {
    format!("{}{}", peer.trim_end_matches('/'), path)
}

fn record_duration(start: Instant) {
    metrics::histogram!("peer_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_joins_cleanly() {
        assert_eq!(
            api_url("http://peer:9000", "/api/push.json"),
            "http://peer:9000/api/push.json"
        );
        assert_eq!(
            api_url("http://peer:9000/", "/api/push.json"),
            "http://peer:9000/api/push.json"
        );
    }

    #[test]
    fn test_client_builds() {
        assert!(PeerClient::new(Duration::from_secs(1), 100).is_ok());
    }

    #[test]
    fn test_search_params_carry_source_and_count() {
        let client = PeerClient::new(Duration::from_secs(1), 25).unwrap();
        let params = client.search_params("beer", -120);
        assert!(params.contains(&("q", "beer".to_string())));
        assert!(params.contains(&("source", "all".to_string())));
        assert!(params.contains(&("timezoneOffset", "-120".to_string())));
        assert!(params.contains(&("count", "25".to_string())));
    }

    #[test]
    fn test_unreachable_peer_is_an_error() {
        let client = PeerClient::new(Duration::from_millis(200), 10).unwrap();
        // Reserved TEST-NET address; nothing listens there.
        let result = client.search("http://192.0.2.1:9", "beer", 0);
        assert!(result.is_err());
    }
}
