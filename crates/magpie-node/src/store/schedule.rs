//! Scheduled retrieval bookkeeping.
//!
//! Every query that reaches the node is tracked as a [`ScheduledQuery`].
//! From the message period observed in each result timeline the tracker
//! estimates `retrieval_next`, the time when re-running the query is
//! expected to catch all new messages. The caretaker re-runs due queries
//! in `retrieval_next` order.

use chrono::{DateTime, Duration, Utc};

const DAY_MILLIS: u64 = 1000 * 60 * 60 * 24;
/// The number of messages one retrieval returns at maximum.
const RETRIEVAL_CONSTANT: u64 = 20;
/// Fraction of the estimated period after which a retrieval is worthwhile.
const TTL_FACTOR: f64 = 0.75;
/// Periods below this pivot get a penalty so very hot queries do not
/// dominate the retrieval schedule.
const PIVOT_PERIOD_MILLIS: u64 = 10_000;

/// Retrieval history and schedule for one query string.
#[derive(Debug, Clone)]
pub struct ScheduledQuery {
    /// The query exactly as submitted.
    pub query: String,

    /// Timezone offset of the submitting user, in minutes.
    pub timezone_offset: i32,

    /// When the query was first submitted by a user.
    pub query_first: DateTime<Utc>,

    /// When the query was last submitted by a user.
    pub query_last: DateTime<Utc>,

    /// When the query was last run against the source.
    pub retrieval_last: DateTime<Utc>,

    /// When the query should be run again to catch all new messages.
    pub retrieval_next: DateTime<Utc>,

    /// When the next single message is expected to appear.
    pub expected_next: DateTime<Utc>,

    /// How often a user submitted this query.
    pub query_count: u32,

    /// How often this query was run against the source.
    pub retrieval_count: u32,

    /// Estimated period between two messages, in milliseconds; 0 = unknown.
    pub message_period_millis: u64,

    /// Message frequency derived from the period.
    pub messages_per_day: u64,
}

impl ScheduledQuery {
    /// Track a query for the first time. `message_period_millis` is the
    /// observed period of the first result timeline, if one could be
    /// computed.
    pub fn new(
        query: impl Into<String>,
        timezone_offset: i32,
        message_period_millis: Option<u64>,
        by_user_query: bool,
    ) -> Self {
        let now = Utc::now();
        let mut entry = Self {
            query: query.into(),
            timezone_offset,
            query_first: now,
            query_last: now,
            retrieval_last: now,
            retrieval_next: now,
            expected_next: now,
            query_count: 0,
            retrieval_count: 0,
            message_period_millis: 0,
            messages_per_day: 0,
        };
        entry.update_at(message_period_millis, by_user_query, now);
        entry.query_first = entry.retrieval_last;
        entry
    }

    /// Record one retrieval and re-estimate the schedule.
    pub fn update(&mut self, message_period_millis: Option<u64>, by_user_query: bool) {
        self.update_at(message_period_millis, by_user_query, Utc::now());
    }

    fn update_at(
        &mut self,
        message_period_millis: Option<u64>,
        by_user_query: bool,
        now: DateTime<Utc>,
    ) {
        self.retrieval_last = now;
        self.retrieval_count += 1;
        if by_user_query {
            self.query_count += 1;
            self.query_last = now;
        }

        // An empty or single-message result gives no period; fall back to
        // one message per day. Otherwise average into the running estimate.
        match message_period_millis.filter(|&p| p > 0 && p <= DAY_MILLIS) {
            None => self.message_period_millis = DAY_MILLIS,
            Some(new_period) => {
                self.message_period_millis = if self.message_period_millis == 0 {
                    new_period
                } else {
                    (self.message_period_millis + new_period) / 2
                };
            }
        }
        self.messages_per_day = DAY_MILLIS / self.message_period_millis.max(1);

        self.expected_next =
            now + Duration::milliseconds((TTL_FACTOR * self.message_period_millis as f64) as i64);

        // Periods far below the pivot get a cubic penalty.
        let strategic_period = if self.message_period_millis < PIVOT_PERIOD_MILLIS {
            let deficit_secs = (PIVOT_PERIOD_MILLIS - self.message_period_millis) / 1000;
            PIVOT_PERIOD_MILLIS + 1000 * deficit_secs.pow(3)
        } else {
            self.message_period_millis
        };
        let waiting_millis = DAY_MILLIS
            .min((TTL_FACTOR * (RETRIEVAL_CONSTANT * strategic_period) as f64) as u64);
        self.retrieval_next = now + Duration::milliseconds(waiting_millis as i64);
    }

    /// Whether this query is due for re-retrieval.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.retrieval_next <= now
    }
}

/// Guard for automatic re-retrieval: reject modifier-laden queries (any
/// `:`) and anything outside length 2..=16, which tend to be either overly
/// broad or junk.
pub fn eligible_for_retrieval(query: &str) -> bool {
    let len = query.chars().count();
    (2..=16).contains(&len) && !query.contains(':')
}
