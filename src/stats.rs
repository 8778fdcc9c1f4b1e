//! Traffic statistics between status uploads
//!
//! Shared by the byte-counting relay and the control channel, so all state
//! sits behind one lock.

use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::ServerInterfaceError, types::OTHER_BUCKET};

/// One `{regex, replace}` pair as delivered by the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexReplace {
    pub regex: String,
    pub replace: String,
}

/// Compiled canonicalization rule
#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    replace: String,
}

impl Rule {
    fn compile(pair: &RegexReplace) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&pair.regex)
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            regex,
            replace: pair.replace.clone(),
        })
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_transferred: u64,
    pub page_views: IndexMap<String, u64>,
    pub https_requests: IndexMap<String, u64>,
}

#[derive(Debug, Default)]
struct StatsInner {
    bytes_transferred: u64,
    page_views: IndexMap<String, u64>,
    https_requests: IndexMap<String, u64>,
    page_view_rules: Vec<Rule>,
    https_request_rules: Vec<Rule>,
}

/// Statistics aggregator
#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<StatsInner>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install both rule lists. Nothing changes if any pattern fails to compile.
    pub fn set_regexes(
        &self,
        page_view_regexes: &[RegexReplace],
        https_request_regexes: &[RegexReplace],
    ) -> Result<(), ServerInterfaceError> {
        let page_view_rules = page_view_regexes
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let https_request_rules = https_request_regexes
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let mut inner = self.lock();
        inner.page_view_rules = page_view_rules;
        inner.https_request_rules = https_request_rules;
        debug!(
            "installed {} page view and {} https request patterns",
            inner.page_view_rules.len(),
            inner.https_request_rules.len()
        );
        Ok(())
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        let mut inner = self.lock();
        inner.bytes_transferred = inner.bytes_transferred.saturating_add(bytes);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        let mut inner = self.lock();
        inner.bytes_transferred = inner.bytes_transferred.saturating_add(bytes);
    }

    pub fn upsert_page_view(&self, entry: &str) {
        let mut inner = self.lock();
        let StatsInner {
            page_views,
            page_view_rules,
            ..
        } = &mut *inner;
        upsert(page_views, page_view_rules, entry);
    }

    pub fn upsert_https_request(&self, entry: &str) {
        let mut inner = self.lock();
        let StatsInner {
            https_requests,
            https_request_rules,
            ..
        } = &mut *inner;
        upsert(https_requests, https_request_rules, entry);
    }

    /// Distinct buckets across both maps.
    pub fn count(&self) -> usize {
        let inner = self.lock();
        inner.page_views.len() + inner.https_requests.len()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.lock().bytes_transferred
    }

    pub fn page_view_entries(&self) -> IndexMap<String, u64> {
        self.lock().page_views.clone()
    }

    pub fn https_request_entries(&self) -> IndexMap<String, u64> {
        self.lock().https_requests.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            bytes_transferred: inner.bytes_transferred,
            page_views: inner.page_views.clone(),
            https_requests: inner.https_requests.clone(),
        }
    }

    /// Zero the byte counter and both maps. Patterns are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.bytes_transferred = 0;
        inner.page_views.clear();
        inner.https_requests.clear();
    }
}

/// First matching rule wins; unmatched input goes to the catch-all bucket.
fn canonicalize(rules: &[Rule], entry: &str) -> String {
    rules
        .iter()
        .find(|rule| rule.regex.is_match(entry))
        .map(|rule| rule.regex.replace(entry, rule.replace.as_str()).into_owned())
        .unwrap_or_else(|| OTHER_BUCKET.to_string())
}

fn upsert(map: &mut IndexMap<String, u64>, rules: &[Rule], entry: &str) {
    let key = canonicalize(rules, entry);
    if key.is_empty() {
        return;
    }
    *map.entry(key).or_insert(0) += 1;
}
