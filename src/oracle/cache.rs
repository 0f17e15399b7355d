//! Process-local price cache
//!
//! One entry per asset symbol, stamped with the injected clock. The map sits
//! behind a mutex so a shared oracle stays consistent under concurrent use.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::oracle::PriceQuote;

pub struct PriceCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: Mutex<HashMap<String, PriceQuote>>,
}

impl PriceCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Entry younger than the freshness window
    pub fn fresh(&self, asset: &str) -> Option<PriceQuote> {
        self.within(asset, self.ttl)
    }

    /// Entry younger than `max_age`
    pub fn within(&self, asset: &str, max_age: Duration) -> Option<PriceQuote> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .get(asset)
            .filter(|quote| now - quote.fetched_at < max_age)
            .cloned()
    }

    /// Replace the entry for the quote's asset
    pub fn store(&self, quote: PriceQuote) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(quote.asset_symbol.clone(), quote);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
