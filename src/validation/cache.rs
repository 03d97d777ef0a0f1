/// TTL cache for check results
///
/// Keys carry the calendar day, so an entry stops matching at the day
/// boundary even when its TTL has not run out yet.
use super::{CheckResult, ValidationType};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Time source for cache expiry and result timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(by) = chrono::Duration::from_std(by) {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub validation_type: ValidationType,
    pub context: Option<String>,
    pub day: NaiveDate,
}

impl CacheKey {
    pub fn new(validation_type: ValidationType, context: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            validation_type,
            context: context.map(str::to_string),
            day: now.date_naive(),
        }
    }
}

#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<CacheKey, CheckResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result while `now - timestamp < ttl`; stale entries are evicted
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>, ttl: Duration) -> Option<CheckResult> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;

        let age = now.signed_duration_since(entry.timestamp);
        let fresh = match age.to_std() {
            Ok(age) => age < ttl,
            // Timestamp in the future (clock went backwards)
            Err(_) => false,
        };

        if fresh {
            Some(entry.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    /// Store a result. Entries keyed to any other day can never match
    /// again and are dropped.
    pub fn put(&self, key: CacheKey, result: CheckResult) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|existing, _| existing.day == key.day);
        entries.insert(key, result);
    }

    /// Drop entries of a type (all contexts, all days)
    pub fn invalidate(&self, validation_type: ValidationType) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| key.validation_type != validation_type);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::CheckStatus;
    use chrono::TimeZone;

    fn result(at: DateTime<Utc>) -> CheckResult {
        CheckResult {
            validation_type: ValidationType::Environment,
            status: CheckStatus::Passed,
            output: "ok".to_string(),
            timestamp: at,
        }
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let cache = ResultCache::new();
        let key = CacheKey::new(ValidationType::Environment, None, start);
        cache.put(key.clone(), result(start));

        let ttl = Duration::from_secs(3600);
        assert!(cache.get(&key, start + chrono::Duration::seconds(3599), ttl).is_some());
        assert!(cache.get(&key, start + chrono::Duration::seconds(3600), ttl).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_changes_at_day_boundary() {
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap();
        let key = CacheKey::new(ValidationType::Modules, Some("ai-stack"), late);
        let next = CacheKey::new(
            ValidationType::Modules,
            Some("ai-stack"),
            late + chrono::Duration::minutes(2),
        );
        assert_ne!(key, next);
    }

    #[test]
    fn test_put_drops_entries_from_other_days() {
        let day_one = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let day_two = day_one + chrono::Duration::days(1);
        let cache = ResultCache::new();

        cache.put(CacheKey::new(ValidationType::Environment, None, day_one), result(day_one));
        cache.put(CacheKey::new(ValidationType::Modules, Some("a"), day_one), result(day_one));
        assert_eq!(cache.len(), 2);

        let today = CacheKey::new(ValidationType::Environment, None, day_two);
        cache.put(today.clone(), result(day_two));

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&today, day_two, Duration::from_secs(3600)).is_some());
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }
}
