//! Provider Quota Model
//!
//! Windows, records, reset horizons and pressure levels used by the rate
//! limit ledger. All functions here are pure; the ledger owns the state.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::symbol::Provider;

/// Utilisation (percent) at which pressure becomes `Warn`.
pub const WARN_PERCENT: u64 = 75;

/// Utilisation (percent) at which pressure becomes `Critical`.
pub const CRITICAL_PERCENT: u64 = 90;

// =============================================================================
// Windows and Policies
// =============================================================================

/// Accounting window for a provider quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Rolling sixty-second window opened by the first call after a reset.
    PerMinute,
    /// Calendar day ending at local midnight.
    Daily,
    /// Calendar month ending at local midnight on the 1st.
    Monthly,
}

impl WindowKind {
    /// All window kinds in evaluation order.
    pub const ALL: [Self; 3] = [Self::PerMinute, Self::Daily, Self::Monthly];

    /// Stable identifier used in persisted keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerMinute => "per_minute",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// Parse a persisted identifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "per_minute" => Some(Self::PerMinute),
            "daily" => Some(Self::Daily),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// Compute the reset horizon for a window that starts now.
    ///
    /// Daily and monthly horizons are local midnights in `offset`.
    #[must_use]
    pub fn next_reset(self, now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        match self {
            Self::PerMinute => now + Duration::seconds(60),
            Self::Daily => {
                let today = now.with_timezone(&offset).date_naive();
                local_midnight(today.succ_opt().unwrap_or(today), offset, now)
            }
            Self::Monthly => {
                let today = now.with_timezone(&offset).date_naive();
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
                local_midnight(first, offset, now)
            }
        }
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset, fallback: DateTime<Utc>) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map_or(fallback, |local| local.with_timezone(&Utc))
}

/// Configured limits for one provider. `None` means the window is unmetered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Calls per rolling minute.
    pub per_minute: Option<u32>,
    /// Calls per local day.
    pub daily: Option<u32>,
    /// Calls per local month.
    pub monthly: Option<u32>,
}

impl QuotaPolicy {
    /// Limit for a window, if configured.
    #[must_use]
    pub const fn limit(&self, kind: WindowKind) -> Option<u32> {
        match kind {
            WindowKind::PerMinute => self.per_minute,
            WindowKind::Daily => self.daily,
            WindowKind::Monthly => self.monthly,
        }
    }

    /// Configured windows and their limits.
    pub fn windows(&self) -> impl Iterator<Item = (WindowKind, u32)> + '_ {
        WindowKind::ALL
            .into_iter()
            .filter_map(|kind| self.limit(kind).map(|limit| (kind, limit)))
    }

    /// Whether no window is configured.
    #[must_use]
    pub const fn is_unmetered(&self) -> bool {
        self.per_minute.is_none() && self.daily.is_none() && self.monthly.is_none()
    }
}

// =============================================================================
// Records
// =============================================================================

/// Call count for one provider window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Calls charged in the current window.
    pub count: u32,
    /// End of the current window.
    pub reset_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Fresh record for a window opening at `now`.
    #[must_use]
    pub fn open(kind: WindowKind, now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            count: 0,
            reset_at: kind.next_reset(now, offset),
        }
    }

    /// Whether the window has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_at
    }

    /// Count as observed at `now`, treating an elapsed window as zero.
    #[must_use]
    pub fn effective_count(&self, now: DateTime<Utc>) -> u32 {
        if self.is_expired(now) { 0 } else { self.count }
    }

    /// Reset to a new window if the current one has elapsed.
    ///
    /// Returns `true` if a reset happened.
    pub fn roll(&mut self, kind: WindowKind, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        if self.is_expired(now) {
            *self = Self::open(kind, now, offset);
            true
        } else {
            false
        }
    }
}

/// Persisted key for a provider window (`coingecko:per_minute`).
#[must_use]
pub fn ledger_key(provider: Provider, kind: WindowKind) -> String {
    format!("{}:{}", provider.as_str(), kind.as_str())
}

/// Parse a persisted key back into its provider and window.
#[must_use]
pub fn parse_ledger_key(key: &str) -> Option<(Provider, WindowKind)> {
    let (provider, kind) = key.split_once(':')?;
    Some((
        Provider::from_str_case_insensitive(provider)?,
        WindowKind::parse(kind)?,
    ))
}

// =============================================================================
// Pressure
// =============================================================================

/// Quota pressure reported for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Below the warning threshold.
    Ok,
    /// At or above 75% of a limit.
    Warn,
    /// At or above 90% of a limit.
    Critical,
}

impl PressureLevel {
    /// Classify a count against its limit.
    #[must_use]
    pub fn classify(count: u32, limit: u32) -> Self {
        if limit == 0 {
            return Self::Critical;
        }
        let used = u64::from(count) * 100;
        let limit = u64::from(limit);
        if used >= limit * CRITICAL_PERCENT {
            Self::Critical
        } else if used >= limit * WARN_PERCENT {
            Self::Warn
        } else {
            Self::Ok
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn per_minute_resets_sixty_seconds_after_open() {
        let now = utc("2024-03-10T12:00:30Z");
        let reset = WindowKind::PerMinute.next_reset(now, FixedOffset::east_opt(0).unwrap());
        assert_eq!(reset, utc("2024-03-10T12:01:30Z"));
    }

    #[test]
    fn daily_resets_at_next_local_midnight() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        // 23:30 local on the 10th.
        let now = utc("2024-03-10T21:30:00Z");
        let reset = WindowKind::Daily.next_reset(now, offset);
        assert_eq!(reset, utc("2024-03-10T22:00:00Z"));
    }

    #[test]
    fn monthly_resets_on_first_of_next_month() {
        let utc0 = FixedOffset::east_opt(0).unwrap();
        let reset = WindowKind::Monthly.next_reset(utc("2024-02-29T08:00:00Z"), utc0);
        assert_eq!(reset, utc("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn monthly_rolls_over_year_end() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let reset = WindowKind::Monthly.next_reset(utc("2024-12-15T12:00:00Z"), offset);
        assert_eq!(reset, utc("2025-01-01T05:00:00Z"));
    }

    #[test]
    fn record_roll_recomputes_horizon_from_now() {
        let utc0 = FixedOffset::east_opt(0).unwrap();
        let opened = utc("2024-03-10T12:00:00Z");
        let mut record = QuotaRecord::open(WindowKind::PerMinute, opened, utc0);
        record.count = 5;

        assert!(!record.roll(WindowKind::PerMinute, opened + Duration::seconds(60), utc0));
        assert_eq!(record.count, 5);

        let later = opened + Duration::seconds(95);
        assert!(record.roll(WindowKind::PerMinute, later, utc0));
        assert_eq!(record.count, 0);
        assert_eq!(record.reset_at, later + Duration::seconds(60));
    }

    #[test]
    fn effective_count_ignores_elapsed_window() {
        let record = QuotaRecord {
            count: 9,
            reset_at: utc("2024-03-10T12:00:00Z"),
        };
        assert_eq!(record.effective_count(utc("2024-03-10T11:59:59Z")), 9);
        assert_eq!(record.effective_count(utc("2024-03-10T12:00:01Z")), 0);
    }

    #[test_case(0, 100, PressureLevel::Ok ; "empty")]
    #[test_case(74, 100, PressureLevel::Ok ; "just below warn")]
    #[test_case(75, 100, PressureLevel::Warn ; "warn boundary inclusive")]
    #[test_case(89, 100, PressureLevel::Warn ; "just below critical")]
    #[test_case(90, 100, PressureLevel::Critical ; "critical boundary inclusive")]
    #[test_case(3, 4, PressureLevel::Warn ; "small limit")]
    #[test_case(0, 0, PressureLevel::Critical ; "zero limit")]
    fn pressure_classification(count: u32, limit: u32, expected: PressureLevel) {
        assert_eq!(PressureLevel::classify(count, limit), expected);
    }

    #[test]
    fn ledger_keys_round_trip() {
        let key = ledger_key(Provider::CoinGecko, WindowKind::Monthly);
        assert_eq!(key, "coingecko:monthly");
        assert_eq!(
            parse_ledger_key(&key),
            Some((Provider::CoinGecko, WindowKind::Monthly))
        );
        assert_eq!(parse_ledger_key("coingecko"), None);
        assert_eq!(parse_ledger_key("coingecko:weekly"), None);
    }

    #[test]
    fn policy_windows_skip_unconfigured() {
        let policy = QuotaPolicy {
            per_minute: Some(30),
            daily: None,
            monthly: Some(10_000),
        };
        let windows: Vec<_> = policy.windows().collect();
        assert_eq!(
            windows,
            vec![(WindowKind::PerMinute, 30), (WindowKind::Monthly, 10_000)]
        );
        assert!(QuotaPolicy::default().is_unmetered());
    }
}
