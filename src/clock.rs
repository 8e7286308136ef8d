//! Time source and business-timezone helpers.
//!
//! 서비스는 `Utc::now()`를 직접 호출하지 않고 주입된 `Clock`을 사용한다.
//! 테스트에서는 `ManualClock`으로 시간을 고정/이동한다.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};

/// Wall-clock source.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
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

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// UTC instant of local midnight (in `offset`) for the day containing `now`.
pub fn start_of_business_day(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    local_to_utc(now.with_timezone(&offset).date_naive().and_time(NaiveTime::MIN), offset)
}

/// Next instant strictly after `now` at which the local wall clock in
/// `offset` reads `at`.
pub fn next_daily_run(now: DateTime<Utc>, offset: FixedOffset, at: NaiveTime) -> DateTime<Utc> {
    let today = now.with_timezone(&offset).date_naive();
    let candidate = local_to_utc(today.and_time(at), offset);
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// `+02:00` style label for an offset.
pub fn offset_label(offset: FixedOffset) -> String {
    let total = offset.local_minus_utc();
    let sign = if total < 0 { '-' } else { '+' };
    let minutes = total.abs() / 60;
    format!("UTC{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
}

fn local_to_utc(local: chrono::NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kigali() -> FixedOffset {
        FixedOffset::east_opt(2 * 3600).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_run_later_today() {
        // 현지 시각 00:30 → 같은 날 02:00 (UTC 00:00)
        let now = utc("2024-03-10T22:30:00Z");
        let next = next_daily_run(now, kigali(), NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert_eq!(next, utc("2024-03-11T00:00:00Z"));
    }

    #[test]
    fn test_next_run_rolls_to_tomorrow() {
        // 현지 23:00 정각이면 다음 날 23:00
        let now = utc("2024-03-10T21:00:00Z");
        let next = next_daily_run(now, kigali(), NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert_eq!(next, utc("2024-03-11T21:00:00Z"));
    }

    #[test]
    fn test_start_of_business_day_crosses_utc_date() {
        // UTC 22:30 은 현지 다음 날 00:30
        let now = utc("2024-03-10T22:30:00Z");
        assert_eq!(start_of_business_day(now, kigali()), utc("2024-03-10T22:00:00Z"));
    }

    #[test]
    fn test_offset_label() {
        assert_eq!(offset_label(kigali()), "UTC+02:00");
        assert_eq!(offset_label(FixedOffset::west_opt(5 * 3600 + 1800).unwrap()), "UTC-05:30");
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(utc("2024-01-01T00:00:00Z"));
        clock.advance(Duration::minutes(15));
        assert_eq!(clock.now(), utc("2024-01-01T00:15:00Z"));
    }
}
