use chrono::{DateTime, Datelike, Duration, Utc};

use civic_common::Cadence;

/// Whether a scraper with this cadence should run at `now`, given its last
/// successful completion.
///
/// Monthly is calendar-based: it fires on the first of the month only, at most
/// once that day. A never-run monthly scraper still waits for the first.
pub fn is_due(cadence: Cadence, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match cadence {
        Cadence::Daily => elapsed_at_least(last_success, now, Duration::days(1)),
        Cadence::Weekly => elapsed_at_least(last_success, now, Duration::days(7)),
        Cadence::Monthly => {
            now.day() == 1 && last_success.map_or(true, |t| t.date_naive() != now.date_naive())
        }
        Cadence::Continuous => true,
        Cadence::OneTime => last_success.is_none(),
    }
}

fn elapsed_at_least(last: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    last.map_or(true, |t| now - t >= window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn monthly_only_on_the_first() {
        let last = Some(at(2026, 8, 1, 3));
        assert!(!is_due(Cadence::Monthly, last, at(2026, 9, 15, 9)));
        assert!(is_due(Cadence::Monthly, last, at(2026, 9, 1, 9)));
    }

    #[test]
    fn monthly_runs_once_on_the_first() {
        let first = at(2026, 9, 1, 0);
        assert!(is_due(Cadence::Monthly, None, first));
        assert!(!is_due(Cadence::Monthly, Some(first), at(2026, 9, 1, 12)));
    }

    #[test]
    fn never_run_monthly_waits_for_the_first() {
        assert!(!is_due(Cadence::Monthly, None, at(2026, 9, 15, 9)));
    }

    #[test]
    fn daily_and_weekly_use_rolling_windows() {
        let last = at(2026, 9, 10, 12);
        assert!(!is_due(Cadence::Daily, Some(last), at(2026, 9, 11, 11)));
        assert!(is_due(Cadence::Daily, Some(last), at(2026, 9, 11, 12)));
        assert!(!is_due(Cadence::Weekly, Some(last), at(2026, 9, 16, 12)));
        assert!(is_due(Cadence::Weekly, Some(last), at(2026, 9, 17, 12)));
        assert!(is_due(Cadence::Weekly, None, last));
    }

    #[test]
    fn one_time_and_continuous() {
        let now = at(2026, 9, 10, 12);
        assert!(is_due(Cadence::OneTime, None, now));
        assert!(!is_due(Cadence::OneTime, Some(at(2020, 1, 1, 0)), now));
        assert!(is_due(Cadence::Continuous, Some(now), now));
    }
}
