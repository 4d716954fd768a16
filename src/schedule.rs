use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Serialize;
use std::collections::BTreeMap;

/// Track cadence. Stored string forms are part of the platform contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    DailyWeekday,
    WeeklySunday,
    WeeklyTuesday,
}

impl Cadence {
    pub fn from_db(s: &str) -> Option<Cadence> {
        match s {
            "daily-weekday" => Some(Cadence::DailyWeekday),
            "weekly-sunday" => Some(Cadence::WeeklySunday),
            "weekly-tuesday" => Some(Cadence::WeeklyTuesday),
            _ => None,
        }
    }

    pub fn as_db(&self) -> &'static str {
        match self {
            Cadence::DailyWeekday => "daily-weekday",
            Cadence::WeeklySunday => "weekly-sunday",
            Cadence::WeeklyTuesday => "weekly-tuesday",
        }
    }

    fn requires(&self, day: Weekday) -> bool {
        match self {
            Cadence::DailyWeekday => !matches!(day, Weekday::Sat | Weekday::Sun),
            Cadence::WeeklySunday => day == Weekday::Sun,
            Cadence::WeeklyTuesday => day == Weekday::Tue,
        }
    }

    /// Trailing window (calendar days, inclusive of today) and missing-count
    /// threshold for dropout-candidate detection.
    pub fn drop_window_days(&self) -> i64 {
        match self {
            Cadence::DailyWeekday => 5,
            Cadence::WeeklySunday | Cadence::WeeklyTuesday => 7,
        }
    }

    pub fn drop_threshold(&self) -> usize {
        match self {
            Cadence::DailyWeekday => 5,
            Cadence::WeeklySunday | Cadence::WeeklyTuesday => 1,
        }
    }
}

/// 1-decimal rounding used for completion rates on the wire.
pub fn round_off_1_decimal(x: f64) -> f64 {
    (10.0 * x).round() / 10.0
}

/// Ordered dates in [start, end] on which a certification is required.
pub fn required_dates(cadence: Cadence, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut d = start;
    while d <= end {
        if cadence.requires(d.weekday()) {
            out.push(d);
        }
        d += Duration::days(1);
    }
    out
}

pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next - Duration::days(1)))
}

/// Intersection of a calendar month with the active period, both inclusive.
/// The full month when no period is active; None when disjoint.
pub fn month_window(
    year: i32,
    month: u32,
    period: Option<(NaiveDate, NaiveDate)>,
) -> Option<(NaiveDate, NaiveDate)> {
    let (first, last) = month_bounds(year, month)?;
    match period {
        None => Some((first, last)),
        Some((ps, pe)) => {
            let lo = first.max(ps);
            let hi = last.min(pe);
            if lo > hi {
                None
            } else {
                Some((lo, hi))
            }
        }
    }
}

/// Stored rows may hold a bare date or a timestamp ("2025-01-12T09:30:00" or
/// "2025-01-12 09:30:00"). Strip any time component before comparing.
pub fn normalize_date_str(raw: &str) -> Option<NaiveDate> {
    let head = raw
        .split(|c| c == 'T' || c == ' ')
        .next()
        .unwrap_or("")
        .trim();
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DayStatus {
    Certified,
    Pending,
    Missing,
    NotRequired,
}

/// A certification row as the derivator sees it: normalized date + status.
#[derive(Debug, Clone)]
pub struct CertRow {
    pub date: NaiveDate,
    pub status: String,
}

impl CertRow {
    fn counts_certified(&self) -> bool {
        matches!(self.status.as_str(), "submitted" | "approved")
    }
}

/// One status per required date, total by construction.
pub fn classify(
    required: &[NaiveDate],
    rows: &[CertRow],
    today: NaiveDate,
) -> BTreeMap<NaiveDate, DayStatus> {
    let mut out = BTreeMap::new();
    for &date in required {
        let row = rows.iter().find(|r| r.date == date);
        let status = match row {
            Some(r) if r.counts_certified() => DayStatus::Certified,
            Some(r) if r.status == "rejected" => DayStatus::Missing,
            Some(_) => DayStatus::Pending,
            None if date > today => DayStatus::NotRequired,
            None => DayStatus::Missing,
        };
        out.insert(date, status);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_required: usize,
    pub total_certified: usize,
    pub completion_rate: f64,
    pub missing_count: usize,
    pub current_streak: usize,
}

pub fn summarize(statuses: &BTreeMap<NaiveDate, DayStatus>, today: NaiveDate) -> Summary {
    let total_required = statuses.keys().filter(|d| **d <= today).count();
    let total_certified = statuses
        .values()
        .filter(|s| **s == DayStatus::Certified)
        .count();
    let missing_count = statuses
        .values()
        .filter(|s| **s == DayStatus::Missing)
        .count();
    let completion_rate = if total_required == 0 {
        0.0
    } else {
        round_off_1_decimal(100.0 * total_certified as f64 / total_required as f64)
    };

    // Walk backward over the dates already due. An uncertified slot dated
    // today does not break the run: submission is still possible that day.
    let mut current_streak = 0;
    for (&date, &status) in statuses.iter().filter(|(d, _)| **d <= today).rev() {
        match status {
            DayStatus::Certified => current_streak += 1,
            _ if date == today && current_streak == 0 => continue,
            _ => break,
        }
    }

    Summary {
        total_required,
        total_certified,
        completion_rate,
        missing_count,
        current_streak,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropCheck {
    pub window_missing: usize,
    pub is_candidate: bool,
}

/// Missing count over the cadence's trailing window ending at `today`,
/// against the dropout threshold. `period` bounds the scan like any other
/// required-date derivation.
pub fn drop_check(
    cadence: Cadence,
    period: (NaiveDate, NaiveDate),
    rows: &[CertRow],
    today: NaiveDate,
) -> DropCheck {
    let window_start = today - Duration::days(cadence.drop_window_days() - 1);
    let start = window_start.max(period.0);
    let end = today.min(period.1);
    let window_missing = if start > end {
        0
    } else {
        let required = required_dates(cadence, start, end);
        classify(&required, rows, today)
            .values()
            .filter(|s| **s == DayStatus::Missing)
            .count()
    };
    DropCheck {
        window_missing,
        is_candidate: window_missing >= cadence.drop_threshold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn daily_weekday_window_excludes_weekends() {
        let dates = required_dates(Cadence::DailyWeekday, d(2025, 1, 1), d(2025, 1, 31));
        assert_eq!(dates.len(), 23);
        assert!(dates.iter().all(|x| !matches!(
            x.weekday(),
            Weekday::Sat | Weekday::Sun
        )));
        assert_eq!(dates.first(), Some(&d(2025, 1, 1)));
        assert_eq!(dates.last(), Some(&d(2025, 1, 31)));
    }

    #[test]
    fn weekly_sunday_january_2025() {
        let dates = required_dates(Cadence::WeeklySunday, d(2025, 1, 1), d(2025, 1, 31));
        assert_eq!(
            dates,
            vec![d(2025, 1, 5), d(2025, 1, 12), d(2025, 1, 19), d(2025, 1, 26)]
        );
    }

    #[test]
    fn empty_window_when_range_inverted() {
        assert!(required_dates(Cadence::DailyWeekday, d(2025, 2, 1), d(2025, 1, 1)).is_empty());
    }

    #[test]
    fn month_window_intersects_period() {
        // Period starts mid-month and ends before month end.
        let w = month_window(2025, 1, Some((d(2025, 1, 10), d(2025, 1, 20)))).unwrap();
        assert_eq!(w, (d(2025, 1, 10), d(2025, 1, 20)));
        // Period covers the month: full month survives.
        let w = month_window(2025, 1, Some((d(2024, 12, 1), d(2025, 3, 1)))).unwrap();
        assert_eq!(w, (d(2025, 1, 1), d(2025, 1, 31)));
        // No active period: full month.
        let w = month_window(2025, 2, None).unwrap();
        assert_eq!(w, (d(2025, 2, 1), d(2025, 2, 28)));
        // Disjoint.
        assert!(month_window(2025, 5, Some((d(2025, 1, 1), d(2025, 1, 31)))).is_none());
    }

    #[test]
    fn normalize_strips_time_component() {
        assert_eq!(normalize_date_str("2025-01-12"), Some(d(2025, 1, 12)));
        assert_eq!(
            normalize_date_str("2025-01-12T09:30:00+09:00"),
            Some(d(2025, 1, 12))
        );
        assert_eq!(
            normalize_date_str("2025-01-12 09:30:00"),
            Some(d(2025, 1, 12))
        );
        assert_eq!(normalize_date_str("not-a-date"), None);
    }

    fn row(date: NaiveDate, status: &str) -> CertRow {
        CertRow {
            date,
            status: status.to_string(),
        }
    }

    #[test]
    fn classification_is_total_and_not_required_only_in_future() {
        let required = required_dates(Cadence::DailyWeekday, d(2025, 1, 6), d(2025, 1, 10));
        let rows = vec![row(d(2025, 1, 6), "approved"), row(d(2025, 1, 7), "rejected")];
        let today = d(2025, 1, 8);
        let map = classify(&required, &rows, today);
        assert_eq!(map.len(), required.len());
        for (date, status) in &map {
            if *status == DayStatus::NotRequired {
                assert!(*date > today);
            }
        }
        assert_eq!(map[&d(2025, 1, 6)], DayStatus::Certified);
        assert_eq!(map[&d(2025, 1, 7)], DayStatus::Missing);
        assert_eq!(map[&d(2025, 1, 8)], DayStatus::Missing);
        assert_eq!(map[&d(2025, 1, 9)], DayStatus::NotRequired);
    }

    #[test]
    fn pending_for_unrecognized_status() {
        let required = vec![d(2025, 1, 6)];
        let rows = vec![row(d(2025, 1, 6), "on-hold")];
        let map = classify(&required, &rows, d(2025, 1, 10));
        assert_eq!(map[&d(2025, 1, 6)], DayStatus::Pending);
    }

    #[test]
    fn worked_example_weekly_sunday() {
        // Active period 2025-01-01..2025-01-31, today 2025-01-15, one
        // certified row on the 12th.
        let (lo, hi) = month_window(2025, 1, Some((d(2025, 1, 1), d(2025, 1, 31)))).unwrap();
        let required = required_dates(Cadence::WeeklySunday, lo, hi);
        let rows = vec![row(d(2025, 1, 12), "approved")];
        let today = d(2025, 1, 15);
        let map = classify(&required, &rows, today);
        assert_eq!(map[&d(2025, 1, 5)], DayStatus::Missing);
        assert_eq!(map[&d(2025, 1, 12)], DayStatus::Certified);
        assert_eq!(map[&d(2025, 1, 19)], DayStatus::NotRequired);
        assert_eq!(map[&d(2025, 1, 26)], DayStatus::NotRequired);
        let s = summarize(&map, today);
        assert_eq!(s.total_required, 2);
        assert_eq!(s.total_certified, 1);
        assert_eq!(s.completion_rate, 50.0);
    }

    #[test]
    fn completion_rate_bounds() {
        let required = required_dates(Cadence::DailyWeekday, d(2025, 1, 6), d(2025, 1, 10));
        let all: Vec<CertRow> = required.iter().map(|&x| row(x, "submitted")).collect();
        let map = classify(&required, &all, d(2025, 1, 10));
        assert_eq!(summarize(&map, d(2025, 1, 10)).completion_rate, 100.0);

        // Nothing required yet: rate pinned to zero, no division by zero.
        let map = classify(&required, &[], d(2025, 1, 1));
        let s = summarize(&map, d(2025, 1, 1));
        assert_eq!(s.total_required, 0);
        assert_eq!(s.completion_rate, 0.0);
    }

    #[test]
    fn streak_ignores_today_but_breaks_on_older_gap() {
        let required = required_dates(Cadence::DailyWeekday, d(2025, 1, 6), d(2025, 1, 10));
        // Certified Tue..Thu, nothing yet on Fri (today).
        let rows = vec![
            row(d(2025, 1, 7), "approved"),
            row(d(2025, 1, 8), "submitted"),
            row(d(2025, 1, 9), "approved"),
        ];
        let today = d(2025, 1, 10);
        let s = summarize(&classify(&required, &rows, today), today);
        assert_eq!(s.current_streak, 3);

        // A gap on Thursday ends the run regardless of today.
        let rows = vec![row(d(2025, 1, 7), "approved"), row(d(2025, 1, 8), "approved")];
        let s = summarize(&classify(&required, &rows, today), today);
        assert_eq!(s.current_streak, 0);
    }

    #[test]
    fn drop_candidate_thresholds() {
        let period = (d(2025, 1, 1), d(2025, 1, 31));
        // Daily cadence: Mon 13th .. Fri 17th all missing -> 5 >= 5.
        let check = drop_check(Cadence::DailyWeekday, period, &[], d(2025, 1, 17));
        assert_eq!(check.window_missing, 5);
        assert!(check.is_candidate);

        // One certified day pulls it below the threshold.
        let rows = vec![row(d(2025, 1, 15), "submitted")];
        let check = drop_check(Cadence::DailyWeekday, period, &rows, d(2025, 1, 17));
        assert_eq!(check.window_missing, 4);
        assert!(!check.is_candidate);

        // Weekly: missing the one Sunday in the trailing week is enough.
        let check = drop_check(Cadence::WeeklySunday, period, &[], d(2025, 1, 13));
        assert_eq!(check.window_missing, 1);
        assert!(check.is_candidate);

        // Weekly with the Sunday certified: safe.
        let rows = vec![row(d(2025, 1, 12), "approved")];
        let check = drop_check(Cadence::WeeklySunday, period, &rows, d(2025, 1, 13));
        assert!(!check.is_candidate);
    }

    #[test]
    fn drop_window_clamped_to_period_start() {
        // Two days into the period nothing can have 5 misses yet.
        let period = (d(2025, 1, 13), d(2025, 1, 31));
        let check = drop_check(Cadence::DailyWeekday, period, &[], d(2025, 1, 14));
        assert_eq!(check.window_missing, 2);
        assert!(!check.is_candidate);
    }
}
