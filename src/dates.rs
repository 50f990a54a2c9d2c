use chrono::{Datelike, NaiveDate, Weekday};

/// One of the four fixed grading periods of a school year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bimester {
    First,
    Second,
    Third,
    Fourth,
}

impl Bimester {
    pub const ALL: [Bimester; 4] = [
        Bimester::First,
        Bimester::Second,
        Bimester::Third,
        Bimester::Fourth,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Bimester::First => "1º Bimestre",
            Bimester::Second => "2º Bimestre",
            Bimester::Third => "3º Bimestre",
            Bimester::Fourth => "4º Bimestre",
        }
    }

    /// Accepts the display label or the bare ordinal ("1".."4").
    pub fn parse(raw: &str) -> Option<Bimester> {
        let t = raw.trim();
        for b in Bimester::ALL {
            if t.eq_ignore_ascii_case(b.label()) {
                return Some(b);
            }
        }
        match t {
            "1" => Some(Bimester::First),
            "2" => Some(Bimester::Second),
            "3" => Some(Bimester::Third),
            "4" => Some(Bimester::Fourth),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Bimester::First => 0,
            Bimester::Second => 1,
            Bimester::Third => 2,
            Bimester::Fourth => 3,
        }
    }

    /// Fixed calendar quarter of the given year (inclusive on both ends).
    pub fn date_range(self, year: i32) -> (NaiveDate, NaiveDate) {
        let (sm, em, ed) = match self {
            Bimester::First => (1, 3, 31),
            Bimester::Second => (4, 6, 30),
            Bimester::Third => (7, 9, 30),
            Bimester::Fourth => (10, 12, 31),
        };
        let start = NaiveDate::from_ymd_opt(year, sm, 1).unwrap_or_default();
        let end = NaiveDate::from_ymd_opt(year, em, ed).unwrap_or_default();
        (start, end)
    }

    pub fn contains(self, year: i32, day: NaiveDate) -> bool {
        let (start, end) = self.date_range(year);
        day >= start && day <= end
    }
}

/// Calendar-day keys are plain `YYYY-MM-DD` strings; anything else is
/// "unparseable" and the aggregation layers skip it.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

pub fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// English weekday key used as the canonical lookup key before any
/// caller-supplied translation map is applied.
pub fn weekday_key(day: NaiveDate) -> &'static str {
    match day.weekday() {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Canonical weekday ordering for attendance breakdowns. Weekend data may
/// exist in a workspace but never appears in the ordered output.
pub const SCHOOL_WEEKDAYS: [&str; 5] = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_day_accepts_iso_and_rejects_garbage() {
        assert_eq!(
            parse_day("2025-03-10"),
            NaiveDate::from_ymd_opt(2025, 3, 10)
        );
        assert_eq!(parse_day(" 2025-03-10 "), NaiveDate::from_ymd_opt(2025, 3, 10));
        assert_eq!(parse_day("10/03/2025"), None);
        assert_eq!(parse_day("2025-13-01"), None);
        assert_eq!(parse_day(""), None);
    }

    #[test]
    fn format_day_round_trips() {
        let d = NaiveDate::from_ymd_opt(2025, 8, 4).unwrap();
        assert_eq!(parse_day(&format_day(d)), Some(d));
    }

    #[test]
    fn bimester_parse_accepts_label_and_ordinal() {
        assert_eq!(Bimester::parse("1º Bimestre"), Some(Bimester::First));
        assert_eq!(Bimester::parse("3"), Some(Bimester::Third));
        assert_eq!(Bimester::parse("5"), None);
        assert_eq!(Bimester::parse("Bimestre"), None);
    }

    #[test]
    fn bimester_ranges_cover_the_year_without_overlap() {
        let year = 2025;
        let mut prev_end: Option<NaiveDate> = None;
        for b in Bimester::ALL {
            let (start, end) = b.date_range(year);
            assert!(start <= end);
            if let Some(pe) = prev_end {
                assert_eq!(start, pe.succ_opt().unwrap());
            }
            prev_end = Some(end);
        }
        assert_eq!(
            prev_end,
            NaiveDate::from_ymd_opt(year, 12, 31),
            "fourth bimester must end on Dec 31"
        );
    }

    #[test]
    fn bimester_membership_is_inclusive() {
        let b = Bimester::Second;
        assert!(b.contains(2025, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap()));
        assert!(b.contains(2025, NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()));
        assert!(!b.contains(2025, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()));
        assert!(!b.contains(2024, NaiveDate::from_ymd_opt(2025, 5, 1).unwrap()));
    }

    #[test]
    fn weekday_key_matches_chrono() {
        let mon = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        assert_eq!(weekday_key(mon), "Monday");
        let sun = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(weekday_key(sun), "Sunday");
    }
}
