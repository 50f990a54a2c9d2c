use crate::calc::round_off_1_decimal;
use crate::dates::{self, Bimester, SCHOOL_WEEKDAYS};
use serde::Serialize;
use std::collections::HashMap;

/// Tri-state presence. `Unrecorded` is not `Absent`; a sheet that was never
/// filled in says nothing about the student.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    Unrecorded,
}

impl Presence {
    // Wire and storage shape is true / false / null.
    pub fn from_flag(v: Option<bool>) -> Presence {
        match v {
            Some(true) => Presence::Present,
            Some(false) => Presence::Absent,
            None => Presence::Unrecorded,
        }
    }

    pub fn as_flag(self) -> Option<bool> {
        match self {
            Presence::Present => Some(true),
            Presence::Absent => Some(false),
            Presence::Unrecorded => None,
        }
    }

    pub fn from_db(v: Option<i64>) -> Presence {
        Presence::from_flag(v.map(|n| n != 0))
    }

    pub fn to_db(self) -> Option<i64> {
        self.as_flag().map(i64::from)
    }
}

// One student's presence for one subject, one class, one calendar day.
#[derive(Debug, Clone)]
pub struct RollEntry {
    pub id: String,
    pub class_id: String,
    pub subject_id: String,
    pub student_id: String,
    pub date: String,
    pub presence: Presence,
    pub teacher_id: Option<String>,
    pub justification: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NamedStudent {
    pub id: String,
    pub name: String,
}

// Every roster student gets the existing record's presence when one exists,
// else explicitly Unrecorded.
pub fn initialize_sheet(
    students: &[NamedStudent],
    existing: &[RollEntry],
) -> HashMap<String, Presence> {
    let by_student: HashMap<&str, Presence> = existing
        .iter()
        .map(|e| (e.student_id.as_str(), e.presence))
        .collect();
    students
        .iter()
        .map(|s| {
            let presence = by_student
                .get(s.id.as_str())
                .copied()
                .unwrap_or(Presence::Unrecorded);
            (s.id.clone(), presence)
        })
        .collect()
}

/// A non-empty justification is the reason for an absence, so setting one
/// forces the presence to `Absent`. Clearing the text removes the stored
/// justification and leaves the presence untouched.
pub fn apply_justification(
    presences: &mut HashMap<String, Presence>,
    justifications: &mut HashMap<String, String>,
    student_id: &str,
    text: &str,
) {
    if text.trim().is_empty() {
        justifications.remove(student_id);
        return;
    }
    justifications.insert(student_id.to_string(), text.to_string());
    presences.insert(student_id.to_string(), Presence::Absent);
}

// Record-level form of the same coupling, applied before persisting.
pub fn enforce_justification(presence: Presence, justification: Option<&str>) -> Presence {
    match justification {
        Some(t) if !t.trim().is_empty() => Presence::Absent,
        _ => presence,
    }
}

// Does not consult existing justifications; reconciling those is the
// caller's job.
pub fn bulk_mark_all(students: &[NamedStudent], present: bool) -> HashMap<String, Presence> {
    let value = if present {
        Presence::Present
    } else {
        Presence::Absent
    };
    students.iter().map(|s| (s.id.clone(), value)).collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollStats {
    pub total_present: u64,
    pub total_absent: u64,
    pub total_unset: u64,
    pub total: u64,
    pub pct_present: i64,
    pub pct_absent: i64,
}

fn pct(count: u64, total: u64) -> i64 {
    if total == 0 {
        return 0;
    }
    (count as f64 / total as f64 * 100.0).round() as i64
}

// Unset entries count toward the total but toward neither percentage, so
// pct_present + pct_absent need not reach 100.
pub fn compute_statistics<I>(states: I) -> RollStats
where
    I: IntoIterator<Item = Presence>,
{
    let mut total_present = 0u64;
    let mut total_absent = 0u64;
    let mut total_unset = 0u64;
    for s in states {
        match s {
            Presence::Present => total_present += 1,
            Presence::Absent => total_absent += 1,
            Presence::Unrecorded => total_unset += 1,
        }
    }
    let total = total_present + total_absent + total_unset;
    RollStats {
        total_present,
        total_absent,
        total_unset,
        total,
        pct_present: pct(total_present, total),
        pct_absent: pct(total_absent, total),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceFilter {
    All,
    Present,
    Absent,
    Unset,
}

impl PresenceFilter {
    pub fn parse(raw: &str) -> Option<PresenceFilter> {
        match raw {
            "all" => Some(PresenceFilter::All),
            "present" => Some(PresenceFilter::Present),
            "absent" => Some(PresenceFilter::Absent),
            "unset" => Some(PresenceFilter::Unset),
            _ => None,
        }
    }

    pub fn matches(self, presence: Presence) -> bool {
        match self {
            PresenceFilter::All => true,
            PresenceFilter::Present => presence == Presence::Present,
            PresenceFilter::Absent => presence == Presence::Absent,
            PresenceFilter::Unset => presence == Presence::Unrecorded,
        }
    }
}

pub fn filter_by_state(entries: Vec<RollEntry>, mode: PresenceFilter) -> Vec<RollEntry> {
    entries
        .into_iter()
        .filter(|e| mode.matches(e.presence))
        .collect()
}

// Name-substring filter (case-insensitive) composed with the state filter.
// Students missing from the state map count as Unrecorded.
pub fn filter_students(
    students: &[NamedStudent],
    states: &HashMap<String, Presence>,
    name_query: &str,
    mode: PresenceFilter,
) -> Vec<NamedStudent> {
    let needle = name_query.trim().to_lowercase();
    students
        .iter()
        .filter(|s| {
            let name_ok = needle.is_empty() || s.name.to_lowercase().contains(&needle);
            let state = states
                .get(&s.id)
                .copied()
                .unwrap_or(Presence::Unrecorded);
            name_ok && mode.matches(state)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekdayStat {
    pub weekday: String,
    pub present: u64,
    pub absent: u64,
    pub rate: f64,
}

// Ordered Monday to Friday. Unparseable dates are skipped; weekend records
// accumulate but never appear because the ordering list only carries the
// five school weekdays. The name map translates the English keys.
pub fn by_weekday(entries: &[RollEntry], names: &HashMap<String, String>) -> Vec<WeekdayStat> {
    let mut counts: HashMap<&'static str, (u64, u64)> = HashMap::new();
    for entry in entries {
        let Some(day) = dates::parse_day(&entry.date) else {
            continue;
        };
        let key = dates::weekday_key(day);
        let slot = counts.entry(key).or_insert((0, 0));
        match entry.presence {
            Presence::Present => slot.0 += 1,
            Presence::Absent => slot.1 += 1,
            Presence::Unrecorded => {}
        }
    }

    SCHOOL_WEEKDAYS
        .iter()
        .map(|key| {
            let (present, absent) = counts.get(key).copied().unwrap_or((0, 0));
            let recorded = present + absent;
            let rate = if recorded > 0 {
                round_off_1_decimal(present as f64 / recorded as f64 * 100.0)
            } else {
                0.0
            };
            WeekdayStat {
                weekday: names.get(*key).cloned().unwrap_or_else(|| key.to_string()),
                present,
                absent,
                rate,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BimesterStat {
    pub bimester: String,
    pub present: u64,
    pub absent: u64,
    pub unset: u64,
    pub pct_present: String,
}

// Four fixed calendar-quarter buckets. The percentage uses the full bucket
// total (unrecorded included), formatted to one decimal as a string.
pub fn by_bimester(entries: &[RollEntry], year: i32) -> Vec<BimesterStat> {
    Bimester::ALL
        .iter()
        .map(|b| {
            let mut present = 0u64;
            let mut absent = 0u64;
            let mut unset = 0u64;
            for entry in entries {
                let Some(day) = dates::parse_day(&entry.date) else {
                    continue;
                };
                if !b.contains(year, day) {
                    continue;
                }
                match entry.presence {
                    Presence::Present => present += 1,
                    Presence::Absent => absent += 1,
                    Presence::Unrecorded => unset += 1,
                }
            }
            let total = present + absent + unset;
            let pct_present = if total > 0 {
                format!("{:.1}", present as f64 / total as f64 * 100.0)
            } else {
                "0.0".to_string()
            };
            BimesterStat {
                bimester: b.label().to_string(),
                present,
                absent,
                unset,
                pct_present,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub name: String,
    pub rate: f64,
}

fn first_name(full: &str) -> String {
    full.split_whitespace()
        .next()
        .unwrap_or(full)
        .to_string()
}

// Rate over recorded entries only, descending, first name only. Students
// with nothing recorded rank at 0.0.
pub fn top_by_rate(
    entries: &[RollEntry],
    students: &[NamedStudent],
    limit: usize,
) -> Vec<RankedStudent> {
    let mut counts: HashMap<&str, (u64, u64)> = HashMap::new();
    for entry in entries {
        let slot = counts.entry(entry.student_id.as_str()).or_insert((0, 0));
        match entry.presence {
            Presence::Present => slot.0 += 1,
            Presence::Absent => slot.1 += 1,
            Presence::Unrecorded => {}
        }
    }

    let mut ranked: Vec<RankedStudent> = students
        .iter()
        .map(|s| {
            let (present, absent) = counts.get(s.id.as_str()).copied().unwrap_or((0, 0));
            let recorded = present + absent;
            let rate = if recorded > 0 {
                round_off_1_decimal(present as f64 / recorded as f64 * 100.0)
            } else {
                0.0
            };
            RankedStudent {
                student_id: s.id.clone(),
                name: first_name(&s.name),
                rate,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.rate.partial_cmp(&a.rate).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(limit);
    ranked
}

// Expected user-input problems come back as messages, never as errors.
pub fn validate_sheet(
    class_id: &str,
    subject_id: &str,
    date: &str,
    entries: &[(String, Presence)],
) -> Vec<String> {
    let mut messages = Vec::new();
    if class_id.trim().is_empty() {
        messages.push("class is required".to_string());
    }
    if subject_id.trim().is_empty() {
        messages.push("subject is required".to_string());
    }
    if dates::parse_day(date).is_none() {
        messages.push(format!("date must be YYYY-MM-DD, got '{}'", date));
    }
    for (student_id, _) in entries {
        if student_id.trim().is_empty() {
            messages.push("every entry needs a student id".to_string());
        }
    }
    messages
}
