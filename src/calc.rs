use crate::dates::Bimester;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const MAX_GRADE: f64 = 10.0;

/// One-decimal rounding applied to every grade shown to a user.
pub fn round_off_1_decimal(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

// Rows are append-only: a re-submission is a new record and the read path
// keeps the latest submitted_at per (student, class, subject, bimester).
#[derive(Debug, Clone)]
pub struct GradeRecord {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub bimester: Bimester,
    pub partial: Option<f64>,
    pub global: Option<f64>,
    pub participation: Option<f64>,
    pub recovery: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub student_name: Option<String>,
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `base = (partial + global) / 2 + participation`, absent sub-scores
/// counting as 0. A recovery exam replaces the base when it is higher, both
/// sides rounded to one decimal first. No lower clamp.
pub fn final_grade(rec: &GradeRecord) -> f64 {
    let base = (rec.partial.unwrap_or(0.0) + rec.global.unwrap_or(0.0)) / 2.0
        + rec.participation.unwrap_or(0.0);
    let base = round_off_1_decimal(base);
    let result = match rec.recovery {
        Some(r) => base.max(round_off_1_decimal(r)),
        None => base,
    };
    result.min(MAX_GRADE)
}

pub fn has_any_score(rec: &GradeRecord) -> bool {
    rec.partial.is_some()
        || rec.global.is_some()
        || rec.participation.is_some()
        || rec.recovery.is_some()
}

/// Average of the non-null finals only. `None` when every entry is null:
/// "no data yet" is not the same as "scored zero".
pub fn average_across_bimesters(finals: &[Option<f64>]) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for f in finals.iter().flatten() {
        sum += f;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(round_off_1_decimal(sum / count as f64))
}

#[derive(Debug, Clone, Default)]
pub struct GradeFilters {
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub bimester: Option<Bimester>,
    pub name_search: Option<String>,
    pub allowed_subjects: Option<HashSet<String>>,
}

impl GradeFilters {
    fn matches(&self, rec: &GradeRecord) -> bool {
        if let Some(class_id) = &self.class_id {
            if rec.class_id != *class_id {
                return false;
            }
        }
        if let Some(subject_id) = &self.subject_id {
            if rec.subject_id != *subject_id {
                return false;
            }
        }
        if let Some(bimester) = self.bimester {
            if rec.bimester != bimester {
                return false;
            }
        }
        if let Some(search) = &self.name_search {
            let needle = search.trim().to_lowercase();
            if !needle.is_empty() {
                let hit = rec
                    .student_name
                    .as_deref()
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false);
                if !hit {
                    return false;
                }
            }
        }
        if let Some(allowed) = &self.allowed_subjects {
            if !allowed.contains(&rec.subject_id) {
                return false;
            }
        }
        true
    }
}

// Re-submissions leave stale duplicate rows behind; listings must always
// show "latest wins" per (student, subject). Filters apply before grouping.
// Output sorted by student display name.
pub fn dedup_latest(records: Vec<GradeRecord>, filters: &GradeFilters) -> Vec<GradeRecord> {
    let mut latest: HashMap<(String, String), GradeRecord> = HashMap::new();
    for rec in records {
        if !filters.matches(&rec) {
            continue;
        }
        let key = (rec.student_id.clone(), rec.subject_id.clone());
        match latest.get(&key) {
            Some(cur) if rec.submitted_at <= cur.submitted_at => {}
            _ => {
                latest.insert(key, rec);
            }
        }
    }
    let mut out: Vec<GradeRecord> = latest.into_values().collect();
    out.sort_by(|a, b| {
        a.student_name
            .as_deref()
            .unwrap_or("")
            .cmp(b.student_name.as_deref().unwrap_or(""))
    });
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeSort {
    StudentName,
    Partial,
    Global,
    Participation,
    Recovery,
    FinalGrade,
    SubmittedAt,
}

impl GradeSort {
    pub fn parse(raw: &str) -> Option<GradeSort> {
        match raw {
            "studentName" => Some(GradeSort::StudentName),
            "partial" => Some(GradeSort::Partial),
            "global" => Some(GradeSort::Global),
            "participation" => Some(GradeSort::Participation),
            "recovery" => Some(GradeSort::Recovery),
            "finalGrade" => Some(GradeSort::FinalGrade),
            "submittedAt" => Some(GradeSort::SubmittedAt),
            _ => None,
        }
    }
}

fn desc_f64(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

// Name ascending, scores descending, submission date most-recent-first.
// All sorts are stable; ties preserve input order.
pub fn sort_records(records: &mut [GradeRecord], order: GradeSort) {
    match order {
        GradeSort::StudentName => records.sort_by(|a, b| {
            a.student_name
                .as_deref()
                .unwrap_or("")
                .cmp(b.student_name.as_deref().unwrap_or(""))
        }),
        GradeSort::Partial => {
            records.sort_by(|a, b| desc_f64(a.partial.unwrap_or(0.0), b.partial.unwrap_or(0.0)))
        }
        GradeSort::Global => {
            records.sort_by(|a, b| desc_f64(a.global.unwrap_or(0.0), b.global.unwrap_or(0.0)))
        }
        GradeSort::Participation => records.sort_by(|a, b| {
            desc_f64(
                a.participation.unwrap_or(0.0),
                b.participation.unwrap_or(0.0),
            )
        }),
        GradeSort::Recovery => {
            records.sort_by(|a, b| desc_f64(a.recovery.unwrap_or(0.0), b.recovery.unwrap_or(0.0)))
        }
        GradeSort::FinalGrade => records.sort_by(|a, b| desc_f64(final_grade(a), final_grade(b))),
        GradeSort::SubmittedAt => records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at)),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCell {
    pub final_grade: f64,
}

/// The boletim: subject x bimester grid of final grades for one student in
/// one school year.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub subjects: Vec<String>,
    pub bimesters: Vec<String>,
    pub grid: BTreeMap<String, BTreeMap<String, ReportCell>>,
}

// Unresolvable subject ids render as the raw id. The bimester axis always
// carries all four labels; within one cell the latest submission wins.
// None when the student has no records at all.
pub fn report_card(
    records: &[GradeRecord],
    subject_names: &HashMap<String, String>,
) -> Option<ReportCard> {
    if records.is_empty() {
        return None;
    }

    let mut latest: HashMap<(Bimester, &str), &GradeRecord> = HashMap::new();
    for rec in records {
        let key = (rec.bimester, rec.subject_id.as_str());
        match latest.get(&key) {
            Some(cur) if rec.submitted_at <= cur.submitted_at => {}
            _ => {
                latest.insert(key, rec);
            }
        }
    }

    let mut subjects: BTreeSet<String> = BTreeSet::new();
    let mut grid: BTreeMap<String, BTreeMap<String, ReportCell>> = BTreeMap::new();
    for b in Bimester::ALL {
        grid.insert(b.label().to_string(), BTreeMap::new());
    }
    for ((bimester, subject_id), rec) in &latest {
        let name = subject_names
            .get(*subject_id)
            .cloned()
            .unwrap_or_else(|| (*subject_id).to_string());
        subjects.insert(name.clone());
        grid.entry(bimester.label().to_string()).or_default().insert(
            name,
            ReportCell {
                final_grade: final_grade(rec),
            },
        );
    }

    Some(ReportCard {
        subjects: subjects.into_iter().collect(),
        bimesters: Bimester::ALL
            .iter()
            .map(|b| b.label().to_string())
            .collect(),
        grid,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAverage {
    pub class_id: String,
    pub average: f64,
}

// Dashboard semantics: a class with no matching records reports 0, not
// null (charts need a plottable number). Report cards are the opposite.
pub fn class_averages(
    records: &[GradeRecord],
    subject_id: Option<&str>,
    class_ids: &[String],
) -> Vec<ClassAverage> {
    class_ids
        .iter()
        .map(|class_id| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for rec in records {
                if rec.class_id != *class_id {
                    continue;
                }
                if let Some(subject) = subject_id {
                    if rec.subject_id != subject {
                        continue;
                    }
                }
                sum += final_grade(rec);
                count += 1;
            }
            let average = if count > 0 {
                round_off_1_decimal(sum / count as f64)
            } else {
                0.0
            };
            ClassAverage {
                class_id: class_id.clone(),
                average,
            }
        })
        .collect()
}

/// A student's class as of year Y: the history entry when one exists, else
/// the current class. Promotion writes history entries instead of
/// rewriting old records.
pub fn resolve_class_for_year(
    current_class: &str,
    history: &HashMap<i32, String>,
    year: i32,
) -> String {
    history
        .get(&year)
        .cloned()
        .unwrap_or_else(|| current_class.to_string())
}
