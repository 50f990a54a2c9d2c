use crate::calc::{self, GradeFilters, GradeRecord, GradeSort};
use crate::catalog;
use crate::dates::Bimester;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn db(e: impl std::fmt::Display) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    fn bad(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad(format!("missing {}", key)))
}

fn get_optional_score(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad(format!("{} must be a number or null", key))),
    }
}

// Rows with an unparseable bimester label or timestamp are skipped rather
// than failing the whole listing.
fn load_grade_records(
    conn: &Connection,
    class_id: Option<&str>,
) -> Result<Vec<GradeRecord>, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, student_id, class_id, subject_id, bimester,
                partial_score, global_score, participation_score, recovery_score,
                submitted_at, student_name
         FROM grades",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(class_id) = class_id {
        sql.push_str(" WHERE class_id = ?");
        binds.push(class_id.to_string());
    }
    sql.push_str(" ORDER BY submitted_at");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    type Row = (
        String,
        String,
        String,
        String,
        String,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        String,
        Option<String>,
    );
    let rows: Vec<Row> = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
                r.get(10)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut records = Vec::with_capacity(rows.len());
    for (
        id,
        student_id,
        class_id,
        subject_id,
        bimester_raw,
        partial,
        global,
        participation,
        recovery,
        submitted_raw,
        student_name,
    ) in rows
    {
        let Some(bimester) = Bimester::parse(&bimester_raw) else {
            continue;
        };
        let Some(submitted_at) = calc::parse_timestamp(&submitted_raw) else {
            continue;
        };
        records.push(GradeRecord {
            id,
            student_id,
            class_id,
            subject_id,
            bimester,
            partial,
            global,
            participation,
            recovery,
            submitted_at,
            student_name,
        });
    }
    Ok(records)
}

fn grade_json(rec: &GradeRecord) -> serde_json::Value {
    json!({
        "id": rec.id,
        "studentId": rec.student_id,
        "classId": rec.class_id,
        "subjectId": rec.subject_id,
        "bimester": rec.bimester.label(),
        "partialScore": rec.partial,
        "globalScore": rec.global,
        "participationScore": rec.participation,
        "recoveryScore": rec.recovery,
        "submittedAt": rec.submitted_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        "studentName": rec.student_name,
        "finalGrade": calc::final_grade(rec)
    })
}

// A save is always a new physical row; the listing derives "current" by
// max submission timestamp, so history is never overwritten.
fn grades_save(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let bimester_raw = get_required_str(params, "bimester")?;
    let Some(bimester) = Bimester::parse(&bimester_raw) else {
        return Err(HandlerErr::bad(format!(
            "bimester must be one of the four bimester labels, got '{}'",
            bimester_raw
        )));
    };

    let partial = get_optional_score(params, "partialScore")?;
    let global = get_optional_score(params, "globalScore")?;
    let participation = get_optional_score(params, "participationScore")?;
    let recovery = get_optional_score(params, "recoveryScore")?;

    let student_name: Option<String> = conn
        .query_row(
            "SELECT name FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if student_name.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let record = GradeRecord {
        id: Uuid::new_v4().to_string(),
        student_id,
        class_id,
        subject_id,
        bimester,
        partial,
        global,
        participation,
        recovery,
        submitted_at: Utc::now(),
        student_name,
    };
    if !calc::has_any_score(&record) {
        return Err(HandlerErr::bad("at least one score field must be filled"));
    }

    let submitted_at = record
        .submitted_at
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    conn.execute(
        "INSERT INTO grades(id, student_id, class_id, subject_id, bimester,
                            partial_score, global_score, participation_score,
                            recovery_score, submitted_at, student_name)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &record.id,
            &record.student_id,
            &record.class_id,
            &record.subject_id,
            record.bimester.label(),
            record.partial,
            record.global,
            record.participation,
            record.recovery,
            &submitted_at,
            &record.student_name,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;

    Ok(json!({
        "gradeId": record.id,
        "submittedAt": submitted_at,
        "finalGrade": calc::final_grade(&record)
    }))
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let bimester = match params.get("bimester").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => Some(
            Bimester::parse(raw)
                .ok_or_else(|| HandlerErr::bad(format!("unknown bimester '{}'", raw)))?,
        ),
    };
    let search = params.get("search").and_then(|v| v.as_str());
    let allowed_subjects: Option<HashSet<String>> = match params.get("subjectIds") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(raw) = v.as_array() else {
                return Err(HandlerErr::bad("subjectIds must be an array of strings"));
            };
            let mut set = HashSet::new();
            for item in raw {
                let Some(id) = item.as_str() else {
                    return Err(HandlerErr::bad("subjectIds must contain only strings"));
                };
                set.insert(id.to_string());
            }
            Some(set)
        }
    };
    let sort = match params.get("sort").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => Some(
            GradeSort::parse(raw)
                .ok_or_else(|| HandlerErr::bad(format!("unknown sort order '{}'", raw)))?,
        ),
    };
    let page = params.get("page").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
    let page_size = params
        .get("pageSize")
        .and_then(|v| v.as_u64())
        .unwrap_or(50) as usize;
    if page_size == 0 {
        return Err(HandlerErr::bad("pageSize must be positive"));
    }

    let records = load_grade_records(conn, class_id)?;
    let filters = GradeFilters {
        class_id: class_id.map(|s| s.to_string()),
        subject_id: subject_id.map(|s| s.to_string()),
        bimester,
        name_search: search.map(|s| s.to_string()),
        allowed_subjects,
    };
    let mut current = calc::dedup_latest(records, &filters);
    if let Some(sort) = sort {
        calc::sort_records(&mut current, sort);
    }

    let total = current.len();
    let (total_pages, slice) = catalog::paginate(&current, page, page_size);

    Ok(json!({
        "total": total,
        "totalPages": total_pages,
        "page": page,
        "grades": slice.iter().map(grade_json).collect::<Vec<_>>()
    }))
}

// Administrative only; the normal flow never deletes grade rows.
fn grades_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let changed = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grades" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "grade not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.save" => Some(with_conn(state, req, grades_save)),
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "grades.delete" => Some(with_conn(state, req, grades_delete)),
        _ => None,
    }
}
