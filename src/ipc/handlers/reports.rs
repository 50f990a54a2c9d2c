use crate::calc::{self, GradeRecord};
use crate::dates::Bimester;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

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

fn load_student_class(conn: &Connection, student_id: &str) -> Result<String, HandlerErr> {
    let current: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    current.ok_or(HandlerErr {
        code: "not_found",
        message: "student not found".to_string(),
        details: None,
    })
}

fn load_class_history(
    conn: &Connection,
    student_id: &str,
) -> Result<HashMap<i32, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT year, class_id FROM student_class_history WHERE student_id = ?")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, i64>(0)? as i32, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(rows.into_iter().collect())
}

fn load_subject_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM subjects")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(rows.into_iter().collect())
}

fn load_grade_records(
    conn: &Connection,
    student_id: Option<&str>,
    class_ids: &[String],
) -> Result<Vec<GradeRecord>, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, student_id, class_id, subject_id, bimester,
                partial_score, global_score, participation_score, recovery_score,
                submitted_at, student_name
         FROM grades",
    );
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(student_id) = student_id {
        clauses.push("student_id = ?".to_string());
        binds.push(student_id.to_string());
    }
    if !class_ids.is_empty() {
        let placeholders = vec!["?"; class_ids.len()].join(",");
        clauses.push(format!("class_id IN ({})", placeholders));
        binds.extend(class_ids.iter().cloned());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
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

fn year_param(params: &serde_json::Value) -> Result<i32, HandlerErr> {
    params
        .get("year")
        .and_then(|v| v.as_i64())
        .map(|y| y as i32)
        .ok_or_else(|| HandlerErr::bad("missing year"))
}

// The class is resolved through the per-year history so old report cards
// survive promotion.
fn report_card(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let year = year_param(params)?;

    let current_class = load_student_class(conn, &student_id)?;
    let history = load_class_history(conn, &student_id)?;
    let class_id = calc::resolve_class_for_year(&current_class, &history, year);

    let records = load_grade_records(conn, Some(&student_id), &[class_id.clone()])?;
    let subject_names = load_subject_names(conn)?;

    match calc::report_card(&records, &subject_names) {
        None => Ok(json!({ "classId": class_id, "reportCard": null })),
        Some(card) => Ok(json!({
            "classId": class_id,
            "reportCard": serde_json::to_value(&card).unwrap_or_default()
        })),
    }
}

// Per-subject bimester finals, per-subject averages, and the student's
// overall average (the average of the subject averages).
fn year_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let year = year_param(params)?;

    let current_class = load_student_class(conn, &student_id)?;
    let history = load_class_history(conn, &student_id)?;
    let class_id = calc::resolve_class_for_year(&current_class, &history, year);

    let records = load_grade_records(conn, Some(&student_id), &[class_id.clone()])?;
    let subject_names = load_subject_names(conn)?;

    // Latest submission wins within each (subject, bimester) cell.
    let mut latest: HashMap<(String, Bimester), &GradeRecord> = HashMap::new();
    for rec in &records {
        let key = (rec.subject_id.clone(), rec.bimester);
        match latest.get(&key) {
            Some(cur) if rec.submitted_at <= cur.submitted_at => {}
            _ => {
                latest.insert(key, rec);
            }
        }
    }

    let mut per_subject: BTreeMap<String, [Option<f64>; 4]> = BTreeMap::new();
    for ((subject_id, bimester), rec) in &latest {
        let finals = per_subject.entry(subject_id.clone()).or_insert([None; 4]);
        finals[bimester.index()] = Some(calc::final_grade(rec));
    }

    let mut subjects_json = Vec::new();
    let mut subject_averages: Vec<Option<f64>> = Vec::new();
    for (subject_id, finals) in &per_subject {
        let average = calc::average_across_bimesters(finals);
        subject_averages.push(average);
        subjects_json.push(json!({
            "subjectId": subject_id,
            "name": subject_names
                .get(subject_id)
                .cloned()
                .unwrap_or_else(|| subject_id.clone()),
            "perBimester": finals,
            "average": average
        }));
    }
    let overall = calc::average_across_bimesters(&subject_averages);

    Ok(json!({
        "classId": class_id,
        "subjects": subjects_json,
        "overall": overall
    }))
}

// Dashboard numbers: a class with no records averages 0, not null.
fn class_averages(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(raw_ids) = params.get("classIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad("missing classIds"));
    };
    let mut class_ids: Vec<String> = Vec::new();
    for item in raw_ids {
        let Some(id) = item.as_str() else {
            return Err(HandlerErr::bad("classIds must contain only strings"));
        };
        class_ids.push(id.to_string());
    }
    if class_ids.is_empty() {
        return Err(HandlerErr::bad("classIds must not be empty"));
    }
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());

    let records = load_grade_records(conn, None, &class_ids)?;
    let averages = calc::class_averages(&records, subject_id, &class_ids);

    Ok(json!({
        "classes": serde_json::to_value(&averages).unwrap_or_default()
    }))
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
        "reports.reportCard" => Some(with_conn(state, req, report_card)),
        "reports.yearSummary" => Some(with_conn(state, req, year_summary)),
        "reports.classAverages" => Some(with_conn(state, req, class_averages)),
        _ => None,
    }
}
