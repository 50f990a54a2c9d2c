use crate::dates;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roll::{self, NamedStudent, Presence, PresenceFilter, RollEntry};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
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

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn list_students_for_class(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<NamedStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY name",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map([class_id], |r| {
        Ok(NamedStudent {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

struct EntryQuery<'a> {
    class_id: &'a str,
    subject_id: Option<&'a str>,
    date: Option<&'a str>,
    from: Option<&'a str>,
    to: Option<&'a str>,
}

fn load_entries(conn: &Connection, q: &EntryQuery<'_>) -> Result<Vec<RollEntry>, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, class_id, subject_id, date, student_id, present, teacher_id, justification
         FROM attendance
         WHERE class_id = ?",
    );
    let mut binds: Vec<String> = vec![q.class_id.to_string()];
    if let Some(subject_id) = q.subject_id {
        sql.push_str(" AND subject_id = ?");
        binds.push(subject_id.to_string());
    }
    if let Some(date) = q.date {
        sql.push_str(" AND date = ?");
        binds.push(date.to_string());
    }
    // ISO day strings order lexicographically, so range filters are plain
    // string comparisons.
    if let Some(from) = q.from {
        sql.push_str(" AND date >= ?");
        binds.push(from.to_string());
    }
    if let Some(to) = q.to {
        sql.push_str(" AND date <= ?");
        binds.push(to.to_string());
    }
    sql.push_str(" ORDER BY date, student_id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    stmt.query_map(rusqlite::params_from_iter(binds.iter()), |r| {
        let present: Option<i64> = r.get(5)?;
        Ok(RollEntry {
            id: r.get(0)?,
            class_id: r.get(1)?,
            subject_id: r.get(2)?,
            date: r.get(3)?,
            student_id: r.get(4)?,
            presence: Presence::from_db(present),
            teacher_id: r.get(6)?,
            justification: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn upsert_entry(conn: &Connection, entry: &RollEntry) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance(id, class_id, subject_id, date, student_id,
                                present, teacher_id, justification)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, subject_id, date, student_id) DO UPDATE SET
           present = excluded.present,
           teacher_id = excluded.teacher_id,
           justification = excluded.justification",
        (
            &entry.id,
            &entry.class_id,
            &entry.subject_id,
            &entry.date,
            &entry.student_id,
            entry.presence.to_db(),
            &entry.teacher_id,
            &entry.justification,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;
    Ok(())
}

fn sheet_key(params: &serde_json::Value) -> Result<(String, String, String), HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_str(params, "date")?;
    let Some(day) = dates::parse_day(&date) else {
        return Err(HandlerErr::bad(format!(
            "date must be YYYY-MM-DD, got '{}'",
            date
        )));
    };
    // Canonicalize so "2025-3-9" and "2025-03-09" key the same sheet.
    Ok((class_id, subject_id, dates::format_day(day)))
}

// Opening a sheet never writes: every roster student shows the stored
// presence when a record exists, else null ("not yet recorded").
fn sheet_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (class_id, subject_id, date) = sheet_key(params)?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let students = list_students_for_class(conn, &class_id)?;
    let existing = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id: Some(&subject_id),
            date: Some(&date),
            from: None,
            to: None,
        },
    )?;
    let sheet = roll::initialize_sheet(&students, &existing);
    let justifications: HashMap<&str, &str> = existing
        .iter()
        .filter_map(|e| {
            e.justification
                .as_deref()
                .map(|j| (e.student_id.as_str(), j))
        })
        .collect();

    let search = params.get("search").and_then(|v| v.as_str()).unwrap_or("");
    let state = match params.get("state").and_then(|v| v.as_str()) {
        None => PresenceFilter::All,
        Some(raw) => PresenceFilter::parse(raw)
            .ok_or_else(|| HandlerErr::bad(format!("unknown state filter '{}'", raw)))?,
    };
    let visible = roll::filter_students(&students, &sheet, search, state);

    let rows: Vec<serde_json::Value> = visible
        .iter()
        .map(|s| {
            let presence = sheet.get(&s.id).copied().unwrap_or(Presence::Unrecorded);
            json!({
                "studentId": s.id,
                "name": s.name,
                "present": presence.as_flag(),
                "justification": justifications.get(s.id.as_str())
            })
        })
        .collect();

    let stats = roll::compute_statistics(sheet.values().copied());
    Ok(json!({
        "classId": class_id,
        "subjectId": subject_id,
        "date": date,
        "rows": rows,
        "stats": serde_json::to_value(&stats).unwrap_or_default()
    }))
}

// Batch upsert keyed by (class, subject, date, student). Writes are
// sequential and nothing is rolled back on a mid-batch failure; the
// response reports counts so the caller can retry the failed subset.
fn save_sheet(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_str(params, "date")?;
    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let Some(entries_json) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad("missing entries"));
    };
    let mut entries: Vec<(String, Presence, Option<String>)> = Vec::new();
    for item in entries_json {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let presence = Presence::from_flag(item.get("present").and_then(|v| v.as_bool()));
        let justification = item
            .get("justification")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty());
        entries.push((student_id, presence, justification));
    }

    let validation_view: Vec<(String, Presence)> = entries
        .iter()
        .map(|(id, p, _)| (id.clone(), *p))
        .collect();
    let messages = roll::validate_sheet(&class_id, &subject_id, &date, &validation_view);
    if !messages.is_empty() {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "attendance sheet is invalid".to_string(),
            details: Some(json!({ "messages": messages })),
        });
    }
    let date = match dates::parse_day(&date) {
        Some(day) => dates::format_day(day),
        None => date,
    };

    let roster: Vec<String> = list_students_for_class(conn, &class_id)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let requested = entries.len();
    let mut saved = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (student_id, presence, justification) in entries {
        if !roster.contains(&student_id) {
            errors.push(json!({
                "studentId": student_id,
                "message": "student is not in this class"
            }));
            continue;
        }
        // A non-empty justification is the reason for an absence.
        let presence = roll::enforce_justification(presence, justification.as_deref());
        let entry = RollEntry {
            id: Uuid::new_v4().to_string(),
            class_id: class_id.clone(),
            subject_id: subject_id.clone(),
            date: date.clone(),
            student_id: student_id.clone(),
            presence,
            teacher_id: teacher_id.clone(),
            justification,
        };
        match upsert_entry(conn, &entry) {
            Ok(()) => saved += 1,
            Err(e) => errors.push(json!({
                "studentId": student_id,
                "message": e.message
            })),
        }
    }

    Ok(json!({
        "requested": requested,
        "saved": saved,
        "failed": errors.len(),
        "errors": errors
    }))
}

fn set_justification(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (class_id, subject_id, date) = sheet_key(params)?;
    let student_id = get_required_str(params, "studentId")?;
    let text = params
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let students = list_students_for_class(conn, &class_id)?;
    if !students.iter().any(|s| s.id == student_id) {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found in this class".to_string(),
            details: None,
        });
    }

    let existing = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id: Some(&subject_id),
            date: Some(&date),
            from: None,
            to: None,
        },
    )?;
    let mut presences = roll::initialize_sheet(&students, &existing);
    let mut justifications: HashMap<String, String> = existing
        .iter()
        .filter_map(|e| {
            e.justification
                .clone()
                .map(|j| (e.student_id.clone(), j))
        })
        .collect();
    roll::apply_justification(&mut presences, &mut justifications, &student_id, &text);

    let presence = presences
        .get(&student_id)
        .copied()
        .unwrap_or(Presence::Unrecorded);
    let justification = justifications.get(&student_id).cloned();
    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            existing
                .iter()
                .find(|e| e.student_id == student_id)
                .and_then(|e| e.teacher_id.clone())
        });

    let entry = RollEntry {
        id: Uuid::new_v4().to_string(),
        class_id,
        subject_id,
        date,
        student_id,
        presence,
        teacher_id,
        justification: justification.clone(),
    };
    upsert_entry(conn, &entry)?;
    Ok(json!({
        "present": presence.as_flag(),
        "justification": justification
    }))
}

// Marking present clears any stored justification (a present student needs
// no excuse); marking absent leaves existing justifications in place.
fn bulk_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (class_id, subject_id, date) = sheet_key(params)?;
    let present = params
        .get("present")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad("missing present"))?;
    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let students = list_students_for_class(conn, &class_id)?;
    let marks = roll::bulk_mark_all(&students, present);

    let existing = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id: Some(&subject_id),
            date: Some(&date),
            from: None,
            to: None,
        },
    )?;
    let kept_justifications: HashMap<String, String> = if present {
        HashMap::new()
    } else {
        existing
            .into_iter()
            .filter_map(|e| e.justification.map(|j| (e.student_id, j)))
            .collect()
    };

    let mut saved = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for student in &students {
        let presence = marks
            .get(&student.id)
            .copied()
            .unwrap_or(Presence::Unrecorded);
        let entry = RollEntry {
            id: Uuid::new_v4().to_string(),
            class_id: class_id.clone(),
            subject_id: subject_id.clone(),
            date: date.clone(),
            student_id: student.id.clone(),
            presence,
            teacher_id: teacher_id.clone(),
            justification: kept_justifications.get(&student.id).cloned(),
        };
        match upsert_entry(conn, &entry) {
            Ok(()) => saved += 1,
            Err(e) => errors.push(json!({
                "studentId": student.id,
                "message": e.message
            })),
        }
    }

    Ok(json!({
        "marked": saved,
        "failed": errors.len(),
        "errors": errors
    }))
}

fn range_params<'a>(params: &'a serde_json::Value) -> Result<(Option<&'a str>, Option<&'a str>), HandlerErr> {
    let from = params.get("from").and_then(|v| v.as_str());
    let to = params.get("to").and_then(|v| v.as_str());
    for d in [from, to].into_iter().flatten() {
        if dates::parse_day(d).is_none() {
            return Err(HandlerErr::bad(format!(
                "range bounds must be YYYY-MM-DD, got '{}'",
                d
            )));
        }
    }
    Ok((from, to))
}

// Raw record listing with a presence-state filter, for the "show only
// absences" style of view.
fn list_records(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let (from, to) = range_params(params)?;
    let state = match params.get("state").and_then(|v| v.as_str()) {
        None => PresenceFilter::All,
        Some(raw) => PresenceFilter::parse(raw)
            .ok_or_else(|| HandlerErr::bad(format!("unknown state filter '{}'", raw)))?,
    };

    let entries = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id,
            date: None,
            from,
            to,
        },
    )?;
    let entries = roll::filter_by_state(entries, state);
    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            json!({
                "studentId": e.student_id,
                "subjectId": e.subject_id,
                "date": e.date,
                "present": e.presence.as_flag(),
                "teacherId": e.teacher_id,
                "justification": e.justification
            })
        })
        .collect();
    Ok(json!({ "records": rows }))
}

fn stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let (from, to) = range_params(params)?;

    let entries = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id,
            date: None,
            from,
            to,
        },
    )?;
    let stats = roll::compute_statistics(entries.iter().map(|e| e.presence));
    Ok(serde_json::to_value(&stats).unwrap_or_default())
}

fn default_weekday_names() -> HashMap<String, String> {
    [
        ("Monday", "Segunda-feira"),
        ("Tuesday", "Terça-feira"),
        ("Wednesday", "Quarta-feira"),
        ("Thursday", "Quinta-feira"),
        ("Friday", "Sexta-feira"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn by_weekday(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let names = match params.get("weekdayNames").and_then(|v| v.as_object()) {
        None => default_weekday_names(),
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    };

    let entries = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id,
            date: None,
            from: None,
            to: None,
        },
    )?;
    let breakdown = roll::by_weekday(&entries, &names);
    Ok(json!({
        "weekdays": serde_json::to_value(&breakdown).unwrap_or_default()
    }))
}

fn by_bimester(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad("missing year"))? as i32;

    let entries = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id,
            date: None,
            from: None,
            to: None,
        },
    )?;
    let breakdown = roll::by_bimester(&entries, year);
    Ok(json!({
        "bimesters": serde_json::to_value(&breakdown).unwrap_or_default()
    }))
}

fn top_students(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

    let students = list_students_for_class(conn, &class_id)?;
    let entries = load_entries(
        conn,
        &EntryQuery {
            class_id: &class_id,
            subject_id,
            date: None,
            from: None,
            to: None,
        },
    )?;
    let ranked = roll::top_by_rate(&entries, &students, limit);
    Ok(json!({
        "students": serde_json::to_value(&ranked).unwrap_or_default()
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
        "attendance.sheetOpen" => Some(with_conn(state, req, sheet_open)),
        "attendance.saveSheet" => Some(with_conn(state, req, save_sheet)),
        "attendance.setJustification" => Some(with_conn(state, req, set_justification)),
        "attendance.listRecords" => Some(with_conn(state, req, list_records)),
        "attendance.bulkMark" => Some(with_conn(state, req, bulk_mark)),
        "attendance.stats" => Some(with_conn(state, req, stats)),
        "attendance.byWeekday" => Some(with_conn(state, req, by_weekday)),
        "attendance.byBimester" => Some(with_conn(state, req, by_bimester)),
        "attendance.topStudents" => Some(with_conn(state, req, top_students)),
        _ => None,
    }
}
