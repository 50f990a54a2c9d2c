use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, active
             FROM students
             WHERE class_id = ?
             ORDER BY name",
        )
        .map_err(HandlerErr::db)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let active: i64 = r.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, name, active) VALUES(?, ?, ?, 1)",
        (&student_id, &class_id, &name),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id, "name": name }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    if let Some(name) = params.get("name").and_then(|v| v.as_str()) {
        let name = name.trim();
        if name.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE students SET name = ? WHERE id = ?",
            (name, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    }
    if let Some(active) = params.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn students_history(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let current: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(current_class_id) = current else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT year, class_id FROM student_class_history
             WHERE student_id = ?
             ORDER BY year",
        )
        .map_err(HandlerErr::db)?;
    let entries = stmt
        .query_map([&student_id], |r| {
            let year: i64 = r.get(0)?;
            let class_id: String = r.get(1)?;
            Ok(json!({ "year": year, "classId": class_id }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "currentClassId": current_class_id,
        "history": entries
    }))
}

// Promotion/transfer: the year being closed keeps pointing at the old class
// through the history map, the student moves to the new class, and
// grade/attendance rows are copied under the new class id.
fn students_promote(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let to_class_id = get_required_str(params, "toClassId")?;
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing year".to_string(),
            details: None,
        })?;

    let from_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(from_class_id) = from_class else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };
    if !class_exists(conn, &to_class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "target class not found".to_string(),
            details: None,
        });
    }
    if from_class_id == to_class_id {
        return Err(HandlerErr {
            code: "bad_params",
            message: "student is already in the target class".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    tx.execute(
        "INSERT INTO student_class_history(student_id, year, class_id)
         VALUES(?, ?, ?)
         ON CONFLICT(student_id, year) DO UPDATE SET class_id = excluded.class_id",
        (&student_id, year, &from_class_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "student_class_history" })),
    })?;

    let copied_grades = copy_grades(&tx, &student_id, &from_class_id, &to_class_id)?;
    let copied_attendance = copy_attendance(&tx, &student_id, &from_class_id, &to_class_id)?;

    tx.execute(
        "UPDATE students SET class_id = ? WHERE id = ?",
        (&to_class_id, &student_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "fromClassId": from_class_id,
        "toClassId": to_class_id,
        "year": year,
        "copiedGrades": copied_grades,
        "copiedAttendance": copied_attendance
    }))
}

fn copy_grades(
    conn: &Connection,
    student_id: &str,
    from_class_id: &str,
    to_class_id: &str,
) -> Result<usize, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT subject_id, bimester, partial_score, global_score,
                    participation_score, recovery_score, submitted_at, student_name
             FROM grades
             WHERE student_id = ? AND class_id = ?",
        )
        .map_err(HandlerErr::db)?;
    type GradeRow = (
        String,
        String,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        String,
        Option<String>,
    );
    let rows: Vec<GradeRow> = stmt
        .query_map((student_id, from_class_id), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let count = rows.len();
    for (subject_id, bimester, partial, global, participation, recovery, submitted_at, name) in rows
    {
        conn.execute(
            "INSERT INTO grades(id, student_id, class_id, subject_id, bimester,
                                partial_score, global_score, participation_score,
                                recovery_score, submitted_at, student_name)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                student_id,
                to_class_id,
                subject_id,
                bimester,
                partial,
                global,
                participation,
                recovery,
                submitted_at,
                name,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grades" })),
        })?;
    }
    Ok(count)
}

fn copy_attendance(
    conn: &Connection,
    student_id: &str,
    from_class_id: &str,
    to_class_id: &str,
) -> Result<usize, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT subject_id, date, present, teacher_id, justification
             FROM attendance
             WHERE student_id = ? AND class_id = ?",
        )
        .map_err(HandlerErr::db)?;
    type RollRow = (String, String, Option<i64>, Option<String>, Option<String>);
    let rows: Vec<RollRow> = stmt
        .query_map((student_id, from_class_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let count = rows.len();
    for (subject_id, date, present, teacher_id, justification) in rows {
        // Re-running a transfer must not clobber records already living
        // under the new class id.
        conn.execute(
            "INSERT OR IGNORE INTO attendance(id, class_id, subject_id, date, student_id,
                                              present, teacher_id, justification)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                to_class_id,
                subject_id,
                date,
                student_id,
                present,
                teacher_id,
                justification,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
    }
    Ok(count)
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
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.history" => Some(with_conn(state, req, students_history)),
        "students.promote" => Some(with_conn(state, req, students_promote)),
        _ => None,
    }
}
