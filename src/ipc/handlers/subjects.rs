use crate::catalog::{self, Subject, TeachingLink};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

fn load_subjects(conn: &Connection) -> Result<Vec<Subject>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code, name, category FROM subjects ORDER BY name")
        .map_err(HandlerErr::db)?;
    stmt.query_map([], |r| {
        Ok(Subject {
            id: r.get(0)?,
            code: r.get(1)?,
            name: r.get(2)?,
            category: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn load_links(conn: &Connection) -> Result<Vec<TeachingLink>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, teacher_id, subject_id, class_id FROM teaching_assignments")
        .map_err(HandlerErr::db)?;
    stmt.query_map([], |r| {
        Ok(TeachingLink {
            id: r.get(0)?,
            teacher_id: r.get(1)?,
            subject_id: r.get(2)?,
            class_id: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn subject_json(s: &Subject) -> serde_json::Value {
    json!({
        "id": s.id,
        "code": s.code,
        "name": s.name,
        "category": s.category,
        "effectiveCategory": s.effective_category()
    })
}

fn subjects_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let search = params
        .get("search")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let category = params.get("category").and_then(|v| v.as_str());
    let page = params
        .get("page")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as usize;
    let page_size = params
        .get("pageSize")
        .and_then(|v| v.as_u64())
        .unwrap_or(20) as usize;
    if page_size == 0 {
        return Err(HandlerErr::bad("pageSize must be positive"));
    }

    let subjects = load_subjects(conn)?;
    let filtered = catalog::filter_subjects(&subjects, search, category);
    let total = filtered.len();
    let (total_pages, slice) = catalog::paginate(&filtered, page, page_size);

    Ok(json!({
        "total": total,
        "totalPages": total_pages,
        "page": page,
        "subjects": slice.iter().map(subject_json).collect::<Vec<_>>()
    }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?.trim().to_string();
    let name = get_required_str(params, "name")?.trim().to_string();
    if code.is_empty() || name.is_empty() {
        return Err(HandlerErr::bad("code and name must not be empty"));
    }
    let category = params
        .get("category")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let existing = load_subjects(conn)?;
    if catalog::is_duplicate(&existing, &name, category.as_deref(), None) {
        return Err(HandlerErr {
            code: "duplicate_subject",
            message: "a subject with this name and category already exists".to_string(),
            details: None,
        });
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, code, name, category) VALUES(?, ?, ?, ?)",
        (&subject_id, &code, &name, &category),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;

    let created = Subject {
        id: subject_id,
        code,
        name,
        category,
    };
    Ok(json!({ "subject": subject_json(&created) }))
}

fn subjects_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let existing = load_subjects(conn)?;
    let Some(current) = existing.iter().find(|s| s.id == subject_id).cloned() else {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    };

    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| current.name.clone());
    let code = params
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| current.code.clone());
    // An explicit null clears the stored override back to inference.
    let category = match params.get("category") {
        None => current.category.clone(),
        Some(v) if v.is_null() => None,
        Some(v) => v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    };

    if catalog::is_duplicate(&existing, &name, category.as_deref(), Some(&subject_id)) {
        return Err(HandlerErr {
            code: "duplicate_subject",
            message: "a subject with this name and category already exists".to_string(),
            details: None,
        });
    }

    conn.execute(
        "UPDATE subjects SET code = ?, name = ?, category = ? WHERE id = ?",
        (&code, &name, &category, &subject_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;

    let updated = Subject {
        id: subject_id,
        code,
        name,
        category,
    };
    Ok(json!({ "subject": subject_json(&updated) }))
}

fn subjects_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

    let grade_refs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    let attendance_refs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    if grade_refs > 0 || attendance_refs > 0 {
        return Err(HandlerErr {
            code: "subject_in_use",
            message: "subject has grade or attendance records".to_string(),
            details: Some(json!({
                "gradeCount": grade_refs,
                "attendanceCount": attendance_refs
            })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "DELETE FROM teaching_assignments WHERE subject_id = ?",
        [&subject_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "teaching_assignments" })),
    })?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subjects" })),
        })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn subjects_class_view(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_filter: Option<HashSet<String>> = match params.get("classIds") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(raw) = v.as_array() else {
                return Err(HandlerErr::bad("classIds must be an array of strings"));
            };
            let mut set = HashSet::new();
            for item in raw {
                let Some(id) = item.as_str() else {
                    return Err(HandlerErr::bad("classIds must contain only strings"));
                };
                set.insert(id.to_string());
            }
            Some(set)
        }
    };

    let subjects = load_subjects(conn)?;
    let links = load_links(conn)?;
    let rows = catalog::class_join_view(&subjects, &links, class_filter.as_ref());
    let rows_json = rows
        .iter()
        .map(|r| serde_json::to_value(r).unwrap_or_default())
        .collect::<Vec<_>>();

    Ok(json!({ "rows": rows_json }))
}

fn assignments_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = get_required_str(params, "classId")?;

    let subject_exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    let class_exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !subject_exists || !class_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject or class not found".to_string(),
            details: None,
        });
    }

    let link_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teaching_assignments(id, teacher_id, subject_id, class_id)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(teacher_id, subject_id, class_id) DO NOTHING",
        (&link_id, &teacher_id, &subject_id, &class_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "teaching_assignments" })),
    })?;

    Ok(json!({ "assignmentId": link_id }))
}

fn assignments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let links = load_links(conn)?;
    let rows: Vec<serde_json::Value> = links
        .iter()
        .filter(|l| class_id.map(|c| l.class_id == c).unwrap_or(true))
        .map(|l| {
            json!({
                "id": l.id,
                "teacherId": l.teacher_id,
                "subjectId": l.subject_id,
                "classId": l.class_id
            })
        })
        .collect();
    Ok(json!({ "assignments": rows }))
}

fn assignments_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let changed = conn
        .execute(
            "DELETE FROM teaching_assignments WHERE id = ?",
            [&assignment_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "teaching_assignments" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "assignment not found".to_string(),
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
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.update" => Some(with_conn(state, req, subjects_update)),
        "subjects.delete" => Some(with_conn(state, req, subjects_delete)),
        "subjects.classView" => Some(with_conn(state, req, subjects_class_view)),
        "assignments.create" => Some(with_conn(state, req, assignments_create)),
        "assignments.list" => Some(with_conn(state, req, assignments_list)),
        "assignments.delete" => Some(with_conn(state, req, assignments_delete)),
        _ => None,
    }
}
