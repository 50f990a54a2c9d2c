use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "classbook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            school_year INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_class_history(
            student_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            class_id TEXT NOT NULL,
            PRIMARY KEY(student_id, year),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_class_history_student
         ON student_class_history(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT
        )",
        [],
    )?;

    // teacher_id is an opaque string from the outer auth layer; no local table.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            UNIQUE(teacher_id, subject_id, class_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_class
         ON teaching_assignments(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_subject
         ON teaching_assignments(subject_id)",
        [],
    )?;

    // Append-only: re-submissions insert new rows and the read path keeps
    // the max-submitted_at row per (student, class, subject, bimester).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            bimester TEXT NOT NULL,
            partial_score REAL,
            global_score REAL,
            participation_score REAL,
            recovery_score REAL,
            submitted_at TEXT NOT NULL,
            student_name TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_grades_student_name(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student_class ON grades(student_id, class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class ON grades(class_id)",
        [],
    )?;

    // present: 1 = present, 0 = absent, NULL = not yet recorded.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            student_id TEXT NOT NULL,
            present INTEGER,
            teacher_id TEXT,
            justification TEXT,
            UNIQUE(class_id, subject_id, date, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_attendance_justification(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sheet
         ON attendance(class_id, subject_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class ON attendance(class_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_grades_student_name(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before the denormalized display name existed.
    if table_has_column(conn, "grades", "student_name")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN student_name TEXT", [])?;
    Ok(())
}

fn ensure_attendance_justification(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance", "justification")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance ADD COLUMN justification TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
