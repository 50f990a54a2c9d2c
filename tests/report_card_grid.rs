use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn save_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    class_id: &str,
    subject_id: &str,
    bimester: &str,
    partial: f64,
    global: f64,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "grades.save",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "subjectId": subject_id,
            "bimester": bimester,
            "partialScore": partial,
            "globalScore": global
        }),
    );
}

#[test]
fn report_card_is_a_subject_by_bimester_grid() {
    let workspace = temp_dir("classbook-report-card");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "7º Ano B", "schoolYear": 2025 }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "classId": class_id, "name": "Bruno Lima" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let mat = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "subjects.create",
        json!({ "code": "MAT1", "name": "Matemática" }),
    );
    let mat_id = mat["subject"]["id"].as_str().expect("subject id").to_string();
    let por = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "subjects.create",
        json!({ "code": "POR1", "name": "Português" }),
    );
    let por_id = por["subject"]["id"].as_str().expect("subject id").to_string();

    save_grade(&mut stdin, &mut reader, "g1", &student_id, &class_id, &mat_id, "1º Bimestre", 8.0, 8.0);
    save_grade(&mut stdin, &mut reader, "g2", &student_id, &class_id, &mat_id, "2º Bimestre", 9.0, 9.0);
    save_grade(&mut stdin, &mut reader, "g3", &student_id, &class_id, &por_id, "1º Bimestre", 6.0, 6.0);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.reportCard",
        json!({ "studentId": student_id, "year": 2025 }),
    );
    assert_eq!(res["classId"].as_str(), Some(class_id.as_str()));
    let card = &res["reportCard"];
    assert_eq!(
        card["bimesters"].as_array().map(|a| a.len()),
        Some(4),
        "the bimester axis always carries all four labels"
    );
    let subjects: Vec<&str> = card["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(subjects, vec!["Matemática", "Português"]);
    assert_eq!(
        card["grid"]["1º Bimestre"]["Matemática"]["finalGrade"].as_f64(),
        Some(8.0)
    );
    assert_eq!(
        card["grid"]["2º Bimestre"]["Matemática"]["finalGrade"].as_f64(),
        Some(9.0)
    );
    assert_eq!(
        card["grid"]["1º Bimestre"]["Português"]["finalGrade"].as_f64(),
        Some(6.0)
    );
    // Empty cells are simply absent; bimesters without data are empty rows.
    assert!(card["grid"]["2º Bimestre"]["Português"].is_null());
    assert_eq!(
        card["grid"]["3º Bimestre"]
            .as_object()
            .map(|o| o.is_empty()),
        Some(true)
    );
}

#[test]
fn report_card_without_grades_is_null() {
    let workspace = temp_dir("classbook-report-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "8º Ano C", "schoolYear": 2025 }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "classId": class_id, "name": "Carla Dias" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.reportCard",
        json!({ "studentId": student_id, "year": 2025 }),
    );
    assert!(res["reportCard"].is_null(), "no grades means no boletim: {}", res);
}

#[test]
fn year_summary_averages_subjects_then_the_student() {
    let workspace = temp_dir("classbook-year-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "9º Ano A", "schoolYear": 2025 }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "classId": class_id, "name": "Davi Nunes" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let mat = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "subjects.create",
        json!({ "code": "MAT1", "name": "Matemática" }),
    );
    let mat_id = mat["subject"]["id"].as_str().expect("subject id").to_string();
    let por = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "subjects.create",
        json!({ "code": "POR1", "name": "Português" }),
    );
    let por_id = por["subject"]["id"].as_str().expect("subject id").to_string();

    // Matemática scores 9 in every bimester -> subject average 9.0.
    for (i, bim) in ["1º Bimestre", "2º Bimestre", "3º Bimestre", "4º Bimestre"]
        .iter()
        .enumerate()
    {
        save_grade(
            &mut stdin,
            &mut reader,
            &format!("gm{}", i),
            &student_id,
            &class_id,
            &mat_id,
            bim,
            9.0,
            9.0,
        );
    }
    // Português only has two bimesters: (7 + 9) / 2 = 8.0, gaps skipped.
    save_grade(&mut stdin, &mut reader, "gp1", &student_id, &class_id, &por_id, "1º Bimestre", 7.0, 7.0);
    save_grade(&mut stdin, &mut reader, "gp3", &student_id, &class_id, &por_id, "3º Bimestre", 9.0, 9.0);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "y1",
        "reports.yearSummary",
        json!({ "studentId": student_id, "year": 2025 }),
    );
    let subjects = res["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    let mat_row = subjects
        .iter()
        .find(|s| s["name"].as_str() == Some("Matemática"))
        .expect("mat row");
    assert_eq!(mat_row["average"].as_f64(), Some(9.0));
    let por_row = subjects
        .iter()
        .find(|s| s["name"].as_str() == Some("Português"))
        .expect("por row");
    assert_eq!(por_row["average"].as_f64(), Some(8.0));
    assert!(por_row["perBimester"][1].is_null());

    // Overall: average of the subject averages, (9 + 8) / 2 = 8.5.
    assert_eq!(res["overall"].as_f64(), Some(8.5));
}
