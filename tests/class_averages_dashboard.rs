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

#[test]
fn classes_without_records_average_zero_not_null() {
    let workspace = temp_dir("classbook-dashboard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "6º Ano A", "schoolYear": 2025 }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let class_b = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "classes.create",
        json!({ "name": "6º Ano B", "schoolYear": 2025 }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "subjects.create",
        json!({ "code": "MAT1", "name": "Matemática" }),
    )["subject"]["id"]
        .as_str()
        .expect("subject id")
        .to_string();
    let other_subject = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "subjects.create",
        json!({ "code": "POR1", "name": "Português" }),
    )["subject"]["id"]
        .as_str()
        .expect("subject id")
        .to_string();

    let ana = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "classId": class_a, "name": "Ana Souza" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let bruno = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "students.create",
        json!({ "classId": class_a, "name": "Bruno Lima" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    // Finals 8.0 and 6.0 in Matemática, 10.0 in Português.
    for (i, (student, subject, score)) in [
        (&ana, &subject_id, 8.0),
        (&bruno, &subject_id, 6.0),
        (&ana, &other_subject, 10.0),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.save",
            json!({
                "studentId": student,
                "classId": class_a,
                "subjectId": subject,
                "bimester": "1º Bimestre",
                "partialScore": score,
                "globalScore": score
            }),
        );
    }

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "reports.classAverages",
        json!({ "classIds": [class_a, class_b] }),
    );
    let classes = res["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0]["classId"].as_str(), Some(class_a.as_str()));
    assert_eq!(classes[0]["average"].as_f64(), Some(8.0)); // (8 + 6 + 10) / 3
    assert_eq!(classes[1]["classId"].as_str(), Some(class_b.as_str()));
    assert_eq!(
        classes[1]["average"].as_f64(),
        Some(0.0),
        "dashboards plot 0 for empty classes, never null"
    );

    // Subject filter narrows the aggregate.
    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "d2",
        "reports.classAverages",
        json!({ "classIds": [class_a], "subjectId": subject_id }),
    );
    let classes = filtered["classes"].as_array().expect("classes");
    assert_eq!(classes[0]["average"].as_f64(), Some(7.0)); // (8 + 6) / 2
}
