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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

#[test]
fn health_unknown_method_and_workspace_gating() {
    let workspace = temp_dir("classbook-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));
    let version = health["result"]["version"].as_str().expect("version");
    assert!(!version.is_empty());
    assert!(health["result"]["workspacePath"].is_null());

    // Data methods refuse to run before a workspace is selected.
    let gated = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.list",
        json!({}),
    );
    assert_eq!(gated.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        gated["error"]["code"].as_str(),
        Some("no_workspace"),
        "unexpected: {}",
        gated
    );

    let unknown = request(&mut stdin, &mut reader, "3", "nope.nothing", json!({}));
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_implemented"));

    let selected = request(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected.get("ok").and_then(|v| v.as_bool()), Some(true));

    let health2 = request(&mut stdin, &mut reader, "5", "health", json!({}));
    assert!(health2["result"]["workspacePath"]
        .as_str()
        .expect("workspace path after select")
        .contains("classbook-smoke"));

    // Classes list is usable immediately on a fresh workspace.
    let classes = request(&mut stdin, &mut reader, "6", "classes.list", json!({}));
    assert_eq!(classes["result"]["classes"].as_array().map(|a| a.len()), Some(0));
}
