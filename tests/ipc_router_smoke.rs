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
    let exe = env!("CARGO_BIN_EXE_resultportald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultportald");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultportal-router-smoke");
    let bundle_out = workspace.join("smoke-backup.rpbackup.zip");
    let csv_out = workspace.join("smoke-results.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "grNumber": "GR-9001",
            "firstName": "Smoke",
            "lastName": "Student",
            "standard": "5"
        }),
    );
    let student_id = created
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "standard": "5" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.lookupByGr",
        json!({ "grNumber": "GR-9001" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Updated" } }),
    );

    let teacher_created = request(
        &mut stdin,
        &mut reader,
        "7",
        "teachers.create",
        json!({ "firstName": "Smoke", "lastName": "Teacher", "subject": "Mathematics" }),
    );
    let teacher_id = teacher_created
        .get("result")
        .and_then(|v| v.get("teacherId"))
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "8", "teachers.list", json!({}));

    let uploaded = request(
        &mut stdin,
        &mut reader,
        "9",
        "results.upload",
        json!({
            "studentId": student_id,
            "examName": "Unit Test 1",
            "examDate": "2026-07-20",
            "createdBy": teacher_id,
            "subjects": [
                { "name": "Mathematics", "obtainedMarks": 45, "maxMarks": 50 },
                { "name": "Science", "obtainedMarks": 38, "maxMarks": 50 }
            ]
        }),
    );
    let result_id = uploaded
        .get("result")
        .and_then(|v| v.get("resultId"))
        .and_then(|v| v.as_str())
        .expect("resultId")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "results.get",
        json!({ "resultId": result_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "results.listForStudent",
        json!({ "studentId": student_id, "includeUnpublished": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "results.publish",
        json!({ "resultId": result_id, "published": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "results.classSummary",
        json!({ "standard": "5", "examName": "Unit Test 1" }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.markDay",
        json!({
            "date": "2026-07-21",
            "entries": [{ "studentId": student_id, "status": "present" }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.monthOpen",
        json!({ "standard": "5", "month": "2026-07" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.studentSummary",
        json!({ "studentId": student_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "holidays.create",
        json!({ "name": "Founders Day", "startDate": "2026-09-01" }),
    );
    let _ = request(&mut stdin, &mut reader, "18", "holidays.list", json!({}));

    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "timetable.save",
        json!({
            "standard": "5",
            "slots": [
                { "dayOfWeek": 1, "period": 1, "subject": "Mathematics", "teacherId": teacher_id }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "timetable.get",
        json!({ "standard": "5" }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "exchange.exportResultsCsv",
        json!({
            "standard": "5",
            "examName": "Unit Test 1",
            "outPath": csv_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "results.delete",
        json!({ "resultId": result_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
