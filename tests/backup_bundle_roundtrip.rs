use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
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

fn raw_request(
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

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = raw_request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn file_sha256(path: &Path) -> String {
    let mut f = std::fs::File::open(path).expect("open file for hashing");
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf).expect("read file for hashing");
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    format!("{:x}", hasher.finalize())
}

fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "seed-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        stdin,
        reader,
        "seed-2",
        "students.create",
        json!({
            "grNumber": "GR-5001",
            "firstName": "Asha",
            "lastName": "Patel",
            "standard": "5"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "seed-3",
        "results.upload",
        json!({
            "studentId": student_id,
            "examName": "Unit Test 1",
            "published": true,
            "subjects": [{ "name": "Math", "obtainedMarks": 45, "maxMarks": 50 }]
        }),
    );
    student_id
}

#[test]
fn export_manifest_checksum_and_reimport() {
    let ws1 = temp_dir("resultportal-backup-src");
    let ws2 = temp_dir("resultportal-backup-dst");
    let bundle = ws1.join("portal.rpbackup.zip");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, &ws1);

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": ws1.to_string_lossy(),
            "outPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("resultportal-workspace-v1")
    );
    assert_eq!(exported.get("entryCount").and_then(|v| v.as_i64()), Some(3));
    let reported_sha = exported
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .expect("dbSha256")
        .to_string();
    assert_eq!(reported_sha.len(), 64);
    assert_eq!(reported_sha, file_sha256(&ws1.join("resultportal.sqlite3")));

    // The manifest inside the bundle carries the same checksum.
    let bundle_file = std::fs::File::open(&bundle).expect("open bundle");
    let mut archive = zip::ZipArchive::new(bundle_file).expect("read bundle zip");
    let mut manifest_text = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest_text)
        .expect("read manifest");
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).expect("parse manifest");
    assert_eq!(
        manifest.get("format").and_then(|v| v.as_str()),
        Some("resultportal-workspace-v1")
    );
    assert_eq!(
        manifest.get("dbSha256").and_then(|v| v.as_str()),
        Some(reported_sha.as_str())
    );

    // Importing into a fresh workspace brings the data along.
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": ws2.to_string_lossy(),
            "inPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(
        imported.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("resultportal-workspace-v1")
    );
    let looked_up = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.lookupByGr",
        json!({ "grNumber": "GR-5001" }),
    );
    assert!(looked_up.get("student").is_some());
}

#[test]
fn bare_sqlite_file_imports_as_legacy_backup() {
    let ws1 = temp_dir("resultportal-legacy-src");
    let ws3 = temp_dir("resultportal-legacy-dst");
    let loose_db = ws1.join("loose-copy.sqlite3");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, &ws1);
    std::fs::copy(ws1.join("resultportal.sqlite3"), &loose_db).expect("copy db");

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": ws3.to_string_lossy(),
            "inPath": loose_db.to_string_lossy()
        }),
    );
    assert_eq!(
        imported.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("legacy-sqlite3")
    );
    let looked_up = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.lookupByGr",
        json!({ "grNumber": "GR-5001" }),
    );
    assert!(looked_up.get("student").is_some());
}

#[test]
fn foreign_bundle_formats_are_rejected() {
    let ws = temp_dir("resultportal-foreign-bundle");
    let bad_bundle = ws.join("foreign.zip");

    // A zip that is not a portal bundle.
    {
        let f = std::fs::File::create(&bad_bundle).expect("create zip");
        let mut writer = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer
            .start_file("manifest.json", opts)
            .expect("start manifest");
        writer
            .write_all(br#"{ "format": "something-else" }"#)
            .expect("write manifest");
        writer.finish().expect("finish zip");
    }

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let response = raw_request(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": ws.to_string_lossy(),
            "inPath": bad_bundle.to_string_lossy()
        }),
    );
    assert_eq!(response.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        response
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("import_failed")
    );
}
