use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{compute_result_summary, SubjectMark};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn workspace_param(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<PathBuf, HandlerErr> {
    if let Some(p) = params.get("workspacePath").and_then(|v| v.as_str()) {
        return Ok(PathBuf::from(p));
    }
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match workspace_param(state, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match workspace_param(state, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let in_path = match get_required_str(&req.params, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    // Release the handle on the database we are about to replace.
    if state.workspace.as_deref() == Some(workspace.as_path()) {
        state.db = None;
    }

    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "import_failed", format!("{e:#}"), None),
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.workspace = Some(workspace.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "bundleFormatDetected": summary.bundle_format_detected,
                    "workspacePath": workspace.to_string_lossy()
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn exchange_export_results_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let standard = get_required_str(params, "standard")?;
    let exam_name = get_required_str(params, "examName")?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);

    let mut students_stmt = conn
        .prepare(
            "SELECT id, gr_number, last_name, first_name
             FROM students
             WHERE standard = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let students = students_stmt
        .query_map([&standard], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut subjects_stmt = conn
        .prepare(
            "SELECT name, obtained_marks, max_marks
             FROM result_subjects
             WHERE result_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut csv = String::from(
        "grNumber,student,examName,subject,obtainedMarks,maxMarks,totalObtained,totalMax,percentage,grade\n",
    );
    let mut row_count = 0_usize;
    let mut skipped = 0_usize;

    for (student_id, gr_number, last_name, first_name) in students {
        let result_id: Option<String> = conn
            .query_row(
                "SELECT id FROM results WHERE student_id = ? AND exam_name = ?",
                (&student_id, &exam_name),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        let Some(result_id) = result_id else {
            continue;
        };

        let rows = subjects_stmt
            .query_map([&result_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

        let marks: Vec<SubjectMark> = rows
            .iter()
            .map(|(name, obtained, max)| SubjectMark {
                name: name.clone(),
                obtained_marks: *obtained,
                max_marks: Some(*max),
            })
            .collect();
        let summary = match compute_result_summary(&marks) {
            Ok(v) => v,
            Err(_) => {
                // Rows that no longer validate are left out rather than
                // exported with a made-up score.
                skipped += 1;
                continue;
            }
        };

        let display_name = format!("{}, {}", last_name, first_name);
        for (name, obtained, max) in &rows {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{:.2},{}\n",
                csv_quote(&gr_number),
                csv_quote(&display_name),
                csv_quote(&exam_name),
                csv_quote(name),
                obtained,
                max,
                summary.total_obtained,
                summary.total_max,
                summary.percentage,
                summary.grade.as_str()
            ));
            row_count += 1;
        }
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;
    }
    let mut f = std::fs::File::create(&out_path)
        .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;
    f.write_all(csv.as_bytes())
        .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;

    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "rowCount": row_count,
        "skippedStudents": skipped
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import(state, req)),
        "exchange.exportResultsCsv" => Some(with_db(state, req, exchange_export_results_csv)),
        _ => None,
    }
}
