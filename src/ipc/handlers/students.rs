use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_required_str, now_rfc3339, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let gr_number: String = row.get(1)?;
    let first_name: String = row.get(2)?;
    let last_name: String = row.get(3)?;
    let standard: String = row.get(4)?;
    let roll_no: Option<String> = row.get(5)?;
    let guardian_name: Option<String> = row.get(6)?;
    let phone: Option<String> = row.get(7)?;
    let active: i64 = row.get(8)?;
    let sort_order: i64 = row.get(9)?;
    Ok(json!({
        "id": id,
        "grNumber": gr_number,
        "firstName": first_name,
        "lastName": last_name,
        "displayName": format!("{}, {}", last_name, first_name),
        "standard": standard,
        "rollNo": roll_no,
        "guardianName": guardian_name,
        "phone": phone,
        "active": active != 0,
        "sortOrder": sort_order
    }))
}

const STUDENT_COLUMNS: &str = "id, gr_number, first_name, last_name, standard, roll_no, guardian_name, phone, active, sort_order";

fn gr_number_taken(
    conn: &Connection,
    gr_number: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE gr_number = ?",
            [gr_number],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(match existing {
        Some(id) => exclude_id != Some(id.as_str()),
        None => false,
    })
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let standard = get_opt_str(params, "standard")?;

    let (sql, bind): (String, Vec<String>) = match &standard {
        Some(s) => (
            format!(
                "SELECT {} FROM students WHERE standard = ? ORDER BY sort_order",
                STUDENT_COLUMNS
            ),
            vec![s.clone()],
        ),
        None => (
            format!(
                "SELECT {} FROM students ORDER BY standard, sort_order",
                STUDENT_COLUMNS
            ),
            vec![],
        ),
    };

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(bind), student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let gr_number = get_required_str(params, "grNumber")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let standard = get_required_str(params, "standard")?.trim().to_string();
    if gr_number.is_empty() || first_name.is_empty() || last_name.is_empty() || standard.is_empty()
    {
        return Err(HandlerErr::new(
            "bad_params",
            "grNumber, firstName, lastName, and standard must not be empty",
        ));
    }
    let roll_no = get_opt_str(params, "rollNo")?;
    let guardian_name = get_opt_str(params, "guardianName")?;
    let phone = get_opt_str(params, "phone")?;
    let active = get_opt_bool(params, "active", true)?;

    if gr_number_taken(conn, &gr_number, None)? {
        return Err(HandlerErr::with_details(
            "duplicate_gr_number",
            format!("GR number {} is already registered", gr_number),
            json!({ "grNumber": gr_number }),
        ));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE standard = ?",
            [&standard],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, gr_number, first_name, last_name, standard, roll_no, guardian_name, phone, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &gr_number,
            &first_name,
            &last_name,
            &standard,
            &roll_no,
            &guardian_name,
            &phone,
            active as i64,
            sort_order,
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student_id, "grNumber": gr_number }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch") else {
        return Err(HandlerErr::new("bad_params", "missing patch"));
    };
    if !patch.is_object() {
        return Err(HandlerErr::new("bad_params", "patch must be an object"));
    }

    let row = conn
        .query_row(
            &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((
        mut gr_number,
        mut first_name,
        mut last_name,
        mut standard,
        mut roll_no,
        mut guardian_name,
        mut phone,
        mut active,
    )) = row
    else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    if let Some(v) = get_opt_str(patch, "grNumber")? {
        gr_number = v.trim().to_string();
    }
    if let Some(v) = get_opt_str(patch, "firstName")? {
        first_name = v.trim().to_string();
    }
    if let Some(v) = get_opt_str(patch, "lastName")? {
        last_name = v.trim().to_string();
    }
    if let Some(v) = get_opt_str(patch, "standard")? {
        standard = v.trim().to_string();
    }
    if patch.get("rollNo").is_some() {
        roll_no = get_opt_str(patch, "rollNo")?;
    }
    if patch.get("guardianName").is_some() {
        guardian_name = get_opt_str(patch, "guardianName")?;
    }
    if patch.get("phone").is_some() {
        phone = get_opt_str(patch, "phone")?;
    }
    if let Some(v) = patch.get("active") {
        if !v.is_null() {
            active = v
                .as_bool()
                .ok_or_else(|| HandlerErr::new("bad_params", "active must be a boolean"))?
                as i64;
        }
    }

    if gr_number.is_empty() || first_name.is_empty() || last_name.is_empty() || standard.is_empty()
    {
        return Err(HandlerErr::new(
            "bad_params",
            "grNumber, firstName, lastName, and standard must not be empty",
        ));
    }
    if gr_number_taken(conn, &gr_number, Some(&student_id))? {
        return Err(HandlerErr::with_details(
            "duplicate_gr_number",
            format!("GR number {} is already registered", gr_number),
            json!({ "grNumber": gr_number }),
        ));
    }

    conn.execute(
        "UPDATE students
         SET gr_number = ?, first_name = ?, last_name = ?, standard = ?, roll_no = ?, guardian_name = ?, phone = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            &gr_number,
            &first_name,
            &last_name,
            &standard,
            &roll_no,
            &guardian_name,
            &phone,
            active,
            now_rfc3339(),
            &student_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    Ok(json!({ "ok": true }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    tx.execute(
        "DELETE FROM result_subjects
         WHERE result_id IN (SELECT id FROM results WHERE student_id = ?)",
        [&student_id],
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "result_subjects" }),
        )
    })?;
    tx.execute("DELETE FROM results WHERE student_id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": "results" }))
        })?;
    tx.execute(
        "DELETE FROM attendance_days WHERE student_id = ?",
        [&student_id],
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "attendance_days" }),
        )
    })?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": "students" }))
        })?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn students_lookup_by_gr(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let gr_number = get_required_str(params, "grNumber")?.trim().to_string();

    let student = conn
        .query_row(
            &format!("SELECT {} FROM students WHERE gr_number = ?", STUDENT_COLUMNS),
            [&gr_number],
            student_json,
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    match student {
        Some(s) => Ok(json!({ "student": s })),
        None => Err(HandlerErr::with_details(
            "not_found",
            format!("no student registered under GR number {}", gr_number),
            json!({ "grNumber": gr_number }),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_db(state, req, students_list)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.update" => Some(with_db(state, req, students_update)),
        "students.delete" => Some(with_db(state, req, students_delete)),
        "students.lookupByGr" => Some(with_db(state, req, students_lookup_by_gr)),
        _ => None,
    }
}
