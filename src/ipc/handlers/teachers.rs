use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_required_str, now_rfc3339, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teacher_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let first_name: String = row.get(1)?;
    let last_name: String = row.get(2)?;
    let subject: Option<String> = row.get(3)?;
    let phone: Option<String> = row.get(4)?;
    let is_admin: i64 = row.get(5)?;
    let active: i64 = row.get(6)?;
    Ok(json!({
        "id": id,
        "firstName": first_name,
        "lastName": last_name,
        "displayName": format!("{}, {}", last_name, first_name),
        "subject": subject,
        "phone": phone,
        "isAdmin": is_admin != 0,
        "active": active != 0
    }))
}

fn teachers_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, first_name, last_name, subject, phone, is_admin, active
             FROM teachers
             ORDER BY last_name, first_name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let teachers = stmt
        .query_map([], teacher_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "firstName and lastName must not be empty",
        ));
    }
    let subject = get_opt_str(params, "subject")?;
    let phone = get_opt_str(params, "phone")?;
    let is_admin = get_opt_bool(params, "isAdmin", false)?;
    let active = get_opt_bool(params, "active", true)?;

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, first_name, last_name, subject, phone, is_admin, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &first_name,
            &last_name,
            &subject,
            &phone,
            is_admin as i64,
            active as i64,
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "teachers" }))
    })?;

    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let Some(patch) = params.get("patch") else {
        return Err(HandlerErr::new("bad_params", "missing patch"));
    };
    if !patch.is_object() {
        return Err(HandlerErr::new("bad_params", "patch must be an object"));
    }

    let row = conn
        .query_row(
            "SELECT first_name, last_name, subject, phone, is_admin, active
             FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((mut first_name, mut last_name, mut subject, mut phone, mut is_admin, mut active)) =
        row
    else {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    };

    if let Some(v) = get_opt_str(patch, "firstName")? {
        first_name = v.trim().to_string();
    }
    if let Some(v) = get_opt_str(patch, "lastName")? {
        last_name = v.trim().to_string();
    }
    if patch.get("subject").is_some() {
        subject = get_opt_str(patch, "subject")?;
    }
    if patch.get("phone").is_some() {
        phone = get_opt_str(patch, "phone")?;
    }
    if let Some(v) = patch.get("isAdmin") {
        if !v.is_null() {
            is_admin = v
                .as_bool()
                .ok_or_else(|| HandlerErr::new("bad_params", "isAdmin must be a boolean"))?
                as i64;
        }
    }
    if let Some(v) = patch.get("active") {
        if !v.is_null() {
            active = v
                .as_bool()
                .ok_or_else(|| HandlerErr::new("bad_params", "active must be a boolean"))?
                as i64;
        }
    }

    if first_name.is_empty() || last_name.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "firstName and lastName must not be empty",
        ));
    }

    conn.execute(
        "UPDATE teachers
         SET first_name = ?, last_name = ?, subject = ?, phone = ?, is_admin = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            &first_name,
            &last_name,
            &subject,
            &phone,
            is_admin,
            active,
            now_rfc3339(),
            &teacher_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "teachers" }))
    })?;

    Ok(json!({ "ok": true }))
}

fn teachers_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Uploaded results and timetable slots outlive the teacher record;
    // just detach the references.
    tx.execute(
        "UPDATE results SET created_by = NULL WHERE created_by = ?",
        [&teacher_id],
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "results" }))
    })?;
    tx.execute(
        "UPDATE timetable_slots SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_update_failed",
            e.to_string(),
            json!({ "table": "timetable_slots" }),
        )
    })?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": "teachers" }))
        })?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_db(state, req, teachers_list)),
        "teachers.create" => Some(with_db(state, req, teachers_create)),
        "teachers.update" => Some(with_db(state, req, teachers_update)),
        "teachers.delete" => Some(with_db(state, req, teachers_delete)),
        _ => None,
    }
}
