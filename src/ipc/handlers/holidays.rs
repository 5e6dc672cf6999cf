use crate::ipc::helpers::{get_opt_str, get_required_str, parse_date_param, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn holiday_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let start_date: String = row.get(2)?;
    let end_date: String = row.get(3)?;
    let description: Option<String> = row.get(4)?;
    Ok(json!({
        "id": id,
        "name": name,
        "startDate": start_date,
        "endDate": end_date,
        "description": description
    }))
}

fn holidays_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year = match params.get("year") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_i64()
                .ok_or_else(|| HandlerErr::new("bad_params", "year must be an integer"))?,
        ),
    };

    let (sql, bind): (&str, Vec<String>) = match year {
        Some(y) => (
            "SELECT id, name, start_date, end_date, description
             FROM holidays
             WHERE substr(start_date, 1, 4) = ? OR substr(end_date, 1, 4) = ?
             ORDER BY start_date",
            vec![format!("{:04}", y), format!("{:04}", y)],
        ),
        None => (
            "SELECT id, name, start_date, end_date, description
             FROM holidays
             ORDER BY start_date",
            vec![],
        ),
    };

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let holidays = stmt
        .query_map(rusqlite::params_from_iter(bind), holiday_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "holidays": holidays }))
}

fn validated_range(
    params: &serde_json::Value,
) -> Result<(String, String), HandlerErr> {
    let start_raw = get_required_str(params, "startDate")?;
    let start = parse_date_param(&start_raw, "startDate")?;
    let end = match get_opt_str(params, "endDate")? {
        Some(raw) => parse_date_param(&raw, "endDate")?,
        None => start,
    };
    if end < start {
        return Err(HandlerErr::new(
            "bad_params",
            "endDate must not precede startDate",
        ));
    }
    Ok((
        start.format("%Y-%m-%d").to_string(),
        end.format("%Y-%m-%d").to_string(),
    ))
}

fn holidays_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let (start_date, end_date) = validated_range(params)?;
    let description = get_opt_str(params, "description")?;

    let holiday_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO holidays(id, name, start_date, end_date, description)
         VALUES(?, ?, ?, ?, ?)",
        (&holiday_id, &name, &start_date, &end_date, &description),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "holidays" }))
    })?;

    Ok(json!({ "holidayId": holiday_id }))
}

fn holidays_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let holiday_id = get_required_str(params, "holidayId")?;

    let row = conn
        .query_row(
            "SELECT name, start_date, end_date, description FROM holidays WHERE id = ?",
            [&holiday_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((mut name, mut start_date, mut end_date, mut description)) = row else {
        return Err(HandlerErr::new("not_found", "holiday not found"));
    };

    if let Some(v) = get_opt_str(params, "name")? {
        let t = v.trim().to_string();
        if t.is_empty() {
            return Err(HandlerErr::new("bad_params", "name must not be empty"));
        }
        name = t;
    }
    if let Some(v) = get_opt_str(params, "startDate")? {
        start_date = parse_date_param(&v, "startDate")?.format("%Y-%m-%d").to_string();
    }
    if let Some(v) = get_opt_str(params, "endDate")? {
        end_date = parse_date_param(&v, "endDate")?.format("%Y-%m-%d").to_string();
    }
    if end_date < start_date {
        return Err(HandlerErr::new(
            "bad_params",
            "endDate must not precede startDate",
        ));
    }
    if params.get("description").is_some() {
        description = get_opt_str(params, "description")?;
    }

    conn.execute(
        "UPDATE holidays SET name = ?, start_date = ?, end_date = ?, description = ? WHERE id = ?",
        (&name, &start_date, &end_date, &description, &holiday_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "holidays" }))
    })?;

    Ok(json!({ "ok": true }))
}

fn holidays_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let holiday_id = get_required_str(params, "holidayId")?;
    let changed = conn
        .execute("DELETE FROM holidays WHERE id = ?", [&holiday_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": "holidays" }))
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "holiday not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "holidays.list" => Some(with_db(state, req, holidays_list)),
        "holidays.create" => Some(with_db(state, req, holidays_create)),
        "holidays.update" => Some(with_db(state, req, holidays_update)),
        "holidays.delete" => Some(with_db(state, req, holidays_delete)),
        _ => None,
    }
}
