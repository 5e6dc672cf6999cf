use crate::ipc::helpers::{get_opt_str, get_required_str, parse_date_param, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::round_to_1_decimal;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct BasicStudent {
    id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
}

fn parse_status(raw: &str) -> Result<&'static str, HandlerErr> {
    match raw {
        "present" => Ok("present"),
        "absent" => Ok("absent"),
        "leave" => Ok("leave"),
        _ => Err(HandlerErr::new(
            "bad_params",
            "status must be present, absent, or leave",
        )),
    }
}

fn parse_month_key(month: &str) -> Result<(i32, u32), HandlerErr> {
    let t = month.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(HandlerErr::new("bad_params", "month must be YYYY-MM"));
    };
    let year = y
        .parse::<i32>()
        .map_err(|_| HandlerErr::new("bad_params", "month year must be numeric"))?;
    let month_num = m
        .parse::<u32>()
        .map_err(|_| HandlerErr::new("bad_params", "month must be YYYY-MM"))?;
    if !(1..=12).contains(&month_num) {
        return Err(HandlerErr::new(
            "bad_params",
            "month must be between 01 and 12",
        ));
    }
    Ok((year, month_num))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(first), Some(next)) => next.signed_duration_since(first).num_days() as u32,
        _ => 30,
    }
}

fn list_students_for_standard(
    conn: &Connection,
    standard: &str,
) -> Result<Vec<BasicStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE standard = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([standard], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(BasicStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn attendance_mark_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_str(params, "date")?;
    let date = parse_date_param(&date, "date")?.format("%Y-%m-%d").to_string();
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut applied = 0_i64;
    let mut skipped = 0_i64;
    for (i, entry) in entries.iter().enumerate() {
        let student_id = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("entries[{}] missing studentId", i))
            })?;
        let status_raw = entry
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("entries[{}] missing status", i))
            })?;
        let status = parse_status(status_raw)?;

        let exists = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
            .is_some();
        if !exists {
            skipped += 1;
            continue;
        }

        // Last write wins per (student, day).
        tx.execute(
            "INSERT INTO attendance_days(student_id, date, status)
             VALUES(?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               status = excluded.status",
            (student_id, &date, status),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_update_failed",
                e.to_string(),
                json!({ "table": "attendance_days" }),
            )
        })?;
        applied += 1;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "date": date, "applied": applied, "skipped": skipped }))
}

fn attendance_month_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let standard = get_required_str(params, "standard")?;
    let month_key = get_required_str(params, "month")?;
    let (year, month_num) = parse_month_key(&month_key)?;
    let days = days_in_month(year, month_num);
    let from = format!("{:04}-{:02}-01", year, month_num);
    let to = format!("{:04}-{:02}-{:02}", year, month_num, days);

    let students = list_students_for_standard(conn, &standard)?;

    let mut rows_json: Vec<serde_json::Value> = Vec::new();
    for s in &students {
        let mut stmt = conn
            .prepare(
                "SELECT date, status
                 FROM attendance_days
                 WHERE student_id = ? AND date >= ? AND date <= ?
                 ORDER BY date",
            )
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        let day_rows = stmt
            .query_map((&s.id, &from, &to), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

        let mut days_map: HashMap<String, String> = HashMap::new();
        let mut present = 0_i64;
        let mut absent = 0_i64;
        let mut leave = 0_i64;
        for (date, status) in day_rows {
            match status.as_str() {
                "present" => present += 1,
                "absent" => absent += 1,
                "leave" => leave += 1,
                _ => {}
            }
            days_map.insert(date, status);
        }

        rows_json.push(json!({
            "studentId": s.id,
            "days": days_map,
            "presentCount": present,
            "absentCount": absent,
            "leaveCount": leave
        }));
    }

    let students_json: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "displayName": s.display_name,
                "sortOrder": s.sort_order,
                "active": s.active
            })
        })
        .collect();

    Ok(json!({
        "standard": standard,
        "month": month_key,
        "daysInMonth": days,
        "students": students_json,
        "rows": rows_json
    }))
}

fn attendance_student_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let from = get_opt_str(params, "from")?;
    let to = get_opt_str(params, "to")?;
    if let Some(d) = &from {
        parse_date_param(d, "from")?;
    }
    if let Some(d) = &to {
        parse_date_param(d, "to")?;
    }

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let mut sql = String::from(
        "SELECT status, COUNT(*) FROM attendance_days WHERE student_id = ?",
    );
    let mut bind: Vec<String> = vec![student_id.clone()];
    if let Some(d) = &from {
        sql.push_str(" AND date >= ?");
        bind.push(d.clone());
    }
    if let Some(d) = &to {
        sql.push_str(" AND date <= ?");
        bind.push(d.clone());
    }
    sql.push_str(" GROUP BY status");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let counts = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut present = 0_i64;
    let mut absent = 0_i64;
    let mut leave = 0_i64;
    for (status, count) in counts {
        match status.as_str() {
            "present" => present = count,
            "absent" => absent = count,
            "leave" => leave = count,
            _ => {}
        }
    }
    let recorded = present + absent + leave;
    let percent_present = if recorded > 0 {
        round_to_1_decimal(100.0 * present as f64 / recorded as f64)
    } else {
        0.0
    };

    Ok(json!({
        "studentId": student_id,
        "presentCount": present,
        "absentCount": absent,
        "leaveCount": leave,
        "recordedDays": recorded,
        "percentPresent": percent_present
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.markDay" => Some(with_db(state, req, attendance_mark_day)),
        "attendance.monthOpen" => Some(with_db(state, req, attendance_month_open)),
        "attendance.studentSummary" => Some(with_db(state, req, attendance_student_summary)),
        _ => None,
    }
}
