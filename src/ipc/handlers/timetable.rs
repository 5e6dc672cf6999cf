use crate::ipc::helpers::{get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SlotInput {
    day_of_week: i64,
    period: i64,
    subject: String,
    teacher_id: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

fn parse_time_opt(
    slot: &serde_json::Value,
    key: &str,
    idx: usize,
) -> Result<Option<String>, HandlerErr> {
    match slot.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("slots[{}].{} must be string or null", idx, key),
                ));
            };
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| {
                HandlerErr::new(
                    "bad_params",
                    format!("slots[{}].{} must be an HH:MM time", idx, key),
                )
            })?;
            Ok(Some(s.trim().to_string()))
        }
    }
}

fn parse_slots(params: &serde_json::Value) -> Result<Vec<SlotInput>, HandlerErr> {
    let Some(raw) = params.get("slots").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing slots"));
    };

    let mut slots: Vec<SlotInput> = Vec::with_capacity(raw.len());
    let mut seen: HashSet<(i64, i64)> = HashSet::new();
    for (i, slot) in raw.iter().enumerate() {
        let day_of_week = slot
            .get("dayOfWeek")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("slots[{}] missing dayOfWeek", i))
            })?;
        if !(1..=7).contains(&day_of_week) {
            return Err(HandlerErr::new(
                "bad_params",
                format!("slots[{}].dayOfWeek must be 1-7", i),
            ));
        }
        let period = slot
            .get("period")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr::new("bad_params", format!("slots[{}] missing period", i)))?;
        if period < 1 {
            return Err(HandlerErr::new(
                "bad_params",
                format!("slots[{}].period must be >= 1", i),
            ));
        }
        let subject = slot
            .get("subject")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("slots[{}] missing subject", i))
            })?;
        let teacher_id = match slot.get("teacherId") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => Some(
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        HandlerErr::new(
                            "bad_params",
                            format!("slots[{}].teacherId must be string or null", i),
                        )
                    })?,
            ),
        };
        let start_time = parse_time_opt(slot, "startTime", i)?;
        let end_time = parse_time_opt(slot, "endTime", i)?;

        if !seen.insert((day_of_week, period)) {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!(
                    "duplicate slot for day {} period {}",
                    day_of_week, period
                ),
                json!({ "dayOfWeek": day_of_week, "period": period }),
            ));
        }

        slots.push(SlotInput {
            day_of_week,
            period,
            subject,
            teacher_id,
            start_time,
            end_time,
        });
    }
    Ok(slots)
}

fn timetable_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let standard = get_required_str(params, "standard")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, day_of_week, period, subject, teacher_id, start_time, end_time
             FROM timetable_slots
             WHERE standard = ?
             ORDER BY day_of_week, period",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let slots = stmt
        .query_map([&standard], |r| {
            let id: String = r.get(0)?;
            let day_of_week: i64 = r.get(1)?;
            let period: i64 = r.get(2)?;
            let subject: String = r.get(3)?;
            let teacher_id: Option<String> = r.get(4)?;
            let start_time: Option<String> = r.get(5)?;
            let end_time: Option<String> = r.get(6)?;
            Ok(json!({
                "id": id,
                "dayOfWeek": day_of_week,
                "period": period,
                "subject": subject,
                "teacherId": teacher_id,
                "startTime": start_time,
                "endTime": end_time
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "standard": standard, "slots": slots }))
}

fn timetable_save(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let standard = get_required_str(params, "standard")?.trim().to_string();
    if standard.is_empty() {
        return Err(HandlerErr::new("bad_params", "standard must not be empty"));
    }
    let slots = parse_slots(params)?;

    for (i, slot) in slots.iter().enumerate() {
        if let Some(teacher_id) = &slot.teacher_id {
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
            if exists.is_none() {
                return Err(HandlerErr::new(
                    "not_found",
                    format!("slots[{}].teacherId does not match a teacher", i),
                ));
            }
        }
    }

    // Whole-standard replace keeps the saved grid exactly what the caller sent.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM timetable_slots WHERE standard = ?", [&standard])
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "timetable_slots" }),
            )
        })?;
    for slot in &slots {
        let slot_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO timetable_slots(id, standard, day_of_week, period, subject, teacher_id, start_time, end_time)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &slot_id,
                &standard,
                slot.day_of_week,
                slot.period,
                &slot.subject,
                &slot.teacher_id,
                &slot.start_time,
                &slot.end_time,
            ),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "timetable_slots" }),
            )
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "standard": standard, "slotCount": slots.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.get" => Some(with_db(state, req, timetable_get)),
        "timetable.save" => Some(with_db(state, req, timetable_save)),
        _ => None,
    }
}
