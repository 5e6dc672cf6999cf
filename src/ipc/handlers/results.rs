use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_required_str, now_rfc3339, parse_date_param, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{
    compute_median, compute_result_summary, round_to_1_decimal, Grade, ResultSummary, SubjectMark,
};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn summary_json(summary: &ResultSummary) -> serde_json::Value {
    json!({
        "totalObtained": summary.total_obtained,
        "totalMax": summary.total_max,
        "percentage": summary.percentage,
        "grade": summary.grade.as_str()
    })
}

/// Parses and validates the `subjects` payload of an upload or correction.
/// Missing or non-numeric marks are an `invalid_input` error, never coerced
/// to zero; the scoring pass afterwards enforces the mark bounds.
fn parse_subjects(params: &serde_json::Value) -> Result<Vec<SubjectMark>, HandlerErr> {
    let Some(raw) = params.get("subjects") else {
        return Err(HandlerErr::new("bad_params", "missing subjects"));
    };
    if !raw.is_array() {
        return Err(HandlerErr::new("bad_params", "subjects must be an array"));
    }
    let subjects: Vec<SubjectMark> = serde_json::from_value(raw.clone()).map_err(|e| {
        HandlerErr::new("invalid_input", format!("invalid subject marks: {}", e))
    })?;
    if subjects.is_empty() {
        return Err(HandlerErr::new("bad_params", "subjects must not be empty"));
    }
    for (i, s) in subjects.iter().enumerate() {
        if s.name.trim().is_empty() {
            return Err(HandlerErr::new(
                "bad_params",
                format!("subjects[{}].name must not be empty", i),
            ));
        }
        if subjects[..i].iter().any(|prev| prev.name == s.name) {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!("duplicate subject '{}'", s.name),
                json!({ "subject": s.name }),
            ));
        }
    }
    Ok(subjects)
}

#[derive(Debug, Clone)]
struct StudentBrief {
    id: String,
    gr_number: String,
    display_name: String,
    standard: String,
    sort_order: i64,
    active: bool,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentBrief, HandlerErr> {
    conn.query_row(
        "SELECT id, gr_number, last_name, first_name, standard, sort_order, active
         FROM students WHERE id = ?",
        [student_id],
        |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentBrief {
                id: r.get(0)?,
                gr_number: r.get(1)?,
                display_name: format!("{}, {}", last, first),
                standard: r.get(4)?,
                sort_order: r.get(5)?,
                active: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
    .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

/// Stored subject rows for a result, in display order.
fn load_subject_rows(
    conn: &Connection,
    result_id: &str,
) -> Result<Vec<(String, f64, f64)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT name, obtained_marks, max_marks
             FROM result_subjects
             WHERE result_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([result_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, f64>(1)?,
            r.get::<_, f64>(2)?,
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn marks_from_rows(rows: &[(String, f64, f64)]) -> Vec<SubjectMark> {
    rows.iter()
        .map(|(name, obtained, max)| SubjectMark {
            name: name.clone(),
            obtained_marks: *obtained,
            max_marks: Some(*max),
        })
        .collect()
}

fn insert_subject_rows(
    tx: &rusqlite::Transaction<'_>,
    result_id: &str,
    subjects: &[SubjectMark],
) -> Result<(), HandlerErr> {
    for (i, s) in subjects.iter().enumerate() {
        let subject_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO result_subjects(id, result_id, name, obtained_marks, max_marks, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &subject_id,
                result_id,
                &s.name,
                s.obtained_marks,
                s.max_marks.unwrap_or(crate::scoring::DEFAULT_MAX_MARKS),
                i as i64,
            ),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "result_subjects" }),
            )
        })?;
    }
    Ok(())
}

fn results_upload(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_name = get_required_str(params, "examName")?.trim().to_string();
    if exam_name.is_empty() {
        return Err(HandlerErr::new("bad_params", "examName must not be empty"));
    }
    let exam_date = get_opt_str(params, "examDate")?;
    if let Some(d) = &exam_date {
        parse_date_param(d, "examDate")?;
    }
    let created_by = get_opt_str(params, "createdBy")?;
    let published = get_opt_bool(params, "published", false)?;

    let student = load_student(conn, &student_id)?;

    if let Some(teacher_id) = &created_by {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        if exists.is_none() {
            return Err(HandlerErr::new("not_found", "createdBy teacher not found"));
        }
    }

    // Validate before touching the database; a bad upload writes nothing.
    let subjects = parse_subjects(params)?;
    let summary = compute_result_summary(&subjects)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM results WHERE student_id = ? AND exam_name = ?",
            (&student.id, &exam_name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if let Some(id) = existing {
        return Err(HandlerErr::with_details(
            "duplicate_result",
            format!(
                "student already has a result for {}; use results.updateMarks",
                exam_name
            ),
            json!({ "resultId": id }),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let result_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO results(id, student_id, exam_name, exam_date, published, created_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &result_id,
            &student.id,
            &exam_name,
            &exam_date,
            published as i64,
            &created_by,
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "results" }))
    })?;
    insert_subject_rows(&tx, &result_id, &subjects)?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "resultId": result_id,
        "summary": summary_json(&summary)
    }))
}

fn results_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;

    let row = conn
        .query_row(
            "SELECT student_id, exam_name, exam_date, published, created_by
             FROM results WHERE id = ?",
            [&result_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((student_id, exam_name, exam_date, published, created_by)) = row else {
        return Err(HandlerErr::new("not_found", "result not found"));
    };

    let student = load_student(conn, &student_id)?;
    let rows = load_subject_rows(conn, &result_id)?;

    // Derived values are recomputed on every read; stored rows that no
    // longer validate surface as an error, not as a fabricated score.
    let summary = compute_result_summary(&marks_from_rows(&rows))?;

    let subjects: Vec<serde_json::Value> = rows
        .iter()
        .map(|(name, obtained, max)| {
            json!({ "name": name, "obtainedMarks": obtained, "maxMarks": max })
        })
        .collect();

    Ok(json!({
        "result": {
            "id": result_id,
            "studentId": student.id,
            "grNumber": student.gr_number,
            "studentName": student.display_name,
            "standard": student.standard,
            "examName": exam_name,
            "examDate": exam_date,
            "published": published != 0,
            "createdBy": created_by,
            "subjects": subjects,
            "summary": summary_json(&summary)
        }
    }))
}

fn results_list_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = match get_opt_str(params, "studentId")? {
        Some(id) => id,
        None => {
            let gr_number = get_opt_str(params, "grNumber")?.ok_or_else(|| {
                HandlerErr::new("bad_params", "missing studentId or grNumber")
            })?;
            conn.query_row(
                "SELECT id FROM students WHERE gr_number = ?",
                [gr_number.trim()],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
            .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?
        }
    };
    let include_unpublished = get_opt_bool(params, "includeUnpublished", false)?;

    let student = load_student(conn, &student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, exam_name, exam_date, published
             FROM results
             WHERE student_id = ? AND (published = 1 OR ? = 1)
             ORDER BY COALESCE(exam_date, ''), exam_name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((&student.id, include_unpublished as i64), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut results: Vec<serde_json::Value> = Vec::new();
    for (result_id, exam_name, exam_date, published) in rows {
        let subject_rows = load_subject_rows(conn, &result_id)?;
        let mut entry = json!({
            "resultId": result_id,
            "examName": exam_name,
            "examDate": exam_date,
            "published": published != 0,
        });
        match compute_result_summary(&marks_from_rows(&subject_rows)) {
            Ok(summary) => {
                entry["summary"] = summary_json(&summary);
                entry["dataUnavailable"] = json!(false);
            }
            Err(_) => {
                // The UI renders a "data unavailable" state for this row
                // instead of a fabricated 0%.
                entry["dataUnavailable"] = json!(true);
            }
        }
        results.push(entry);
    }

    Ok(json!({
        "studentId": student.id,
        "grNumber": student.gr_number,
        "studentName": student.display_name,
        "standard": student.standard,
        "results": results
    }))
}

fn results_update_marks(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM results WHERE id = ?", [&result_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "result not found"));
    }

    let subjects = parse_subjects(params)?;
    let summary = compute_result_summary(&subjects)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM result_subjects WHERE result_id = ?",
        [&result_id],
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "result_subjects" }),
        )
    })?;
    insert_subject_rows(&tx, &result_id, &subjects)?;
    tx.execute(
        "UPDATE results SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), &result_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "results" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "resultId": result_id,
        "summary": summary_json(&summary)
    }))
}

fn results_publish(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let published = params
        .get("published")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing published"))?;

    let changed = conn
        .execute(
            "UPDATE results SET published = ?, updated_at = ? WHERE id = ?",
            (published as i64, now_rfc3339(), &result_id),
        )
        .map_err(|e| {
            HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "results" }))
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "result not found"));
    }

    Ok(json!({ "resultId": result_id, "published": published }))
}

fn results_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM results WHERE id = ?", [&result_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "result not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM result_subjects WHERE result_id = ?",
        [&result_id],
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "result_subjects" }),
        )
    })?;
    tx.execute("DELETE FROM results WHERE id = ?", [&result_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": "results" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn results_class_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let standard = get_required_str(params, "standard")?;
    let exam_name = get_required_str(params, "examName")?;

    let mut students_stmt = conn
        .prepare(
            "SELECT id, gr_number, last_name, first_name, sort_order, active
             FROM students
             WHERE standard = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let students: Vec<StudentBrief> = students_stmt
        .query_map([&standard], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentBrief {
                id: r.get(0)?,
                gr_number: r.get(1)?,
                display_name: format!("{}, {}", last, first),
                standard: standard.clone(),
                sort_order: r.get(4)?,
                active: r.get::<_, i64>(5)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut per_student: Vec<serde_json::Value> = Vec::new();
    let mut percentages: Vec<f64> = Vec::new();
    let mut grade_counts: std::collections::BTreeMap<&'static str, i64> =
        [Grade::APlus, Grade::A, Grade::BPlus, Grade::B, Grade::C, Grade::D, Grade::F]
            .into_iter()
            .map(|g| (g.as_str(), 0))
            .collect();
    let mut result_count = 0_i64;
    let mut data_unavailable_count = 0_i64;

    for s in &students {
        let result_id: Option<String> = conn
            .query_row(
                "SELECT id FROM results WHERE student_id = ? AND exam_name = ?",
                (&s.id, &exam_name),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

        let mut entry = json!({
            "studentId": s.id,
            "grNumber": s.gr_number,
            "displayName": s.display_name,
            "sortOrder": s.sort_order,
            "active": s.active,
            "hasResult": result_id.is_some(),
            "dataUnavailable": false,
        });

        if let Some(result_id) = result_id {
            result_count += 1;
            entry["resultId"] = json!(result_id.as_str());
            let rows = load_subject_rows(conn, &result_id)?;
            match compute_result_summary(&marks_from_rows(&rows)) {
                Ok(summary) => {
                    entry["summary"] = summary_json(&summary);
                    // Class aggregates track active students only.
                    if s.active {
                        percentages.push(summary.percentage);
                        if let Some(c) = grade_counts.get_mut(summary.grade.as_str()) {
                            *c += 1;
                        }
                    }
                }
                Err(_) => {
                    data_unavailable_count += 1;
                    entry["dataUnavailable"] = json!(true);
                }
            }
        }

        per_student.push(entry);
    }

    let class_average = if percentages.is_empty() {
        0.0
    } else {
        round_to_1_decimal(percentages.iter().sum::<f64>() / percentages.len() as f64)
    };
    let class_median = round_to_1_decimal(compute_median(&percentages));

    let grade_counts_json: serde_json::Map<String, serde_json::Value> = grade_counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();

    Ok(json!({
        "standard": standard,
        "examName": exam_name,
        "perStudent": per_student,
        "resultCount": result_count,
        "dataUnavailableCount": data_unavailable_count,
        "classAverage": class_average,
        "classMedian": class_median,
        "gradeCounts": grade_counts_json
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.upload" => Some(with_db(state, req, results_upload)),
        "results.get" => Some(with_db(state, req, results_get)),
        "results.listForStudent" => Some(with_db(state, req, results_list_for_student)),
        "results.updateMarks" => Some(with_db(state, req, results_update_marks)),
        "results.publish" => Some(with_db(state, req, results_publish)),
        "results.delete" => Some(with_db(state, req, results_delete)),
        "results.classSummary" => Some(with_db(state, req, results_class_summary)),
        _ => None,
    }
}
