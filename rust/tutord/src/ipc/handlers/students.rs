use crate::fees::{self, FeeBreakdown, FeeContext, FeeToggles, SubjectSelection};
use crate::ipc::handlers::fees::{parse_subjects, parse_toggles};
use crate::ipc::helpers::{
    get_grade, get_optional_str, get_required_str, parse_json_column, to_json_column, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::student_id;
use chrono::NaiveDate;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct StudentRow {
    id: String,
    student_code: String,
    first_name: String,
    last_name: String,
    board: String,
    branch: String,
    grade: String,
    parent_name: Option<String>,
    phone: Option<String>,
    active: bool,
    subjects: Vec<SubjectSelection>,
    fee_toggles: FeeToggles,
    fees: FeeBreakdown,
    created_at: String,
    updated_at: String,
}

impl StudentRow {
    fn context(&self) -> FeeContext {
        FeeContext {
            board: self.board.clone(),
            branch: self.branch.clone(),
            grade: self.grade.clone(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentCode": self.student_code,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "displayName": format!("{}, {}", self.last_name, self.first_name),
            "board": self.board,
            "branch": self.branch,
            "grade": self.grade,
            "parentName": self.parent_name,
            "phone": self.phone,
            "active": self.active,
            "subjects": self.subjects,
            "feeToggles": self.fee_toggles,
            "fees": self.fees,
            "balanceDue": balance_due(&self.fees),
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

fn balance_due(fees: &FeeBreakdown) -> i64 {
    fees.installments
        .iter()
        .filter(|i| !i.paid)
        .map(|i| i.amount)
        .sum()
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, HandlerErr> {
    let raw = conn
        .query_row(
            "SELECT id, student_code, first_name, last_name, board, branch, grade,
                    parent_name, phone, active, subjects_json, fee_toggles_json, fees_json,
                    created_at, updated_at
             FROM students
             WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    (
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                    ),
                    (
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, Option<String>>(8)?,
                        r.get::<_, i64>(9)?,
                        r.get::<_, String>(10)?,
                        r.get::<_, String>(11)?,
                        r.get::<_, String>(12)?,
                        r.get::<_, String>(13)?,
                        r.get::<_, String>(14)?,
                    ),
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((
        (id, student_code, first_name, last_name, board, branch, grade),
        (parent_name, phone, active, subjects_json, toggles_json, fees_json, created_at, updated_at),
    )) = raw
    else {
        return Ok(None);
    };
    Ok(Some(StudentRow {
        id,
        student_code,
        first_name,
        last_name,
        board,
        branch,
        grade,
        parent_name,
        phone,
        active: active != 0,
        subjects: parse_json_column(&subjects_json, "subjects_json")?,
        fee_toggles: parse_json_column(&toggles_json, "fee_toggles_json")?,
        fees: parse_json_column(&fees_json, "fees_json")?,
        created_at,
        updated_at,
    }))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn existing_codes(conn: &Connection, prefix: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT student_code FROM students WHERE student_code LIKE ? ESCAPE '\\'")
        .map_err(HandlerErr::db_query)?;
    let codes = stmt
        .query_map([format!("{}%", escape_like(prefix))], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(codes)
}

fn normalize_board(board: &str) -> String {
    board.trim().to_uppercase()
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
    today: NaiveDate,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let board = normalize_board(&get_required_str(params, "board")?);
    let grade = get_grade(params, "grade")?;
    let branch = get_optional_str(params, "branch").unwrap_or_default();
    let parent_name = get_optional_str(params, "parentName");
    let phone = get_optional_str(params, "phone");
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let subjects = parse_subjects(params)?;
    let fee_toggles = parse_toggles(params.get("feeToggles"))?;

    let ctx = FeeContext {
        board: board.clone(),
        branch: branch.clone(),
        grade: grade.clone(),
    };
    let breakdown = fees::compute_fees(&subjects, &ctx, &fee_toggles, today);

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let codes = existing_codes(&tx, &student_id::code_prefix(&board, &grade))?;
    let student_code = student_id::next_student_id(&board, &grade, &codes);
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO students(
           id, student_code, first_name, last_name, board, branch, grade,
           parent_name, phone, active, subjects_json, fee_toggles_json, fees_json,
           created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
           strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            id,
            student_code,
            first_name,
            last_name,
            board,
            branch,
            grade,
            parent_name,
            phone,
            active as i64,
            to_json_column(&subjects)?,
            to_json_column(&fee_toggles)?,
            to_json_column(&breakdown)?,
        ],
    )
    .map_err(|e| HandlerErr::db_insert("students", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "studentId": id,
        "studentCode": student_code,
        "fees": breakdown
    }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT id FROM students WHERE 1 = 1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(board) = get_optional_str(params, "board") {
        sql.push_str(" AND board = ?");
        args.push(normalize_board(&board));
    }
    if params.get("grade").is_some() {
        sql.push_str(" AND grade = ?");
        args.push(get_grade(params, "grade")?);
    }
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !include_inactive {
        sql.push_str(" AND active = 1");
    }
    sql.push_str(" ORDER BY student_code");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let ids = stmt
        .query_map(params_from_iter(args.iter()), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut students = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(row) = load_student(conn, &id)? else {
            continue;
        };
        students.push(json!({
            "id": row.id,
            "studentCode": row.student_code,
            "displayName": format!("{}, {}", row.last_name, row.first_name),
            "board": row.board,
            "branch": row.branch,
            "grade": row.grade,
            "active": row.active,
            "finalTotal": row.fees.final_total,
            "balanceDue": balance_due(&row.fees)
        }));
    }
    Ok(json!({ "students": students }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(row) = load_student(conn, &student_id)? else {
        return Err(HandlerErr::not_found("student not found"));
    };
    Ok(json!({ "student": row.to_json() }))
}

fn non_empty_str(v: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    v.as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-empty string", key)))
}

fn nullable_str(v: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    if v.is_null() {
        return Ok(None);
    }
    let s = v
        .as_str()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", key)))?;
    let t = s.trim();
    Ok(if t.is_empty() { None } else { Some(t.to_string()) })
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
    today: NaiveDate,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let Some(mut row) = load_student(conn, &student_id)? else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let mut recompute = false;
    for (k, v) in patch {
        match k.as_str() {
            "firstName" => row.first_name = non_empty_str(v, k)?,
            "lastName" => row.last_name = non_empty_str(v, k)?,
            "parentName" => row.parent_name = nullable_str(v, k)?,
            "phone" => row.phone = nullable_str(v, k)?,
            "active" => {
                row.active = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?
            }
            "branch" => {
                row.branch = nullable_str(v, k)?.unwrap_or_default();
                recompute = true;
            }
            "board" => {
                row.board = normalize_board(&non_empty_str(v, k)?);
                recompute = true;
            }
            "grade" => {
                row.grade = get_grade(&json!({ "grade": v }), "grade")?;
                recompute = true;
            }
            "subjects" => {
                row.subjects = parse_subjects(&json!({ "subjects": v }))?;
                recompute = true;
            }
            "feeToggles" => {
                row.fee_toggles = parse_toggles(Some(v))?;
                recompute = true;
            }
            "studentCode" => {
                return Err(HandlerErr::bad_params("studentCode cannot be changed"));
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown student field: {}", k))),
        }
    }

    if recompute {
        let mut next = fees::compute_fees(&row.subjects, &row.context(), &row.fee_toggles, today);
        // Payments already recorded stay attached to their installment slot.
        for (slot, old) in next.installments.iter_mut().zip(row.fees.installments.iter()) {
            slot.paid = old.paid;
        }
        row.fees = next;
    }

    conn.execute(
        "UPDATE students SET
           first_name = ?, last_name = ?, board = ?, branch = ?, grade = ?,
           parent_name = ?, phone = ?, active = ?,
           subjects_json = ?, fee_toggles_json = ?, fees_json = ?,
           updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        rusqlite::params![
            row.first_name,
            row.last_name,
            row.board,
            row.branch,
            row.grade,
            row.parent_name,
            row.phone,
            row.active as i64,
            to_json_column(&row.subjects)?,
            to_json_column(&row.fee_toggles)?,
            to_json_column(&row.fees)?,
            row.id,
        ],
    )
    .map_err(|e| HandlerErr::db_update("students", e))?;

    Ok(json!({ "ok": true, "feesRecomputed": recompute, "fees": row.fees }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM daily_updates WHERE student_id = ?", [&student_id])
        .map_err(|e| HandlerErr::db_delete("daily_updates", e))?;
    tx.execute("DELETE FROM test_submissions WHERE student_id = ?", [&student_id])
        .map_err(|e| HandlerErr::db_delete("test_submissions", e))?;
    let deleted = tx
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| HandlerErr::db_delete("students", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn students_mark_installment_paid(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let index = params
        .get("index")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing index"))? as usize;
    let paid = params.get("paid").and_then(|v| v.as_bool()).unwrap_or(true);
    let Some(mut row) = load_student(conn, &student_id)? else {
        return Err(HandlerErr::not_found("student not found"));
    };
    let count = row.fees.installments.len();
    let Some(slot) = row.fees.installments.get_mut(index) else {
        return Err(HandlerErr::bad_params("installment index out of range")
            .with_details(json!({ "count": count })));
    };
    slot.paid = paid;
    conn.execute(
        "UPDATE students SET fees_json = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (to_json_column(&row.fees)?, &row.id),
    )
    .map_err(|e| HandlerErr::db_update("students", e))?;
    Ok(json!({
        "installments": row.fees.installments,
        "balanceDue": balance_due(&row.fees)
    }))
}

fn students_next_code(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let board = normalize_board(&get_required_str(params, "board")?);
    let grade = get_grade(params, "grade")?;
    let codes = existing_codes(conn, &student_id::code_prefix(&board, &grade))?;
    Ok(json!({ "studentCode": student_id::next_student_id(&board, &grade, &codes) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let today = state.clock.now().date();
    match req.method.as_str() {
        "students.list" => Some(with_db(state, req, students_list)),
        "students.get" => Some(with_db(state, req, students_get)),
        "students.create" => Some(with_db(state, req, |conn, params| {
            students_create(conn, params, today)
        })),
        "students.update" => Some(with_db(state, req, |conn, params| {
            students_update(conn, params, today)
        })),
        "students.delete" => Some(with_db(state, req, students_delete)),
        "students.markInstallmentPaid" => {
            Some(with_db(state, req, students_mark_installment_paid))
        }
        "students.nextCode" => Some(with_db(state, req, students_next_code)),
        _ => None,
    }
}
