use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_date, get_required_f64, get_required_str,
    with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", table),
        [id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "students", student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student not found"))
    }
}

fn optional_document(
    conn: &Connection,
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(doc_id) = get_optional_str(params, key) else {
        return Ok(None);
    };
    if !row_exists(conn, "documents", &doc_id)? {
        return Err(HandlerErr::not_found("document not found")
            .with_details(json!({ "field": key, "documentId": doc_id })));
    }
    Ok(Some(doc_id))
}

/// `WHERE` clause builder for the optional list filters.
struct Filters {
    clauses: Vec<&'static str>,
    args: Vec<String>,
}

impl Filters {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            args: Vec::new(),
        }
    }

    fn push(&mut self, clause: &'static str, arg: String) {
        self.clauses.push(clause);
        self.args.push(arg);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn daily_updates_create(
    conn: &Connection,
    params: &serde_json::Value,
    today: NaiveDate,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let date = get_optional_date(params, "date")?.unwrap_or(today);
    let subject = get_required_str(params, "subject")?;
    let topic = get_required_str(params, "topic")?;
    let remarks = get_optional_str(params, "remarks");
    let ksheet = optional_document(conn, params, "ksheetDocumentId")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO daily_updates(id, student_id, date, subject, topic, remarks, ksheet_document_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            id,
            student_id,
            date.format("%Y-%m-%d").to_string(),
            subject,
            topic,
            remarks,
            ksheet
        ],
    )
    .map_err(|e| HandlerErr::db_insert("daily_updates", e))?;
    Ok(json!({ "dailyUpdateId": id, "date": date }))
}

fn daily_updates_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut filters = Filters::new();
    if let Some(student_id) = get_optional_str(params, "studentId") {
        filters.push("student_id = ?", student_id);
    }
    if let Some(date) = get_optional_date(params, "date")? {
        filters.push("date = ?", date.format("%Y-%m-%d").to_string());
    }
    let sql = format!(
        "SELECT id, student_id, date, subject, topic, remarks, ksheet_document_id, created_at
         FROM daily_updates{}
         ORDER BY date DESC, created_at DESC",
        filters.sql()
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let updates = stmt
        .query_map(params_from_iter(filters.args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "topic": r.get::<_, String>(4)?,
                "remarks": r.get::<_, Option<String>>(5)?,
                "ksheetDocumentId": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "dailyUpdates": updates }))
}

pub fn percentage(marks: f64, out_of: f64) -> f64 {
    (marks / out_of * 10000.0).round() / 100.0
}

fn tests_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let subject = get_required_str(params, "subject")?;
    let test_date = get_required_date(params, "testDate")?;
    let marks = get_required_f64(params, "marks")?;
    let out_of = get_required_f64(params, "outOf")?;
    if out_of <= 0.0 {
        return Err(HandlerErr::bad_params("outOf must be greater than 0"));
    }
    if !(0.0..=out_of).contains(&marks) {
        return Err(HandlerErr::bad_params("marks must be between 0 and outOf")
            .with_details(json!({ "marks": marks, "outOf": out_of })));
    }
    let remarks = get_optional_str(params, "remarks");
    let document_id = optional_document(conn, params, "documentId")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO test_submissions(id, student_id, subject, test_date, marks, out_of, remarks, document_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            id,
            student_id,
            subject,
            test_date.format("%Y-%m-%d").to_string(),
            marks,
            out_of,
            remarks,
            document_id
        ],
    )
    .map_err(|e| HandlerErr::db_insert("test_submissions", e))?;
    Ok(json!({ "testId": id, "percentage": percentage(marks, out_of) }))
}

fn tests_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut filters = Filters::new();
    if let Some(student_id) = get_optional_str(params, "studentId") {
        filters.push("student_id = ?", student_id);
    }
    if let Some(subject) = get_optional_str(params, "subject") {
        filters.push("subject = ?", subject);
    }
    let sql = format!(
        "SELECT id, student_id, subject, test_date, marks, out_of, remarks, document_id, created_at
         FROM test_submissions{}
         ORDER BY test_date DESC, created_at DESC",
        filters.sql()
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let tests = stmt
        .query_map(params_from_iter(filters.args.iter()), |r| {
            let marks: f64 = r.get(4)?;
            let out_of: f64 = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "testDate": r.get::<_, String>(3)?,
                "marks": marks,
                "outOf": out_of,
                "percentage": percentage(marks, out_of),
                "remarks": r.get::<_, Option<String>>(6)?,
                "documentId": r.get::<_, Option<String>>(7)?,
                "createdAt": r.get::<_, String>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "tests": tests }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let today = state.clock.now().date();
    match req.method.as_str() {
        "dailyUpdates.create" => Some(with_db(state, req, |conn, params| {
            daily_updates_create(conn, params, today)
        })),
        "dailyUpdates.list" => Some(with_db(state, req, daily_updates_list)),
        "tests.submit" => Some(with_db(state, req, tests_submit)),
        "tests.list" => Some(with_db(state, req, tests_list)),
        _ => None,
    }
}
