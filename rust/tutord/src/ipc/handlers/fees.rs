use crate::fees::{self, FeeBreakdown, FeeContext, FeeToggles, SubjectSelection};
use crate::ipc::error::ok;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_grade, get_optional_date, get_optional_str, get_required_str, parse_json_column,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn parse_subjects(params: &serde_json::Value) -> Result<Vec<SubjectSelection>, HandlerErr> {
    let Some(raw) = params.get("subjects") else {
        return Ok(Vec::new());
    };
    let subjects: Vec<SubjectSelection> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid subjects: {}", e)))?;
    for s in &subjects {
        if s.name.trim().is_empty() {
            return Err(HandlerErr::bad_params("subject name must not be empty"));
        }
        if let (Some(start), Some(end)) = (s.start_date, s.end_date) {
            if end < start {
                return Err(HandlerErr::bad_params(format!(
                    "subject {} ends before it starts",
                    s.name
                ))
                .with_details(json!({ "subject": s.name })));
            }
        }
    }
    Ok(subjects)
}

pub fn parse_toggles(raw: Option<&serde_json::Value>) -> Result<FeeToggles, HandlerErr> {
    let toggles: FeeToggles = match raw {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid toggles: {}", e)))?,
        _ => FeeToggles::default(),
    };
    toggles.validate().map_err(HandlerErr::bad_params)?;
    Ok(toggles)
}

fn fees_compute(params: &serde_json::Value, today: NaiveDate) -> Result<serde_json::Value, HandlerErr> {
    let ctx = FeeContext {
        board: get_required_str(params, "board")?,
        branch: get_optional_str(params, "branch").unwrap_or_default(),
        grade: get_grade(params, "grade")?,
    };
    let subjects = parse_subjects(params)?;
    let toggles = parse_toggles(params.get("toggles"))?;
    let today = get_optional_date(params, "today")?.unwrap_or(today);

    let breakdown = fees::compute_fees(&subjects, &ctx, &toggles, today);
    Ok(json!({
        "fees": breakdown,
        "rates": {
            "baseMonthlyRate": fees::base_monthly_rate(&ctx.board, &ctx.branch),
            "gradeMultiplier": fees::grade_multiplier(&ctx.grade),
            "monthlyRate": fees::monthly_rate(&ctx, &toggles)
        },
        "incompleteSubjects": subjects
            .iter()
            .filter(|s| s.billable_days().is_none())
            .map(|s| s.name.clone())
            .collect::<Vec<_>>()
    }))
}

fn stored_breakdown(conn: &Connection, student_id: &str) -> Result<FeeBreakdown, HandlerErr> {
    let text: Option<String> = conn
        .query_row(
            "SELECT fees_json FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(text) = text else {
        return Err(HandlerErr::not_found("student not found"));
    };
    parse_json_column(&text, "fees_json")
}

fn fees_display(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let configured = match state.db.as_ref() {
        Some(conn) => Some(setup::fees_setup(conn).map_err(HandlerErr::db_query)?),
        None => None,
    };

    let breakdown: FeeBreakdown = if let Some(raw) = params.get("breakdown") {
        serde_json::from_value(raw.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid breakdown: {}", e)))?
    } else if let Some(student_id) = get_optional_str(params, "studentId") {
        let Some(conn) = state.db.as_ref() else {
            return Err(HandlerErr::new("no_workspace", "select a workspace first"));
        };
        stored_breakdown(conn, &student_id)?
    } else {
        return Err(HandlerErr::bad_params("missing breakdown or studentId"));
    };

    let exchange_rate = params
        .get("exchangeRate")
        .and_then(|v| v.as_f64())
        .or_else(|| configured.as_ref().and_then(|c| c.exchange_rate))
        .filter(|r| r.is_finite() && *r > 0.0)
        .ok_or_else(|| HandlerErr::bad_params("exchangeRate must be a positive number"))?;
    let currency = get_optional_str(params, "currency")
        .or_else(|| configured.map(|c| c.display_currency))
        .unwrap_or_else(|| "USD".to_string());

    Ok(json!({
        "display": fees::display_breakdown(&breakdown, &currency, exchange_rate),
        "markup": fees::DISPLAY_MARKUP
    }))
}

fn handle_fees_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let today = state.clock.now().date();
    match fees_compute(&req.params, today) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_fees_display(state: &mut AppState, req: &Request) -> serde_json::Value {
    match fees_display(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.compute" => Some(handle_fees_compute(state, req)),
        "fees.display" => Some(handle_fees_display(state, req)),
        _ => None,
    }
}
