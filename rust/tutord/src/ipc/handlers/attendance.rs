use crate::attendance::{self, AttendanceError, AttendanceRecord, AttendanceStatus, GeoLocation, Punch};
use crate::attendance_store::{AttendanceStore, SqliteAttendanceStore};
use crate::ipc::handlers::setup;
use crate::ipc::handlers::staff::require_active_staff;
use crate::ipc::helpers::{
    get_optional_date, get_optional_datetime, get_required_date, get_required_str, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scheduler;
use chrono::{NaiveDateTime, Timelike};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

fn parse_location(params: &serde_json::Value) -> Result<Option<GeoLocation>, HandlerErr> {
    let Some(raw) = params.get("location").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let loc: GeoLocation = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid location: {}", e)))?;
    if !(-90.0..=90.0).contains(&loc.latitude) || !(-180.0..=180.0).contains(&loc.longitude) {
        return Err(HandlerErr::bad_params("location out of range")
            .with_details(json!({ "latitude": loc.latitude, "longitude": loc.longitude })));
    }
    Ok(Some(loc))
}

/// Punch instant from `params.at`, or the clock reading truncated to whole
/// seconds.
fn punch_instant(params: &serde_json::Value, now: NaiveDateTime) -> Result<NaiveDateTime, HandlerErr> {
    match get_optional_datetime(params, "at")? {
        Some(at) => Ok(at),
        None => Ok(now.with_nanosecond(0).unwrap_or(now)),
    }
}

fn record_json(rec: &AttendanceRecord) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(rec).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// Saves an updated record; losing to a concurrent close is a `conflict`.
fn save_existing(store: &SqliteAttendanceStore<'_>, record: &AttendanceRecord) -> Result<(), HandlerErr> {
    store.save(record).map_err(|e| match e.downcast::<AttendanceError>() {
        Ok(closed) => closed.into(),
        Err(e) => HandlerErr::db_update("attendance", e),
    })
}

fn attendance_punch_in(
    conn: &Connection,
    params: &serde_json::Value,
    now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    require_active_staff(conn, &staff_id)?;
    let at = punch_instant(params, now)?;
    let punch = Punch {
        time: at.time(),
        location: parse_location(params)?,
    };

    let store = SqliteAttendanceStore::new(conn);
    let existing = store.get(&staff_id, at.date()).map_err(HandlerErr::db_query)?;
    let record = attendance::punch_in(
        existing.as_ref(),
        Uuid::new_v4().to_string(),
        &staff_id,
        at.date(),
        punch,
    )?;
    store
        .save(&record)
        .map_err(|e| HandlerErr::db_insert("attendance", e))?;
    Ok(json!({ "record": record_json(&record)? }))
}

fn attendance_punch_out(
    conn: &Connection,
    params: &serde_json::Value,
    now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    let at = punch_instant(params, now)?;
    let punch = Punch {
        time: at.time(),
        location: parse_location(params)?,
    };

    let store = SqliteAttendanceStore::new(conn);
    let Some(mut record) = store.get(&staff_id, at.date()).map_err(HandlerErr::db_query)? else {
        return Err(AttendanceError::NotPunchedIn {
            staff_id,
            date: at.date(),
        }
        .into());
    };
    attendance::punch_out(&mut record, punch)?;
    save_existing(&store, &record)?;
    Ok(json!({ "record": record_json(&record)? }))
}

fn attendance_mark_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    require_active_staff(conn, &staff_id)?;
    let date = get_required_date(params, "date")?;
    let raw_status = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&raw_status) else {
        return Err(HandlerErr::bad_params(format!("unknown status: {}", raw_status)));
    };

    let store = SqliteAttendanceStore::new(conn);
    let existing = store.get(&staff_id, date).map_err(HandlerErr::db_query)?;
    let record = attendance::mark_day(existing, Uuid::new_v4().to_string(), &staff_id, date, status)?;
    save_existing(&store, &record)?;
    Ok(json!({ "record": record_json(&record)? }))
}

fn attendance_day(
    conn: &Connection,
    params: &serde_json::Value,
    now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_optional_date(params, "date")?.unwrap_or(now.date());
    let store = SqliteAttendanceStore::new(conn);
    let records = store.list_for_day(date).map_err(HandlerErr::db_query)?;

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for rec in &records {
        *counts.entry(rec.status.as_str()).or_default() += 1;
    }
    Ok(json!({
        "date": date,
        "records": serde_json::to_value(&records)
            .map_err(|e| HandlerErr::new("internal", e.to_string()))?,
        "counts": counts
    }))
}

fn attendance_history(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    let from = get_optional_date(params, "from")?;
    let to = get_optional_date(params, "to")?;
    if let (Some(f), Some(t)) = (from, to) {
        if t < f {
            return Err(HandlerErr::bad_params("to must not be before from"));
        }
    }
    let store = SqliteAttendanceStore::new(conn);
    let records = store
        .list_for_staff(&staff_id, from, to)
        .map_err(HandlerErr::db_query)?;
    let total: f64 = records.iter().map(|r| r.working_hours).sum();
    Ok(json!({
        "records": serde_json::to_value(&records)
            .map_err(|e| HandlerErr::new("internal", e.to_string()))?,
        "totalHours": (total * 100.0).round() / 100.0
    }))
}

fn attendance_auto_punch_out(
    conn: &Connection,
    params: &serde_json::Value,
    now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_optional_date(params, "date")?.unwrap_or(now.date());
    let cutoff = setup::attendance_setup(conn)
        .map_err(HandlerErr::db_query)?
        .cutoff;
    let store = SqliteAttendanceStore::new(conn);
    let closed = scheduler::run_pass(&store, date, cutoff)
        .map_err(|e| HandlerErr::db_update("attendance", e))?;
    info!(%date, closed, "manual auto punch-out pass");
    Ok(json!({
        "date": date,
        "cutoffTime": attendance::hhmm::format(cutoff),
        "closed": closed
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let now = state.clock.now();
    match req.method.as_str() {
        "attendance.punchIn" => Some(with_db(state, req, |conn, params| {
            attendance_punch_in(conn, params, now)
        })),
        "attendance.punchOut" => Some(with_db(state, req, |conn, params| {
            attendance_punch_out(conn, params, now)
        })),
        "attendance.markDay" => Some(with_db(state, req, attendance_mark_day)),
        "attendance.day" => Some(with_db(state, req, |conn, params| {
            attendance_day(conn, params, now)
        })),
        "attendance.history" => Some(with_db(state, req, attendance_history)),
        "attendance.autoPunchOut" => Some(with_db(state, req, |conn, params| {
            attendance_auto_punch_out(conn, params, now)
        })),
        _ => None,
    }
}
