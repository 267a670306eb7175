use crate::attendance::hhmm;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scheduler::{AutoPunchOutConfig, AutoPunchOutScheduler};
use chrono::NaiveTime;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CUTOFF: &str = "22:00";
const DEFAULT_POLL_SECONDS: u64 = 60;

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
    Fees,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "fees" => Some(Self::Fees),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
            Self::Fees => "setup.fees",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "autoPunchOutEnabled": true,
            "cutoffTime": DEFAULT_CUTOFF,
            "pollIntervalSeconds": DEFAULT_POLL_SECONDS
        }),
        SetupSection::Fees => json!({
            "displayCurrency": "USD",
            "exchangeRate": null
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "autoPunchOutEnabled" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "cutoffTime" => {
                    let raw = v.as_str().ok_or_else(|| format!("{} must be string", k))?;
                    let t = hhmm::parse(raw).ok_or_else(|| format!("{} must be HH:MM", k))?;
                    obj.insert(k.clone(), Value::String(hhmm::format(t)));
                }
                "pollIntervalSeconds" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 5, 3600)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Fees => match k.as_str() {
                "displayCurrency" => {
                    let s = v.as_str().ok_or_else(|| format!("{} must be string", k))?;
                    let s = s.trim().to_ascii_uppercase();
                    if s.len() != 3 || !s.chars().all(|c| c.is_ascii_alphabetic()) {
                        return Err(format!("{} must be a 3-letter currency code", k));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "exchangeRate" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                    } else {
                        let r = v
                            .as_f64()
                            .filter(|r| r.is_finite() && *r > 0.0)
                            .ok_or_else(|| format!("{} must be a positive number or null", k))?;
                        obj.insert(k.clone(), json!(r));
                    }
                }
                _ => return Err(format!("unknown fees field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy)]
pub struct AttendanceSetup {
    pub auto_punch_out_enabled: bool,
    pub cutoff: NaiveTime,
    pub poll_interval: Duration,
}

pub fn attendance_setup(conn: &rusqlite::Connection) -> anyhow::Result<AttendanceSetup> {
    let v = load_section(conn, SetupSection::Attendance)?;
    let cutoff = v
        .get("cutoffTime")
        .and_then(|c| c.as_str())
        .and_then(hhmm::parse)
        .or_else(|| hhmm::parse(DEFAULT_CUTOFF))
        .unwrap_or(NaiveTime::MIN);
    Ok(AttendanceSetup {
        auto_punch_out_enabled: v
            .get("autoPunchOutEnabled")
            .and_then(|b| b.as_bool())
            .unwrap_or(true),
        cutoff,
        poll_interval: Duration::from_secs(
            v.get("pollIntervalSeconds")
                .and_then(|n| n.as_u64())
                .unwrap_or(DEFAULT_POLL_SECONDS),
        ),
    })
}

#[derive(Debug, Clone)]
pub struct FeesSetup {
    pub display_currency: String,
    pub exchange_rate: Option<f64>,
}

pub fn fees_setup(conn: &rusqlite::Connection) -> anyhow::Result<FeesSetup> {
    let v = load_section(conn, SetupSection::Fees)?;
    Ok(FeesSetup {
        display_currency: v
            .get("displayCurrency")
            .and_then(|c| c.as_str())
            .unwrap_or("USD")
            .to_string(),
        exchange_rate: v.get("exchangeRate").and_then(|r| r.as_f64()),
    })
}

/// Stops any running auto punch-out thread and starts a new one when the
/// workspace has it enabled. Returns whether a scheduler is now running.
pub fn restart_scheduler(state: &mut AppState) -> anyhow::Result<bool> {
    state.stop_scheduler();
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.clone()) else {
        return Ok(false);
    };
    let setup = attendance_setup(conn)?;
    if !setup.auto_punch_out_enabled {
        info!("auto punch-out disabled for workspace");
        return Ok(false);
    }
    let scheduler = AutoPunchOutScheduler::start(
        workspace,
        AutoPunchOutConfig {
            cutoff: setup.cutoff,
            poll_interval: setup.poll_interval,
        },
        state.clock.clone(),
    )?;
    state.scheduler = Some(scheduler);
    Ok(true)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let attendance = match load_section(conn, SetupSection::Attendance) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fees = match load_section(conn, SetupSection::Fees) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "attendance": attendance,
            "fees": fees,
            "schedulerRunning": state.scheduler.is_some()
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    if matches!(section, SetupSection::Attendance) {
        if let Err(e) = restart_scheduler(state) {
            return err(&req.id, "scheduler_failed", e.to_string(), None);
        }
    }
    ok(
        &req.id,
        json!({ "ok": true, "schedulerRunning": state.scheduler.is_some() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
