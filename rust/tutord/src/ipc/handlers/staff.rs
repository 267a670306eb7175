use crate::ipc::helpers::{
    get_optional_str, get_required_str, parse_json_column, to_json_column, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["teacher", "admin", "support"];

struct StaffRow {
    id: String,
    name: String,
    role: String,
    email: Option<String>,
    phone: Option<String>,
    subjects: Vec<String>,
    active: bool,
    created_at: String,
}

impl StaffRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "role": self.role,
            "email": self.email,
            "phone": self.phone,
            "subjects": self.subjects,
            "active": self.active,
            "createdAt": self.created_at
        })
    }
}

fn parse_role(raw: &str) -> Result<String, HandlerErr> {
    let role = raw.trim().to_ascii_lowercase();
    if ROLES.contains(&role.as_str()) {
        Ok(role)
    } else {
        Err(HandlerErr::bad_params(format!("role must be one of {}", ROLES.join(", "))))
    }
}

fn parse_subject_names(v: &serde_json::Value) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("subjects must be an array of strings"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let Some(s) = item.as_str() else {
            return Err(HandlerErr::bad_params("subjects must be an array of strings"));
        };
        let s = s.trim();
        if !s.is_empty() && !out.iter().any(|x: &String| x == s) {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn map_staff_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(StaffRow, String)> {
    Ok((
        StaffRow {
            id: r.get(0)?,
            name: r.get(1)?,
            role: r.get(2)?,
            email: r.get(3)?,
            phone: r.get(4)?,
            subjects: Vec::new(),
            active: r.get::<_, i64>(6)? != 0,
            created_at: r.get(7)?,
        },
        r.get(5)?,
    ))
}

fn finish_row((mut row, subjects_json): (StaffRow, String)) -> Result<StaffRow, HandlerErr> {
    row.subjects = parse_json_column(&subjects_json, "subjects_json")?;
    Ok(row)
}

const SELECT_STAFF: &str =
    "SELECT id, name, role, email, phone, subjects_json, active, created_at FROM staff";

fn load_staff(conn: &Connection, staff_id: &str) -> Result<Option<StaffRow>, HandlerErr> {
    let raw = conn
        .query_row(
            &format!("{} WHERE id = ?", SELECT_STAFF),
            [staff_id],
            map_staff_row,
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    raw.map(finish_row).transpose()
}

/// Attendance is only recorded for staff that exist and are active.
pub fn require_active_staff(conn: &Connection, staff_id: &str) -> Result<(), HandlerErr> {
    match load_staff(conn, staff_id)? {
        Some(s) if s.active => Ok(()),
        Some(_) => Err(HandlerErr::conflict("staff member is inactive")),
        None => Err(HandlerErr::not_found("staff not found")),
    }
}

fn staff_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let role = match get_optional_str(params, "role") {
        Some(r) => Some(parse_role(&r)?),
        None => None,
    };

    let mut stmt = conn
        .prepare(&format!("{} ORDER BY name, id", SELECT_STAFF))
        .map_err(HandlerErr::db_query)?;
    let raw = stmt
        .query_map([], map_staff_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut staff = Vec::new();
    for r in raw {
        let row = finish_row(r)?;
        if !include_inactive && !row.active {
            continue;
        }
        if role.as_deref().is_some_and(|want| want != row.role) {
            continue;
        }
        staff.push(row.to_json());
    }
    Ok(json!({ "staff": staff }))
}

fn staff_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let role = parse_role(&get_required_str(params, "role")?)?;
    let email = get_optional_str(params, "email");
    let phone = get_optional_str(params, "phone");
    let subjects = match params.get("subjects") {
        Some(v) if !v.is_null() => parse_subject_names(v)?,
        _ => Vec::new(),
    };
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO staff(id, name, role, email, phone, subjects_json, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            id,
            name,
            role,
            email,
            phone,
            to_json_column(&subjects)?,
            active as i64
        ],
    )
    .map_err(|e| HandlerErr::db_insert("staff", e))?;
    Ok(json!({ "staffId": id }))
}

fn staff_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let Some(mut row) = load_staff(conn, &staff_id)? else {
        return Err(HandlerErr::not_found("staff not found"));
    };

    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                row.name = v
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| HandlerErr::bad_params("name must be a non-empty string"))?
            }
            "role" => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("role must be a string"))?;
                row.role = parse_role(raw)?;
            }
            "email" | "phone" => {
                let value = if v.is_null() {
                    None
                } else {
                    let s = v
                        .as_str()
                        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", k)))?
                        .trim();
                    (!s.is_empty()).then(|| s.to_string())
                };
                if k == "email" {
                    row.email = value;
                } else {
                    row.phone = value;
                }
            }
            "subjects" => row.subjects = parse_subject_names(v)?,
            "active" => {
                row.active = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown staff field: {}", k))),
        }
    }

    conn.execute(
        "UPDATE staff SET name = ?, role = ?, email = ?, phone = ?, subjects_json = ?, active = ?
         WHERE id = ?",
        rusqlite::params![
            row.name,
            row.role,
            row.email,
            row.phone,
            to_json_column(&row.subjects)?,
            row.active as i64,
            row.id
        ],
    )
    .map_err(|e| HandlerErr::db_update("staff", e))?;
    Ok(json!({ "staff": row.to_json() }))
}

fn staff_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let staff_id = get_required_str(params, "staffId")?;
    let records: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance WHERE staff_id = ?",
            [&staff_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if records > 0 {
        return Err(HandlerErr::conflict("staff member has attendance records; deactivate instead")
            .with_details(json!({ "attendanceRecords": records })));
    }
    let deleted = conn
        .execute("DELETE FROM staff WHERE id = ?", [&staff_id])
        .map_err(|e| HandlerErr::db_delete("staff", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("staff not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "staff.list" => Some(with_db(state, req, staff_list)),
        "staff.create" => Some(with_db(state, req, staff_create)),
        "staff.update" => Some(with_db(state, req, staff_update)),
        "staff.delete" => Some(with_db(state, req, staff_delete)),
        _ => None,
    }
}
