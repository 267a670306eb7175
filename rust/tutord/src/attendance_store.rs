use crate::attendance::{AttendanceError, AttendanceRecord, AttendanceStatus, GeoLocation, Punch};
use anyhow::{anyhow, Context};
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{Connection, OptionalExtension, Row};

const TIME_FMT: &str = "%H:%M:%S";
const DATE_FMT: &str = "%Y-%m-%d";

const SELECT_COLUMNS: &str = "SELECT id, staff_id, date, punch_in_time, punch_in_location_json,
        punch_out_time, punch_out_location_json, working_hours, status
 FROM attendance";

/// Persistence seam used by the auto punch-out job.
pub trait AttendanceStore {
    fn open_records_for_day(&self, date: NaiveDate) -> anyhow::Result<Vec<AttendanceRecord>>;
    /// Inserts or updates `record`. A stored record that already has a
    /// punch-out is never overwritten; that case fails with
    /// `AttendanceError::AlreadyClosed`.
    fn save(&self, record: &AttendanceRecord) -> anyhow::Result<()>;
}

pub struct SqliteAttendanceStore<'a> {
    conn: &'a Connection,
}

struct RawRow {
    id: String,
    staff_id: String,
    date: String,
    punch_in_time: Option<String>,
    punch_in_location: Option<String>,
    punch_out_time: Option<String>,
    punch_out_location: Option<String>,
    working_hours: f64,
    status: String,
}

impl RawRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            staff_id: r.get(1)?,
            date: r.get(2)?,
            punch_in_time: r.get(3)?,
            punch_in_location: r.get(4)?,
            punch_out_time: r.get(5)?,
            punch_out_location: r.get(6)?,
            working_hours: r.get(7)?,
            status: r.get(8)?,
        })
    }

    fn into_record(self) -> anyhow::Result<AttendanceRecord> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FMT)
            .with_context(|| format!("bad attendance date {}", self.date))?;
        let status = AttendanceStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("bad attendance status {}", self.status))?;
        Ok(AttendanceRecord {
            punch_in: decode_punch(self.punch_in_time, self.punch_in_location)?,
            punch_out: decode_punch(self.punch_out_time, self.punch_out_location)?,
            id: self.id,
            staff_id: self.staff_id,
            date,
            working_hours: self.working_hours,
            status,
        })
    }
}

fn decode_punch(time: Option<String>, location: Option<String>) -> anyhow::Result<Option<Punch>> {
    let Some(time) = time else {
        return Ok(None);
    };
    let time = NaiveTime::parse_from_str(&time, TIME_FMT)
        .with_context(|| format!("bad punch time {}", time))?;
    let location = match location {
        Some(text) => Some(
            serde_json::from_str::<GeoLocation>(&text).context("bad punch location json")?,
        ),
        None => None,
    };
    Ok(Some(Punch { time, location }))
}

fn encode_punch(p: Option<&Punch>) -> anyhow::Result<(Option<String>, Option<String>)> {
    let Some(p) = p else {
        return Ok((None, None));
    };
    let location = match p.location.as_ref() {
        Some(loc) => Some(serde_json::to_string(loc)?),
        None => None,
    };
    Ok((Some(p.time.format(TIME_FMT).to_string()), location))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

impl<'a> SqliteAttendanceStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::into_record).collect()
    }

    pub fn get(&self, staff_id: &str, date: NaiveDate) -> anyhow::Result<Option<AttendanceRecord>> {
        let sql = format!("{} WHERE staff_id = ? AND date = ?", SELECT_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, (staff_id, format_date(date)), RawRow::from_row)
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    pub fn list_for_day(&self, date: NaiveDate) -> anyhow::Result<Vec<AttendanceRecord>> {
        let sql = format!("{} WHERE date = ? ORDER BY staff_id", SELECT_COLUMNS);
        self.query(&sql, &[&format_date(date)])
    }

    pub fn list_for_staff(
        &self,
        staff_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let sql = format!(
            "{} WHERE staff_id = ? AND date >= ? AND date <= ? ORDER BY date",
            SELECT_COLUMNS
        );
        let from = from.map(format_date).unwrap_or_else(|| "0000-01-01".to_string());
        let to = to.map(format_date).unwrap_or_else(|| "9999-12-31".to_string());
        self.query(&sql, &[&staff_id, &from, &to])
    }
}

impl AttendanceStore for SqliteAttendanceStore<'_> {
    fn open_records_for_day(&self, date: NaiveDate) -> anyhow::Result<Vec<AttendanceRecord>> {
        let sql = format!(
            "{} WHERE date = ? AND punch_in_time IS NOT NULL AND punch_out_time IS NULL",
            SELECT_COLUMNS
        );
        self.query(&sql, &[&format_date(date)])
    }

    fn save(&self, record: &AttendanceRecord) -> anyhow::Result<()> {
        let (in_time, in_loc) = encode_punch(record.punch_in.as_ref())?;
        let (out_time, out_loc) = encode_punch(record.punch_out.as_ref())?;
        let changed = self.conn.execute(
            "INSERT INTO attendance(
               id, staff_id, date, punch_in_time, punch_in_location_json,
               punch_out_time, punch_out_location_json, working_hours, status
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               punch_in_time = excluded.punch_in_time,
               punch_in_location_json = excluded.punch_in_location_json,
               punch_out_time = excluded.punch_out_time,
               punch_out_location_json = excluded.punch_out_location_json,
               working_hours = excluded.working_hours,
               status = excluded.status
             WHERE attendance.punch_out_time IS NULL",
            rusqlite::params![
                record.id,
                record.staff_id,
                format_date(record.date),
                in_time,
                in_loc,
                out_time,
                out_loc,
                record.working_hours,
                record.status.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(AttendanceError::AlreadyClosed {
                staff_id: record.staff_id.clone(),
                date: record.date,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn punch(t: &str) -> Punch {
        Punch {
            time: NaiveTime::parse_from_str(t, "%H:%M").expect("time"),
            location: None,
        }
    }

    #[test]
    fn closed_record_is_not_overwritten() {
        let workspace = std::env::temp_dir().join(format!(
            "tutord-store-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let conn = db::open_db(&workspace).expect("open db");
        conn.execute(
            "INSERT INTO staff(id, name, role, created_at) VALUES('staff-a', 'A', 'teacher', '2024-03-04T08:00:00Z')",
            [],
        )
        .expect("insert staff");
        let store = SqliteAttendanceStore::new(&conn);
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).expect("date");

        let open = AttendanceRecord {
            id: "rec-a".to_string(),
            staff_id: "staff-a".to_string(),
            date,
            punch_in: Some(punch("09:00")),
            punch_out: None,
            working_hours: 0.0,
            status: AttendanceStatus::InProgress,
        };
        store.save(&open).expect("save open");

        let mut auto = open.clone();
        auto.punch_out = Some(punch("22:00"));
        auto.working_hours = 13.0;
        auto.status = AttendanceStatus::AutoPunchedOut;
        store.save(&auto).expect("close");

        // A punch-out computed from the stale open row loses.
        let mut late = open.clone();
        late.punch_out = Some(punch("18:00"));
        late.working_hours = 9.0;
        late.status = AttendanceStatus::Present;
        let e = store.save(&late).expect_err("closed record must stay");
        assert!(matches!(
            e.downcast_ref::<AttendanceError>(),
            Some(AttendanceError::AlreadyClosed { .. })
        ));

        let stored = store.get("staff-a", date).expect("get").expect("record");
        assert_eq!(stored.status, AttendanceStatus::AutoPunchedOut);
        assert_eq!(stored.working_hours, 13.0);

        drop(conn);
        let _ = std::fs::remove_dir_all(workspace);
    }
}
