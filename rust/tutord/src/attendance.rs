use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[serde(rename = "inprogress")]
    InProgress,
    #[serde(rename = "present")]
    Present,
    #[serde(rename = "absent")]
    Absent,
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "auto-punched-out")]
    AutoPunchedOut,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "inprogress",
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Leave => "leave",
            Self::AutoPunchedOut => "auto-punched-out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inprogress" => Some(Self::InProgress),
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "leave" => Some(Self::Leave),
            "auto-punched-out" => Some(Self::AutoPunchedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Wall-clock times travel as `HH:MM`; `HH:MM:SS` is accepted on input.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<NaiveTime> {
        let t = raw.trim();
        NaiveTime::parse_from_str(t, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
            .ok()
    }

    pub fn format(t: NaiveTime) -> String {
        t.format("%H:%M").to_string()
    }

    pub fn serialize<S>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&format(*t))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid time: {}", raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Punch {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    #[serde(default)]
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub staff_id: String,
    pub date: NaiveDate,
    pub punch_in: Option<Punch>,
    pub punch_out: Option<Punch>,
    pub working_hours: f64,
    pub status: AttendanceStatus,
}

impl AttendanceRecord {
    pub fn is_open(&self) -> bool {
        self.punch_in.is_some() && self.punch_out.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.punch_in.is_some() && self.punch_out.is_some()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AttendanceError {
    #[error("staff {staff_id} already punched in on {date}")]
    AlreadyPunchedIn { staff_id: String, date: NaiveDate },
    #[error("staff {staff_id} has no punch-in on {date}")]
    NotPunchedIn { staff_id: String, date: NaiveDate },
    #[error("attendance for staff {staff_id} on {date} is already closed")]
    AlreadyClosed { staff_id: String, date: NaiveDate },
    #[error("punch-out {out} is earlier than punch-in {punch_in}")]
    OutBeforeIn { punch_in: NaiveTime, out: NaiveTime },
    #[error("day is already marked as {0}")]
    DayMarked(&'static str),
    #[error("status {0} cannot be set as a day mark")]
    NotADayMark(&'static str),
}

/// Elapsed hours between two wall-clock times, rounded to 2 decimals and
/// floored at zero.
pub fn working_hours(punch_in: NaiveTime, punch_out: NaiveTime) -> f64 {
    let secs = punch_out.signed_duration_since(punch_in).num_seconds().max(0);
    let hours = secs as f64 / 3600.0;
    (hours * 100.0).round() / 100.0
}

pub fn punch_in(
    existing: Option<&AttendanceRecord>,
    id: String,
    staff_id: &str,
    date: NaiveDate,
    punch: Punch,
) -> Result<AttendanceRecord, AttendanceError> {
    if let Some(rec) = existing {
        if rec.punch_in.is_some() {
            return Err(AttendanceError::AlreadyPunchedIn {
                staff_id: staff_id.to_string(),
                date,
            });
        }
        return Err(AttendanceError::DayMarked(rec.status.as_str()));
    }
    Ok(AttendanceRecord {
        id,
        staff_id: staff_id.to_string(),
        date,
        punch_in: Some(punch),
        punch_out: None,
        working_hours: 0.0,
        status: AttendanceStatus::InProgress,
    })
}

pub fn punch_out(record: &mut AttendanceRecord, punch: Punch) -> Result<(), AttendanceError> {
    let Some(punch_in) = record.punch_in.as_ref() else {
        return Err(AttendanceError::NotPunchedIn {
            staff_id: record.staff_id.clone(),
            date: record.date,
        });
    };
    if record.is_closed() {
        return Err(AttendanceError::AlreadyClosed {
            staff_id: record.staff_id.clone(),
            date: record.date,
        });
    }
    if punch.time < punch_in.time {
        return Err(AttendanceError::OutBeforeIn {
            punch_in: punch_in.time,
            out: punch.time,
        });
    }
    record.working_hours = working_hours(punch_in.time, punch.time);
    record.punch_out = Some(punch);
    record.status = AttendanceStatus::Present;
    Ok(())
}

/// Marks a day without punches as absent or on leave. Re-marking an unpunched
/// day replaces the previous mark.
pub fn mark_day(
    existing: Option<AttendanceRecord>,
    id: String,
    staff_id: &str,
    date: NaiveDate,
    status: AttendanceStatus,
) -> Result<AttendanceRecord, AttendanceError> {
    if !matches!(status, AttendanceStatus::Absent | AttendanceStatus::Leave) {
        return Err(AttendanceError::NotADayMark(status.as_str()));
    }
    match existing {
        Some(rec) if rec.punch_in.is_some() => Err(AttendanceError::DayMarked(rec.status.as_str())),
        Some(mut rec) => {
            rec.status = status;
            Ok(rec)
        }
        None => Ok(AttendanceRecord {
            id,
            staff_id: staff_id.to_string(),
            date,
            punch_in: None,
            punch_out: None,
            working_hours: 0.0,
            status,
        }),
    }
}

/// Closes every record of `today` that has a punch-in and no punch-out at
/// `cutoff`, returning only the records that changed. The punch-in location
/// is carried over since no new sample is taken.
pub fn auto_punch_out(
    records: &[AttendanceRecord],
    today: NaiveDate,
    cutoff: NaiveTime,
) -> Vec<AttendanceRecord> {
    records
        .iter()
        .filter(|r| r.date == today && r.is_open())
        .filter_map(|r| {
            let punch_in = r.punch_in.as_ref()?;
            let mut closed = r.clone();
            closed.working_hours = working_hours(punch_in.time, cutoff);
            closed.punch_out = Some(Punch {
                time: cutoff,
                location: punch_in.location.clone(),
            });
            closed.status = AttendanceStatus::AutoPunchedOut;
            Some(closed)
        })
        .collect()
}
