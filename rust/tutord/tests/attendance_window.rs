#[path = "../src/attendance.rs"]
mod attendance;

use attendance::{AttendanceError, AttendanceRecord, AttendanceStatus, GeoLocation, Punch};
use chrono::{NaiveDate, NaiveTime};
use serde_json::json;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
}

fn office() -> GeoLocation {
    GeoLocation {
        latitude: 19.1197,
        longitude: 72.8468,
        address: Some("Andheri West".to_string()),
    }
}

fn open_record(id: &str, staff: &str, date: NaiveDate, at: NaiveTime) -> AttendanceRecord {
    attendance::punch_in(
        None,
        id.to_string(),
        staff,
        date,
        Punch {
            time: at,
            location: Some(office()),
        },
    )
    .expect("punch in")
}

#[test]
fn open_record_is_closed_at_cutoff() {
    let today = d(2024, 5, 6);
    let records = vec![open_record("a1", "s1", today, t(9, 0))];
    let closed = attendance::auto_punch_out(&records, today, t(22, 0));

    assert_eq!(closed.len(), 1);
    let rec = &closed[0];
    assert_eq!(rec.status, AttendanceStatus::AutoPunchedOut);
    assert_eq!(rec.working_hours, 13.0);
    let out = rec.punch_out.as_ref().expect("punch out");
    assert_eq!(out.time, t(22, 0));
    assert_eq!(out.location, Some(office()));
    assert!(rec.is_closed());
}

#[test]
fn second_pass_finds_nothing() {
    let today = d(2024, 5, 6);
    let records = vec![
        open_record("a1", "s1", today, t(9, 0)),
        open_record("a2", "s2", today, t(10, 30)),
    ];
    let first = attendance::auto_punch_out(&records, today, t(22, 0));
    assert_eq!(first.len(), 2);
    assert_eq!(first[1].working_hours, 11.5);

    let second = attendance::auto_punch_out(&first, today, t(22, 0));
    assert!(second.is_empty());
}

#[test]
fn other_days_and_closed_records_are_untouched() {
    let today = d(2024, 5, 6);
    let mut finished = open_record("a1", "s1", today, t(9, 0));
    attendance::punch_out(
        &mut finished,
        Punch {
            time: t(17, 15),
            location: None,
        },
    )
    .expect("punch out");
    let yesterday = open_record("a2", "s2", d(2024, 5, 5), t(9, 0));
    let marked = attendance::mark_day(None, "a3".to_string(), "s3", today, AttendanceStatus::Leave)
        .expect("mark leave");

    let closed = attendance::auto_punch_out(&[finished.clone(), yesterday, marked], today, t(22, 0));
    assert!(closed.is_empty());
    assert_eq!(finished.status, AttendanceStatus::Present);
    assert_eq!(finished.working_hours, 8.25);
}

#[test]
fn missing_punch_in_location_stays_absent() {
    let today = d(2024, 5, 6);
    let rec = attendance::punch_in(
        None,
        "a1".to_string(),
        "s1",
        today,
        Punch {
            time: t(15, 0),
            location: None,
        },
    )
    .expect("punch in");
    let closed = attendance::auto_punch_out(&[rec], today, t(15, 25));
    assert_eq!(closed[0].punch_out.as_ref().and_then(|p| p.location.clone()), None);
    assert_eq!(closed[0].working_hours, 0.42);
}

#[test]
fn punch_in_after_cutoff_counts_zero_hours() {
    assert_eq!(attendance::working_hours(t(22, 30), t(22, 0)), 0.0);
}

#[test]
fn transitions_are_guarded() {
    let today = d(2024, 5, 6);
    let mut rec = open_record("a1", "s1", today, t(9, 0));

    let again = attendance::punch_in(
        Some(&rec),
        "a2".to_string(),
        "s1",
        today,
        Punch {
            time: t(9, 5),
            location: None,
        },
    );
    assert!(matches!(again, Err(AttendanceError::AlreadyPunchedIn { .. })));

    let early = attendance::punch_out(
        &mut rec,
        Punch {
            time: t(8, 0),
            location: None,
        },
    );
    assert!(matches!(early, Err(AttendanceError::OutBeforeIn { .. })));

    attendance::punch_out(
        &mut rec,
        Punch {
            time: t(18, 0),
            location: None,
        },
    )
    .expect("punch out");
    let twice = attendance::punch_out(
        &mut rec,
        Punch {
            time: t(19, 0),
            location: None,
        },
    );
    assert!(matches!(twice, Err(AttendanceError::AlreadyClosed { .. })));
    assert_eq!(rec.working_hours, 9.0);

    let marked = attendance::mark_day(Some(rec), "a3".to_string(), "s1", today, AttendanceStatus::Absent);
    assert!(matches!(marked, Err(AttendanceError::DayMarked("present"))));

    let bad = attendance::mark_day(None, "a4".to_string(), "s1", today, AttendanceStatus::Present);
    assert!(matches!(bad, Err(AttendanceError::NotADayMark("present"))));
}

#[test]
fn marked_day_blocks_punch_in() {
    let today = d(2024, 5, 6);
    let leave = attendance::mark_day(None, "a1".to_string(), "s1", today, AttendanceStatus::Leave)
        .expect("mark leave");
    let res = attendance::punch_in(
        Some(&leave),
        "a2".to_string(),
        "s1",
        today,
        Punch {
            time: t(9, 0),
            location: None,
        },
    );
    assert!(matches!(res, Err(AttendanceError::DayMarked("leave"))));

    let absent = attendance::mark_day(Some(leave), "a3".to_string(), "s1", today, AttendanceStatus::Absent)
        .expect("re-mark");
    assert_eq!(absent.id, "a1");
    assert_eq!(absent.status, AttendanceStatus::Absent);
}

#[test]
fn record_json_uses_hh_mm_times() {
    let rec = open_record("a1", "s1", d(2024, 5, 6), t(9, 0));
    let v = serde_json::to_value(&rec).expect("serialize");
    assert_eq!(v["punchIn"]["time"], json!("09:00"));
    assert_eq!(v["status"], json!("inprogress"));
    assert_eq!(v["date"], json!("2024-05-06"));

    let punch: Punch = serde_json::from_value(json!({ "time": "07:45:30" })).expect("punch");
    assert_eq!(punch.time, NaiveTime::from_hms_opt(7, 45, 30).expect("time"));
}
