use crate::attendance::{self, hhmm, AttendanceError};
use crate::attendance_store::{AttendanceStore, SqliteAttendanceStore};
use crate::db;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock; cutoffs are configured in local time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoPunchOutConfig {
    pub cutoff: NaiveTime,
    pub poll_interval: Duration,
}

/// One auto punch-out pass for `today`: close every open record at `cutoff`
/// and persist the closed ones. Returns how many records were closed.
pub fn run_pass(
    store: &dyn AttendanceStore,
    today: NaiveDate,
    cutoff: NaiveTime,
) -> anyhow::Result<usize> {
    let open = store.open_records_for_day(today)?;
    let mut saved = 0;
    for rec in attendance::auto_punch_out(&open, today, cutoff) {
        match store.save(&rec) {
            Ok(()) => saved += 1,
            // Punched out by hand after the open rows were read.
            Err(e) if e.is::<AttendanceError>() => {
                debug!(staff_id = %rec.staff_id, "record already closed, skipped")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(saved)
}

/// Fires a pass on the first tick at or after the cutoff, at most once per
/// calendar day. A tick that lands after the cutoff minute still catches up
/// the same day.
pub struct AutoPunchOutJob {
    cutoff: NaiveTime,
    last_run: Option<NaiveDate>,
}

impl AutoPunchOutJob {
    pub fn new(cutoff: NaiveTime) -> Self {
        Self {
            cutoff,
            last_run: None,
        }
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        now.time() >= self.cutoff && self.last_run != Some(now.date())
    }

    pub fn tick(
        &mut self,
        now: NaiveDateTime,
        store: &dyn AttendanceStore,
    ) -> anyhow::Result<Option<usize>> {
        if !self.is_due(now) {
            return Ok(None);
        }
        let today = now.date();
        let closed = run_pass(store, today, self.cutoff)?;
        self.last_run = Some(today);
        Ok(Some(closed))
    }
}

/// Owns the polling thread. Dropping the handle stops the thread.
pub struct AutoPunchOutScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AutoPunchOutScheduler {
    pub fn start(
        workspace: PathBuf,
        config: AutoPunchOutConfig,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let conn = db::open_db(&workspace)?;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("auto-punch-out".to_string())
            .spawn(move || {
                let store = SqliteAttendanceStore::new(&conn);
                let mut job = AutoPunchOutJob::new(config.cutoff);
                info!(
                    cutoff = %hhmm::format(config.cutoff),
                    poll_secs = config.poll_interval.as_secs_f64(),
                    "auto punch-out scheduler started"
                );
                loop {
                    match stop_rx.recv_timeout(config.poll_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let now = clock.now();
                    match job.tick(now, &store) {
                        Ok(Some(closed)) => info!(%now, closed, "auto punch-out pass complete"),
                        Ok(None) => debug!(%now, "auto punch-out tick"),
                        Err(e) => warn!(%now, error = %e, "auto punch-out pass failed"),
                    }
                }
                info!("auto punch-out scheduler stopped");
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AutoPunchOutScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::{AttendanceRecord, AttendanceStatus, Punch};
    use std::cell::RefCell;
    use std::sync::Mutex;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    struct MemoryStore {
        records: RefCell<Vec<AttendanceRecord>>,
        saves: RefCell<usize>,
    }

    impl MemoryStore {
        fn new(records: Vec<AttendanceRecord>) -> Self {
            Self {
                records: RefCell::new(records),
                saves: RefCell::new(0),
            }
        }
    }

    impl AttendanceStore for MemoryStore {
        fn open_records_for_day(&self, date: NaiveDate) -> anyhow::Result<Vec<AttendanceRecord>> {
            Ok(self
                .records
                .borrow()
                .iter()
                .filter(|r| r.date == date && r.is_open())
                .cloned()
                .collect())
        }

        fn save(&self, record: &AttendanceRecord) -> anyhow::Result<()> {
            *self.saves.borrow_mut() += 1;
            let mut records = self.records.borrow_mut();
            if let Some(slot) = records.iter_mut().find(|r| r.id == record.id) {
                *slot = record.clone();
            }
            Ok(())
        }
    }

    /// Every save loses to a punch-out that landed first.
    struct ClosedElsewhere(MemoryStore);

    impl AttendanceStore for ClosedElsewhere {
        fn open_records_for_day(&self, date: NaiveDate) -> anyhow::Result<Vec<AttendanceRecord>> {
            self.0.open_records_for_day(date)
        }

        fn save(&self, record: &AttendanceRecord) -> anyhow::Result<()> {
            Err(AttendanceError::AlreadyClosed {
                staff_id: record.staff_id.clone(),
                date: record.date,
            }
            .into())
        }
    }

    struct FixedClock(Mutex<NaiveDateTime>);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            *self.0.lock().expect("clock lock")
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn at(d: &str, t: &str) -> NaiveDateTime {
        date(d).and_time(hhmm::parse(t).expect("time"))
    }

    fn open_record(id: &str, d: &str, t: &str) -> AttendanceRecord {
        AttendanceRecord {
            id: id.to_string(),
            staff_id: format!("staff-{}", id),
            date: date(d),
            punch_in: Some(Punch {
                time: hhmm::parse(t).expect("time"),
                location: None,
            }),
            punch_out: None,
            working_hours: 0.0,
            status: AttendanceStatus::InProgress,
        }
    }

    #[test]
    fn tick_is_noop_before_cutoff() {
        let store = MemoryStore::new(vec![open_record("a", "2024-03-04", "09:00")]);
        let mut job = AutoPunchOutJob::new(hhmm::parse("22:00").expect("cutoff"));
        assert_eq!(job.tick(at("2024-03-04", "08:00"), &store).expect("tick"), None);
        assert_eq!(job.tick(at("2024-03-04", "21:59"), &store).expect("tick"), None);
        assert_eq!(*store.saves.borrow(), 0);
    }

    #[test]
    fn drifted_tick_past_cutoff_minute_still_fires() {
        let store = MemoryStore::new(vec![open_record("a", "2024-03-04", "09:00")]);
        let mut job = AutoPunchOutJob::new(hhmm::parse("22:00").expect("cutoff"));
        let before = date("2024-03-04")
            .and_hms_milli_opt(21, 59, 59, 900)
            .expect("time");
        assert_eq!(job.tick(before, &store).expect("tick"), None);
        assert_eq!(job.tick(at("2024-03-04", "22:01"), &store).expect("tick"), Some(1));
        assert_eq!(job.tick(at("2024-03-04", "22:02"), &store).expect("tick"), None);

        let records = store.records.borrow();
        assert_eq!(records[0].status, AttendanceStatus::AutoPunchedOut);
        assert_eq!(records[0].working_hours, 13.0);
    }

    #[test]
    fn hourly_polling_fires_once_after_cutoff() {
        let job_cutoff = hhmm::parse("22:00").expect("cutoff");
        let mut job = AutoPunchOutJob::new(job_cutoff);
        let store = MemoryStore::new(vec![open_record("a", "2024-03-04", "09:00")]);
        let mut fired = Vec::new();
        for hour in 0..24 {
            let now = date("2024-03-04").and_hms_opt(hour, 30, 0).expect("time");
            if job.tick(now, &store).expect("tick").is_some() {
                fired.push(hour);
            }
        }
        assert_eq!(fired, vec![22]);
    }

    #[test]
    fn tick_fires_once_per_day() {
        let store = MemoryStore::new(vec![
            open_record("a", "2024-03-04", "09:00"),
            open_record("b", "2024-03-04", "10:30"),
            open_record("c", "2024-03-03", "09:00"),
        ]);
        let mut job = AutoPunchOutJob::new(hhmm::parse("22:00").expect("cutoff"));

        let first = job.tick(at("2024-03-04", "22:00"), &store).expect("tick");
        assert_eq!(first, Some(2));
        let again = job.tick(
            date("2024-03-04").and_hms_opt(22, 0, 30).expect("time"),
            &store,
        );
        assert_eq!(again.expect("tick"), None);

        let records = store.records.borrow();
        assert_eq!(records[0].status, AttendanceStatus::AutoPunchedOut);
        assert_eq!(records[0].working_hours, 13.0);
        assert_eq!(records[1].working_hours, 11.5);
        assert!(records[2].is_open(), "previous day is left alone");
    }

    #[test]
    fn tick_fires_again_next_day() {
        let store = MemoryStore::new(vec![
            open_record("a", "2024-03-04", "09:00"),
            open_record("b", "2024-03-05", "09:00"),
        ]);
        let mut job = AutoPunchOutJob::new(hhmm::parse("15:25").expect("cutoff"));
        assert_eq!(job.tick(at("2024-03-04", "15:25"), &store).expect("tick"), Some(1));
        assert_eq!(job.tick(at("2024-03-05", "15:25"), &store).expect("tick"), Some(1));
        assert_eq!(store.records.borrow()[1].working_hours, 6.42);
    }

    #[test]
    fn pass_skips_records_closed_by_another_writer() {
        let store = ClosedElsewhere(MemoryStore::new(vec![
            open_record("a", "2024-03-04", "09:00"),
            open_record("b", "2024-03-04", "10:00"),
        ]));
        let closed = run_pass(&store, date("2024-03-04"), hhmm::parse("22:00").expect("cutoff"))
            .expect("pass");
        assert_eq!(closed, 0);
    }

    #[test]
    fn scheduler_thread_closes_open_records_and_stops() {
        let workspace = std::env::temp_dir().join(format!(
            "tutord-scheduler-{}",
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
        SqliteAttendanceStore::new(&conn)
            .save(&open_record("a", "2024-03-04", "09:00"))
            .expect("save");

        let clock = Arc::new(FixedClock(Mutex::new(at("2024-03-04", "22:00"))));
        let scheduler = AutoPunchOutScheduler::start(
            workspace.clone(),
            AutoPunchOutConfig {
                cutoff: hhmm::parse("22:00").expect("cutoff"),
                poll_interval: Duration::from_millis(10),
            },
            clock,
        )
        .expect("start scheduler");

        let store = SqliteAttendanceStore::new(&conn);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut closed = None;
        while Instant::now() < deadline {
            let rec = store
                .get("staff-a", date("2024-03-04"))
                .expect("get")
                .expect("record");
            if rec.is_closed() {
                closed = Some(rec);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        scheduler.stop();

        let rec = closed.expect("record closed by scheduler");
        assert_eq!(rec.status, AttendanceStatus::AutoPunchedOut);
        assert_eq!(rec.working_hours, 13.0);

        drop(conn);
        let _ = std::fs::remove_dir_all(workspace);
    }
}
