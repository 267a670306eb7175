use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

use crate::scheduler::{AutoPunchOutScheduler, Clock};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Option<AutoPunchOutScheduler>,
}

impl AppState {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            workspace: None,
            db: None,
            clock,
            scheduler: None,
        }
    }

    pub fn stop_scheduler(&mut self) {
        if let Some(s) = self.scheduler.take() {
            s.stop();
        }
    }
}
