pub mod academics;
pub mod attendance;
pub mod backup;
pub mod core;
pub mod documents;
pub mod fees;
pub mod setup;
pub mod staff;
pub mod students;
