//! rollcall-core: Attendance ledger and face template matching.
//!
//! Resolves captured feature vectors to enrolled users and classifies each
//! arrival as present, late or absent against a daily schedule.

pub mod attendance;
pub mod config;
pub mod matcher;
pub mod schedule;
pub mod store;
pub mod types;

pub use attendance::{AttendanceEngine, AttendanceError, CaptureOutcome, MarkOutcome, SweepSummary};
pub use config::{Config, ConfigError};
pub use matcher::{FaceMatcher, MatchResult, Matcher};
pub use schedule::{AttendanceSchedule, ScheduleError};
pub use store::{AttendanceStore, JsonFileStore, MemoryStore, StoreError};
pub use types::{
    AttendanceEntry, AttendanceRecord, AttendanceStatus, CaptureSample, DayReport, DayStatus,
    FaceTemplate,
    FeatureError, FeatureVector, User, UserEntry,
};
