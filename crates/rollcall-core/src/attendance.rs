//! Daily attendance ledger.
//!
//! Owns the roster and the append-only record list, derives a status from
//! each arrival time, and keeps at most one record per user per local day.
//! Every mutation is staged on copies and persisted before it is committed
//! in memory, so a failed save leaves the engine unchanged.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::matcher::{FaceMatcher, MatchResult, Matcher, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::schedule::AttendanceSchedule;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{
    AttendanceEntry, AttendanceRecord, AttendanceStatus, CaptureSample, DayReport, DayStatus,
    FaceTemplate, User, UserEntry,
};

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("user {0} is unknown or dropped")]
    UserNotEligible(String),
    #[error("user {0} not found")]
    UnknownUser(String),
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("invalid user id {0:?}")]
    InvalidUserId(String),
    #[error("capture sample contains no face")]
    NoFace,
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// Result of a successful `mark_attendance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new record was appended.
    Recorded {
        status: AttendanceStatus,
        /// The absence that came with this record dropped the user.
        dropped: bool,
    },
    /// The user already had a record for that day; nothing changed.
    AlreadyMarked(AttendanceStatus),
}

/// Result of feeding one capture through identification and marking.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Unrecognized,
    Marked { user_id: String, outcome: MarkOutcome },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Users given a synthetic absence, in roster order.
    pub marked_absent: Vec<String>,
    /// Subset of `marked_absent` dropped by that absence.
    pub dropped: Vec<String>,
}

pub struct AttendanceEngine<S> {
    store: S,
    schedule: AttendanceSchedule,
    matcher: FaceMatcher,
    confidence_threshold: f32,
    users: Vec<User>,
    records: Vec<AttendanceRecord>,
}

impl<S: AttendanceStore> AttendanceEngine<S> {
    /// Load the roster and ledger from `store`.
    pub fn open(store: S, schedule: AttendanceSchedule) -> Result<Self, AttendanceError> {
        let users = store.load_users()?;
        let records = store.load_records()?;
        tracing::info!(
            users = users.len(),
            records = records.len(),
            "attendance ledger loaded"
        );
        Ok(Self {
            store,
            schedule,
            matcher: FaceMatcher::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            users,
            records,
        })
    }

    pub fn with_matcher(mut self, matcher: FaceMatcher, confidence_threshold: f32) -> Self {
        self.matcher = matcher;
        self.confidence_threshold = confidence_threshold;
        self
    }

    pub fn schedule(&self) -> &AttendanceSchedule {
        &self.schedule
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == user_id)
    }

    fn user_index(&self, user_id: &str) -> Option<usize> {
        self.users.iter().position(|u| u.id == user_id)
    }

    fn record_on(&self, user_id: &str, day: NaiveDate) -> Option<&AttendanceRecord> {
        self.records
            .iter()
            .find(|r| r.user_id == user_id && self.schedule.local_day(r.timestamp) == day)
    }

    /// Persist the staged collections, then swap them in.
    ///
    /// If the ledger save fails after the roster save succeeded, the previous
    /// roster is written back before the error is returned.
    fn commit(
        &mut self,
        users: Option<Vec<User>>,
        records: Option<Vec<AttendanceRecord>>,
    ) -> Result<(), AttendanceError> {
        if let Some(users) = &users {
            self.store.save_users(users)?;
        }
        if let Some(records) = &records {
            if let Err(err) = self.store.save_records(records) {
                if users.is_some() {
                    if let Err(restore) = self.store.save_users(&self.users) {
                        tracing::error!(
                            error = %restore,
                            "failed to restore roster after ledger save failure; stored roster is ahead of ledger"
                        );
                    }
                }
                return Err(err.into());
            }
        }
        if let Some(users) = users {
            self.users = users;
        }
        if let Some(records) = records {
            self.records = records;
        }
        Ok(())
    }

    /// Count an absence against `user`, dropping them at the limit.
    /// Returns whether this absence dropped the user.
    fn accrue_absence(&self, user: &mut User) -> bool {
        user.absence_count = user.absence_count.saturating_add(1);
        if !user.is_dropped && user.absence_count >= self.schedule.max_absences_before_drop() {
            user.is_dropped = true;
            tracing::warn!(user = %user.id, absences = user.absence_count, "user dropped");
            return true;
        }
        false
    }

    /// Record an arrival for `user_id` at `at`.
    pub fn mark_attendance(
        &mut self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, AttendanceError> {
        let idx = match self.user_index(user_id) {
            Some(idx) if !self.users[idx].is_dropped => idx,
            _ => return Err(AttendanceError::UserNotEligible(user_id.to_string())),
        };

        let day = self.schedule.local_day(at);
        if let Some(existing) = self.record_on(user_id, day) {
            tracing::debug!(user = user_id, %day, status = %existing.status, "already marked today");
            return Ok(MarkOutcome::AlreadyMarked(existing.status));
        }

        let status = self.schedule.classify(at);
        let mut staged_users = None;
        let mut dropped = false;
        if status == AttendanceStatus::Absent {
            let mut users = self.users.clone();
            dropped = self.accrue_absence(&mut users[idx]);
            staged_users = Some(users);
        }

        let mut records = self.records.clone();
        records.push(AttendanceRecord {
            user_id: user_id.to_string(),
            timestamp: at,
            status,
        });
        self.commit(staged_users, Some(records))?;

        tracing::info!(user = user_id, %status, dropped, "attendance marked");
        Ok(MarkOutcome::Recorded { status, dropped })
    }

    /// Give every non-dropped user without a record today a synthetic absence,
    /// once `now` is past the absence threshold. Persists once for the batch.
    pub fn process_scheduled_status_changes(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<SweepSummary, AttendanceError> {
        let mut summary = SweepSummary::default();
        if !self.schedule.absence_window_closed(now) {
            return Ok(summary);
        }

        let day = self.schedule.local_day(now);
        let mut users = self.users.clone();
        let mut records = self.records.clone();

        for user in users.iter_mut() {
            if user.is_dropped || self.record_on(&user.id, day).is_some() {
                continue;
            }
            records.push(AttendanceRecord {
                user_id: user.id.clone(),
                timestamp: now,
                status: AttendanceStatus::Absent,
            });
            if self.accrue_absence(user) {
                summary.dropped.push(user.id.clone());
            }
            summary.marked_absent.push(user.id.clone());
        }

        if summary.marked_absent.is_empty() {
            return Ok(summary);
        }

        self.commit(Some(users), Some(records))?;
        tracing::info!(
            %day,
            absent = summary.marked_absent.len(),
            dropped = summary.dropped.len(),
            "absence sweep applied"
        );
        Ok(summary)
    }

    /// Recorded status for `user_id` on local day `date`.
    pub fn status(&self, user_id: &str, date: NaiveDate) -> DayStatus {
        match self.record_on(user_id, date) {
            Some(record) => DayStatus::Marked(record.status),
            None => DayStatus::NoRecord,
        }
    }

    /// Templates of all non-dropped users, in roster order, plus the number
    /// of users whose template could not be loaded. Those users are left out
    /// so one bad template does not block identification of everyone else.
    fn gallery(&self) -> (Vec<FaceTemplate>, usize) {
        let mut gallery = Vec::new();
        let mut unreadable = 0;
        for user in self.users.iter().filter(|u| !u.is_dropped) {
            match self.store.load_template(&user.id) {
                Ok(Some(template)) => gallery.push(template),
                Ok(None) => {}
                Err(err) => {
                    unreadable += 1;
                    tracing::warn!(user = %user.id, error = %err, "skipping unreadable template");
                }
            }
        }
        (gallery, unreadable)
    }

    /// Match `sample` against the enrolled, non-dropped users.
    pub fn match_sample(&self, sample: &CaptureSample) -> Result<MatchResult, AttendanceError> {
        let (gallery, unreadable) = self.gallery();
        let mut result = self
            .matcher
            .compare(sample, &gallery, self.confidence_threshold);
        result.unreadable = unreadable;
        tracing::debug!(
            matched = result.matched,
            similarity = result.similarity,
            compared = result.compared,
            skipped = result.skipped,
            unreadable,
            "sample matched against gallery"
        );
        Ok(result)
    }

    /// Resolve `sample` to a user id.
    pub fn identify(&self, sample: &CaptureSample) -> Result<Option<String>, AttendanceError> {
        Ok(self.match_sample(sample)?.owner_id)
    }

    /// Identify `sample` and mark the matched user as arrived at `at`.
    pub fn handle_capture(
        &mut self,
        sample: &CaptureSample,
        at: DateTime<Utc>,
    ) -> Result<CaptureOutcome, AttendanceError> {
        let Some(user_id) = self.identify(sample)? else {
            return Ok(CaptureOutcome::Unrecognized);
        };
        let outcome = self.mark_attendance(&user_id, at)?;
        Ok(CaptureOutcome::Marked { user_id, outcome })
    }

    pub fn add_user(&mut self, user_id: &str, name: &str) -> Result<(), AttendanceError> {
        if !User::is_valid_id(user_id) {
            return Err(AttendanceError::InvalidUserId(user_id.to_string()));
        }
        if self.user(user_id).is_some() {
            return Err(AttendanceError::UserExists(user_id.to_string()));
        }
        let mut users = self.users.clone();
        users.push(User::new(user_id, name));
        self.commit(Some(users), None)?;
        tracing::info!(user = user_id, name, "user added");
        Ok(())
    }

    /// Remove a user and their template. Their records stay in the ledger.
    pub fn remove_user(&mut self, user_id: &str) -> Result<(), AttendanceError> {
        let idx = self
            .user_index(user_id)
            .ok_or_else(|| AttendanceError::UnknownUser(user_id.to_string()))?;
        let mut users = self.users.clone();
        users.remove(idx);
        self.commit(Some(users), None)?;
        if let Err(err) = self.store.delete_template(user_id) {
            tracing::warn!(user = user_id, error = %err, "user removed but template left behind");
        }
        tracing::info!(user = user_id, "user removed");
        Ok(())
    }

    /// Store `sample` as the face template of an existing user.
    pub fn enroll_template(
        &mut self,
        user_id: &str,
        sample: &CaptureSample,
    ) -> Result<(), AttendanceError> {
        if self.user(user_id).is_none() {
            return Err(AttendanceError::UnknownUser(user_id.to_string()));
        }
        if !sample.detected || sample.features.is_empty() {
            return Err(AttendanceError::NoFace);
        }
        self.store
            .save_template(&FaceTemplate::from_sample(user_id, sample))?;
        tracing::info!(
            user = user_id,
            dims = sample.features.len(),
            confidence = sample.confidence,
            "face template enrolled"
        );
        Ok(())
    }

    /// Administratively drop a user. A `Dropped` record is written for the
    /// day of `at` unless that day already has one.
    pub fn drop_user(&mut self, user_id: &str, at: DateTime<Utc>) -> Result<(), AttendanceError> {
        let idx = self
            .user_index(user_id)
            .ok_or_else(|| AttendanceError::UnknownUser(user_id.to_string()))?;
        if self.users[idx].is_dropped {
            return Ok(());
        }
        let mut users = self.users.clone();
        users[idx].is_dropped = true;

        let day = self.schedule.local_day(at);
        let records = if self.record_on(user_id, day).is_none() {
            let mut records = self.records.clone();
            records.push(AttendanceRecord {
                user_id: user_id.to_string(),
                timestamp: at,
                status: AttendanceStatus::Dropped,
            });
            Some(records)
        } else {
            None
        };
        self.commit(Some(users), records)?;
        tracing::warn!(user = user_id, "user dropped by administrator");
        Ok(())
    }

    /// Clear the drop flag and absence count of a user.
    pub fn reinstate_user(&mut self, user_id: &str) -> Result<(), AttendanceError> {
        let idx = self
            .user_index(user_id)
            .ok_or_else(|| AttendanceError::UnknownUser(user_id.to_string()))?;
        let mut users = self.users.clone();
        users[idx].is_dropped = false;
        users[idx].absence_count = 0;
        self.commit(Some(users), None)?;
        tracing::info!(user = user_id, "user reinstated");
        Ok(())
    }

    /// Zero the absence count of one user, or of everyone when `None`.
    pub fn reset_absences(&mut self, user_id: Option<&str>) -> Result<(), AttendanceError> {
        let mut users = self.users.clone();
        match user_id {
            Some(id) => {
                let idx = self
                    .user_index(id)
                    .ok_or_else(|| AttendanceError::UnknownUser(id.to_string()))?;
                users[idx].absence_count = 0;
            }
            None => users.iter_mut().for_each(|u| u.absence_count = 0),
        }
        self.commit(Some(users), None)?;
        tracing::info!(user = user_id.unwrap_or("*"), "absence counts reset");
        Ok(())
    }

    /// Records of local day `date`, in ledger order.
    pub fn records_on(&self, date: NaiveDate) -> Vec<&AttendanceRecord> {
        self.records
            .iter()
            .filter(|r| self.schedule.local_day(r.timestamp) == date)
            .collect()
    }

    /// Records whose local day falls in `from..=to`, in ledger order.
    pub fn records_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<&AttendanceRecord> {
        self.records
            .iter()
            .filter(|r| (from..=to).contains(&self.schedule.local_day(r.timestamp)))
            .collect()
    }

    /// Status counts for local day `date`. `unmarked` counts non-dropped
    /// users without a record that day.
    pub fn day_report(&self, date: NaiveDate) -> DayReport {
        let mut report = DayReport::new(date);
        for record in self.records_on(date) {
            report.count(record.status);
        }
        report.unmarked = self
            .users
            .iter()
            .filter(|u| !u.is_dropped && self.record_on(&u.id, date).is_none())
            .count();
        report
    }

    fn entry(&self, record: &AttendanceRecord) -> AttendanceEntry {
        AttendanceEntry {
            user_id: record.user_id.clone(),
            name: self.user(&record.user_id).map(|u| u.name.clone()).unwrap_or_default(),
            timestamp: record.timestamp,
            status: record.status,
        }
    }

    /// Ledger rows joined with user names, in ledger order.
    pub fn attendance_entries(&self) -> Vec<AttendanceEntry> {
        self.records.iter().map(|r| self.entry(r)).collect()
    }

    /// Ledger rows of local days `from..=to`, in ledger order.
    pub fn attendance_entries_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<AttendanceEntry> {
        self.records_between(from, to)
            .into_iter()
            .map(|r| self.entry(r))
            .collect()
    }

    /// Roster rows, in roster order.
    pub fn user_entries(&self) -> Vec<UserEntry> {
        self.users.iter().map(UserEntry::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonFileStore, MemoryStore};
    use crate::types::FeatureVector;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, h, m, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn engine(ids: &[&str]) -> AttendanceEngine<MemoryStore> {
        let users = ids.iter().map(|id| User::new(*id, id.to_uppercase())).collect();
        AttendanceEngine::open(MemoryStore::with_users(users), AttendanceSchedule::default()).unwrap()
    }

    /// Store whose saves can be made to fail on demand.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_users: bool,
        fail_records: bool,
        broken_template: Option<String>,
    }

    impl AttendanceStore for FlakyStore {
        fn load_users(&self) -> Result<Vec<User>, StoreError> {
            self.inner.load_users()
        }
        fn save_users(&mut self, users: &[User]) -> Result<(), StoreError> {
            if self.fail_users {
                return Err(StoreError::Unavailable("users".into()));
            }
            self.inner.save_users(users)
        }
        fn load_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
            self.inner.load_records()
        }
        fn save_records(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
            if self.fail_records {
                return Err(StoreError::Unavailable("records".into()));
            }
            self.inner.save_records(records)
        }
        fn load_template(&self, user_id: &str) -> Result<Option<FaceTemplate>, StoreError> {
            if self.broken_template.as_deref() == Some(user_id) {
                return Err(StoreError::Unavailable(format!("template {user_id}")));
            }
            self.inner.load_template(user_id)
        }
        fn save_template(&mut self, template: &FaceTemplate) -> Result<(), StoreError> {
            self.inner.save_template(template)
        }
        fn delete_template(&mut self, user_id: &str) -> Result<(), StoreError> {
            self.inner.delete_template(user_id)
        }
    }

    #[test]
    fn test_scenario_a_statuses() {
        let mut e = engine(&["a", "b", "c"]);
        assert_eq!(
            e.mark_attendance("a", at(4, 8, 10)).unwrap(),
            MarkOutcome::Recorded { status: AttendanceStatus::Present, dropped: false }
        );
        assert_eq!(
            e.mark_attendance("b", at(4, 8, 20)).unwrap(),
            MarkOutcome::Recorded { status: AttendanceStatus::Late, dropped: false }
        );
        assert_eq!(
            e.mark_attendance("c", at(4, 8, 35)).unwrap(),
            MarkOutcome::Recorded { status: AttendanceStatus::Absent, dropped: false }
        );
        assert_eq!(e.user("a").unwrap().absence_count, 0);
        assert_eq!(e.user("b").unwrap().absence_count, 0);
        assert_eq!(e.user("c").unwrap().absence_count, 1);
        assert_eq!(e.store().records.len(), 3);
        assert_eq!(e.store().users[2].absence_count, 1);
    }

    #[test]
    fn test_same_day_marking_is_idempotent() {
        let mut e = engine(&["a"]);
        e.mark_attendance("a", at(4, 8, 5)).unwrap();
        assert_eq!(
            e.mark_attendance("a", at(4, 9, 45)).unwrap(),
            MarkOutcome::AlreadyMarked(AttendanceStatus::Present)
        );
        assert_eq!(e.records().len(), 1);
        assert_eq!(e.status("a", date(4)), DayStatus::Marked(AttendanceStatus::Present));
        assert_eq!(e.user("a").unwrap().absence_count, 0);
    }

    #[test]
    fn test_unknown_user_rejected() {
        let mut e = engine(&["a"]);
        assert!(matches!(
            e.mark_attendance("ghost", at(4, 8, 0)),
            Err(AttendanceError::UserNotEligible(id)) if id == "ghost"
        ));
        assert!(e.records().is_empty());
    }

    #[test]
    fn test_drop_after_max_absences() {
        let mut e = engine(&["a"]);
        for day in 4..6 {
            assert_eq!(
                e.mark_attendance("a", at(day, 9, 0)).unwrap(),
                MarkOutcome::Recorded { status: AttendanceStatus::Absent, dropped: false }
            );
        }
        assert_eq!(
            e.mark_attendance("a", at(6, 9, 0)).unwrap(),
            MarkOutcome::Recorded { status: AttendanceStatus::Absent, dropped: true }
        );
        let user = e.user("a").unwrap();
        assert_eq!(user.absence_count, 3);
        assert!(user.is_dropped);
        assert!(matches!(
            e.mark_attendance("a", at(7, 8, 0)),
            Err(AttendanceError::UserNotEligible(_))
        ));
    }

    #[test]
    fn test_dropped_user_not_identified() {
        let mut e = engine(&["a"]);
        let sample = CaptureSample::detected(FeatureVector::new(vec![1.0, 2.0]), 0.9);
        e.enroll_template("a", &sample).unwrap();
        assert_eq!(e.identify(&sample).unwrap().as_deref(), Some("a"));

        for day in 4..7 {
            e.mark_attendance("a", at(day, 10, 0)).unwrap();
        }
        assert!(e.user("a").unwrap().is_dropped);
        assert_eq!(e.identify(&sample).unwrap(), None);
    }

    #[test]
    fn test_scenario_b_sweep() {
        let mut e = engine(&["a", "b", "c"]);
        e.mark_attendance("b", at(4, 8, 2)).unwrap();

        let summary = e.process_scheduled_status_changes(at(4, 8, 31)).unwrap();
        assert_eq!(summary.marked_absent, vec!["a".to_string(), "c".to_string()]);
        assert!(summary.dropped.is_empty());
        assert_eq!(e.records().len(), 3);
        assert_eq!(e.status("a", date(4)), DayStatus::Marked(AttendanceStatus::Absent));
        assert_eq!(e.status("b", date(4)), DayStatus::Marked(AttendanceStatus::Present));
        assert_eq!(e.status("c", date(4)), DayStatus::Marked(AttendanceStatus::Absent));
        assert_eq!(e.user("a").unwrap().absence_count, 1);
        assert_eq!(e.user("b").unwrap().absence_count, 0);
        assert_eq!(e.user("c").unwrap().absence_count, 1);
    }

    #[test]
    fn test_sweep_before_window_closes_does_nothing() {
        let mut e = engine(&["a"]);
        let summary = e.process_scheduled_status_changes(at(4, 8, 30)).unwrap();
        assert!(summary.marked_absent.is_empty());
        assert!(e.records().is_empty());
    }

    #[test]
    fn test_sweep_is_idempotent_within_day() {
        let mut e = engine(&["a", "b"]);
        e.process_scheduled_status_changes(at(4, 9, 0)).unwrap();
        let again = e.process_scheduled_status_changes(at(4, 10, 0)).unwrap();
        assert!(again.marked_absent.is_empty());
        assert_eq!(e.records().len(), 2);
        assert_eq!(e.user("a").unwrap().absence_count, 1);
    }

    #[test]
    fn test_sweep_skips_dropped_and_drops_at_limit() {
        let mut e = engine(&["a", "b"]);
        e.drop_user("b", at(3, 12, 0)).unwrap();
        for day in 4..7 {
            e.process_scheduled_status_changes(at(day, 9, 0)).unwrap();
        }
        assert!(e.user("a").unwrap().is_dropped);
        assert_eq!(e.user("a").unwrap().absence_count, 3);
        assert_eq!(e.user("b").unwrap().absence_count, 0);
        // Dropped users accrue nothing further.
        let summary = e.process_scheduled_status_changes(at(7, 9, 0)).unwrap();
        assert!(summary.marked_absent.is_empty());
    }

    #[test]
    fn test_arrival_after_sweep_is_noop() {
        let mut e = engine(&["a"]);
        e.process_scheduled_status_changes(at(4, 8, 45)).unwrap();
        assert_eq!(
            e.mark_attendance("a", at(4, 8, 50)).unwrap(),
            MarkOutcome::AlreadyMarked(AttendanceStatus::Absent)
        );
        assert_eq!(e.user("a").unwrap().absence_count, 1);
    }

    #[test]
    fn test_status_no_record() {
        let mut e = engine(&["a"]);
        assert_eq!(e.status("a", date(4)), DayStatus::NoRecord);
        e.mark_attendance("a", at(4, 8, 0)).unwrap();
        assert_eq!(e.status("a", date(5)), DayStatus::NoRecord);
        assert_eq!(e.status("ghost", date(4)), DayStatus::NoRecord);
    }

    #[test]
    fn test_handle_capture_marks_matched_user() {
        let mut e = engine(&["a", "b"]);
        e.enroll_template("a", &CaptureSample::detected(FeatureVector::new(vec![0.0, 0.0]), 0.9))
            .unwrap();
        e.enroll_template("b", &CaptureSample::detected(FeatureVector::new(vec![50.0, 0.0]), 0.9))
            .unwrap();

        let capture = CaptureSample::detected(FeatureVector::new(vec![48.0, 1.0]), 0.95);
        let outcome = e.handle_capture(&capture, at(4, 8, 20)).unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Marked {
                user_id: "b".into(),
                outcome: MarkOutcome::Recorded { status: AttendanceStatus::Late, dropped: false },
            }
        );

        let weak = CaptureSample::detected(FeatureVector::new(vec![0.0, 0.0]), 0.3);
        assert_eq!(e.handle_capture(&weak, at(4, 8, 21)).unwrap(), CaptureOutcome::Unrecognized);
    }

    #[test]
    fn test_records_save_failure_leaves_state_untouched() {
        let store = FlakyStore {
            inner: MemoryStore::with_users(vec![User::new("a", "A")]),
            fail_records: true,
            ..Default::default()
        };
        let mut e = AttendanceEngine::open(store, AttendanceSchedule::default()).unwrap();
        let err = e.mark_attendance("a", at(4, 9, 0)).unwrap_err();
        assert!(matches!(err, AttendanceError::Persistence(_)));
        assert!(e.records().is_empty());
        assert_eq!(e.user("a").unwrap().absence_count, 0);
        // Roster was written back to its previous state.
        assert_eq!(e.store().inner.users[0].absence_count, 0);
    }

    #[test]
    fn test_users_save_failure_reported() {
        let store = FlakyStore {
            inner: MemoryStore::with_users(vec![User::new("a", "A"), User::new("b", "B")]),
            fail_users: true,
            ..Default::default()
        };
        let mut e = AttendanceEngine::open(store, AttendanceSchedule::default()).unwrap();
        assert!(e.process_scheduled_status_changes(at(4, 9, 0)).is_err());
        assert!(e.records().is_empty());
        assert!(e.store().inner.records.is_empty());
        // A present arrival touches only the ledger.
        assert!(e.mark_attendance("a", at(5, 8, 0)).is_ok());
    }

    #[test]
    fn test_add_and_remove_user() {
        let mut e = engine(&[]);
        e.add_user("s1", "Linus").unwrap();
        assert!(matches!(e.add_user("s1", "Again"), Err(AttendanceError::UserExists(_))));
        assert!(matches!(e.add_user(" ", "Blank"), Err(AttendanceError::InvalidUserId(_))));
        e.enroll_template("s1", &CaptureSample::detected(FeatureVector::new(vec![1.0]), 0.8))
            .unwrap();
        e.mark_attendance("s1", at(4, 8, 0)).unwrap();

        e.remove_user("s1").unwrap();
        assert!(e.user("s1").is_none());
        assert!(e.store().templates.is_empty());
        assert_eq!(e.records().len(), 1);
        assert_eq!(e.attendance_entries()[0].name, "");
        assert!(matches!(e.remove_user("s1"), Err(AttendanceError::UnknownUser(_))));
    }

    #[test]
    fn test_enroll_requires_face_and_user() {
        let mut e = engine(&["a"]);
        assert!(matches!(
            e.enroll_template("a", &CaptureSample::empty()),
            Err(AttendanceError::NoFace)
        ));
        let sample = CaptureSample::detected(FeatureVector::new(vec![1.0]), 0.9);
        assert!(matches!(
            e.enroll_template("ghost", &sample),
            Err(AttendanceError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_drop_user_writes_dropped_record_once() {
        let mut e = engine(&["a", "b"]);
        e.drop_user("a", at(4, 12, 0)).unwrap();
        assert_eq!(e.status("a", date(4)), DayStatus::Marked(AttendanceStatus::Dropped));

        e.mark_attendance("b", at(4, 8, 0)).unwrap();
        e.drop_user("b", at(4, 12, 0)).unwrap();
        assert_eq!(e.status("b", date(4)), DayStatus::Marked(AttendanceStatus::Present));
        assert!(e.user("b").unwrap().is_dropped);
        assert_eq!(e.records().len(), 2);
    }

    #[test]
    fn test_reinstate_and_reset() {
        let mut e = engine(&["a", "b"]);
        for day in 4..7 {
            e.process_scheduled_status_changes(at(day, 9, 0)).unwrap();
        }
        assert!(e.user("a").unwrap().is_dropped);

        e.reinstate_user("a").unwrap();
        assert!(!e.user("a").unwrap().is_dropped);
        assert_eq!(e.user("a").unwrap().absence_count, 0);
        assert!(e.mark_attendance("a", at(7, 8, 0)).is_ok());

        e.reset_absences(None).unwrap();
        assert!(e.users().iter().all(|u| u.absence_count == 0));
        assert!(matches!(e.reset_absences(Some("ghost")), Err(AttendanceError::UnknownUser(_))));
    }

    #[test]
    fn test_exports_in_order() {
        let mut e = engine(&["a", "b"]);
        e.mark_attendance("b", at(4, 8, 0)).unwrap();
        e.mark_attendance("a", at(4, 8, 20)).unwrap();

        let entries = e.attendance_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user_id, "b");
        assert_eq!(entries[0].name, "B");
        assert_eq!(entries[1].status, AttendanceStatus::Late);

        let users = e.user_entries();
        assert_eq!(users.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        let json = serde_json::to_value(&users).unwrap();
        assert_eq!(json[0]["absenceCount"], 0);
    }

    #[test]
    fn test_records_on_day() {
        let mut e = engine(&["a", "b"]);
        e.mark_attendance("a", at(4, 8, 0)).unwrap();
        e.mark_attendance("a", at(5, 8, 0)).unwrap();
        e.mark_attendance("b", at(5, 8, 0) + Duration::minutes(1)).unwrap();
        assert_eq!(e.records_on(date(4)).len(), 1);
        assert_eq!(e.records_on(date(5)).len(), 2);
    }

    #[test]
    fn test_records_between_is_inclusive() {
        let mut e = engine(&["a", "b"]);
        for day in 3..7 {
            e.mark_attendance("a", at(day, 8, 0)).unwrap();
        }
        e.mark_attendance("b", at(5, 8, 20)).unwrap();
        assert_eq!(e.records_between(date(4), date(5)).len(), 3);
        assert_eq!(e.records_between(date(6), date(6)).len(), 1);
        assert!(e.records_between(date(7), date(9)).is_empty());
        // Reversed bounds select nothing.
        assert!(e.records_between(date(5), date(4)).is_empty());

        let entries = e.attendance_entries_between(date(5), date(5));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "B");
        assert_eq!(entries[1].status, AttendanceStatus::Late);
    }

    #[test]
    fn test_records_between_uses_local_day() {
        let schedule = AttendanceSchedule::new(480, 15, 30, 3, 8 * 3600).unwrap();
        let users = vec![User::new("a", "A")];
        let mut e = AttendanceEngine::open(MemoryStore::with_users(users), schedule).unwrap();
        // 20:00 UTC on the 3rd is 04:00 local on the 4th.
        e.mark_attendance("a", at(3, 20, 0)).unwrap();
        assert!(e.records_between(date(3), date(3)).is_empty());
        assert_eq!(e.records_between(date(4), date(4)).len(), 1);
    }

    #[test]
    fn test_day_report_counts_statuses() {
        let mut e = engine(&["a", "b", "c", "d", "e"]);
        e.mark_attendance("a", at(4, 8, 5)).unwrap();
        e.mark_attendance("b", at(4, 8, 20)).unwrap();
        e.mark_attendance("c", at(4, 8, 40)).unwrap();
        e.drop_user("d", at(4, 12, 0)).unwrap();
        e.mark_attendance("a", at(5, 8, 5)).unwrap();

        let report = e.day_report(date(4));
        assert_eq!(report.date, date(4));
        assert_eq!(
            (report.present, report.late, report.absent, report.dropped),
            (1, 1, 1, 1)
        );
        assert_eq!(report.unmarked, 1);
        assert_eq!(report.recorded(), 4);

        let empty = e.day_report(date(10));
        assert_eq!(empty.recorded(), 0);
        // Dropped user "d" is not expected to attend.
        assert_eq!(empty.unmarked, 4);
    }

    #[test]
    fn test_add_user_rejects_path_like_ids() {
        let mut e = engine(&[]);
        for bad in ["class/b", "..", ".", "a\\b", "a\0b", ""] {
            assert!(
                matches!(e.add_user(bad, "X"), Err(AttendanceError::InvalidUserId(_))),
                "{bad:?} accepted"
            );
        }
        assert!(e.users().is_empty());
        assert!(e.store().users.is_empty());
    }

    #[test]
    fn test_unreadable_template_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let mut e = AttendanceEngine::open(store, AttendanceSchedule::default()).unwrap();
        e.add_user("s1", "Ana").unwrap();
        e.add_user("s2", "Ben").unwrap();
        let sample = CaptureSample::detected(FeatureVector::new(vec![1.0, 2.0, 3.0]), 0.9);
        e.enroll_template("s1", &sample).unwrap();
        std::fs::write(dir.path().join("faces").join("s2.bin"), [1, 2, 3]).unwrap();

        let result = e.match_sample(&sample).unwrap();
        assert_eq!(result.owner_id.as_deref(), Some("s1"));
        assert_eq!(result.compared, 1);
        assert_eq!(result.unreadable, 1);
        assert_eq!(
            e.handle_capture(&sample, at(4, 8, 0)).unwrap(),
            CaptureOutcome::Marked {
                user_id: "s1".into(),
                outcome: MarkOutcome::Recorded { status: AttendanceStatus::Present, dropped: false },
            }
        );
    }

    #[test]
    fn test_failing_template_load_is_skipped() {
        let store = FlakyStore {
            inner: MemoryStore::with_users(vec![User::new("a", "A"), User::new("b", "B")]),
            broken_template: Some("a".into()),
            ..Default::default()
        };
        let mut e = AttendanceEngine::open(store, AttendanceSchedule::default()).unwrap();
        let sample = CaptureSample::detected(FeatureVector::new(vec![4.0, 4.0]), 0.9);
        e.enroll_template("a", &sample).unwrap();
        e.enroll_template("b", &sample).unwrap();
        assert_eq!(e.identify(&sample).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_reload_from_store() {
        let mut e = engine(&["a"]);
        e.mark_attendance("a", at(4, 8, 40)).unwrap();
        let store = e.store().clone();
        let reopened = AttendanceEngine::open(store, AttendanceSchedule::default()).unwrap();
        assert_eq!(reopened.user("a").unwrap().absence_count, 1);
        assert_eq!(reopened.status("a", date(4)), DayStatus::Marked(AttendanceStatus::Absent));
    }
}
