use crate::request::{Kind, Request};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// File sets are encoded as maps to an empty object so that JSON keeps
/// set semantics.
pub type FileSet = HashMap<String, Empty>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("submission {0} already exists")]
    SubmissionExists(String),
    #[error("submission {0} does not exist")]
    NoSubmission(String),
    #[error("submission {0} still has active files")]
    ActiveFiles(String),
    #[error("file {file} already exists for submission {sub}")]
    FileExists { sub: String, file: String },
    #[error("file {file} does not exist for submission {sub}")]
    NoFile { sub: String, file: String },
    #[error("unsupported request type {0}")]
    Unsupported(u8),
}

/// Tracks the files and submissions currently being processed. Owned by
/// the status monitor actor; every operation is all-or-nothing, so the
/// invariant `file_count == Σ |submissions[s]|` holds after each update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "FileCount")]
    pub file_count: i64,
    #[serde(rename = "Submissions")]
    pub submissions: HashMap<String, FileSet>,
}

impl Status {
    pub fn new() -> Status {
        Status::default()
    }

    pub fn update(&mut self, r: &Request) -> Result<(), StatusError> {
        match r.kind {
            Kind::SUBMISSION_START => self.add_submission(r),
            Kind::SUBMISSION_STOP => self.remove_submission(r),
            Kind::FILE_ADD => self.add_file(r),
            Kind::FILE_REMOVE => self.remove_file(r),
            Kind(t) => Err(StatusError::Unsupported(t)),
        }
    }

    fn add_submission(&mut self, r: &Request) -> Result<(), StatusError> {
        let sub = r.sub_id.hex();
        if self.submissions.contains_key(&sub) {
            return Err(StatusError::SubmissionExists(sub));
        }
        self.submissions.insert(sub, FileSet::new());
        Ok(())
    }

    fn remove_submission(&mut self, r: &Request) -> Result<(), StatusError> {
        let sub = r.sub_id.hex();
        match self.submissions.get(&sub) {
            None => Err(StatusError::NoSubmission(sub)),
            Some(files) if !files.is_empty() => Err(StatusError::ActiveFiles(sub)),
            Some(_) => {
                self.submissions.remove(&sub);
                Ok(())
            }
        }
    }

    fn add_file(&mut self, r: &Request) -> Result<(), StatusError> {
        let sub = r.sub_id.hex();
        let file = r.file_id.hex();
        let files = self
            .submissions
            .get_mut(&sub)
            .ok_or_else(|| StatusError::NoSubmission(sub.clone()))?;
        if files.contains_key(&file) {
            return Err(StatusError::FileExists { sub, file });
        }
        files.insert(file, Empty {});
        self.file_count += 1;
        Ok(())
    }

    fn remove_file(&mut self, r: &Request) -> Result<(), StatusError> {
        let sub = r.sub_id.hex();
        let file = r.file_id.hex();
        let files = self
            .submissions
            .get_mut(&sub)
            .ok_or_else(|| StatusError::NoSubmission(sub.clone()))?;
        if files.remove(&file).is_none() {
            return Err(StatusError::NoFile { sub, file });
        }
        self.file_count -= 1;
        Ok(())
    }

    pub fn idle(&self) -> bool {
        self.submissions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::Oid;

    fn assert_invariant(s: &Status) {
        let total: i64 = s.submissions.values().map(|f| f.len() as i64).sum();
        assert_eq!(s.file_count, total, "file count must match the sets");
    }

    #[test]
    fn test_count_matches_sets_after_every_operation() {
        let mut s = Status::new();
        let sid = Oid::new();
        let files: Vec<Oid> = (0..4).map(|_| Oid::new()).collect();

        s.update(&Request::start_submission(sid)).unwrap();
        assert_invariant(&s);
        for fid in &files {
            s.update(&Request::add_file(sid, *fid)).unwrap();
            assert_invariant(&s);
        }
        assert_eq!(s.file_count, 4);
        for fid in &files {
            s.update(&Request::remove_file(sid, *fid)).unwrap();
            assert_invariant(&s);
        }
        s.update(&Request::stop_submission(sid)).unwrap();
        assert_invariant(&s);
        assert!(s.idle());
    }

    #[test]
    fn test_duplicate_submission_rejected() {
        let mut s = Status::new();
        let sid = Oid::new();
        s.update(&Request::start_submission(sid)).unwrap();
        assert!(matches!(
            s.update(&Request::start_submission(sid)),
            Err(StatusError::SubmissionExists(_))
        ));
        assert_invariant(&s);
    }

    #[test]
    fn test_duplicate_file_add_rejected_without_count_change() {
        let mut s = Status::new();
        let sid = Oid::new();
        let fid = Oid::new();
        s.update(&Request::start_submission(sid)).unwrap();
        s.update(&Request::add_file(sid, fid)).unwrap();
        let before = s.file_count;
        assert!(matches!(
            s.update(&Request::add_file(sid, fid)),
            Err(StatusError::FileExists { .. })
        ));
        assert_eq!(s.file_count, before);
        assert_invariant(&s);
    }

    #[test]
    fn test_stop_with_active_files_rejected() {
        let mut s = Status::new();
        let sid = Oid::new();
        s.update(&Request::start_submission(sid)).unwrap();
        s.update(&Request::add_file(sid, Oid::new())).unwrap();
        assert!(matches!(
            s.update(&Request::stop_submission(sid)),
            Err(StatusError::ActiveFiles(_))
        ));
        assert!(!s.idle());
        assert_invariant(&s);
    }

    #[test]
    fn test_file_operations_require_tracked_submission() {
        let mut s = Status::new();
        let sid = Oid::new();
        assert!(matches!(
            s.update(&Request::add_file(sid, Oid::new())),
            Err(StatusError::NoSubmission(_))
        ));
        assert!(matches!(
            s.update(&Request::remove_file(sid, Oid::new())),
            Err(StatusError::NoSubmission(_))
        ));
        assert!(matches!(
            s.update(&Request::stop_submission(sid)),
            Err(StatusError::NoSubmission(_))
        ));
        assert_invariant(&s);
    }

    #[test]
    fn test_snapshot_encodes_sets_as_maps() {
        let mut s = Status::new();
        let sid = Oid::new();
        let fid = Oid::new();
        s.update(&Request::start_submission(sid)).unwrap();
        s.update(&Request::add_file(sid, fid)).unwrap();
        let v: serde_json::Value = serde_json::to_value(&s).unwrap();
        assert_eq!(v["FileCount"], 1);
        assert!(v["Submissions"][sid.hex()][fid.hex()].is_object());
    }
}
