use db::Oid;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Request type discriminant. Carried as a raw byte so that unknown wire
/// values can be represented and rejected by `valid` instead of failing
/// opaquely at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kind(pub u8);

impl Kind {
    pub const SUBMISSION_START: Kind = Kind(0);
    pub const SUBMISSION_STOP: Kind = Kind(1);
    pub const FILE_ADD: Kind = Kind(2);
    pub const FILE_REMOVE: Kind = Kind(3);
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Kind::SUBMISSION_START => write!(f, "SUBMISSION_START"),
            Kind::SUBMISSION_STOP => write!(f, "SUBMISSION_STOP"),
            Kind::FILE_ADD => write!(f, "FILE_ADD"),
            Kind::FILE_REMOVE => write!(f, "FILE_REMOVE"),
            Kind(t) => write!(f, "UNKNOWN({})", t),
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown request type {0}")]
    UnknownType(u8),
    #[error("request {0} id is not a well-formed identifier")]
    NilId(&'static str),
}

/// A submission or file lifecycle event. Immutable once constructed;
/// consumed exactly once by the status monitor and by exactly one
/// submission handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "SubId")]
    pub sub_id: Oid,
    #[serde(rename = "FileId")]
    pub file_id: Oid,
    #[serde(rename = "Type")]
    pub kind: Kind,
}

impl Request {
    /// Submission lifecycle requests carry the submission id in both
    /// fields so that every request type has two well-formed ids.
    pub fn start_submission(sub_id: Oid) -> Request {
        Request {
            sub_id,
            file_id: sub_id,
            kind: Kind::SUBMISSION_START,
        }
    }

    pub fn stop_submission(sub_id: Oid) -> Request {
        Request {
            sub_id,
            file_id: sub_id,
            kind: Kind::SUBMISSION_STOP,
        }
    }

    pub fn add_file(sub_id: Oid, file_id: Oid) -> Request {
        Request {
            sub_id,
            file_id,
            kind: Kind::FILE_ADD,
        }
    }

    pub fn remove_file(sub_id: Oid, file_id: Oid) -> Request {
        Request {
            sub_id,
            file_id,
            kind: Kind::FILE_REMOVE,
        }
    }

    pub fn valid(&self) -> Result<(), RequestError> {
        match self.kind {
            Kind::SUBMISSION_START | Kind::SUBMISSION_STOP | Kind::FILE_ADD | Kind::FILE_REMOVE => {
                if self.sub_id.is_nil() {
                    Err(RequestError::NilId("submission"))
                } else if self.file_id.is_nil() {
                    Err(RequestError::NilId("file"))
                } else {
                    Ok(())
                }
            }
            Kind(t) => Err(RequestError::UnknownType(t)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Request, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} request for submission {} file {}",
            self.kind, self.sub_id, self.file_id
        )
    }
}
