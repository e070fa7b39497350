use crate::models::{File, FileKind, Outcome, Project, ResultRecord, Submission};
use crate::oid::Oid;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no submission found for id {0}")]
    NoSubmission(Oid),
    #[error("no project found for id {0}")]
    NoProject(Oid),
    #[error("no file found for id {0}")]
    NoFile(Oid),
    #[error("file {name} already stored for submission {sub_id}")]
    DuplicateFile { sub_id: Oid, name: String },
    #[error("could not parse encoded file name {0}")]
    InvalidName(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// The document-store collaborator. Every mutation is a single-document
/// upsert or update, so concurrent workers need no locking discipline
/// beyond the store's own; the `results` map is last-writer-wins per key,
/// and each key is only ever written by the worker that owns the file.
#[async_trait]
pub trait Store: Send + Sync {
    async fn submission(&self, id: &Oid) -> Result<Submission, StoreError>;
    async fn project(&self, id: &Oid) -> Result<Project, StoreError>;
    async fn file(&self, id: &Oid) -> Result<File, StoreError>;

    /// All files of the given kind belonging to a submission, ordered by
    /// their recorded time.
    async fn files_of_kind(&self, sub_id: &Oid, kind: FileKind) -> Result<Vec<File>, StoreError>;

    /// All files belonging to a submission, ordered by time. Used by redo.
    async fn files(&self, sub_id: &Oid) -> Result<Vec<File>, StoreError>;

    async fn add_submission(&self, sub: Submission) -> Result<(), StoreError>;
    async fn add_project(&self, project: Project) -> Result<(), StoreError>;
    async fn add_file(&self, file: File) -> Result<(), StoreError>;

    /// Stores a tool report and records its id under `name` in the owning
    /// file's results map.
    async fn add_result(&self, record: ResultRecord) -> Result<(), StoreError>;

    /// Records a sentinel outcome under `name` for a file that produced no
    /// report (timeouts, tool errors, empty runs).
    async fn add_file_result(
        &self,
        file_id: &Oid,
        name: &str,
        outcome: Outcome,
    ) -> Result<(), StoreError>;

    async fn remove_file_by_id(&self, id: &Oid) -> Result<(), StoreError>;

    /// Duplicate probe: is a file with this kind and timestamp already
    /// stored for the submission?
    async fn contains_file(
        &self,
        sub_id: &Oid,
        kind: FileKind,
        time: i64,
    ) -> Result<bool, StoreError>;

    /// Bumps the submission's timestamp to now. Called when its worker
    /// finishes.
    async fn update_time(&self, sub: &Submission) -> Result<(), StoreError>;
}
