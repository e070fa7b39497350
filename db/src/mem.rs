use crate::models::{File, FileKind, Outcome, Project, ResultRecord, Submission};
use crate::oid::Oid;
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory document store. Backs tests and single-node deployments; the
/// production document database sits behind the same `Store` trait.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Collections>,
}

#[derive(Default)]
struct Collections {
    submissions: HashMap<Oid, Submission>,
    projects: HashMap<Oid, Project>,
    files: HashMap<Oid, File>,
    results: HashMap<Oid, ResultRecord>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Test/inspection helper: a stored result record by `(file, name)`.
    pub fn result_for(&self, file_id: &Oid, name: &str) -> Option<ResultRecord> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .results
            .values()
            .find(|r| r.file_id == *file_id && r.name == name)
            .cloned()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn submission(&self, id: &Oid) -> Result<Submission, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .submissions
            .get(id)
            .cloned()
            .ok_or(StoreError::NoSubmission(*id))
    }

    async fn project(&self, id: &Oid) -> Result<Project, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .projects
            .get(id)
            .cloned()
            .ok_or(StoreError::NoProject(*id))
    }

    async fn file(&self, id: &Oid) -> Result<File, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.files.get(id).cloned().ok_or(StoreError::NoFile(*id))
    }

    async fn files_of_kind(&self, sub_id: &Oid, kind: FileKind) -> Result<Vec<File>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut files: Vec<File> = inner
            .files
            .values()
            .filter(|f| f.sub_id == *sub_id && f.kind == kind)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.time);
        Ok(files)
    }

    async fn files(&self, sub_id: &Oid) -> Result<Vec<File>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut files: Vec<File> = inner
            .files
            .values()
            .filter(|f| f.sub_id == *sub_id)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.time);
        Ok(files)
    }

    async fn add_submission(&self, sub: Submission) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.submissions.insert(sub.id, sub);
        Ok(())
    }

    async fn add_project(&self, project: Project) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.projects.insert(project.id, project);
        Ok(())
    }

    async fn add_file(&self, file: File) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner
            .files
            .values()
            .any(|f| f.sub_id == file.sub_id && f.kind == file.kind && f.time == file.time)
        {
            return Err(StoreError::DuplicateFile {
                sub_id: file.sub_id,
                name: file.name,
            });
        }
        inner.files.insert(file.id, file);
        Ok(())
    }

    async fn add_result(&self, record: ResultRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let file_id = record.file_id;
        let name = record.name.clone();
        let hex = record.id.hex();
        inner.results.insert(record.id, record);
        if let Some(f) = inner.files.get_mut(&file_id) {
            f.results.insert(name, hex);
        }
        Ok(())
    }

    async fn add_file_result(
        &self,
        file_id: &Oid,
        name: &str,
        outcome: Outcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let f = inner
            .files
            .get_mut(file_id)
            .ok_or(StoreError::NoFile(*file_id))?;
        f.results.insert(name.to_string(), outcome.as_str().to_string());
        Ok(())
    }

    async fn remove_file_by_id(&self, id: &Oid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.files.remove(id).ok_or(StoreError::NoFile(*id))?;
        Ok(())
    }

    async fn contains_file(
        &self,
        sub_id: &Oid,
        kind: FileKind,
        time: i64,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .files
            .values()
            .any(|f| f.sub_id == *sub_id && f.kind == kind && f.time == time))
    }

    async fn update_time(&self, sub: &Submission) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let s = inner
            .submissions
            .get_mut(&sub.id)
            .ok_or(StoreError::NoSubmission(sub.id))?;
        s.time = chrono::Utc::now().timestamp_millis();
        Ok(())
    }
}
