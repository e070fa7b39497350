use super::{ToolRunner, run_tools, save_file};
use crate::error::ProcError;
use crate::mq;
use crate::request::Request;
use crate::tool::{Compiler, Language, Target, Tool, ToolProvider, is_compile_error};
use crate::worker::test::TestWorker;
use db::{File, FileKind, Oid, Project, ResultRecord, Store, Submission};
use serde_json::json;
use std::future::Future;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMsg {
    Process(Oid),
    Stop,
}

/// Processes one submission's files, one at a time, inside its own
/// scratch space. Construction fails fast when the submission, its
/// project or its compiler cannot be loaded; the handler turns that
/// into an aborted submission.
pub struct FileWorker {
    store: Arc<dyn Store>,
    provider: Arc<dyn ToolProvider>,
    uri: String,
    sub: Submission,
    project: Project,
    lang: Language,
    root: TempDir,
    src_dir: PathBuf,
    tool_dir: PathBuf,
    compiler: Box<dyn Compiler>,
    tools: Vec<Box<dyn Tool>>,
}

impl FileWorker {
    pub async fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ToolProvider>,
        uri: &str,
        sub_id: &Oid,
    ) -> Result<FileWorker, ProcError> {
        let sub = store.submission(sub_id).await?;
        let project = store.project(&sub.project_id).await?;
        let lang = Language::parse(&project.lang)?;
        let root = tempfile::Builder::new().prefix(&sub_id.hex()).tempdir()?;
        let src_dir = root.path().join("src");
        let tool_dir = root.path().join("tools");
        std::fs::create_dir_all(&src_dir)?;
        std::fs::create_dir_all(&tool_dir)?;
        let compiler = provider.compiler(&project, &tool_dir)?;
        let tools = provider.tools(&project, &tool_dir)?;
        Ok(FileWorker {
            store,
            provider,
            uri: uri.to_string(),
            sub,
            project,
            lang,
            root,
            src_dir,
            tool_dir,
            compiler,
            tools,
        })
    }

    /// Pulls file ids off `work_rx` until a stop message arrives, then
    /// bumps the submission timestamp. The scratch space goes away with
    /// the worker.
    pub async fn start(mut self, mut work_rx: mpsc::Receiver<WorkerMsg>, finished_tx: mpsc::Sender<Oid>) {
        log::info!("processing submission {}", self.sub.id);
        while let Some(msg) = work_rx.recv().await {
            match msg {
                WorkerMsg::Process(fid) => {
                    if let Err(e) = self.process(&fid).await {
                        log::warn!("processing file {} failed: {}", fid, e);
                    }
                    if finished_tx.send(fid).await.is_err() {
                        break;
                    }
                }
                WorkerMsg::Stop => break,
            }
        }
        if let Err(e) = self.store.update_time(&self.sub).await {
            log::warn!("could not update submission {}: {}", self.sub.id, e);
        }
        log::info!("processed submission {}", self.sub.id);
    }

    pub async fn process(&mut self, fid: &Oid) -> Result<(), ProcError> {
        self.process_boxed(fid).await
    }

    /// Concrete boxed-future form of `process`. Routing the recursive
    /// archive call through a named `Send` future type (rather than the
    /// inferred `async fn` future) is what lets the compiler prove the
    /// recursion is `Send`.
    fn process_boxed<'a>(
        &'a mut self,
        fid: &'a Oid,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcError>> + Send + 'a>> {
        Box::pin(async move {
            let f = self.store.file(fid).await?;
            match f.kind {
                FileKind::Src => self.source(&f).await,
                FileKind::Archive => self.archive(&f).await,
                FileKind::Test => self.test(&f).await,
                FileKind::Launch => Err(ProcError::BadKind(f.kind)),
            }
        })
    }

    async fn source(&mut self, f: &File) -> Result<(), ProcError> {
        let target = Target::new(&f.name, &f.package, &self.src_dir, self.lang);
        save_file(&target.file_path(), &f.data)?;
        if let Err(e) = run_tools(f, &target, self).await {
            log::warn!("tool suite incomplete for file {}: {}", f.id, e);
        }
        Ok(())
    }

    /// Compiles the test against the submission's accumulated classpath,
    /// then re-runs the suite against every stored source file so a
    /// late-arriving test is applied retroactively.
    async fn test(&mut self, tf: &File) -> Result<(), ProcError> {
        let target = Target::new(&tf.name, &tf.package, &self.src_dir, self.lang);
        save_file(&target.file_path(), &tf.data)?;
        let tool_dir = self.tool_dir.clone();
        self.compiler.add_classpath(&tool_dir);
        self.compile(&tf.id, &target).await?;
        let mut tester = TestWorker::new(
            self.store.clone(),
            self.provider.clone(),
            tf,
            &self.project,
            self.root.path(),
        )?;
        let sources = self.store.files_of_kind(&tf.sub_id, FileKind::Src).await?;
        for f in sources {
            if let Err(e) = tester.process(&f.id).await {
                log::warn!("test {} failed on file {}: {}", tf.id, f.id, e);
            }
        }
        Ok(())
    }

    /// Extracts an archive, stores and processes each entry, then drops
    /// the archive's own record. Entries report their own add/remove
    /// status pair; a bad entry is skipped, its siblings continue.
    async fn archive(&mut self, a: &File) -> Result<(), ProcError> {
        let entries = unzip_map(&a.data)?;
        for (name, data) in entries {
            if let Err(e) = self.archive_entry(&name, data).await {
                log::warn!("archive entry {} skipped: {}", name, e);
            }
        }
        self.store.remove_file_by_id(&a.id).await
            .map_err(ProcError::from)
    }

    async fn archive_entry(&mut self, name: &str, data: Vec<u8>) -> Result<(), ProcError> {
        let f = self.store_file(name, data).await?;
        mq::change_status(&self.uri, &Request::add_file(f.sub_id, f.id))?;
        // Archives may nest, so the recursive call goes through the boxed
        // future form.
        let processed = self.process_boxed(&f.id).await;
        let reported = mq::change_status(&self.uri, &Request::remove_file(f.sub_id, f.id));
        processed.and(reported)
    }

    /// Parses an encoded entry name into a file record and stores it,
    /// skipping entries already stored for the same kind and timestamp.
    async fn store_file(&self, name: &str, data: Vec<u8>) -> Result<File, ProcError> {
        let f = File::parse_name(name, self.sub.id, data)?;
        if self
            .store
            .contains_file(&self.sub.id, f.kind, f.time)
            .await?
        {
            return Err(ProcError::Store(db::StoreError::DuplicateFile {
                sub_id: self.sub.id,
                name: name.to_string(),
            }));
        }
        self.store.add_file(f.clone()).await?;
        Ok(f)
    }
}

#[async_trait::async_trait]
impl ToolRunner for FileWorker {
    fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    fn result_name(&self, tool: &dyn Tool) -> String {
        tool.name().to_string()
    }

    fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    /// Compiles and persists the compiler's verdict. "Did not compile"
    /// is itself a recorded outcome; only infrastructure failures leave
    /// nothing behind.
    async fn compile(&mut self, file_id: &Oid, target: &Target) -> Result<(), ProcError> {
        match self.compiler.run(file_id, target).await {
            Ok(report) => {
                if let Some(report) = report {
                    let mut record =
                        ResultRecord::new(*file_id, self.compiler.name(), Some(report.data));
                    record.on_gridfs = report.on_gridfs;
                    self.store.add_result(record).await?;
                }
                Ok(())
            }
            Err(e) if is_compile_error(&e) => {
                let record = ResultRecord::new(
                    *file_id,
                    self.compiler.name(),
                    Some(json!({
                        "tool": self.compiler.name(),
                        "success": false,
                        "errors": e.to_string(),
                    })),
                );
                self.store.add_result(record).await?;
                Err(ProcError::Tool(e))
            }
            Err(e) => Err(ProcError::Tool(e)),
        }
    }
}

fn unzip_map(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ProcError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        entries.push((name, buf));
    }
    Ok(entries)
}
