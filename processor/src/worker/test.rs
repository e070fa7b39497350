use super::{ToolRunner, run_tools, save_file};
use crate::error::ProcError;
use crate::tool::{Compiler, Language, Target, Tool, ToolProvider};
use db::{File, Oid, Project, Store};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Re-runs the tool suite for one test file against a submission's
/// stored sources, in a scratch directory of its own under the file
/// worker's root. Result names carry the test id so the same tool can
/// be recorded once per test.
pub struct TestWorker {
    store: Arc<dyn Store>,
    test_id: Oid,
    lang: Language,
    src_dir: PathBuf,
    compiler: Box<dyn Compiler>,
    tools: Vec<Box<dyn Tool>>,
}

impl TestWorker {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ToolProvider>,
        test: &File,
        project: &Project,
        root: &Path,
    ) -> Result<TestWorker, ProcError> {
        let dir = root.join(test.id.hex());
        let src_dir = dir.join("src");
        let tool_dir = dir.join("tools");
        std::fs::create_dir_all(&src_dir)?;
        std::fs::create_dir_all(&tool_dir)?;
        // The test itself lives with the tools so the suite can find it
        // next to the sources it gets pointed at.
        let test_target = Target::new(&test.name, &test.package, &tool_dir, Language::parse(&project.lang)?);
        save_file(&test_target.file_path(), &test.data)?;
        let compiler = provider.compiler(project, &tool_dir)?;
        let tools = provider.test_tools(project, test, &tool_dir)?;
        Ok(TestWorker {
            store,
            test_id: test.id,
            lang: Language::parse(&project.lang)?,
            src_dir,
            compiler,
            tools,
        })
    }

    pub async fn process(&mut self, fid: &Oid) -> Result<(), ProcError> {
        let f = self.store.file(fid).await?;
        let target = Target::new(&f.name, &f.package, &self.src_dir, self.lang);
        save_file(&target.file_path(), &f.data)?;
        run_tools(&f, &target, self).await
    }
}

#[async_trait::async_trait]
impl ToolRunner for TestWorker {
    fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// `<tool>-<test id>` keeps one record per test per tool.
    fn result_name(&self, tool: &dyn Tool) -> String {
        format!("{}-{}", tool.name(), self.test_id.hex())
    }

    fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    /// Compilation here is a precondition check only; the compiler's
    /// verdict for the source was already recorded by the file worker.
    async fn compile(&mut self, file_id: &Oid, target: &Target) -> Result<(), ProcError> {
        self.compiler.run(file_id, target).await?;
        Ok(())
    }
}
