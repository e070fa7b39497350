//! Per-file pipeline: compile first, then the tool suite, skipping any
//! tool whose derived result name is already recorded. That skip is what
//! lets crashed or redone submissions resume without re-running work.

pub mod file;
pub mod test;

use crate::error::ProcError;
use crate::tool::{Target, Tool, is_timeout};
use db::{File, Oid, Outcome, ResultRecord, Store};
use std::path::Path;
use std::sync::Arc;

pub use file::{FileWorker, WorkerMsg};
pub use test::TestWorker;

/// What the shared pipeline needs from a worker: how to compile, which
/// tools to run and the name their results are recorded under.
#[async_trait::async_trait]
pub trait ToolRunner: Send {
    fn store(&self) -> Arc<dyn Store>;
    fn result_name(&self, tool: &dyn Tool) -> String;
    fn tools(&self) -> &[Box<dyn Tool>];
    async fn compile(&mut self, file_id: &Oid, target: &Target) -> Result<(), ProcError>;
}

/// Compiles the target, then runs every tool that has no recorded result
/// yet. A compile failure propagates (the caller logs it and moves on);
/// per-tool failures are recorded as outcomes and never stop the suite.
pub async fn run_tools(
    f: &File,
    target: &Target,
    runner: &mut dyn ToolRunner,
) -> Result<(), ProcError> {
    runner.compile(&f.id, target).await?;
    let store = runner.store();
    for i in 0..runner.tools().len() {
        let tool = runner.tools()[i].as_ref();
        let name = runner.result_name(tool);
        if let Err(e) = run_tool(&store, tool, f, target, &name).await {
            log::warn!("tool {} failed on file {}: {}", name, f.id, e);
        }
    }
    Ok(())
}

/// Runs one tool unless its result name is already recorded for the
/// file. Timeouts, tool errors and empty runs all persist as sentinel
/// outcomes so a rerun will not repeat them.
pub async fn run_tool(
    store: &Arc<dyn Store>,
    tool: &dyn Tool,
    f: &File,
    target: &Target,
    name: &str,
) -> Result<(), ProcError> {
    if f.results.contains_key(name) {
        return Ok(());
    }
    match tool.run(&f.id, target).await {
        Ok(Some(report)) => {
            let mut record = ResultRecord::new(f.id, name, Some(report.data));
            record.on_gridfs = report.on_gridfs;
            store.add_result(record).await?;
        }
        Ok(None) => {
            store.add_file_result(&f.id, name, Outcome::NoResult).await?;
        }
        Err(e) if is_timeout(&e) => {
            store.add_file_result(&f.id, name, Outcome::Timeout).await?;
        }
        Err(e) => {
            log::warn!("tool {} errored on file {}: {}", name, f.id, e);
            store.add_file_result(&f.id, name, Outcome::Error).await?;
        }
    }
    Ok(())
}

pub(crate) fn save_file(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)
}
