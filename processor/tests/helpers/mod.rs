#![allow(dead_code)]

use async_trait::async_trait;
use db::{File, MemStore, Oid, Project, Store, Submission};
use processor::tool::{Compiler, Language, Report, Target, Tool, ToolError, ToolProvider};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Records compile and tool invocations in arrival order, keyed by the
/// file id they ran against.
#[derive(Default)]
pub struct Trace {
    events: Mutex<Vec<String>>,
}

impl Trace {
    pub fn new() -> Arc<Trace> {
        Arc::new(Trace::default())
    }

    pub fn record(&self, event: String) {
        self.events.lock().expect("trace lock poisoned").push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("trace lock poisoned").clone()
    }

    pub fn compiles(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with("compile:"))
            .count()
    }

    pub fn tool_runs(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with("tool:"))
            .count()
    }

    pub fn first_compile_of(&self, fid: &Oid) -> Option<usize> {
        self.events()
            .iter()
            .position(|e| e == &format!("compile:{}", fid.hex()))
    }
}

pub struct MockCompiler {
    trace: Arc<Trace>,
}

#[async_trait]
impl Tool for MockCompiler {
    fn name(&self) -> &str {
        "mockc"
    }

    fn lang(&self) -> Language {
        Language::Java
    }

    async fn run(&self, file_id: &Oid, _target: &Target) -> Result<Option<Report>, ToolError> {
        self.trace.record(format!("compile:{}", file_id.hex()));
        Ok(Some(Report::new(json!({"success": true}))))
    }
}

#[async_trait]
impl Compiler for MockCompiler {
    fn add_classpath(&mut self, _path: &Path) {}
}

pub struct MockTool {
    trace: Arc<Trace>,
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        "mocktool"
    }

    fn lang(&self) -> Language {
        Language::Java
    }

    async fn run(&self, file_id: &Oid, _target: &Target) -> Result<Option<Report>, ToolError> {
        self.trace.record(format!("tool:{}", file_id.hex()));
        Ok(Some(Report::new(json!({"findings": []}))))
    }
}

/// Supplies the mock compiler and one mock tool for every suite.
pub struct MockProvider {
    trace: Arc<Trace>,
}

impl MockProvider {
    pub fn new(trace: Arc<Trace>) -> MockProvider {
        MockProvider { trace }
    }
}

impl ToolProvider for MockProvider {
    fn compiler(&self, _project: &Project, _tool_dir: &Path) -> Result<Box<dyn Compiler>, ToolError> {
        Ok(Box::new(MockCompiler {
            trace: self.trace.clone(),
        }))
    }

    fn tools(&self, _project: &Project, _tool_dir: &Path) -> Result<Vec<Box<dyn Tool>>, ToolError> {
        Ok(vec![Box::new(MockTool {
            trace: self.trace.clone(),
        })])
    }

    fn test_tools(
        &self,
        _project: &Project,
        _test: &File,
        _tool_dir: &Path,
    ) -> Result<Vec<Box<dyn Tool>>, ToolError> {
        Ok(vec![Box::new(MockTool {
            trace: self.trace.clone(),
        })])
    }
}

/// Seeds a project and one submission against it.
pub async fn seed(store: &MemStore) -> Submission {
    let project = Project::new("triangle", "java", 1000);
    let sub = Submission::new(project.id, "student", 2000);
    store.add_project(project).await.unwrap();
    store.add_submission(sub.clone()).await.unwrap();
    sub
}
