//! The tool adapter contract. Concrete analysis tools live outside the
//! core; they plug in through `Tool`/`Compiler` and a `ToolProvider`
//! that assembles the suite for a project's language.

pub mod javac;

use async_trait::async_trait;
use db::{File, Oid, Project};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Java,
    C,
}

impl Language {
    pub fn parse(s: &str) -> Result<Language, ToolError> {
        match s.to_lowercase().as_str() {
            "java" => Ok(Language::Java),
            "c" => Ok(Language::C),
            other => Err(ToolError::UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Java => write!(f, "java"),
            Language::C => write!(f, "c"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("command {0:?} timed out")]
    Timeout(Vec<String>),
    #[error("{name} did not compile: {message}")]
    Compile { name: String, message: String },
    #[error("command {args:?} failed to start: {source}")]
    Start {
        args: Vec<String>,
        source: std::io::Error,
    },
    #[error("command {args:?} failed: {message}")]
    End { args: Vec<String>, message: String },
    #[error("no tools available for language {0}")]
    UnsupportedLanguage(String),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub fn is_timeout(e: &ToolError) -> bool {
    matches!(e, ToolError::Timeout(_))
}

pub fn is_compile_error(e: &ToolError) -> bool {
    matches!(e, ToolError::Compile { .. })
}

/// Where a tool runs: the file under analysis and the source root it was
/// saved beneath.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub package: String,
    pub dir: PathBuf,
    pub lang: Language,
}

impl Target {
    pub fn new(name: &str, package: &str, dir: &Path, lang: Language) -> Target {
        Target {
            name: name.to_string(),
            package: package.to_string(),
            dir: dir.to_path_buf(),
            lang,
        }
    }

    /// The directory the file lives in: the source root plus one level
    /// per package component.
    pub fn package_path(&self) -> PathBuf {
        let mut path = self.dir.clone();
        for part in self.package.split('.').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    pub fn file_path(&self) -> PathBuf {
        self.package_path().join(&self.name)
    }
}

/// The report a tool hands back. Large payloads are flagged for blob
/// storage by the adapter.
#[derive(Debug, Clone)]
pub struct Report {
    pub data: serde_json::Value,
    pub on_gridfs: bool,
}

impl Report {
    pub fn new(data: serde_json::Value) -> Report {
        Report {
            data,
            on_gridfs: false,
        }
    }
}

/// One analysis tool. `run` returns `Ok(None)` when the tool ran but had
/// nothing to report.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn lang(&self) -> Language;
    async fn run(&self, file_id: &Oid, target: &Target) -> Result<Option<Report>, ToolError>;
}

/// A compiler is a tool whose classpath can grow as a submission
/// accumulates compiled sources and test harnesses.
#[async_trait]
pub trait Compiler: Tool {
    fn add_classpath(&mut self, path: &Path);
}

/// Assembles the compiler and tool suites for a project. The default
/// provider covers compilation only; deployments register their own to
/// add analysis tools.
pub trait ToolProvider: Send + Sync {
    fn compiler(&self, project: &Project, tool_dir: &Path) -> Result<Box<dyn Compiler>, ToolError>;
    fn tools(&self, project: &Project, tool_dir: &Path) -> Result<Vec<Box<dyn Tool>>, ToolError>;
    fn test_tools(
        &self,
        project: &Project,
        test: &File,
        tool_dir: &Path,
    ) -> Result<Vec<Box<dyn Tool>>, ToolError>;
}

pub struct DefaultProvider;

impl ToolProvider for DefaultProvider {
    fn compiler(&self, project: &Project, _tool_dir: &Path) -> Result<Box<dyn Compiler>, ToolError> {
        match Language::parse(&project.lang)? {
            Language::Java => Ok(Box::new(javac::Javac::new(""))),
            Language::C => Err(ToolError::UnsupportedLanguage(project.lang.clone())),
        }
    }

    fn tools(&self, project: &Project, _tool_dir: &Path) -> Result<Vec<Box<dyn Tool>>, ToolError> {
        Language::parse(&project.lang)?;
        Ok(Vec::new())
    }

    fn test_tools(
        &self,
        project: &Project,
        _test: &File,
        _tool_dir: &Path,
    ) -> Result<Vec<Box<dyn Tool>>, ToolError> {
        Language::parse(&project.lang)?;
        Ok(Vec::new())
    }
}

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub ok: bool,
}

/// Runs a command under `dir` with a hard timeout. A timeout kills the
/// child and surfaces as the distinguished `ToolError::Timeout`.
pub async fn exec(args: &[String], dir: &Path, limit: Duration) -> Result<ExecResult, ToolError> {
    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..]).current_dir(dir).kill_on_drop(true);
    match timeout(limit, cmd.output()).await {
        Err(_) => Err(ToolError::Timeout(args.to_vec())),
        Ok(Err(e)) => Err(ToolError::Start {
            args: args.to_vec(),
            source: e,
        }),
        Ok(Ok(out)) => Ok(ExecResult {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            ok: out.status.success(),
        }),
    }
}
