use super::{Compiler, ExecResult, Language, Report, Target, Tool, ToolError, exec};
use async_trait::async_trait;
use db::Oid;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const COMPILE_TIMEOUT: Duration = Duration::from_secs(60);

/// The stock Java compiler adapter. A non-zero exit is a compile error;
/// failure to launch the compiler at all is an infrastructure error.
pub struct Javac {
    classpath: Vec<PathBuf>,
    limit: Duration,
}

impl Javac {
    pub fn new(classpath: &str) -> Javac {
        let classpath = if classpath.is_empty() {
            Vec::new()
        } else {
            classpath.split(':').map(PathBuf::from).collect()
        };
        Javac {
            classpath,
            limit: COMPILE_TIMEOUT,
        }
    }

    fn args(&self, target: &Target) -> Vec<String> {
        let mut args = vec!["javac".to_string(), "-implicit:class".to_string()];
        let mut cp: Vec<String> = vec![target.dir.to_string_lossy().into_owned()];
        cp.extend(
            self.classpath
                .iter()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        args.push("-cp".to_string());
        args.push(cp.join(":"));
        args.push(target.file_path().to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Tool for Javac {
    fn name(&self) -> &str {
        "javac"
    }

    fn lang(&self) -> Language {
        Language::Java
    }

    async fn run(&self, _file_id: &Oid, target: &Target) -> Result<Option<Report>, ToolError> {
        let args = self.args(target);
        let ExecResult { stderr, ok, .. } = exec(&args, &target.dir, self.limit).await?;
        if ok {
            Ok(Some(Report::new(json!({
                "tool": "javac",
                "success": true,
                "warnings": stderr,
            }))))
        } else {
            Err(ToolError::Compile {
                name: target.name.clone(),
                message: stderr,
            })
        }
    }
}

#[async_trait]
impl Compiler for Javac {
    fn add_classpath(&mut self, path: &Path) {
        let path = path.to_path_buf();
        if !self.classpath.contains(&path) {
            self.classpath.push(path);
        }
    }
}
