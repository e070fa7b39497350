use crate::oid::Oid;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The kinds of file a submission may contain. `Launch` files are session
/// metadata recorded by the client and are never processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Src,
    Archive,
    Test,
    Launch,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileKind::Src => "src",
            FileKind::Archive => "archive",
            FileKind::Test => "test",
            FileKind::Launch => "launch",
        };
        write!(f, "{}", s)
    }
}

/// Sentinel outcomes recorded against a file when a tool run produced no
/// report of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Timeout,
    Error,
    NoResult,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Timeout => "TIMEOUT",
            Outcome::Error => "ERROR",
            Outcome::NoResult => "NORESULT",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single file belonging to a submission. `results` maps derived result
/// names to either a stored result id (hex) or a sentinel outcome string;
/// its keys are what make re-processing idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: Oid,
    pub sub_id: Oid,
    pub name: String,
    pub package: String,
    pub kind: FileKind,
    pub time: i64,
    pub data: Vec<u8>,
    #[serde(default)]
    pub results: HashMap<String, String>,
}

impl File {
    pub fn new(sub_id: Oid, name: &str, package: &str, kind: FileKind, time: i64, data: Vec<u8>) -> Self {
        File {
            id: Oid::new(),
            sub_id,
            name: name.to_string(),
            package: package.to_string(),
            kind,
            time,
            data,
            results: HashMap::new(),
        }
    }

    /// Whether this file should be sent through the processing pipeline.
    pub fn can_process(&self) -> bool {
        self.kind != FileKind::Launch
    }

    /// Recovers file metadata from an archive entry name of the form
    /// `[<package component>"_"]*<file name>"_"<time>"_"<number>"_"<mod>`
    /// where the number and modification character are optional. The
    /// timestamp is in milliseconds and therefore longer than ten digits,
    /// which is how it is told apart from the submission-local number.
    pub fn parse_name(encoded: &str, sub_id: Oid, data: Vec<u8>) -> Result<File, StoreError> {
        let parts: Vec<&str> = encoded.split('_').collect();
        if parts.len() < 3 {
            return Err(StoreError::InvalidName(encoded.to_string()));
        }
        let time_idx = if parts[parts.len() - 2].len() > 10 {
            parts.len() - 2
        } else {
            parts.len() - 3
        };
        let time: i64 = parts[time_idx]
            .parse()
            .map_err(|_| StoreError::InvalidName(encoded.to_string()))?;
        let name_parts = &parts[..time_idx];
        if name_parts.is_empty() {
            return Err(StoreError::InvalidName(encoded.to_string()));
        }
        let name = name_parts[name_parts.len() - 1].to_string();
        let package = name_parts[..name_parts.len() - 1].join(".");
        let kind = if name.contains('.') {
            FileKind::Src
        } else {
            return Err(StoreError::InvalidName(encoded.to_string()));
        };
        Ok(File {
            id: Oid::new(),
            sub_id,
            name,
            package,
            kind,
            time,
            data,
            results: HashMap::new(),
        })
    }
}

/// One student's submission session against a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Oid,
    pub project_id: Oid,
    pub user: String,
    pub time: i64,
}

impl Submission {
    pub fn new(project_id: Oid, user: &str, time: i64) -> Self {
        Submission {
            id: Oid::new(),
            project_id,
            user: user.to_string(),
            time,
        }
    }
}

/// A project groups submissions and fixes the language used to pick the
/// compiler and tool suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Oid,
    pub name: String,
    pub lang: String,
    pub time: i64,
}

impl Project {
    pub fn new(name: &str, lang: &str, time: i64) -> Self {
        Project {
            id: Oid::new(),
            name: name.to_string(),
            lang: lang.to_string(),
            time,
        }
    }
}

/// A stored tool report, keyed by `(file_id, name)`. Large payloads are
/// spilled to blob storage by the real store; `on_gridfs` records that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Oid,
    pub file_id: Oid,
    pub name: String,
    pub report: Option<serde_json::Value>,
    pub on_gridfs: bool,
}

impl ResultRecord {
    pub fn new(file_id: Oid, name: &str, report: Option<serde_json::Value>) -> Self {
        ResultRecord {
            id: Oid::new(),
            file_id,
            name: name.to_string(),
            report,
            on_gridfs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_with_package() {
        let f = File::parse_name(
            "triangle_Triangle.java_1389717867153_20_c",
            Oid::new(),
            vec![1, 2],
        )
        .expect("should parse");
        assert_eq!(f.name, "Triangle.java");
        assert_eq!(f.package, "triangle");
        assert_eq!(f.time, 1389717867153);
        assert_eq!(f.kind, FileKind::Src);
    }

    #[test]
    fn test_parse_name_without_number() {
        let f = File::parse_name("Triangle.java_1389717867153_c", Oid::new(), vec![])
            .expect("should parse");
        assert_eq!(f.name, "Triangle.java");
        assert_eq!(f.package, "");
    }

    #[test]
    fn test_parse_name_rejects_short_names() {
        assert!(File::parse_name("Triangle.java", Oid::new(), vec![]).is_err());
        assert!(File::parse_name("a_b", Oid::new(), vec![]).is_err());
    }

    #[test]
    fn test_launch_files_are_not_processable() {
        let f = File::new(Oid::new(), "session", "", FileKind::Launch, 0, vec![]);
        assert!(!f.can_process());
        let s = File::new(Oid::new(), "Main.java", "main", FileKind::Src, 0, vec![]);
        assert!(s.can_process());
    }
}
