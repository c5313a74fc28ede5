//! Runtime identifiers, source staging, and pre-spawn code validation.

use std::io::Write;
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown runtime '{0}'")]
    UnknownRuntime(String),
    #[error("code contains disallowed fragment '{fragment}'")]
    Forbidden { fragment: &'static str },
}

/// Command fragments that are never allowed to reach an interpreter. The
/// check is a plain substring scan over the submitted source.
const FORBIDDEN_FRAGMENTS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "rm -rf ~",
    "mkfs",
    ":(){",
    "> /dev/sd",
    "of=/dev/sd",
    "chmod -R 777 /",
];

pub fn validate_code(code: &str) -> Result<(), ValidationError> {
    for fragment in FORBIDDEN_FRAGMENTS {
        if code.contains(fragment) {
            return Err(ValidationError::Forbidden { fragment });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Python,
    Node,
    Bash,
    Sh,
    Ruby,
    C,
}

impl Runtime {
    pub fn parse(identifier: &str) -> Result<Runtime, ValidationError> {
        match identifier.to_ascii_lowercase().as_str() {
            "python" | "python3" => Ok(Runtime::Python),
            "node" | "javascript" => Ok(Runtime::Node),
            "bash" => Ok(Runtime::Bash),
            "sh" | "shell" => Ok(Runtime::Sh),
            "ruby" => Ok(Runtime::Ruby),
            "c" => Ok(Runtime::C),
            other => Err(ValidationError::UnknownRuntime(other.to_string())),
        }
    }

    pub fn identifier(&self) -> &'static str {
        match self {
            Runtime::Python => "python",
            Runtime::Node => "node",
            Runtime::Bash => "bash",
            Runtime::Sh => "sh",
            Runtime::Ruby => "ruby",
            Runtime::C => "c",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Runtime::Python => ".py",
            Runtime::Node => ".js",
            Runtime::Bash | Runtime::Sh => ".sh",
            Runtime::Ruby => ".rb",
            Runtime::C => ".c",
        }
    }

    fn interpreter(&self) -> Option<&'static str> {
        match self {
            Runtime::Python => Some("python3"),
            Runtime::Node => Some("node"),
            Runtime::Bash => Some("bash"),
            Runtime::Sh => Some("sh"),
            Runtime::Ruby => Some("ruby"),
            Runtime::C => None,
        }
    }
}

/// A compile or run command, already bound to staged paths.
#[derive(Debug, Clone)]
pub struct StagedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Source staged to a temp file, with the launch plan for its runtime.
/// Dropping this removes the staged file (and compiled artifact) exactly
/// once.
pub struct StagedProgram {
    pub source: NamedTempFile,
    pub artifact: Option<TempPath>,
    pub compile: Option<StagedCommand>,
    pub run: StagedCommand,
}

/// Write `code` to a temp file and build the launch plan. Compile-then-run
/// runtimes get a compile command targeting a second temp path.
pub fn stage(runtime: Runtime, code: &str) -> std::io::Result<StagedProgram> {
    let mut source = tempfile::Builder::new()
        .prefix("harness-exec-")
        .suffix(runtime.extension())
        .tempfile()?;
    source.write_all(code.as_bytes())?;
    source.flush()?;
    let source_path = source.path().to_string_lossy().into_owned();

    if let Some(interpreter) = runtime.interpreter() {
        return Ok(StagedProgram {
            source,
            artifact: None,
            compile: None,
            run: StagedCommand {
                program: interpreter.to_string(),
                args: vec![source_path],
            },
        });
    }

    let artifact = tempfile::Builder::new()
        .prefix("harness-bin-")
        .tempfile()?
        .into_temp_path();
    let artifact_path = artifact.to_string_lossy().into_owned();
    Ok(StagedProgram {
        source,
        artifact: Some(artifact),
        compile: Some(StagedCommand {
            program: "cc".to_string(),
            args: vec![source_path, "-o".to_string(), artifact_path.clone()],
        }),
        run: StagedCommand {
            program: artifact_path,
            args: Vec::new(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_identifiers() {
        assert_eq!(Runtime::parse("python").unwrap(), Runtime::Python);
        assert_eq!(Runtime::parse("Python3").unwrap(), Runtime::Python);
        assert_eq!(Runtime::parse("sh").unwrap(), Runtime::Sh);
        assert_eq!(Runtime::parse("c").unwrap(), Runtime::C);
    }

    #[test]
    fn rejects_unknown_runtime() {
        let error = Runtime::parse("cobol").expect_err("unknown runtime");
        assert!(matches!(error, ValidationError::UnknownRuntime(_)));
    }

    #[test]
    fn rejects_destructive_fragments() {
        let error = validate_code("echo hi; rm -rf / --no-preserve-root").expect_err("forbidden");
        assert!(matches!(error, ValidationError::Forbidden { .. }));
        assert!(validate_code("rm -rf ./build").is_ok());
    }

    #[test]
    fn stages_interpreted_source() {
        let staged = stage(Runtime::Sh, "echo hi\n").expect("stage");
        assert!(staged.compile.is_none());
        assert_eq!(staged.run.program, "sh");
        assert!(staged.run.args[0].ends_with(".sh"));
        let written = std::fs::read_to_string(staged.source.path()).expect("read staged file");
        assert_eq!(written, "echo hi\n");
    }

    #[test]
    fn stages_compiled_source_with_artifact() {
        let staged = stage(Runtime::C, "int main(){return 0;}\n").expect("stage");
        let compile = staged.compile.as_ref().expect("compile step");
        assert_eq!(compile.program, "cc");
        assert!(staged.artifact.is_some());
        assert_eq!(staged.run.program, compile.args[2]);
    }
}
