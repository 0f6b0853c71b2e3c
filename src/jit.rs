//! Shelling out to an external compiler to build kernels from generated
//! source, with the produced artifact read back into memory.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum JitError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{compiler} exited with {status}")]
    CompilerFailed { compiler: String, status: std::process::ExitStatus },
    #[error("output file missing: {0}")]
    MissingOutput(PathBuf),
    #[error("no sources to compile")]
    NoSources,
}

/// One generated source file, with a path relative to the build directory.
pub struct SrcFile {
    pub path: PathBuf,
    pub content: String,
}

impl SrcFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self { path: path.into(), content: content.into() }
    }
}

/// Invokes an external compiler on generated sources in a scratch directory.
///
/// Files whose extension matches `src_ext` are passed to the compiler; the
/// artifact is expected at the first such file's stem plus `out_ext`.
pub struct SourceCompiler {
    pub compiler: PathBuf,
    pub flags: Vec<String>,
    pub src_ext: String,
    pub out_ext: String,
    /// Optional wrapper executable that receives the compiler and its
    /// arguments as its own arguments.
    pub launcher: Option<PathBuf>,
}

impl SourceCompiler {
    pub fn new(compiler: impl Into<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            flags: Vec::new(),
            src_ext: "cpp".to_string(),
            out_ext: "o".to_string(),
            launcher: None,
        }
    }

    pub fn compile(&self, srcs: &[SrcFile]) -> Result<Vec<u8>, JitError> {
        let build_dir = scratch_dir()?;
        let result = self.compile_in(&build_dir, srcs);
        // best-effort cleanup
        let _ = fs::remove_dir_all(&build_dir);
        result
    }

    fn compile_in(&self, build_dir: &Path, srcs: &[SrcFile]) -> Result<Vec<u8>, JitError> {
        let mut compile_units = Vec::new();
        for src in srcs {
            let path = build_dir.join(&src.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &src.content)?;
            if src.path.extension().and_then(|e| e.to_str()) == Some(self.src_ext.as_str()) {
                compile_units.push(src.path.clone());
            }
        }
        let Some(first) = compile_units.first() else {
            return Err(JitError::NoSources);
        };
        let out_name = first.with_extension(&self.out_ext);

        let mut args: Vec<String> = self.flags.clone();
        args.push("-I.".to_string());
        args.extend(compile_units.iter().map(|p| p.display().to_string()));
        args.push("-o".to_string());
        args.push(out_name.display().to_string());

        let mut command = match &self.launcher {
            Some(launcher) => {
                let mut c = Command::new(launcher);
                c.arg(&self.compiler);
                c
            }
            None => Command::new(&self.compiler),
        };
        command.args(&args).current_dir(build_dir);

        debug!(compiler = %self.compiler.display(), ?args, "compiling generated source");
        let status = command.status()?;
        if !status.success() {
            return Err(JitError::CompilerFailed {
                compiler: self.compiler.display().to_string(),
                status,
            });
        }

        let out_path = build_dir.join(&out_name);
        if !out_path.exists() {
            return Err(JitError::MissingOutput(out_name));
        }
        Ok(fs::read(out_path)?)
    }
}

fn scratch_dir() -> Result<PathBuf, std::io::Error> {
    static COUNT: AtomicUsize = AtomicUsize::new(0);
    let id = COUNT.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir()
        .join(format!("tenfold-jit-{}-{id}", std::process::id()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_compiler(script: &str) -> SourceCompiler {
        let mut compiler = SourceCompiler::new("sh");
        // extra argv entries from the driver are ignored by the script
        compiler.flags = vec!["-c".to_string(), script.to_string()];
        compiler.out_ext = "bin".to_string();
        compiler
    }

    #[test]
    fn compiles_and_reads_back_artifact() {
        let compiler = shell_compiler("cp main.cpp main.bin");
        let srcs = [
            SrcFile::new("main.cpp", "int main() { return 0; }\n"),
            SrcFile::new("kernel.hpp", "// header\n"),
        ];
        let artifact = compiler.compile(&srcs).unwrap();
        assert_eq!(artifact, b"int main() { return 0; }\n");
    }

    #[test]
    fn missing_artifact_is_reported_with_its_path() {
        let compiler = shell_compiler("true");
        let srcs = [SrcFile::new("main.cpp", "")];
        match compiler.compile(&srcs) {
            Err(JitError::MissingOutput(path)) => assert_eq!(path, PathBuf::from("main.bin")),
            other => panic!("expected MissingOutput, got {other:?}"),
        }
    }

    #[test]
    fn failing_compiler_surfaces_its_status() {
        let compiler = shell_compiler("exit 3");
        let srcs = [SrcFile::new("main.cpp", "")];
        assert!(matches!(compiler.compile(&srcs), Err(JitError::CompilerFailed { .. })));
    }

    #[test]
    fn no_compile_units_is_an_error() {
        let compiler = shell_compiler("true");
        let srcs = [SrcFile::new("only.hpp", "")];
        assert!(matches!(compiler.compile(&srcs), Err(JitError::NoSources)));
    }
}
