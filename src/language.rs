use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::time::timeout;

use crate::config::{Config, LanguageConfig};
use crate::executor::{self, ExecutionRequest, OutputPaths};

/// Wall-clock budget for a compiler invocation
pub const COMPILE_TIME_LIMIT: Duration = Duration::from_secs(30);
/// Receives both output streams of the compiler
pub const COMPILE_LOG_FILE: &str = "compile_error.txt";
/// Artifact produced by native compilers
pub const PROGRAM_FILE: &str = "program.out";

/// Result of the compilation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// The language has no compile step
    Skipped,
    Success,
    Failed(ExitStatus),
    /// The compiler could not be started; the reason is in the compile log
    CompilerUnavailable,
    TimedOut,
}

impl CompileOutcome {
    /// Whether the program can be run afterwards
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Skipped | Self::Success)
    }
}

/// Finds the language whose extension list contains the source's extension
///
/// Extensions are compared whole, so `main.cpp` never matches a `c` entry.
pub fn detect_language<'a>(source: &Path, config: &'a Config) -> Option<&'a LanguageConfig> {
    let extension = source.extension()?.to_str()?;
    config.languages.iter().find(|language| {
        language
            .extensions
            .iter()
            .any(|candidate| candidate.trim_start_matches('.') == extension)
    })
}

/// Compiles `source` into `output_dir`, giving up after [`COMPILE_TIME_LIMIT`]
pub async fn compile(
    language: &LanguageConfig,
    source: &Path,
    output_dir: &Path,
) -> Result<CompileOutcome> {
    compile_with_timeout(language, source, output_dir, COMPILE_TIME_LIMIT).await
}

pub async fn compile_with_timeout(
    language: &LanguageConfig,
    source: &Path,
    output_dir: &Path,
    limit: Duration,
) -> Result<CompileOutcome> {
    let Some(template) = &language.compile else {
        return Ok(CompileOutcome::Skipped);
    };

    let mapping = template_mapping(source, output_dir);
    let command = apply_template(template, &mapping);
    if command.is_empty() {
        bail!("Empty compile command for language {}", language.name);
    }

    let log_path = output_dir.join(COMPILE_LOG_FILE);
    let mut output_file = fs::File::create(&log_path)
        .with_context(|| format!("Failed to create {}", log_path.display()))?;

    log::info!("Compiling {} with {:?}", source.display(), command);

    let mut cmd = tokio::process::Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(output_file.try_clone()?))
        .stderr(Stdio::from(output_file.try_clone()?))
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
            log::info!("Compiler {} could not be started: {e}", command[0]);
            writeln!(output_file, "{}: {e}", command[0])
                .with_context(|| format!("Failed to write {}", log_path.display()))?;
            return Ok(CompileOutcome::CompilerUnavailable);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to spawn compiler {}", command[0]));
        }
    };

    let waited = timeout(limit, child.wait()).await;
    match waited {
        Ok(status) => {
            let status = status.context("Failed to wait for compiler")?;
            if status.success() {
                Ok(CompileOutcome::Success)
            } else {
                log::info!("Compilation of {} failed: {status}", source.display());
                Ok(CompileOutcome::Failed(status))
            }
        }
        Err(_) => {
            log::warn!(
                "Compilation of {} exceeded {}s, killing compiler",
                source.display(),
                limit.as_secs()
            );
            child.kill().await.context("Failed to kill compiler")?;
            Ok(CompileOutcome::TimedOut)
        }
    }
}

/// Builds the request that runs the (compiled) program with the language's limits
pub fn run_request(
    language: &LanguageConfig,
    source: &Path,
    output_dir: &Path,
    wall_time_limit: Option<Duration>,
) -> executor::Result<ExecutionRequest> {
    let mapping = template_mapping(source, output_dir);
    let command = apply_template(&language.run, &mapping);

    ExecutionRequest::new(command, language.cpu_time_limit, language.memory_limit)?
        .with_output(OutputPaths::in_dir(output_dir))?
        .with_wall_time_limit(wall_time_limit)
}

/// Values for the placeholders a command template may use
fn template_mapping(source: &Path, output_dir: &Path) -> HashMap<&'static str, String> {
    // A bare file name would be looked up in PATH instead of the output directory.
    let output_dir = if output_dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        output_dir
    };
    let class = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut mapping = HashMap::new();
    mapping.insert("%INPUT%", source.to_string_lossy().into_owned());
    mapping.insert("%OUTPUT%", path_string(output_dir.join(PROGRAM_FILE)));
    mapping.insert("%OUTDIR%", path_string(output_dir.to_path_buf()));
    mapping.insert("%CLASS%", class);
    mapping
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

/// Applies template substitutions to every argument of a command
fn apply_template(cmd_template: &[String], mapping: &HashMap<&str, String>) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn language(compile: Option<&[&str]>, run: &[&str]) -> LanguageConfig {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        LanguageConfig {
            name: "test".to_string(),
            extensions: vec!["t".to_string()],
            compile: compile.map(strings),
            run: strings(run),
            cpu_time_limit: 1,
            memory_limit: 32,
        }
    }

    #[test]
    fn test_detect_language() {
        let config = Config::default();
        let detect = |name: &str| detect_language(Path::new(name), &config).map(|l| l.name.as_str());

        assert_eq!(detect("main.cpp"), Some("cpp"));
        assert_eq!(detect("src/main.c"), Some("c"));
        assert_eq!(detect("solve.py"), Some("python"));
        assert_eq!(detect("Main.java"), Some("java"));
        assert_eq!(detect("notes.txt"), None);
        assert_eq!(detect("Makefile"), None);
        assert_eq!(detect("archive.c.bak"), None);
    }

    #[test]
    fn test_detect_language_accepts_dotted_extensions() {
        let mut config = Config::default();
        config.languages[0].extensions = vec![".cc".to_string()];
        let detected = detect_language(Path::new("a.cc"), &config).unwrap();
        assert_eq!(detected.name, "cpp");
    }

    #[test]
    fn test_template_expansion() {
        let mapping = template_mapping(Path::new("src/Main.java"), Path::new("out"));
        let config = Config::default();
        let java = &config.languages[3];

        assert_eq!(
            apply_template(java.compile.as_ref().unwrap(), &mapping),
            ["javac", "-d", "out", "src/Main.java"]
        );
        assert_eq!(
            apply_template(&java.run, &mapping),
            [
                "java",
                "-Xmx512m",
                "-XX:-UseCompressedClassPointers",
                "-cp",
                "out",
                "Main"
            ]
        );
    }

    #[test]
    fn test_native_program_path_is_never_bare() {
        let config = Config::default();
        let request = run_request(&config.languages[1], Path::new("a.c"), Path::new(""), None)
            .unwrap();
        assert_eq!(request.command(), ["./program.out".to_string()]);
    }

    #[test]
    fn test_run_request_carries_language_limits() {
        let config = Config::default();
        let java = &config.languages[3];
        let request = run_request(
            java,
            Path::new("Main.java"),
            Path::new("/tmp/box"),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        assert_eq!(request.cpu_time_limit(), 2);
        assert_eq!(request.memory_limit_mb(), 2048);
        assert_eq!(request.output(), &OutputPaths::in_dir("/tmp/box"));
        assert_eq!(request.wall_time_limit(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_compile_skipped_without_template() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = compile(&language(None, &["true"]), Path::new("x.t"), dir.path())
            .await
            .unwrap();
        assert_eq!(outcome, CompileOutcome::Skipped);
        assert!(outcome.is_runnable());
        assert!(!dir.path().join(COMPILE_LOG_FILE).exists());
    }

    #[tokio::test]
    async fn test_compile_captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let lang = language(
            Some(&["/bin/sh", "-c", "echo building %INPUT%; echo oops >&2; exit 3"]),
            &["true"],
        );

        let outcome = compile(&lang, Path::new("x.t"), dir.path()).await.unwrap();
        assert!(matches!(outcome, CompileOutcome::Failed(status) if status.code() == Some(3)));
        assert!(!outcome.is_runnable());

        let log = fs::read_to_string(dir.path().join(COMPILE_LOG_FILE)).unwrap();
        assert_eq!(log, "building x.t\noops\n");
    }

    #[tokio::test]
    async fn test_compile_success() {
        let dir = tempfile::tempdir().unwrap();
        let lang = language(Some(&["/bin/sh", "-c", "touch %OUTPUT%"]), &["%OUTPUT%"]);

        let outcome = compile(&lang, Path::new("x.t"), dir.path()).await.unwrap();
        assert_eq!(outcome, CompileOutcome::Success);
        assert!(dir.path().join(PROGRAM_FILE).exists());
    }

    #[tokio::test]
    async fn test_compile_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let lang = language(Some(&["sleep", "10"]), &["true"]);

        let outcome =
            compile_with_timeout(&lang, Path::new("x.t"), dir.path(), Duration::from_millis(200))
                .await
                .unwrap();
        assert_eq!(outcome, CompileOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_compile_missing_compiler_is_a_compile_failure() {
        let dir = tempfile::tempdir().unwrap();
        let lang = language(Some(&["definitely-not-a-compiler-7f3a"]), &["true"]);

        let outcome = compile(&lang, Path::new("x.t"), dir.path()).await.unwrap();
        assert_eq!(outcome, CompileOutcome::CompilerUnavailable);
        assert!(!outcome.is_runnable());

        let log = fs::read_to_string(dir.path().join(COMPILE_LOG_FILE)).unwrap();
        assert!(log.starts_with("definitely-not-a-compiler-7f3a: "));
    }
}
