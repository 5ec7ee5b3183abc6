use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Name of the language table looked up in the user's config directory
pub const CONFIG_FILE_NAME: &str = "languages.json";

const DEFAULT_CPU_TIME_LIMIT: u64 = 2; // seconds
const DEFAULT_MEMORY_LIMIT: u64 = 64; // MB

#[derive(Parser, Debug)]
#[command(name = "sandbox", version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the language configuration file
    #[arg(long = "config", short = 'c', global = true)]
    pub config_path: Option<PathBuf>,

    /// Directory receiving stdout.txt, stderr.txt and compiler output
    #[arg(long = "output-dir", short = 'o', default_value = ".", global = true)]
    pub output_dir: PathBuf,

    /// Print the report as JSON
    #[arg(long, default_value_t = false, global = true)]
    pub json: bool,

    /// Kill the program once this many seconds of wall-clock time have passed
    #[arg(long = "wall-time", value_parser = parse_seconds, global = true)]
    pub wall_time: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Detect the language of a source file, compile it if needed and run it
    Run {
        /// Source file (.c, .cpp, .py, .java with the built-in table)
        source: PathBuf,
    },

    /// Run an arbitrary command under resource limits
    Exec {
        /// CPU time limit in seconds
        #[arg(long = "cpu-time", default_value_t = DEFAULT_CPU_TIME_LIMIT)]
        cpu_time: u64,

        /// Memory (address space) limit in megabytes
        #[arg(long = "memory", default_value_t = DEFAULT_MEMORY_LIMIT)]
        memory: u64,

        /// Program and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

impl CliArgs {
    /// Load the language table from `--config`, the user config directory, or the built-in defaults
    pub fn to_config(&self) -> anyhow::Result<Config> {
        if let Some(path) = &self.config_path {
            return Config::from_path(path);
        }

        match Config::default_path() {
            Some(path) if path.exists() => {
                log::debug!("Using language table {}", path.display());
                Config::from_path(&path)
            }
            _ => Ok(Config::default()),
        }
    }
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid number of seconds: {e}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("wall time must be a positive number of seconds".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub languages: Vec<LanguageConfig>,
}

impl Config {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// `<config dir>/sandbox/languages.json` on this platform
    pub fn default_path() -> Option<PathBuf> {
        use directories::ProjectDirs;

        ProjectDirs::from("", "", "sandbox").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }
}

impl Default for Config {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            languages: vec![
                LanguageConfig {
                    name: "cpp".to_string(),
                    extensions: strings(&["cpp"]),
                    compile: Some(strings(&["g++", "%INPUT%", "-o", "%OUTPUT%"])),
                    run: strings(&["%OUTPUT%"]),
                    cpu_time_limit: DEFAULT_CPU_TIME_LIMIT,
                    memory_limit: DEFAULT_MEMORY_LIMIT,
                },
                LanguageConfig {
                    name: "c".to_string(),
                    extensions: strings(&["c"]),
                    compile: Some(strings(&["gcc", "%INPUT%", "-o", "%OUTPUT%"])),
                    run: strings(&["%OUTPUT%"]),
                    cpu_time_limit: DEFAULT_CPU_TIME_LIMIT,
                    memory_limit: DEFAULT_MEMORY_LIMIT,
                },
                LanguageConfig {
                    name: "python".to_string(),
                    extensions: strings(&["py"]),
                    compile: None,
                    run: strings(&["python3", "%INPUT%"]),
                    cpu_time_limit: DEFAULT_CPU_TIME_LIMIT,
                    memory_limit: DEFAULT_MEMORY_LIMIT,
                },
                // The JVM reserves far more address space than it uses.
                LanguageConfig {
                    name: "java".to_string(),
                    extensions: strings(&["java"]),
                    compile: Some(strings(&["javac", "-d", "%OUTDIR%", "%INPUT%"])),
                    run: strings(&[
                        "java",
                        "-Xmx512m",
                        "-XX:-UseCompressedClassPointers",
                        "-cp",
                        "%OUTDIR%",
                        "%CLASS%",
                    ]),
                    cpu_time_limit: DEFAULT_CPU_TIME_LIMIT,
                    memory_limit: 2048,
                },
            ],
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    pub name: String,
    /// File extensions without the leading dot
    pub extensions: Vec<String>,
    /// Compiler command template; `None` for interpreted languages
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run command template
    pub run: Vec<String>,
    /// Seconds
    #[serde(default = "default_cpu_time_limit")]
    pub cpu_time_limit: u64,
    /// Megabytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,
}

fn default_cpu_time_limit() -> u64 {
    DEFAULT_CPU_TIME_LIMIT
}

fn default_memory_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_deserialization() {
        let config = Config::from_path(Path::new("data/languages.json")).unwrap();
        assert_eq!(config.languages.len(), 2);
        assert_eq!(config.languages[0].name, "c");
        assert_eq!(config.languages[0].cpu_time_limit, 1);
        assert_eq!(config.languages[1].compile, None);
        // Omitted limits fall back to the defaults.
        assert_eq!(config.languages[1].cpu_time_limit, 2);
        assert_eq!(config.languages[1].memory_limit, 64);
    }

    #[test]
    fn test_builtin_table() {
        let config = Config::default();
        let names: Vec<_> = config.languages.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["cpp", "c", "python", "java"]);

        let java = &config.languages[3];
        assert_eq!(java.memory_limit, 2048);
        assert_eq!(java.cpu_time_limit, 2);
        assert!(config.languages[..3].iter().all(|l| l.memory_limit == 64));
    }

    #[test]
    fn test_cli_exec_parsing() {
        let cli = CliArgs::try_parse_from([
            "sandbox",
            "--wall-time",
            "1.5",
            "exec",
            "--cpu-time",
            "3",
            "--",
            "/bin/echo",
            "-n",
            "hi",
        ])
        .unwrap();

        assert_eq!(cli.output_dir, PathBuf::from("."));
        assert_eq!(cli.wall_time, Some(Duration::from_millis(1500)));
        match cli.command {
            Command::Exec {
                cpu_time,
                memory,
                command,
            } => {
                assert_eq!(cpu_time, 3);
                assert_eq!(memory, 64);
                assert_eq!(command, ["/bin/echo", "-n", "hi"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_run_parsing() {
        let cli =
            CliArgs::try_parse_from(["sandbox", "run", "main.py", "-o", "out", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.output_dir, PathBuf::from("out"));
        assert!(matches!(cli.command, Command::Run { source } if source == Path::new("main.py")));
    }

    #[test]
    fn test_cli_rejects_bad_wall_time() {
        assert!(CliArgs::try_parse_from(["sandbox", "--wall-time", "0", "run", "a.c"]).is_err());
        assert!(CliArgs::try_parse_from(["sandbox", "--wall-time", "x", "run", "a.c"]).is_err());
    }
}
