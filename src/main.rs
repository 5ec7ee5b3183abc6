use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use sandbox::config::{CliArgs, Command};
use sandbox::create_timestamp;
use sandbox::executor::{self, ExecutionRequest, OutputPaths};
use sandbox::language::{self, COMPILE_LOG_FILE, CompileOutcome};
use sandbox::output::{RunSummary, write_captured};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();

    std::fs::create_dir_all(&cli.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            cli.output_dir.display()
        )
    })?;

    let request = match &cli.command {
        Command::Run { source } => {
            let config = cli.to_config().context("Failed to load configuration")?;

            let Some(lang) = language::detect_language(source, &config) else {
                println!("Unsupported file type.");
                return Ok(ExitCode::FAILURE);
            };
            println!("Detected Language: {}", lang.name);

            let outcome = language::compile(lang, source, &cli.output_dir).await?;
            if !outcome.is_runnable() {
                if outcome == CompileOutcome::TimedOut {
                    println!("Compilation timed out.");
                }
                println!("Compilation failed. Check {COMPILE_LOG_FILE}.");
                write_captured(
                    &mut std::io::stdout().lock(),
                    &cli.output_dir.join(COMPILE_LOG_FILE),
                    "Compilation Errors",
                )?;
                return Ok(ExitCode::FAILURE);
            }

            language::run_request(lang, source, &cli.output_dir, cli.wall_time)?
        }
        Command::Exec {
            cpu_time,
            memory,
            command,
        } => ExecutionRequest::new(command.clone(), *cpu_time, *memory)?
            .with_output(OutputPaths::in_dir(&cli.output_dir))?
            .with_wall_time_limit(cli.wall_time)?,
    };

    let output = request.output().clone();
    let started_at = create_timestamp();

    // ======= EXECUTION START =======

    let report = tokio::task::spawn_blocking(move || executor::execute(request))
        .await
        .context("Executor task panicked")??;

    // ======= EXECUTION END, REPORTING =======

    let mut stdout = std::io::stdout().lock();
    write_captured(&mut stdout, &output.stdout, "Program Output")?;
    write_captured(&mut stdout, &output.stderr, "Program Errors")?;

    if cli.json {
        let summary = RunSummary {
            started_at,
            report: &report,
        };
        writeln!(stdout, "{}", serde_json::to_string_pretty(&summary)?)?;
    } else {
        writeln!(stdout, "\n{report}")?;
    }

    Ok(ExitCode::SUCCESS)
}
