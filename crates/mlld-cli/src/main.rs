// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mlld_config::EnvConfig;
use mlld_core::MlldError;
use mlld_env::{BufferedEffects, TerminalEffects};
use mlld_interp::{Interpreter, JsonAstLoader, ProgramLoader, RunOptions};
use mlld_pipeline::ParallelOptions;
use mlld_protocol::{Frame, NdjsonCodec, RequestKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;
/// Exit code for syntax and validation errors.
const EXIT_VALIDATION_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "mlld", version, about = "mlld runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Program to interpret (shorthand for `mlld run <file>`).
    file: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Markdown output, verbatim.
    Md,
    /// Output prepared for LLM consumption.
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Strict,
    Permissive,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interpret a program.
    Run {
        /// Program file (serialized AST).
        file: PathBuf,

        /// Undefined variables become fatal.
        #[arg(long)]
        strict: bool,

        /// Write program output to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,

        /// Per-execution timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Resolution mode; `--mode strict` is equivalent to `--strict`.
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Permit absolute paths in loads and path bindings.
        #[arg(long)]
        allow_absolute_paths: bool,
    },

    /// Parse a program and report diagnostics without running it.
    Validate {
        /// Program file (serialized AST).
        file: PathBuf,
    },

    /// NDJSON RPC over stdin/stdout for embedding.
    Live {
        /// Required: frames flow over stdio.
        #[arg(long)]
        stdio: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

/// Print one diagnostic and map it to the exit-code contract.
///
/// Classified runtime errors print their catalog rendering and carry their
/// own exit code; anything else surfaces the context chain and exits 1.
fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<MlldError>() {
        Some(classified) => {
            eprintln!("{}", classified.render());
            classified.exit_code()
        }
        None => {
            eprintln!("{err:#}");
            EXIT_RUNTIME_ERROR
        }
    }
}

fn usage() -> ! {
    eprintln!(
        "usage: mlld <file> | mlld run <file> | mlld validate <file> | mlld live --stdio"
    );
    std::process::exit(EXIT_VALIDATION_ERROR);
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Run {
            file,
            strict,
            output,
            format,
            timeout,
            mode,
            allow_absolute_paths,
        }) => {
            let strict = strict || mode == Some(Mode::Strict);
            run_file(
                &file,
                strict,
                output.as_deref(),
                format,
                timeout,
                allow_absolute_paths,
            )
            .await
        }
        Some(Commands::Validate { file }) => validate_file(&file).await,
        Some(Commands::Live { stdio }) => {
            if !stdio {
                usage();
            }
            live_loop().await
        }
        None => match cli.file {
            Some(file) => run_file(&file, false, None, OutputFormat::Md, None, false).await,
            None => usage(),
        },
    }
}

fn options_for(
    file: &Path,
    strict: bool,
    timeout: Option<u64>,
    allow_absolute_paths: bool,
) -> RunOptions {
    let env = EnvConfig::from_env();
    RunOptions {
        strict,
        max_retries: env
            .max_retries
            .unwrap_or(mlld_pipeline::DEFAULT_MAX_RETRIES),
        timeout: timeout.map(Duration::from_secs),
        parallel: env
            .parallel_limit
            .map(ParallelOptions::with_cap)
            .unwrap_or_default(),
        streaming: false,
        base_dir: file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
        allow_absolute_paths,
    }
}

async fn run_file(
    file: &Path,
    strict: bool,
    output: Option<&Path>,
    _format: OutputFormat,
    timeout: Option<u64>,
    allow_absolute_paths: bool,
) -> Result<()> {
    let program = JsonAstLoader
        .load(file)
        .await
        .with_context(|| format!("load program '{}'", file.display()))?;
    let options = options_for(file, strict, timeout, allow_absolute_paths);

    match output {
        None => {
            let interpreter = Interpreter::new(Arc::new(TerminalEffects), options);
            interpreter.run_program(&program).await?;
        }
        Some(path) => {
            let buffer = Arc::new(BufferedEffects::new());
            let interpreter = Interpreter::new(buffer.clone(), options);
            interpreter.run_program(&program).await?;
            std::fs::write(path, buffer.stdout())
                .with_context(|| format!("write output '{}'", path.display()))?;
        }
    }
    Ok(())
}

async fn validate_file(file: &Path) -> Result<()> {
    JsonAstLoader
        .load(file)
        .await
        .with_context(|| format!("validate '{}'", file.display()))?;
    println!("ok");
    Ok(())
}

/// Serve NDJSON frames until `close` or EOF.
async fn live_loop() -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("read frame from stdin")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let frame = match NdjsonCodec::decode(&line) {
            Ok(frame) => frame,
            Err(err) => {
                let reply = Frame::err(0, err.code().code(), err.to_string());
                write_frame(&mut stdout, &reply).await;
                continue;
            }
        };
        let Frame::Request { id, method, params } = frame else {
            continue;
        };
        let kind = match RequestKind::parse(&method) {
            Ok(kind) => kind,
            Err(err) => {
                let reply = Frame::err(id, err.code().code(), err.to_string());
                write_frame(&mut stdout, &reply).await;
                continue;
            }
        };
        match kind {
            RequestKind::Close => {
                write_frame(&mut stdout, &Frame::ok(id, serde_json::json!({}))).await;
                break;
            }
            RequestKind::Cancel => {
                write_frame(&mut stdout, &Frame::ok(id, serde_json::json!({}))).await;
            }
            RequestKind::UpdateState => {
                // State is embedder-owned; acknowledge receipt.
                write_frame(&mut stdout, &Frame::ok(id, serde_json::json!({}))).await;
            }
            RequestKind::Analyze => {
                let reply = match parse_program(&params) {
                    Ok(_) => Frame::ok(id, serde_json::json!({"valid": true})),
                    Err(err) => Frame::err(id, err.code().code(), err.render()),
                };
                write_frame(&mut stdout, &reply).await;
            }
            RequestKind::Process | RequestKind::Execute => {
                let reply = match parse_program(&params) {
                    Ok(program) => {
                        let buffer = Arc::new(BufferedEffects::new());
                        let interpreter =
                            Interpreter::new(buffer.clone(), RunOptions::default());
                        match interpreter.run_program(&program).await {
                            Ok(()) => {
                                let output = buffer.stdout();
                                if kind == RequestKind::Execute && !output.is_empty() {
                                    write_frame(
                                        &mut stdout,
                                        &Frame::state_write(output.clone()),
                                    )
                                    .await;
                                }
                                Frame::ok(id, serde_json::json!({"output": output}))
                            }
                            Err(err) => Frame::err(id, err.code().code(), err.render()),
                        }
                    }
                    Err(err) => Frame::err(id, err.code().code(), err.render()),
                };
                write_frame(&mut stdout, &reply).await;
            }
        }
    }
    Ok(())
}

fn parse_program(params: &serde_json::Value) -> std::result::Result<mlld_core::ast::Program, MlldError> {
    let program = params
        .get("program")
        .cloned()
        .unwrap_or_else(|| params.clone());
    Ok(serde_json::from_value(program)?)
}

async fn write_frame(stdout: &mut tokio::io::Stdout, frame: &Frame) {
    if let Ok(line) = NdjsonCodec::encode(frame) {
        let _ = stdout.write_all(line.as_bytes()).await;
        let _ = stdout.flush().await;
    }
}
