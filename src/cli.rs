use crate::api::AgentApiClient;
use crate::model::{ClarificationMode, ClientConfig, RunEvent, RunStatus};
use crate::run::{run_controller, UiCommand};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "visual-agent-cli",
    version,
    about = "Launch a remote visual-agent run and track it to completion"
)]
pub struct Cli {
    /// Task prompt for the remote agent
    pub prompt: String,

    /// File to attach to the run (uploaded as a binary part)
    #[arg(long)]
    pub attach: Option<PathBuf>,

    /// Base URL for the agent service
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    pub base_url: String,

    /// Status poll cadence
    #[arg(long, default_value = "1500ms")]
    pub poll_interval: humantime::Duration,

    /// Per-request timeout
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// How clarification requests are detected
    #[arg(long, value_enum, default_value = "status-field")]
    pub clarification_mode: ClarificationMode,

    /// Print the final run report as JSON on stdout (progress still goes to stderr)
    #[arg(long)]
    pub json: bool,
}

/// Build a `ClientConfig` from CLI arguments. Resolved once at startup and
/// never mutated afterwards.
pub fn build_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        base_url: args.base_url.clone(),
        poll_interval: Duration::from(args.poll_interval),
        request_timeout: Duration::from(args.request_timeout),
        user_agent: format!("visual-agent-cli/{}", env!("CARGO_PKG_VERSION")),
        clarification_mode: args.clarification_mode,
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let prompt = args.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(anyhow::anyhow!("prompt must not be empty"));
    }

    let cfg = build_config(&args);
    let client = Arc::new(AgentApiClient::new(&cfg).context("failed to build API client")?);

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let controller = tokio::spawn(run_controller(
        client,
        cfg,
        prompt,
        args.attach.clone(),
        evt_tx,
        cmd_rx,
    ));

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    RunEvent::RunStarted { run_id } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!("Run started: {}", run_id)));
                    }
                    RunEvent::StatusChanged { status } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!("Status: {}", status.label())));
                    }
                    RunEvent::LogAppended { entry } => {
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "{}: {}",
                            entry.stage, entry.message
                        )));
                    }
                    RunEvent::ClarificationRequested { question } => {
                        match prompt_for_answer(&out_tx, &mut stdin_lines, &question).await {
                            Some(answer) => {
                                let _ = cmd_tx.send(UiCommand::Answer(answer));
                            }
                            // EOF on stdin: nothing more to say, tear down.
                            None => {
                                let _ = cmd_tx.send(UiCommand::Quit);
                            }
                        }
                    }
                    RunEvent::Info(info) => {
                        let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
                    }
                    // The final report arrives through the controller handle.
                    RunEvent::RunCompleted { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = out_tx.send(OutputLine::Stderr("Cancelling…".to_string()));
                let _ = cmd_tx.send(UiCommand::Quit);
            }
        }
    }

    let outcome = controller.await.context("controller task failed")?;
    let exit = match outcome {
        Ok(report) => {
            if args.json {
                let json = serde_json::to_string_pretty(&report)?;
                let _ = out_tx.send(OutputLine::Stdout(json));
            } else {
                for line in crate::text_summary::build_text_summary(&report).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
            if report.status == RunStatus::Error {
                Err(anyhow::anyhow!("run finished with status error"))
            } else {
                Ok(())
            }
        }
        Err(error) => Err(anyhow::Error::new(error)),
    };

    drop(out_tx);
    let _ = out_handle.await;
    exit
}

/// Show the remote question and read an answer from stdin. Empty lines
/// re-prompt (an empty answer is a deliberate no-op, so there is nothing to
/// send); `None` means stdin reached EOF.
async fn prompt_for_answer(
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    stdin_lines: &mut Lines<BufReader<Stdin>>,
    question: &str,
) -> Option<String> {
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "Additional info needed: {}",
        question
    )));
    loop {
        let _ = out_tx.send(OutputLine::Stderr("Answer: ".to_string()));
        match stdin_lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    let _ = out_tx.send(OutputLine::Stderr(
                        "Empty answer, nothing sent. Enter an answer or press Ctrl-C.".to_string(),
                    ));
                    continue;
                }
                return Some(trimmed.to_string());
            }
            Ok(None) | Err(_) => return None,
        }
    }
}
