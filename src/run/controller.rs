//! Run lifecycle controller.
//!
//! Owns the state machine and at most one live poll session, multiplexes
//! poll completions and user commands on a single task, and emits events
//! for presentation layers.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::api::AgentBackend;
use crate::error::RunError;
use crate::model::{ClientConfig, InfoEvent, RunEvent, RunReport, RunStatus};
use crate::run::machine::{PollDirective, RunMachine};
use crate::run::poller::{PollMsg, PollSession};

/// Commands emitted by UI layers to control the running job.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    /// Free-text clarification answer. Empty/whitespace-only text dismisses
    /// the dialog without contacting the remote system.
    Answer(String),
    Quit,
}

/// Submit a run and drive it to completion. Emits `RunEvent`s along the way
/// and returns the final report; submission failures, poll failures, and
/// user teardown surface as `RunError`.
pub(crate) async fn run_controller<B: AgentBackend>(
    backend: Arc<B>,
    config: ClientConfig,
    prompt: String,
    attachment: Option<PathBuf>,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<RunReport, RunError> {
    let run_id = backend
        .start_run(prompt.clone(), attachment)
        .await
        .map_err(RunError::Submission)?;

    let mut machine = RunMachine::new(config.clarification_mode);
    forward(&event_tx, machine.begin_run(run_id.clone()));

    let (poll_tx, mut poll_rx) = mpsc::unbounded_channel::<PollMsg>();
    let mut session = Some(PollSession::start(
        backend.clone(),
        run_id.clone(),
        machine.generation(),
        config.poll_interval,
        poll_tx.clone(),
    ));

    loop {
        tokio::select! {
            msg = poll_rx.recv() => {
                // We hold poll_tx, so the channel cannot close under us.
                let Some(msg) = msg else {
                    break Err(RunError::Cancelled);
                };
                match msg.outcome {
                    Ok(snap) => {
                        let applied = machine.apply_snapshot(msg.generation, msg.seq, snap);
                        forward(&event_tx, applied.events);
                        match applied.directive {
                            PollDirective::Continue => {}
                            PollDirective::Pause => {
                                retire(&mut session);
                            }
                            PollDirective::Stop => {
                                retire(&mut session);
                                let report = build_report(&machine, &config, &prompt, &run_id);
                                let _ = event_tx.send(RunEvent::RunCompleted {
                                    report: Box::new(report.clone()),
                                });
                                break Ok(report);
                            }
                        }
                    }
                    Err(error) => {
                        let applied =
                            machine.record_poll_failure(msg.generation, msg.seq, &error.to_string());
                        let applied_now = !applied.events.is_empty();
                        forward(&event_tx, applied.events);
                        // Stale failures from retired sessions are discarded;
                        // a live one is run-terminal with no retry.
                        if applied_now && machine.status() == RunStatus::Error {
                            retire(&mut session);
                            break Err(RunError::Poll(error));
                        }
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Answer(text)) => {
                        let trimmed = text.trim();
                        if machine.status() != RunStatus::NeedsInput {
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(
                                "No clarification outstanding".to_string(),
                            )));
                        } else if trimmed.is_empty() {
                            // Deliberate no-op path: dialog dismissed, nothing sent.
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::AnswerSkipped));
                        } else {
                            deliver_answer(&backend, &event_tx, &run_id, trimmed);
                            forward(&event_tx, machine.answer_accepted());
                            retire(&mut session);
                            session = Some(PollSession::start(
                                backend.clone(),
                                run_id.clone(),
                                machine.generation(),
                                config.poll_interval,
                                poll_tx.clone(),
                            ));
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        retire(&mut session);
                        break Err(RunError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Fire-and-forget answer delivery: the run resumes regardless of the
/// acknowledgement, and a transport failure is reported but never fatal.
fn deliver_answer<B: AgentBackend>(
    backend: &Arc<B>,
    event_tx: &UnboundedSender<RunEvent>,
    run_id: &str,
    answer: &str,
) {
    let fut = backend.deliver_answer(run_id.to_string(), answer.to_string());
    let tx = event_tx.clone();
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                let _ = tx.send(RunEvent::Info(InfoEvent::AnswerSent { run_id }));
            }
            Err(error) => {
                let _ = tx.send(RunEvent::Info(InfoEvent::AnswerDeliveryFailed {
                    message: RunError::Clarification(error).to_string(),
                }));
            }
        }
    });
}

fn retire(session: &mut Option<PollSession>) {
    if let Some(session) = session.take() {
        session.retire();
    }
}

fn forward(event_tx: &UnboundedSender<RunEvent>, events: Vec<RunEvent>) {
    for event in events {
        let _ = event_tx.send(event);
    }
}

fn build_report(
    machine: &RunMachine,
    config: &ClientConfig,
    prompt: &str,
    run_id: &str,
) -> RunReport {
    RunReport {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        base_url: config.base_url.clone(),
        run_id: run_id.to_string(),
        prompt: prompt.to_string(),
        status: machine.status(),
        logs: machine.logs().to_vec(),
        result: machine.result().cloned(),
    }
}
