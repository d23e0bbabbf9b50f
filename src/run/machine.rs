//! Authoritative in-memory model of one run's lifecycle.
//!
//! The machine is synchronous and single-owner: the controller task applies
//! poll completions and user answers to it, and forwards the resulting
//! events to presentation layers. Snapshots are tagged with a session
//! generation and a per-session sequence number; anything stale is discarded
//! before it can touch state.

use crate::model::{
    ClarificationMode, LogEntry, RunEvent, RunStatus, StatusSnapshot, ERROR_STAGE, REPROMPT_STAGE,
};

/// What the controller should do with the poll session after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PollDirective {
    #[default]
    Continue,
    /// Retire the session until a clarification answer is accepted.
    Pause,
    /// Terminal state reached; retire the session permanently.
    Stop,
}

/// Outcome of applying one update to the machine.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub events: Vec<RunEvent>,
    pub directive: PollDirective,
}

pub(crate) struct RunMachine {
    clarification_mode: ClarificationMode,
    run_id: Option<String>,
    status: RunStatus,
    logs: Vec<LogEntry>,
    /// Question currently presented to the user, awaiting their answer.
    pending_question: Option<String>,
    /// Question already answered; suppressed until the server stops reporting it.
    answered_question: Option<String>,
    result: Option<crate::model::RunResult>,
    generation: u64,
    last_seq: u64,
}

impl RunMachine {
    pub fn new(clarification_mode: ClarificationMode) -> Self {
        Self {
            clarification_mode,
            run_id: None,
            status: RunStatus::Idle,
            logs: Vec::new(),
            pending_question: None,
            answered_question: None,
            result: None,
            generation: 0,
            last_seq: 0,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn result(&self) -> Option<&crate::model::RunResult> {
        self.result.as_ref()
    }

    /// Current poll-session generation. Bumped whenever a new session starts
    /// so completions from retired sessions can never apply.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Accept a submitted run: clear any prior state and enter `Running`.
    pub fn begin_run(&mut self, run_id: String) -> Vec<RunEvent> {
        self.run_id = Some(run_id.clone());
        self.logs.clear();
        self.result = None;
        self.pending_question = None;
        self.answered_question = None;
        self.generation += 1;
        self.last_seq = 0;
        let mut events = vec![RunEvent::RunStarted { run_id }];
        self.set_status(RunStatus::Running, &mut events);
        events
    }

    /// Apply one fetched snapshot. Stale snapshots (retired generation, or a
    /// sequence number not beyond the last applied) are discarded wholesale;
    /// re-applying an identical snapshot produces no events.
    pub fn apply_snapshot(&mut self, generation: u64, seq: u64, snap: StatusSnapshot) -> Applied {
        if self.status.is_terminal() {
            return Applied {
                events: Vec::new(),
                directive: PollDirective::Stop,
            };
        }
        if generation != self.generation || seq <= self.last_seq {
            return Applied::default();
        }
        self.last_seq = seq;

        let mut events = Vec::new();

        // The snapshot carries the full log so far, not a delta. Diff locally
        // and tolerate a shorter-than-seen list without emitting anything.
        let new_entries: Vec<LogEntry> = if snap.logs.len() >= self.logs.len() {
            snap.logs[self.logs.len()..].to_vec()
        } else {
            Vec::new()
        };
        if snap.logs.len() >= self.logs.len() {
            self.logs = snap.logs.clone();
        }
        for entry in &new_entries {
            events.push(RunEvent::LogAppended {
                entry: entry.clone(),
            });
        }

        if snap.status.is_terminal() {
            if snap.result.is_some() {
                self.result = snap.result;
            }
            self.pending_question = None;
            self.answered_question = None;
            self.set_status(snap.status, &mut events);
            return Applied {
                events,
                directive: PollDirective::Stop,
            };
        }

        match detect_clarification(self.clarification_mode, &snap, &new_entries) {
            Some(question) => {
                if self.answered_question.as_deref() == Some(question.as_str()) {
                    // The server has not absorbed the delivered answer yet;
                    // keep polling rather than re-opening the dialog.
                    Applied {
                        events,
                        directive: PollDirective::Continue,
                    }
                } else if self.pending_question.as_deref() == Some(question.as_str()) {
                    // Already presented; repeated polls must not re-trigger it.
                    self.set_status(RunStatus::NeedsInput, &mut events);
                    Applied {
                        events,
                        directive: PollDirective::Pause,
                    }
                } else {
                    self.pending_question = Some(question.clone());
                    self.answered_question = None;
                    self.set_status(RunStatus::NeedsInput, &mut events);
                    events.push(RunEvent::ClarificationRequested { question });
                    Applied {
                        events,
                        directive: PollDirective::Pause,
                    }
                }
            }
            None => {
                // Question gone from the wire: the suppression window closes,
                // so a later identical question is a distinct event again.
                self.pending_question = None;
                self.answered_question = None;
                self.set_status(RunStatus::Running, &mut events);
                Applied {
                    events,
                    directive: PollDirective::Continue,
                }
            }
        }
    }

    /// Record a failed status fetch: run-terminal, no retry. Failures from
    /// retired sessions are discarded like any other stale completion.
    pub fn record_poll_failure(&mut self, generation: u64, seq: u64, message: &str) -> Applied {
        if self.status.is_terminal() {
            return Applied {
                events: Vec::new(),
                directive: PollDirective::Stop,
            };
        }
        if generation != self.generation || seq <= self.last_seq {
            return Applied::default();
        }
        self.last_seq = seq;

        let entry = LogEntry::new(ERROR_STAGE, message);
        self.logs.push(entry.clone());
        let mut events = vec![RunEvent::LogAppended { entry }];
        self.pending_question = None;
        self.answered_question = None;
        self.set_status(RunStatus::Error, &mut events);
        Applied {
            events,
            directive: PollDirective::Stop,
        }
    }

    /// A non-empty clarification answer was accepted: resume the run under a
    /// fresh session generation, regardless of the delivery acknowledgement.
    pub fn answer_accepted(&mut self) -> Vec<RunEvent> {
        if self.status != RunStatus::NeedsInput {
            return Vec::new();
        }
        self.answered_question = self.pending_question.take();
        self.generation += 1;
        self.last_seq = 0;
        let mut events = Vec::new();
        self.set_status(RunStatus::Running, &mut events);
        events
    }

    fn set_status(&mut self, status: RunStatus, events: &mut Vec<RunEvent>) {
        if self.status != status {
            self.status = status;
            events.push(RunEvent::StatusChanged { status });
        }
    }
}

/// Decide whether a snapshot carries an outstanding clarification question.
/// Pure inspection; `new_entries` are the log entries not seen before this
/// snapshot, so the legacy marker scan never re-reads old markers.
fn detect_clarification(
    mode: ClarificationMode,
    snap: &StatusSnapshot,
    new_entries: &[LogEntry],
) -> Option<String> {
    match mode {
        ClarificationMode::StatusField => {
            if snap.status != RunStatus::NeedsInput {
                return None;
            }
            snap.pending_question
                .clone()
                .filter(|q| !q.trim().is_empty())
                .or_else(|| scan_reprompt_marker(new_entries))
                .or_else(|| Some("Additional input required".to_string()))
        }
        ClarificationMode::LogMarker => scan_reprompt_marker(new_entries),
    }
}

/// Legacy clarification detection: the last new entry tagged with the
/// reprompt marker stage carries the question as its message.
fn scan_reprompt_marker(entries: &[LogEntry]) -> Option<String> {
    entries
        .iter()
        .rev()
        .find(|entry| entry.stage == REPROMPT_STAGE && !entry.message.trim().is_empty())
        .map(|entry| entry.message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionItem, RunResult};

    fn machine() -> RunMachine {
        let mut m = RunMachine::new(ClarificationMode::StatusField);
        m.begin_run("r1".to_string());
        m
    }

    fn snapshot(status: RunStatus, logs: &[(&str, &str)]) -> StatusSnapshot {
        StatusSnapshot {
            status,
            logs: logs
                .iter()
                .map(|(stage, message)| LogEntry::new(*stage, *message))
                .collect(),
            pending_question: None,
            result: None,
        }
    }

    fn has_clarification(events: &[RunEvent]) -> Option<String> {
        events.iter().find_map(|ev| match ev {
            RunEvent::ClarificationRequested { question } => Some(question.clone()),
            _ => None,
        })
    }

    #[test]
    fn begin_run_enters_running_and_resets_state() {
        let mut m = RunMachine::new(ClarificationMode::StatusField);
        let events = m.begin_run("r1".to_string());
        assert_eq!(m.status(), RunStatus::Running);
        assert_eq!(m.run_id(), Some("r1"));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RunEvent::RunStarted { run_id } if run_id == "r1")));
        assert_eq!(m.generation(), 1);
    }

    #[test]
    fn running_snapshot_appends_only_new_log_entries() {
        let mut m = machine();
        let gen = m.generation();

        let applied = m.apply_snapshot(gen, 1, snapshot(RunStatus::Running, &[("plan", "a")]));
        assert_eq!(applied.directive, PollDirective::Continue);
        let appended: Vec<_> = applied
            .events
            .iter()
            .filter(|ev| matches!(ev, RunEvent::LogAppended { .. }))
            .collect();
        assert_eq!(appended.len(), 1);

        let applied = m.apply_snapshot(
            gen,
            2,
            snapshot(RunStatus::Running, &[("plan", "a"), ("act", "b")]),
        );
        let appended: Vec<_> = applied
            .events
            .iter()
            .filter_map(|ev| match ev {
                RunEvent::LogAppended { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].stage, "act");
        assert_eq!(m.logs().len(), 2);
    }

    #[test]
    fn identical_snapshot_is_a_no_op() {
        let mut m = machine();
        let gen = m.generation();
        m.apply_snapshot(gen, 1, snapshot(RunStatus::Running, &[("plan", "a")]));
        let applied = m.apply_snapshot(gen, 2, snapshot(RunStatus::Running, &[("plan", "a")]));
        assert!(applied.events.is_empty());
        assert_eq!(m.logs().len(), 1);
    }

    #[test]
    fn stale_sequence_numbers_are_discarded() {
        let mut m = machine();
        let gen = m.generation();
        m.apply_snapshot(gen, 2, snapshot(RunStatus::Running, &[("plan", "a"), ("act", "b")]));

        // A late-arriving earlier fetch must not shrink the log or emit anything.
        let applied = m.apply_snapshot(gen, 1, snapshot(RunStatus::Running, &[("plan", "a")]));
        assert!(applied.events.is_empty());
        assert_eq!(m.logs().len(), 2);

        // Same seq twice is equally stale.
        let applied = m.apply_snapshot(gen, 2, snapshot(RunStatus::Error, &[]));
        assert!(applied.events.is_empty());
        assert_eq!(m.status(), RunStatus::Running);
    }

    #[test]
    fn retired_generation_cannot_mutate_state() {
        let mut m = machine();
        let old_gen = m.generation();
        m.apply_snapshot(
            old_gen,
            1,
            StatusSnapshot {
                pending_question: Some("Which email?".to_string()),
                ..snapshot(RunStatus::NeedsInput, &[])
            },
        );
        m.answer_accepted();
        let new_gen = m.generation();
        assert!(new_gen > old_gen);

        let applied = m.apply_snapshot(old_gen, 5, snapshot(RunStatus::Error, &[]));
        assert!(applied.events.is_empty());
        assert_eq!(m.status(), RunStatus::Running);
        assert_eq!(applied.directive, PollDirective::Continue);
    }

    #[test]
    fn new_run_discards_updates_from_the_previous_one() {
        let mut m = machine();
        let old_gen = m.generation();
        m.apply_snapshot(old_gen, 1, snapshot(RunStatus::Running, &[("plan", "old")]));

        m.begin_run("r2".to_string());
        assert_eq!(m.run_id(), Some("r2"));
        assert!(m.logs().is_empty());

        // A completion from the first run's session arrives late.
        let applied = m.apply_snapshot(old_gen, 2, snapshot(RunStatus::Success, &[]));
        assert!(applied.events.is_empty());
        assert_eq!(m.status(), RunStatus::Running);
    }

    #[test]
    fn needs_input_presents_question_once() {
        let mut m = machine();
        let gen = m.generation();
        let snap = StatusSnapshot {
            pending_question: Some("Which email?".to_string()),
            ..snapshot(RunStatus::NeedsInput, &[])
        };

        let applied = m.apply_snapshot(gen, 1, snap.clone());
        assert_eq!(applied.directive, PollDirective::Pause);
        assert_eq!(
            has_clarification(&applied.events).as_deref(),
            Some("Which email?")
        );
        assert_eq!(m.status(), RunStatus::NeedsInput);

        // Repeated identical polls must not re-trigger the dialog.
        let applied = m.apply_snapshot(gen, 2, snap);
        assert!(has_clarification(&applied.events).is_none());
        assert_eq!(applied.directive, PollDirective::Pause);
    }

    #[test]
    fn answer_accepted_resumes_under_new_generation() {
        let mut m = machine();
        let gen = m.generation();
        m.apply_snapshot(
            gen,
            1,
            StatusSnapshot {
                pending_question: Some("Which email?".to_string()),
                ..snapshot(RunStatus::NeedsInput, &[])
            },
        );

        let events = m.answer_accepted();
        assert_eq!(m.status(), RunStatus::Running);
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RunEvent::StatusChanged { status: RunStatus::Running })));
        assert_eq!(m.generation(), gen + 1);
    }

    #[test]
    fn answered_question_still_on_wire_does_not_reopen_dialog() {
        let mut m = machine();
        let gen = m.generation();
        let snap = StatusSnapshot {
            pending_question: Some("Which email?".to_string()),
            ..snapshot(RunStatus::NeedsInput, &[])
        };
        m.apply_snapshot(gen, 1, snap.clone());
        m.answer_accepted();

        // First poll of the resumed session races the answer delivery and
        // still shows the old question: keep polling, no dialog, no pause.
        let applied = m.apply_snapshot(m.generation(), 1, snap.clone());
        assert!(has_clarification(&applied.events).is_none());
        assert_eq!(applied.directive, PollDirective::Continue);
        assert_eq!(m.status(), RunStatus::Running);

        // Once the wire shows the question cleared, the same text later is a
        // distinct clarification event again.
        m.apply_snapshot(m.generation(), 2, snapshot(RunStatus::Running, &[]));
        let applied = m.apply_snapshot(m.generation(), 3, snap);
        assert_eq!(
            has_clarification(&applied.events).as_deref(),
            Some("Which email?")
        );
    }

    #[test]
    fn log_marker_mode_extracts_question_from_new_entries() {
        let mut m = RunMachine::new(ClarificationMode::LogMarker);
        m.begin_run("r1".to_string());
        let gen = m.generation();

        let applied = m.apply_snapshot(
            gen,
            1,
            snapshot(
                RunStatus::Running,
                &[("plan", "a"), (REPROMPT_STAGE, "Which email?")],
            ),
        );
        assert_eq!(
            has_clarification(&applied.events).as_deref(),
            Some("Which email?")
        );
        assert_eq!(m.status(), RunStatus::NeedsInput);
        assert_eq!(applied.directive, PollDirective::Pause);
    }

    #[test]
    fn log_marker_mode_ignores_markers_already_seen() {
        let mut m = RunMachine::new(ClarificationMode::LogMarker);
        m.begin_run("r1".to_string());
        let gen = m.generation();
        m.apply_snapshot(gen, 1, snapshot(RunStatus::Running, &[(REPROMPT_STAGE, "q1")]));
        m.answer_accepted();

        // The marker is still in the full log on every later poll; only new
        // entries are scanned, so no duplicate dialog.
        let applied = m.apply_snapshot(
            m.generation(),
            1,
            snapshot(
                RunStatus::Running,
                &[(REPROMPT_STAGE, "q1"), ("act", "continuing")],
            ),
        );
        assert!(has_clarification(&applied.events).is_none());
        assert_eq!(m.status(), RunStatus::Running);
    }

    #[test]
    fn terminal_snapshot_stores_result_and_stops() {
        let mut m = machine();
        let gen = m.generation();
        let applied = m.apply_snapshot(
            gen,
            1,
            StatusSnapshot {
                result: Some(RunResult {
                    final_message: "Done".to_string(),
                    actions: vec![ActionItem {
                        action: "click".to_string(),
                        message: "Submit button".to_string(),
                    }],
                }),
                ..snapshot(RunStatus::Success, &[("done", "finished")])
            },
        );
        assert_eq!(applied.directive, PollDirective::Stop);
        assert_eq!(m.status(), RunStatus::Success);
        assert_eq!(m.result().unwrap().final_message, "Done");

        // No transition leaves a terminal state.
        let applied = m.apply_snapshot(gen, 2, snapshot(RunStatus::Running, &[]));
        assert!(applied.events.is_empty());
        assert_eq!(applied.directive, PollDirective::Stop);
        assert_eq!(m.status(), RunStatus::Success);
    }

    #[test]
    fn poll_failure_is_terminal_with_error_marker() {
        let mut m = machine();
        let gen = m.generation();
        m.apply_snapshot(gen, 1, snapshot(RunStatus::Running, &[("plan", "a")]));

        let applied = m.record_poll_failure(gen, 2, "connection refused");
        assert_eq!(applied.directive, PollDirective::Stop);
        assert_eq!(m.status(), RunStatus::Error);
        let last = m.logs().last().unwrap();
        assert_eq!(last.stage, ERROR_STAGE);
        assert!(last.message.contains("connection refused"));
    }

    #[test]
    fn stale_poll_failure_is_discarded() {
        let mut m = machine();
        let gen = m.generation();
        m.apply_snapshot(gen, 2, snapshot(RunStatus::Running, &[]));

        let applied = m.record_poll_failure(gen, 1, "late timeout");
        assert!(applied.events.is_empty());
        assert_eq!(m.status(), RunStatus::Running);
    }
}
