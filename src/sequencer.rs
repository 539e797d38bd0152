//! Serial execution of the step plan.
//!
//! The sequencer runs on one worker thread and talks to its controller
//! only through [`RunEvent`]s. Steps run strictly in plan order and the
//! first step that still fails after recovery ends the run.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{InstallError, RunResult};
use crate::progress::{extractor_for, strip_ansi, ParserSettings, ProgressUpdate};
use crate::recovery::{Decision, RecoveryPolicy};
use crate::runner::StepExecutor;
use crate::step::{first_package_argument, Classifier, Step, StepClassification};

/// Final state of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Fail { code: i32, detail: String },
}

/// Audit trail entry for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub step_label: String,
    pub classification: StepClassification,
    #[serde(flatten)]
    pub status: StepStatus,
    /// Whether the recovery policy re-ran the step.
    pub retried: bool,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }

    /// The run-ending error this outcome stands for, if it failed.
    pub fn error(&self) -> Option<InstallError> {
        match &self.status {
            StepStatus::Ok => None,
            StepStatus::Fail { code, detail } => Some(InstallError::StepExecution {
                label: self.step_label.clone(),
                code: *code,
                detail: detail.clone(),
            }),
        }
    }
}

/// Terminal result of a run from its outcome list.
pub fn run_result(outcomes: &[RunOutcome]) -> RunResult {
    outcomes
        .iter()
        .find_map(RunOutcome::error)
        .map_or(RunResult::Success, |err| RunResult::from(&err))
}

/// Everything the worker tells the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    StepStarted {
        index: usize,
        total: usize,
        label: String,
        classification: StepClassification,
    },
    Progress(ProgressUpdate),
    /// Hide both progress indicators.
    HideProgress,
    /// Run log line.
    Log(String),
    /// Raw output of a watched step, for the invoking terminal.
    Echo(String),
    StepFinished(RunOutcome),
    Finished(RunResult),
}

/// Sink for [`RunEvent`]s. Must never block the worker.
pub trait Reporter: Send {
    fn report(&self, event: RunEvent);
}

/// [`Reporter`] over an unbounded channel.
pub struct ChannelReporter(Sender<RunEvent>);

impl ChannelReporter {
    pub fn new(sender: Sender<RunEvent>) -> Self {
        Self(sender)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, event: RunEvent) {
        // A departed controller is not the worker's problem.
        let _ = self.0.send(event);
    }
}

/// Per-run sequencing configuration.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    pub classifier: Classifier,
    pub parser: ParserSettings,
    pub recovery: RecoveryPolicy,
    pub verbose: bool,
    /// Labels whose raw output is echoed to the invoking terminal.
    pub watched: BTreeSet<String>,
}

impl Sequencer {
    /// Run `steps` in order, stopping after the first fatal failure.
    pub fn run(
        &self,
        steps: &[Step],
        executor: &mut dyn StepExecutor,
        reporter: &dyn Reporter,
    ) -> Vec<RunOutcome> {
        let mut outcomes = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let classification = self.classifier.classify(&step.command);
            reporter.report(RunEvent::HideProgress);
            reporter.report(RunEvent::StepStarted {
                index,
                total: steps.len(),
                label: step.label.clone(),
                classification,
            });
            reporter.report(RunEvent::Log(format!("→ {}", step.label)));
            info!(step = %step.label, %classification, "starting step");

            let outcome = self.run_step(step, classification, executor, reporter);
            match &outcome.status {
                StepStatus::Ok => info!(step = %step.label, "step finished"),
                StepStatus::Fail { code, detail } => {
                    warn!(step = %step.label, code, %detail, "step failed")
                }
            }

            let failed = !outcome.is_ok();
            reporter.report(RunEvent::StepFinished(outcome.clone()));
            outcomes.push(outcome);
            if failed {
                break;
            }
        }

        reporter.report(RunEvent::HideProgress);
        outcomes
    }

    fn run_step(
        &self,
        step: &Step,
        classification: StepClassification,
        executor: &mut dyn StepExecutor,
        reporter: &dyn Reporter,
    ) -> RunOutcome {
        let mut retries = 0;

        let status = loop {
            let (code, output) = match self.execute(step, classification, executor, reporter) {
                Ok(result) => result,
                Err(e) => {
                    break StepStatus::Fail {
                        code: -1,
                        detail: format!("{:#}", e),
                    }
                }
            };
            if code == 0 {
                break StepStatus::Ok;
            }

            let raw = raw_failure(code, &output);
            let package =
                first_package_argument(&step.command, self.classifier.package_manager_tools());
            let decision = self.recovery.decide(
                classification,
                &output.join("\n"),
                package.as_deref(),
                retries,
                &raw,
            );

            match decision {
                Decision::Retry {
                    signature,
                    package,
                    remediation,
                } => {
                    let blocked = InstallError::RecoverableDependency {
                        label: step.label.clone(),
                        signature,
                    };
                    warn!(error = %blocked, %package, "recoverable failure, retrying once");
                    reporter.report(RunEvent::Log(blocked.to_string()));
                    reporter.report(RunEvent::Log(format!(
                        "Accepting configuration changes for {} and retrying",
                        package
                    )));
                    self.remediate(&remediation, step.requires_elevation, executor, reporter);
                    reporter.report(RunEvent::HideProgress);
                    retries += 1;
                }
                Decision::Fail { detail } => break StepStatus::Fail { code, detail },
            }
        };

        RunOutcome {
            step_label: step.label.clone(),
            classification,
            status,
            retried: retries > 0,
        }
    }

    /// Run the step once with a fresh parser. Returns the exit code and the
    /// cleaned output.
    fn execute(
        &self,
        step: &Step,
        classification: StepClassification,
        executor: &mut dyn StepExecutor,
        reporter: &dyn Reporter,
    ) -> Result<(i32, Vec<String>)> {
        if step.terminal {
            debug!(step = %step.label, "running in terminal emulator");
            let code = executor.interactive(&step.command, step.requires_elevation)?;
            return Ok((code, Vec::new()));
        }

        if !classification.is_streaming() {
            let captured = executor.capture(&step.command, step.requires_elevation)?;
            let output: Vec<String> = captured.lines.iter().map(|l| strip_ansi(l)).collect();
            if self.verbose {
                for line in &output {
                    reporter.report(RunEvent::Log(line.clone()));
                }
            }
            return Ok((captured.code, output));
        }

        let mut extractor = extractor_for(classification, &self.parser)?;
        let watched = self.watched.contains(&step.label);
        let mut output = Vec::new();

        let code = executor.stream(&step.command, step.requires_elevation, &mut |raw| {
            if watched {
                reporter.report(RunEvent::Echo(raw.to_string()));
            }
            let line = strip_ansi(raw);
            if self.verbose {
                reporter.report(RunEvent::Log(line.clone()));
            }
            if let Some(update) = extractor.as_mut().and_then(|ex| ex.feed(&line)) {
                reporter.report(RunEvent::Progress(update));
            }
            output.push(line);
        })?;

        Ok((code, output))
    }

    fn remediate(
        &self,
        commands: &[String],
        elevated: bool,
        executor: &mut dyn StepExecutor,
        reporter: &dyn Reporter,
    ) {
        for command in commands {
            match executor.capture(command, elevated) {
                Ok(captured) => {
                    if self.verbose {
                        for line in &captured.lines {
                            reporter.report(RunEvent::Log(strip_ansi(line)));
                        }
                    }
                    if captured.code != 0 {
                        warn!(%command, code = captured.code, "remediation pass failed");
                    }
                }
                Err(e) => warn!(%command, error = %format!("{:#}", e), "remediation pass failed"),
            }
        }
    }
}

/// Exit code plus the last line the command printed.
fn raw_failure(code: i32, output: &[String]) -> String {
    match output.iter().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("exit code {}: {}", code, last.trim()),
        None => format!("exit code {}", code),
    }
}

/// Run the whole plan on a background worker.
///
/// The worker owns the plan, the executor and every parser; the caller
/// keeps only the join handle and the receiving end of the reporter.
pub fn spawn_run(
    sequencer: Sequencer,
    steps: Vec<Step>,
    mut executor: Box<dyn StepExecutor>,
    reporter: Box<dyn Reporter>,
) -> JoinHandle<Vec<RunOutcome>> {
    thread::spawn(move || {
        let outcomes = sequencer.run(&steps, executor.as_mut(), reporter.as_ref());
        reporter.report(RunEvent::Finished(run_result(&outcomes)));
        outcomes
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runner::Captured;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{mpsc, Mutex};

    /// Scripted executor: each command answers with queued `(code, lines)`
    /// and falls back to success with no output.
    #[derive(Default)]
    pub(crate) struct FakeExecutor {
        pub script: HashMap<String, VecDeque<(i32, Vec<String>)>>,
        pub calls: Vec<String>,
    }

    impl FakeExecutor {
        pub(crate) fn answer(&mut self, command: &str, code: i32, lines: &[&str]) {
            self.script
                .entry(command.to_string())
                .or_default()
                .push_back((code, lines.iter().map(|l| l.to_string()).collect()));
        }

        fn next(&mut self, kind: &str, command: &str) -> (i32, Vec<String>) {
            self.calls.push(format!("{} {}", kind, command));
            self.script
                .get_mut(command)
                .and_then(|q| q.pop_front())
                .unwrap_or((0, Vec::new()))
        }
    }

    impl StepExecutor for FakeExecutor {
        fn stream(
            &mut self,
            command: &str,
            _elevated: bool,
            on_line: &mut dyn FnMut(&str),
        ) -> Result<i32> {
            let (code, lines) = self.next("stream", command);
            for line in &lines {
                on_line(line);
            }
            Ok(code)
        }

        fn capture(&mut self, command: &str, _elevated: bool) -> Result<Captured> {
            let (code, lines) = self.next("capture", command);
            Ok(Captured { code, lines })
        }

        fn interactive(&mut self, command: &str, _elevated: bool) -> Result<i32> {
            Ok(self.next("terminal", command).0)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingReporter(pub Mutex<Vec<RunEvent>>);

    impl Reporter for RecordingReporter {
        fn report(&self, event: RunEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl RecordingReporter {
        pub(crate) fn events(&self) -> Vec<RunEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    const BLOCKED: &[&str] = &[
        ">>> Emerging (1 of 1) net-libs/nodejs-20.0.0",
        "The following keyword changes are necessary to proceed:",
        "Perhaps you need --autounmask-write?",
    ];

    fn plan() -> Vec<Step> {
        vec![
            Step::new("Sync", "emerge --sync"),
            Step::new("Kernel", "genkernel all"),
            Step::new("Services", "rc-update add dbus default"),
        ]
    }

    #[test]
    fn test_outcomes_follow_plan_order() {
        let mut exec = FakeExecutor::default();
        let reporter = RecordingReporter::default();
        let outcomes = Sequencer::default().run(&plan(), &mut exec, &reporter);

        let labels: Vec<_> = outcomes.iter().map(|o| o.step_label.as_str()).collect();
        assert_eq!(labels, vec!["Sync", "Kernel", "Services"]);
        assert!(outcomes.iter().all(RunOutcome::is_ok));
        assert_eq!(
            exec.calls,
            vec![
                "stream emerge --sync",
                "stream genkernel all",
                "capture rc-update add dbus default",
            ]
        );

        let finished: Vec<_> = reporter
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::StepFinished(o) => Some(o.step_label),
                _ => None,
            })
            .collect();
        assert_eq!(finished, labels);
    }

    #[test]
    fn test_halts_at_first_failure() {
        let mut exec = FakeExecutor::default();
        exec.answer("genkernel all", 2, &["* Gentoo Linux Genkernel", "make: *** [all] Error 2"]);
        let reporter = RecordingReporter::default();
        let outcomes = Sequencer::default().run(&plan(), &mut exec, &reporter);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[1].status,
            StepStatus::Fail {
                code: 2,
                detail: "exit code 2: make: *** [all] Error 2".into()
            }
        );
        assert!(!exec.calls.iter().any(|c| c.contains("rc-update")));
        assert!(matches!(run_result(&outcomes), RunResult::Failed { code: 2, .. }));
    }

    #[test]
    fn test_recoverable_failure_retried_exactly_once() {
        let steps = vec![Step::new("Programs", "emerge net-libs/nodejs")];
        let mut exec = FakeExecutor::default();
        exec.answer("emerge net-libs/nodejs", 1, BLOCKED);
        exec.answer("emerge net-libs/nodejs", 1, BLOCKED);
        let reporter = RecordingReporter::default();

        let outcomes = Sequencer::default().run(&steps, &mut exec, &reporter);

        assert_eq!(
            exec.calls,
            vec![
                "stream emerge net-libs/nodejs",
                "capture emerge --autounmask-write net-libs/nodejs",
                "capture yes | etc-update --automode -3",
                "stream emerge net-libs/nodejs",
            ]
        );
        assert!(outcomes[0].retried);
        assert!(matches!(outcomes[0].status, StepStatus::Fail { code: 1, .. }));

        let blocked = InstallError::RecoverableDependency {
            label: "Programs".into(),
            signature: "perhaps you need --autounmask-write".into(),
        };
        assert!(reporter.events().contains(&RunEvent::Log(blocked.to_string())));
        assert!(matches!(
            outcomes[0].error(),
            Some(InstallError::StepExecution { code: 1, .. })
        ));
        match run_result(&outcomes) {
            RunResult::Failed { code, message } => {
                assert_eq!(code, 1);
                assert!(message.starts_with("Programs: exit code 1: "));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_buffered_output_logged_after_completion_when_verbose() {
        let steps = vec![Step::new("Services", "rc-update add dbus default")];
        let mut exec = FakeExecutor::default();
        exec.answer(
            "rc-update add dbus default",
            0,
            &["\x1b[1m * service dbus added to runlevel default\x1b[0m", "done"],
        );
        let reporter = RecordingReporter::default();
        let sequencer = Sequencer {
            verbose: true,
            ..Default::default()
        };
        sequencer.run(&steps, &mut exec, &reporter);

        assert_eq!(exec.calls, vec!["capture rc-update add dbus default"]);
        let events = reporter.events();
        let logs: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Log(line) => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            logs,
            vec![
                "→ Services",
                " * service dbus added to runlevel default",
                "done",
            ]
        );
        assert!(!events.iter().any(|e| matches!(e, RunEvent::Progress(_))));

        let finished = events
            .iter()
            .position(|e| matches!(e, RunEvent::StepFinished(_)))
            .unwrap();
        let last_log = events
            .iter()
            .rposition(|e| matches!(e, RunEvent::Log(_)))
            .unwrap();
        assert!(last_log < finished);
    }

    #[test]
    fn test_buffered_output_silent_without_verbose() {
        let steps = vec![Step::new("Services", "rc-update add dbus default")];
        let mut exec = FakeExecutor::default();
        exec.answer("rc-update add dbus default", 0, &[" * service dbus added"]);
        let reporter = RecordingReporter::default();
        Sequencer::default().run(&steps, &mut exec, &reporter);

        let logs: Vec<RunEvent> = reporter
            .events()
            .into_iter()
            .filter(|e| matches!(e, RunEvent::Log(_)))
            .collect();
        assert_eq!(logs, vec![RunEvent::Log("→ Services".into())]);
    }

    #[test]
    fn test_buffered_failure_never_retried() {
        let steps = vec![Step::new("News", "eselect news read")];
        let mut exec = FakeExecutor::default();
        exec.answer("eselect news read", 1, BLOCKED);
        let reporter = RecordingReporter::default();
        let outcomes = Sequencer::default().run(&steps, &mut exec, &reporter);

        assert_eq!(exec.calls, vec!["capture eselect news read"]);
        assert!(!outcomes[0].retried);
        assert_eq!(
            outcomes[0].status,
            StepStatus::Fail {
                code: 1,
                detail: "exit code 1: Perhaps you need --autounmask-write?".into()
            }
        );
    }

    #[test]
    fn test_retry_success_is_ok() {
        let steps = vec![Step::new("Programs", "emerge net-libs/nodejs")];
        let mut exec = FakeExecutor::default();
        exec.answer("emerge net-libs/nodejs", 1, BLOCKED);
        let outcomes = Sequencer::default().run(&steps, &mut exec, &RecordingReporter::default());
        assert!(outcomes[0].is_ok());
        assert!(outcomes[0].retried);
        assert_eq!(run_result(&outcomes), RunResult::Success);
    }

    #[test]
    fn test_build_log_surfaces_as_detail() {
        let steps = vec![Step::new("Programs", "emerge app-editors/pluma")];
        let mut exec = FakeExecutor::default();
        exec.answer(
            "emerge app-editors/pluma",
            1,
            &[" * The complete build log is located at '/var/tmp/portage/app-editors/pluma-1.26/temp/build.log'."],
        );
        let outcomes = Sequencer::default().run(&steps, &mut exec, &RecordingReporter::default());
        assert_eq!(
            outcomes[0].status,
            StepStatus::Fail {
                code: 1,
                detail: "/var/tmp/portage/app-editors/pluma-1.26/temp/build.log".into()
            }
        );
        assert!(!outcomes[0].retried);
    }

    #[test]
    fn test_progress_and_verbose_log() {
        let steps = vec![Step::new("World", "emerge --update --deep @world")];
        let mut exec = FakeExecutor::default();
        exec.answer(
            "emerge --update --deep @world",
            0,
            &["\x1b[32m>>> Emerging (2 of 5) foo/bar-1.0::gentoo\x1b[0m", ">>> Compiling source in /x"],
        );
        let reporter = RecordingReporter::default();
        let sequencer = Sequencer {
            verbose: true,
            ..Default::default()
        };
        sequencer.run(&steps, &mut exec, &reporter);

        let events = reporter.events();
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Progress(u) => Some(u.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 2);
        assert!((progress[1].main - 0.28).abs() < 1e-9);
        assert!(events.contains(&RunEvent::Log(
            ">>> Emerging (2 of 5) foo/bar-1.0::gentoo".into()
        )));
        assert!(!events.iter().any(|e| matches!(e, RunEvent::Echo(_))));
    }

    #[test]
    fn test_watched_step_echoes_raw_output() {
        let steps = vec![Step::new("Kernel", "genkernel all")];
        let mut exec = FakeExecutor::default();
        exec.answer("genkernel all", 0, &["\x1b[1m* kernel: >> Initializing...\x1b[0m"]);
        let reporter = RecordingReporter::default();
        let sequencer = Sequencer {
            watched: ["Kernel".to_string()].into_iter().collect(),
            ..Default::default()
        };
        sequencer.run(&steps, &mut exec, &reporter);
        let events = reporter.events();
        assert!(events.contains(&RunEvent::Echo(
            "\x1b[1m* kernel: >> Initializing...\x1b[0m".into()
        )));
        // not verbose: nothing but the step header reaches the log
        let logs = events
            .iter()
            .filter(|e| matches!(e, RunEvent::Log(_)))
            .count();
        assert_eq!(logs, 1);
    }

    #[test]
    fn test_terminal_steps_use_emulator() {
        let mut step = Step::new("Password", "passwd alice");
        step.terminal = true;
        let mut exec = FakeExecutor::default();
        Sequencer::default().run(&[step], &mut exec, &RecordingReporter::default());
        assert_eq!(exec.calls, vec!["terminal passwd alice"]);
    }

    #[test]
    fn test_spawn_run_reports_finished_last() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_run(
            Sequencer::default(),
            plan(),
            Box::new(FakeExecutor::default()),
            Box::new(ChannelReporter::new(tx)),
        );
        let outcomes = handle.join().unwrap();
        assert_eq!(outcomes.len(), 3);
        let events: Vec<RunEvent> = rx.iter().collect();
        assert_eq!(events.last(), Some(&RunEvent::Finished(RunResult::Success)));
    }
}
