//! Terminal controller: the only owner of rendering state.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc::Receiver;

use distro_installer::progress::ProgressUpdate;
use distro_installer::report::now_unix;
use distro_installer::{RunEvent, RunResult, StepStatus};

const BAR_WIDTH: usize = 30;

pub(crate) struct Controller {
    log: Option<File>,
    step: Option<String>,
    progress: Option<ProgressUpdate>,
    bar_drawn: bool,
    result: Option<RunResult>,
}

impl Controller {
    pub(crate) fn new(log_path: Option<&Path>) -> Result<Self> {
        let log = match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .with_context(|| format!("opening run log '{}'", path.display()))?,
                )
            }
            None => None,
        };
        Ok(Self {
            log,
            step: None,
            progress: None,
            bar_drawn: false,
            result: None,
        })
    }

    /// Consume events until the worker hangs up.
    pub(crate) fn drain(&mut self, events: Receiver<RunEvent>) -> Option<RunResult> {
        for event in events {
            self.handle(event);
        }
        self.clear_bar();
        self.result.take()
    }

    fn handle(&mut self, event: RunEvent) {
        match event {
            RunEvent::StepStarted {
                index,
                total,
                label,
                ..
            } => {
                self.clear_bar();
                eprintln!("[{}/{}] {}", index + 1, total, label);
                self.step = Some(label);
            }
            RunEvent::Progress(update) => {
                self.progress = Some(update);
                self.draw_bar();
            }
            RunEvent::HideProgress => {
                self.progress = None;
                self.clear_bar();
            }
            RunEvent::Log(line) => {
                self.clear_bar();
                eprintln!("{}", line);
                self.write_log(&line);
                self.draw_bar();
            }
            RunEvent::Echo(raw) => {
                self.clear_bar();
                let mut stdout = io::stdout().lock();
                let _ = writeln!(stdout, "{}", raw);
                let _ = stdout.flush();
                self.draw_bar();
            }
            RunEvent::StepFinished(outcome) => {
                self.clear_bar();
                let line = match &outcome.status {
                    StepStatus::Ok if outcome.retried => {
                        format!("✓ {} (after retry)", outcome.step_label)
                    }
                    StepStatus::Ok => format!("✓ {}", outcome.step_label),
                    StepStatus::Fail { code, detail } => {
                        format!("✗ {} (exit code {}): {}", outcome.step_label, code, detail)
                    }
                };
                eprintln!("{}", line);
                self.write_log(&line);
                self.step = None;
            }
            RunEvent::Finished(result) => {
                self.clear_bar();
                self.write_log(&result.to_string());
                self.result = Some(result);
            }
        }
    }

    fn write_log(&mut self, line: &str) {
        if let Some(file) = self.log.as_mut() {
            let _ = writeln!(file, "[{}] {}", now_unix(), line);
        }
    }

    fn draw_bar(&mut self) {
        let Some(update) = &self.progress else {
            return;
        };
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{}", render_progress(update));
        let _ = stderr.flush();
        self.bar_drawn = true;
    }

    fn clear_bar(&mut self) {
        if self.bar_drawn {
            let mut stderr = io::stderr().lock();
            let _ = write!(stderr, "\r\x1b[2K");
            let _ = stderr.flush();
            self.bar_drawn = false;
        }
    }
}

fn bar(fraction: f64, width: usize) -> String {
    let filled = ((fraction.clamp(0.0, 1.0) * width as f64).round() as usize).min(width);
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

/// `[######----] 28% label  (sub 40%)`
fn render_progress(update: &ProgressUpdate) -> String {
    let mut line = format!(
        "{} {:>3}% {}",
        bar(update.main, BAR_WIDTH),
        (update.main.clamp(0.0, 1.0) * 100.0).round() as u32,
        update.label
    );
    if let Some(sub) = update.sub {
        line.push_str(&format!("  {}", bar(sub, 10)));
    }
    line
}
