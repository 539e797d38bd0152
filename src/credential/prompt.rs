//! Password prompt on the controlling terminal.

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::os::fd::AsRawFd;

use super::{Secret, SecretSource};

/// Reads secrets from stdin with terminal echo disabled.
///
/// EOF or an empty line cancels the prompt.
#[derive(Default)]
pub struct TtyPrompt;

impl TtyPrompt {
    pub fn new() -> Self {
        Self
    }
}

impl SecretSource for TtyPrompt {
    fn read_secret(&mut self, attempt: u32, max_attempts: u32) -> Result<Option<Secret>> {
        let mut stderr = io::stderr();
        write!(
            stderr,
            "Administrator password (attempt {}/{}): ",
            attempt, max_attempts
        )?;
        stderr.flush()?;

        let stdin = io::stdin();
        let line = {
            let _echo = EchoGuard::disable(stdin.as_raw_fd());
            let mut line = String::new();
            stdin
                .lock()
                .read_line(&mut line)
                .context("reading password from terminal")?;
            line
        };

        let password = line.trim_end_matches(['\r', '\n']);
        if password.is_empty() {
            return Ok(None);
        }
        Ok(Some(Secret::new(password)))
    }
}

/// Restores the saved termios settings on drop.
struct EchoGuard {
    fd: i32,
    saved: Option<libc::termios>,
}

impl EchoGuard {
    fn disable(fd: i32) -> Self {
        // SAFETY: termios is plain old data; tcgetattr fills it or fails,
        // and we only use it when tcgetattr succeeded.
        let saved = unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::isatty(fd) == 1 && libc::tcgetattr(fd, &mut term) == 0 {
                let mut silent = term;
                silent.c_lflag &= !libc::ECHO;
                silent.c_lflag |= libc::ECHONL;
                libc::tcsetattr(fd, libc::TCSANOW, &silent);
                Some(term)
            } else {
                None
            }
        };
        Self { fd, saved }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(term) = self.saved {
            // SAFETY: restoring attributes previously read from the same fd.
            unsafe {
                libc::tcsetattr(self.fd, libc::TCSANOW, &term);
            }
        }
    }
}
