//! Streaming child processes attached to a pseudo-terminal.
//!
//! Package managers and kernel build tools only print their live progress
//! when connected to a terminal, so streaming steps run under a pty and
//! their output is read line by line on a reader thread.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc;
use std::thread;

use super::lines::LineSplitter;

const PTY_SIZE: PtySize = PtySize {
    rows: 40,
    cols: 160,
    pixel_width: 0,
    pixel_height: 0,
};

/// Run `argv` under a pty, calling `on_line` for every output line.
///
/// `stdin` is written to the terminal right after spawning (the elevation
/// secret). Blocks until the child exits and its output is drained.
pub fn stream_in_pty(
    argv: &[String],
    stdin: Option<&[u8]>,
    on_line: &mut dyn FnMut(&str),
) -> Result<i32> {
    let (program, args) = argv
        .split_first()
        .context("cannot run an empty command")?;

    let pair = native_pty_system()
        .openpty(PTY_SIZE)
        .context("Failed to allocate a pseudo-terminal")?;

    let mut builder = CommandBuilder::new(program);
    builder.args(args);
    if let Ok(cwd) = std::env::current_dir() {
        builder.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .with_context(|| format!("Failed to spawn `{}`", argv.join(" ")))?;
    // Only the child may hold the slave side, or the reader never sees EOF.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("Failed to open pty reader")?;

    if let Some(bytes) = stdin {
        let mut writer = pair.master.take_writer().context("Failed to open pty writer")?;
        writer
            .write_all(bytes)
            .context("Failed to write to pty")?;
        writer.flush().ok();
    }

    let (tx, rx) = mpsc::channel();
    let reader_thread = thread::spawn(move || {
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // EIO once the child side closes.
                Err(_) => break,
            }
        }
        if let Some(rest) = splitter.finish() {
            let _ = tx.send(rest);
        }
    });

    for line in rx {
        on_line(&line);
    }
    let _ = reader_thread.join();

    let status = child.wait().context("Failed to wait for child process")?;
    drop(pair.master);
    Ok(status.exit_code() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn test_streams_lines_and_exit_code() {
        let mut lines = Vec::new();
        let code = stream_in_pty(
            &argv("printf 'one\\ntwo\\r three\\n'; exit 4"),
            None,
            &mut |l| lines.push(l.to_string()),
        )
        .unwrap();
        assert_eq!(code, 4);
        assert_eq!(lines, vec!["one", "two", " three"]);
    }

    #[test]
    fn test_stdin_reaches_child() {
        let mut lines = Vec::new();
        let code = stream_in_pty(
            &argv("stty -echo; read secret; echo \"got ${#secret}\""),
            Some(b"hunter2\n"),
            &mut |l| lines.push(l.to_string()),
        )
        .unwrap();
        assert_eq!(code, 0);
        assert!(lines.iter().any(|l| l == "got 7"));
    }
}
