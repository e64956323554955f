//! Terminator-driven reading over a byte stream shell
//!
//! Both the SSH and the local transport speak to an interactive shell over a
//! pair of byte streams. A background task forwards everything the shell
//! prints into a channel; `ShellStream::expect` accumulates that output until
//! one of the caller's terminators appears.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::error::ExecError;

/// Prompt installed into every shell we drive
pub const SHELL_PROMPT: &str = "$ ";

const READY_MARKER: &str = "__hostrun_ready__";

/// Shell input/output pair with a background reader
pub struct ShellStream {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl std::fmt::Debug for ShellStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellStream").finish_non_exhaustive()
    }
}

impl ShellStream {
    /// Wrap a reader/writer pair, spawning the reader task
    pub fn spawn<R, W>(mut reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "shell reader stopped");
                        break;
                    }
                }
            }
        });

        Self {
            writer: Box::new(writer),
            output: rx,
        }
    }

    /// Discard output left over from a previous command
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(chunk) = self.output.try_recv() {
            dropped += chunk.len();
        }
        if dropped > 0 {
            trace!(bytes = dropped, "drained stale shell output");
        }
        dropped
    }

    /// Write one line of input
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the write fails
    pub async fn send_line(&mut self, line: &str) -> Result<(), ExecError> {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    /// Read until any terminator is contained in the accumulated output
    ///
    /// With no terminators the read simply runs until the deadline and
    /// returns what it collected.
    ///
    /// # Errors
    /// Returns `ExecError::Timeout` when the deadline passes first and
    /// `ExecError::SessionClosed` when the shell goes away
    pub async fn expect(
        &mut self,
        terminators: &[String],
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let deadline = Instant::now() + timeout;
        let mut collected: Vec<u8> = Vec::new();

        loop {
            match timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    let text = String::from_utf8_lossy(&collected);
                    if let Some(found) = terminators.iter().find(|t| text.contains(t.as_str())) {
                        trace!(terminator = %found, "terminator matched");
                        return Ok(text.into_owned());
                    }
                }
                Ok(None) => return Err(ExecError::SessionClosed),
                Err(_) => {
                    let partial = String::from_utf8_lossy(&collected).into_owned();
                    if terminators.is_empty() {
                        return Ok(partial);
                    }
                    return Err(ExecError::Timeout { timeout, partial });
                }
            }
        }
    }

    /// Send a command and wait for its terminator
    ///
    /// # Errors
    /// See [`ShellStream::send_line`] and [`ShellStream::expect`]
    pub async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
        terminators: &[String],
    ) -> Result<String, ExecError> {
        self.drain();
        self.send_line(command).await?;
        let raw = self.expect(terminators, timeout).await?;
        Ok(clean_output(&raw, command))
    }

    /// Install the known prompt and wait until the shell acknowledges it
    ///
    /// `preamble` runs first, e.g. `stty -echo` on a PTY.
    ///
    /// # Errors
    /// Returns an error if the shell never reports ready
    pub async fn prepare(&mut self, preamble: &str, timeout: Duration) -> Result<(), ExecError> {
        let mut setup = String::new();
        if !preamble.is_empty() {
            setup.push_str(preamble);
            setup.push_str("; ");
        }
        setup.push_str(&format!("unset PROMPT_COMMAND; PS1='{SHELL_PROMPT}'; PS2=''"));
        self.send_line(&setup).await?;

        // the marker is assembled by printf so an echoed command line never matches it
        let (head, tail) = READY_MARKER.split_at(READY_MARKER.len() / 2);
        self.send_line(&format!("printf '%s%s\\n' '{head}' '{tail}'"))
            .await?;
        self.expect(&[READY_MARKER.to_string()], timeout).await?;
        // swallow the prompt that follows the marker, if it arrives promptly
        let _ = self
            .expect(&[SHELL_PROMPT.to_string()], Duration::from_millis(250))
            .await;
        self.drain();
        Ok(())
    }
}

/// Normalize raw shell output: drop carriage returns, an echoed command
/// line, and the trailing prompt
#[must_use]
pub fn clean_output(raw: &str, command: &str) -> String {
    let mut text = raw.replace('\r', "");
    if let Some(rest) = text.strip_prefix(command) {
        text = rest.trim_start_matches('\n').to_string();
    }
    if let Some(stripped) = text.strip_suffix(SHELL_PROMPT) {
        text = stripped.to_string();
    }
    text.trim_end_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_pair() -> (ShellStream, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(ours);
        (ShellStream::spawn(read, write), theirs)
    }

    #[test]
    fn test_clean_output_strips_prompt_and_cr() {
        assert_eq!(clean_output("hello\r\n$ ", "echo hello"), "hello");
        assert_eq!(clean_output("echo hi\r\nhi\r\n$ ", "echo hi"), "hi");
        assert_eq!(clean_output("[sudo] Password:", "sudo ls"), "[sudo] Password:");
    }

    #[tokio::test]
    async fn test_expect_stops_at_terminator() {
        let (mut stream, mut remote) = stream_pair();
        remote.write_all(b"line one\nPassword: ").await.unwrap();

        let out = stream
            .expect(
                &["$ ".to_string(), "Password".to_string()],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(out.contains("line one"));
    }

    #[tokio::test]
    async fn test_expect_times_out_with_partial_output() {
        let (mut stream, mut remote) = stream_pair();
        remote.write_all(b"still working").await.unwrap();

        let err = stream
            .expect(&["$ ".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert_eq!(err.partial_output(), "still working");
    }

    #[tokio::test]
    async fn test_expect_reports_closed_stream() {
        let (mut stream, remote) = stream_pair();
        drop(remote);

        let err = stream
            .expect(&["$ ".to_string()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SessionClosed));
    }
}
