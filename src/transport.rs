//! Outbound byte sinks: the mixmaster remailer client or the local MTA.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How outbound messages leave the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMethod {
    /// Handed to the mixmaster binary (automatic, remailer).
    Mixmaster,
    /// Handed to `sendmail -t` (automatic, mail).
    Sendmail,
    /// Returned to the caller for manual dispatch.
    #[default]
    Manual,
}

impl OutputMethod {
    pub fn is_automatic(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

/// A blocking sink for a complete RFC 822 message.
pub trait Transport: Send + Sync {
    fn send(&self, message: &[u8]) -> Result<(), anyhow::Error>;
}

/// feed_and_wait writes `input` to the child's stdin from a scoped thread while
/// stdout and stderr are drained, so a child that streams output never stalls
/// on a full pipe. A child that exits without reading all of its input is left
/// to report through its status.
pub(crate) fn feed_and_wait(mut child: Child, input: &[u8]) -> Result<Output, anyhow::Error> {
    let stdin = child.stdin.take();
    thread::scope(|scope| {
        let writer = stdin.map(|mut pipe| scope.spawn(move || pipe.write_all(input)));
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let written = writer.join().map_err(|_| anyhow::anyhow!("stdin writer panicked"))?;
            match written {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }
        Ok(output)
    })
}

/// pipe_to runs `program args...` with `message` on stdin; any stderr output is a failure
fn pipe_to(program: &Path, args: &[&str], message: &[u8]) -> Result<(), anyhow::Error> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let output = feed_and_wait(child, message)?;
    debug!(program = %program.display(), status = %output.status, "transport finished");
    if !output.stderr.is_empty() {
        anyhow::bail!("{} reported: {}", program.display(), String::from_utf8_lossy(&output.stderr).trim());
    }
    if !output.status.success() {
        anyhow::bail!("{} exited with {}", program.display(), output.status);
    }
    Ok(())
}

/// Sends through `mixmaster -m`.
#[derive(Debug, Clone)]
pub struct MixmasterTransport {
    binary: PathBuf,
}

impl MixmasterTransport {
    pub fn new(binary: &Path) -> Self {
        Self { binary: binary.to_path_buf() }
    }
}

impl Transport for MixmasterTransport {
    fn send(&self, message: &[u8]) -> Result<(), anyhow::Error> {
        pipe_to(&self.binary, &["-m"], message)
    }
}

/// Sends through `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    binary: PathBuf,
}

impl Default for SendmailTransport {
    fn default() -> Self {
        Self { binary: PathBuf::from("sendmail") }
    }
}

impl SendmailTransport {
    pub fn with_binary(binary: &Path) -> Self {
        Self { binary: binary.to_path_buf() }
    }
}

impl Transport for SendmailTransport {
    fn send(&self, message: &[u8]) -> Result<(), anyhow::Error> {
        pipe_to(&self.binary, &["-t"], message)
    }
}

/* ------------------------------------------------------------------------- */

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn manual_is_default_and_not_automatic() {
        assert_eq!(OutputMethod::default(), OutputMethod::Manual);
        assert!(!OutputMethod::Manual.is_automatic());
        assert!(OutputMethod::Mixmaster.is_automatic());
        assert!(OutputMethod::Sendmail.is_automatic());
    }

    #[test]
    fn missing_binary_fails() {
        let transport = MixmasterTransport::new(Path::new("/nonexistent/mixmaster"));
        assert!(transport.send(b"To: x\n\nbody").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn successful_pipe() {
        let transport = SendmailTransport::with_binary(Path::new("cat"));
        assert!(transport.send(b"To: x\n\nbody").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn large_message_through_echoing_binary() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let message = vec![b'x'; 1 << 20];
            let _ = tx.send(SendmailTransport::with_binary(Path::new("cat")).send(&message).is_ok());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(30)), Ok(true));
    }
}
