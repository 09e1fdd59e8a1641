use std::process::{Child, Command, Stdio};

use super::types::AuditError;

/// Lifecycle of the site under audit. Readiness is decided over HTTP, not here.
pub trait TargetServer {
    fn start(&mut self) -> Result<(), AuditError>;

    /// Fails once the server process is known to have died.
    fn check_alive(&mut self) -> Result<(), AuditError>;

    fn stop(&mut self);
}

/// A server that is already running somewhere; nothing to start or stop.
#[derive(Debug, Default)]
pub struct AttachedServer;

impl TargetServer for AttachedServer {
    fn start(&mut self) -> Result<(), AuditError> {
        Ok(())
    }

    fn check_alive(&mut self) -> Result<(), AuditError> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// A server started from a shell command and killed when the audit ends.
#[derive(Debug)]
pub struct SpawnedServer {
    command: String,
    child: Option<Child>,
}

impl SpawnedServer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: None,
        }
    }
}

impl TargetServer for SpawnedServer {
    fn start(&mut self) -> Result<(), AuditError> {
        if self.child.is_some() {
            return Ok(());
        }
        let mut cmd = shell_command(&self.command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let child = cmd
            .spawn()
            .map_err(|e| AuditError::ServerSpawn(format!("{}: {e}", self.command)))?;
        tracing::info!(pid = child.id(), command = %self.command, "started target server");
        self.child = Some(child);
        Ok(())
    }

    fn check_alive(&mut self) -> Result<(), AuditError> {
        let Some(child) = self.child.as_mut() else {
            return Err(AuditError::ServerSpawn(format!(
                "{} was never started",
                self.command
            )));
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(AuditError::ServerSpawn(format!(
                "{} exited early with {status}",
                self.command
            ))),
            Err(e) => Err(AuditError::ServerSpawn(format!(
                "{} could not be polled: {e}",
                self.command
            ))),
        }
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::info!(pid = child.id(), "stopping target server");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for SpawnedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(format!("exec {command}"));
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
