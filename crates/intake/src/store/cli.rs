//! Invocation of the backing store's CLI tool.
//!
//! Every invocation runs under an explicit timeout. A timed-out call is
//! reported as output with `timeout` on stderr so callers treat it as a
//! per-file failure, never a crash of the calling worker.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command as TokioCommand;

use crate::job::model::StoreSession;

/// Captured result of one CLI invocation.
#[derive(Debug)]
pub struct CliOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CliOutput {
    fn timeout(limit: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: format!("timeout after {}s", limit.as_secs()),
            timed_out: true,
        }
    }

    fn spawn_failure(e: &std::io::Error) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: format!("failed to run tool: {e}"),
            timed_out: false,
        }
    }
}

/// Builds and runs backing-store CLI commands.
#[derive(Debug, Clone)]
pub struct StoreCli {
    tool: PathBuf,
}

impl StoreCli {
    pub fn new<P: AsRef<Path>>(tool: P) -> Self {
        Self {
            tool: tool.as_ref().to_path_buf(),
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Format probe: `<tool> import -f <staged-file>`.
    ///
    /// Runs in an isolated scratch directory so concurrent probes never
    /// share tool state; the tool's config dir is pointed there too.
    pub async fn probe(&self, staged_file: &Path, limit: Duration) -> CliOutput {
        let scratch = match tempfile::TempDir::new() {
            Ok(dir) => dir,
            Err(e) => return CliOutput::spawn_failure(&e),
        };

        let mut cmd = TokioCommand::new(&self.tool);
        cmd.arg("import")
            .arg("-f")
            .arg(staged_file)
            .current_dir(scratch.path())
            .env("OMERODIR", scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.run(cmd, limit).await
    }

    /// Import: `<tool> import [-d <container>] -k <key> -s <host> -p <port> <staged-file>`.
    pub async fn import(
        &self,
        session: &StoreSession,
        container_id: Option<&str>,
        staged_file: &Path,
        limit: Duration,
    ) -> CliOutput {
        let mut cmd = TokioCommand::new(&self.tool);
        cmd.arg("import");
        if let Some(container) = container_id {
            cmd.arg("-d").arg(container);
        }
        cmd.arg("-k")
            .arg(session.key.as_deref().unwrap_or_default())
            .arg("-s")
            .arg(session.host.as_deref().unwrap_or_default())
            .arg("-p")
            .arg(session.port.map(|p| p.to_string()).unwrap_or_default())
            .arg(staged_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.run(cmd, limit).await
    }

    /// Batch image lookup: `<tool> lookup -k ... -s ... -p ... <name>...`,
    /// one line `name<TAB>id` per match on stdout.
    pub async fn lookup_images(
        &self,
        session: &StoreSession,
        names: &[String],
        limit: Duration,
    ) -> CliOutput {
        let mut cmd = TokioCommand::new(&self.tool);
        cmd.arg("lookup");
        self.session_args(&mut cmd, session);
        for name in names {
            cmd.arg(name);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.run(cmd, limit).await
    }

    /// Attachment: `<tool> attach -k ... -s ... -p ... <image-id> <staged-file>`.
    pub async fn attach(
        &self,
        session: &StoreSession,
        image_id: &str,
        staged_file: &Path,
        limit: Duration,
    ) -> CliOutput {
        let mut cmd = TokioCommand::new(&self.tool);
        cmd.arg("attach");
        self.session_args(&mut cmd, session);
        cmd.arg(image_id)
            .arg(staged_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.run(cmd, limit).await
    }

    fn session_args(&self, cmd: &mut TokioCommand, session: &StoreSession) {
        cmd.arg("-k")
            .arg(session.key.as_deref().unwrap_or_default())
            .arg("-s")
            .arg(session.host.as_deref().unwrap_or_default())
            .arg("-p")
            .arg(session.port.map(|p| p.to_string()).unwrap_or_default());
    }

    async fn run(&self, mut cmd: TokioCommand, limit: Duration) -> CliOutput {
        cmd.kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to spawn {:?}: {}", self.tool, e);
                return CliOutput::spawn_failure(&e);
            }
        };

        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => CliOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            },
            Ok(Err(e)) => CliOutput::spawn_failure(&e),
            Err(_) => {
                log::warn!("{:?} timed out after {:?}", self.tool, limit);
                CliOutput::timeout(limit)
            }
        }
    }
}
