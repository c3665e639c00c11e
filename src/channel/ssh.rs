use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BoundedLog, ChannelError, CommandOutput, Connector, RemoteChannel, TransferDirection};
use crate::config::HostSpec;
use crate::matrix::Os;

/// Exit status `ssh` uses for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Upper bound for the session that kills an interrupted remote command.
const REMOTE_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens channels by driving the OpenSSH client.
///
/// Every channel gets its own multiplexed master connection, so commands on
/// one channel reuse its handshake and closing it never touches a sibling.
#[derive(Debug, Clone)]
pub struct SshConnector {
    control_dir: PathBuf,
    output_limit: usize,
    ssh_program: PathBuf,
    scp_program: PathBuf,
    serial: Arc<AtomicU64>,
}

impl SshConnector {
    /// `control_dir` holds the multiplexing sockets and must be short enough
    /// for a unix socket path.
    pub fn new(control_dir: impl Into<PathBuf>, output_limit: usize) -> Self {
        Self {
            control_dir: control_dir.into(),
            output_limit,
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Use other `ssh`/`scp` executables, e.g. wrappers that add jump hosts.
    pub fn with_programs(mut self, ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    fn next_control_path(&self, host: &HostSpec) -> PathBuf {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        control_path(&self.control_dir, host, serial)
    }
}

/// Directory holding one run's multiplexing sockets, removed on drop.
#[derive(Debug)]
pub struct ControlDir {
    path: PathBuf,
}

impl ControlDir {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed control directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove control directory"
            ),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &HostSpec,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteChannel>, ChannelError> {
        let mut channel = SshChannel {
            host: host.clone(),
            control_path: self.next_control_path(host),
            connect_timeout: timeout,
            output_limit: self.output_limit,
            ssh_program: self.ssh_program.clone(),
            scp_program: self.scp_program.clone(),
        };

        tracing::debug!(host = %host.name, address = %host.address, "Connecting");
        let probe = match host.os {
            Os::Windows => "ver",
            Os::Linux | Os::Macos => "uname -a",
        };
        // The handshake itself is bounded by ConnectTimeout; leave room for the probe
        let output = channel
            .run(probe, timeout * 2, &CancellationToken::new())
            .await
            .map_err(|e| match e {
                ChannelError::Disconnected { host, reason } => ChannelError::Connect { host, reason },
                other => other,
            })?;
        if !output.success() {
            return Err(ChannelError::Connect {
                host: host.name.clone(),
                reason: format!(
                    "probe exited with status {}: {}",
                    output.exit_code,
                    output.stderr.excerpt(3)
                ),
            });
        }
        tracing::info!(host = %host.name, banner = %output.stdout.excerpt(1), "Connected");
        Ok(Box::new(channel))
    }
}

pub struct SshChannel {
    host: HostSpec,
    control_path: PathBuf,
    connect_timeout: Duration,
    output_limit: usize,
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl SshChannel {
    /// Kill the process group recorded in `pid_file` over a fresh session.
    async fn kill_remote(&self, pid_file: &str) {
        let args = ssh_args(
            &self.host,
            &self.control_path,
            self.connect_timeout,
            &kill_command(pid_file),
        );
        let result = tokio::time::timeout(
            REMOTE_KILL_TIMEOUT,
            Command::new(&self.ssh_program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        match result {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!(host = %self.host.name, "Killed interrupted remote command")
            }
            Ok(Ok(status)) => {
                tracing::warn!(host = %self.host.name, %status, "Remote kill did not succeed")
            }
            Ok(Err(e)) => tracing::warn!(host = %self.host.name, error = %e, "Remote kill failed"),
            Err(_) => tracing::warn!(host = %self.host.name, "Remote kill timed out"),
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn host(&self) -> &HostSpec {
        &self.host
    }

    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ChannelError> {
        // Windows hosts have no process groups to signal; the session ends with the client
        let pid_file = match self.host.os {
            Os::Linux | Os::Macos => Some(format!("/tmp/sisyphus-{}.pid", Uuid::new_v4().simple())),
            Os::Windows => None,
        };
        let remote = match &pid_file {
            Some(pid_file) => tracked_command(pid_file, command),
            None => command.to_string(),
        };
        let args = ssh_args(&self.host, &self.control_path, self.connect_timeout, &remote);
        let mut child = Command::new(&self.ssh_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = BoundedLog::new(self.output_limit);
        let mut stderr = BoundedLog::new(self.output_limit);
        let mut out_reader = child.stdout.take().map(BufReader::new);
        let mut err_reader = child.stderr.take().map(BufReader::new);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let host = self.host.name.as_str();

        let drive = async {
            loop {
                tokio::select! {
                    line = next_line(&mut out_reader, &mut out_buf), if out_reader.is_some() => match line {
                        Some(line) => {
                            tracing::debug!(host, stream = "stdout", "{}", line);
                            stdout.push_line(&line);
                        }
                        None => out_reader = None,
                    },
                    line = next_line(&mut err_reader, &mut err_buf), if err_reader.is_some() => match line {
                        Some(line) => {
                            tracing::debug!(host, stream = "stderr", "{}", line);
                            stderr.push_line(&line);
                        }
                        None => err_reader = None,
                    },
                    else => break,
                }
            }
            child.wait().await
        };

        let finished = tokio::select! {
            status = drive => Ok(status?),
            _ = tokio::time::sleep(timeout) => Err(ChannelError::Timeout {
                operation: format!("command on {}", host),
                timeout,
            }),
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        };
        let status = match finished {
            Ok(status) => status,
            Err(e) => {
                // Dropping the child kills the local client only
                drop(child);
                if let Some(pid_file) = &pid_file {
                    self.kill_remote(pid_file).await;
                }
                return Err(e);
            }
        };

        match status.code() {
            Some(SSH_TRANSPORT_FAILURE) | None => Err(ChannelError::Disconnected {
                host: host.to_string(),
                reason: match stderr.excerpt(3) {
                    s if s.is_empty() => format!("ssh terminated ({})", status),
                    s => s,
                },
            }),
            Some(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout,
                stderr,
            }),
        }
    }

    async fn transfer(
        &mut self,
        local: &Path,
        remote: &str,
        direction: TransferDirection,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let args = scp_args(
            &self.host,
            &self.control_path,
            self.connect_timeout,
            local,
            remote,
            direction,
        );
        tracing::debug!(host = %self.host.name, %direction, local = %local.display(), remote, "Transferring");

        let output = Command::new(&self.scp_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| ChannelError::Timeout {
                operation: format!("{} of {}", direction, remote),
                timeout,
            })??;

        if output.status.success() {
            return Ok(());
        }
        Err(ChannelError::Transfer {
            direction,
            local: local.to_path_buf(),
            remote: remote.to_string(),
            exit_code: output.status.code(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Stops this channel's own master connection.
    async fn close(&mut self) {
        let args = vec![
            "-O".to_string(),
            "exit".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            self.host.destination(),
        ];
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(&self.ssh_program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        if let Ok(Err(e)) = result {
            tracing::debug!(host = %self.host.name, error = %e, "Failed to stop ssh master");
        }
    }
}

/// Read one line, replacing invalid UTF-8 instead of giving up on the stream.
///
/// Bytes of a line interrupted by another `select!` branch stay in `buf` and
/// the next call picks up where this one stopped.
async fn next_line<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read_until(b'\n', buf).await {
        Ok(0) if buf.is_empty() => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            Some(line)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Stopped reading command output");
            None
        }
    }
}

/// Wrap `command` so its session records the remote process group id.
///
/// sshd starts every command in a new session, so the shell's pid is also the
/// group id shared by everything the command spawns.
pub fn tracked_command(pid_file: &str, command: &str) -> String {
    format!(
        "echo $$ > {pid}; trap 'rm -f {pid}' EXIT\n{command}",
        pid = pid_file,
        command = command
    )
}

/// Command that terminates the process group recorded by [`tracked_command`].
pub fn kill_command(pid_file: &str) -> String {
    format!(
        "pg=$(cat {pid} 2>/dev/null); if [ -n \"$pg\" ]; then kill -TERM -- -$pg 2>/dev/null; sleep 2; kill -KILL -- -$pg 2>/dev/null; fi; rm -f {pid}; true",
        pid = pid_file
    )
}

fn control_path(dir: &Path, host: &HostSpec, serial: u64) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    host.name.hash(&mut hasher);
    host.address.hash(&mut hasher);
    host.port.hash(&mut hasher);
    dir.join(format!("cm-{:08x}-{}", hasher.finish() as u32, serial))
}

fn common_options(host: &HostSpec, control_path: &Path, connect_timeout: Duration) -> Vec<String> {
    let mut args = Vec::new();
    let options = [
        "BatchMode=yes".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "ServerAliveInterval=15".to_string(),
        "ServerAliveCountMax=4".to_string(),
        "ControlMaster=auto".to_string(),
        format!("ControlPath={}", control_path.display()),
        "ControlPersist=300".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
    ];
    for option in options {
        args.push("-o".to_string());
        args.push(option);
    }
    if let Some(identity) = &host.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args
}

/// Argument vector for running `command` on `host`.
pub fn ssh_args(
    host: &HostSpec,
    control_path: &Path,
    connect_timeout: Duration,
    command: &str,
) -> Vec<String> {
    let mut args = common_options(host, control_path, connect_timeout);
    args.push("-p".to_string());
    args.push(host.port.to_string());
    args.push(host.destination());
    args.push(command.to_string());
    args
}

/// Argument vector for copying one file between here and `host`.
pub fn scp_args(
    host: &HostSpec,
    control_path: &Path,
    connect_timeout: Duration,
    local: &Path,
    remote: &str,
    direction: TransferDirection,
) -> Vec<String> {
    let mut args = vec!["-q".to_string()];
    args.extend(common_options(host, control_path, connect_timeout));
    args.push("-P".to_string());
    args.push(host.port.to_string());

    let remote = format!("{}:{}", host.destination(), scp_remote_path(host.os, remote));
    let local = local.display().to_string();
    match direction {
        TransferDirection::Upload => {
            args.push(local);
            args.push(remote);
        }
        TransferDirection::Download => {
            args.push(remote);
            args.push(local);
        }
    }
    args
}

/// Windows OpenSSH accepts forward slashes in scp paths, not backslashes.
fn scp_remote_path(os: Os, path: &str) -> String {
    match os {
        Os::Windows => path.replace('\\', "/"),
        Os::Linux | Os::Macos => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_host() -> HostSpec {
        let mut host = HostSpec::new("gpu-1", "10.0.0.5", Os::Linux);
        host.user = Some("ec2-user".to_string());
        host.port = 2222;
        host.identity_file = Some(PathBuf::from("/keys/build.pem"));
        host
    }

    #[test]
    fn control_dir_is_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = parent.path().join("sisyphus-4242");
        let dir = ControlDir::create(&path).unwrap();
        assert_eq!(dir.path(), path);
        // A stale socket left by a master that outlived its channel
        std::fs::write(path.join("cm-0badcafe-3"), b"").unwrap();
        assert!(path.is_dir());

        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn ssh_args_include_multiplexing_and_destination() {
        let args = ssh_args(
            &linux_host(),
            Path::new("/tmp/cm/cm-1"),
            Duration::from_secs(10),
            "uname -a",
        );
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/cm/cm-1".to_string()));
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/keys/build.pem");
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
        assert_eq!(args[args.len() - 2], "ec2-user@10.0.0.5");
        assert_eq!(args[args.len() - 1], "uname -a");
    }

    #[test]
    fn scp_download_puts_remote_first() {
        let args = scp_args(
            &linux_host(),
            Path::new("/tmp/cm/cm-1"),
            Duration::from_secs(10),
            Path::new("/out/pkg.conda"),
            "/tmp/sisyphus/numpy/pkg.conda",
            TransferDirection::Download,
        );
        assert_eq!(args[0], "-q");
        let p = args.iter().position(|a| a == "-P").unwrap();
        assert_eq!(args[p + 1], "2222");
        assert_eq!(
            args[args.len() - 2],
            "ec2-user@10.0.0.5:/tmp/sisyphus/numpy/pkg.conda"
        );
        assert_eq!(args[args.len() - 1], "/out/pkg.conda");
    }

    #[test]
    fn scp_upload_to_windows_uses_forward_slashes() {
        let host = HostSpec::new("win-1", "10.0.0.6", Os::Windows);
        let args = scp_args(
            &host,
            Path::new("/tmp/cm/cm-2"),
            Duration::from_secs(10),
            Path::new("/src/recipe.yaml"),
            "\\sisyphus\\numpy\\recipe.yaml",
            TransferDirection::Upload,
        );
        assert_eq!(args[args.len() - 2], "/src/recipe.yaml");
        assert_eq!(args[args.len() - 1], "10.0.0.6:/sisyphus/numpy/recipe.yaml");
    }

    #[test]
    fn every_channel_gets_its_own_control_path() {
        let connector = SshConnector::new("/tmp/cm", 1024);
        let a = connector.next_control_path(&linux_host());
        let b = connector.next_control_path(&linux_host());
        let other = connector.next_control_path(&HostSpec::new("gpu-2", "10.0.0.7", Os::Linux));
        assert_ne!(a, b);
        assert_ne!(a, other);
        assert!(a.starts_with("/tmp/cm"));

        // Clones hand out paths from the same sequence
        let c = connector.clone().next_control_path(&linux_host());
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn tracked_command_records_the_session_group() {
        let wrapped = tracked_command("/tmp/sisyphus-1.pid", "cd /w && make");
        assert!(wrapped.starts_with("echo $$ > /tmp/sisyphus-1.pid;"));
        assert!(wrapped.ends_with("\ncd /w && make"));

        let kill = kill_command("/tmp/sisyphus-1.pid");
        assert!(kill.contains("kill -TERM -- -$pg"));
        assert!(kill.contains("rm -f /tmp/sisyphus-1.pid"));
    }

    #[cfg(unix)]
    mod fake_ssh {
        use std::os::unix::fs::PermissionsExt;

        use super::*;

        /// Channel whose `ssh` is a shell script with `body`.
        fn channel(dir: &Path, body: &str) -> SshChannel {
            let program = dir.join("ssh");
            std::fs::write(&program, format!("#!/bin/sh\n{}", body)).unwrap();
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
            SshChannel {
                host: linux_host(),
                control_path: dir.join("cm"),
                connect_timeout: Duration::from_secs(1),
                output_limit: 1024 * 1024,
                ssh_program: program.clone(),
                scp_program: program,
            }
        }

        #[tokio::test]
        async fn invalid_utf8_output_does_not_break_the_stream() {
            let dir = tempfile::tempdir().unwrap();
            let mut channel = channel(
                dir.path(),
                "printf 'caf\\351 compil\\351\\n'\nseq 1 4000\nprintf 'no newline' >&2\nexit 0\n",
            );

            let output = channel
                .run("conda build .", Duration::from_secs(10), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(output.exit_code, 0);
            let stdout = output.stdout.as_string();
            assert!(stdout.starts_with("caf\u{FFFD} compil\u{FFFD}\n1\n"));
            assert!(stdout.ends_with("\n4000\n"));
            assert_eq!(output.stderr.as_string(), "no newline\n");
        }

        #[tokio::test]
        async fn exit_255_is_a_dropped_connection() {
            let dir = tempfile::tempdir().unwrap();
            let mut channel = channel(dir.path(), "echo 'Connection reset' >&2\nexit 255\n");

            let err = channel
                .run("make", Duration::from_secs(10), &CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                ChannelError::Disconnected { host, reason } => {
                    assert_eq!(host, "gpu-1");
                    assert_eq!(reason, "Connection reset");
                }
                other => panic!("unexpected error {:?}", other),
            }
        }

        #[tokio::test]
        async fn cancelled_command_is_killed_on_the_host() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let mut channel = channel(
                dir.path(),
                &format!(
                    "printf '%s\\n' \"$*\" >> '{}'\ncase \"$*\" in *'kill -TERM'*) exit 0;; esac\nexec sleep 30\n",
                    log.display()
                ),
            );
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let err = tokio::time::timeout(
                Duration::from_secs(5),
                channel.run("make -j8", Duration::from_secs(60), &cancel),
            )
            .await
            .unwrap()
            .unwrap_err();

            assert!(matches!(err, ChannelError::Cancelled));
            let calls = std::fs::read_to_string(&log).unwrap();
            let build = calls.find("make -j8").unwrap();
            let kill = calls.find("kill -TERM").unwrap();
            assert!(build < kill);
            assert!(calls.contains("echo $$ > /tmp/sisyphus-"));
        }

        #[tokio::test]
        async fn timed_out_command_is_killed_on_the_host() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let mut channel = channel(
                dir.path(),
                &format!(
                    "printf '%s\\n' \"$*\" >> '{}'\ncase \"$*\" in *'kill -TERM'*) exit 0;; esac\nexec sleep 30\n",
                    log.display()
                ),
            );

            let err = channel
                .run("make -j8", Duration::from_millis(100), &CancellationToken::new())
                .await
                .unwrap_err();

            assert!(matches!(err, ChannelError::Timeout { .. }));
            assert!(std::fs::read_to_string(&log).unwrap().contains("kill -TERM"));
        }
    }
}
