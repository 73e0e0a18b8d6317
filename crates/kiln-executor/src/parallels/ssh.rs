//! Remote shell access to runner VMs over SSH.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::config::SshConfig;
use kiln_core::log::{LogSink, LogStream};
use kiln_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// A command to run remotely.
#[derive(Debug, Clone, Default)]
pub struct RemoteCommand {
    pub command: String,
    /// `KEY=VALUE` pairs exported for the command.
    pub env: Vec<String>,
    /// Bytes fed to the command's stdin, which is closed afterwards.
    pub stdin: Option<Bytes>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Opens sessions to hosts.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Connect to `host`, retrying up to `retries` extra times.
    async fn connect(&self, host: &str, retries: u32) -> Result<Box<dyn ShellSession>>;
}

/// A connection able to run commands. Dropping it ends any command in flight.
#[async_trait]
pub trait ShellSession: Send {
    /// Run a command, streaming its output into `log`. A non-zero exit is an
    /// [`Error::RemoteExecution`].
    async fn run(&mut self, command: &RemoteCommand, log: &LogSink) -> Result<()>;
}

/// [`RemoteShell`] using the system OpenSSH client in batch mode.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    program: String,
    config: SshConfig,
    retry_interval: Duration,
}

impl OpenSsh {
    pub fn new(config: SshConfig) -> Self {
        Self {
            program: "ssh".to_string(),
            config,
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Use another client binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    fn session(&self, host: &str) -> OpenSshSession {
        OpenSshSession {
            program: self.program.clone(),
            args: ssh_args(&self.config, host),
        }
    }
}

/// Client arguments up to and including the destination.
pub fn ssh_args(config: &SshConfig, host: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "ConnectTimeout=10",
        "-o",
        "LogLevel=ERROR",
        "-p",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(config.port.to_string());

    if let Some(identity) = config.identity_file.as_deref().filter(|i| !i.is_empty()) {
        args.push("-i".to_string());
        args.push(identity.to_string());
    }

    match config.user.as_deref().filter(|u| !u.is_empty()) {
        Some(user) => args.push(format!("{}@{}", user, host)),
        None => args.push(host.to_string()),
    }
    args
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Export the environment, then run `command`, so every part of a compound
/// command sees the variables. Entries without `=` or with a key that is not
/// a shell identifier are dropped.
pub fn build_remote_command(env: &[String], command: &str) -> String {
    let assignments: Vec<String> = env
        .iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            is_identifier(key).then(|| format!("{}={}", key, shell_quote(value)))
        })
        .collect();

    if assignments.is_empty() {
        command.to_string()
    } else {
        format!("export {}; {}", assignments.join(" "), command)
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl RemoteShell for OpenSsh {
    async fn connect(&self, host: &str, retries: u32) -> Result<Box<dyn ShellSession>> {
        let session = self.session(host);
        let mut last_error = String::new();

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }

            debug!(host = %host, attempt, "Checking SSH");
            match session.check().await {
                Ok(()) => return Ok(Box::new(session)),
                Err(e) => last_error = e,
            }
        }

        if retries > 0 {
            Err(Error::Timeout(format!(
                "SSH to {} not available after {} attempts: {}",
                host,
                retries + 1,
                last_error
            )))
        } else {
            Err(Error::Connection(format!("SSH to {}: {}", host, last_error)))
        }
    }
}

struct OpenSshSession {
    program: String,
    args: Vec<String>,
}

impl OpenSshSession {
    async fn check(&self) -> std::result::Result<(), String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("exit 0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl ShellSession for OpenSshSession {
    async fn run(&mut self, command: &RemoteCommand, log: &LogSink) -> Result<()> {
        let remote = build_remote_command(&command.env, &command.command);
        debug!(command = %command.command, "Running remote command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&remote)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::RemoteExecution {
                exit_code: None,
                message: format!("failed to run {}: {}", self.program, e),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = command.stdin.clone().unwrap_or_default();

        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The remote side may exit before reading everything.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Remote stdin closed early");
                }
                let _ = stdin.shutdown().await;
            }
        };

        let (_, out, err) = tokio::join!(
            feed,
            forward(stdout, LogStream::Stdout, log),
            forward(stderr, LogStream::Stderr, log),
        );
        out?;
        err?;

        let status = child.wait().await?;
        match status.code() {
            Some(0) => Ok(()),
            Some(SSH_TRANSPORT_FAILURE) => Err(Error::RemoteExecution {
                exit_code: None,
                message: "ssh connection failed".to_string(),
            }),
            Some(code) => Err(Error::RemoteExecution {
                exit_code: Some(code),
                message: format!("{} exited with code {}", command.command, code),
            }),
            None => Err(Error::RemoteExecution {
                exit_code: None,
                message: "ssh client terminated by signal".to_string(),
            }),
        }
    }
}

async fn forward<R>(reader: Option<R>, stream: LogStream, log: &LogSink) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        log.write(stream, Bytes::copy_from_slice(&buf[..n]));
    }
}
