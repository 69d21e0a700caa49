//! Spawning and reaping of the `ssh` child whose stdio carries the
//! SFTP stream. Authentication beyond public keys (password prompts,
//! fingerprint confirmation) belongs to the embedding engine's login
//! helper; the bundled launcher runs ssh in batch mode.

use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::constants::{DEFAULT_TIMEOUT_SECS, REAP_POLL_MS};
use super::error::SftpError;
use super::transport::PipeTransport;

/// Connection parameters for one session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    /// Passed through for the external login helper; the bundled
    /// launcher never reads it.
    pub password: Option<String>,
    /// Expected host key fingerprint, for the external login helper.
    pub fingerprint: Option<String>,
    /// Extra `-o` options handed to ssh verbatim.
    pub ssh_options: Vec<String>,
    pub keep_alive: bool,
    /// 0 = quiet; 1-3 map to `-v` flags on the ssh child.
    pub debug: u8,
    pub timeout: Duration,
    /// Offline rehearsal mode: no child, no wire traffic.
    pub simulation: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            host: String::new(),
            port: 22,
            user: None,
            password: None,
            fingerprint: None,
            ssh_options: Vec::new(),
            keep_alive: false,
            debug: 0,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            simulation: false,
        }
    }
}

/// The argument vector for the ssh child, without the program name.
pub fn ssh_command_args(options: &ConnectOptions) -> Vec<String> {
    let mut args = vec![
        "-x".to_string(),
        "-oForwardX11=no".to_string(),
        "-oClearAllForwardings=yes".to_string(),
        "-oBatchMode=yes".to_string(),
    ];
    if options.port != 22 {
        args.push("-p".to_string());
        args.push(options.port.to_string());
    }
    if let Some(user) = &options.user {
        args.push("-l".to_string());
        args.push(user.clone());
    }
    if options.keep_alive {
        args.push("-oServerAliveInterval=30".to_string());
    }
    for option in &options.ssh_options {
        args.push("-o".to_string());
        args.push(option.clone());
    }
    for _ in 0..options.debug.min(3) {
        args.push("-v".to_string());
    }
    args.push(options.host.clone());
    args.push("-s".to_string());
    args.push("sftp".to_string());
    args
}

/// A spawned ssh child. Owned exclusively by one session; dropping it
/// without `reap` kills the process so no zombie outlives the session.
#[derive(Debug)]
pub struct SshChild {
    child: Option<Child>,
}

impl SshChild {
    /// Adopt a child someone else spawned; the seam for launchers that
    /// do their own authentication before handing over the pipes.
    pub fn from_child(child: Child) -> Self {
        SshChild { child: Some(child) }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Wait up to `grace` for the child to exit on its own, then
    /// escalate to SIGKILL and collect the status.
    pub fn reap(&mut self, grace: Duration) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("ssh child exited with {}", status);
                    return Some(status);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("could not poll ssh child: {}", err);
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(REAP_POLL_MS));
        }
        info!("ssh child still running after grace period, killing it");
        let _ = child.kill();
        match child.wait() {
            Ok(status) => Some(status),
            Err(err) => {
                warn!("could not collect killed ssh child: {}", err);
                None
            }
        }
    }
}

impl Drop for SshChild {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Spawn `ssh <args> <host> -s sftp` and wrap its stdio in a timed
/// pipe transport.
pub fn spawn_ssh(
    options: &ConnectOptions,
    timeout_flag: Arc<AtomicBool>,
) -> Result<(SshChild, PipeTransport), SftpError> {
    let args = ssh_command_args(options);
    debug!("spawning ssh {}", args.join(" "));
    let mut child = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if options.debug > 0 {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SftpError::Protocol("ssh child has no stdin pipe".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SftpError::Protocol("ssh child has no stdout pipe".to_string()))?;
    let transport = PipeTransport::new(
        stdout.into(),
        stdin.into(),
        options.timeout,
        timeout_flag,
    )?;
    Ok((SshChild::from_child(child), transport))
}
