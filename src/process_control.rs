use crate::config::Redirect;
use anyhow::{anyhow, Context};
use serde::Serialize;
use std::{
    fmt,
    fs::OpenOptions,
    path::Path,
    process::{Command, Output},
};
use subprocess::{Exec, NullFile, Redirection};
use sysinfo::{Pid, ProcessStatus, Signal, System};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Service,
    Capture,
    Generator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Controller => "controller",
            Role::Service => "service",
            Role::Capture => "capture",
            Role::Generator => "generator",
        };
        write!(f, "{}", name)
    }
}

/// A process started by labrun, either on an emulated host or (for the controller) on the
/// machine running labrun itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub role: Role,
    pub name: String,
    pub host: Option<String>,
    pub command: String,
    pub pid: u32,
}
impl ProcessHandle {
    pub fn location(&self) -> &str {
        self.host.as_deref().unwrap_or("local")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Signalled,
    AlreadyGone,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Signalled => write!(f, "signalled"),
            Termination::AlreadyGone => write!(f, "already gone"),
        }
    }
}

/// Runs the given command as a detached processes. This function does not block because the
/// process is managed by the OS and running separately from this thread.
///
/// # Arguments
///
/// * prefix - Words put in front of the command, e.g. `ip netns exec h1`
/// * command - The command to run.
/// * redirect - Where stdout and stderr go. `File` appends to `<name>.stdout` and
///   `<name>.stderr` inside `cwd`.
/// * name - Name used for the redirect files
/// * cwd - Working directory of the new process
///
/// # Returns
///
/// The PID returned by the operating system
pub fn run_command_detached(
    prefix: &[&str],
    command: &str,
    redirect: Redirect,
    name: &str,
    cwd: &Path,
) -> anyhow::Result<u32> {
    let words = split_command(command)?;
    let argv = prefix
        .iter()
        .map(|word| word.to_string())
        .chain(words)
        .collect::<Vec<_>>();

    match &argv[..] {
        [program, args @ ..] => {
            let exec = Exec::cmd(program).args(args).cwd(cwd);

            let exec = match redirect {
                Redirect::Null => exec.stdout(NullFile).stderr(NullFile),
                Redirect::Parent => exec,
                Redirect::File => {
                    let out_file = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(cwd.join(format!("{}.stdout", name)))?;
                    let err_file = OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(cwd.join(format!("{}.stderr", name)))?;
                    exec.stdout(Redirection::File(out_file))
                        .stderr(Redirection::File(err_file))
                }
            };

            debug!("Spawning detached: {}", argv.join(" "));
            exec.detached()
                .popen()
                .context(format!(
                    "Failed to spawn detached process, command: {}",
                    command
                ))?
                .pid()
                .context("Process should have a PID")
        }
        _ => Err(anyhow!("Empty command")),
    }
}

/// Runs a command in the foreground and waits for it to exit.
pub fn run_command(prefix: &[&str], command: &str) -> anyhow::Result<Output> {
    let words = split_command(command)?;
    let argv = prefix
        .iter()
        .map(|word| word.to_string())
        .chain(words)
        .collect::<Vec<_>>();

    match &argv[..] {
        [program, args @ ..] => {
            debug!("Running: {}", argv.join(" "));
            Command::new(program)
                .args(args)
                .output()
                .context(format!("Failed to run command: {}", command))
        }
        _ => Err(anyhow!("Empty command")),
    }
}

/// Like `run_command` but awaits the command on the tokio runtime. The child is killed when
/// the returned future is dropped, so callers can race it against a timeout or cancellation.
pub async fn run_command_async(prefix: &[&str], command: &str) -> anyhow::Result<Output> {
    let words = split_command(command)?;
    let argv = prefix
        .iter()
        .map(|word| word.to_string())
        .chain(words)
        .collect::<Vec<_>>();

    match &argv[..] {
        [program, args @ ..] => {
            debug!("Running: {}", argv.join(" "));
            tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
                .context(format!("Failed to run command: {}", command))
        }
        _ => Err(anyhow!("Empty command")),
    }
}

/// Breaks a command string into POSIX words.
pub fn split_command(command: &str) -> anyhow::Result<Vec<String>> {
    let words = shlex::split(command)
        .context(format!("Command string is not POSIX compliant: {}", command))?;
    if words.is_empty() {
        return Err(anyhow!("Empty command"));
    }
    Ok(words)
}

/// A process counts as alive if the OS knows it and it is not a zombie waiting to be reaped.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_all();
    system
        .process(Pid::from_u32(pid))
        .map(|proc| !matches!(proc.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

/// Sends SIGTERM to the given pid. Processes that no longer exist are reported as
/// `AlreadyGone` rather than as an error so teardown can be repeated safely.
pub fn terminate(pid: u32) -> anyhow::Result<Termination> {
    let mut system = System::new();
    system.refresh_all();

    match system.process(Pid::from_u32(pid)) {
        None => Ok(Termination::AlreadyGone),
        Some(proc) if matches!(proc.status(), ProcessStatus::Zombie | ProcessStatus::Dead) => {
            Ok(Termination::AlreadyGone)
        }
        Some(proc) => match proc.kill_with(Signal::Term) {
            Some(true) => Ok(Termination::Signalled),
            Some(false) => Err(anyhow!("Unable to deliver SIGTERM to pid {}", pid)),
            None => Err(anyhow!("SIGTERM is not supported on this platform")),
        },
    }
}
