//! Helper processes behind a small trait, so the orchestrator can be driven
//! by real children or by scripted fakes.

use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, trace};

/// A command line plus the bytes to feed it on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub argv: Vec<String>,
    pub stdin: Vec<u8>,
}

impl HelperCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv, stdin: Vec::new() }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signalled(i32),
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Exited(code),
            (None, Some(signal)) => ExitState::Signalled(signal),
            (None, None) => ExitState::Signalled(0),
        }
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit status {code}"),
            ExitState::Signalled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait HelperProcess {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking reap.
    fn try_wait(&mut self) -> io::Result<Option<ExitState>>;

    fn signal(&mut self, signal: Signal) -> io::Result<()>;

    /// Captured output; only meaningful once reaped.
    fn output(&mut self) -> io::Result<HelperOutput>;
}

pub trait Launcher {
    fn launch(&self, command: &HelperCommand) -> io::Result<Box<dyn HelperProcess>>;
}

/// Forks real children with stdout and stderr in temp files that are
/// removed when the process handle is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

struct SystemProcess {
    child: Child,
    stdout: NamedTempFile,
    stderr: NamedTempFile,
}

fn capture(kind: &str) -> io::Result<NamedTempFile> {
    tempfile::Builder::new().prefix(&format!("netprobe-{kind}-")).suffix(".log").tempfile()
}

impl Launcher for SystemLauncher {
    fn launch(&self, command: &HelperCommand) -> io::Result<Box<dyn HelperProcess>> {
        let Some((program, args)) = command.argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty helper command"));
        };

        let stdout = capture("out")?;
        let stderr = capture("err")?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout.reopen()?))
            .stderr(Stdio::from(stderr.reopen()?))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            let input = command.stdin.clone();
            tokio::spawn(async move {
                if let Err(err) = pipe.write_all(&input).await {
                    trace!("helper stdin closed early: {err}");
                }
            });
        }

        debug!(program, pid = child.id(), "helper started");
        Ok(Box::new(SystemProcess { child, stdout, stderr }))
    }
}

impl HelperProcess for SystemProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
        Ok(self.child.try_wait()?.map(ExitState::from))
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        killpg(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
    }

    fn output(&mut self) -> io::Result<HelperOutput> {
        Ok(HelperOutput {
            stdout: String::from_utf8_lossy(&fs::read(self.stdout.path())?).into_owned(),
            stderr: String::from_utf8_lossy(&fs::read(self.stderr.path())?).into_owned(),
        })
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted helpers for orchestrator tests.

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Behaviour {
        /// Exits on the first poll.
        Exits { code: i32, output: HelperOutput },
        /// Ignores SIGTERM; dies on SIGKILL.
        Hangs,
        /// The launch itself fails.
        Unlaunchable,
    }

    /// Everything the fake helpers saw, shared with the test.
    #[derive(Debug, Default)]
    pub struct Journal {
        pub launched: Vec<HelperCommand>,
        pub signals: Vec<Signal>,
    }

    #[derive(Default)]
    pub struct FakeLauncher {
        pub script: RefCell<VecDeque<Behaviour>>,
        pub journal: Rc<RefCell<Journal>>,
    }

    impl FakeLauncher {
        pub fn new(script: impl IntoIterator<Item = Behaviour>) -> Self {
            Self { script: RefCell::new(script.into_iter().collect()), journal: Rc::default() }
        }
    }

    struct FakeProcess {
        behaviour: Behaviour,
        killed: bool,
        journal: Rc<RefCell<Journal>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, command: &HelperCommand) -> io::Result<Box<dyn HelperProcess>> {
            self.journal.borrow_mut().launched.push(command.clone());
            let behaviour = self.script.borrow_mut().pop_front().unwrap_or(Behaviour::Hangs);
            if matches!(behaviour, Behaviour::Unlaunchable) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(Box::new(FakeProcess { behaviour, killed: false, journal: self.journal.clone() }))
        }
    }

    impl HelperProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
            Ok(match (&self.behaviour, self.killed) {
                (Behaviour::Exits { code, .. }, _) => Some(ExitState::Exited(*code)),
                (_, true) => Some(ExitState::Signalled(9)),
                _ => None,
            })
        }

        fn signal(&mut self, signal: Signal) -> io::Result<()> {
            self.journal.borrow_mut().signals.push(signal);
            self.killed |= signal == Signal::SIGKILL;
            Ok(())
        }

        fn output(&mut self) -> io::Result<HelperOutput> {
            Ok(match &self.behaviour {
                Behaviour::Exits { output, .. } => output.clone(),
                _ => HelperOutput::default(),
            })
        }
    }
}
