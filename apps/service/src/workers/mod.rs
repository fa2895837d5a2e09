//! The worker-process orchestrator.
//!
//! Probes that need an external tool run in helper processes: one `fping`
//! per address family and batch, one process per LDAP or external test.
//! [`WorkerPool::tick`] reaps finished helpers without blocking and walks
//! stalled ones through SIGTERM and then SIGKILL.

pub mod external;
pub mod ldap;
pub mod ping;
pub mod subprocess;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netdialog::Outcome;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::catalogue::{ModuleKind, TestKind, TestSpec};
use crate::config::Helpers;
use crate::probe::{ProbeArena, ProbeId, ProbeState, ProtocolState, QueueKind};
use crate::store::{AddressFamily, Store};
pub use subprocess::{ExitState, HelperCommand, HelperOutput, HelperProcess, Launcher, SystemLauncher};

/// Probes served by one helper.
#[derive(Debug, Clone)]
enum Job {
    Ping(Vec<(ProbeId, IpAddr)>),
    Single(ProbeId),
}

impl Job {
    fn probes(&self) -> Vec<ProbeId> {
        match self {
            Job::Ping(batch) => batch.iter().map(|(id, _)| *id).collect(),
            Job::Single(id) => vec![*id],
        }
    }
}

struct WorkerHandle {
    process: Box<dyn HelperProcess>,
    program: String,
    job: Job,
    deadline: Instant,
    /// 0 running, 1 after SIGTERM, 2 after SIGKILL.
    kills: u8,
}

pub struct WorkerPool {
    arena: ProbeArena,
    handles: Vec<WorkerHandle>,
    launcher: Box<dyn Launcher>,
    helpers: Helpers,
    store: Arc<dyn Store>,
}

impl WorkerPool {
    pub fn new(launcher: Box<dyn Launcher>, helpers: Helpers, store: Arc<dyn Store>) -> Self {
        Self { arena: ProbeArena::new(), handles: Vec::new(), launcher, helpers, store }
    }

    pub fn enqueue(&mut self, spec: Arc<TestSpec>) -> ProbeId {
        self.arena.insert(spec)
    }

    /// Helper processes currently alive.
    pub fn running(&self) -> usize {
        self.handles.len()
    }

    pub fn pending(&self) -> usize {
        self.arena.len(QueueKind::Pending)
    }

    pub fn is_idle(&self) -> bool {
        self.handles.is_empty() && self.pending() == 0
    }

    fn module_of(&self, id: ProbeId) -> Option<ModuleKind> {
        self.arena.get(id).and_then(|state| state.spec.kind.module())
    }

    /// Launch up to `slots` helper processes. Returns how many started.
    pub async fn promote(&mut self, slots: usize) -> usize {
        if slots == 0 {
            return 0;
        }
        let mut launched = self.promote_pings(slots).await;

        let singles: Vec<ProbeId> = self
            .arena
            .ids(QueueKind::Pending)
            .into_iter()
            .filter(|id| matches!(self.module_of(*id), Some(ModuleKind::Ldap | ModuleKind::External)))
            .collect();
        for id in singles {
            if launched >= slots {
                break;
            }
            if self.launch_single(id).await {
                launched += 1;
            }
        }
        launched
    }

    async fn promote_pings(&mut self, slots: usize) -> usize {
        let pings: Vec<ProbeId> = self
            .arena
            .ids(QueueKind::Pending)
            .into_iter()
            .filter(|id| self.module_of(*id) == Some(ModuleKind::Ping))
            .collect();
        if pings.is_empty() {
            return 0;
        }

        let mut targets = Vec::new();
        for id in pings {
            let Some(spec) = self.arena.get(id).map(|state| state.spec.clone()) else {
                continue;
            };
            match self.target_address(&spec).await {
                Some(address) => targets.push((id, address)),
                None => {
                    self.arena.move_to(id, QueueKind::Active);
                    self.conclude(id, Outcome::CannotResolve, None);
                }
            }
        }

        let timeout = Duration::from_secs(self.helpers.ping_timeout_seconds);
        let mut launched = 0;
        for (family, batch) in ping::batches(&targets, self.helpers.ping_batch_size) {
            if launched >= slots {
                break;
            }
            let argv = match family {
                AddressFamily::V4 => self.helpers.ping4.clone(),
                AddressFamily::V6 => self.helpers.ping6.clone(),
            };
            let command = HelperCommand::new(argv).with_stdin(ping::stdin_for(&batch));
            for (id, address) in &batch {
                if let Some(state) = self.arena.get_mut(*id) {
                    state.address = Some(*address);
                }
            }
            debug!(?family, addresses = batch.len(), "launching ping batch");
            if self.launch(command, Job::Ping(batch), timeout) {
                launched += 1;
            }
        }
        launched
    }

    async fn launch_single(&mut self, id: ProbeId) -> bool {
        let Some(spec) = self.arena.get(id).map(|state| state.spec.clone()) else {
            return false;
        };
        let address = self.target_address(&spec).await;
        if let Some(state) = self.arena.get_mut(id) {
            state.address = address;
        }

        let (argv, timeout) = match &spec.kind {
            TestKind::Ldap { url } => (
                ldap::command(&self.helpers.ldap, url, spec.timeout),
                Duration::from_secs(self.helpers.ldap_timeout_seconds),
            ),
            TestKind::External { command, .. } => {
                let target = address.map_or_else(|| spec.id.destination.clone(), |address| address.to_string());
                (
                    external::command(command, &spec.column, &target),
                    Duration::from_secs(self.helpers.external_timeout_seconds),
                )
            }
            _ => return false,
        };
        self.launch(HelperCommand::new(argv), Job::Single(id), timeout)
    }

    /// Start a helper for `job`. A failed launch fails every probe of the
    /// job straight away.
    fn launch(&mut self, command: HelperCommand, job: Job, timeout: Duration) -> bool {
        let now = Instant::now();
        for id in job.probes() {
            self.arena.move_to(id, QueueKind::Active);
            if let Some(state) = self.arena.get_mut(id) {
                state.start(now, timeout);
            }
        }

        match self.launcher.launch(&command) {
            Ok(process) => {
                self.handles.push(WorkerHandle {
                    process,
                    program: command.program().to_string(),
                    job,
                    deadline: now + timeout,
                    kills: 0,
                });
                true
            }
            Err(err) => {
                warn!(program = command.program(), "cannot start helper: {err}");
                let detail = format!("cannot run {}: {err}", command.program());
                for id in job.probes() {
                    self.conclude(id, Outcome::HelperExecFailed, Some(detail.clone()));
                }
                false
            }
        }
    }

    /// Literal, catalogue or cached address of the test's destination.
    async fn target_address(&self, spec: &TestSpec) -> Option<IpAddr> {
        if let Ok(address) = spec.id.destination.parse::<IpAddr>() {
            return Some(address);
        }
        if spec.configured_ip.is_some() {
            return spec.configured_ip;
        }
        for family in [AddressFamily::V4, AddressFamily::V6] {
            match self.store.dns_lookup(&spec.id.destination, family).await {
                Ok(Some(cached)) if cached.address.is_some() => return cached.address,
                Ok(_) => {}
                Err(err) => warn!(name = %spec.id.destination, "dns cache unavailable: {err}"),
            }
        }
        None
    }

    /// Reap finished helpers and escalate stalled ones. Returns the number
    /// of helpers reaped.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut reaped = 0;
        let mut index = 0;
        while index < self.handles.len() {
            let handle = &mut self.handles[index];
            match handle.process.try_wait() {
                Ok(Some(exit)) => {
                    let handle = self.handles.swap_remove(index);
                    self.reap(handle, exit);
                    reaped += 1;
                    continue;
                }
                Ok(None) if now >= handle.deadline => Self::escalate(handle),
                Ok(None) => {}
                Err(err) => {
                    warn!(program = %handle.program, "cannot reap helper: {err}");
                    let handle = self.handles.swap_remove(index);
                    for id in handle.job.probes() {
                        self.conclude(id, Outcome::HelperExecFailed, Some(err.to_string()));
                    }
                    reaped += 1;
                    continue;
                }
            }
            index += 1;
        }
        reaped
    }

    fn escalate(handle: &mut WorkerHandle) {
        let signal = match handle.kills {
            0 => Signal::SIGTERM,
            1 => Signal::SIGKILL,
            _ => return,
        };
        warn!(program = %handle.program, pid = handle.process.pid(), signal = signal.as_str(), "helper overran its deadline");
        if let Err(err) = handle.process.signal(signal) {
            debug!(program = %handle.program, "signal failed: {err}");
        }
        handle.kills += 1;
    }

    fn reap(&mut self, mut handle: WorkerHandle, exit: ExitState) {
        debug!(program = %handle.program, %exit, "helper reaped");
        if handle.kills > 0 {
            for id in handle.job.probes() {
                self.conclude(id, Outcome::HelperTimedOut, Some(format!("{} killed after deadline", handle.program)));
            }
            return;
        }

        let output = match handle.process.output() {
            Ok(output) => output,
            Err(err) => {
                for id in handle.job.probes() {
                    self.conclude(id, Outcome::HelperExecFailed, Some(format!("cannot read helper output: {err}")));
                }
                return;
            }
        };

        match handle.job {
            Job::Ping(batch) => self.reap_ping(&handle.program, batch, exit, &output),
            Job::Single(id) => self.reap_single(id, exit, output),
        }
    }

    fn reap_ping(&mut self, program: &str, batch: Vec<(ProbeId, IpAddr)>, exit: ExitState, output: &HelperOutput) {
        let usable = matches!(exit, ExitState::Exited(0..=2));
        let samples = ping::parse(&format!("{}\n{}", output.stderr, output.stdout));

        for (id, address) in batch {
            let (outcome, text) = match ping::verdict(&samples, address) {
                Some(result) if usable => result,
                _ => {
                    let reason = output.stderr.lines().next().unwrap_or_default();
                    (Outcome::HelperExecFailed, format!("{program} gave no result for {address} ({exit}) {reason}"))
                }
            };
            if let Some(state) = self.arena.get_mut(id) {
                state.protocol = ProtocolState::Helper { output: text };
            }
            self.conclude(id, outcome, None);
        }
    }

    fn reap_single(&mut self, id: ProbeId, exit: ExitState, output: HelperOutput) {
        let Some(spec) = self.arena.get(id).map(|state| state.spec.clone()) else {
            return;
        };
        let (outcome, detail) = match &spec.kind {
            TestKind::Ldap { .. } => {
                let outcome = ldap::classify(exit);
                (outcome, (!outcome.is_ok()).then(|| exit.to_string()))
            }
            TestKind::External { programs, .. } => external::verdict(exit, &output, programs),
            _ => (Outcome::HelperExecFailed, None),
        };

        if let Some(state) = self.arena.get_mut(id) {
            let mut text = output.stdout;
            if !output.stderr.trim().is_empty() {
                text.push_str(&output.stderr);
            }
            state.protocol = ProtocolState::Helper { output: text };
        }
        self.conclude(id, outcome, detail);
    }

    fn conclude(&mut self, id: ProbeId, outcome: Outcome, detail: Option<String>) {
        let Some(state) = self.arena.get_mut(id) else {
            return;
        };
        if !state.finish(outcome, Instant::now()) {
            return;
        }
        if detail.is_some() {
            state.detail = detail;
        }
        let queue = if outcome.is_ok() { QueueKind::Done } else { QueueKind::Failed };
        self.arena.move_to(id, queue);
    }

    pub fn drain_finished(&mut self) -> Vec<ProbeState> {
        self.arena.drain_finished()
    }

    /// Kill every helper and drop its probes without a result.
    pub fn abandon(&mut self) -> usize {
        for mut handle in self.handles.drain(..) {
            if let Err(err) = handle.process.signal(Signal::SIGKILL) {
                debug!(program = %handle.program, "signal failed: {err}");
            }
        }
        let dropped = self.arena.discard_unfinished();
        if dropped > 0 {
            info!(dropped, "abandoned helper-backed probes");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::subprocess::fake::{Behaviour, FakeLauncher};
    use super::*;
    use crate::store::LibsqlStore;
    use crate::testing::{context, spec};
    use tempfile::{TempDir, tempdir};

    async fn pool(script: Vec<Behaviour>) -> anyhow::Result<(WorkerPool, FakeLauncherJournal, TempDir)> {
        let dir = tempdir()?;
        let store: Arc<dyn Store> = Arc::new(LibsqlStore::open(&dir.path().join("workers.db")).await?);
        let launcher = FakeLauncher::new(script);
        let journal = launcher.journal.clone();
        Ok((WorkerPool::new(Box::new(launcher), Helpers::default(), store), journal, dir))
    }

    type FakeLauncherJournal = std::rc::Rc<std::cell::RefCell<subprocess::fake::Journal>>;

    fn ping_spec(target: Option<&str>) -> Arc<TestSpec> {
        Arc::new(context("probe.example.net").ping("conn", target.map(|text| text.parse().unwrap())))
    }

    fn exits(code: i32, stderr: &str, stdout: &str) -> Behaviour {
        Behaviour::Exits { code, output: HelperOutput { stdout: stdout.into(), stderr: stderr.into() } }
    }

    #[tokio::test]
    async fn stalled_helper_is_terminated_then_killed() -> anyhow::Result<()> {
        let (mut pool, journal, _dir) = pool(vec![Behaviour::Hangs]).await?;
        pool.enqueue(ping_spec(None));
        assert_eq!(pool.promote(5).await, 1);

        let late = Instant::now() + Duration::from_secs(Helpers::default().ping_timeout_seconds + 1);
        assert_eq!(pool.tick(Instant::now()), 0);
        assert!(journal.borrow().signals.is_empty());

        assert_eq!(pool.tick(late), 0);
        assert_eq!(journal.borrow().signals, vec![Signal::SIGTERM]);
        assert_eq!(pool.tick(late), 0);
        assert_eq!(journal.borrow().signals, vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert_eq!(pool.tick(late), 1);

        let finished = pool.drain_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].outcome(), Outcome::HelperTimedOut);
        assert_eq!(pool.tick(late), 0);
        assert!(pool.drain_finished().is_empty());
        assert!(pool.is_idle());
        Ok(())
    }

    #[tokio::test]
    async fn ping_batch_is_shared_per_family() -> anyhow::Result<()> {
        let stderr = "192.0.2.80 : 0.30 0.50 0.40\n198.51.100.9 : - - -\n";
        let (mut pool, journal, _dir) = pool(vec![exits(1, stderr, ""), exits(0, "2001:db8::5 : 1.0 1.0 1.0\n", "")]).await?;
        pool.enqueue(ping_spec(None));
        pool.enqueue(ping_spec(Some("198.51.100.9")));
        pool.enqueue(ping_spec(Some("2001:db8::5")));
        pool.enqueue(ping_spec(Some("198.51.100.10")));

        assert_eq!(pool.promote(5).await, 2);
        assert_eq!(journal.borrow().launched[0].stdin, b"192.0.2.80\n198.51.100.9\n198.51.100.10\n".to_vec());
        assert_eq!(journal.borrow().launched[1].argv, Helpers::default().ping6);
        pool.tick(Instant::now());

        let outcomes: Vec<Outcome> = pool.drain_finished().iter().map(ProbeState::outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Ok, Outcome::ConnFailed, Outcome::Ok, Outcome::HelperExecFailed]);
        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_ping_target() -> anyhow::Result<()> {
        let (mut pool, journal, _dir) = pool(vec![]).await?;
        let mut unnamed = context("nowhere.example.net");
        unnamed.ip = None;
        pool.enqueue(Arc::new(unnamed.ping("conn", None)));

        assert_eq!(pool.promote(5).await, 0);
        assert!(journal.borrow().launched.is_empty());
        let finished = pool.drain_finished();
        assert_eq!(finished[0].outcome(), Outcome::CannotResolve);
        Ok(())
    }

    #[tokio::test]
    async fn ldap_and_external_run_one_process_each() -> anyhow::Result<()> {
        let rpc = "    100000    4   tcp    111  portmapper\n";
        let (mut pool, journal, _dir) =
            pool(vec![exits(49, "ldap_bind: Invalid credentials (49)\n", ""), exits(0, "", rpc)]).await?;
        pool.enqueue(spec("ldap://dir.example.net/dc=example,dc=net"));
        pool.enqueue(spec("rpc=portmapper"));

        assert_eq!(pool.promote(1).await, 1);
        assert_eq!(pool.running(), 1);
        pool.tick(Instant::now());
        assert_eq!(pool.promote(1).await, 1);
        pool.tick(Instant::now());

        let journal = journal.borrow();
        let launched = &journal.launched;
        assert!(launched[0].argv.contains(&"ldap://dir.example.net".to_string()));
        assert_eq!(launched[1].argv, vec!["rpcinfo", "-p", "192.0.2.80"]);

        let finished = pool.drain_finished();
        assert_eq!(finished[0].outcome(), Outcome::ConnFailed);
        assert_eq!(finished[0].detail.as_deref(), Some("exit status 49"));
        assert_eq!(finished[1].outcome(), Outcome::Ok);
        Ok(())
    }

    #[tokio::test]
    async fn launch_failure_fails_the_batch() -> anyhow::Result<()> {
        let (mut pool, _journal, _dir) = pool(vec![Behaviour::Unlaunchable]).await?;
        pool.enqueue(ping_spec(Some("192.0.2.1")));
        pool.enqueue(ping_spec(Some("192.0.2.2")));

        assert_eq!(pool.promote(5).await, 0);
        let finished = pool.drain_finished();
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|state| state.outcome() == Outcome::HelperExecFailed));
        assert!(pool.is_idle());
        Ok(())
    }
}
