//! The scheduling sweep.
//!
//! One sweep pulls every due test from the store, hands socket probes to
//! the multiplexer and helper probes (through the module queue) to the
//! worker pool, drives both under the concurrency budget until they drain,
//! then folds, escalates and reports the results in one batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::budget::Budget;
use crate::catalogue::{Catalogue, ModuleKind, ServiceTable, TestSpec};
use crate::config::Config;
use crate::error::ServiceError;
use crate::escalation::{Assessment, EscalationPolicy, Severity, StatusBoard};
use crate::multiplexer::{AddressResolver, Multiplexer, tls};
use crate::probe::ProbeState;
use crate::reporting::{
    CertificateExpiry, ColumnResult, Message, ReportSink, Reporter, SweepStats, fold, lifetime_minutes, self_report_text, status_text,
    timestamp, tls_columns,
};
use crate::store::{ModuleQueueItem, Store};
use crate::workers::{Launcher, WorkerPool};

const MODULE_BATCH: usize = 500;
const MAX_IDLE: Duration = Duration::from_secs(60);

fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Knobs the sweep needs beyond its components.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub location: Option<String>,
    pub tick: Duration,
    pub ssl_column: Option<String>,
    pub report_column: Option<String>,
    pub ssl_expiry: CertificateExpiry,
    /// Lifetime base for the engine's own status column.
    pub default_interval: Duration,
}

impl SweepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            location: config.engine.location.clone(),
            tick: Duration::from_millis(config.engine.tick_millis.max(1)),
            ssl_column: config.engine.ssl_column.clone(),
            report_column: config.engine.report_column.clone(),
            ssl_expiry: CertificateExpiry {
                warn_days: config.engine.sslwarn_days,
                alarm_days: config.engine.sslalarm_days,
            },
            default_interval: Duration::from_secs(config.engine.default_interval_seconds),
        }
    }
}

pub struct Engine {
    store: Arc<dyn Store>,
    catalogue: Catalogue,
    budget: Budget,
    mux: Multiplexer,
    workers: WorkerPool,
    policy: EscalationPolicy,
    board: StatusBoard,
    reporter: Reporter,
    settings: SweepSettings,
}

impl Engine {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        sink: Arc<dyn ReportSink>,
        launcher: Box<dyn Launcher>,
    ) -> Result<Self, ServiceError> {
        let services = ServiceTable::new(&config.services);
        let catalogue = Catalogue::build(config, &services);
        let resolver =
            AddressResolver::new(config.engine.dns, Duration::from_secs(config.engine.timeout_seconds), store.clone());
        let connector = tls::connector(config.engine.verify_certificates)?;

        Ok(Self {
            budget: Budget::new(config.engine.budget, config.effective_concurrency(), config.engine.max_helpers),
            mux: Multiplexer::new(resolver, connector),
            workers: WorkerPool::new(launcher, config.helpers.clone(), store.clone()),
            policy: EscalationPolicy::new(&config.escalation.nopage),
            board: StatusBoard::new(),
            reporter: Reporter::new(sink, config.collector.batch_size),
            settings: SweepSettings::from_config(config),
            catalogue,
            store,
        })
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Bring the schedule in line with the catalogue: register every test
    /// and drop rows for tests that are no longer configured.
    #[instrument(skip(self), fields(tests = self.catalogue.len()))]
    pub async fn reconcile(&self) -> Result<()> {
        self.store.begin_sweep().await?;
        for spec in self.catalogue.iter() {
            self.store.register(&spec.schedule_entry()).await?;
        }
        let dropped = self.store.finish_sweep().await?;
        if dropped > 0 {
            info!(dropped, "removed tests that are no longer configured");
        }
        Ok(())
    }

    /// Sweep until cancelled, sleeping until the next test falls due.
    pub async fn run(&mut self, once: bool, cancel: CancellationToken) -> Result<()> {
        self.reconcile().await?;
        if self.catalogue.is_empty() {
            info!("no tests configured");
        }

        loop {
            match self.run_sweep(&cancel).await {
                Ok(Some(stats)) => info!(tests = stats.tests, failures = stats.failures, elapsed = ?stats.elapsed, "sweep finished"),
                Ok(None) => {}
                Err(err) => warn!("sweep failed: {err:#}"),
            }
            if once || cancel.is_cancelled() {
                break;
            }

            let wait = self.idle_time().await;
            debug!(?wait, "sleeping until the next test is due");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("engine stopped");
        Ok(())
    }

    async fn idle_time(&self) -> Duration {
        match self.store.seconds_to_next_test(self.settings.location.as_deref(), epoch_now()).await {
            Ok(Some(seconds)) => Duration::from_secs(seconds.max(1) as u64).min(MAX_IDLE),
            Ok(None) => MAX_IDLE,
            Err(err) => {
                warn!("cannot read the schedule: {err:#}");
                MAX_IDLE
            }
        }
    }

    /// Run one sweep. Returns `None` when nothing was due or the sweep was
    /// cancelled before it could report.
    #[instrument(skip_all, fields(location = ?self.settings.location))]
    pub async fn run_sweep(&mut self, cancel: &CancellationToken) -> Result<Option<SweepStats>> {
        let started = Instant::now();
        let mut due = self.collect_due(epoch_now()).await?;
        if due.is_empty() {
            return Ok(None);
        }
        due.shuffle(&mut rand::thread_rng());
        debug!(tests = due.len(), "tests due");

        for spec in due {
            match spec.kind.module() {
                Some(module) => self.hand_off(module, &spec).await,
                None => {
                    self.mux.enqueue(spec);
                }
            }
        }
        self.pick_up_modules().await;

        let Some((finished, helpers)) = self.drive(cancel).await else {
            return Ok(None);
        };
        let mut stats = self.report(&finished, helpers).await;
        stats.elapsed = started.elapsed();

        if let Some(column) = self.settings.report_column.clone() {
            self.push_self_report(&column, &stats);
        }
        match self.reporter.flush().await {
            Ok(sent) => debug!(sent, "sweep reported"),
            Err(err) => warn!("cannot deliver status messages: {err}"),
        }

        Ok(Some(stats))
    }

    async fn collect_due(&self, now: i64) -> Result<Vec<Arc<TestSpec>>> {
        let mut rows = self.store.due_tests(self.settings.location.as_deref(), now).await?;
        let mut due = Vec::new();
        while let Some(row) = rows.next().await {
            let entry = row?;
            match self.catalogue.get(&entry.id) {
                Some(spec) => due.push(spec),
                None => debug!(test = %entry.id, "due row has no configured test"),
            }
        }
        Ok(due)
    }

    async fn hand_off(&self, module: ModuleKind, spec: &TestSpec) {
        let item = ModuleQueueItem {
            id: None,
            module,
            test: spec.id.clone(),
            location: spec.location.clone(),
            queued_at: epoch_now(),
        };
        if let Err(err) = self.store.enqueue_module(&item).await {
            warn!(test = %spec.id, "cannot queue helper test: {err:#}");
        }
    }

    async fn pick_up_modules(&mut self) {
        for module in [ModuleKind::Ping, ModuleKind::Ldap, ModuleKind::External] {
            loop {
                let batch = match self.store.take_module_batch(module, MODULE_BATCH).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(module = module.as_str(), "cannot read the module queue: {err:#}");
                        break;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                for item in batch {
                    match self.catalogue.get(&item.test) {
                        Some(spec) => {
                            self.workers.enqueue(spec);
                        }
                        None => debug!(test = %item.test, "queued helper test is no longer configured"),
                    }
                }
            }
        }
    }

    /// Drive both executors until they drain. Returns the finished probes
    /// and how many helpers ran, or `None` after cancellation.
    async fn drive(&mut self, cancel: &CancellationToken) -> Option<(Vec<ProbeState>, usize)> {
        let tick = self.settings.tick;
        let mut finished = Vec::new();
        let mut helpers = 0;

        while !(self.mux.is_idle() && self.workers.is_idle()) {
            if cancel.is_cancelled() {
                let dropped = self.mux.abandon() + self.workers.abandon();
                info!(dropped, "sweep cancelled, in-flight probes dropped");
                return None;
            }

            let slots = self.budget.slots(self.mux.active(), self.workers.running());
            helpers += self.workers.promote(slots.helpers).await;
            let slots = self.budget.slots(self.mux.active(), self.workers.running());
            self.mux.promote(slots.sockets).await;

            if self.mux.active() > 0 {
                self.mux.poll_once(tick).await;
            } else if !self.workers.is_idle() {
                tokio::time::sleep(tick).await;
            }
            self.workers.tick(Instant::now());

            finished.extend(self.mux.drain_finished());
            finished.extend(self.workers.drain_finished());
        }

        Some((finished, helpers))
    }

    async fn report(&mut self, finished: &[ProbeState], helpers: usize) -> SweepStats {
        let now = epoch_now();
        let mut results = fold(finished);
        if let Some(column) = &self.settings.ssl_column {
            results.extend(tls_columns(finished, column, self.settings.ssl_expiry, now));
        }
        for result in &results {
            self.board.observe(&result.host, &result.column, result.base);
        }

        let mut failures = 0;
        for result in &results {
            let severity = self.escalate(result, now).await;
            if severity.is_failing() {
                failures += 1;
            }
        }

        for state in finished {
            if let Err(err) = self.store.mark_done(&state.spec.id, now).await {
                warn!(test = %state.spec.id, "cannot update the schedule: {err:#}");
            }
        }
        self.board.end_sweep();

        SweepStats { tests: finished.len(), failures, helpers, location: self.settings.location.clone(), ..Default::default() }
    }

    /// Decide one column's reported severity and queue its message.
    async fn escalate(&mut self, result: &ColumnResult, now: i64) -> Severity {
        let counter = match self.store.load_counter(&result.host, &result.column).await {
            Ok(counter) => counter,
            Err(err) => {
                warn!(host = result.host, column = result.column, "cannot load failure counter: {err:#}");
                Default::default()
            }
        };

        let assessment = Assessment {
            host: &result.host,
            column: &result.column,
            base: result.base,
            dialup: result.dialup,
            reverse: result.reverse,
            always_report: result.always_report,
            escalation: &result.escalation,
        };
        let verdict = self.policy.decide(&assessment, counter, &self.board, now);
        if let Err(err) = self.store.save_counter(&result.host, &result.column, verdict.counter).await {
            warn!(host = result.host, column = result.column, "cannot save failure counter: {err:#}");
        }
        self.board.report(&result.host, &result.column, verdict.severity);

        let message = if result.send_as_data && result.base == Severity::Ok && !result.data.is_empty() {
            Message::Data { host: result.host.clone(), column: result.column.clone(), text: result.data.join("\n") }
        } else {
            Message::Status {
                host: result.host.clone(),
                column: result.column.clone(),
                severity: verdict.severity,
                lifetime: lifetime_minutes(result.interval),
                stamp: timestamp(&chrono::Local::now()),
                text: status_text(result, &verdict, verdict.counter.down_for(now)),
            }
        };
        self.reporter.push(message);
        verdict.severity
    }

    fn push_self_report(&mut self, column: &str, stats: &SweepStats) {
        let host = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(err) => {
                warn!("cannot determine the local host name: {err}");
                return;
            }
        };
        self.reporter.push(Message::Status {
            host,
            column: column.to_string(),
            severity: Severity::Ok,
            lifetime: lifetime_minutes(self.settings.default_interval),
            stamp: timestamp(&chrono::Local::now()),
            text: self_report_text(stats),
        });
    }
}
