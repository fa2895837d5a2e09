//! The connection multiplexer.
//!
//! Every in-process probe is a chain of small I/O futures driven from one
//! `FuturesUnordered` on the current thread. Each future owns the probe's
//! transport while it runs and hands it back with its event, so the
//! probe's protocol state is only ever touched here, between polls. Every
//! step is bounded by the probe's own deadline, independent of how long
//! [`Multiplexer::poll_once`] waits.

pub mod dnstest;
pub mod resolve;
pub mod tls;
pub mod transport;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use netdialog::dns::DnsReport;
use netdialog::ntp::{self, NtpIntent, NtpReport};
use netdialog::{Intent, Outcome};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::catalogue::{TestKind, TestSpec};
use crate::probe::{ProbeArena, ProbeId, ProbeState, ProtocolState, QueueKind};
pub use resolve::{AddressResolver, Resolution};
use transport::{Transport, connect_tcp, connect_udp};

const READ_CHUNK: usize = 16 * 1024;
const MIN_NTP_ROUND: Duration = Duration::from_millis(500);

type IoFuture = LocalBoxFuture<'static, (ProbeId, IoEvent)>;

enum IoEvent {
    Resolved { name: String, address: Option<IpAddr> },
    Connected(Result<Transport, Outcome>),
    Wrote(Transport, io::Result<usize>),
    /// An empty buffer means the peer closed its side.
    Read(Transport, io::Result<Vec<u8>>),
    HalfClosed(Transport, io::Result<()>),
    Upgraded(Result<Transport, Outcome>),
    DnsAnswered(DnsReport),
    TimedOut,
}

/// The next step of a probe, decided before any future is built.
enum Next {
    Write(Vec<u8>),
    Read { round: Option<Duration> },
    StartTls,
    HalfClose,
    Finish(Outcome),
}

fn classify(err: &io::Error) -> Outcome {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::AddrNotAvailable => Outcome::ConnFailed,
        io::ErrorKind::TimedOut => Outcome::ConnTimeout,
        _ => Outcome::Interrupted,
    }
}

fn ntp_outcome(report: &NtpReport) -> Outcome {
    if report.answered > 0 {
        Outcome::Ok
    } else if report.received > 0 {
        Outcome::BadData
    } else {
        Outcome::ConnTimeout
    }
}

fn bounded<F>(id: ProbeId, deadline: Instant, operation: F) -> IoFuture
where
    F: Future<Output = IoEvent> + 'static,
{
    Box::pin(async move {
        match tokio::time::timeout_at(deadline.into(), operation).await {
            Ok(event) => (id, event),
            Err(_) => (id, IoEvent::TimedOut),
        }
    })
}

fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Multiplexer {
    arena: ProbeArena,
    resolver: AddressResolver,
    tls: TlsConnector,
    in_flight: FuturesUnordered<IoFuture>,
}

impl Multiplexer {
    pub fn new(resolver: AddressResolver, tls: TlsConnector) -> Self {
        Self { arena: ProbeArena::new(), resolver, tls, in_flight: FuturesUnordered::new() }
    }

    pub fn enqueue(&mut self, spec: Arc<TestSpec>) -> ProbeId {
        self.arena.insert(spec)
    }

    pub fn active(&self) -> usize {
        self.arena.len(QueueKind::Active)
    }

    pub fn pending(&self) -> usize {
        self.arena.len(QueueKind::Pending)
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.active() == 0
    }

    /// Start up to `slots` pending probes. Returns how many were started.
    pub async fn promote(&mut self, slots: usize) -> usize {
        let mut started = 0;
        while started < slots {
            let Some(id) = self.arena.first(QueueKind::Pending) else {
                break;
            };
            self.arena.move_to(id, QueueKind::Active);
            started += 1;
            self.start(id).await;
        }
        started
    }

    async fn start(&mut self, id: ProbeId) {
        let Some(state) = self.arena.get_mut(id) else {
            return;
        };
        let spec = state.spec.clone();
        state.start(Instant::now(), spec.timeout);

        if spec.kind.module().is_some() {
            warn!(probe = %id, test = %spec.id, "helper test handed to the multiplexer");
            self.conclude(id, Outcome::HelperExecFailed);
            return;
        }

        let resolution = match self.resolver.prepare(&spec, epoch_now()).await {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(test = %spec.id, "dns cache unavailable: {err}");
                Resolution::Lookup(spec.id.destination.clone())
            }
        };

        match resolution {
            Resolution::Ready(address) => self.connect(id, address),
            Resolution::Lookup(name) => {
                trace!(probe = %id, %name, "resolving");
                let lookup = self.resolver.lookup(name.clone());
                let deadline = self.deadline(id);
                self.in_flight.push(bounded(id, deadline, async move {
                    IoEvent::Resolved { address: lookup.await, name }
                }));
            }
            Resolution::Failed => self.conclude(id, Outcome::CannotResolve),
        }
    }

    fn deadline(&self, id: ProbeId) -> Instant {
        self.arena.get(id).and_then(|state| state.deadline).unwrap_or_else(Instant::now)
    }

    fn connect(&mut self, id: ProbeId, address: IpAddr) {
        let Some(state) = self.arena.get_mut(id) else {
            return;
        };
        state.address = Some(address);
        let spec = state.spec.clone();
        let deadline = state.deadline.unwrap_or_else(Instant::now);
        let target = SocketAddr::new(address, spec.port);
        let source = spec.source_ip;
        debug!(probe = %id, test = %spec.id, %target, "connecting");

        let future = match &spec.kind {
            TestKind::Ntp => bounded(id, deadline, async move {
                IoEvent::Connected(connect_udp(target, source).await.map(Transport::Udp).map_err(|err| classify(&err)))
            }),
            TestKind::Dns { queries } => {
                let queries = queries.clone();
                let wait = deadline.saturating_duration_since(Instant::now());
                bounded(id, deadline, async move { IoEvent::DnsAnswered(dnstest::run_queries(target, queries, wait).await) })
            }
            _ if spec.tls => {
                let connector = self.tls.clone();
                let name = tls::server_name(&spec.id.destination);
                bounded(id, deadline, async move {
                    let stream = match connect_tcp(target, source).await {
                        Ok(stream) => stream,
                        Err(err) => return IoEvent::Connected(Err(classify(&err))),
                    };
                    let Some(name) = name else {
                        return IoEvent::Connected(Err(Outcome::BadSslHandshake));
                    };
                    IoEvent::Connected(
                        connector
                            .connect(name, stream)
                            .await
                            .map(|stream| Transport::Tls(Box::new(stream)))
                            .map_err(|_| Outcome::BadSslHandshake),
                    )
                })
            }
            _ => bounded(id, deadline, async move {
                IoEvent::Connected(connect_tcp(target, source).await.map(Transport::Tcp).map_err(|err| classify(&err)))
            }),
        };
        self.in_flight.push(future);
    }

    /// Wait up to `wait` for I/O, then handle everything that is ready.
    /// Returns the number of events handled.
    pub async fn poll_once(&mut self, wait: Duration) -> usize {
        if self.in_flight.is_empty() {
            return 0;
        }
        let mut events = match tokio::time::timeout(wait, self.in_flight.next()).await {
            Ok(Some(event)) => vec![event],
            Ok(None) | Err(_) => return 0,
        };
        while let Some(Some(event)) = self.in_flight.next().now_or_never() {
            events.push(event);
        }

        let handled = events.len();
        for (id, event) in events {
            self.dispatch(id, event).await;
        }
        handled
    }

    async fn dispatch(&mut self, id: ProbeId, event: IoEvent) {
        if self.arena.get(id).is_none_or(ProbeState::is_finished) {
            return;
        }

        match event {
            IoEvent::Resolved { name, address } => {
                let Some(spec) = self.arena.get(id).map(|state| state.spec.clone()) else {
                    return;
                };
                let address = match self.resolver.record(&spec, &name, address, epoch_now()).await {
                    Ok(address) => address,
                    Err(err) => {
                        warn!(%name, "dns cache update failed: {err}");
                        address.or(spec.configured_ip)
                    }
                };
                match address {
                    Some(address) => self.connect(id, address),
                    None => self.conclude(id, Outcome::CannotResolve),
                }
            }
            IoEvent::Connected(Ok(transport)) => {
                if let Some(state) = self.arena.get_mut(id) {
                    state.timing.connected = Some(Instant::now());
                    state.tls = transport.tls_summary();
                }
                self.advance(id, transport);
            }
            IoEvent::Connected(Err(outcome)) | IoEvent::Upgraded(Err(outcome)) => self.conclude(id, outcome),
            IoEvent::Upgraded(Ok(transport)) => {
                if let Some(state) = self.arena.get_mut(id) {
                    state.tls = transport.tls_summary();
                    if let ProtocolState::Dialog(dialog) = &mut state.protocol {
                        dialog.on_tls_established();
                    }
                }
                self.advance(id, transport);
            }
            IoEvent::Wrote(transport, result) => {
                self.on_written(id, result);
                self.advance(id, transport);
            }
            IoEvent::Read(transport, result) => {
                self.on_read(id, result);
                self.advance(id, transport);
            }
            IoEvent::HalfClosed(transport, result) => {
                if let Err(err) = result {
                    debug!(probe = %id, "half-close failed: {err}");
                }
                if let Some(ProtocolState::Dialog(dialog)) = self.arena.get_mut(id).map(|state| &mut state.protocol) {
                    dialog.on_half_closed();
                }
                self.advance(id, transport);
            }
            IoEvent::DnsAnswered(report) => {
                let outcome = report.outcome();
                if let Some(state) = self.arena.get_mut(id) {
                    state.protocol = ProtocolState::Dns(report);
                }
                self.conclude(id, outcome);
            }
            IoEvent::TimedOut => {
                let Some(state) = self.arena.get_mut(id) else {
                    return;
                };
                let outcome = if state.address.is_none() {
                    Outcome::CannotResolve
                } else {
                    match &mut state.protocol {
                        ProtocolState::Dialog(dialog) => {
                            dialog.on_timeout();
                            dialog.outcome()
                        }
                        ProtocolState::Ntp(exchange) => match ntp_outcome(&exchange.report()) {
                            Outcome::Ok => Outcome::Ok,
                            _ => Outcome::ConnTimeout,
                        },
                        _ => Outcome::ConnTimeout,
                    }
                };
                self.conclude(id, outcome);
            }
        }
    }

    fn on_written(&mut self, id: ProbeId, result: io::Result<usize>) {
        let Some(state) = self.arena.get_mut(id) else {
            return;
        };
        match (&mut state.protocol, result) {
            (ProtocolState::Dialog(dialog), Ok(0)) => dialog.fail(Outcome::Interrupted),
            (ProtocolState::Dialog(dialog), Ok(count)) => dialog.on_written(count),
            (ProtocolState::Dialog(dialog), Err(err)) => dialog.fail(classify(&err)),
            (ProtocolState::Ntp(_), Ok(ntp::PACKET_LEN)) => trace!(probe = %id, "ntp request sent"),
            (ProtocolState::Ntp(exchange), _) => exchange.abandon_round(),
            _ => {}
        }
    }

    fn on_read(&mut self, id: ProbeId, result: io::Result<Vec<u8>>) {
        let Some(state) = self.arena.get_mut(id) else {
            return;
        };
        let fatal = match (&mut state.protocol, result) {
            (ProtocolState::Dialog(dialog), Ok(data)) if data.is_empty() => {
                dialog.on_peer_closed();
                None
            }
            (ProtocolState::Dialog(dialog), Ok(data)) => {
                dialog.on_data(&data);
                None
            }
            (ProtocolState::Dialog(dialog), Err(err)) => {
                dialog.fail(classify(&err));
                None
            }
            (ProtocolState::Ntp(exchange), Ok(packet)) => {
                exchange.on_reply(&packet, SystemTime::now());
                None
            }
            (ProtocolState::Ntp(exchange), Err(err)) if err.kind() == io::ErrorKind::TimedOut => {
                exchange.abandon_round();
                None
            }
            (ProtocolState::Ntp(_), Err(err)) => Some(classify(&err)),
            _ => None,
        };
        if let Some(outcome) = fatal {
            state.finish(outcome, Instant::now());
        }
    }

    /// Decide and launch the next I/O step, or finish the probe.
    fn advance(&mut self, id: ProbeId, transport: Transport) {
        let Some(state) = self.arena.get_mut(id) else {
            return;
        };
        if state.is_finished() {
            // already concluded by a fatal read on a datagram socket
            let outcome = state.outcome();
            self.settle(id, outcome);
            return;
        }

        let deadline = state.deadline.unwrap_or_else(Instant::now);
        let ntp_round = (state.spec.timeout / ntp::ATTEMPTS as u32).max(MIN_NTP_ROUND);
        let next = match &mut state.protocol {
            ProtocolState::Dialog(dialog) => match dialog.intent() {
                Intent::Write(bytes) => Next::Write(bytes),
                Intent::Read => Next::Read { round: None },
                Intent::StartTls => Next::StartTls,
                Intent::HalfClose => Next::HalfClose,
                Intent::Close => Next::Finish(dialog.outcome()),
            },
            ProtocolState::Ntp(exchange) => match exchange.intent(SystemTime::now()) {
                NtpIntent::Send(packet) => Next::Write(packet.to_vec()),
                NtpIntent::Receive => Next::Read { round: Some(ntp_round) },
                NtpIntent::Done => Next::Finish(ntp_outcome(&exchange.report())),
            },
            _ => Next::Finish(Outcome::BadData),
        };
        let server = state.spec.id.destination.clone();

        let future = match next {
            Next::Finish(outcome) => {
                self.conclude(id, outcome);
                return;
            }
            Next::Write(bytes) => bounded(id, deadline, async move {
                let mut transport = transport;
                let result = transport.write_some(&bytes).await;
                IoEvent::Wrote(transport, result)
            }),
            Next::Read { round } => bounded(id, deadline, async move {
                let mut transport = transport;
                let mut buf = vec![0u8; READ_CHUNK];
                let read = transport.read_some(&mut buf);
                let result = match round {
                    Some(wait) => tokio::time::timeout(wait, read)
                        .await
                        .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut))),
                    None => read.await,
                };
                let result = result.map(|count| {
                    buf.truncate(count);
                    buf
                });
                IoEvent::Read(transport, result)
            }),
            Next::HalfClose => bounded(id, deadline, async move {
                let mut transport = transport;
                let result = transport.shutdown_write().await;
                IoEvent::HalfClosed(transport, result)
            }),
            Next::StartTls => {
                let Transport::Tcp(stream) = transport else {
                    self.conclude(id, Outcome::BadSslHandshake);
                    return;
                };
                let Some(name) = tls::server_name(&server) else {
                    self.conclude(id, Outcome::BadSslHandshake);
                    return;
                };
                let connector = self.tls.clone();
                bounded(id, deadline, async move {
                    IoEvent::Upgraded(
                        connector
                            .connect(name, stream)
                            .await
                            .map(|stream| Transport::Tls(Box::new(stream)))
                            .map_err(|_| Outcome::BadSslHandshake),
                    )
                })
            }
        };
        self.in_flight.push(future);
    }

    fn conclude(&mut self, id: ProbeId, outcome: Outcome) {
        if let Some(state) = self.arena.get_mut(id) {
            state.finish(outcome, Instant::now());
        }
        let outcome = self.arena.get(id).map_or(outcome, ProbeState::outcome);
        self.settle(id, outcome);
    }

    fn settle(&mut self, id: ProbeId, outcome: Outcome) {
        let queue = if outcome.is_ok() { QueueKind::Done } else { QueueKind::Failed };
        self.arena.move_to(id, queue);
        trace!(probe = %id, %outcome, "probe finished");
    }

    /// Hand over every finished probe.
    pub fn drain_finished(&mut self) -> Vec<ProbeState> {
        self.arena.drain_finished()
    }

    /// Drop every in-flight and queued probe without a result.
    pub fn abandon(&mut self) -> usize {
        self.in_flight = FuturesUnordered::new();
        let dropped = self.arena.discard_unfinished();
        if dropped > 0 {
            debug!(dropped, "abandoned unfinished probes");
        }
        dropped
    }
}
