//! Recording fakes for the session's collaborators.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv};

use super::{MigrationSession, OutgoingMigration};
use crate::config::MigrationConfig;
use crate::core::{
    FtChannel, MigrationError, MigrationResult, MigrationSink, StreamFactory, StreamFile, VmHost,
};
use crate::transport::Registrations;

/// Outcome reported to a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    Connected,
    Error(Errno),
    IncomingError(Errno),
}

/// Everything the fakes saw, plus knobs the tests turn.
#[derive(Debug, Default)]
pub(crate) struct Log {
    pub events: Vec<Recorded>,
    pub connected: Vec<OutgoingMigration>,
    pub connected_bandwidth: Option<u64>,
    pub errored_endpoint_closed: Option<bool>,
    pub registered_at_report: Option<usize>,
    pub registrations: Option<Registrations>,
    pub monitor_suspended: usize,
    pub processed_incoming: usize,
    pub autostart_disabled: usize,
    pub replay_scheduled: usize,
    pub incoming_errors: Vec<Errno>,
    pub stream_closes: usize,
    pub ft_begins: usize,
    pub ft_notifications: usize,
    pub ft_bytes: Vec<u8>,
    pub ft_closes: usize,

    pub refuse_stream: bool,
    pub refuse_ft: bool,
    pub ft_begin_error: Option<Errno>,
    pub ft_has_error: bool,
}

impl Log {
    /// Outcomes of outgoing attempts, in order.
    pub fn outgoing(&self) -> Vec<Recorded> {
        self.events
            .iter()
            .copied()
            .filter(|e| matches!(e, Recorded::Connected | Recorded::Error(_)))
            .collect()
    }
}

pub(crate) type SharedLog = Rc<RefCell<Log>>;

struct FakeSink(SharedLog);

impl MigrationSink for FakeSink {
    fn on_connected(&mut self, migration: OutgoingMigration) {
        let mut log = self.0.borrow_mut();
        log.events.push(Recorded::Connected);
        log.registered_at_report = log.registrations.as_ref().map(Registrations::len);
        log.connected_bandwidth = Some(migration.bandwidth_limit());
        log.connected.push(migration);
    }

    fn on_error(&mut self, migration: OutgoingMigration, error: MigrationError) {
        let mut log = self.0.borrow_mut();
        log.events.push(Recorded::Error(error.errno()));
        log.registered_at_report = log.registrations.as_ref().map(Registrations::len);
        log.errored_endpoint_closed = Some(migration.endpoint().is_closed());
    }
}

struct FakeHost(SharedLog);

impl VmHost for FakeHost {
    fn process_incoming(&mut self, stream: &mut dyn StreamFile) {
        assert!(!stream.has_error());
        self.0.borrow_mut().processed_incoming += 1;
    }

    fn disable_autostart(&mut self) {
        self.0.borrow_mut().autostart_disabled += 1;
    }

    fn suspend_monitor(&mut self) {
        self.0.borrow_mut().monitor_suspended += 1;
    }

    fn schedule_replay(&mut self) {
        self.0.borrow_mut().replay_scheduled += 1;
    }

    fn on_incoming_error(&mut self, error: &MigrationError) {
        let mut log = self.0.borrow_mut();
        log.events.push(Recorded::IncomingError(error.errno()));
        log.incoming_errors.push(error.errno());
    }
}

struct FakeStream(SharedLog);

impl StreamFile for FakeStream {
    fn close(&mut self) -> i32 {
        self.0.borrow_mut().stream_closes += 1;
        0
    }

    fn has_error(&self) -> bool {
        false
    }

    fn poll_notifications(&mut self) {}
}

/// Consumes at most one byte of the accepted socket per poll.
struct FakeChannel {
    log: SharedLog,
    conn: RawFd,
}

impl StreamFile for FakeChannel {
    fn close(&mut self) -> i32 {
        self.log.borrow_mut().ft_closes += 1;
        0
    }

    fn has_error(&self) -> bool {
        self.log.borrow().ft_has_error
    }

    fn poll_notifications(&mut self) {
        let mut log = self.log.borrow_mut();
        log.ft_notifications += 1;
        let mut byte = [0u8; 1];
        if let Ok(1) = recv(self.conn, &mut byte, MsgFlags::MSG_DONTWAIT) {
            log.ft_bytes.push(byte[0]);
        }
    }
}

impl FtChannel for FakeChannel {
    fn begin(&mut self) -> Result<(), Errno> {
        let mut log = self.log.borrow_mut();
        log.ft_begins += 1;
        match log.ft_begin_error {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }
}

struct FakeStreams(SharedLog);

impl StreamFactory for FakeStreams {
    fn open_socket(&mut self, _conn: BorrowedFd<'_>) -> Option<Box<dyn StreamFile>> {
        if self.0.borrow().refuse_stream {
            return None;
        }
        Some(Box::new(FakeStream(self.0.clone())))
    }

    fn open_ft_trans(
        &mut self,
        _listener: BorrowedFd<'_>,
        conn: BorrowedFd<'_>,
    ) -> Option<Box<dyn FtChannel>> {
        if self.0.borrow().refuse_ft {
            return None;
        }
        Some(Box::new(FakeChannel {
            log: self.0.clone(),
            conn: conn.as_raw_fd(),
        }))
    }
}

/// A session wired to recording fakes.
#[derive(Debug)]
pub(crate) struct TestHarness {
    pub session: MigrationSession,
    pub log: SharedLog,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    pub fn with_config(config: MigrationConfig) -> Self {
        Self::try_with_config(config).unwrap()
    }

    pub fn try_with_config(config: MigrationConfig) -> MigrationResult<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let log = SharedLog::default();
        let session = MigrationSession::new(
            config,
            Box::new(FakeHost(log.clone())),
            Box::new(FakeStreams(log.clone())),
            Box::new(FakeSink(log.clone())),
        )?;
        log.borrow_mut().registrations = Some(session.reactor.registrations());
        Ok(Self { session, log })
    }

    /// Drive the session until `done` holds. Panics after five seconds.
    pub fn run_until(&mut self, done: impl Fn(&Log) -> bool) {
        for _ in 0..100 {
            if done(&self.log.borrow()) {
                return;
            }
            self.session
                .run_once(Some(Duration::from_millis(50)))
                .unwrap();
        }
        panic!("condition not reached; log: {:?}", self.log.borrow());
    }

    /// Drive the session for `rounds` short polls.
    pub fn run_for(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.session
                .run_once(Some(Duration::from_millis(20)))
                .unwrap();
        }
    }
}
