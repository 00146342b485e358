//! Scripted collaborators recording every call into one shared journal.

use crate::{
    cancel::Cancellation,
    device::{
        DeviceError, DeviceErrorKind, DeviceResult, DeviceSpec, DeviceStatus, GatewayDevice,
        IoCommand, PendingRequest, Sequence,
    },
    lifecycle::Platform,
    session::{ProtocolSession, ReplyError, SendOutcome, SessionError, SessionErrorKind, SessionResult},
};
use anyhow::{anyhow, Result};
use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    io,
    net::SocketAddr,
    rc::Rc,
    sync::{atomic::AtomicBool, Arc, Mutex},
};

pub fn private_cancel() -> Cancellation {
    Cancellation::with_flag(Box::leak(Box::new(AtomicBool::new(false))))
}

/// Ordered record of collaborator calls plus the operations told to fail.
#[derive(Clone, Default)]
pub struct Journal {
    inner: Rc<RefCell<JournalInner>>,
}

#[derive(Default)]
struct JournalInner {
    calls: Vec<String>,
    failing: HashSet<&'static str>,
}

impl Journal {
    pub fn record(&self, call: impl Into<String>) {
        self.inner.borrow_mut().calls.push(call.into());
    }

    pub fn fail(&self, op: &'static str) {
        self.inner.borrow_mut().failing.insert(op);
    }

    fn fails(&self, op: &'static str) -> bool {
        self.inner.borrow().failing.contains(op)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.borrow().calls.clone()
    }

    /// Calls whose name starts with `prefix`, in order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.inner.borrow().calls.iter().position(|c| c == call)
    }
}

/// What the next `start` hands back.
pub enum StartStep {
    Request {
        seq: u64,
        command: IoCommand,
        offset: u64,
        length: u64,
    },
    Status(DeviceStatus),
    Error,
}

impl StartStep {
    pub fn request(seq: u64, command: IoCommand, offset: u64, length: u64) -> Self {
        StartStep::Request {
            seq,
            command,
            offset,
            length,
        }
    }
}

pub struct MockDevice {
    journal: Journal,
    starts: VecDeque<StartStep>,
    done_status: VecDeque<DeviceResult<DeviceStatus>>,
    /// Payload copied into the buffer for write requests.
    pub write_fill: u8,
    /// Bytes handed back with each completed read.
    pub completed_reads: Vec<Vec<u8>>,
    unit: i32,
}

impl MockDevice {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            starts: VecDeque::new(),
            done_status: VecDeque::new(),
            write_fill: 0xAB,
            completed_reads: Vec::new(),
            unit: -1,
        }
    }

    pub fn push_start(&mut self, step: StartStep) {
        self.starts.push_back(step);
    }

    pub fn push_done(&mut self, status: DeviceResult<DeviceStatus>) {
        self.done_status.push_back(status);
    }

    fn result(&self, op: &'static str) -> DeviceResult<()> {
        self.journal.record(op);
        if self.journal.fails(op) {
            return Err(DeviceError::with_message(DeviceErrorKind::Io, op));
        }
        Ok(())
    }
}

impl GatewayDevice for MockDevice {
    fn open(&mut self) -> DeviceResult<()> {
        self.result("device.open")
    }

    fn restrict(&mut self) -> DeviceResult<()> {
        self.result("device.restrict")
    }

    fn create(&mut self, spec: &DeviceSpec) -> DeviceResult<i32> {
        self.journal.record(format!(
            "device.create size={} sector={} flags={:?}",
            spec.media_size, spec.sector_size, spec.flags
        ));
        if self.journal.fails("device.create") {
            return Err(DeviceError::with_message(
                DeviceErrorKind::Rejected,
                "geometry rejected",
            ));
        }
        self.unit = 0;
        Ok(self.unit)
    }

    fn unit(&self) -> i32 {
        self.unit
    }

    fn start(
        &mut self,
        request: &mut PendingRequest,
        buf: &mut [u8],
    ) -> DeviceResult<DeviceStatus> {
        self.journal
            .record(format!("device.start offered={}", request.length));
        match self
            .starts
            .pop_front()
            .unwrap_or(StartStep::Status(DeviceStatus::Canceled))
        {
            StartStep::Request {
                seq,
                command,
                offset,
                length,
            } => {
                request.seq = Sequence(seq);
                request.command = command;
                request.offset = offset;
                request.length = length;
                if command == IoCommand::Write {
                    let len = (length as usize).min(buf.len());
                    buf[..len].fill(self.write_fill);
                }
                Ok(DeviceStatus::Success)
            }
            StartStep::Status(status) => Ok(status),
            StartStep::Error => Err(DeviceError::with_message(
                DeviceErrorKind::Io,
                "start ioctl failed",
            )),
        }
    }

    fn done(&mut self, request: &PendingRequest, buf: &mut [u8]) -> DeviceResult<DeviceStatus> {
        self.journal.record(format!(
            "device.done seq={} error={}",
            request.seq, request.error
        ));
        if request.command == IoCommand::Read && request.error == 0 {
            self.completed_reads
                .push(buf[..request.length as usize].to_vec());
        }
        match self.done_status.pop_front() {
            Some(status) => status,
            None => Ok(DeviceStatus::from_errno(request.error)),
        }
    }

    fn cancel(&mut self, seq: Sequence) -> DeviceResult<()> {
        self.journal.record(format!("device.cancel seq={seq}"));
        Ok(())
    }

    fn destroy(&mut self, force: bool) -> DeviceResult<()> {
        self.journal.record(format!("device.destroy force={force}"));
        Ok(())
    }

    fn close(&mut self) {
        self.journal.record("device.close");
    }
}

/// What the next `recv_reply_header` hands back; `Echo` answers the last send.
pub enum HeaderStep {
    Echo,
    Sequence(u64),
    Rejected(u32),
    Fail,
    /// Raise the cancellation flag, then fail as an interrupted call would.
    Interrupt(Cancellation),
}

/// What the next `recv_reply_data` does; `Fill` writes the byte pattern.
pub enum DataStep {
    Fill(u8),
    Fail,
    Interrupt(Cancellation),
}

pub struct MockSession {
    journal: Journal,
    headers: VecDeque<HeaderStep>,
    data: VecDeque<DataStep>,
    last_sent: Sequence,
    pub size: u64,
    pub read_only: bool,
    pub trim: bool,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockSession {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            headers: VecDeque::new(),
            data: VecDeque::new(),
            last_sent: Sequence::default(),
            size: 1 << 20,
            read_only: false,
            trim: true,
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push_header(&mut self, step: HeaderStep) {
        self.headers.push_back(step);
    }

    pub fn push_data(&mut self, step: DataStep) {
        self.data.push_back(step);
    }

    fn result(&self, op: &'static str) -> SessionResult<()> {
        self.journal.record(op);
        if self.journal.fails(op) {
            return Err(SessionError::with_message(SessionErrorKind::Io, op));
        }
        Ok(())
    }

    fn send(&mut self, call: String, op: &'static str, seq: Sequence) -> SessionResult<SendOutcome> {
        self.journal.record(call);
        if self.journal.fails(op) {
            return Err(SessionError::with_message(SessionErrorKind::Io, op));
        }
        self.last_sent = seq;
        Ok(SendOutcome::Sent)
    }
}

impl ProtocolSession for MockSession {
    fn init(&mut self) -> SessionResult<()> {
        self.result("session.init")
    }

    fn connect(&mut self, addrs: &[SocketAddr]) -> SessionResult<()> {
        self.journal.record(format!("session.connect addrs={}", addrs.len()));
        if self.journal.fails("session.connect") {
            return Err(SessionError::with_message(
                SessionErrorKind::Io,
                "connection refused",
            ));
        }
        Ok(())
    }

    fn restrict(&mut self) -> SessionResult<()> {
        self.result("session.restrict")
    }

    fn negotiate(&mut self) -> SessionResult<()> {
        self.result("session.negotiate")
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn send_read(&mut self, seq: Sequence, offset: u64, length: u64) -> SessionResult<SendOutcome> {
        self.send(
            format!("session.send_read seq={seq} offset={offset} length={length}"),
            "session.send_read",
            seq,
        )
    }

    fn send_write(
        &mut self,
        seq: Sequence,
        offset: u64,
        length: u64,
        data: &[u8],
    ) -> SessionResult<SendOutcome> {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(data.to_vec());
        }
        self.send(
            format!("session.send_write seq={seq} offset={offset} length={length}"),
            "session.send_write",
            seq,
        )
    }

    fn send_trim(&mut self, seq: Sequence, offset: u64, length: u64) -> SessionResult<SendOutcome> {
        if !self.trim {
            self.journal.record(format!("session.send_trim seq={seq} skipped"));
            return Ok(SendOutcome::Unsupported);
        }
        self.send(
            format!("session.send_trim seq={seq} offset={offset} length={length}"),
            "session.send_trim",
            seq,
        )
    }

    fn send_flush(&mut self, seq: Sequence) -> SessionResult<SendOutcome> {
        self.send(
            format!("session.send_flush seq={seq}"),
            "session.send_flush",
            seq,
        )
    }

    fn recv_reply_header(&mut self) -> Result<Sequence, ReplyError> {
        self.journal.record("session.recv_reply_header");
        match self.headers.pop_front().unwrap_or(HeaderStep::Echo) {
            HeaderStep::Echo => Ok(self.last_sent),
            HeaderStep::Sequence(seq) => Ok(Sequence(seq)),
            HeaderStep::Rejected(errno) => Err(ReplyError::Rejected { errno }),
            HeaderStep::Fail => Err(ReplyError::Failed(SessionError::with_message(
                SessionErrorKind::Closed,
                "connection reset",
            ))),
            HeaderStep::Interrupt(cancel) => {
                cancel.raise();
                Err(ReplyError::Failed(SessionError::new(
                    SessionErrorKind::Interrupted,
                )))
            }
        }
    }

    fn recv_reply_data(&mut self, buf: &mut [u8]) -> SessionResult<()> {
        self.journal
            .record(format!("session.recv_reply_data length={}", buf.len()));
        match self.data.pop_front().unwrap_or(DataStep::Fill(0x5A)) {
            DataStep::Fill(byte) => {
                buf.fill(byte);
                Ok(())
            }
            DataStep::Fail => Err(SessionError::with_message(
                SessionErrorKind::Closed,
                "short read",
            )),
            DataStep::Interrupt(cancel) => {
                cancel.raise();
                Err(SessionError::new(SessionErrorKind::Interrupted))
            }
        }
    }

    fn disable_trim(&mut self) {
        self.journal.record("session.disable_trim");
        self.trim = false;
    }

    fn set_disconnect(&mut self, disconnect: bool) {
        self.journal
            .record(format!("session.set_disconnect {disconnect}"));
    }

    fn send_disconnect(&mut self) -> SessionResult<()> {
        self.result("session.send_disconnect")
    }

    fn shutdown(&mut self) {
        self.journal.record("session.shutdown");
    }

    fn close(&mut self) {
        self.journal.record("session.close");
    }
}

pub struct MockPlatform {
    journal: Journal,
}

impl MockPlatform {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    fn result(&self, op: &'static str) -> Result<()> {
        self.journal.record(op);
        if self.journal.fails(op) {
            return Err(anyhow!("{op} failed"));
        }
        Ok(())
    }
}

impl Platform for MockPlatform {
    fn resolve(&mut self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        self.journal.record(format!("platform.resolve {host}:{port}"));
        if self.journal.fails("platform.resolve") {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such host").into());
        }
        Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
    }

    fn restrict(&mut self) -> Result<()> {
        self.result("platform.restrict")
    }

    fn daemonize(&mut self) -> Result<()> {
        self.result("platform.daemonize")
    }

    fn watch_interrupts(&mut self) -> Result<()> {
        self.result("platform.watch_interrupts")
    }
}

/// Run `f` with a subscriber capturing formatted events, returning the text.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut inner) = self.0.lock() {
                inner.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let sink = Sink::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let text = sink
        .0
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();
    (result, text)
}
