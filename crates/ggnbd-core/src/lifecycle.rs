//! Ordered acquisition and release of the device and session handles.

use crate::{
    buffer::TransferBuffer,
    cancel::Cancellation,
    device::{DeviceFlags, DeviceSpec, GatewayDevice, Sequence},
    service::{Outcome, ServiceLoop},
    session::ProtocolSession,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{debug, error, info, trace, warn};

/// Process-level services the lifecycle needs around the two handles.
pub trait Platform {
    /// Resolve `host` and `port` to candidate server addresses.
    fn resolve(&mut self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;

    /// Enter the restricted-privilege mode. No new connections can be made
    /// afterwards.
    fn restrict(&mut self) -> Result<()>;

    /// Detach from the controlling terminal.
    fn daemonize(&mut self) -> Result<()>;

    /// Arrange for an interrupt to raise the cancellation flag.
    fn watch_interrupts(&mut self) -> Result<()>;
}

/// Settings for one device connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Stay attached to the controlling terminal.
    pub foreground: bool,
    pub sector_size: u32,
    /// Flags applied to the created device in addition to those the export implies.
    pub device_flags: DeviceFlags,
    pub transfer_capacity: usize,
}

impl LinkConfig {
    pub const DEFAULT_SECTOR_SIZE: u32 = 512;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            foreground: false,
            sector_size: Self::DEFAULT_SECTOR_SIZE,
            device_flags: DeviceFlags::empty(),
            transfer_capacity: TransferBuffer::DEFAULT_CAPACITY,
        }
    }

    /// Identity string given to the created device.
    pub fn info(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resource acquired during setup, released in reverse order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Handles,
    DeviceOpened,
    SessionInitialized,
    SessionConnected,
    DeviceCreated,
}

/// Owns both handles for the lifetime of one connection.
pub struct Lifecycle<D, S, P> {
    config: LinkConfig,
    device: D,
    session: S,
    platform: P,
    cancel: Cancellation,
    acquired: Vec<Acquired>,
}

impl<D, S, P> Lifecycle<D, S, P>
where
    D: GatewayDevice,
    S: ProtocolSession,
    P: Platform,
{
    pub fn new(config: LinkConfig, device: D, session: S, platform: P, cancel: Cancellation) -> Self {
        Self {
            config,
            device,
            session,
            platform,
            cancel,
            acquired: Vec::new(),
        }
    }

    /// Acquire everything, service requests, then release what was acquired.
    pub fn run(mut self) -> Outcome {
        let mut outcome = match self.establish() {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(host = %self.config.host, port = self.config.port, "{err:#}");
                Outcome::Failed
            }
        };
        if self.cancel.is_raised() {
            warn!("interrupted");
        }
        if !self.unwind() {
            outcome = Outcome::Failed;
        }
        if outcome == Outcome::Failed {
            error!("device connection failed");
        }
        outcome
    }

    fn establish(&mut self) -> Result<Outcome> {
        let host = self.config.host.clone();
        let port = self.config.port;
        self.acquired.push(Acquired::Handles);

        self.device.open().context("cannot open ggate context")?;
        self.acquired.push(Acquired::DeviceOpened);

        self.session.init().context("cannot create socket")?;
        self.acquired.push(Acquired::SessionInitialized);

        let addrs = self
            .platform
            .resolve(&host, port)
            .with_context(|| format!("failed to look up address ({host}:{port})"))?;
        self.session
            .connect(&addrs)
            .with_context(|| format!("failed to connect to server ({host}:{port})"))?;
        self.acquired.push(Acquired::SessionConnected);
        debug!(host = %host, port, "connected");

        self.platform
            .restrict()
            .context("failed to enter restricted mode")?;
        self.device
            .restrict()
            .context("failed to limit ggate descriptor")?;
        self.session
            .restrict()
            .context("failed to limit socket descriptor")?;

        self.session
            .negotiate()
            .context("failed to negotiate options")?;

        let mut flags = self.config.device_flags;
        if self.session.read_only() {
            flags |= DeviceFlags::READ_ONLY;
        }
        let spec = DeviceSpec {
            info: self.config.info(),
            media_size: self.session.size(),
            sector_size: self.config.sector_size,
            flags,
        };
        let unit = self
            .device
            .create(&spec)
            .with_context(|| format!("failed to create ggate device ({host}:{port})"))?;
        self.acquired.push(Acquired::DeviceCreated);
        info!(
            unit,
            size = spec.media_size,
            read_only = flags.contains(DeviceFlags::READ_ONLY),
            "device created"
        );

        if !self.config.foreground {
            self.platform.daemonize().context("failed to daemonize")?;
        }
        self.platform
            .watch_interrupts()
            .context("failed to install interrupt handler")?;

        let buffer = TransferBuffer::new(self.config.transfer_capacity);
        let outcome =
            ServiceLoop::new(&mut self.device, &mut self.session, buffer, self.cancel).run();
        Ok(outcome)
    }

    /// Release everything acquired, most recent first. Returns `false` if the
    /// disconnect notice could not be sent.
    fn unwind(&mut self) -> bool {
        let mut clean = true;
        while let Some(resource) = self.acquired.pop() {
            trace!(resource = ?resource, "release");
            match resource {
                Acquired::DeviceCreated => {
                    if let Err(err) = self.device.cancel(Sequence::ALL) {
                        warn!(error = %err, "cancel outstanding requests failed");
                    }
                    if let Err(err) = self.device.destroy(true) {
                        warn!(error = %err, "destroy device failed");
                    }
                }
                Acquired::SessionConnected => {
                    if let Err(err) = self.session.send_disconnect() {
                        error!(error = %err, "failed to send disconnect");
                        clean = false;
                    }
                    self.session.shutdown();
                }
                Acquired::SessionInitialized => self.session.close(),
                Acquired::DeviceOpened => self.device.close(),
                Acquired::Handles => {}
            }
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{IoCommand, RawCommand},
        mock::{
            capture_logs, private_cancel, DataStep, Journal, MockDevice, MockPlatform, MockSession,
            StartStep,
        },
    };

    struct Rig {
        journal: Journal,
        device: MockDevice,
        session: MockSession,
        platform: MockPlatform,
        cancel: Cancellation,
        config: LinkConfig,
    }

    impl Rig {
        fn new() -> Self {
            let journal = Journal::default();
            let mut config = LinkConfig::new("nbd.example", 10809);
            config.transfer_capacity = 64 * 1024;
            Self {
                device: MockDevice::new(journal.clone()),
                session: MockSession::new(journal.clone()),
                platform: MockPlatform::new(journal.clone()),
                journal,
                cancel: private_cancel(),
                config,
            }
        }

        fn run(self) -> (Journal, Outcome, String) {
            let journal = self.journal.clone();
            let lifecycle = Lifecycle::new(
                self.config,
                self.device,
                self.session,
                self.platform,
                self.cancel,
            );
            let (outcome, logs) = capture_logs(|| lifecycle.run());
            (journal, outcome, logs)
        }
    }

    fn without_loop(calls: Vec<String>) -> Vec<String> {
        calls
            .into_iter()
            .filter(|c| !c.starts_with("device.start") && !c.starts_with("device.done"))
            .collect()
    }

    #[test]
    fn full_run_releases_in_reverse_order() {
        let rig = Rig::new();
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Completed);
        assert!(!logs.contains("device connection failed"));
        assert_eq!(
            without_loop(journal.calls()),
            vec![
                "device.open",
                "session.init",
                "platform.resolve nbd.example:10809",
                "session.connect addrs=1",
                "platform.restrict",
                "device.restrict",
                "session.restrict",
                "session.negotiate",
                "device.create size=1048576 sector=512 flags=DeviceFlags(0x0)",
                "platform.daemonize",
                "platform.watch_interrupts",
                "device.cancel seq=0",
                "device.destroy force=true",
                "session.send_disconnect",
                "session.shutdown",
                "session.close",
                "device.close",
            ]
        );
    }

    #[test]
    fn restriction_follows_connect() {
        let rig = Rig::new();
        let (journal, _, _) = rig.run();
        let connect = journal.position("session.connect addrs=1").unwrap();
        let restrict = journal.position("platform.restrict").unwrap();
        let negotiate = journal.position("session.negotiate").unwrap();
        assert!(connect < restrict && restrict < negotiate);
    }

    #[test]
    fn resolve_failure_releases_only_opened_handles() {
        let rig = Rig::new();
        rig.journal.fail("platform.resolve");
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(logs.contains("failed to look up address (nbd.example:10809)"));
        assert!(logs.contains("device connection failed"));
        assert_eq!(
            journal.calls(),
            vec![
                "device.open",
                "session.init",
                "platform.resolve nbd.example:10809",
                "session.close",
                "device.close",
            ]
        );
    }

    #[test]
    fn device_open_failure_releases_nothing() {
        let rig = Rig::new();
        rig.journal.fail("device.open");
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(logs.contains("cannot open ggate context"));
        assert_eq!(journal.calls(), vec!["device.open"]);
    }

    #[test]
    fn connect_failure_closes_socket_without_disconnect() {
        let rig = Rig::new();
        rig.journal.fail("session.connect");
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(logs.contains("failed to connect to server (nbd.example:10809)"));
        assert!(journal.matching("session.send_disconnect").is_empty());
        assert!(journal.matching("session.shutdown").is_empty());
        assert_eq!(
            &journal.calls()[journal.calls().len() - 2..],
            &["session.close", "device.close"]
        );
    }

    #[test]
    fn negotiation_failure_disconnects_without_destroy() {
        let rig = Rig::new();
        rig.journal.fail("session.negotiate");
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(logs.contains("failed to negotiate options"));
        assert!(journal.matching("device.create").is_empty());
        assert!(journal.matching("device.destroy").is_empty());
        assert_eq!(journal.matching("session.send_disconnect").len(), 1);
    }

    #[test]
    fn create_failure_skips_destroy() {
        let rig = Rig::new();
        rig.journal.fail("device.create");
        let (journal, outcome, _) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(journal.matching("device.destroy").is_empty());
        assert!(journal.matching("device.cancel").is_empty());
        assert!(journal.matching("platform.daemonize").is_empty());
        assert_eq!(journal.matching("session.send_disconnect").len(), 1);
    }

    #[test]
    fn daemonize_failure_unwinds_device() {
        let rig = Rig::new();
        rig.journal.fail("platform.daemonize");
        let (journal, outcome, _) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(journal.matching("device.start").is_empty());
        assert_eq!(
            journal.matching("device.destroy"),
            vec!["device.destroy force=true"]
        );
        assert_eq!(journal.matching("session.close").len(), 1);
    }

    #[test]
    fn foreground_skips_daemonize() {
        let mut rig = Rig::new();
        rig.config.foreground = true;
        let (journal, outcome, _) = rig.run();

        assert_eq!(outcome, Outcome::Completed);
        assert!(journal.matching("platform.daemonize").is_empty());
    }

    #[test]
    fn disconnect_failure_fails_otherwise_clean_run() {
        let rig = Rig::new();
        rig.journal.fail("session.send_disconnect");
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert!(logs.contains("failed to send disconnect"));
        // Remaining teardown still runs.
        assert_eq!(
            &journal.calls()[journal.calls().len() - 3..],
            &["session.shutdown", "session.close", "device.close"]
        );
    }

    #[test]
    fn read_only_export_creates_read_only_device() {
        let mut rig = Rig::new();
        rig.session.read_only = true;
        rig.session.size = 4 << 20;
        let (journal, _, _) = rig.run();

        assert_eq!(
            journal.matching("device.create"),
            vec!["device.create size=4194304 sector=512 flags=DeviceFlags(READ_ONLY)"]
        );
    }

    #[test]
    fn loop_failure_propagates_and_still_unwinds() {
        let mut rig = Rig::new();
        rig.device
            .push_start(StartStep::request(8, IoCommand::Read, 0, 512));
        rig.session.push_data(DataStep::Fail);
        let (journal, outcome, _) = rig.run();

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(
            journal.matching("device.cancel"),
            vec!["device.cancel seq=8", "device.cancel seq=0"]
        );
        assert_eq!(journal.matching("device.destroy").len(), 1);
    }

    #[test]
    fn interrupted_run_succeeds() {
        let mut rig = Rig::new();
        rig.device.push_start(StartStep::request(
            1,
            IoCommand::Unsupported(RawCommand {
                code: 4,
                name: Some("BIO_GETATTR"),
            }),
            0,
            0,
        ));
        rig.device
            .push_start(StartStep::request(2, IoCommand::Read, 0, 4096));
        rig.session.push_data(DataStep::Interrupt(rig.cancel));
        let (journal, outcome, logs) = rig.run();

        assert_eq!(outcome, Outcome::Completed);
        assert!(logs.contains("interrupted"));
        assert!(!logs.contains("device connection failed"));
        assert_eq!(
            journal.matching("session.set_disconnect"),
            vec!["session.set_disconnect true"]
        );
        assert_eq!(journal.matching("session.send_disconnect").len(), 1);
    }
}
