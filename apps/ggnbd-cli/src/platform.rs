use anyhow::{bail, Context, Result};
use ggnbd_core::{install_interrupt_handler, Platform};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::debug;

/// Process services backed by the host operating system.
#[derive(Debug, Default)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn resolve(&mut self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            bail!("no addresses for {host}");
        }
        debug!(host, port, count = addrs.len(), "resolved server");
        Ok(addrs)
    }

    fn restrict(&mut self) -> Result<()> {
        nix::unistd::close(libc::STDIN_FILENO).context("close stdin")?;
        ggnbd_capsicum::limit_stdio().context("limit stdio")?;
        ggnbd_capsicum::enter_capability_mode().context("enter capability mode")?;
        Ok(())
    }

    fn daemonize(&mut self) -> Result<()> {
        nix::unistd::daemon(false, false)?;
        debug!("detached from terminal");
        Ok(())
    }

    fn watch_interrupts(&mut self) -> Result<()> {
        install_interrupt_handler().context("install SIGINT handler")?;
        Ok(())
    }
}
