use std::time::Duration;

use vchan_hv::{DomainId, EventChannel, HvContext, HvResult, Port, PortStatus, WaitOutcome};

/// An event channel handle and the single port a link uses on it.
pub(crate) struct NotifyEndpoint {
    channel: Box<dyn EventChannel>,
    port: Port,
}

impl NotifyEndpoint {
    /// Opens a handle and offers an unbound port to `peer`.
    pub(crate) fn offer(ctx: &HvContext, peer: DomainId) -> HvResult<Self> {
        let mut channel = ctx.events.open()?;
        let port = channel.bind_unbound(peer)?;
        Ok(Self { channel, port })
    }

    /// Opens a handle and binds to `remote_port` offered by `remote`.
    pub(crate) fn connect(ctx: &HvContext, remote: DomainId, remote_port: Port) -> HvResult<Self> {
        let mut channel = ctx.events.open()?;
        let port = channel.bind_interdomain(remote, remote_port)?;
        Ok(Self { channel, port })
    }

    pub(crate) fn port(&self) -> Port {
        self.port
    }

    pub(crate) fn notify(&self) -> HvResult<()> {
        self.channel.notify(self.port)
    }

    pub(crate) fn unmask(&self) -> HvResult<()> {
        self.channel.unmask(self.port)
    }

    pub(crate) fn is_pending(&self) -> HvResult<bool> {
        self.channel.is_pending(self.port)
    }

    pub(crate) fn clear_pending(&self) -> HvResult<bool> {
        self.channel.clear_pending(self.port)
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> HvResult<WaitOutcome> {
        self.channel.wait(self.port, timeout)
    }

    pub(crate) fn status(&self) -> HvResult<PortStatus> {
        self.channel.status(self.port)
    }

    /// Unbinds the port, then closes the handle. Both are attempted; the
    /// first failure is reported.
    pub(crate) fn release(mut self) -> HvResult<()> {
        let unbound = self.channel.unbind(self.port);
        let closed = self.channel.close();
        unbound.and(closed)
    }
}

impl std::fmt::Debug for NotifyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyEndpoint")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
