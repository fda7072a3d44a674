use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use vchan::{ChannelNumber, DomainId, ServerConfig, Vchan, WireVersion};
use vchan_hv::loopback::{LoopbackHypervisor, LoopbackStats, ReleaseCall};
use vchan_hv::{DirectoryService, DirectorySession, HvResult};

pub const CHANNEL: ChannelNumber = ChannelNumber(5);

/// Short enough that liveness tests finish quickly.
pub const POLL: Duration = Duration::from_millis(20);

pub struct Domains {
    pub hv: LoopbackHypervisor,
    pub server: DomainId,
    pub client: DomainId,
}

impl Domains {
    pub fn new() -> Self {
        let hv = LoopbackHypervisor::new();
        let server = hv.create_domain();
        let client = hv.create_domain();
        Self { hv, server, client }
    }

    pub fn config(&self, version: WireVersion) -> ServerConfig {
        ServerConfig::new(self.client)
            .with_version(version)
            .with_liveness_poll(POLL)
    }

    pub fn deferred_server(&self, version: WireVersion) -> Result<Vchan> {
        Vchan::server_init(&self.hv.context(self.server), CHANNEL, &self.config(version).deferred())
            .context("deferred server handshake")
    }

    pub fn client(&self) -> Result<Vchan> {
        Vchan::client_init(&self.hv.context(self.client), self.server, CHANNEL)
            .context("client handshake")
    }

    /// Runs a synchronous server on its own thread and connects a client to it.
    pub fn sync_pair(&self, version: WireVersion) -> Result<(Vchan, Vchan)> {
        let ctx = self.hv.context(self.server);
        let config = self.config(version);
        let server = thread::spawn(move || Vchan::server_init(&ctx, CHANNEL, &config));
        let client = connect_when_published(self)?;
        let server = server
            .join()
            .map_err(|_| anyhow::anyhow!("server thread panicked"))?
            .context("sync server handshake")?;
        Ok((server, client))
    }

    pub fn rendezvous_paths(&self) -> Vec<String> {
        self.hv.store_paths(&format!("{}/device/vchan", self.server.home()))
    }

    pub fn releases_by(&self, domain: DomainId) -> Vec<ReleaseCall> {
        self.hv
            .release_log()
            .into_iter()
            .filter(|record| record.domain == domain)
            .map(|record| record.call)
            .collect()
    }
}

fn connect_when_published(domains: &Domains) -> Result<Vchan> {
    for _ in 0..400 {
        match Vchan::client_init(&domains.hv.context(domains.client), domains.server, CHANNEL) {
            Ok(client) => return Ok(client),
            Err(err) if err.is_discovery() => thread::sleep(Duration::from_millis(2)),
            Err(err) => return Err(err).context("client handshake"),
        }
    }
    bail!("server never published")
}

pub fn assert_nothing_held(stats: LoopbackStats) {
    assert_eq!(stats, LoopbackStats::default(), "loopback resources leaked");
}

type Hook = Box<dyn FnOnce() + Send>;

/// Directory wrapper that runs a hook once, right after the first read that
/// finds nothing.
pub struct HookStore {
    inner: Arc<dyn DirectoryService>,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl HookStore {
    pub fn new(inner: Arc<dyn DirectoryService>, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            hook: Arc::new(Mutex::new(Some(Box::new(hook)))),
        }
    }
}

impl DirectoryService for HookStore {
    fn open(&self) -> HvResult<Box<dyn DirectorySession>> {
        Ok(Box::new(HookSession {
            inner: self.inner.open()?,
            hook: Arc::clone(&self.hook),
        }))
    }
}

struct HookSession {
    inner: Box<dyn DirectorySession>,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl DirectorySession for HookSession {
    fn read(&self, path: &str) -> HvResult<Option<String>> {
        let value = self.inner.read(path)?;
        if value.is_none() {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        Ok(value)
    }

    fn write(&self, path: &str, value: &str) -> HvResult<()> {
        self.inner.write(path, value)
    }

    fn remove(&self, path: &str) -> HvResult<()> {
        self.inner.remove(path)
    }
}
