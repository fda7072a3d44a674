use std::sync::Arc;

use super::{Fault, LoopbackDomain, Shared};
use crate::types::DomainId;
use crate::{DirectoryService, DirectorySession, HvError, HvResult};

fn resolve(domain: DomainId, path: &str) -> HvResult<String> {
    if path.is_empty() || path == "/" || path.ends_with('/') || path.contains("//") {
        return Err(HvError::InvalidPath(path.to_owned()));
    }
    if path.starts_with('/') {
        Ok(path.to_owned())
    } else {
        Ok(format!("{}/{path}", domain.home()))
    }
}

impl DirectoryService for LoopbackDomain {
    fn open(&self) -> HvResult<Box<dyn DirectorySession>> {
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.id)?;
        if world.take_fault(Fault::OpenDirectory) {
            return Err(HvError::provider("directory daemon unreachable"));
        }
        world.sessions += 1;
        Ok(Box::new(LoopbackSession {
            shared: Arc::clone(&self.shared),
            domain: self.id,
        }))
    }
}

struct LoopbackSession {
    shared: Arc<Shared>,
    domain: DomainId,
}

impl LoopbackSession {
    /// Resolves `path` and checks it lies inside the caller's own home.
    fn writable(&self, path: &str) -> HvResult<String> {
        let abs = resolve(self.domain, path)?;
        if !abs.starts_with(&format!("{}/", self.domain.home())) {
            return Err(HvError::PermissionDenied(abs));
        }
        Ok(abs)
    }
}

impl DirectorySession for LoopbackSession {
    fn read(&self, path: &str) -> HvResult<Option<String>> {
        let abs = resolve(self.domain, path)?;
        Ok(self.shared.world.lock().store.get(&abs).cloned())
    }

    fn write(&self, path: &str, value: &str) -> HvResult<()> {
        let abs = self.writable(path)?;
        let mut world = self.shared.world.lock();
        world.ensure_alive(self.domain)?;
        let injected = world.take_fault_matching(
            |fault| matches!(fault, Fault::DirectoryWrite(key) if abs.ends_with(*key)),
        );
        if injected.is_some() {
            return Err(HvError::provider(format!("write to {abs} failed")));
        }
        world.store.insert(abs, value.to_owned());
        Ok(())
    }

    fn remove(&self, path: &str) -> HvResult<()> {
        let abs = self.writable(path)?;
        let mut world = self.shared.world.lock();
        if world.take_fault(Fault::DirectoryRemove) {
            return Err(HvError::provider(format!("remove of {abs} failed")));
        }
        world.remove_subtree(&abs);
        Ok(())
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        let mut world = self.shared.world.lock();
        world.sessions = world.sessions.saturating_sub(1);
    }
}
