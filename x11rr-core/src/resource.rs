//! Typed XID registry
//!
//! Server-side objects get ids from the server's own range; leases use ids
//! chosen by the client, validated here.

use crate::error::{RrError, RrResult};
use crate::types::{ScreenId, Xid};
use std::collections::HashMap;

/// Server-owned ids live below the first client range
const SERVER_ID_BASE: Xid = 0x0000_0040;
const SERVER_ID_MAX: Xid = 0x001f_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Window,
    Crtc,
    Output,
    Mode,
    Provider,
    Lease,
    Pixmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub screen: Option<ScreenId>,
}

pub struct ResourceRegistry {
    resources: HashMap<Xid, Resource>,
    next_id: Xid,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            next_id: SERVER_ID_BASE,
        }
    }

    /// Allocate a fresh server-side id
    pub fn alloc(&mut self, kind: ResourceKind, screen: Option<ScreenId>) -> RrResult<Xid> {
        while self.resources.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        if self.next_id > SERVER_ID_MAX {
            return Err(RrError::Alloc);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.resources.insert(id, Resource { kind, screen });
        Ok(id)
    }

    /// Register an id chosen by a client
    pub fn add(&mut self, id: Xid, kind: ResourceKind, screen: Option<ScreenId>) -> RrResult<()> {
        if id == 0 || self.resources.contains_key(&id) {
            return Err(RrError::IdChoice(id));
        }
        self.resources.insert(id, Resource { kind, screen });
        Ok(())
    }

    pub fn free(&mut self, id: Xid) -> Option<Resource> {
        self.resources.remove(&id)
    }

    pub fn get(&self, id: Xid) -> Option<Resource> {
        self.resources.get(&id).copied()
    }

    pub fn contains(&self, id: Xid) -> bool {
        self.resources.contains_key(&id)
    }

    /// Resolve an id of the given kind, with the kind's own error
    pub fn lookup(&self, id: Xid, kind: ResourceKind) -> RrResult<Option<ScreenId>> {
        match self.resources.get(&id) {
            Some(res) if res.kind == kind => Ok(res.screen),
            _ => Err(Self::missing(id, kind)),
        }
    }

    fn missing(id: Xid, kind: ResourceKind) -> RrError {
        match kind {
            ResourceKind::Window => RrError::Window(id),
            ResourceKind::Crtc => RrError::Crtc(id),
            ResourceKind::Output => RrError::Output(id),
            ResourceKind::Mode => RrError::Mode(id),
            ResourceKind::Provider => RrError::Provider(id),
            ResourceKind::Lease => RrError::Lease(id),
            ResourceKind::Pixmap => RrError::Value(id),
        }
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_reports_kind_specific_error() {
        let mut registry = ResourceRegistry::new();
        let crtc = registry.alloc(ResourceKind::Crtc, Some(ScreenId(0))).unwrap();
        assert_eq!(registry.lookup(crtc, ResourceKind::Crtc), Ok(Some(ScreenId(0))));
        assert_eq!(registry.lookup(crtc, ResourceKind::Output), Err(RrError::Output(crtc)));
        assert_eq!(registry.lookup(0x1234, ResourceKind::Lease), Err(RrError::Lease(0x1234)));
    }

    #[test]
    fn test_client_ids_must_be_unused() {
        let mut registry = ResourceRegistry::new();
        registry.add(0x0040_0001, ResourceKind::Lease, None).unwrap();
        assert_eq!(
            registry.add(0x0040_0001, ResourceKind::Lease, None),
            Err(RrError::IdChoice(0x0040_0001))
        );
        registry.free(0x0040_0001);
        assert!(registry.add(0x0040_0001, ResourceKind::Lease, None).is_ok());
    }

    #[test]
    fn test_alloc_skips_taken_ids() {
        let mut registry = ResourceRegistry::new();
        registry.add(SERVER_ID_BASE, ResourceKind::Window, None).unwrap();
        let id = registry.alloc(ResourceKind::Mode, None).unwrap();
        assert_eq!(id, SERVER_ID_BASE + 1);
    }
}
