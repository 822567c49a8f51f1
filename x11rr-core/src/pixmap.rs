//! Scanout pixmaps shared between a primary screen and its GPU secondaries

use crate::error::{RrError, RrResult};
use crate::resource::{ResourceKind, ResourceRegistry};
use crate::types::{PixmapId, ScreenId};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixmap {
    pub id: PixmapId,
    pub screen: ScreenId,
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    /// Backing pixmap on the primary screen, for a shared handle
    pub primary_pixmap: Option<PixmapId>,
}

/// Manages pixmaps
pub struct PixmapStore {
    pixmaps: HashMap<PixmapId, Pixmap>,
}

impl PixmapStore {
    pub fn new() -> Self {
        Self {
            pixmaps: HashMap::new(),
        }
    }

    pub fn create(
        &mut self,
        registry: &mut ResourceRegistry,
        screen: ScreenId,
        width: u16,
        height: u16,
        depth: u8,
    ) -> RrResult<PixmapId> {
        let id = PixmapId(registry.alloc(ResourceKind::Pixmap, Some(screen))?);
        self.pixmaps.insert(
            id,
            Pixmap {
                id,
                screen,
                width,
                height,
                depth,
                primary_pixmap: None,
            },
        );
        Ok(id)
    }

    /// Handle on `secondary` for a pixmap living on the primary screen
    pub fn share_to_secondary(
        &mut self,
        registry: &mut ResourceRegistry,
        primary_pixmap: PixmapId,
        secondary: ScreenId,
    ) -> RrResult<PixmapId> {
        let (width, height, depth) = match self.pixmaps.get(&primary_pixmap) {
            Some(p) => (p.width, p.height, p.depth),
            None => return Err(RrError::Value(primary_pixmap.0)),
        };
        let id = self.create(registry, secondary, width, height, depth)?;
        if let Some(shared) = self.pixmaps.get_mut(&id) {
            shared.primary_pixmap = Some(primary_pixmap);
        }
        Ok(id)
    }

    pub fn get(&self, id: PixmapId) -> Option<&Pixmap> {
        self.pixmaps.get(&id)
    }

    pub fn free(&mut self, registry: &mut ResourceRegistry, id: PixmapId) -> Option<Pixmap> {
        registry.free(id.0);
        self.pixmaps.remove(&id)
    }

    /// Free a shared handle together with its primary-side pixmap
    pub fn free_shared(&mut self, registry: &mut ResourceRegistry, id: PixmapId) -> Vec<Pixmap> {
        let mut freed = Vec::new();
        if let Some(pixmap) = self.free(registry, id) {
            if let Some(backing) = pixmap.primary_pixmap.and_then(|p| self.free(registry, p)) {
                freed.push(backing);
            }
            freed.insert(0, pixmap);
        }
        freed
    }

    pub fn len(&self) -> usize {
        self.pixmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixmaps.is_empty()
    }
}

impl Default for PixmapStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_pixmap_frees_its_backing() {
        let mut registry = ResourceRegistry::new();
        let mut store = PixmapStore::new();
        let primary = store.create(&mut registry, ScreenId(0), 1920, 1080, 24).unwrap();
        let shared = store.share_to_secondary(&mut registry, primary, ScreenId(1)).unwrap();

        let pixmap = store.get(shared).unwrap();
        assert_eq!(pixmap.screen, ScreenId(1));
        assert_eq!(pixmap.primary_pixmap, Some(primary));
        assert_eq!((pixmap.width, pixmap.height), (1920, 1080));

        let freed = store.free_shared(&mut registry, shared);
        assert_eq!(freed.len(), 2);
        assert!(store.is_empty());
        assert!(!registry.contains(primary.0));
    }
}
