//! Interned atoms: property names, property types and monitor names

use crate::types::{Atom, NONE};
use std::collections::HashMap;

pub const XA_ATOM: Atom = 4;
pub const XA_CARDINAL: Atom = 6;
pub const XA_INTEGER: Atom = 19;
pub const XA_STRING: Atom = 31;

/// Output property flipping the output out of the desktop
pub const NON_DESKTOP: &str = "non-desktop";
/// Output property requesting synchronized PRIME flipping
pub const PRIME_SYNC: &str = "PRIME Synchronization";

// Predefined atoms from Xatom.h, in id order starting at 1
const PREDEFINED: [&str; 68] = [
    "PRIMARY",
    "SECONDARY",
    "ARC",
    "ATOM",
    "BITMAP",
    "CARDINAL",
    "COLORMAP",
    "CURSOR",
    "CUT_BUFFER0",
    "CUT_BUFFER1",
    "CUT_BUFFER2",
    "CUT_BUFFER3",
    "CUT_BUFFER4",
    "CUT_BUFFER5",
    "CUT_BUFFER6",
    "CUT_BUFFER7",
    "DRAWABLE",
    "FONT",
    "INTEGER",
    "PIXMAP",
    "POINT",
    "RECTANGLE",
    "RESOURCE_MANAGER",
    "RGB_COLOR_MAP",
    "RGB_BEST_MAP",
    "RGB_BLUE_MAP",
    "RGB_DEFAULT_MAP",
    "RGB_GRAY_MAP",
    "RGB_GREEN_MAP",
    "RGB_RED_MAP",
    "STRING",
    "VISUALID",
    "WINDOW",
    "WM_COMMAND",
    "WM_HINTS",
    "WM_CLIENT_MACHINE",
    "WM_ICON_NAME",
    "WM_ICON_SIZE",
    "WM_NAME",
    "WM_NORMAL_HINTS",
    "WM_SIZE_HINTS",
    "WM_ZOOM_HINTS",
    "MIN_SPACE",
    "NORM_SPACE",
    "MAX_SPACE",
    "END_SPACE",
    "SUPERSCRIPT_X",
    "SUPERSCRIPT_Y",
    "SUBSCRIPT_X",
    "SUBSCRIPT_Y",
    "UNDERLINE_POSITION",
    "UNDERLINE_THICKNESS",
    "STRIKEOUT_ASCENT",
    "STRIKEOUT_DESCENT",
    "ITALIC_ANGLE",
    "X_HEIGHT",
    "QUAD_WIDTH",
    "WEIGHT",
    "POINT_SIZE",
    "RESOLUTION",
    "COPYRIGHT",
    "NOTICE",
    "FONT_NAME",
    "FAMILY_NAME",
    "FULL_NAME",
    "CAP_HEIGHT",
    "WM_CLASS",
    "WM_TRANSIENT_FOR",
];

/// Atom store - atom ids are dense, starting at 1
pub struct AtomStore {
    by_name: HashMap<String, Atom>,
    names: Vec<String>,
}

impl AtomStore {
    pub fn new() -> Self {
        let mut store = Self {
            by_name: HashMap::new(),
            names: Vec::with_capacity(PREDEFINED.len()),
        };
        for name in PREDEFINED {
            store.push(name);
        }
        store
    }

    fn push(&mut self, name: &str) -> Atom {
        self.names.push(name.to_string());
        let id = self.names.len() as Atom;
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Intern an atom; with `only_if_exists` an unknown name yields `None`
    pub fn intern(&mut self, name: &str, only_if_exists: bool) -> Option<Atom> {
        match self.by_name.get(name) {
            Some(&id) => Some(id),
            None if only_if_exists => None,
            None => Some(self.push(name)),
        }
    }

    /// Intern, creating the atom if needed
    pub fn make(&mut self, name: &str) -> Atom {
        self.intern(name, false).unwrap_or(NONE)
    }

    pub fn get_name(&self, id: Atom) -> Option<&str> {
        let index = (id as usize).checked_sub(1)?;
        self.names.get(index).map(|s| s.as_str())
    }

    pub fn get_id(&self, name: &str) -> Option<Atom> {
        self.by_name.get(name).copied()
    }

    pub fn is_valid(&self, id: Atom) -> bool {
        self.get_name(id).is_some()
    }
}

impl Default for AtomStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_atoms_keep_their_ids() {
        let atoms = AtomStore::new();
        assert_eq!(atoms.get_id("INTEGER"), Some(XA_INTEGER));
        assert_eq!(atoms.get_id("STRING"), Some(XA_STRING));
        assert_eq!(atoms.get_name(68), Some("WM_TRANSIENT_FOR"));
        assert_eq!(atoms.get_name(0), None);
    }

    #[test]
    fn test_intern_only_if_exists() {
        let mut atoms = AtomStore::new();
        assert_eq!(atoms.intern(NON_DESKTOP, true), None);
        let id = atoms.make(NON_DESKTOP);
        assert_eq!(id, 69);
        assert_eq!(atoms.intern(NON_DESKTOP, true), Some(id));
        assert_eq!(atoms.get_name(id), Some(NON_DESKTOP));
    }
}
