use std::sync::atomic::{AtomicU8, Ordering};

const MODIFIED: u8 = 1 << 0;
const DELETED: u8 = 1 << 1;
const PERSISTENCE_ENABLED: u8 = 1 << 2;

/// Lock-free state bits attached to every cached entity.
///
/// Flags live in memory only; a reloaded entity starts unmodified.
#[derive(Debug)]
pub struct EntityFlags {
    bits: AtomicU8,
}

impl EntityFlags {
    pub fn new(persistence_enabled: bool) -> Self {
        let bits = if persistence_enabled {
            PERSISTENCE_ENABLED
        } else {
            0
        };
        Self {
            bits: AtomicU8::new(bits),
        }
    }

    pub fn is_modified(&self) -> bool {
        self.get(MODIFIED)
    }

    pub fn set_modified(&self, modified: bool) {
        self.set(MODIFIED, modified);
    }

    pub fn is_deleted(&self) -> bool {
        self.get(DELETED)
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.set(DELETED, deleted);
    }

    pub fn persistence_enabled(&self) -> bool {
        self.get(PERSISTENCE_ENABLED)
    }

    pub fn set_persistence_enabled(&self, enabled: bool) {
        self.set(PERSISTENCE_ENABLED, enabled);
    }

    /// Clears `modified` and reports whether it was set.
    ///
    /// Write-back clears the flag before serializing, so a mutation racing with the
    /// write marks the entity dirty again instead of being lost.
    pub(crate) fn take_modified(&self) -> bool {
        self.bits.fetch_and(!MODIFIED, Ordering::AcqRel) & MODIFIED != 0
    }

    fn get(&self, bit: u8) -> bool {
        self.bits.load(Ordering::Acquire) & bit != 0
    }

    fn set(&self, bit: u8, value: bool) {
        if value {
            self.bits.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!bit, Ordering::AcqRel);
        }
    }
}

impl Default for EntityFlags {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let flags = EntityFlags::default();
        assert!(flags.persistence_enabled());
        assert!(!flags.is_modified());

        flags.set_modified(true);
        flags.set_deleted(true);
        flags.set_persistence_enabled(false);
        assert!(flags.is_modified());
        assert!(flags.is_deleted());
        assert!(!flags.persistence_enabled());

        flags.set_deleted(false);
        assert!(flags.is_modified());
        assert!(!flags.is_deleted());
    }

    #[test]
    fn test_take_modified() {
        let flags = EntityFlags::new(false);
        assert!(!flags.take_modified());
        flags.set_modified(true);
        assert!(flags.take_modified());
        assert!(!flags.is_modified());
    }
}
