use serde::{Deserialize, Serialize};

/// Start of the mocked client-side address range handed out by handle managers.
pub const MOCK_ADDR_BASE: u64 = 0x0000_5555_0000_0000;
/// End (exclusive) of the mocked client-side address range.
pub const MOCK_ADDR_END: u64 = 0x0000_FFFF_FFFF_FFF0;

/// Size recorded for handles whose resource has no meaningful byte size
/// (streams, events, contexts, ...).
pub const HANDLE_DEFAULT_SIZE: u64 = 1 << 4;

/// Kind tag of a device resource shadowed by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
         Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceTypeId {
    Device,
    Context,
    Module,
    Function,
    Var,
    Stream,
    Event,
    Memory,
    BlasContext,
}

impl ResourceTypeId {
    /// All resource kinds, in restore order: a kind always appears after
    /// every kind it may parent on.
    pub const RESTORE_ORDER: [ResourceTypeId; 9] = [
        ResourceTypeId::Device,
        ResourceTypeId::Context,
        ResourceTypeId::Module,
        ResourceTypeId::Function,
        ResourceTypeId::Var,
        ResourceTypeId::Stream,
        ResourceTypeId::Event,
        ResourceTypeId::Memory,
        ResourceTypeId::BlasContext,
    ];

    /// Stable on-disk tag used in serialized handle images.
    pub fn to_tag(self) -> u32 {
        match self {
            ResourceTypeId::Device => 1,
            ResourceTypeId::Context => 2,
            ResourceTypeId::Module => 3,
            ResourceTypeId::Function => 4,
            ResourceTypeId::Var => 5,
            ResourceTypeId::Stream => 6,
            ResourceTypeId::Event => 7,
            ResourceTypeId::Memory => 8,
            ResourceTypeId::BlasContext => 9,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => ResourceTypeId::Device,
            2 => ResourceTypeId::Context,
            3 => ResourceTypeId::Module,
            4 => ResourceTypeId::Function,
            5 => ResourceTypeId::Var,
            6 => ResourceTypeId::Stream,
            7 => ResourceTypeId::Event,
            8 => ResourceTypeId::Memory,
            9 => ResourceTypeId::BlasContext,
            _ => return None,
        })
    }

    /// Passthrough resources share client- and server-side addresses
    /// (hardware-backed memory); everything else gets a mock address.
    pub fn is_passthrough(self) -> bool {
        matches!(self, ResourceTypeId::Memory)
    }

    /// Stateful resources carry replayable bytes behind the handle.
    pub fn is_stateful(self) -> bool {
        matches!(self, ResourceTypeId::Memory | ResourceTypeId::Var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for rt in ResourceTypeId::RESTORE_ORDER {
            assert_eq!(ResourceTypeId::from_tag(rt.to_tag()), Some(rt));
        }
        assert_eq!(ResourceTypeId::from_tag(0), None);
        assert_eq!(ResourceTypeId::from_tag(42), None);
    }

    #[test]
    fn memory_is_passthrough() {
        assert!(ResourceTypeId::Memory.is_passthrough());
        assert!(!ResourceTypeId::Stream.is_passthrough());
        assert!(!ResourceTypeId::Function.is_passthrough());
    }
}
