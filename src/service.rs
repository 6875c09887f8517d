use btleplug::api::CharPropFlags;
use uuid::Uuid;

/// A discovered GATT service together with its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub handle: u16,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl Service {
    /// First characteristic with the given UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    /// Handle of the characteristic value.
    pub handle: u16,
    pub properties: CharPropFlags,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

/// Hands out attribute handles in discovery order.
///
/// Used by transports whose stack does not expose the ATT handles of the
/// peripheral. Numbering the same attribute set twice yields the same handles.
#[derive(Debug)]
pub struct HandleAllocator {
    next: u16,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl HandleAllocator {
    pub fn next_handle(&mut self) -> u16 {
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        handle
    }
}
