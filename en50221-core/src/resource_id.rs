use serde::{Deserialize, Serialize};
use std::fmt;

/// EN 50221 resource identifier
///
/// Resource ids are 32-bit identifiers naming a service offered over the
/// Common Interface. The public encoding packs a 16-bit class, a 10-bit type
/// and a 6-bit version:
///
/// ```text
/// ((class & 0xFFFF) << 16) | ((type & 0x3FF) << 6) | (version & 0x3F)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(u32);

impl ResourceId {
    /// Create a resource id from class, type and version fields
    pub const fn new(class: u16, resource_type: u16, version: u8) -> Self {
        Self(
            ((class as u32) << 16)
                | (((resource_type & 0x3FF) as u32) << 6)
                | ((version & 0x3F) as u32),
        )
    }

    /// Create a resource id from its raw 32-bit wire value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw 32-bit wire value
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Get the resource class
    pub const fn class(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Get the resource type
    pub const fn resource_type(&self) -> u16 {
        ((self.0 >> 6) & 0x3FF) as u16
    }

    /// Get the resource version
    pub const fn version(&self) -> u8 {
        (self.0 & 0x3F) as u8
    }
}

impl From<u32> for ResourceId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Resource Manager
pub const RESOURCE_ID_RESOURCE_MANAGER: ResourceId = ResourceId::new(1, 1, 1);

/// Application Information
pub const RESOURCE_ID_APPLICATION_INFORMATION: ResourceId = ResourceId::new(2, 1, 1);

/// Conditional Access Support
pub const RESOURCE_ID_CA_SUPPORT: ResourceId = ResourceId::new(3, 1, 1);

/// DVB Host Control
pub const RESOURCE_ID_DVB_HOST_CONTROL: ResourceId = ResourceId::new(32, 1, 1);

/// Man-Machine Interface
pub const RESOURCE_ID_MMI: ResourceId = ResourceId::new(64, 1, 1);
