//! Device identification.
//!
//! Boards inject a [`DeviceIdentity`] so the protocol engine can answer
//! `DeviceInfo` and `Handshake` requests without knowing the hardware.

use cockpit_wire::ByteBuf;
use cockpit_wire::message::{DEVICE_ID_LEN, SHORT_MAX};

use crate::flash::{
    BOOTLOADER_REGION_END, BYTECODE_REGION_END, BYTECODE_REGION_START, BYTECODE_TARGET_ADDR,
    FLASH_PAGE_SIZE, FLASH_TOTAL_SIZE, HYPERVISOR_REGION_END,
};

/// Capability bits granted in the handshake response.
pub mod capability {
    /// Device identification (branch A1).
    pub const DEVICE_INFO: u32 = 1 << 0;
    /// Flash readback (branch A2).
    pub const FLASH_READ: u32 = 1 << 1;
    /// Flash programming (branch B).
    pub const FLASH_PROGRAM: u32 = 1 << 2;
    /// Everything this bootloader implements.
    pub const ALL: u32 = DEVICE_INFO | FLASH_READ | FLASH_PROGRAM;
}

/// What a board must provide about itself.
pub trait DeviceIdentity {
    /// Marketing/model name.
    fn model(&self) -> &str;

    /// Bootloader version string.
    fn bootloader_version(&self) -> &str;

    /// Factory-unique device id.
    fn unique_id(&self) -> [u8; DEVICE_ID_LEN];

    /// Hardware revision number.
    fn hardware_revision(&self) -> u8;
}

/// A compile-time identity, enough for tests and reference boards.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    /// Model string.
    pub model: &'static str,
    /// Version string.
    pub version: &'static str,
    /// Unique id bytes.
    pub unique_id: [u8; DEVICE_ID_LEN],
    /// Revision.
    pub revision: u8,
}

impl Default for StaticIdentity {
    fn default() -> Self {
        Self {
            model: "CockpitVM-G431",
            version: "4.5.2",
            unique_id: [0x43, 0x56, 0x4D, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            revision: 1,
        }
    }
}

impl DeviceIdentity for StaticIdentity {
    fn model(&self) -> &str {
        self.model
    }

    fn bootloader_version(&self) -> &str {
        self.version
    }

    fn unique_id(&self) -> [u8; DEVICE_ID_LEN] {
        self.unique_id
    }

    fn hardware_revision(&self) -> u8 {
        self.revision
    }
}

/// Builds the `DeviceInfoResp` payload for `identity`.
#[must_use]
pub fn device_info_response(
    identity: &dyn DeviceIdentity,
    include_device_id: bool,
) -> cockpit_wire::Response {
    cockpit_wire::Response::DeviceInfoResp {
        device_model: ByteBuf::<SHORT_MAX>::from_str_lossy(identity.model()).unwrap_or_default(),
        bootloader_version: ByteBuf::<SHORT_MAX>::from_str_lossy(identity.bootloader_version())
            .unwrap_or_default(),
        flash_total_size: FLASH_TOTAL_SIZE,
        flash_page_size: FLASH_PAGE_SIZE,
        bootloader_region_end: BOOTLOADER_REGION_END,
        hypervisor_region_end: HYPERVISOR_REGION_END,
        bytecode_region_start: BYTECODE_REGION_START,
        bytecode_region_end: BYTECODE_REGION_END,
        unique_device_id: if include_device_id {
            ByteBuf::from_slice(&identity.unique_id()).unwrap_or_default()
        } else {
            ByteBuf::new()
        },
        hardware_revision: identity.hardware_revision(),
    }
}

/// Builds the `HandshakeResp` payload for `identity`.
#[must_use]
pub fn handshake_response(identity: &dyn DeviceIdentity) -> cockpit_wire::Response {
    cockpit_wire::Response::HandshakeResp {
        bootloader_version: ByteBuf::<SHORT_MAX>::from_str_lossy(identity.bootloader_version())
            .unwrap_or_default(),
        supported_capabilities: capability::ALL,
        flash_page_size: FLASH_PAGE_SIZE,
        target_flash_address: BYTECODE_TARGET_ADDR,
    }
}
