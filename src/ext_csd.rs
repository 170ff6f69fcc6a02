//! MMC Extended CSD.

use bitflags::bitflags;

/// Extended CSD block.
pub type ExtCsdData = [u8; 512];

/// Byte offsets, also used as CMD6 indexes.
pub mod index {
    pub const BUS_WIDTH: u8 = 183;
    pub const HS_TIMING: u8 = 185;
    pub const EXT_CSD_REV: usize = 192;
    pub const CSD_STRUCTURE: usize = 194;
    pub const CARD_TYPE: usize = 196;
    pub const DRIVER_STRENGTH: usize = 197;
    pub const SEC_COUNT: usize = 212;
}

/// BUS_WIDTH values.
pub mod bus_width {
    pub const BITS_1: u8 = 0;
    pub const BITS_4: u8 = 1;
    pub const BITS_8: u8 = 2;
    pub const DDR_4: u8 = 5;
    pub const DDR_8: u8 = 6;
}

/// HS_TIMING values.
pub mod hs_timing {
    pub const LEGACY: u8 = 0;
    pub const HIGH_SPEED: u8 = 1;
    pub const HS200: u8 = 2;
}

/// CMD6 access mode writing a byte.
pub const ACCESS_WRITE_BYTE: u8 = 0b11;

bitflags! {
    /// CARD_TYPE, supported timings.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DeviceType: u8 {
        const HS_26         = 1 << 0;
        const HS_52         = 1 << 1;
        const DDR_52_1V8    = 1 << 2;
        const DDR_52_1V2    = 1 << 3;
        const HS200_1V8     = 1 << 4;
        const HS200_1V2     = 1 << 5;
    }
}

/// Extended CSD, read by MMC CMD8.
#[derive(Clone, Copy)]
pub struct ExtCsd(pub ExtCsdData);

impl Default for ExtCsd {
    fn default() -> Self {
        ExtCsd([0; 512])
    }
}

impl core::fmt::Debug for ExtCsd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtCsd")
            .field("rev", &self.revision())
            .field("sec_count", &self.sector_count())
            .field("card_type", &self.device_type())
            .field("bus_width", &self.bus_width())
            .field("hs_timing", &self.hs_timing())
            .finish()
    }
}

impl ExtCsd {
    pub fn revision(&self) -> u8 {
        self.0[index::EXT_CSD_REV]
    }

    pub fn csd_structure(&self) -> u8 {
        self.0[index::CSD_STRUCTURE]
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from_bits_truncate(self.0[index::CARD_TYPE])
    }

    pub fn driver_strength(&self) -> u8 {
        self.0[index::DRIVER_STRENGTH]
    }

    pub fn bus_width(&self) -> u8 {
        self.0[usize::from(index::BUS_WIDTH)]
    }

    pub fn hs_timing(&self) -> u8 {
        self.0[usize::from(index::HS_TIMING)]
    }

    /// Device size in 512-byte sectors, for high density devices.
    pub fn sector_count(&self) -> u32 {
        let at = index::SEC_COUNT;
        u32::from_le_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }
}

/// Argument of MMC CMD6.
pub fn switch_argument(access: u8, index: u8, value: u8, cmd_set: u8) -> u32 {
    u32::from(access & 0b11) << 24
        | u32::from(index) << 16
        | u32::from(value) << 8
        | u32::from(cmd_set & 0b111)
}
