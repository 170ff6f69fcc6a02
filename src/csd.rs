use crate::consts::BLOCK_SIZE_U64;

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Card Specific Data block.
pub type CsdData = [u8; 16];

/// TRAN_SPEED rate units, in 10 kbit/s steps.
pub const TRAN_SPEED_UNITS: [u32; 8] = [10, 100, 1_000, 10_000, 0, 0, 0, 0];

/// TRAN_SPEED time values (x10) for SD cards.
pub const SD_TRAN_SPEED_MULTIPLIERS: [u32; 16] =
    [0, 10, 12, 13, 15, 20, 26, 30, 35, 40, 45, 50, 55, 60, 70, 80];

/// TRAN_SPEED time values (x10) for MMC devices.
pub const MMC_TRAN_SPEED_MULTIPLIERS: [u32; 16] =
    [0, 10, 12, 13, 15, 20, 26, 30, 35, 40, 45, 52, 55, 60, 70, 80];

/// Decodes a TRAN_SPEED byte into kHz.
///
/// Bits 2:0 index `units`, bits 6:3 index `multipliers`. Reserved unit codes
/// (4..=7) and the reserved multiplier 0 decode to 0.
pub fn decode_tran_speed(code: u8, units: &[u32; 8], multipliers: &[u32; 16]) -> u32 {
    let unit = usize::from(code & 0x7);
    let mult = usize::from((code >> 3) & 0xF);
    if unit >= 4 || mult == 0 {
        return 0;
    }
    units[unit] * multipliers[mult]
}

bitfield! {
    /// Card Specific Data, version 1.
    #[derive(Clone, Copy)]
    pub struct CsdV1(u128);
    pub u8, version, _: 127, 126;
    pub u8, data_read_access_time1, _: 119, 112;
    pub u8, data_read_access_time2, _: 111, 104;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub read_partial_blocks, _: 79;
    pub write_block_misalignment, _: 78;
    pub read_block_misalignment, _: 77;
    pub dsr_implemented, _: 76;
    pub u16, device_size, _: 73, 62;
    pub u8, max_read_current_vdd_min, _: 61, 59;
    pub u8, max_read_current_vdd_max, _: 58, 56;
    pub u8, max_write_current_vdd_min, _: 55, 53;
    pub u8, max_write_current_vdd_max, _: 52, 50;
    pub u8, device_size_multiplier, _: 49, 47;
    pub erase_single_block_enabled, _: 46;
    pub u8, erase_sector_size, _: 45, 39;
    pub u8, write_protect_group_size, _: 38, 32;
    pub write_protect_group_enable, _: 31;
    pub u8, write_speed_factor, _: 28, 26;
    pub u8, max_write_data_length, _: 25, 22;
    pub write_partial_blocks_allowed, _: 21;
    pub file_format_group, _: 15;
    pub copy_flag, _: 14;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, file_format, _: 11, 10;
    pub u8, crc, _: 7, 1;
}

bitfield! {
    /// Card Specific Data, version 2 (high capacity).
    #[derive(Clone, Copy)]
    pub struct CsdV2(u128);
    pub u8, version, _: 127, 126;
    pub u8, data_read_access_time1, _: 119, 112;
    pub u8, data_read_access_time2, _: 111, 104;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub read_partial_blocks, _: 79;
    pub write_block_misalignment, _: 78;
    pub read_block_misalignment, _: 77;
    pub dsr_implemented, _: 76;
    pub u32, device_size, _: 69, 48;
    pub erase_single_block_enabled, _: 46;
    pub u8, erase_sector_size, _: 45, 39;
    pub u8, write_protect_group_size, _: 38, 32;
    pub write_protect_group_enable, _: 31;
    pub u8, write_speed_factor, _: 28, 26;
    pub u8, max_write_data_length, _: 25, 22;
    pub write_partial_blocks_allowed, _: 21;
    pub file_format_group, _: 15;
    pub copy_flag, _: 14;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, file_format, _: 11, 10;
    pub u8, crc, _: 7, 1;
}

bitfield! {
    /// MMC Card Specific Data.
    #[derive(Clone, Copy)]
    pub struct MmcCsd(u128);
    pub u8, version, _: 127, 126;
    pub u8, spec_version, _: 125, 122;
    pub u8, data_read_access_time1, _: 119, 112;
    pub u8, data_read_access_time2, _: 111, 104;
    pub u8, max_data_transfer_rate, _: 103, 96;
    pub u16, card_command_classes, _: 95, 84;
    pub u8, read_block_length, _: 83, 80;
    pub read_partial_blocks, _: 79;
    pub u16, device_size, _: 73, 62;
    pub u8, device_size_multiplier, _: 49, 47;
    pub u8, erase_group_size, _: 46, 42;
    pub u8, erase_group_multiplier, _: 41, 37;
    pub write_protect_group_enable, _: 31;
    pub u8, write_speed_factor, _: 28, 26;
    pub u8, max_write_data_length, _: 25, 22;
    pub copy_flag, _: 14;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

/// Card Specific Data, generic container.
#[derive(Clone, Copy)]
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
    Mmc(MmcCsd),
}

/// Represents capacity provider.
pub trait CapacityProvider {
    /// Returns the card capacity in bytes.
    fn card_capacity(&self) -> Size;

    /// Returns the card capacity in 512-byte blocks.
    fn card_capacity_blocks(&self) -> u64;
}

impl From<CsdData> for CsdV1 {
    fn from(csd_data: CsdData) -> Self {
        CsdV1(u128::from_be_bytes(csd_data))
    }
}

impl From<CsdData> for CsdV2 {
    fn from(csd_data: CsdData) -> Self {
        CsdV2(u128::from_be_bytes(csd_data))
    }
}

impl From<CsdData> for MmcCsd {
    fn from(csd_data: CsdData) -> Self {
        MmcCsd(u128::from_be_bytes(csd_data))
    }
}

/// Byte count of a (C_SIZE, C_SIZE_MULT, READ_BL_LEN) geometry.
fn legacy_capacity_bytes(c_size: u16, mult: u8, read_bl_len: u8) -> u64 {
    let blocks = (u64::from(c_size) + 1) << (u32::from(mult) + 2);
    blocks << u32::from(read_bl_len)
}

impl CsdV1 {
    /// Native block count, `(C_SIZE + 1) * 2^(C_SIZE_MULT + 2)`.
    pub fn native_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) << (u32::from(self.device_size_multiplier()) + 2)
    }

    /// Native block length in bytes.
    pub fn native_block_len(&self) -> u64 {
        1 << u32::from(self.read_block_length())
    }
}

impl CapacityProvider for CsdV1 {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(legacy_capacity_bytes(
            self.device_size(),
            self.device_size_multiplier(),
            self.read_block_length(),
        ))
    }

    fn card_capacity_blocks(&self) -> u64 {
        self.native_blocks() * self.native_block_len() / BLOCK_SIZE_U64
    }
}

impl CapacityProvider for CsdV2 {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE_U64)
    }

    fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * (KiB as u64)
    }
}

impl CapacityProvider for MmcCsd {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(legacy_capacity_bytes(
            self.device_size(),
            self.device_size_multiplier(),
            self.read_block_length(),
        ))
    }

    fn card_capacity_blocks(&self) -> u64 {
        legacy_capacity_bytes(
            self.device_size(),
            self.device_size_multiplier(),
            self.read_block_length(),
        ) / BLOCK_SIZE_U64
    }
}

impl Csd {
    /// Interprets `data` as an SD CSD, picking the layout from CSD_STRUCTURE.
    pub fn sd(data: CsdData) -> Self {
        let v1 = CsdV1::from(data);
        match v1.version() {
            0 => Csd::V1(v1),
            _ => Csd::V2(CsdV2::from(data)),
        }
    }

    /// Interprets `data` as an MMC CSD.
    pub fn mmc(data: CsdData) -> Self {
        Csd::Mmc(MmcCsd::from(data))
    }

    /// CSD_STRUCTURE field.
    pub fn structure(&self) -> u8 {
        match self {
            Csd::V1(csd) => csd.version(),
            Csd::V2(csd) => csd.version(),
            Csd::Mmc(csd) => csd.version(),
        }
    }

    /// Supported command classes bitmap.
    pub fn command_classes(&self) -> u16 {
        match self {
            Csd::V1(csd) => csd.card_command_classes(),
            Csd::V2(csd) => csd.card_command_classes(),
            Csd::Mmc(csd) => csd.card_command_classes(),
        }
    }

    /// Whether the card implements class 10, the switch function class.
    pub fn supports_switch(&self) -> bool {
        self.command_classes() & (1 << 10) != 0
    }

    /// Maximum data transfer rate for the default timing, in Hz.
    pub fn tran_speed_hz(&self) -> u32 {
        let (code, multipliers) = match self {
            Csd::V1(csd) => (csd.max_data_transfer_rate(), &SD_TRAN_SPEED_MULTIPLIERS),
            Csd::V2(csd) => (csd.max_data_transfer_rate(), &SD_TRAN_SPEED_MULTIPLIERS),
            Csd::Mmc(csd) => (csd.max_data_transfer_rate(), &MMC_TRAN_SPEED_MULTIPLIERS),
        };
        decode_tran_speed(code, &TRAN_SPEED_UNITS, multipliers) * 1000
    }

    /// Whether the write protection switches of the card are on.
    pub fn write_protected(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
            Csd::V2(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
            Csd::Mmc(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
        }
    }
}

impl CapacityProvider for Csd {
    fn card_capacity(&self) -> Size {
        match self {
            Csd::V1(csd) => csd.card_capacity(),
            Csd::V2(csd) => csd.card_capacity(),
            Csd::Mmc(csd) => csd.card_capacity(),
        }
    }

    fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
            Csd::Mmc(csd) => csd.card_capacity_blocks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tran_speed_sd_default_speed() {
        assert_eq!(
            decode_tran_speed(0x32, &TRAN_SPEED_UNITS, &SD_TRAN_SPEED_MULTIPLIERS) * 1000,
            26_000_000
        );
    }

    #[test]
    fn tran_speed_reserved_codes() {
        for unit in 4..8u8 {
            let code = (6 << 3) | unit;
            assert_eq!(
                decode_tran_speed(code, &TRAN_SPEED_UNITS, &SD_TRAN_SPEED_MULTIPLIERS),
                0
            );
        }
        assert_eq!(
            decode_tran_speed(0x02, &TRAN_SPEED_UNITS, &SD_TRAN_SPEED_MULTIPLIERS),
            0
        );
        let first = decode_tran_speed(0x5A, &TRAN_SPEED_UNITS, &MMC_TRAN_SPEED_MULTIPLIERS);
        let second = decode_tran_speed(0x5A, &TRAN_SPEED_UNITS, &MMC_TRAN_SPEED_MULTIPLIERS);
        assert_eq!(first, 52_000);
        assert_eq!(first, second);
    }

    #[test]
    fn csd_v1_minimal_geometry() {
        // C_SIZE = 0, C_SIZE_MULT = 0, READ_BL_LEN = 9
        let raw: u128 = (0x32 << 96) | (9 << 80);
        let csd = Csd::sd(raw.to_be_bytes());
        assert!(matches!(csd, Csd::V1(_)));
        if let Csd::V1(v1) = csd {
            assert_eq!(v1.native_blocks(), 4);
            assert_eq!(v1.native_block_len(), 512);
        }
        assert_eq!(csd.card_capacity_blocks(), 4);
        assert_eq!(csd.card_capacity().bytes(), 2048);
        assert_eq!(csd.tran_speed_hz(), 26_000_000);
    }

    #[test]
    fn csd_v2_capacity() {
        // 8 GiB card: C_SIZE = 15159
        let raw: u128 = (1 << 126) | (0x5B << 80) | (15159 << 48);
        let csd = Csd::sd(raw.to_be_bytes());
        assert!(matches!(csd, Csd::V2(_)));
        assert_eq!(csd.card_capacity_blocks(), 15160 * 1024);
        assert_eq!(csd.card_capacity().bytes(), 15160 * 512 * 1024);
    }

    #[test]
    fn command_classes() {
        let raw: u128 = (0x5B5u128 << 84) | (1 << 126);
        let csd = Csd::sd(raw.to_be_bytes());
        assert!(csd.supports_switch());
        let raw: u128 = 0x1F5u128 << 84;
        assert!(!Csd::sd(raw.to_be_bytes()).supports_switch());
    }
}
