//! SD Host Controller register model.
//!
//! Offsets and bit layouts follow the SD Host Controller Simplified
//! Specification. Platform specifics (bus addresses, data cache, output
//! calibration, eMMC reset line) are reached through [`SdhcRegisters`].

use bitfield::bitfield;
use bitflags::bitflags;

/// Register offsets.
pub mod offset {
    /// SDMA System Address / Argument 2.
    pub const ARGUMENT2: u16 = 0x00;
    /// Block Size.
    pub const BLOCK_SIZE: u16 = 0x04;
    /// Block Count.
    pub const BLOCK_COUNT: u16 = 0x06;
    /// Argument 1.
    pub const ARGUMENT: u16 = 0x08;
    /// Transfer Mode.
    pub const TRANSFER_MODE: u16 = 0x0C;
    /// Command.
    pub const COMMAND: u16 = 0x0E;
    /// Response words, 0x10 through 0x1C.
    pub const RESPONSE: u16 = 0x10;
    /// Buffer Data Port.
    pub const BUFFER: u16 = 0x20;
    /// Present State.
    pub const PRESENT_STATE: u16 = 0x24;
    /// Host Control 1.
    pub const HOST_CONTROL1: u16 = 0x28;
    /// Power Control.
    pub const POWER_CONTROL: u16 = 0x29;
    /// Clock Control.
    pub const CLOCK_CONTROL: u16 = 0x2C;
    /// Timeout Control.
    pub const TIMEOUT_CONTROL: u16 = 0x2E;
    /// Software Reset.
    pub const SOFTWARE_RESET: u16 = 0x2F;
    /// Normal and Error Interrupt Status.
    pub const INT_STATUS: u16 = 0x30;
    /// Normal and Error Interrupt Status Enable.
    pub const INT_ENABLE: u16 = 0x34;
    /// Normal and Error Interrupt Signal Enable.
    pub const SIGNAL_ENABLE: u16 = 0x38;
    /// Auto CMD Error Status.
    pub const AUTO_CMD_ERROR: u16 = 0x3C;
    /// Host Control 2.
    pub const HOST_CONTROL2: u16 = 0x3E;
    /// Capabilities, lower word.
    pub const CAPABILITIES: u16 = 0x40;
    /// Capabilities, upper word.
    pub const CAPABILITIES1: u16 = 0x44;
    /// ADMA Error Status.
    pub const ADMA_ERROR: u16 = 0x54;
    /// ADMA System Address.
    pub const ADMA_ADDRESS: u16 = 0x58;
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TransferMode: u16 {
        const DMA_ENABLE            = 1 << 0;
        const BLOCK_COUNT_ENABLE    = 1 << 1;
        const AUTO_CMD12            = 1 << 2;
        const AUTO_CMD23            = 1 << 3;
        const READ                  = 1 << 4;
        const MULTI_BLOCK           = 1 << 5;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CommandFlags: u16 {
        const RESP_136              = 0b01;
        const RESP_48               = 0b10;
        const RESP_48_BUSY          = 0b11;
        const RESP_MASK             = 0b11;
        const CRC_CHECK             = 1 << 3;
        const INDEX_CHECK           = 1 << 4;
        const DATA_PRESENT          = 1 << 5;
        const TYPE_ABORT            = 0b11 << 6;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PresentState: u32 {
        const CMD_INHIBIT           = 1 << 0;
        const DAT_INHIBIT           = 1 << 1;
        const DAT_ACTIVE            = 1 << 2;
        const WRITE_ACTIVE          = 1 << 8;
        const READ_ACTIVE           = 1 << 9;
        const BUFFER_WRITE_ENABLE   = 1 << 10;
        const BUFFER_READ_ENABLE    = 1 << 11;
        const CARD_INSERTED         = 1 << 16;
        const CARD_STABLE           = 1 << 17;
        const CARD_DETECT_LEVEL     = 1 << 18;
        const WRITE_ENABLED         = 1 << 19;
        const DAT_LEVEL             = 0xF << 20;
        const CMD_LEVEL             = 1 << 24;
        const LINE_LEVELS           = Self::DAT_LEVEL.bits() | Self::CMD_LEVEL.bits();
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct HostControl1: u8 {
        const LED                   = 1 << 0;
        const DATA_WIDTH_4          = 1 << 1;
        const HIGH_SPEED            = 1 << 2;
        const DMA_ADMA32            = 0b10 << 3;
        const DMA_MASK              = 0b11 << 3;
        const DATA_WIDTH_8          = 1 << 5;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PowerControl: u8 {
        const BUS_POWER             = 1 << 0;
        const VOLTAGE_1_8           = 0b101 << 1;
        const VOLTAGE_3_0           = 0b110 << 1;
        const VOLTAGE_3_3           = 0b111 << 1;
        const VOLTAGE_MASK          = 0b111 << 1;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ClockControl: u16 {
        const INTERNAL_ENABLE       = 1 << 0;
        const INTERNAL_STABLE       = 1 << 1;
        const SD_CLOCK_ENABLE       = 1 << 2;
        const PROGRAMMABLE          = 1 << 5;
        const DIVIDER_HI            = 0b11 << 6;
        const DIVIDER_LO            = 0xFF << 8;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SoftwareReset: u8 {
        const ALL                   = 1 << 0;
        const CMD                   = 1 << 1;
        const DATA                  = 1 << 2;
    }

    /// Normal interrupt bits in the lower half, error interrupt bits in the upper half.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        const CMD_COMPLETE          = 1 << 0;
        const TRANSFER_COMPLETE     = 1 << 1;
        const BLOCK_GAP             = 1 << 2;
        const DMA                   = 1 << 3;
        const BUFFER_WRITE_READY    = 1 << 4;
        const BUFFER_READ_READY     = 1 << 5;
        const CARD_INSERTION        = 1 << 6;
        const CARD_REMOVAL          = 1 << 7;
        const CARD_INTERRUPT        = 1 << 8;
        const RETUNING              = 1 << 12;
        const ERROR                 = 1 << 15;

        const CMD_TIMEOUT           = 1 << 16;
        const CMD_CRC               = 1 << 17;
        const CMD_END_BIT           = 1 << 18;
        const CMD_INDEX             = 1 << 19;
        const DATA_TIMEOUT          = 1 << 20;
        const DATA_CRC              = 1 << 21;
        const DATA_END_BIT          = 1 << 22;
        const CURRENT_LIMIT         = 1 << 23;
        const AUTO_CMD              = 1 << 24;
        const ADMA                  = 1 << 25;
        const TUNING                = 1 << 26;
        const BOOT_ACK              = 1 << 28;

        const NORMAL_MASK = 0x0000_FFFF;
        const ERROR_MASK = 0xFFFF_0000;

        const CMD_ERRORS = Self::CMD_TIMEOUT.bits()
            | Self::CMD_CRC.bits()
            | Self::CMD_END_BIT.bits()
            | Self::CMD_INDEX.bits();
        const DATA_ERRORS = Self::DATA_TIMEOUT.bits()
            | Self::DATA_CRC.bits()
            | Self::DATA_END_BIT.bits()
            | Self::ADMA.bits();
        const ALL_ERRORS = Self::CMD_ERRORS.bits()
            | Self::DATA_ERRORS.bits()
            | Self::CURRENT_LIMIT.bits()
            | Self::AUTO_CMD.bits()
            | Self::TUNING.bits()
            | Self::BOOT_ACK.bits();
        const TRANSFER_EVENTS = Self::CMD_COMPLETE.bits()
            | Self::TRANSFER_COMPLETE.bits()
            | Self::BUFFER_WRITE_READY.bits()
            | Self::BUFFER_READ_READY.bits();
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AutoCmdError: u16 {
        const NOT_EXECUTED          = 1 << 0;
        const TIMEOUT               = 1 << 1;
        const CRC                   = 1 << 2;
        const END_BIT               = 1 << 3;
        const INDEX                 = 1 << 4;
        const NOT_ISSUED            = 1 << 7;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct HostControl2: u16 {
        const UHS_SDR12             = 0b000;
        const UHS_SDR25             = 0b001;
        const UHS_SDR50             = 0b010;
        const UHS_SDR104            = 0b011;
        const UHS_DDR50             = 0b100;
        const UHS_MASK              = 0b111;
        const SIGNALING_1_8         = 1 << 3;
        const DRIVER_TYPE_A         = 0b01 << 4;
        const DRIVER_TYPE_C         = 0b10 << 4;
        const DRIVER_TYPE_D         = 0b11 << 4;
        const DRIVER_TYPE_MASK      = 0b11 << 4;
        const EXECUTE_TUNING        = 1 << 6;
        const SAMPLING_CLOCK_SELECT = 1 << 7;
        const PRESET_ENABLE         = 1 << 15;
    }
}

impl ClockControl {
    /// Encodes a 10-bit divider field.
    pub fn with_divider(divider: u16) -> Self {
        Self::from_bits_retain(((divider & 0xFF) << 8) | (((divider >> 8) & 0b11) << 6))
    }

    /// Decodes the 10-bit divider field.
    pub fn divider(&self) -> u16 {
        (self.bits() >> 8) | (((self.bits() >> 6) & 0b11) << 8)
    }
}

impl PresentState {
    /// Whether CMD and DAT[3:0] are all driven high.
    pub fn lines_high(&self) -> bool {
        self.contains(Self::LINE_LEVELS)
    }

    /// Whether any of CMD and DAT[3:0] is driven high.
    pub fn any_line_high(&self) -> bool {
        self.intersects(Self::LINE_LEVELS)
    }
}

bitfield! {
    /// Capabilities registers, both words.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Capabilities(u64);
    impl Debug;
    pub u8, timeout_clock, _: 5, 0;
    pub u8, base_clock_mhz, _: 15, 8;
    pub u8, max_block_length, _: 17, 16;
    pub bus_8bit, _: 18;
    pub adma2, _: 19;
    pub high_speed, _: 21;
    pub sdma, _: 22;
    pub v33, _: 24;
    pub v30, _: 25;
    pub v18, _: 26;
    pub u8, slot_type, _: 31, 30;
    pub sdr50, _: 32;
    pub sdr104, _: 33;
    pub ddr50, _: 34;
    pub driver_type_a, _: 36;
    pub driver_type_c, _: 37;
    pub driver_type_d, _: 38;
    pub tuning_for_sdr50, _: 45;
    pub u8, clock_multiplier, _: 55, 48;
}

impl Capabilities {
    /// Slot type value of an embedded device.
    pub const SLOT_EMBEDDED: u8 = 0b01;

    /// Assembles both capability words.
    pub fn from_words(caps0: u32, caps1: u32) -> Self {
        Capabilities(u64::from(caps1) << 32 | u64::from(caps0))
    }

    /// Whether the slot only supports 1.8V signaling.
    pub fn low_signaling_only(&self) -> bool {
        self.v18() && !self.v30() && !self.v33()
    }

    /// Whether any UHS-I timing mode is advertised.
    pub fn any_uhs(&self) -> bool {
        self.sdr50() || self.sdr104() || self.ddr50()
    }

    /// Whether the device is soldered to the board.
    pub fn embedded_slot(&self) -> bool {
        self.slot_type() == Self::SLOT_EMBEDDED
    }

    /// Largest block the controller buffer accepts.
    pub fn max_block_size(&self) -> u16 {
        match self.max_block_length() {
            len @ 0..=2 => 512 << len,
            _ => 512,
        }
    }
}

/// Register access to one SD Host Controller slot.
///
/// All accesses take `&mut self`: reading the buffer data port or
/// write-one-to-clear status registers has side effects.
pub trait SdhcRegisters {
    fn read_u8(&mut self, offset: u16) -> u8;
    fn read_u16(&mut self, offset: u16) -> u16;
    fn read_u32(&mut self, offset: u16) -> u32;
    fn write_u8(&mut self, offset: u16, value: u8);
    fn write_u16(&mut self, offset: u16, value: u16);
    fn write_u32(&mut self, offset: u16, value: u32);

    /// Returns the address the controller uses to reach `ptr`, if it can.
    fn dma_address(&self, ptr: *const u8) -> Option<u32> {
        u32::try_from(ptr as usize).ok()
    }

    /// Data cache line size, in bytes.
    fn cache_line_size(&self) -> usize {
        32
    }

    /// Writes dirty cache lines covering the region back to memory.
    fn clean_dcache(&mut self, _addr: usize, _len: usize) {}

    /// Discards cache lines covering the region.
    fn invalidate_dcache(&mut self, _addr: usize, _len: usize) {}

    /// Writes back then discards cache lines covering the region.
    fn clean_invalidate_dcache(&mut self, addr: usize, len: usize) {
        self.clean_dcache(addr, len);
        self.invalidate_dcache(addr, len);
    }

    /// Runs the output impedance calibration of the I/O pads.
    fn calibrate_output(&mut self, _low_signaling: bool) {}

    /// Drives the eMMC RST_n line.
    fn set_hw_reset(&mut self, _asserted: bool) {}

    /// Switches the CMD line driver between open-drain and push-pull.
    fn set_open_drain(&mut self, _enabled: bool) {}

    /// Restores vendor-specific settings after a full software reset.
    fn restore_after_reset(&mut self) {}
}

impl<T: SdhcRegisters + ?Sized> SdhcRegisters for &mut T {
    fn read_u8(&mut self, offset: u16) -> u8 {
        (**self).read_u8(offset)
    }

    fn read_u16(&mut self, offset: u16) -> u16 {
        (**self).read_u16(offset)
    }

    fn read_u32(&mut self, offset: u16) -> u32 {
        (**self).read_u32(offset)
    }

    fn write_u8(&mut self, offset: u16, value: u8) {
        (**self).write_u8(offset, value)
    }

    fn write_u16(&mut self, offset: u16, value: u16) {
        (**self).write_u16(offset, value)
    }

    fn write_u32(&mut self, offset: u16, value: u32) {
        (**self).write_u32(offset, value)
    }

    fn dma_address(&self, ptr: *const u8) -> Option<u32> {
        (**self).dma_address(ptr)
    }

    fn cache_line_size(&self) -> usize {
        (**self).cache_line_size()
    }

    fn clean_dcache(&mut self, addr: usize, len: usize) {
        (**self).clean_dcache(addr, len)
    }

    fn invalidate_dcache(&mut self, addr: usize, len: usize) {
        (**self).invalidate_dcache(addr, len)
    }

    fn clean_invalidate_dcache(&mut self, addr: usize, len: usize) {
        (**self).clean_invalidate_dcache(addr, len)
    }

    fn calibrate_output(&mut self, low_signaling: bool) {
        (**self).calibrate_output(low_signaling)
    }

    fn set_hw_reset(&mut self, asserted: bool) {
        (**self).set_hw_reset(asserted)
    }

    fn set_open_drain(&mut self, enabled: bool) {
        (**self).set_open_drain(enabled)
    }

    fn restore_after_reset(&mut self) {
        (**self).restore_after_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_divider_round_trip() {
        let ccr = ClockControl::with_divider(0x2FA);
        assert_eq!(ccr.divider(), 0x2FA);
        assert_eq!(ccr.bits() & 0x3F, 0);
    }

    #[test]
    fn capabilities_fields() {
        let caps = Capabilities::from_words(
            (100 << 8) | (1 << 16) | (1 << 19) | (1 << 21) | (1 << 24) | (1 << 26),
            (1 << 0) | (1 << 13),
        );
        assert_eq!(caps.base_clock_mhz(), 100);
        assert_eq!(caps.max_block_size(), 1024);
        assert!(caps.adma2());
        assert!(caps.high_speed());
        assert!(caps.sdr50());
        assert!(caps.tuning_for_sdr50());
        assert!(!caps.low_signaling_only());
        assert!(caps.any_uhs());
    }
}
