/// Block size used for all data transfers.
pub const BLOCK_SIZE: usize = 512;
/// Block size used for all data transfers, as `u16`.
pub const BLOCK_SIZE_U16: u16 = BLOCK_SIZE as u16;
/// Block size used for all data transfers, as `u64`.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;
/// Maximum block count of a single multi-block transaction.
pub const MAX_BLOCKS_PER_TRANSFER: u32 = u16::MAX as u32;

pub mod commands {
    /// GO_IDLE_STATE - reset all cards to idle state.
    pub const CMD0: u8 = 0;
    /// SEND_OP_COND - MMC operating condition and capacity support.
    pub const CMD1: u8 = 1;
    /// ALL_SEND_CID - ask all cards to send their CID.
    pub const CMD2: u8 = 2;
    /// SEND_RELATIVE_ADDR (SD) / SET_RELATIVE_ADDR (MMC).
    pub const CMD3: u8 = 3;
    /// IO_SEND_OP_COND - SDIO operating condition.
    pub const CMD5: u8 = 5;
    /// SWITCH_FUNC (SD) / SWITCH (MMC).
    pub const CMD6: u8 = 6;
    /// SELECT/DESELECT_CARD.
    pub const CMD7: u8 = 7;
    /// SEND_IF_COND (SD) / SEND_EXT_CSD (MMC).
    pub const CMD8: u8 = 8;
    /// SEND_CSD.
    pub const CMD9: u8 = 9;
    /// VOLTAGE_SWITCH - switch to 1.8V signaling.
    pub const CMD11: u8 = 11;
    /// STOP_TRANSMISSION.
    pub const CMD12: u8 = 12;
    /// SEND_STATUS.
    pub const CMD13: u8 = 13;
    /// BUSTEST_R - read back the bus test pattern (MMC).
    pub const CMD14: u8 = 14;
    /// SET_BLOCKLEN.
    pub const CMD16: u8 = 16;
    /// READ_SINGLE_BLOCK.
    pub const CMD17: u8 = 17;
    /// READ_MULTIPLE_BLOCK.
    pub const CMD18: u8 = 18;
    /// SEND_TUNING_BLOCK (SD) / BUSTEST_W (MMC).
    pub const CMD19: u8 = 19;
    /// SEND_TUNING_BLOCK (MMC HS200).
    pub const CMD21: u8 = 21;
    /// SET_BLOCK_COUNT.
    pub const CMD23: u8 = 23;
    /// WRITE_BLOCK.
    pub const CMD24: u8 = 24;
    /// WRITE_MULTIPLE_BLOCK.
    pub const CMD25: u8 = 25;
    /// IO_RW_DIRECT - SDIO single register access.
    pub const CMD52: u8 = 52;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// SET_BUS_WIDTH.
    pub const ACMD6: u8 = 6;
    /// SD_STATUS.
    pub const ACMD13: u8 = 13;
    /// SD_SEND_OP_COND.
    pub const ACMD41: u8 = 41;
    /// SEND_SCR.
    pub const ACMD51: u8 = 51;
}

pub mod ocr {
    /// Card power up status bit, set once the card finished its power up routine.
    pub const BUSY_N: u32 = 1 << 31;
    /// Card capacity status (SD) / sector access mode (MMC).
    pub const CCS: u32 = 1 << 30;
    /// Host capacity support (ACMD41 argument).
    pub const HCS: u32 = 1 << 30;
    /// SDXC power control (ACMD41 argument).
    pub const XPC: u32 = 1 << 28;
    /// Switching to 1.8V request (ACMD41 argument).
    pub const S18R: u32 = 1 << 24;
    /// Switching to 1.8V accepted (ACMD41 response).
    pub const S18A: u32 = 1 << 24;
    /// 3.2V - 3.3V window.
    pub const VDD_32_33: u32 = 1 << 20;
    /// 3.3V - 3.4V window.
    pub const VDD_33_34: u32 = 1 << 21;
    /// MMC access mode mask.
    pub const MMC_ACCESS_MODE: u32 = 0b11 << 29;
    /// MMC sector access mode.
    pub const MMC_ACCESS_SECTOR: u32 = 0b10 << 29;
    /// SDIO: number of I/O functions.
    pub const SDIO_NUM_FUNCTIONS_SHIFT: u32 = 28;
    /// SDIO: memory present flag.
    pub const SDIO_MEMORY_PRESENT: u32 = 1 << 27;
    /// SDIO: OCR voltage window mask.
    pub const SDIO_VOLTAGE_MASK: u32 = 0x00FF_FF00;
}

pub mod if_cond {
    /// Check pattern echoed back by SEND_IF_COND.
    pub const CHECK_PATTERN: u32 = 0xAA;
    /// Supply voltage code for 2.7V - 3.6V.
    pub const VHS_2V7_3V6: u8 = 0x1;
    /// Significant bits of the R7 response.
    pub const ECHO_MASK: u32 = 0xFFF;
}

pub mod sdio {
    /// Common I/O area function number.
    pub const CIA: u8 = 0;
    /// I/O abort register address.
    pub const CCCR_IO_ABORT: u32 = 0x06;
    /// I/O abort register reset bit.
    pub const RES: u8 = 1 << 3;
    /// High speed register address.
    pub const CCCR_HIGH_SPEED: u32 = 0x13;
    /// Supports high speed.
    pub const SHS: u8 = 1 << 0;
    /// Enable high speed.
    pub const EHS: u8 = 1 << 1;
    /// R5 flags signaling an error.
    pub const R5_ERROR_MASK: u32 = 0xCB00;
}

pub mod timing {
    /// Identification clock.
    pub const INIT_CLOCK_HZ: u32 = 400_000;
    /// Highest device clock the controller may output.
    pub const MAX_CLOCK_HZ: u32 = 120_000_000;
    /// Above this frequency the sampling point needs tuning.
    pub const TUNING_THRESHOLD_HZ: u32 = 95_000_000;
    /// MMC legacy clock.
    pub const MMC_LEGACY_HZ: u32 = 26_000_000;
    /// MMC high speed clock.
    pub const MMC_HS_HZ: u32 = 52_000_000;
    /// MMC HS200 clock.
    pub const MMC_HS200_HZ: u32 = 200_000_000;
    /// SD default speed clock.
    pub const SD_DS_HZ: u32 = 25_000_000;
    /// SD high speed clock.
    pub const SD_HS_HZ: u32 = 50_000_000;
    /// SD SDR50 clock.
    pub const SD_SDR50_HZ: u32 = 100_000_000;
    /// SD SDR104 clock.
    pub const SD_SDR104_HZ: u32 = 208_000_000;
    /// Clock cycles the device may take to answer an Auto CMD12.
    pub const AUTO_CMD12_CYCLES: u32 = 2 + 64 + 48;
    /// Function switch settling period.
    pub const SWITCH_CYCLES: u32 = 8;
    /// Initialization sequence length.
    pub const INIT_CYCLES: u32 = 74;
}
