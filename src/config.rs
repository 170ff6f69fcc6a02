use crate::consts::{ocr, timing};

/// Represents config for [`SdMmcHost`](crate::SdMmcHost).
pub trait SdMmcHostConfig {
    /// Soft timeout of a single command, in milliseconds. The command is
    /// cancelled and reported as not responding once it elapses.
    const COMMAND_TIMEOUT_MS: u32;
    /// Polling period of a command in flight, in microseconds.
    const COMMAND_POLL_US: u32;
    /// Budget of the OCR polling loops (ACMD41, CMD1, CMD5), in milliseconds.
    const OCR_TIMEOUT_MS: u32;
    /// Max attempts to reset an MMC device that does not answer CMD0.
    const MMC_RESET_ATTEMPTS: usize;
    /// Max loop iterations waiting on the CMD/DAT inhibit flags.
    const INHIBIT_WAIT_ATTEMPTS: u32;
    /// Whether data transfers may use ADMA2.
    const USE_DMA: bool;
    /// Whether multi-block transfers use Auto CMD23 instead of Auto CMD12.
    const USE_SET_BLOCK_COUNT: bool;
    /// Whether UHS-I (1.8V signaling) is requested from SD cards.
    const REQUEST_LOW_SIGNALING: bool;
    /// Highest device clock to program.
    const MAX_CLOCK_HZ: u32;
    /// VDD window supplied to the card.
    const HOST_VDD_WINDOW: u32;
}

/// Default implementation of [`SdMmcHostConfig`](crate::SdMmcHostConfig).
pub struct DefaultSdMmcHostConfig;

impl SdMmcHostConfig for DefaultSdMmcHostConfig {
    const COMMAND_TIMEOUT_MS: u32 = 30_000;
    const COMMAND_POLL_US: u32 = 10;
    const OCR_TIMEOUT_MS: u32 = 1_000;
    const MMC_RESET_ATTEMPTS: usize = 10;
    const INHIBIT_WAIT_ATTEMPTS: u32 = 1_000_000;
    const USE_DMA: bool = true;
    const USE_SET_BLOCK_COUNT: bool = false;
    const REQUEST_LOW_SIGNALING: bool = true;
    const MAX_CLOCK_HZ: u32 = timing::MAX_CLOCK_HZ;
    const HOST_VDD_WINDOW: u32 = ocr::VDD_32_33 | ocr::VDD_33_34;
}
