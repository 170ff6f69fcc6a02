//! Card model: identity registers and negotiated link parameters.

use crate::{
    cid::{Cid, CidData},
    consts::{timing, BLOCK_SIZE_U16, BLOCK_SIZE_U64},
    csd::{CapacityProvider, Csd, CsdData},
    ext_csd::ExtCsd,
    scr::{Scr, ScrData},
    ssr::Ssr,
    switch::SwitchStatus,
    Error,
};

#[cfg(feature = "defmt-log")]
use defmt::info;
#[cfg(feature = "log")]
use log::info;

/// Device family, as discovered during identification.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardType {
    #[default]
    Unknown,
    /// SD, byte addressed.
    Sd,
    /// SD high or extended capacity, block addressed.
    SdHc,
    /// MMC, byte addressed.
    Mmc,
    /// MMC high density, sector addressed.
    MmcHd,
    /// SDIO without memory.
    Sdio,
    /// SDIO with SD memory.
    SdioComboSd,
    /// SDIO with SDHC memory.
    SdioComboSdHc,
}

impl CardType {
    pub fn is_sd(&self) -> bool {
        matches!(
            self,
            CardType::Sd | CardType::SdHc | CardType::SdioComboSd | CardType::SdioComboSdHc
        )
    }

    pub fn is_mmc(&self) -> bool {
        matches!(self, CardType::Mmc | CardType::MmcHd)
    }

    pub fn is_sdio(&self) -> bool {
        matches!(
            self,
            CardType::Sdio | CardType::SdioComboSd | CardType::SdioComboSdHc
        )
    }

    /// Whether a memory device answers block commands.
    pub fn has_memory(&self) -> bool {
        self.is_sd() || self.is_mmc()
    }

    /// Whether memory is addressed in blocks rather than bytes.
    pub fn block_addressed(&self) -> bool {
        matches!(
            self,
            CardType::SdHc | CardType::MmcHd | CardType::SdioComboSdHc
        )
    }
}

/// Data bus width.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BusWidth {
    #[default]
    One = 1,
    Four = 4,
    Eight = 8,
}

impl BusWidth {
    pub fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits {
            1 => Ok(BusWidth::One),
            4 => Ok(BusWidth::Four),
            8 => Ok(BusWidth::Eight),
            _ => Err(Error::Param),
        }
    }

    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

/// Bus timing modes, slowest family members first.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TimingMode {
    /// MMC backward compatible, up to 26 MHz.
    #[default]
    MmcBc,
    MmcHsSdr,
    MmcHsDdr,
    MmcHs200,
    /// SD default speed, up to 25 MHz.
    SdDs,
    SdHs,
    SdSdr12,
    SdSdr25,
    SdSdr50,
    SdDdr50,
    SdSdr104,
}

impl TimingMode {
    /// Whether the mode requires 1.8V signaling.
    pub fn low_signaling(&self) -> bool {
        matches!(self, TimingMode::MmcHs200) || *self >= TimingMode::SdSdr12
    }

    pub fn is_ddr(&self) -> bool {
        matches!(self, TimingMode::MmcHsDdr | TimingMode::SdDdr50)
    }

    /// Whether the HOST_CONTROL1 high speed enable applies.
    pub fn high_speed(&self) -> bool {
        !matches!(self, TimingMode::MmcBc | TimingMode::SdDs | TimingMode::SdSdr12)
    }

    /// Highest device clock of the mode.
    ///
    /// DDR modes transfer on both edges, so the clock is half of the
    /// nominal rate; SDR104 cards accept 208 MHz.
    pub fn max_clock_hz(&self) -> u32 {
        match self {
            TimingMode::MmcBc => timing::MMC_LEGACY_HZ,
            TimingMode::MmcHsSdr | TimingMode::MmcHsDdr => timing::MMC_HS_HZ,
            TimingMode::MmcHs200 => timing::MMC_HS200_HZ,
            TimingMode::SdDs | TimingMode::SdSdr12 => timing::SD_DS_HZ,
            TimingMode::SdHs | TimingMode::SdSdr25 => timing::SD_HS_HZ,
            TimingMode::SdSdr50 => timing::SD_SDR50_HZ,
            TimingMode::SdDdr50 => timing::SD_SDR50_HZ / 2,
            TimingMode::SdSdr104 => timing::SD_SDR104_HZ,
        }
    }
}

/// I/O signaling level.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalLevel {
    /// 3.3V.
    #[default]
    High,
    /// The card accepted a switch to 1.8V.
    ReadyToSwitchLow,
    /// 1.8V.
    Low,
}

/// Everything known about the device of one slot.
#[derive(Debug, Clone)]
pub struct Card {
    pub card_type: CardType,
    pub cid: CidData,
    pub csd: CsdData,
    pub ext_csd: ExtCsd,
    pub scr: ScrData,
    pub ssr: Ssr,
    /// Scratch area for switch function replies.
    pub switch: SwitchStatus,
    pub rca: u16,
    pub block_size: u16,
    pub block_count: u32,
    /// Size in bytes, `u32::MAX` when it does not fit.
    pub total_size: u32,
    pub bus_width: BusWidth,
    pub timing: TimingMode,
    pub signal_level: SignalLevel,
    pub clock_hz: u32,
    /// Replied to SEND_IF_COND, physical layer 2.0 or later.
    pub v2: bool,
    /// Supports SET_BLOCK_COUNT.
    pub set_block_count: bool,
    /// Multi-block transfers need an explicit STOP_TRANSMISSION.
    pub stop_required: bool,
    /// Number of SDIO functions.
    pub io_functions: u8,
    /// Last unrecovered error.
    pub status: Option<Error>,
}

impl Default for Card {
    fn default() -> Self {
        Card {
            card_type: CardType::Unknown,
            cid: [0; 16],
            csd: [0; 16],
            ext_csd: ExtCsd::default(),
            scr: [0; 8],
            ssr: Ssr::default(),
            switch: SwitchStatus::default(),
            rca: 0,
            block_size: BLOCK_SIZE_U16,
            block_count: 0,
            total_size: 0,
            bus_width: BusWidth::One,
            timing: TimingMode::MmcBc,
            signal_level: SignalLevel::High,
            clock_hz: 0,
            v2: false,
            set_block_count: false,
            stop_required: false,
            io_functions: 0,
            status: Some(Error::NotInitialized),
        }
    }
}

impl Card {
    /// Forgets everything learned about the previous device.
    pub fn reset(&mut self) {
        *self = Card::default();
    }

    /// CSD, decoded with the layout of the card family.
    pub fn csd(&self) -> Option<Csd> {
        if self.card_type.is_mmc() {
            Some(Csd::mmc(self.csd))
        } else if self.card_type.is_sd() {
            Some(Csd::sd(self.csd))
        } else {
            None
        }
    }

    /// CID, decoded with the layout of the card family.
    pub fn cid(&self) -> Option<Cid> {
        if self.card_type.is_mmc() {
            Some(Cid::mmc(self.cid))
        } else if self.card_type.is_sd() {
            Some(Cid::sd(self.cid))
        } else {
            None
        }
    }

    pub fn scr(&self) -> Scr {
        Scr::from(self.scr)
    }

    /// Recomputes block count and byte size from CSD and EXT_CSD.
    pub fn update_geometry(&mut self) {
        let blocks = match (self.card_type, self.csd()) {
            (CardType::MmcHd, _) => u64::from(self.ext_csd.sector_count()),
            (_, Some(csd)) => csd.card_capacity_blocks(),
            (_, None) => 0,
        };
        self.block_size = BLOCK_SIZE_U16;
        self.block_count = u32::try_from(blocks).unwrap_or(u32::MAX);
        self.total_size = u32::try_from(blocks * BLOCK_SIZE_U64).unwrap_or(u32::MAX);
    }

    /// Capacity in KiB.
    pub fn total_size_kib(&self) -> u32 {
        (u64::from(self.block_count) * u64::from(self.block_size) / 1024) as u32
    }

    /// Address argument of a data command for block `lba`.
    pub fn data_address(&self, lba: u32) -> Result<u32, Error> {
        if self.card_type.block_addressed() {
            Ok(lba)
        } else {
            lba.checked_mul(u32::from(self.block_size))
                .ok_or(Error::Param)
        }
    }

    /// Write protection recorded in the CSD.
    pub fn write_protected(&self) -> bool {
        self.csd().map_or(false, |csd| csd.write_protected())
    }

    /// Logs the identity registers.
    pub fn dump(&self) {
        info!(
            "Card type: {:?}, RCA: {:04X}, blocks: {}, size: {} KiB",
            self.card_type,
            self.rca,
            self.block_count,
            self.total_size_kib()
        );
        if let Some(cid) = self.cid() {
            let (name, len) = cid.product_name();
            let (year, month) = cid.manufacturing_date();
            info!(
                "CID: MID {:02X}, PNM {}, PSN {:08X}, MDT {}/{}",
                cid.manufacturer_id(),
                core::str::from_utf8(&name[..len]).unwrap_or("?"),
                cid.serial_number(),
                year,
                month
            );
        }
        if let Some(csd) = self.csd() {
            info!(
                "CSD: structure {}, CCC {:03X}, TRAN_SPEED {} Hz, capacity {} blocks",
                csd.structure(),
                csd.command_classes(),
                csd.tran_speed_hz(),
                csd.card_capacity_blocks()
            );
        }
        if self.card_type.is_sd() {
            let scr = self.scr();
            let (major, minor) = scr.version();
            info!(
                "SCR: version {}.{}, bus widths {:X}, CMD23 {}",
                major,
                minor,
                scr.sd_bus_widths(),
                scr.cmd23()
            );
            info!(
                "SSR: bus width {}, speed class {}, AU {}, UHS grade {}",
                self.ssr.dat_bus_width(),
                self.ssr.speed_class(),
                self.ssr.au_size(),
                self.ssr.uhs_speed_grade()
            );
        }
        if self.card_type.is_mmc() {
            info!(
                "EXT_CSD: rev {}, SEC_COUNT {}, CARD_TYPE {:02X}, BUS_WIDTH {}, HS_TIMING {}",
                self.ext_csd.revision(),
                self.ext_csd.sector_count(),
                self.ext_csd.device_type().bits(),
                self.ext_csd.bus_width(),
                self.ext_csd.hs_timing()
            );
        }
    }
}
