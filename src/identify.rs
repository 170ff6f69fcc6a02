//! Card identification and bus mode negotiation.
//!
//! [`Device::identify`] walks a freshly powered device from idle to the
//! transfer state: it finds the family (SDIO, SD, MMC), assigns the address,
//! reads the identity registers, then widens the bus and raises the timing
//! mode and clock as far as both host and device allow.

use crate::{
    card::{BusWidth, CardType, SignalLevel, TimingMode},
    config::SdMmcHostConfig,
    consts::{if_cond, ocr, sdio, timing, BLOCK_SIZE_U16},
    csd::Csd,
    device::Device,
    engine::{Delay, HostState, PowerMode, TransferPolicy},
    ext_csd::{self, DeviceType},
    regs::SdhcRegisters,
    response::{CardStatus, IoOcr},
    switch::{access_mode, current_limit, driver_strength, KEEP_CURRENT, SWITCH_FAILED},
    Error,
};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, warn};
#[cfg(feature = "log")]
use log::{debug, error, info, warn};

/// MMC bus test patterns and the bytes of the reply that carry them.
const MMC_BUS_TESTS: [(BusWidth, [u8; 8], usize); 2] = [
    (BusWidth::Eight, [0x55, 0xAA, 0, 0, 0, 0, 0, 0], 2),
    (BusWidth::Four, [0x5A, 0, 0, 0, 0, 0, 0, 0], 1),
];

/// Fallback of an SD timing mode that failed to switch.
fn slower(mode: TimingMode, low: bool) -> Option<TimingMode> {
    match mode {
        TimingMode::SdDs | TimingMode::SdSdr12 => None,
        _ if !low => Some(TimingMode::SdDs),
        mode if mode > TimingMode::SdSdr50 => Some(TimingMode::SdSdr50),
        mode if mode > TimingMode::SdSdr25 => Some(TimingMode::SdSdr25),
        _ => Some(TimingMode::SdSdr12),
    }
}

/// Access mode function of an SD timing mode.
fn access_function(mode: TimingMode) -> u8 {
    match mode {
        TimingMode::SdHs | TimingMode::SdSdr25 => access_mode::HS,
        TimingMode::SdSdr50 => access_mode::SDR50,
        TimingMode::SdSdr104 => access_mode::SDR104,
        TimingMode::SdDdr50 => access_mode::DDR50,
        _ => access_mode::DS,
    }
}

/// Whether an MMC device advertises `mode` in EXT_CSD CARD_TYPE.
fn mmc_supports(device: DeviceType, mode: TimingMode) -> bool {
    match mode {
        TimingMode::MmcHs200 => device.intersects(DeviceType::HS200_1V8 | DeviceType::HS200_1V2),
        TimingMode::MmcHsDdr => device.intersects(DeviceType::DDR_52_1V8 | DeviceType::DDR_52_1V2),
        TimingMode::MmcHsSdr => device.intersects(DeviceType::HS_26 | DeviceType::HS_52),
        _ => true,
    }
}

impl<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> Device<Regs, D, Config> {
    /// Power up period after the initialization clocks.
    const POWER_UP_MS: u32 = 200;
    /// Settling period after GO_IDLE_STATE.
    const IDLE_SETTLE_MS: u32 = 1;
    /// Check calls while a switch function reports another selection.
    const SWITCH_POLLS: usize = 8;
    /// Highest current an access mode may draw, in mA.
    const MAX_SWITCH_CURRENT_MA: u16 = 400;
    /// First MMC specification version with EXT_CSD.
    const MMC_EXT_CSD_SPEC: u8 = 4;

    /// Powers the slot and clocks the device out of reset.
    ///
    /// Leaves the engine idle at the identification clock, ready for
    /// [`Device::identify`].
    pub fn start(&mut self) -> Result<(), Error> {
        self.card.reset();
        self.engine.start()?;
        self.power_on()?;
        self.engine.delay_ms(Self::POWER_UP_MS);
        Ok(())
    }

    /// Identifies the device and brings it to the transfer state.
    pub fn identify(&mut self) -> Result<(), Error> {
        if self.engine.state() != HostState::Idle {
            return Err(Error::State);
        }
        info!("SD/MMC identification started");

        let mut restarted = false;
        loop {
            let mut retry = false;
            let result = self.detect_family().and_then(|_| match self.card.card_type {
                CardType::Sdio => self.sdio_init(),
                card_type if card_type.is_sd() => self.sd_start(&mut retry),
                card_type if card_type.is_mmc() => self.mmc_init(),
                _ => Err(Error::NotInitialized),
            });

            match result {
                Ok(()) => break,
                Err(Error::State) if retry && !restarted => {
                    warn!("Identification failed at 3.3V signaling, restarting at 1.8V");
                    restarted = true;
                    self.engine.power(PowerMode::LowIo)?;
                    self.card.signal_level = SignalLevel::Low;
                    self.engine.set_timing(TimingMode::SdSdr12, false)?;
                    self.engine.set_bus_width(BusWidth::One)?;
                }
                Err(err) => {
                    error!("Identification failed: {:?}", err);
                    self.card.status = Some(err);
                    return Err(err);
                }
            }
        }

        self.card.status = None;
        self.card.bus_width = self.engine.bus_width();
        self.card.timing = self.engine.timing();
        let policy = if Config::USE_SET_BLOCK_COUNT && self.card.set_block_count {
            TransferPolicy::AutoSetBlockCount
        } else {
            TransferPolicy::AutoStop
        };
        self.set_transfer_policy(policy);

        info!(
            "SD/MMC identified: {:?}, {:?}, {}-bit, {} Hz",
            self.card.card_type,
            self.card.timing,
            self.card.bus_width.bits(),
            self.card.clock_hz
        );
        self.card.dump();
        Ok(())
    }

    /// Whether an SD card may be asked to switch to 1.8V signaling.
    fn low_signaling_possible(&self) -> bool {
        let caps = self.engine.capabilities();
        Config::REQUEST_LOW_SIGNALING && caps.v18() && caps.any_uhs() && !caps.low_signaling_only()
    }

    /// Resets the device and finds out its family.
    fn detect_family(&mut self) -> Result<(), Error> {
        self.card.card_type = CardType::Unknown;
        self.card.rca = 0;
        self.card.v2 = false;
        self.card.io_functions = 0;

        let io_seen = match self.cmd52(true, sdio::CIA, false, sdio::CCCR_IO_ABORT, sdio::RES) {
            Ok(_) => true,
            Err(Error::NoResponse) => false,
            Err(Error::Response) => {
                debug!("SDIO reset answered with error flags");
                true
            }
            Err(err) => {
                debug!("SDIO reset: {:?}", err);
                false
            }
        };
        self.cmd0()?;
        self.engine.delay_ms(Self::IDLE_SETTLE_MS);

        match self.sd_cmd8(if_cond::VHS_2V7_3V6) {
            Ok(()) => self.card.v2 = true,
            Err(Error::NoResponse) => debug!("No reply to SEND_IF_COND, version 1 card"),
            Err(err) => return Err(err),
        }

        let (io, memory) = match io_seen.then(|| self.cmd5(0)) {
            Some(Ok(io_ocr)) if io_ocr.function_count() > 0 => {
                let io_ocr = self.sdio_op_cond(io_ocr.voltage_window() & ocr::SDIO_VOLTAGE_MASK)?;
                self.card.io_functions = io_ocr.function_count();
                (true, io_ocr.memory_present())
            }
            _ => (false, true),
        };

        if memory {
            let low = self.low_signaling_possible() && self.card.signal_level != SignalLevel::Low;
            match self.acmd41(self.card.v2, low) {
                Ok(reply) => {
                    let hc = reply & ocr::CCS != 0;
                    if low && reply & ocr::S18A != 0 {
                        self.card.signal_level = SignalLevel::ReadyToSwitchLow;
                    }
                    self.card.card_type = match (io, hc) {
                        (true, true) => CardType::SdioComboSdHc,
                        (true, false) => CardType::SdioComboSd,
                        (false, true) => CardType::SdHc,
                        (false, false) => CardType::Sd,
                    };
                }
                Err(err) if io => {
                    debug!("SDIO memory not answering: {:?}", err);
                    self.card.card_type = CardType::Sdio;
                }
                Err(Error::NoResponse) => {}
                Err(err) => return Err(err),
            }
        } else if io {
            self.card.card_type = CardType::Sdio;
        }

        if self.card.card_type == CardType::Unknown && !io {
            self.detect_mmc()?;
        }
        if self.card.card_type == CardType::Unknown {
            return Err(Error::NotInitialized);
        }
        debug!("Detected {:?}, v2 {}", self.card.card_type, self.card.v2);
        Ok(())
    }

    /// Polls IO_SEND_OP_COND until the SDIO functions are ready.
    fn sdio_op_cond(&mut self, window: u32) -> Result<IoOcr, Error> {
        for _ in 0..Self::ocr_polls() {
            let io_ocr = self.cmd5(window)?;
            if io_ocr.ready() {
                return Ok(io_ocr);
            }
            self.engine.delay_ms(Self::OCR_POLL_MS);
        }
        Err(Error::Busy)
    }

    /// MMC fallback: reset again, then SEND_OP_COND.
    fn detect_mmc(&mut self) -> Result<(), Error> {
        let mut last = Err(Error::NoResponse);
        for _ in 0..Config::MMC_RESET_ATTEMPTS {
            self.cmd0()?;
            self.engine.delay_ms(Self::IDLE_SETTLE_MS);
            last = self.cmd1();
            if last.is_ok() {
                break;
            }
        }
        match last {
            Ok(reply) => {
                self.card.card_type = if reply & ocr::MMC_ACCESS_MODE == ocr::MMC_ACCESS_SECTOR {
                    CardType::MmcHd
                } else {
                    CardType::Mmc
                };
                Ok(())
            }
            Err(Error::NoResponse) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// SD memory and combo continuation.
    fn sd_start(&mut self, retry: &mut bool) -> Result<(), Error> {
        *retry = self.low_signaling_possible() && self.card.signal_level != SignalLevel::Low;
        let base = if self.card.signal_level == SignalLevel::Low {
            TimingMode::SdSdr12
        } else {
            TimingMode::SdDs
        };
        self.engine.set_timing(base, false)?;

        if self.card.signal_level == SignalLevel::ReadyToSwitchLow {
            self.cmd11()?;
            if !self.engine.dat_lines_low() {
                warn!("DAT lines not low after VOLTAGE_SWITCH");
                return Err(Error::State);
            }
            self.engine.set_timing(TimingMode::SdSdr12, true)?;
            self.card.signal_level = SignalLevel::Low;
            self.set_clock(timing::INIT_CLOCK_HZ)?;
            *retry = false;
            info!("Switched to 1.8V signaling");
        }

        self.cmd2()?;
        self.cmd3()?;
        self.cmd9()?;
        self.card.update_geometry();
        self.cmd7(self.card.rca)?;

        self.sd_ext_information();
        self.sd_decide_bus_width()?;
        self.sd_enable_high_speed()?;
        self.apply_clock()?;

        if !self.card.card_type.block_addressed() {
            self.cmd16(BLOCK_SIZE_U16)?;
        }
        self.check_final_status()
    }

    /// SDIO only continuation.
    fn sdio_init(&mut self) -> Result<(), Error> {
        self.cmd3()?;
        self.cmd7(self.card.rca)?;
        self.set_bus_width(BusWidth::One)?;
        self.sd_enable_high_speed()?;
        self.apply_clock()
    }

    /// Reads SCR and SSR, failures only logged.
    fn sd_ext_information(&mut self) {
        match self.acmd51() {
            Ok(()) => self.card.set_block_count = self.card.scr().cmd23(),
            Err(err) => warn!("SCR read failed: {:?}", err),
        }
        if let Err(err) = self.acmd13() {
            warn!("SSR read failed: {:?}", err);
        }
    }

    fn sd_decide_bus_width(&mut self) -> Result<(), Error> {
        let width = if !self.card.card_type.is_sdio() && self.card.scr().bus_width_4() {
            BusWidth::Four
        } else {
            BusWidth::One
        };
        if width != BusWidth::One {
            self.acmd6(width)?;
        }
        self.set_bus_width(width)
    }

    /// Negotiates the fastest SD timing mode both sides support.
    fn sd_enable_high_speed(&mut self) -> Result<(), Error> {
        let low = self.card.signal_level == SignalLevel::Low;
        let (base, hs) = if low {
            (TimingMode::SdSdr12, TimingMode::SdSdr25)
        } else {
            (TimingMode::SdDs, TimingMode::SdHs)
        };
        let mut mode = base;

        if self.card.card_type.is_sdio() && self.engine.is_timing_supported(hs) {
            let cccr = self.cmd52(false, sdio::CIA, false, sdio::CCCR_HIGH_SPEED, 0)?;
            if cccr.data() & sdio::SHS != 0 {
                self.cmd52(true, sdio::CIA, true, sdio::CCCR_HIGH_SPEED, cccr.data() | sdio::EHS)?;
                mode = hs;
            }
        }

        let switch_class = self.card.csd().map_or(false, |csd| csd.supports_switch());
        if !self.card.card_type.has_memory() || !switch_class {
            return self.apply_timing(mode);
        }

        self.sd_cmd6(false, [KEEP_CURRENT; 6])?;
        let status = self.card.switch;
        let candidates = [
            TimingMode::SdSdr104,
            TimingMode::SdDdr50,
            TimingMode::SdSdr50,
            hs,
            base,
        ];
        mode = candidates
            .into_iter()
            .find(|&mode| {
                self.engine.is_timing_supported(mode) && status.supports(1, access_function(mode))
            })
            .unwrap_or(base);
        if mode.low_signaling() != low {
            warn!("Card offers {:?} at the wrong signaling level", mode);
            return Err(Error::State);
        }

        let mut power = if low && status.supports(4, current_limit::MA_400) {
            current_limit::MA_400
        } else {
            current_limit::MA_200
        };

        loop {
            if self.engine.is_timing_supported(mode) && self.sd_switch_mode(mode, &mut power)? {
                break;
            }
            mode = match slower(mode, low) {
                Some(mode) => mode,
                None => {
                    error!("Card refused {:?}", mode);
                    return Err(Error::General);
                }
            };
        }

        self.apply_timing(mode)
    }

    /// Check then switch one access mode, `Ok(false)` when the card refuses.
    fn sd_switch_mode(&mut self, mode: TimingMode, power: &mut u8) -> Result<bool, Error> {
        let function = access_function(mode);

        self.sd_cmd6(false, [function, 0, driver_strength::TYPE_B, *power, KEEP_CURRENT, KEEP_CURRENT])?;
        let current = self.card.switch.max_current();
        if current == 0 || current > Self::MAX_SWITCH_CURRENT_MA {
            debug!("{:?} draws {} mA", mode, current);
            return Ok(false);
        }
        if self.card.switch.busy(4) & (1 << *power) != 0 {
            *power = current_limit::MA_200;
        }
        if self.card.switch.busy(1) & (1 << function) != 0 {
            debug!("{:?} busy", mode);
            return Ok(false);
        }

        self.sd_cmd6(true, [KEEP_CURRENT, KEEP_CURRENT, driver_strength::TYPE_B, KEEP_CURRENT, KEEP_CURRENT, KEEP_CURRENT])?;
        if self.card.switch.selected(3) != driver_strength::TYPE_B {
            debug!("Driver strength B refused");
            return Ok(false);
        }

        self.sd_cmd6(true, [function, 0, KEEP_CURRENT, *power, KEEP_CURRENT, KEEP_CURRENT])?;
        let mut selected = self.card.switch.selected(1);
        for _ in 0..Self::SWITCH_POLLS {
            if selected == function || selected == SWITCH_FAILED {
                break;
            }
            self.sd_cmd6(false, [function, 0, KEEP_CURRENT, KEEP_CURRENT, KEEP_CURRENT, KEEP_CURRENT])?;
            selected = self.card.switch.selected(1);
        }
        Ok(selected == function)
    }

    /// MMC continuation.
    fn mmc_init(&mut self) -> Result<(), Error> {
        self.cmd2()?;
        self.cmd3()?;
        self.cmd9()?;
        self.card.update_geometry();
        self.cmd7(self.card.rca)?;
        self.card.set_block_count = true;

        let ext_csd = match self.card.csd() {
            Some(Csd::Mmc(csd)) => csd.spec_version() >= Self::MMC_EXT_CSD_SPEC,
            _ => false,
        };
        if ext_csd {
            self.mmc_cmd8()?;
            self.card.update_geometry();
        }

        self.mmc_decide_bus_width()?;
        if ext_csd {
            self.mmc_enable_high_speed()?;
        } else {
            self.apply_timing(TimingMode::MmcBc)?;
        }
        self.apply_clock()?;

        if !self.card.card_type.block_addressed() {
            self.cmd16(BLOCK_SIZE_U16)?;
        }
        self.check_final_status()
    }

    /// Finds the widest bus passing the bus test, then switches the device.
    fn mmc_decide_bus_width(&mut self) -> Result<(), Error> {
        for (width, pattern, checked) in MMC_BUS_TESTS {
            if width == BusWidth::Eight && !self.engine.capabilities().bus_8bit() {
                continue;
            }
            let len = usize::from(width.bits());
            if !self.mmc_bus_test(width, &pattern[..len], checked) {
                debug!("{}-bit bus test failed", width.bits());
                continue;
            }
            let value = match width {
                BusWidth::Eight => ext_csd::bus_width::BITS_8,
                _ => ext_csd::bus_width::BITS_4,
            };
            let status = self.mmc_cmd6(ext_csd::ACCESS_WRITE_BYTE, ext_csd::index::BUS_WIDTH, value, 0)?;
            if !status.contains(CardStatus::SWITCH_ERROR) {
                return self.set_bus_width(width);
            }
        }
        self.set_bus_width(BusWidth::One)
    }

    /// Sends a pattern with BUSTEST_W and expects it inverted from BUSTEST_R.
    fn mmc_bus_test(&mut self, width: BusWidth, pattern: &[u8], checked: usize) -> bool {
        if self.engine.set_bus_width(width).is_err() {
            return false;
        }
        let mut reply = [0u8; 8];
        let passed = self.cmd19(pattern).is_ok()
            && self.cmd14(&mut reply[..pattern.len()]).is_ok()
            && pattern
                .iter()
                .zip(reply.iter())
                .take(checked)
                .all(|(sent, got)| sent ^ got == 0xFF);
        if !passed {
            // bus tests leave the host at the tested width
            if let Err(err) = self.engine.set_bus_width(BusWidth::One) {
                warn!("Bus width reset after failed bus test: {:?}", err);
            }
        }
        passed
    }

    /// Raises the MMC timing through EXT_CSD HS_TIMING.
    fn mmc_enable_high_speed(&mut self) -> Result<(), Error> {
        let device = self.card.ext_csd.device_type();
        let wide = self.engine.bus_width() != BusWidth::One;
        let candidates = [TimingMode::MmcHs200, TimingMode::MmcHsDdr, TimingMode::MmcHsSdr];

        for mode in candidates {
            if !self.engine.is_timing_supported(mode) || !mmc_supports(device, mode) {
                continue;
            }
            if (mode == TimingMode::MmcHs200 || mode.is_ddr()) && !wide {
                continue;
            }
            match self.mmc_switch_timing(mode) {
                Ok(true) => return self.apply_timing(mode),
                Ok(false) => debug!("{:?} refused", mode),
                Err(err) => warn!("{:?} switch failed: {:?}", mode, err),
            }
            self.mmc_cmd6(
                ext_csd::ACCESS_WRITE_BYTE,
                ext_csd::index::HS_TIMING,
                ext_csd::hs_timing::LEGACY,
                0,
            )?;
            self.engine.set_timing(TimingMode::MmcBc, false)?;
        }
        self.apply_timing(TimingMode::MmcBc)
    }

    /// Switches HS_TIMING (and the DDR bus width) and reads it back.
    fn mmc_switch_timing(&mut self, mode: TimingMode) -> Result<bool, Error> {
        let value = match mode {
            TimingMode::MmcHs200 => ext_csd::hs_timing::HS200,
            _ => ext_csd::hs_timing::HIGH_SPEED,
        };
        let status = self.mmc_cmd6(ext_csd::ACCESS_WRITE_BYTE, ext_csd::index::HS_TIMING, value, 0)?;
        if status.contains(CardStatus::SWITCH_ERROR) {
            return Ok(false);
        }

        if mode.is_ddr() {
            let width = match self.engine.bus_width() {
                BusWidth::Eight => ext_csd::bus_width::DDR_8,
                _ => ext_csd::bus_width::DDR_4,
            };
            let status = self.mmc_cmd6(ext_csd::ACCESS_WRITE_BYTE, ext_csd::index::BUS_WIDTH, width, 0)?;
            if status.contains(CardStatus::SWITCH_ERROR) {
                return Ok(false);
            }
        }

        self.engine.set_timing(mode, true)?;
        self.mmc_cmd8()?;
        Ok(self.card.ext_csd.hs_timing() == value)
    }

    /// Programs a host timing mode and records it.
    fn apply_timing(&mut self, mode: TimingMode) -> Result<(), Error> {
        self.engine.set_timing(mode, true)?;
        self.card.timing = mode;
        Ok(())
    }

    /// Programs the fastest clock of the timing mode.
    ///
    /// The default modes are further limited by the CSD TRAN_SPEED.
    fn apply_clock(&mut self) -> Result<(), Error> {
        let mode = self.engine.timing();
        let mut hz = mode.max_clock_hz();
        if matches!(mode, TimingMode::SdDs | TimingMode::MmcBc) {
            let tran_speed = self.card.csd().map_or(0, |csd| csd.tran_speed_hz());
            if tran_speed != 0 {
                hz = hz.min(tran_speed);
            }
        }
        self.set_clock(hz)?;
        Ok(())
    }

    /// Reads the status once more, only logging leftover exceptions.
    fn check_final_status(&mut self) -> Result<(), Error> {
        let status = self.cmd13()?;
        let leftover = status - CardStatus::NON_EXCEPTION;
        if !leftover.is_empty() {
            warn!("Card status after identification: {:08X}", leftover.bits());
        }
        Ok(())
    }
}
