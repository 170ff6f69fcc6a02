//! Command and event engine of one SD Host Controller slot.
//!
//! The engine accepts one [`Command`] at a time. [`Engine::issue`] programs
//! the controller and returns immediately; [`Engine::process_events`] then
//! consumes the interrupt status until the command completes or fails,
//! moving PIO data and collecting responses on the way. [`Engine::send`]
//! wraps both into a bounded synchronous call.

use crate::{
    adma::{DescTable, ADDR_ALIGN},
    card::{BusWidth, TimingMode},
    command::{CmdOp, Command, DataBuffer, DataDirection, ResponseType},
    config::SdMmcHostConfig,
    consts::{commands, timing},
    regs::{
        offset, AutoCmdError, Capabilities, ClockControl, CommandFlags, HostControl1,
        HostControl2, Interrupt, PowerControl, PresentState, SdhcRegisters, SoftwareReset,
        TransferMode,
    },
    response::CardStatus,
    Error, Outcome,
};

use core::marker::PhantomData;
use embedded_hal::blocking::delay::{DelayMs, DelayUs};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, warn};
#[cfg(feature = "log")]
use log::{debug, error, warn};

/// Blocking delay provider.
pub trait Delay: DelayUs<u32> + DelayMs<u32> {}

impl<T: DelayUs<u32> + DelayMs<u32>> Delay for T {}

/// Controller state.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Not powered, no command accepted.
    Off,
    /// Powered, nothing sent yet.
    Idle,
    /// Ready for the next command.
    Locked,
    /// A command is in flight.
    Command,
    /// The last command failed.
    Error,
}

/// How multi-block transfers are terminated.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPolicy {
    /// The controller sends STOP_TRANSMISSION after the last block.
    AutoStop,
    /// The controller prefixes the transfer with SET_BLOCK_COUNT.
    AutoSetBlockCount,
    /// No automatic command, the caller frames the transfer.
    Manual,
}

/// Slot power request.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Off,
    /// 3.3V I/O.
    Standard,
    /// 1.8V I/O.
    LowIo,
}

/// Progress of the command in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Sent {
        cmd_released: bool,
        data_released: bool,
    },
    /// Waiting for the response of the automatic STOP_TRANSMISSION.
    AwaitingAutoStop,
    Done,
    Failed,
}

/// Engine-side snapshot of the command in flight.
#[derive(Debug, Clone, Copy)]
struct Active {
    index: u8,
    arg: u32,
    op: CmdOp,
    block_size: u16,
    block_count: u16,
    dma: bool,
    auto_stop: bool,
    response_read: bool,
    /// Buffer region to invalidate once a DMA read completes.
    region: (usize, usize),
}

/// Register/event engine of one slot.
///
/// `Regs` - controller registers.
/// `D` - blocking delay.
/// `Config` - config implementation.
pub struct Engine<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> {
    regs: Regs,
    delay: D,
    caps: Capabilities,
    state: HostState,
    phase: Phase,
    active: Option<Active>,
    block_index: u16,
    dev_clock: u32,
    timing: TimingMode,
    bus_width: BusWidth,
    policy: TransferPolicy,
    adma: DescTable,
    config: PhantomData<Config>,
}

impl<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> Engine<Regs, D, Config> {
    /// Rounds of the sampling clock tuning.
    const TUNING_ROUNDS: usize = 40;
    /// Budget of the STOP_TRANSMISSION sent by a cancel.
    const CANCEL_TIMEOUT_US: u32 = 500_000;
    /// Polling period of the STOP_TRANSMISSION sent by a cancel.
    const CANCEL_POLL_US: u32 = 10;
    /// Clock quiesce period of a signaling switch.
    const QUIESCE_US: u32 = 10;
    /// Regulator settling period of a signaling switch.
    const SETTLE_MS: u32 = 5;
    /// Line check period of a signaling switch.
    const LINE_CHECK_MS: u32 = 1;
    /// Data timeout counter value, TMCLK x 2^27.
    const DATA_TIMEOUT: u8 = 0xE;
    /// Normal interrupts the engine consumes.
    const NORMAL_EVENTS: Interrupt = Interrupt::TRANSFER_EVENTS;

    /// Creates a new [`Engine`] over a slot, powered off.
    pub fn new(mut regs: Regs, delay: D) -> Self {
        let caps = Capabilities::from_words(
            regs.read_u32(offset::CAPABILITIES),
            regs.read_u32(offset::CAPABILITIES1),
        );
        Engine {
            regs,
            delay,
            caps,
            state: HostState::Off,
            phase: Phase::Idle,
            active: None,
            block_index: 0,
            dev_clock: 0,
            timing: TimingMode::MmcBc,
            bus_width: BusWidth::One,
            policy: TransferPolicy::AutoStop,
            adma: DescTable::default(),
            config: PhantomData::<Config>,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Device clock currently output, 0 when stopped.
    pub fn device_clock(&self) -> u32 {
        self.dev_clock
    }

    pub fn timing(&self) -> TimingMode {
        self.timing
    }

    pub fn bus_width(&self) -> BusWidth {
        self.bus_width
    }

    pub fn policy(&self) -> TransferPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: TransferPolicy) {
        self.policy = policy;
    }

    /// Register access for platform code.
    pub fn registers(&mut self) -> &mut Regs {
        &mut self.regs
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    pub fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }

    /// Microseconds covering `cycles` of the device clock, at least 1.
    pub fn cycles_to_us(&self, cycles: u32) -> u32 {
        if self.dev_clock == 0 {
            return 1;
        }
        let clock = u64::from(self.dev_clock);
        let us = (u64::from(cycles) * 1_000_000 + clock - 1) / clock;
        (us as u32).max(1)
    }

    fn present_state(&mut self) -> PresentState {
        PresentState::from_bits_retain(self.regs.read_u32(offset::PRESENT_STATE))
    }

    fn pending_events(&mut self) -> Interrupt {
        Interrupt::from_bits_retain(self.regs.read_u32(offset::INT_STATUS))
            & (Self::NORMAL_EVENTS | Interrupt::ERROR | Interrupt::ERROR_MASK)
    }

    fn clear_events(&mut self, events: Interrupt) {
        self.regs.write_u32(offset::INT_STATUS, events.bits());
    }

    /// Whether a device sits in the slot.
    pub fn card_present(&mut self) -> bool {
        self.caps.embedded_slot() || self.present_state().contains(PresentState::CARD_INSERTED)
    }

    /// Whether the mechanical write protect switch is off.
    pub fn write_enabled(&mut self) -> bool {
        self.caps.embedded_slot() || self.present_state().contains(PresentState::WRITE_ENABLED)
    }

    /// Whether DAT[3:0] are all driven low.
    pub fn dat_lines_low(&mut self) -> bool {
        !self.present_state().intersects(PresentState::DAT_LEVEL)
    }

    /// Waits for the controller to clear the inhibit flags.
    fn wait_inhibit(&mut self, inhibit: PresentState) -> Result<(), Error> {
        for _ in 0..Config::INHIBIT_WAIT_ATTEMPTS {
            if !self.present_state().intersects(inhibit) {
                return Ok(());
            }
        }
        Err(Error::Busy)
    }

    /// Resets the CMD and/or DAT circuits.
    fn reset_lines(&mut self, lines: SoftwareReset) {
        self.regs.write_u8(offset::SOFTWARE_RESET, lines.bits());
        for _ in 0..Config::INHIBIT_WAIT_ATTEMPTS {
            if !SoftwareReset::from_bits_retain(self.regs.read_u8(offset::SOFTWARE_RESET))
                .intersects(lines)
            {
                return;
            }
        }
        error!("SDHC reset of lines {:02X} did not complete", lines.bits());
    }

    /// Gates the device clock; stays stopped while no frequency is programmed.
    fn sd_clock(&mut self, enable: bool) {
        let mut ccr = ClockControl::from_bits_retain(self.regs.read_u16(offset::CLOCK_CONTROL));
        ccr.set(ClockControl::SD_CLOCK_ENABLE, enable && self.dev_clock != 0);
        self.regs.write_u16(offset::CLOCK_CONTROL, ccr.bits());
    }

    /// Full software reset, then default host settings.
    pub fn reset_peripheral(&mut self) {
        let timing = if self.timing >= TimingMode::SdDs {
            TimingMode::SdDs
        } else {
            TimingMode::MmcBc
        };

        self.reset_lines(SoftwareReset::ALL);
        self.regs.restore_after_reset();
        self.regs
            .write_u8(offset::HOST_CONTROL1, HostControl1::DMA_ADMA32.bits());
        self.regs
            .write_u8(offset::TIMEOUT_CONTROL, Self::DATA_TIMEOUT);

        self.timing = timing;
        self.bus_width = BusWidth::One;
        self.dev_clock = 0;
        self.phase = Phase::Idle;
        self.active = None;
        self.block_index = 0;
    }

    /// Brings the slot up at 3.3V, 1-bit bus, identification clock.
    pub fn start(&mut self) -> Result<(), Error> {
        self.state = HostState::Idle;
        self.reset_peripheral();
        self.power(PowerMode::Standard)?;
        self.set_timing(TimingMode::MmcBc, false)?;
        self.set_bus_width(BusWidth::One)?;
        self.set_clock(timing::INIT_CLOCK_HZ)?;
        Ok(())
    }

    /// Resets the device and powers the slot down.
    pub fn unplug(&mut self) {
        if self.caps.embedded_slot() {
            self.regs.set_hw_reset(true);
            self.delay.delay_us(10);
            self.regs.set_hw_reset(false);
        }
        let settle = self.cycles_to_us(timing::INIT_CYCLES).max(200);
        self.delay.delay_us(settle);

        self.regs.write_u16(offset::CLOCK_CONTROL, 0);
        self.regs.write_u8(offset::POWER_CONTROL, 0);
        self.reset_peripheral();
        self.state = HostState::Off;
    }

    /// Applies a power request, adapting the timing mode to the I/O voltage.
    pub fn power(&mut self, mode: PowerMode) -> Result<(), Error> {
        let mut timing = self.timing;
        match mode {
            PowerMode::Off => {
                self.unplug();
                return Ok(());
            }
            PowerMode::LowIo if !self.caps.v18() => return Err(Error::Param),
            _ => {}
        }

        if !self.caps.low_signaling_only() {
            match mode {
                PowerMode::LowIo if timing < TimingMode::SdDs => timing = TimingMode::MmcHs200,
                PowerMode::LowIo if timing < TimingMode::SdSdr12 => timing = TimingMode::SdSdr12,
                PowerMode::Standard if timing > TimingMode::SdHs => timing = TimingMode::SdDs,
                PowerMode::Standard
                    if timing > TimingMode::MmcHsDdr && timing < TimingMode::SdDs =>
                {
                    timing = TimingMode::MmcBc
                }
                _ => {}
            }
        }

        self.set_timing(timing, true)
    }

    /// Whether both the controller and the slot support `mode`.
    pub fn is_timing_supported(&self, mode: TimingMode) -> bool {
        let caps = &self.caps;
        match mode {
            TimingMode::MmcBc | TimingMode::SdDs => true,
            TimingMode::MmcHsSdr | TimingMode::MmcHsDdr | TimingMode::SdHs => caps.high_speed(),
            TimingMode::MmcHs200 => caps.low_signaling_only() && caps.any_uhs(),
            TimingMode::SdSdr12 | TimingMode::SdSdr25 => caps.v18() && caps.any_uhs(),
            TimingMode::SdSdr50 => caps.v18() && caps.sdr50(),
            TimingMode::SdDdr50 => caps.v18() && caps.ddr50(),
            TimingMode::SdSdr104 => caps.v18() && caps.sdr104(),
        }
    }

    /// Bus voltage for the signaling level.
    fn bus_voltage(&self, low: bool) -> PowerControl {
        if low && self.caps.low_signaling_only() {
            PowerControl::VOLTAGE_1_8
        } else if self.caps.v33() {
            PowerControl::VOLTAGE_3_3
        } else if self.caps.v30() {
            PowerControl::VOLTAGE_3_0
        } else {
            PowerControl::VOLTAGE_1_8
        }
    }

    /// Programs a timing mode and its signaling level.
    ///
    /// A change of signaling level follows the voltage switch sequence:
    /// stop the clock, switch, let the regulator settle, restart the clock.
    /// With `verify`, DAT[3:0] and CMD must read high once the clock runs
    /// again.
    pub fn set_timing(&mut self, mode: TimingMode, verify: bool) -> Result<(), Error> {
        let low = mode.low_signaling();
        let mut hc2 = HostControl2::from_bits_retain(self.regs.read_u16(offset::HOST_CONTROL2));
        let was_low = hc2.contains(HostControl2::SIGNALING_1_8);
        let power = self.bus_voltage(low) | PowerControl::BUS_POWER;
        let current = PowerControl::from_bits_retain(self.regs.read_u8(offset::POWER_CONTROL));
        let voltage_changed = current != power;

        self.sd_clock(false);
        self.delay.delay_us(Self::QUIESCE_US);

        if voltage_changed {
            debug!("SDHC bus power {:02X} -> {:02X}", current.bits(), power.bits());
            self.regs.write_u8(
                offset::POWER_CONTROL,
                (current - PowerControl::BUS_POWER).bits(),
            );
            self.delay.delay_ms(Self::LINE_CHECK_MS);
            self.regs.write_u8(offset::POWER_CONTROL, power.bits());
            self.delay.delay_ms(Self::SETTLE_MS);
        }

        if low != was_low {
            hc2.set(HostControl2::SIGNALING_1_8, low);
            self.regs.write_u16(offset::HOST_CONTROL2, hc2.bits());
            self.delay.delay_ms(Self::SETTLE_MS);
            hc2 = HostControl2::from_bits_retain(self.regs.read_u16(offset::HOST_CONTROL2));
            if hc2.contains(HostControl2::SIGNALING_1_8) != low {
                error!("SDHC signaling switch did not latch");
                self.sd_clock(true);
                return Err(Error::General);
            }
        }

        let mut hc1 = HostControl1::from_bits_retain(self.regs.read_u8(offset::HOST_CONTROL1));
        hc1.set(HostControl1::HIGH_SPEED, mode.high_speed());
        self.regs.write_u8(offset::HOST_CONTROL1, hc1.bits());

        hc2.remove(HostControl2::UHS_MASK | HostControl2::DRIVER_TYPE_MASK);
        hc2 |= match mode {
            TimingMode::SdSdr25 => HostControl2::UHS_SDR25,
            TimingMode::SdSdr50 => HostControl2::UHS_SDR50,
            TimingMode::SdSdr104 | TimingMode::MmcHs200 => HostControl2::UHS_SDR104,
            TimingMode::SdDdr50 | TimingMode::MmcHsDdr => HostControl2::UHS_DDR50,
            _ => HostControl2::UHS_SDR12,
        };
        self.regs.write_u16(offset::HOST_CONTROL2, hc2.bits());

        self.sd_clock(true);

        if low != was_low {
            self.delay.delay_ms(Self::LINE_CHECK_MS);
            if verify && self.dev_clock != 0 && !self.present_state().lines_high() {
                warn!("SDHC lines not released after signaling switch");
                return Err(Error::State);
            }
        }
        if low || voltage_changed {
            self.regs.calibrate_output(low);
        }

        self.timing = mode;
        Ok(())
    }

    /// Programs the data bus width.
    pub fn set_bus_width(&mut self, width: BusWidth) -> Result<(), Error> {
        if width == BusWidth::Eight && !self.caps.bus_8bit() {
            return Err(Error::Param);
        }
        let mut hc1 = HostControl1::from_bits_retain(self.regs.read_u8(offset::HOST_CONTROL1));
        hc1.remove(HostControl1::DATA_WIDTH_4 | HostControl1::DATA_WIDTH_8);
        match width {
            BusWidth::One => {}
            BusWidth::Four => hc1 |= HostControl1::DATA_WIDTH_4,
            BusWidth::Eight => hc1 |= HostControl1::DATA_WIDTH_8,
        }
        self.regs.write_u8(offset::HOST_CONTROL1, hc1.bits());
        self.bus_width = width;
        Ok(())
    }

    /// Programs the device clock as close to `freq` as possible.
    ///
    /// Returns [`Outcome::Changed`] when the achieved frequency differs from
    /// the request; see [`Engine::device_clock`].
    pub fn set_clock(&mut self, freq: u32) -> Result<Outcome, Error> {
        if freq == 0 {
            return Err(Error::Param);
        }

        let achieved = self.program_clock(freq)?;

        let needs_tuning = match self.timing {
            TimingMode::MmcHs200 | TimingMode::SdSdr104 => true,
            TimingMode::SdSdr50 => self.caps.tuning_for_sdr50(),
            _ => false,
        };
        if achieved > timing::TUNING_THRESHOLD_HZ && needs_tuning {
            self.tune()?;
        }

        Ok(if achieved != freq {
            Outcome::Changed
        } else {
            Outcome::Done
        })
    }

    /// Computes and writes the clock divider, returns the achieved frequency.
    fn program_clock(&mut self, freq: u32) -> Result<u32, Error> {
        let freq = freq.min(timing::MAX_CLOCK_HZ).min(Config::MAX_CLOCK_HZ).max(1);
        let base = u32::from(self.caps.base_clock_mhz()) * 1_000_000;
        if base == 0 {
            return Err(Error::NotSupported);
        }

        let divided = |div: u32| base / if div == 0 { 1 } else { 2 * div };
        let mut div = base / (2 * freq);
        if div >= 0x3FF {
            div = 0x3FF;
        } else {
            let up = divided(div);
            let low = base / (2 * (div + 1));
            if up > freq && up - freq > freq - low {
                div += 1;
            }
        }
        let mut achieved = divided(div);
        let mut programmable = false;

        let mult = u64::from(self.caps.clock_multiplier());
        if mult != 0 {
            let mult_clock = u64::from(base) * (mult + 1);
            let p_div = match (mult_clock + u64::from(freq) - 1) / u64::from(freq) {
                n if n > 0x3FF => 0x3FF,
                n => n as u32 - 1,
            };
            let p_achieved = (mult_clock / u64::from(p_div + 1)) as u32;
            if p_achieved.abs_diff(freq) < achieved.abs_diff(freq) {
                div = p_div;
                achieved = p_achieved;
                programmable = true;
            }
        }

        self.sd_clock(false);
        self.dev_clock = achieved;

        let mut ccr = ClockControl::with_divider(div as u16) | ClockControl::INTERNAL_ENABLE;
        ccr.set(ClockControl::PROGRAMMABLE, programmable);
        self.regs.write_u16(offset::CLOCK_CONTROL, ccr.bits());

        let stable = (0..Config::INHIBIT_WAIT_ATTEMPTS).any(|_| {
            ClockControl::from_bits_retain(self.regs.read_u16(offset::CLOCK_CONTROL))
                .contains(ClockControl::INTERNAL_STABLE)
        });
        if !stable {
            error!("SDHC internal clock not stable");
            return Err(Error::General);
        }

        self.sd_clock(true);
        debug!("SDHC device clock {} Hz (requested {})", achieved, freq);

        Ok(achieved)
    }

    /// Runs the sampling clock tuning procedure.
    pub fn tune(&mut self) -> Result<(), Error> {
        if self.state == HostState::Command {
            return Err(Error::Busy);
        }
        let index = if self.timing == TimingMode::MmcHs200 {
            commands::CMD21
        } else {
            commands::CMD19
        };
        let block_size: u16 = match self.bus_width {
            BusWidth::Eight => 128,
            BusWidth::Four => 64,
            BusWidth::One => return Err(Error::Param),
        };

        let mut hc2 = HostControl2::from_bits_retain(self.regs.read_u16(offset::HOST_CONTROL2));
        hc2 |= HostControl2::EXECUTE_TUNING;
        self.regs.write_u16(offset::HOST_CONTROL2, hc2.bits());

        let flags = CommandFlags::from_bits_retain(u16::from(index) << 8)
            | CommandFlags::RESP_48
            | CommandFlags::CRC_CHECK
            | CommandFlags::INDEX_CHECK
            | CommandFlags::DATA_PRESENT;

        for _ in 0..Self::TUNING_ROUNDS {
            self.wait_inhibit(PresentState::CMD_INHIBIT | PresentState::DAT_INHIBIT)?;
            self.regs.write_u32(
                offset::INT_ENABLE,
                Interrupt::BUFFER_READ_READY.bits(),
            );
            self.regs.write_u16(offset::BLOCK_SIZE, block_size);
            self.regs.write_u16(offset::BLOCK_COUNT, 1);
            self.regs
                .write_u16(offset::TRANSFER_MODE, TransferMode::READ.bits());
            self.regs.write_u32(offset::ARGUMENT, 0);
            self.regs.write_u16(offset::COMMAND, flags.bits());

            let ready = (0..Config::INHIBIT_WAIT_ATTEMPTS).any(|_| {
                Interrupt::from_bits_retain(self.regs.read_u32(offset::INT_STATUS))
                    .contains(Interrupt::BUFFER_READ_READY)
            });
            if ready {
                self.clear_events(Interrupt::BUFFER_READ_READY);
            }

            hc2 = HostControl2::from_bits_retain(self.regs.read_u16(offset::HOST_CONTROL2));
            if !hc2.contains(HostControl2::EXECUTE_TUNING) {
                break;
            }
        }

        let residual = self.pending_events();
        self.clear_events(residual);
        self.phase = Phase::Idle;
        self.block_index = 0;
        if self.state != HostState::Off {
            self.state = HostState::Locked;
        }

        if hc2.contains(HostControl2::EXECUTE_TUNING) {
            hc2.remove(HostControl2::EXECUTE_TUNING | HostControl2::SAMPLING_CLOCK_SELECT);
            self.regs.write_u16(offset::HOST_CONTROL2, hc2.bits());
            self.reset_lines(SoftwareReset::CMD | SoftwareReset::DATA);
            error!("SDHC tuning did not complete");
            return Err(Error::General);
        }
        if !hc2.contains(HostControl2::SAMPLING_CLOCK_SELECT) {
            error!("SDHC tuning failed, sampling clock not selected");
            return Err(Error::General);
        }

        Ok(())
    }

    /// Whether the command may move its data through ADMA.
    fn dma_eligible(&self, cmd: &Command<'_>) -> bool {
        let pio_only = match cmd.index {
            commands::CMD21 => self.timing < TimingMode::SdDs,
            commands::CMD19 => self.timing >= TimingMode::SdDs,
            _ => false,
        };
        Config::USE_DMA && self.caps.adma2() && !pio_only
    }

    /// Builds the descriptor table and performs cache maintenance.
    ///
    /// Returns `None` when the transfer must use PIO.
    fn prepare_dma(&mut self, cmd: &mut Command<'_>) -> Option<(u32, (usize, usize))> {
        let ptr = cmd.buffer.dma_ptr()?;
        let bus_addr = self.regs.dma_address(ptr)?;
        let table = self.regs.dma_address(self.adma.as_ptr())?;
        if bus_addr as usize % ADDR_ALIGN != 0 {
            return None;
        }

        let blocks = self.adma.fill(bus_addr, cmd.block_size, cmd.block_count)?;
        if blocks != cmd.block_count {
            warn!(
                "CMD{} block count {} -> {}",
                cmd.index, cmd.block_count, blocks
            );
            cmd.block_count = blocks;
        }

        let addr = ptr as usize;
        let len = cmd.data_len();
        let line = self.regs.cache_line_size().max(1);
        let aligned = addr % line == 0 && len % line == 0;
        match cmd.buffer {
            DataBuffer::Tx(_) => self.regs.clean_dcache(addr, len),
            DataBuffer::Rx(_) if aligned => self.regs.invalidate_dcache(addr, len),
            DataBuffer::Rx(_) => self.regs.clean_invalidate_dcache(addr, len),
            DataBuffer::None => {}
        }

        Some((table, (addr, len)))
    }

    /// Issues a command without waiting for its completion.
    ///
    /// The caller keeps `cmd` and passes it to [`Engine::process_events`]
    /// until [`Engine::state`] leaves [`HostState::Command`].
    pub fn issue(&mut self, cmd: &mut Command<'_>) -> Result<Outcome, Error> {
        match self.state {
            HostState::Off => return Err(Error::State),
            HostState::Command => return Err(Error::Busy),
            _ => {}
        }

        let op = cmd.op;
        if op.power_on == op.send {
            return Err(Error::Param);
        }
        let stop = op.direction == DataDirection::Stop;
        if stop && cmd.index != commands::CMD12 && cmd.index != commands::CMD52 {
            return Err(Error::Param);
        }

        if op.power_on {
            if self.dev_clock == 0 {
                return Err(Error::State);
            }
            let us = self.cycles_to_us(timing::INIT_CYCLES);
            self.delay.delay_us(us);
            cmd.status = Ok(Outcome::Done);
            return Ok(Outcome::Done);
        }

        let has_data = op.has_data();
        let multi = matches!(cmd.index, commands::CMD18 | commands::CMD25);
        let mut outcome = Outcome::Done;
        let mut dma = None;
        if has_data {
            if cmd.block_count == 0 || cmd.block_size == 0 || cmd.buffer.is_empty() {
                return Err(Error::Param);
            }
            if cmd.block_size > self.caps.max_block_size() || cmd.buffer.len() < cmd.data_len() {
                return Err(Error::Param);
            }
            let requested = cmd.block_count;
            if self.dma_eligible(cmd) {
                dma = self.prepare_dma(cmd);
            }
            if cmd.block_count != requested {
                outcome = Outcome::Changed;
            }
        }

        let mut inhibit = PresentState::CMD_INHIBIT;
        if has_data || (op.busy && !stop) {
            inhibit |= PresentState::DAT_INHIBIT;
        }
        self.wait_inhibit(inhibit)?;

        let auto_set_block_count = has_data && multi && self.policy == TransferPolicy::AutoSetBlockCount;
        let auto_stop = has_data && multi && self.policy == TransferPolicy::AutoStop;

        self.state = HostState::Command;
        self.phase = Phase::Sent {
            cmd_released: false,
            data_released: false,
        };
        self.block_index = 0;
        self.active = Some(Active {
            index: cmd.index,
            arg: cmd.arg,
            op,
            block_size: cmd.block_size,
            block_count: cmd.block_count,
            dma: dma.is_some(),
            auto_stop,
            response_read: false,
            region: dma.map_or((0, 0), |(_, region)| region),
        });
        cmd.status = Ok(outcome);
        cmd.response = [0; 4];

        let mut mode = TransferMode::empty();
        let mut flags = CommandFlags::from_bits_retain(u16::from(cmd.index & 0x3F) << 8);
        let mut errors = Interrupt::ALL_ERRORS;

        flags |= match op.response {
            ResponseType::R0 => CommandFlags::empty(),
            ResponseType::R2 => CommandFlags::RESP_136,
            _ if op.busy => CommandFlags::RESP_48_BUSY,
            _ => CommandFlags::RESP_48,
        };
        if op.checks_crc() {
            flags |= CommandFlags::CRC_CHECK;
        } else {
            errors.remove(Interrupt::CMD_CRC);
        }
        if op.checks_index() {
            flags |= CommandFlags::INDEX_CHECK;
        } else {
            errors.remove(Interrupt::CMD_INDEX);
        }
        if op.response == ResponseType::R0 {
            errors.remove(Interrupt::CMD_TIMEOUT);
        }

        if stop {
            mode |= TransferMode::MULTI_BLOCK | TransferMode::BLOCK_COUNT_ENABLE;
            errors.remove(Interrupt::DATA_ERRORS);
        }
        if has_data {
            flags |= CommandFlags::DATA_PRESENT;
            if op.direction == DataDirection::Rx {
                mode |= TransferMode::READ;
            }
            if auto_set_block_count {
                mode |= TransferMode::AUTO_CMD23;
            } else if auto_stop {
                mode |= TransferMode::AUTO_CMD12;
            }
            if multi || cmd.block_count > 1 {
                mode |= TransferMode::MULTI_BLOCK | TransferMode::BLOCK_COUNT_ENABLE;
            }
            if dma.is_some() {
                mode |= TransferMode::DMA_ENABLE;
            }
        }

        self.regs.set_open_drain(op.open_drain);
        self.regs.write_u32(
            offset::INT_ENABLE,
            Self::NORMAL_EVENTS.bits() | errors.bits(),
        );
        self.regs.write_u32(offset::INT_STATUS, u32::MAX);

        if has_data {
            if auto_set_block_count {
                self.regs
                    .write_u32(offset::ARGUMENT2, u32::from(cmd.block_count));
            }
            if let Some((table, _)) = dma {
                self.regs.write_u32(offset::ADMA_ADDRESS, table);
            }
            self.regs.write_u16(offset::BLOCK_SIZE, cmd.block_size);
            self.regs.write_u16(offset::BLOCK_COUNT, cmd.block_count);
        } else if stop {
            self.regs.write_u16(offset::BLOCK_COUNT, 0);
        }

        debug!(
            "CMD{} arg {:08X} blocks {}",
            cmd.index, cmd.arg, cmd.block_count
        );

        self.regs.write_u32(offset::ARGUMENT, cmd.arg);
        if has_data || stop {
            self.regs.write_u16(offset::TRANSFER_MODE, mode.bits());
        }
        self.regs.write_u16(offset::COMMAND, flags.bits());

        Ok(outcome)
    }

    /// Consumes pending controller events of the command in flight.
    ///
    /// Call repeatedly, from the issuing context or an interrupt handler,
    /// until [`Engine::state`] leaves [`HostState::Command`].
    pub fn process_events(&mut self, cmd: &mut Command<'_>) {
        if self.state != HostState::Command {
            return;
        }

        loop {
            let auto_stop = self.phase == Phase::AwaitingAutoStop;
            if auto_stop {
                let us = self.cycles_to_us(timing::AUTO_CMD12_CYCLES);
                self.delay.delay_us(us);
            }

            let events = self.pending_events();
            if events.is_empty() && !auto_stop {
                return;
            }

            let handled = self.handle_events(cmd, events, auto_stop);
            if matches!(self.phase, Phase::Done | Phase::Failed) {
                break;
            }
            let rest = events - handled;
            if !rest.is_empty() {
                self.clear_events(rest);
            }
        }

        self.finish(cmd);
    }

    /// One pass over `events`, returns the events consumed.
    fn handle_events(&mut self, cmd: &mut Command<'_>, events: Interrupt, auto_stop: bool) -> Interrupt {
        let Some(active) = self.active else {
            self.phase = Phase::Failed;
            return events;
        };
        let mut handled = Interrupt::empty();

        if events.intersects(Interrupt::ERROR | Interrupt::ERROR_MASK) {
            let errors = events & Interrupt::ERROR_MASK;
            self.clear_events(errors);
            let error = self.classify(errors);
            warn!(
                "CMD{} failed with {:?}, status {:08X}",
                active.index,
                error,
                errors.bits()
            );
            cmd.status = Err(error);
            self.phase = Phase::Failed;
            return events;
        }

        if auto_stop {
            self.read_response(cmd, true);
            self.phase = Phase::Done;
            return handled;
        }

        let has_data = active.op.has_data();
        let rx = active.op.direction == DataDirection::Rx;
        let tx = active.op.direction == DataDirection::Tx;

        if events.contains(Interrupt::CMD_COMPLETE) {
            self.clear_events(Interrupt::CMD_COMPLETE);
            handled |= Interrupt::CMD_COMPLETE;
            let data_released = matches!(
                self.phase,
                Phase::Sent {
                    data_released: true,
                    ..
                }
            );
            self.phase = Phase::Sent {
                cmd_released: true,
                data_released,
            };
            self.read_response(cmd, data_released);
            if (!has_data && !active.op.busy) || data_released {
                self.phase = Phase::Done;
                return handled;
            }
        }

        if events.contains(Interrupt::BUFFER_READ_READY) && rx && !active.dma {
            self.clear_events(Interrupt::BUFFER_READ_READY);
            handled |= Interrupt::BUFFER_READ_READY;
            if self.block_index >= active.block_count {
                cmd.status = Err(Error::Io);
                self.phase = Phase::Failed;
                return handled;
            }
            self.read_block(cmd, active.block_size);
            self.block_index += 1;
        }

        if events.contains(Interrupt::BUFFER_WRITE_READY)
            && tx
            && !active.dma
            && self.block_index < active.block_count
        {
            self.clear_events(Interrupt::BUFFER_WRITE_READY);
            handled |= Interrupt::BUFFER_WRITE_READY;
            self.write_block(cmd, active.block_size);
            self.block_index += 1;
        }

        if events.contains(Interrupt::TRANSFER_COMPLETE) {
            self.clear_events(Interrupt::TRANSFER_COMPLETE);
            handled |= Interrupt::TRANSFER_COMPLETE;
            let cmd_released = matches!(
                self.phase,
                Phase::Sent {
                    cmd_released: true,
                    ..
                }
            );
            self.phase = Phase::Sent {
                cmd_released,
                data_released: true,
            };
            if cmd_released && !active.auto_stop {
                self.read_response(cmd, true);
            }
            if has_data && !active.dma && self.block_index != active.block_count {
                cmd.status = Err(Error::Io);
                self.phase = Phase::Failed;
                return handled;
            }
            if active.auto_stop {
                self.phase = Phase::AwaitingAutoStop;
            } else if cmd_released {
                self.phase = Phase::Done;
            }
        }

        handled
    }

    /// Maps error interrupt bits to an error code.
    fn classify(&mut self, errors: Interrupt) -> Error {
        if errors.contains(Interrupt::CURRENT_LIMIT) {
            Error::NotInitialized
        } else if errors.contains(Interrupt::CMD_CRC) {
            Error::Io
        } else if errors.contains(Interrupt::CMD_TIMEOUT) {
            Error::NoResponse
        } else if errors.intersects(Interrupt::CMD_END_BIT | Interrupt::CMD_INDEX) {
            Error::Io
        } else if errors.contains(Interrupt::TUNING) {
            Error::Io
        } else if errors.intersects(
            Interrupt::DATA_TIMEOUT | Interrupt::DATA_CRC | Interrupt::DATA_END_BIT,
        ) {
            Error::Io
        } else if errors.contains(Interrupt::AUTO_CMD) {
            let acmd = AutoCmdError::from_bits_retain(self.regs.read_u16(offset::AUTO_CMD_ERROR));
            if acmd.contains(AutoCmdError::NOT_EXECUTED) {
                Error::General
            } else if acmd.contains(AutoCmdError::CRC) {
                Error::Io
            } else if acmd.contains(AutoCmdError::TIMEOUT) {
                Error::NoResponse
            } else if acmd.intersects(AutoCmdError::END_BIT | AutoCmdError::INDEX) {
                Error::Io
            } else {
                Error::General
            }
        } else if errors.contains(Interrupt::ADMA) {
            Error::Param
        } else if errors.contains(Interrupt::BOOT_ACK) {
            Error::State
        } else {
            Error::General
        }
    }

    /// Copies the response registers into `cmd`, once per command.
    ///
    /// `complete` tells that the data phase is over, so the response of an
    /// automatic STOP_TRANSMISSION is available and gets merged.
    fn read_response(&mut self, cmd: &mut Command<'_>, complete: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if !active.response_read {
            match active.op.response {
                ResponseType::R0 => {}
                ResponseType::R2 => {
                    let mut out = [0u32; 4];
                    out[3] = 0xFF;
                    for ix in 0..4 {
                        let rr = self.regs.read_u32(offset::RESPONSE + 4 * ix as u16);
                        if ix < 3 {
                            out[2 - ix] = rr >> 24;
                        }
                        out[3 - ix] |= rr << 8;
                    }
                    cmd.response = out;
                }
                _ => cmd.response[0] = self.regs.read_u32(offset::RESPONSE),
            }
            active.response_read = true;
        }

        if active.auto_stop && complete {
            let stop = self.regs.read_u32(offset::RESPONSE + 12);
            cmd.response[0] |= stop & !CardStatus::NON_EXCEPTION.bits();
        }
    }

    /// Moves one block from the buffer data port into the receive buffer.
    fn read_block(&mut self, cmd: &mut Command<'_>, block_size: u16) {
        let size = usize::from(block_size);
        let start = usize::from(self.block_index) * size;
        if let DataBuffer::Rx(buf) = &mut cmd.buffer {
            if let Some(block) = buf.get_mut(start..start + size) {
                for chunk in block.chunks_mut(4) {
                    let word = self.regs.read_u32(offset::BUFFER).to_le_bytes();
                    chunk.copy_from_slice(&word[..chunk.len()]);
                }
            }
        }
    }

    /// Moves one block of the transmit buffer into the buffer data port.
    fn write_block(&mut self, cmd: &mut Command<'_>, block_size: u16) {
        let size = usize::from(block_size);
        let start = usize::from(self.block_index) * size;
        if let DataBuffer::Tx(buf) = &cmd.buffer {
            if let Some(block) = buf.get(start..start + size) {
                for chunk in block.chunks(4) {
                    let mut word = [0u8; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    self.regs.write_u32(offset::BUFFER, u32::from_le_bytes(word));
                }
            }
        }
    }

    /// Ends the command in flight.
    fn finish(&mut self, cmd: &mut Command<'_>) {
        let failed = self.phase == Phase::Failed;
        let residual = self.pending_events();
        if !residual.is_empty() {
            self.clear_events(residual);
        }

        if let Some(active) = self.active.take() {
            if failed {
                self.reset_lines(SoftwareReset::CMD | SoftwareReset::DATA);
            } else if active.index == commands::CMD0
                || (active.index == commands::CMD6 && active.arg & (1 << 31) != 0 && !active.op.busy)
            {
                let us = self.cycles_to_us(timing::SWITCH_CYCLES);
                self.delay.delay_us(us);
            }

            if active.dma && active.op.direction == DataDirection::Rx {
                let (addr, len) = active.region;
                self.regs.invalidate_dcache(addr, len);
            }

            self.state = if failed && active.index != commands::CMD12 {
                HostState::Error
            } else {
                HostState::Locked
            };
        } else {
            self.state = HostState::Error;
            cmd.status = Err(Error::State);
        }

        self.phase = Phase::Idle;
        self.block_index = 0;
    }

    /// Aborts the command in flight, or acknowledges a failed one.
    pub fn cancel(&mut self, cmd: &mut Command<'_>) -> Result<(), Error> {
        match self.state {
            HostState::Error => {
                self.state = HostState::Locked;
                return Ok(());
            }
            HostState::Command => {}
            _ => return Err(Error::State),
        }

        let has_data = self.active.map_or(false, |active| active.op.has_data());
        self.active = None;
        self.phase = Phase::Idle;
        self.block_index = 0;
        self.state = HostState::Locked;

        if has_data {
            if self.present_state().contains(PresentState::CMD_INHIBIT) {
                self.reset_lines(SoftwareReset::CMD);
            }
            let mut stop = Command::new(
                commands::CMD12,
                0,
                CmdOp::send(ResponseType::R1).stop().busy(),
            );
            if self.issue(&mut stop).is_ok() {
                for _ in 0..Self::CANCEL_TIMEOUT_US / Self::CANCEL_POLL_US {
                    self.process_events(&mut stop);
                    if self.state != HostState::Command {
                        break;
                    }
                    self.delay.delay_us(Self::CANCEL_POLL_US);
                }
            }
        }

        self.reset_lines(SoftwareReset::CMD | SoftwareReset::DATA);
        cmd.status = Err(Error::UserCancel);
        self.active = None;
        self.phase = Phase::Idle;
        self.block_index = 0;
        self.state = HostState::Locked;
        Ok(())
    }

    /// Issues `cmd` and polls it to completion.
    ///
    /// After `COMMAND_TIMEOUT_MS` the command is cancelled and reported as
    /// not responding.
    pub fn send(&mut self, cmd: &mut Command<'_>) -> Result<Outcome, Error> {
        self.issue(cmd)?;

        let polls = (Config::COMMAND_TIMEOUT_MS.saturating_mul(1000) / Config::COMMAND_POLL_US.max(1)).max(1);
        for _ in 0..polls {
            self.process_events(cmd);
            if self.state != HostState::Command {
                return cmd.status;
            }
            self.delay.delay_us(Config::COMMAND_POLL_US);
        }

        error!("CMD{} timed out", cmd.index);
        self.cancel(cmd)?;
        cmd.status = Err(Error::NoResponse);
        Err(Error::NoResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DefaultSdMmcHostConfig,
        sim::{CacheOp, NoDelay, SimCardKind, SimHost},
    };

    type SimEngine = Engine<SimHost, NoDelay, DefaultSdMmcHostConfig>;

    fn started() -> SimEngine {
        let mut engine = SimEngine::new(SimHost::new(SimCardKind::SdHc), NoDelay);
        engine.start().unwrap();
        engine
    }

    fn status_cmd() -> Command<'static> {
        Command::new(commands::CMD13, 0, CmdOp::send(ResponseType::R1))
    }

    #[test]
    fn start_programs_identification_clock() {
        let mut engine = started();
        assert_eq!(engine.state(), HostState::Idle);
        assert_eq!(engine.device_clock(), 400_000);
        assert_eq!(engine.bus_width(), BusWidth::One);

        let ccr = ClockControl::from_bits_retain(engine.registers().read_u16(offset::CLOCK_CONTROL));
        assert_eq!(ccr.divider(), 125);
        assert!(ccr.contains(ClockControl::SD_CLOCK_ENABLE));
    }

    #[test]
    fn clock_rounds_to_nearest_divider() {
        let mut engine = started();
        assert_eq!(engine.set_clock(30_000_000), Ok(Outcome::Changed));
        assert_eq!(engine.device_clock(), 25_000_000);
        assert_eq!(engine.set_clock(50_000_000), Ok(Outcome::Done));
        assert_eq!(engine.device_clock(), 50_000_000);
        assert_eq!(engine.set_clock(0), Err(Error::Param));
    }

    #[test]
    fn issue_refused_when_off() {
        let mut engine = SimEngine::new(SimHost::new(SimCardKind::SdHc), NoDelay);
        let accesses = engine.registers().accesses;
        assert_eq!(engine.issue(&mut status_cmd()), Err(Error::State));
        assert_eq!(engine.registers().accesses, accesses);
    }

    #[test]
    fn second_issue_is_busy() {
        let mut engine = started();
        let mut first = status_cmd();
        engine.issue(&mut first).unwrap();
        assert_eq!(engine.state(), HostState::Command);

        let accesses = engine.registers().accesses;
        let mut second = status_cmd();
        assert_eq!(engine.issue(&mut second), Err(Error::Busy));
        assert_eq!(engine.registers().accesses, accesses);

        engine.process_events(&mut first);
        assert_eq!(engine.state(), HostState::Locked);
        assert_eq!(first.status, Ok(Outcome::Done));
        assert!(CardStatus::from_response(first.r1()).contains(CardStatus::READY_FOR_DATA));
    }

    #[test]
    fn missing_response_is_no_response() {
        let mut engine = started();
        let mut cmd = Command::new(commands::CMD5, 0, CmdOp::send(ResponseType::R4).io());
        assert_eq!(engine.send(&mut cmd), Err(Error::NoResponse));
        assert_eq!(engine.state(), HostState::Error);
        assert!(engine.send(&mut status_cmd()).is_ok());
        assert_eq!(engine.state(), HostState::Locked);
    }

    #[test]
    fn data_error_then_acknowledge() {
        let mut engine = started();
        engine.registers().fail_data = Some(Interrupt::DATA_CRC);

        let mut buf = [0u8; 512];
        let mut read = Command::new(commands::CMD17, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut buf, 512, 1);
        assert_eq!(engine.send(&mut read), Err(Error::Io));
        assert_eq!(engine.state(), HostState::Error);

        let accesses = engine.registers().accesses;
        assert_eq!(engine.cancel(&mut read), Ok(()));
        assert_eq!(engine.state(), HostState::Locked);
        assert_eq!(engine.registers().accesses, accesses);
        assert_eq!(engine.cancel(&mut read), Err(Error::State));

        let mut again = Command::new(commands::CMD17, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut buf, 512, 1);
        assert_eq!(engine.send(&mut again), Ok(Outcome::Done));
    }

    #[test]
    fn multi_block_read_with_auto_stop() {
        let mut engine = started();
        let mut buf = [0xAAu8; 1024];
        let mut read = Command::new(commands::CMD18, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut buf, 512, 2);
        assert_eq!(engine.send(&mut read), Ok(Outcome::Done));
        assert!(buf.iter().all(|&byte| byte == 0));

        let mode = engine.registers().read_u16(offset::TRANSFER_MODE);
        assert!(TransferMode::from_bits_retain(mode).contains(TransferMode::AUTO_CMD12));
        assert_eq!(engine.registers().commands(commands::CMD18), [(commands::CMD18, 0, 2)]);
    }

    #[test]
    fn cancel_in_flight_read_stops_transmission() {
        let mut engine = started();
        let mut buf = [0u8; 1024];
        let mut read = Command::new(commands::CMD18, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut buf, 512, 2);
        engine.issue(&mut read).unwrap();
        assert_eq!(engine.cancel(&mut read), Ok(()));
        assert_eq!(read.status, Err(Error::UserCancel));
        assert_eq!(engine.state(), HostState::Locked);
        assert_eq!(engine.registers().commands(commands::CMD12).len(), 1);
    }

    #[test]
    fn invalid_data_commands() {
        let mut engine = started();
        let mut buf = [0u8; 512];
        let mut short = Command::new(commands::CMD18, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut buf, 512, 2);
        assert_eq!(engine.issue(&mut short), Err(Error::Param));

        let mut stop = Command::new(commands::CMD13, 0, CmdOp::send(ResponseType::R1).stop());
        assert_eq!(engine.issue(&mut stop), Err(Error::Param));
    }

    #[test]
    fn busy_response_read_once() {
        let mut engine = started();
        engine.registers().response_reads = 0;
        let mut cmd = Command::new(commands::CMD13, 0, CmdOp::send(ResponseType::R1).busy());
        assert_eq!(engine.send(&mut cmd), Ok(Outcome::Done));
        assert_eq!(engine.registers().response_reads, 1);
        assert!(CardStatus::from_response(cmd.r1()).contains(CardStatus::READY_FOR_DATA));
    }

    fn hc2(engine: &mut SimEngine) -> HostControl2 {
        HostControl2::from_bits_retain(engine.registers().read_u16(offset::HOST_CONTROL2))
    }

    #[test]
    fn tuning_selects_sampling_clock() {
        let mut engine = started();
        engine.registers().tuning_rounds = 3;
        assert_eq!(engine.tune(), Err(Error::Param));
        assert!(engine.registers().commands(commands::CMD19).is_empty());

        engine.set_bus_width(BusWidth::Four).unwrap();
        assert_eq!(engine.tune(), Ok(()));
        assert_eq!(engine.state(), HostState::Locked);
        let hc2 = hc2(&mut engine);
        assert!(hc2.contains(HostControl2::SAMPLING_CLOCK_SELECT));
        assert!(!hc2.contains(HostControl2::EXECUTE_TUNING));
        assert_eq!(engine.registers().commands(commands::CMD19), [(commands::CMD19, 0, 1); 3]);
        assert_eq!(engine.registers().read_u16(offset::BLOCK_SIZE), 64);
    }

    #[test]
    fn hs200_tunes_with_cmd21() {
        let mut engine = SimEngine::new(SimHost::uhs(), NoDelay);
        engine.start().unwrap();
        engine.set_bus_width(BusWidth::Four).unwrap();
        engine.set_timing(TimingMode::MmcHs200, false).unwrap();
        assert_eq!(engine.tune(), Ok(()));
        assert_eq!(engine.registers().commands(commands::CMD21), [(commands::CMD21, 0, 1)]);
    }

    #[test]
    fn tuning_gives_up_after_forty_rounds() {
        let mut engine = started();
        engine.registers().tuning_rounds = 100;
        engine.set_bus_width(BusWidth::Four).unwrap();
        assert_eq!(engine.tune(), Err(Error::General));
        assert_eq!(engine.registers().commands(commands::CMD19).len(), 40);
        let hc2 = hc2(&mut engine);
        assert!(!hc2.intersects(HostControl2::EXECUTE_TUNING | HostControl2::SAMPLING_CLOCK_SELECT));
        assert_eq!(engine.state(), HostState::Locked);
        assert!(engine.send(&mut status_cmd()).is_ok());
    }

    #[test]
    fn tuning_without_sampling_clock_fails() {
        let mut engine = started();
        engine.registers().tuning_locks = false;
        engine.set_bus_width(BusWidth::Four).unwrap();
        assert_eq!(engine.tune(), Err(Error::General));
        assert_eq!(engine.registers().commands(commands::CMD19).len(), 1);
    }

    #[test]
    fn sdr50_clock_runs_tuning() {
        let mut engine = SimEngine::new(SimHost::uhs(), NoDelay);
        engine.start().unwrap();
        engine.set_bus_width(BusWidth::Four).unwrap();
        engine.set_timing(TimingMode::SdSdr50, false).unwrap();
        assert_eq!(engine.set_clock(100_000_000), Ok(Outcome::Done));
        assert_eq!(engine.registers().commands(commands::CMD19), [(commands::CMD19, 0, 1)]);
        assert_eq!(engine.set_clock(50_000_000), Ok(Outcome::Done));
        assert_eq!(engine.registers().commands(commands::CMD19).len(), 1);
    }

    #[test]
    fn adma_moves_blocks_through_descriptors() {
        let mut engine = started();
        engine.registers().dma = true;
        let data: Vec<u8> = (0..1536u32).map(|i| (i % 251) as u8).collect();
        let mut write = Command::new(commands::CMD25, 7, CmdOp::send(ResponseType::R1))
            .with_tx(&data, 512, 3);
        assert_eq!(engine.send(&mut write), Ok(Outcome::Done));

        let mode = TransferMode::from_bits_retain(engine.registers().read_u16(offset::TRANSFER_MODE));
        assert!(mode.contains(TransferMode::DMA_ENABLE | TransferMode::AUTO_CMD12));
        assert_ne!(engine.registers().read_u32(offset::ADMA_ADDRESS), 0);
        assert_eq!(engine.registers().adma_lines.len(), 1);
        assert_eq!(engine.registers().adma_lines[0].1, 1536);
        assert_eq!(engine.registers().cache_ops, [CacheOp::Clean(1536)]);

        let mut buf = vec![0u8; 1536];
        let mut read = Command::new(commands::CMD18, 7, CmdOp::send(ResponseType::R1))
            .with_rx(&mut buf, 512, 3);
        assert_eq!(engine.send(&mut read), Ok(Outcome::Done));
        assert_eq!(engine.registers().cache_ops.last(), Some(&CacheOp::Invalidate(1536)));
        assert_eq!(buf, data);
    }

    #[test]
    fn adma_splits_long_transfers() {
        let mut engine = started();
        engine.registers().dma = true;
        let data = vec![0xA5u8; 200 * 512];
        let mut write = Command::new(commands::CMD25, 0, CmdOp::send(ResponseType::R1))
            .with_tx(&data, 512, 200);
        assert_eq!(engine.send(&mut write), Ok(Outcome::Done));

        let lines = engine.registers().adma_lines.clone();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, 65536);
        assert_eq!(lines[1], (lines[0].0 + 65536, 200 * 512 - 65536));
    }

    #[test]
    fn timing_support_and_power() {
        let mut engine = started();
        assert!(engine.is_timing_supported(TimingMode::SdHs));
        assert!(engine.is_timing_supported(TimingMode::MmcHsSdr));
        assert!(!engine.is_timing_supported(TimingMode::SdSdr50));
        assert!(!engine.is_timing_supported(TimingMode::MmcHs200));
        assert_eq!(engine.set_bus_width(BusWidth::Eight), Err(Error::Param));
        assert_eq!(engine.power(PowerMode::LowIo), Err(Error::Param));

        engine.power(PowerMode::Off).unwrap();
        assert_eq!(engine.state(), HostState::Off);
        assert_eq!(engine.device_clock(), 0);
    }
}
