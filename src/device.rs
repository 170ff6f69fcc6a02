//! Per-slot device context: the engine plus the card model.

use crate::{
    card::{BusWidth, Card, TimingMode},
    command::Command,
    config::SdMmcHostConfig,
    engine::{Delay, Engine, HostState, PowerMode, TransferPolicy},
    regs::SdhcRegisters,
    Error, Outcome,
};

#[cfg(feature = "defmt-log")]
use defmt::info;
#[cfg(feature = "log")]
use log::info;

/// One slot: controller engine and everything known about its device.
///
/// `Regs` - controller registers.
/// `D` - blocking delay.
/// `Config` - config implementation.
pub struct Device<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> {
    pub(crate) engine: Engine<Regs, D, Config>,
    pub(crate) card: Card,
}

impl<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> Device<Regs, D, Config> {
    /// Creates a new [`Device`], slot powered off and no card known.
    pub fn new(regs: Regs, delay: D) -> Self {
        Device {
            engine: Engine::new(regs, delay),
            card: Card::default(),
        }
    }

    pub fn engine(&self) -> &Engine<Regs, D, Config> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<Regs, D, Config> {
        &mut self.engine
    }

    pub fn card(&self) -> &Card {
        &self.card
    }

    /// Powers the slot off, on at 3.3V or on at 1.8V I/O.
    pub fn power(&mut self, mode: PowerMode) -> Result<(), Error> {
        self.engine.power(mode)?;
        if mode == PowerMode::Off {
            self.card.reset();
        }
        self.card.timing = self.engine.timing();
        Ok(())
    }

    /// Unplugs the device and forgets it.
    pub fn reset(&mut self) {
        info!("SD/MMC device reset");
        self.engine.unplug();
        self.card.reset();
    }

    pub fn bus_width(&self) -> BusWidth {
        self.engine.bus_width()
    }

    pub fn set_bus_width(&mut self, width: BusWidth) -> Result<(), Error> {
        self.engine.set_bus_width(width)?;
        self.card.bus_width = width;
        Ok(())
    }

    pub fn timing(&self) -> TimingMode {
        self.engine.timing()
    }

    /// Programs a host timing mode, checking the lines after a signaling switch.
    pub fn set_timing(&mut self, mode: TimingMode) -> Result<(), Error> {
        self.engine.set_timing(mode, true)?;
        self.card.timing = mode;
        Ok(())
    }

    /// Programs the device clock, see [`Engine::set_clock`].
    pub fn set_clock(&mut self, freq: u32) -> Result<Outcome, Error> {
        let outcome = self.engine.set_clock(freq)?;
        self.card.clock_hz = self.engine.device_clock();
        Ok(outcome)
    }

    /// Selects how multi-block transfers are framed.
    pub fn set_transfer_policy(&mut self, policy: TransferPolicy) {
        self.engine.set_policy(policy);
        self.card.stop_required = policy == TransferPolicy::Manual && !self.card.set_block_count;
    }

    /// Whether a command is in flight.
    pub fn is_busy(&self) -> bool {
        self.engine.state() == HostState::Command
    }

    /// Aborts `cmd`, see [`Engine::cancel`].
    pub fn cancel(&mut self, cmd: &mut Command<'_>) -> Result<(), Error> {
        self.engine.cancel(cmd)
    }

    pub fn card_present(&mut self) -> bool {
        self.engine.card_present()
    }

    /// Write protection from the slot switch or the CSD.
    pub fn write_protected(&mut self) -> bool {
        !self.engine.write_enabled() || self.card.write_protected()
    }

    /// Last unrecovered error of the device.
    pub fn status(&mut self) -> Result<(), Error> {
        if !self.card_present() {
            return Err(Error::NotSupported);
        }
        match self.card.status {
            None => Ok(()),
            Some(Error::NotSupported) => Err(Error::General),
            Some(err) => Err(err),
        }
    }
}
