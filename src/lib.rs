//! SD/MMC/SDIO Library for SD Host Controllers written in Embedded Rust.
//!
//! This crate drives one slot of an SD Host Controller Specification compliant
//! peripheral: it identifies SD, MMC/eMMC and SDIO devices, negotiates the bus
//! width, timing mode and clock, and moves blocks with PIO or ADMA2.
//!
//! [`SdMmcHost`] is the entry point and implements [`DiskioDevice`]. The lower
//! layers ([`Device`], [`Engine`]) stay public for platforms that drive the
//! controller from an interrupt handler.

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("features `log` and `defmt-log` are mutually exclusive");
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
compile_error!("one of the features `log` or `defmt-log` must be enabled");

mod adma;
mod card;
mod cid;
mod cmds;
mod command;
mod config;
mod consts;
mod csd;
mod device;
mod engine;
mod ext_csd;
mod field;
mod identify;
mod regs;
mod response;
mod scr;
#[cfg(test)]
mod sim;
mod ssr;
mod switch;
mod transfer;

pub use crate::{
    adma::DescTable,
    card::{BusWidth, Card, CardType, SignalLevel, TimingMode},
    cid::Cid,
    command::{CmdOp, Command, DataBuffer, DataDirection, ResponseType},
    config::{DefaultSdMmcHostConfig, SdMmcHostConfig},
    consts::BLOCK_SIZE,
    csd::{CapacityProvider, Csd},
    device::Device,
    engine::{Delay, Engine, HostState, PowerMode, TransferPolicy},
    ext_csd::ExtCsd,
    regs::{
        offset, Capabilities, ClockControl, HostControl1, HostControl2, Interrupt, PowerControl,
        PresentState, SdhcRegisters,
    },
    response::{CardState, CardStatus},
    scr::Scr,
    ssr::Ssr,
    switch::SwitchStatus,
};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use core::{cell::RefCell, fmt};
use size::Size;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{error, info, warn};
#[cfg(feature = "log")]
use log::{error, info, warn};

/// Driver status code.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The controller is held by another user.
    Locked,
    /// A command is in flight, or the device never got ready.
    Busy,
    /// The device did not answer.
    NoResponse,
    /// Unclassified failure.
    General,
    /// CRC, end bit or data timeout on the bus.
    Io,
    /// The device flagged an error in its response.
    Response,
    /// The device is absent or left the identification states.
    NotInitialized,
    /// Invalid argument.
    Param,
    /// Operation not allowed in the current state.
    State,
    /// The command was cancelled.
    UserCancel,
    /// Operation not supported by the host or the device.
    NotSupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::Locked => "controller locked",
            Error::Busy => "busy",
            Error::NoResponse => "no response",
            Error::General => "general failure",
            Error::Io => "bus I/O error",
            Error::Response => "error in device response",
            Error::NotInitialized => "device not initialized",
            Error::Param => "invalid parameter",
            Error::State => "invalid state",
            Error::UserCancel => "cancelled",
            Error::NotSupported => "not supported",
        };
        f.write_str(text)
    }
}

/// Successful completion, possibly with adjusted parameters.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Done, but with a parameter the driver had to change, such as the
    /// achieved clock or a shortened block count.
    Changed,
}

/// [`SdMmcHost`] hardware error.
///
/// `S` - power switch error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError<S> {
    /// Error from the driver stack.
    Device(Error),
    /// Couldn't switch the slot power.
    PowerSwitch(S),
}

impl<S> From<Error> for HostError<S> {
    fn from(err: Error) -> Self {
        HostError::Device(err)
    }
}

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD/MMC host driver of one controller slot.
///
/// `Regs` - controller registers.
/// `D` - blocking delay.
/// `P` - slot power output switch.
/// `Config` - Config implementation of driver config trait.
pub struct SdMmcHost<Regs: SdhcRegisters, D: Delay, P: OutputSwitch, Config: SdMmcHostConfig> {
    device: RefCell<Device<Regs, D, Config>>,
    power: RefCell<P>,
    status: Status,
}

impl<Regs: SdhcRegisters, D: Delay, P: OutputSwitch, Config: SdMmcHostConfig>
    SdMmcHost<Regs, D, P, Config>
where
    P::Error: fmt::Debug,
{
    /// Slot power off period of a power cycle.
    const POWER_CYCLE_MS: u32 = 100;

    /// Creates a new [`SdMmcHost<Regs, D, P, Config>`].
    ///
    /// `regs` - controller registers.
    /// `delay` - blocking delay.
    /// `power` - slot power output switch.
    pub fn new(regs: Regs, delay: D, power: P) -> Self {
        SdMmcHost {
            device: RefCell::new(Device::new(regs, delay)),
            power: RefCell::new(power),
            status: StatusFlag::NotInitialized.into(),
        }
    }

    /// Runs `f` with exclusive access to the slot.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut Device<Regs, D, Config>) -> R) -> R {
        f(&mut self.device.borrow_mut())
    }

    /// Validate buffer for read/write.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Validate initialized.
    fn validate_initialized(&self) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            Err(DiskioError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Get count of blocks in buffer.
    fn get_block_count(buf_len: usize) -> u32 {
        (buf_len / BLOCK_SIZE) as u32
    }

    /// Convert lba.
    fn convert_lba(lba: Lba) -> Result<u32, DiskioError<ErrorFor<Self>>> {
        u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)
    }

    /// Switches the slot power off and on again.
    fn power_cycle(&self) -> Result<(), ErrorFor<Self>> {
        let mut power = self.power.borrow_mut();
        power.off().map_err(HostError::PowerSwitch)?;
        self.device
            .borrow_mut()
            .engine_mut()
            .delay_ms(Self::POWER_CYCLE_MS);
        power.on().map_err(HostError::PowerSwitch)
    }

    /// Power cycles the slot, then identifies the device.
    pub fn identify(&mut self) -> Result<(), ErrorFor<Self>> {
        self.power_cycle()?;
        let mut device = self.device.borrow_mut();
        device.start()?;
        device.identify()?;
        Ok(())
    }

    /// Reads `count` blocks starting at `lba`.
    pub fn read_blocks(&self, lba: u32, buf: &mut [u8], count: u32) -> Result<(), Error> {
        self.device.borrow_mut().read_blocks(lba, buf, count)
    }

    /// Writes `count` blocks starting at `lba`.
    pub fn write_blocks(&self, lba: u32, buf: &[u8], count: u32) -> Result<(), Error> {
        self.device.borrow_mut().write_blocks(lba, buf, count)
    }

    /// Last unrecovered error of the device, see [`Device::status`].
    pub fn device_status(&self) -> Result<(), Error> {
        self.device.borrow_mut().status()
    }

    /// Number of blocks of the device.
    pub fn capacity_blocks(&self) -> u32 {
        self.device.borrow().card().block_count
    }

    /// Capacity of the device.
    pub fn capacity(&self) -> Size {
        let card = self.device.borrow();
        Size::from_bytes(u64::from(card.card().block_count) * u64::from(card.card().block_size))
    }

    /// Whether the device refuses writes.
    pub fn write_protect(&self) -> bool {
        self.device.borrow_mut().write_protected()
    }

    /// Initialize SD/MMC.
    fn init(&mut self) -> Result<(), ErrorFor<Self>> {
        info!("SD initialize started");

        let mut result = self.identify();

        self.status = match &result {
            Ok(_) => {
                info!(
                    "SD successfully initialized, type: {:?}, capacity: {} KiB",
                    self.device.borrow().card().card_type,
                    self.device.borrow().card().total_size_kib()
                );
                Status::default()
            }
            Err(HostError::Device(err)) => {
                error!("Failed to initialize SD: {}", err);
                result = Err(HostError::Device(Error::NotInitialized));
                StatusFlag::ErrorOccured | StatusFlag::NotInitialized
            }
            Err(HostError::PowerSwitch(_)) => {
                error!("Failed to initialize SD: slot power switch failed");
                StatusFlag::ErrorOccured | StatusFlag::NotInitialized
            }
        };

        result
    }
}

impl<Regs: SdhcRegisters, D: Delay, P: OutputSwitch, Config: SdMmcHostConfig> DiskioDevice
    for SdMmcHost<Regs, D, P, Config>
where
    P::Error: fmt::Debug,
{
    type HardwareError = HostError<P::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.device.borrow_mut().reset();
        self.status = StatusFlag::NotInitialized.into();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        self.init().map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        let block_count = Self::get_block_count(buf.len());
        let lba = Self::convert_lba(lba)?;

        self.read_blocks(lba, buf, block_count)
            .map_err(|err| DiskioError::Hardware(HostError::Device(err)))
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        let block_count = Self::get_block_count(buf.len());
        let lba = Self::convert_lba(lba)?;

        self.write_blocks(lba, buf, block_count)
            .map_err(|err| DiskioError::Hardware(HostError::Device(err)))
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {
                self.validate_initialized()?;
                self.device
                    .borrow_mut()
                    .wait_until_ready()
                    .map_err(|err| DiskioError::Hardware(HostError::Device(err)))
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
