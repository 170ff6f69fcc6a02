//! Block transfers on an identified memory device.

use crate::{
    command::DataBuffer,
    config::SdMmcHostConfig,
    consts::MAX_BLOCKS_PER_TRANSFER,
    device::Device,
    engine::{Delay, TransferPolicy},
    regs::SdhcRegisters,
    response::{CardState, CardStatus},
    Error,
};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};
#[cfg(feature = "log")]
use log::{debug, warn};

/// Error reported by the status of a STOP_TRANSMISSION.
fn stop_status_error(status: CardStatus) -> Option<Error> {
    if status.intersects(CardStatus::STATE_ERRORS) {
        Some(Error::State)
    } else if status.intersects(CardStatus::IO_ERRORS) {
        Some(Error::Io)
    } else if status.intersects(CardStatus::PARAM_ERRORS) {
        Some(Error::Param)
    } else if status.contains(CardStatus::CC_ERROR) {
        Some(Error::General)
    } else {
        None
    }
}

/// Fails when `status` carries an exception of `mask`.
fn check_status(status: CardStatus, mask: CardStatus) -> Result<(), Error> {
    let exceptions = status.exceptions(mask);
    if exceptions.is_empty() {
        Ok(())
    } else {
        warn!("Card status exceptions {:08X}", exceptions.bits());
        Err(Error::General)
    }
}

impl<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> Device<Regs, D, Config> {
    /// STOP_TRANSMISSION attempts.
    const STOP_ROUNDS: usize = 9;
    /// Status checks after each STOP_TRANSMISSION.
    const STOP_CHECKS: usize = 6;
    const STOP_CHECK_MS: u32 = 5;
    /// Status checks waiting for the transfer state.
    const READY_ROUNDS: usize = 51;
    const READY_POLL_MS: u32 = 10;

    /// Checks that `count` blocks starting at `lba` fit the device and `len`.
    fn validate_transfer(&self, lba: u32, count: u32, len: usize) -> Result<usize, Error> {
        if !self.card.card_type.has_memory() {
            return Err(Error::NotInitialized);
        }
        let block_size = usize::from(self.card.block_size);
        let needed = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(block_size))
            .ok_or(Error::Param)?;
        let end = lba.checked_add(count).ok_or(Error::Param)?;
        if count == 0 || len < needed || (self.card.block_count != 0 && end > self.card.block_count) {
            return Err(Error::Param);
        }
        Ok(block_size)
    }

    /// Reads `count` blocks starting at `lba` into `buf`.
    pub fn read_blocks(&mut self, lba: u32, buf: &mut [u8], count: u32) -> Result<(), Error> {
        let block_size = self.validate_transfer(lba, count, buf.len())?;
        let mut done = 0;
        while done < count {
            let mut chunk = (count - done).min(MAX_BLOCKS_PER_TRANSFER) as u16;
            let start = done as usize * block_size;
            let data = &mut buf[start..start + usize::from(chunk) * block_size];
            if chunk == 1 {
                self.single_transfer(lba + done, DataBuffer::Rx(data))?;
            } else {
                self.multi_transfer(lba + done, &mut chunk, DataBuffer::Rx(data))?;
            }
            done += u32::from(chunk);
        }
        Ok(())
    }

    /// Writes `count` blocks from `buf` starting at `lba`.
    pub fn write_blocks(&mut self, lba: u32, buf: &[u8], count: u32) -> Result<(), Error> {
        let block_size = self.validate_transfer(lba, count, buf.len())?;
        let mut done = 0;
        while done < count {
            let mut chunk = (count - done).min(MAX_BLOCKS_PER_TRANSFER) as u16;
            let start = done as usize * block_size;
            let data = &buf[start..start + usize::from(chunk) * block_size];
            if chunk == 1 {
                self.single_transfer(lba + done, DataBuffer::Tx(data))?;
            } else {
                self.multi_transfer(lba + done, &mut chunk, DataBuffer::Tx(data))?;
            }
            done += u32::from(chunk);
        }
        Ok(())
    }

    /// Reads block by block with READ_SINGLE_BLOCK.
    pub fn read_blocks_single(&mut self, lba: u32, buf: &mut [u8], count: u32) -> Result<(), Error> {
        let block_size = self.validate_transfer(lba, count, buf.len())?;
        for (i, block) in buf.chunks_exact_mut(block_size).take(count as usize).enumerate() {
            self.single_transfer(lba + i as u32, DataBuffer::Rx(block))?;
        }
        Ok(())
    }

    /// Writes block by block with WRITE_BLOCK.
    pub fn write_blocks_single(&mut self, lba: u32, buf: &[u8], count: u32) -> Result<(), Error> {
        let block_size = self.validate_transfer(lba, count, buf.len())?;
        for (i, block) in buf.chunks_exact(block_size).take(count as usize).enumerate() {
            self.single_transfer(lba + i as u32, DataBuffer::Tx(block))?;
        }
        Ok(())
    }

    /// One READ_SINGLE_BLOCK or WRITE_BLOCK.
    ///
    /// On failure the card is brought back to the transfer state and the
    /// original error is returned.
    fn single_transfer(&mut self, lba: u32, data: DataBuffer<'_>) -> Result<(), Error> {
        let addr = self.card.data_address(lba)?;
        let result = match data {
            DataBuffer::Rx(buf) => self
                .cmd17(buf, addr)
                .and_then(|status| check_status(status, CardStatus::READ_ERRORS)),
            DataBuffer::Tx(buf) => self
                .cmd24(buf, addr)
                .and_then(|status| check_status(status, CardStatus::WRITE_ERRORS)),
            DataBuffer::None => return Err(Error::Param),
        };

        if let Err(err) = result {
            warn!("Block {} transfer failed: {:?}", lba, err);
            let recovered = self.cmd13().and_then(|status| self.wait_ready_from(status));
            if let Err(status) = recovered {
                self.card.status = Some(status);
            }
            return Err(err);
        }
        Ok(())
    }

    /// One READ_MULTIPLE_BLOCK or WRITE_MULTIPLE_BLOCK of `count` blocks.
    ///
    /// `count` is lowered when the engine moved fewer blocks.
    fn multi_transfer(&mut self, lba: u32, count: &mut u16, data: DataBuffer<'_>) -> Result<(), Error> {
        let addr = self.card.data_address(lba)?;
        let write = matches!(data, DataBuffer::Tx(_));

        let mut result = Ok(());
        if self.engine.policy() == TransferPolicy::Manual && self.card.set_block_count {
            result = self.cmd23(write, *count).map(|_| ());
        }
        if result.is_ok() {
            let (sent, mask) = match data {
                DataBuffer::Rx(buf) => (self.cmd18(buf, addr, count), CardStatus::READ_ERRORS),
                DataBuffer::Tx(buf) => (self.cmd25(buf, addr, count), CardStatus::WRITE_ERRORS),
                DataBuffer::None => return Err(Error::Param),
            };
            result = sent.and_then(|status| {
                let stopped = if self.card.stop_required {
                    self.stop_cmd()
                } else {
                    Ok(())
                };
                check_status(status, mask).and(stopped)
            });
        }

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Blocks {}+{} transfer failed: {:?}", lba, *count, err);
                Err(self.recover_multi(err))
            }
        }
    }

    /// Leaves a failed multi-block transfer, returns the error to report.
    ///
    /// A failing SEND_STATUS or STOP_TRANSMISSION ends the recovery; it is
    /// kept as the device status while the transfer error is returned.
    fn recover_multi(&mut self, err: Error) -> Error {
        let mut reported = err;
        let mut status = match self.cmd13() {
            Ok(status) => status,
            Err(status_err) => {
                self.card.status = Some(status_err);
                return reported;
            }
        };

        if matches!(status.state(), CardState::Data | CardState::Receive) {
            let stopped = match self.cmd12() {
                Ok(stop) => {
                    if let Some(stop_err) = stop_status_error(stop) {
                        reported = stop_err;
                    }
                    Ok(stop)
                }
                Err(Error::NoResponse) => self.cmd13(),
                Err(stop_err) => Err(stop_err),
            };
            match stopped {
                Ok(last) => status = last,
                Err(stop_err) => {
                    self.card.status = Some(stop_err);
                    return reported;
                }
            }
        }

        if let Err(ready_err) = self.wait_ready_from(status) {
            self.card.status = Some(ready_err);
        }
        reported
    }

    /// Stops an open-ended transfer and waits for the transfer state.
    pub fn stop_cmd(&mut self) -> Result<(), Error> {
        for _ in 0..Self::STOP_ROUNDS {
            self.cmd12()?;

            let mut status = CardStatus::empty();
            for _ in 0..Self::STOP_CHECKS {
                self.engine.delay_ms(Self::STOP_CHECK_MS);
                status = self.cmd13()?;
                if status.is_ready() || status.state() == CardState::Receive {
                    break;
                }
            }

            match status.state() {
                CardState::Receive => debug!("Card still receiving, stopping again"),
                CardState::Idle
                | CardState::Ready
                | CardState::Ident
                | CardState::Standby
                | CardState::Disconnect => return Err(Error::NotInitialized),
                CardState::Transfer if status.contains(CardStatus::READY_FOR_DATA) => return Ok(()),
                _ => return Err(Error::State),
            }
        }
        Err(Error::State)
    }

    /// Polls the card status until it is ready in the transfer state.
    pub fn wait_until_ready(&mut self) -> Result<(), Error> {
        let status = self.cmd13()?;
        self.wait_ready_from(status)
    }

    /// Same as [`Device::wait_until_ready`], starting from a status already
    /// at hand.
    fn wait_ready_from(&mut self, mut status: CardStatus) -> Result<(), Error> {
        for _ in 0..Self::READY_ROUNDS {
            match status.state() {
                CardState::Transfer if status.contains(CardStatus::READY_FOR_DATA) => return Ok(()),
                CardState::Transfer | CardState::Program | CardState::Data | CardState::Receive => {}
                _ => return Err(Error::NotInitialized),
            }
            self.engine.delay_ms(Self::READY_POLL_MS);
            status = self.cmd13()?;
        }
        Err(Error::Busy)
    }
}
