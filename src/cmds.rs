//! SD, MMC and SDIO command encoders.
//!
//! Each encoder frames one bus command, runs it to completion through the
//! engine and decodes the reply into the card model.

use crate::{
    card::BusWidth,
    command::{CmdOp, Command, ResponseType},
    config::SdMmcHostConfig,
    consts::{commands, if_cond, ocr},
    device::Device,
    engine::Delay,
    ext_csd,
    regs::SdhcRegisters,
    response::{CardStatus, IoOcr, R5Response},
    switch, Error, Outcome,
};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};
#[cfg(feature = "log")]
use log::{debug, warn};

impl<Regs: SdhcRegisters, D: Delay, Config: SdMmcHostConfig> Device<Regs, D, Config> {
    /// Polling period of the OCR loops.
    pub(crate) const OCR_POLL_MS: u32 = 10;
    /// Attempts to find an RCA nobody else answers to.
    const MMC_RCA_ATTEMPTS: usize = 3;

    pub(crate) fn ocr_polls() -> u32 {
        (Config::OCR_TIMEOUT_MS / Self::OCR_POLL_MS).max(1)
    }

    fn rca_arg(&self) -> u32 {
        u32::from(self.card.rca) << 16
    }

    /// Runs a command to completion.
    pub(crate) fn run(&mut self, cmd: &mut Command<'_>) -> Result<Outcome, Error> {
        self.engine.send(cmd)
    }

    /// Runs an R1 command and returns the card status.
    fn run_r1(&mut self, index: u8, arg: u32, op: CmdOp) -> Result<CardStatus, Error> {
        let mut cmd = Command::new(index, arg, op);
        self.run(&mut cmd)?;
        Ok(CardStatus::from_response(cmd.r1()))
    }

    /// Sends the initialization clocks.
    pub fn power_on(&mut self) -> Result<(), Error> {
        let mut cmd = Command::new(commands::CMD0, 0, CmdOp::power_on());
        self.run(&mut cmd).map(|_| ())
    }

    /// GO_IDLE_STATE.
    pub fn cmd0(&mut self) -> Result<(), Error> {
        let mut cmd = Command::new(commands::CMD0, 0, CmdOp::send(ResponseType::R0));
        self.run(&mut cmd).map(|_| ())
    }

    /// SEND_OP_COND, polled until the device leaves its power up routine.
    pub fn cmd1(&mut self) -> Result<u32, Error> {
        let arg = ocr::MMC_ACCESS_SECTOR | Config::HOST_VDD_WINDOW;
        for _ in 0..Self::ocr_polls() {
            let mut cmd = Command::new(
                commands::CMD1,
                arg,
                CmdOp::send(ResponseType::R3).open_drain(),
            );
            self.run(&mut cmd)?;
            if cmd.r1() & ocr::BUSY_N != 0 {
                return Ok(cmd.r1());
            }
            self.engine.delay_ms(Self::OCR_POLL_MS);
        }
        Err(Error::Busy)
    }

    /// ALL_SEND_CID.
    pub fn cmd2(&mut self) -> Result<(), Error> {
        let mut cmd = Command::new(
            commands::CMD2,
            0,
            CmdOp::send(ResponseType::R2).open_drain(),
        );
        self.run(&mut cmd)?;
        self.card.cid = cmd.r2_bytes();
        Ok(())
    }

    /// SEND_RELATIVE_ADDR for SD and SDIO, SET_RELATIVE_ADDR for MMC.
    pub fn cmd3(&mut self) -> Result<(), Error> {
        if !self.card.card_type.is_mmc() {
            let mut cmd = Command::new(
                commands::CMD3,
                0,
                CmdOp::send(ResponseType::R6).open_drain(),
            );
            self.run(&mut cmd)?;
            self.card.rca = (cmd.r1() >> 16) as u16;
            return Ok(());
        }

        let mut result = Err(Error::General);
        for _ in 0..Self::MMC_RCA_ATTEMPTS {
            let rca = (u32::from(self.card.rca) + 1) & 0xFFFF;
            let rca = rca.max(2) as u16;
            let mut cmd = Command::new(
                commands::CMD3,
                u32::from(rca) << 16,
                CmdOp::send(ResponseType::R1).open_drain(),
            );
            result = self.run(&mut cmd).map(|_| ());
            self.card.rca = rca;
            if result.is_ok() {
                break;
            }
            warn!("RCA {:04X} rejected", rca);
        }
        result
    }

    /// IO_SEND_OP_COND.
    pub fn cmd5(&mut self, arg: u32) -> Result<IoOcr, Error> {
        let mut cmd = Command::new(
            commands::CMD5,
            arg,
            CmdOp::send(ResponseType::R4).io().open_drain(),
        );
        self.run(&mut cmd)?;
        Ok(IoOcr(cmd.r1()))
    }

    /// SD SWITCH_FUNC, the 64-byte status lands in the card switch scratch.
    pub fn sd_cmd6(&mut self, set: bool, groups: [u8; 6]) -> Result<CardStatus, Error> {
        let Device { engine, card } = self;
        let mut cmd = Command::new(
            commands::CMD6,
            switch::switch_argument(set, groups),
            CmdOp::send(ResponseType::R1),
        )
        .with_rx(&mut card.switch.0, 64, 1);
        engine.send(&mut cmd)?;
        Ok(CardStatus::from_response(cmd.r1()))
    }

    /// MMC SWITCH of one EXT_CSD byte.
    pub fn mmc_cmd6(&mut self, access: u8, index: u8, value: u8, cmd_set: u8) -> Result<CardStatus, Error> {
        let status = self.run_r1(
            commands::CMD6,
            ext_csd::switch_argument(access, index, value, cmd_set),
            CmdOp::send(ResponseType::R1).busy(),
        )?;
        if status.contains(CardStatus::SWITCH_ERROR) {
            warn!("MMC switch of EXT_CSD[{}] to {} rejected", index, value);
        }
        Ok(status)
    }

    /// SELECT/DESELECT_CARD, `rca` 0 deselects all.
    pub fn cmd7(&mut self, rca: u16) -> Result<(), Error> {
        let op = if rca != 0 {
            CmdOp::send(ResponseType::R1).busy()
        } else {
            CmdOp::send(ResponseType::R0)
        };
        let mut cmd = Command::new(commands::CMD7, u32::from(rca) << 16, op);
        self.run(&mut cmd).map(|_| ())
    }

    /// SD SEND_IF_COND.
    ///
    /// No response from a version 1 card is passed through as
    /// [`Error::NoResponse`]; a wrong echo is a [`Error::General`].
    pub fn sd_cmd8(&mut self, vhs: u8) -> Result<(), Error> {
        let arg = u32::from(vhs) << 8 | if_cond::CHECK_PATTERN;
        let mut cmd = Command::new(
            commands::CMD8,
            arg,
            CmdOp::send(ResponseType::R7).open_drain(),
        );
        self.run(&mut cmd)?;
        if cmd.r1() & if_cond::ECHO_MASK == arg {
            Ok(())
        } else {
            warn!("SEND_IF_COND echo {:08X} for {:08X}", cmd.r1(), arg);
            Err(Error::General)
        }
    }

    /// MMC SEND_EXT_CSD.
    pub fn mmc_cmd8(&mut self) -> Result<(), Error> {
        let Device { engine, card } = self;
        let mut cmd = Command::new(commands::CMD8, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut card.ext_csd.0, 512, 1);
        engine.send(&mut cmd).map(|_| ())
    }

    /// SEND_CSD.
    pub fn cmd9(&mut self) -> Result<(), Error> {
        let mut cmd = Command::new(commands::CMD9, self.rca_arg(), CmdOp::send(ResponseType::R2));
        self.run(&mut cmd)?;
        self.card.csd = cmd.r2_bytes();
        Ok(())
    }

    /// VOLTAGE_SWITCH.
    pub fn cmd11(&mut self) -> Result<CardStatus, Error> {
        self.run_r1(commands::CMD11, 0, CmdOp::send(ResponseType::R1))
    }

    /// STOP_TRANSMISSION.
    pub fn cmd12(&mut self) -> Result<CardStatus, Error> {
        self.run_r1(commands::CMD12, 0, CmdOp::send(ResponseType::R1).stop().busy())
    }

    /// SEND_STATUS.
    pub fn cmd13(&mut self) -> Result<CardStatus, Error> {
        self.run_r1(commands::CMD13, self.rca_arg(), CmdOp::send(ResponseType::R1))
    }

    /// BUSTEST_R, reads back the bus test pattern.
    pub fn cmd14(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let len = u16::try_from(buf.len()).map_err(|_| Error::Param)?;
        let mut cmd = Command::new(commands::CMD14, 0, CmdOp::send(ResponseType::R1)).with_rx(buf, len, 1);
        self.run(&mut cmd).map(|_| ())
    }

    /// BUSTEST_W, sends the bus test pattern.
    pub fn cmd19(&mut self, buf: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(buf.len()).map_err(|_| Error::Param)?;
        let mut cmd = Command::new(commands::CMD19, 0, CmdOp::send(ResponseType::R1)).with_tx(buf, len, 1);
        self.run(&mut cmd).map(|_| ())
    }

    /// SET_BLOCKLEN.
    pub fn cmd16(&mut self, len: u16) -> Result<CardStatus, Error> {
        self.run_r1(commands::CMD16, u32::from(len), CmdOp::send(ResponseType::R1))
    }

    /// READ_SINGLE_BLOCK.
    pub fn cmd17(&mut self, buf: &mut [u8], addr: u32) -> Result<CardStatus, Error> {
        let block_size = self.card.block_size;
        let mut cmd = Command::new(commands::CMD17, addr, CmdOp::send(ResponseType::R1))
            .with_rx(buf, block_size, 1);
        self.run(&mut cmd)?;
        Ok(CardStatus::from_response(cmd.r1()))
    }

    /// READ_MULTIPLE_BLOCK, `count` is lowered to what one transaction moved.
    pub fn cmd18(&mut self, buf: &mut [u8], addr: u32, count: &mut u16) -> Result<CardStatus, Error> {
        let block_size = self.card.block_size;
        let mut cmd = Command::new(commands::CMD18, addr, CmdOp::send(ResponseType::R1))
            .with_rx(buf, block_size, *count);
        let result = self.run(&mut cmd);
        *count = cmd.block_count;
        result?;
        Ok(CardStatus::from_response(cmd.r1()))
    }

    /// SET_BLOCK_COUNT.
    pub fn cmd23(&mut self, write: bool, blocks: u16) -> Result<CardStatus, Error> {
        let arg = u32::from(write) << 31 | u32::from(blocks);
        self.run_r1(commands::CMD23, arg, CmdOp::send(ResponseType::R1))
    }

    /// WRITE_BLOCK.
    pub fn cmd24(&mut self, buf: &[u8], addr: u32) -> Result<CardStatus, Error> {
        let block_size = self.card.block_size;
        let mut cmd = Command::new(commands::CMD24, addr, CmdOp::send(ResponseType::R1))
            .with_tx(buf, block_size, 1);
        self.run(&mut cmd)?;
        Ok(CardStatus::from_response(cmd.r1()))
    }

    /// WRITE_MULTIPLE_BLOCK, `count` is lowered to what one transaction moved.
    pub fn cmd25(&mut self, buf: &[u8], addr: u32, count: &mut u16) -> Result<CardStatus, Error> {
        let block_size = self.card.block_size;
        let mut cmd = Command::new(commands::CMD25, addr, CmdOp::send(ResponseType::R1))
            .with_tx(buf, block_size, *count);
        let result = self.run(&mut cmd);
        *count = cmd.block_count;
        result?;
        Ok(CardStatus::from_response(cmd.r1()))
    }

    /// IO_RW_DIRECT on one register byte.
    pub fn cmd52(&mut self, write: bool, function: u8, raw: bool, addr: u32, data: u8) -> Result<R5Response, Error> {
        let arg = u32::from(write) << 31
            | u32::from(function & 0b111) << 28
            | u32::from(raw) << 27
            | (addr & 0x1_FFFF) << 9
            | u32::from(data);
        let mut cmd = Command::new(commands::CMD52, arg, CmdOp::send(ResponseType::R5).io());
        self.run(&mut cmd)?;
        let r5 = R5Response(cmd.r1());
        if r5.has_error() {
            debug!("CMD52 {:08X} flags {:08X}", arg, cmd.r1());
            return Err(Error::Response);
        }
        Ok(r5)
    }

    /// APP_CMD.
    pub fn cmd55(&mut self, rca: u16) -> Result<CardStatus, Error> {
        let mut op = CmdOp::send(ResponseType::R1);
        if rca == 0 {
            op = op.open_drain();
        }
        self.run_r1(commands::CMD55, u32::from(rca) << 16, op)
    }

    /// Runs `cmd` as an application command.
    ///
    /// A failing APP_CMD is returned as is and `cmd` is not sent.
    fn run_app(&mut self, cmd: &mut Command<'_>) -> Result<Outcome, Error> {
        self.cmd55(self.card.rca)?;
        self.run(cmd)
    }

    /// SET_BUS_WIDTH.
    pub fn acmd6(&mut self, width: BusWidth) -> Result<(), Error> {
        let arg = match width {
            BusWidth::One => 0,
            BusWidth::Four => 2,
            BusWidth::Eight => return Err(Error::Param),
        };
        let mut cmd = Command::new(commands::ACMD6, arg, CmdOp::send(ResponseType::R1));
        self.run_app(&mut cmd).map(|_| ())
    }

    /// SD_STATUS into the card SSR.
    pub fn acmd13(&mut self) -> Result<(), Error> {
        self.cmd55(self.card.rca)?;
        let Device { engine, card } = self;
        let mut cmd = Command::new(commands::ACMD13, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut card.ssr.0, 64, 1);
        engine.send(&mut cmd).map(|_| ())
    }

    /// SD_SEND_OP_COND, polled until the card is ready.
    ///
    /// `hc` announces high capacity support, `low` requests 1.8V signaling.
    /// A card that never gets ready is [`Error::Busy`], one outside the host
    /// voltage window is [`Error::NotSupported`].
    pub fn acmd41(&mut self, hc: bool, low: bool) -> Result<u32, Error> {
        let mut arg = Config::HOST_VDD_WINDOW;
        if hc {
            arg |= ocr::HCS | ocr::XPC;
        }
        if low {
            arg |= ocr::S18R;
        }

        for _ in 0..Self::ocr_polls() {
            let mut cmd = Command::new(
                commands::ACMD41,
                arg,
                CmdOp::send(ResponseType::R3).open_drain(),
            );
            self.run_app(&mut cmd)?;
            let reply = cmd.r1();
            if reply & ocr::BUSY_N != 0 {
                if reply & Config::HOST_VDD_WINDOW != Config::HOST_VDD_WINDOW {
                    warn!("Card OCR {:08X} outside host window", reply);
                    return Err(Error::NotSupported);
                }
                return Ok(reply);
            }
            self.engine.delay_ms(Self::OCR_POLL_MS);
        }
        Err(Error::Busy)
    }

    /// SEND_SCR into the card SCR.
    pub fn acmd51(&mut self) -> Result<(), Error> {
        self.cmd55(self.card.rca)?;
        let Device { engine, card } = self;
        let mut cmd = Command::new(commands::ACMD51, 0, CmdOp::send(ResponseType::R1))
            .with_rx(&mut card.scr, 8, 1);
        engine.send(&mut cmd).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DefaultSdMmcHostConfig,
        consts::sdio,
        sim::{NoDelay, SimCardKind, SimHost},
        switch::{driver_strength, KEEP_CURRENT},
    };

    type SimDevice = Device<SimHost, NoDelay, DefaultSdMmcHostConfig>;

    fn started(kind: SimCardKind) -> SimDevice {
        let mut device = SimDevice::new(SimHost::new(kind), NoDelay);
        device.start().unwrap();
        device.engine_mut().registers().log.clear();
        device
    }

    fn args(device: &mut SimDevice, index: u8) -> Vec<u32> {
        let regs = device.engine_mut().registers();
        regs.commands(index).iter().map(|entry| entry.1).collect()
    }

    #[test]
    fn send_if_cond_carries_voltage_and_pattern() {
        let mut device = started(SimCardKind::SdHc);
        assert_eq!(device.sd_cmd8(if_cond::VHS_2V7_3V6), Ok(()));
        assert_eq!(args(&mut device, commands::CMD8), [0x0000_01AA]);
    }

    #[test]
    fn app_op_cond_capacity_and_signaling_bits() {
        let mut device = started(SimCardKind::SdHc);
        device.acmd41(true, true).unwrap();
        device.acmd41(true, false).unwrap();
        device.acmd41(false, false).unwrap();
        assert_eq!(
            args(&mut device, commands::ACMD41),
            [0x5130_0000, 0x5030_0000, 0x0030_0000]
        );
        assert_eq!(args(&mut device, commands::CMD55), [0; 3]);
    }

    #[test]
    fn set_block_count_direction_bit() {
        let mut device = started(SimCardKind::SdHc);
        device.cmd23(true, 5).unwrap();
        device.cmd23(false, u16::MAX).unwrap();
        assert_eq!(args(&mut device, commands::CMD23), [0x8000_0005, 0x0000_FFFF]);
    }

    #[test]
    fn io_rw_direct_fields() {
        let mut device = started(SimCardKind::Sdio);
        let r5 = device.cmd52(false, 9, false, sdio::CCCR_HIGH_SPEED, 0).unwrap();
        assert_eq!(r5.data(), sdio::SHS);
        assert_eq!(
            device.cmd52(true, 1, true, 0x1_2345, 0xA5).map(|_| ()),
            Err(Error::Response)
        );
        device.cmd52(true, 0, false, 0x2_0000 | sdio::CCCR_IO_ABORT, sdio::RES).unwrap();
        assert_eq!(
            args(&mut device, commands::CMD52),
            [0x1000_2600, 0x9A46_8AA5, 0x8000_0C08]
        );
    }

    #[test]
    fn sd_switch_groups() {
        let mut device = started(SimCardKind::SdHc);
        let keep = KEEP_CURRENT;
        device.sd_cmd6(false, [1, keep, keep, keep, keep, keep]).unwrap();
        device.sd_cmd6(true, [1, keep, driver_strength::TYPE_B, 0, keep, keep]).unwrap();
        assert_eq!(args(&mut device, commands::CMD6), [0x00FF_FFF1, 0x80FF_00F1]);
        assert_eq!(device.card().switch.selected(1), 1);
    }

    #[test]
    fn mmc_switch_writes_ext_csd_byte() {
        let mut device = started(SimCardKind::Mmc);
        let write = ext_csd::ACCESS_WRITE_BYTE;
        device.mmc_cmd6(write, ext_csd::index::HS_TIMING, ext_csd::hs_timing::HIGH_SPEED, 0).unwrap();
        device.mmc_cmd6(write, ext_csd::index::BUS_WIDTH, ext_csd::bus_width::BITS_8, 1).unwrap();
        assert_eq!(args(&mut device, commands::CMD6), [0x03B9_0100, 0x03B7_0201]);
        let regs = device.engine_mut().registers();
        let written = regs.card.as_ref().map(|card| card.ext_csd[185]);
        assert_eq!(written, Some(ext_csd::hs_timing::HIGH_SPEED));
    }
}
