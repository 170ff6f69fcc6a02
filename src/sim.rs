//! Simulated SD Host Controller with one card behind it.
//!
//! Commands execute the moment the command register is written; data moves
//! through the buffer data port one word at a time, so the engine runs its
//! PIO paths. With [`SimHost::dma`] set, buffers get bus addresses and data
//! moves through the ADMA2 descriptor table instead.

use crate::{
    adma::{Attr, MAX_LINES, MAX_LINE_LEN},
    consts::{commands, ocr, sdio},
    ext_csd,
    regs::{
        offset, ClockControl, CommandFlags, HostControl2, Interrupt, PresentState, SdhcRegisters,
        SoftwareReset, TransferMode,
    },
    response::CardStatus,
};

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use std::{cell::RefCell, collections::HashMap};

/// Delay that returns at once.
pub struct NoDelay;

impl DelayUs<u32> for NoDelay {
    fn delay_us(&mut self, _us: u32) {}
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCardKind {
    /// SD high capacity, physical layer 3.0.
    SdHc,
    /// SD standard capacity, physical layer 1.x, no SEND_IF_COND.
    SdSc,
    /// eMMC, sector addressed.
    Mmc,
    /// SDIO device with one function and no memory.
    Sdio,
}

/// Base clock 100 MHz, ADMA2, high speed, 3.3V, removable slot.
pub const SIM_CAPS: u64 = 100 << 8 | 1 << 19 | 1 << 21 | 1 << 24;
/// [`SIM_CAPS`] plus 1.8V signaling and SDR50 with tuning.
pub const SIM_UHS_CAPS: u64 = SIM_CAPS | 1 << 26 | 1 << 32 | 1 << 45;

pub const SIM_RCA: u16 = 0x1234;

/// Sets `width` bits at register bit `lsb`, most significant byte first.
fn put_field(reg: &mut [u8], lsb: usize, width: usize, value: u32) {
    let len = reg.len();
    for i in 0..width {
        let bit = lsb + i;
        let byte = &mut reg[len - 1 - bit / 8];
        let mask = 1 << (bit % 8);
        if value >> i & 1 != 0 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// Cache maintenance requested by the engine, with the region length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Clean(usize),
    Invalidate(usize),
}

/// What the card does with a command.
enum Reply {
    Timeout,
    Short(u32),
    Long(u128),
}

pub struct SimCard {
    pub kind: SimCardKind,
    state: u32,
    rca: u16,
    app: bool,
    blocks: HashMap<u32, Vec<u8>>,
    bus_test: Vec<u8>,
    selected: [u8; 6],
    pub ext_csd: [u8; 512],
    pub cccr: [u8; 0x20],
    /// Accepts 1.8V signaling and supports SDR50.
    pub uhs: bool,
    /// Answers VOLTAGE_SWITCH but never drives the lines low.
    pub stuck_signaling: bool,
    /// Holds CMD and DAT low until the host switches to 1.8V.
    switching: bool,
}

impl SimCard {
    pub fn new(kind: SimCardKind) -> Self {
        let mut ext_csd = [0; 512];
        ext_csd[ext_csd::index::EXT_CSD_REV] = 5;
        ext_csd[ext_csd::index::CARD_TYPE] = 0b11;
        let at = ext_csd::index::SEC_COUNT;
        ext_csd[at..at + 4].copy_from_slice(&0x0040_0000u32.to_le_bytes());
        let mut cccr = [0; 0x20];
        cccr[sdio::CCCR_HIGH_SPEED as usize] = sdio::SHS;
        SimCard {
            kind,
            state: 0,
            rca: 0,
            app: false,
            blocks: HashMap::new(),
            bus_test: Vec::new(),
            selected: [0; 6],
            ext_csd,
            cccr,
            uhs: false,
            stuck_signaling: false,
            switching: false,
        }
    }

    fn is_sd(&self) -> bool {
        matches!(self.kind, SimCardKind::SdHc | SimCardKind::SdSc)
    }

    fn is_mmc(&self) -> bool {
        self.kind == SimCardKind::Mmc
    }

    fn status(&self) -> u32 {
        let mut status = self.state << 9 | CardStatus::READY_FOR_DATA.bits();
        if self.app {
            status |= CardStatus::APP_CMD.bits();
        }
        status
    }

    fn cid(&self) -> u128 {
        let mut cid = [0u8; 16];
        cid[0] = 0x03;
        cid[3..8].copy_from_slice(b"SIM01");
        cid[9..13].copy_from_slice(&0xC0FF_EE00u32.to_be_bytes());
        u128::from_be_bytes(cid)
    }

    fn csd(&self) -> u128 {
        match self.kind {
            // CSD 2.0, TRAN_SPEED 25 MHz, C_SIZE 0xEC8
            SimCardKind::SdHc => 1 << 126 | 0x32 << 96 | 0x5B5 << 84 | 9 << 80 | 0xEC8 << 48,
            // CSD 1.0, C_SIZE 0x7FF, C_SIZE_MULT 7
            SimCardKind::SdSc => 0x32 << 96 | 0x5B5 << 84 | 9 << 80 | 0x7FF << 62 | 7 << 47,
            // spec version 4
            SimCardKind::Mmc => {
                3 << 126 | 4 << 122 | 0x32 << 96 | 0x0F5 << 84 | 9 << 80 | 0xFFF << 62 | 7 << 47
            }
            SimCardKind::Sdio => 0,
        }
    }

    fn scr(&self) -> Vec<u8> {
        // SD_SPEC 2, bus widths 1 and 4, SD_SPEC3, CMD23
        let scr: u64 = 2 << 56 | 0b0101 << 48 | 1 << 47 | 1 << 33;
        scr.to_be_bytes().to_vec()
    }

    fn switch_status(&mut self, arg: u32) -> Vec<u8> {
        let set = arg >> 31 != 0;
        let speeds = if self.uhs { 0b111 } else { 0b11 };
        let supported: [u32; 6] = [speeds, 0b1, 0b1, 0b1, 0b1, 0b1];
        let mut data = vec![0u8; 64];
        put_field(&mut data, 496, 16, 200);
        put_field(&mut data, 368, 8, 1);
        for group in 0..6 {
            put_field(&mut data, 400 + 16 * group, 16, supported[group]);
            let function = (arg >> (4 * group)) as u8 & 0xF;
            let selected = if function == 0xF {
                self.selected[group]
            } else if supported[group] & (1 << function) != 0 {
                function
            } else {
                0xF
            };
            if set && selected != 0xF {
                self.selected[group] = selected;
            }
            put_field(&mut data, 376 + 4 * group, 4, u32::from(selected));
        }
        data
    }

    fn block_of(&self, arg: u32) -> u32 {
        match self.kind {
            SimCardKind::SdSc => arg / 512,
            _ => arg,
        }
    }

    /// Data the card sends for a read command.
    fn read_data(&mut self, index: u8, app: bool, arg: u32, block_size: usize, count: usize) -> Vec<u8> {
        let mut data = match (index, app) {
            (commands::CMD6, false) if self.is_sd() => self.switch_status(arg),
            (commands::CMD8, false) => self.ext_csd.to_vec(),
            (commands::CMD14, false) => self.bus_test.iter().map(|byte| !byte).collect(),
            (commands::ACMD51, true) => self.scr(),
            (commands::CMD17 | commands::CMD18, false) => {
                let first = self.block_of(arg);
                let mut data = Vec::with_capacity(block_size * count);
                for block in 0..count as u32 {
                    match self.blocks.get(&(first + block)) {
                        Some(stored) => data.extend_from_slice(stored),
                        None => data.resize(data.len() + block_size, 0),
                    }
                }
                data
            }
            _ => Vec::new(),
        };
        data.resize(block_size * count, 0);
        data
    }

    /// Data the host sent with a write command.
    fn write_data(&mut self, index: u8, arg: u32, block_size: usize, data: &[u8]) {
        match index {
            commands::CMD19 => self.bus_test = data.to_vec(),
            commands::CMD24 | commands::CMD25 => {
                let first = self.block_of(arg);
                for (i, block) in data.chunks(block_size).enumerate() {
                    self.blocks.insert(first + i as u32, block.to_vec());
                }
            }
            _ => {}
        }
    }

    /// IO_RW_DIRECT on the common I/O area.
    fn io_direct(&mut self, arg: u32) -> Reply {
        let write = arg >> 31 != 0;
        let raw = arg >> 27 & 1 != 0;
        let addr = (arg >> 9 & 0x1_FFFF) as usize;
        let Some(reg) = self.cccr.get_mut(addr) else {
            return Reply::Short(1 << 8);
        };
        if write {
            *reg = arg as u8;
        }
        let data = if write && !raw { 0 } else { *reg };
        let io_state = if self.state == 4 { 2 << 12 } else { 0 };
        Reply::Short(io_state | u32::from(data))
    }

    fn command(&mut self, index: u8, arg: u32) -> Reply {
        let app = self.app;
        self.app = false;
        match (index, app) {
            (commands::CMD0, _) => {
                self.state = 0;
                self.rca = 0;
                Reply::Short(0)
            }
            (commands::CMD5, _) if self.kind == SimCardKind::Sdio => {
                let mut reply = 1 << ocr::SDIO_NUM_FUNCTIONS_SHIFT | 0x00FF_8000;
                if arg != 0 {
                    self.state = 1;
                    reply |= ocr::BUSY_N;
                }
                Reply::Short(reply)
            }
            (commands::CMD52, _) if self.kind == SimCardKind::Sdio => self.io_direct(arg),
            (commands::CMD5 | commands::CMD52, _) => Reply::Timeout,
            (commands::CMD1, _) if self.is_mmc() => {
                self.state = 1;
                Reply::Short(ocr::BUSY_N | ocr::MMC_ACCESS_SECTOR | 0x00FF_8080)
            }
            (commands::CMD8, false) if self.state == 0 => match self.kind {
                SimCardKind::SdHc => Reply::Short(arg & 0xFFF),
                _ => Reply::Timeout,
            },
            (commands::CMD55, _) if self.is_sd() => {
                self.app = true;
                Reply::Short(self.status())
            }
            (commands::ACMD41, true) => {
                self.state = 1;
                let mut reply = ocr::BUSY_N | 0x00FF_8000;
                if self.kind == SimCardKind::SdHc && arg & ocr::HCS != 0 {
                    reply |= ocr::CCS;
                }
                if self.uhs && arg & ocr::S18R != 0 {
                    reply |= ocr::S18A;
                }
                Reply::Short(reply)
            }
            (commands::CMD11, false) if self.uhs && self.state == 1 => {
                self.switching = !self.stuck_signaling;
                Reply::Short(self.status())
            }
            (commands::CMD2, false) => {
                self.state = 2;
                Reply::Long(self.cid())
            }
            (commands::CMD3, false) if !self.is_mmc() => {
                self.state = 3;
                self.rca = SIM_RCA;
                Reply::Short(u32::from(self.rca) << 16 | self.status() & 0xFFFF)
            }
            (commands::CMD3, false) => {
                self.state = 3;
                self.rca = (arg >> 16) as u16;
                Reply::Short(self.status())
            }
            (commands::CMD9, false) if arg >> 16 == u32::from(self.rca) => Reply::Long(self.csd()),
            (commands::CMD7, false) => {
                let status = self.status();
                self.state = if arg >> 16 == u32::from(self.rca) { 4 } else { 3 };
                Reply::Short(status)
            }
            (commands::CMD6, false) if self.is_mmc() => {
                let index = (arg >> 16) as usize & 0xFF;
                if arg >> 24 & 0b11 == u32::from(ext_csd::ACCESS_WRITE_BYTE) {
                    self.ext_csd[index] = (arg >> 8) as u8;
                }
                Reply::Short(self.status())
            }
            (commands::CMD12, false) => {
                self.state = 4;
                Reply::Short(self.status())
            }
            (commands::CMD8, false) if self.is_mmc() => Reply::Short(self.status()),
            (
                commands::CMD6
                | commands::CMD13
                | commands::CMD14
                | commands::CMD16
                | commands::CMD17
                | commands::CMD18
                | commands::CMD19
                | commands::CMD23
                | commands::CMD24
                | commands::CMD25,
                false,
            ) => {
                let status = self.status();
                match index {
                    commands::CMD17 | commands::CMD18 => self.state = 5,
                    commands::CMD24 | commands::CMD25 => self.state = 6,
                    _ => {}
                }
                Reply::Short(status)
            }
            (commands::ACMD6 | commands::ACMD13 | commands::ACMD51, true) => {
                Reply::Short(self.status())
            }
            _ => Reply::Timeout,
        }
    }
}

/// Data phase in progress.
struct DataPhase {
    index: u8,
    arg: u32,
    read: bool,
    block_size: usize,
    total: usize,
    data: Vec<u8>,
    pos: usize,
    auto_stop: bool,
}

pub struct SimHost {
    mem: [u8; 0x100],
    /// Capabilities, read once when the engine is created.
    pub caps: u64,
    int_status: u32,
    pub card: Option<SimCard>,
    data: Option<DataPhase>,
    /// Error raised by the next data command instead of moving data.
    pub fail_data: Option<Interrupt>,
    /// Error raised by the next command with the given index, which never
    /// reaches the card.
    pub fail_command: Option<(u8, Interrupt)>,
    /// Status bits added to the next response of the given command.
    pub status_flags: Option<(u8, CardStatus)>,
    /// Tuning commands before the sampling point is found.
    pub tuning_rounds: usize,
    /// Whether a completed tuning selects the tuned sampling clock.
    pub tuning_locks: bool,
    /// Gives out bus addresses, so data moves through ADMA2.
    pub dma: bool,
    /// Host addresses behind the bus addresses handed out.
    regions: RefCell<Vec<usize>>,
    /// Descriptor lines walked: bus address, length.
    pub adma_lines: Vec<(u32, usize)>,
    pub cache_ops: Vec<CacheOp>,
    /// Every command seen: index, argument, block count.
    pub log: Vec<(u8, u32, u16)>,
    /// Register accesses, reads and writes.
    pub accesses: usize,
    /// Reads of the first response register.
    pub response_reads: usize,
}

impl SimHost {
    pub fn new(kind: SimCardKind) -> Self {
        SimHost {
            mem: [0; 0x100],
            caps: SIM_CAPS,
            int_status: 0,
            card: Some(SimCard::new(kind)),
            data: None,
            fail_data: None,
            fail_command: None,
            status_flags: None,
            tuning_rounds: 1,
            tuning_locks: true,
            dma: false,
            regions: RefCell::new(Vec::new()),
            adma_lines: Vec::new(),
            cache_ops: Vec::new(),
            log: Vec::new(),
            accesses: 0,
            response_reads: 0,
        }
    }

    /// A host with a 1.8V capable slot and a UHS-I card.
    pub fn uhs() -> Self {
        let mut host = SimHost::new(SimCardKind::SdHc);
        host.caps = SIM_UHS_CAPS;
        if let Some(card) = host.card.as_mut() {
            card.uhs = true;
        }
        host
    }

    /// Logged commands with the given index.
    pub fn commands(&self, index: u8) -> Vec<(u8, u32, u16)> {
        self.log.iter().copied().filter(|entry| entry.0 == index).collect()
    }

    fn mem_u16(&self, at: u16) -> u16 {
        let at = usize::from(at);
        u16::from_le_bytes([self.mem[at], self.mem[at + 1]])
    }

    fn mem_u32(&self, at: u16) -> u32 {
        let at = usize::from(at);
        u32::from_le_bytes([self.mem[at], self.mem[at + 1], self.mem[at + 2], self.mem[at + 3]])
    }

    fn set_mem_u16(&mut self, at: u16, value: u16) {
        let at = usize::from(at);
        self.mem[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn set_mem_u32(&mut self, at: u16, value: u32) {
        let at = usize::from(at);
        self.mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn raise(&mut self, events: Interrupt) {
        self.int_status |= events.bits();
    }

    fn execute(&mut self, flags: CommandFlags) {
        let index = (flags.bits() >> 8) as u8 & 0x3F;
        let arg = self.mem_u32(offset::ARGUMENT);
        let mode = TransferMode::from_bits_retain(self.mem_u16(offset::TRANSFER_MODE));
        let has_data = flags.contains(CommandFlags::DATA_PRESENT);
        let read = has_data && mode.contains(TransferMode::READ);
        let block_size = usize::from(self.mem_u16(offset::BLOCK_SIZE));
        let block_count = self.mem_u16(offset::BLOCK_COUNT);
        self.log
            .push((index, arg, if has_data { block_count } else { 0 }));

        let hc2 = HostControl2::from_bits_retain(self.mem_u16(offset::HOST_CONTROL2));
        if hc2.contains(HostControl2::EXECUTE_TUNING) {
            self.tuning_rounds = self.tuning_rounds.saturating_sub(1);
            if self.tuning_rounds == 0 {
                let mut hc2 = hc2 - HostControl2::EXECUTE_TUNING;
                hc2.set(HostControl2::SAMPLING_CLOCK_SELECT, self.tuning_locks);
                self.set_mem_u16(offset::HOST_CONTROL2, hc2.bits());
            }
            self.raise(Interrupt::BUFFER_READ_READY);
            return;
        }
        if index == commands::CMD12 {
            self.data = None;
        }
        if let Some((failing, error)) = self.fail_command {
            if failing == index {
                self.fail_command = None;
                self.raise(Interrupt::ERROR | error);
                return;
            }
        }

        let failing = has_data && self.fail_data.is_some();
        let (reply, read_data) = match self.card.as_mut() {
            None => (Reply::Timeout, None),
            Some(card) => {
                let app = card.app;
                let reply = card.command(index, arg);
                let data = match reply {
                    Reply::Timeout => None,
                    _ if read && !failing => Some(card.read_data(
                        index,
                        app,
                        arg,
                        block_size,
                        usize::from(block_count),
                    )),
                    _ => None,
                };
                (reply, data)
            }
        };

        match reply {
            Reply::Timeout if flags & CommandFlags::RESP_MASK == CommandFlags::empty() => {}
            Reply::Timeout => {
                self.raise(Interrupt::ERROR | Interrupt::CMD_TIMEOUT);
                return;
            }
            Reply::Short(mut response) => {
                if let Some((flagged, bits)) = self.status_flags {
                    if flagged == index {
                        self.status_flags = None;
                        response |= bits.bits();
                    }
                }
                self.set_mem_u32(offset::RESPONSE, response);
            }
            Reply::Long(reg) => {
                let shifted = reg >> 8;
                for word in 0..4u16 {
                    self.set_mem_u32(offset::RESPONSE + 4 * word, (shifted >> (32 * word)) as u32);
                }
            }
        }
        self.raise(Interrupt::CMD_COMPLETE);

        if has_data {
            if let Some(error) = self.fail_data.take() {
                // a single block ends on its own, a multi-block one needs a stop
                if let Some(card) = self.card.as_mut() {
                    if !matches!(index, commands::CMD18 | commands::CMD25) {
                        card.state = 4;
                    }
                }
                self.raise(Interrupt::ERROR | error);
                return;
            }
            let total = block_size * usize::from(block_count);
            let auto_stop = mode.contains(TransferMode::AUTO_CMD12);
            if mode.contains(TransferMode::DMA_ENABLE) {
                let data = read_data.unwrap_or_default();
                self.run_adma(index, arg, read, block_size, total, &data, auto_stop);
                return;
            }
            self.data = Some(DataPhase {
                index,
                arg,
                read,
                block_size,
                total,
                data: read_data.unwrap_or_else(|| Vec::with_capacity(total)),
                pos: 0,
                auto_stop,
            });
            self.raise(if read {
                Interrupt::BUFFER_READ_READY
            } else {
                Interrupt::BUFFER_WRITE_READY
            });
        } else if flags & CommandFlags::RESP_MASK == CommandFlags::RESP_48_BUSY {
            self.raise(Interrupt::TRANSFER_COMPLETE);
        }
    }

    /// Signals the next block, or ends the data phase once every byte moved.
    fn advance(&mut self) {
        let Some(phase) = self.data.as_ref() else {
            return;
        };
        if phase.block_size == 0 || phase.pos % phase.block_size != 0 {
            return;
        }
        if phase.pos < phase.total {
            let next = if phase.read {
                Interrupt::BUFFER_READ_READY
            } else {
                Interrupt::BUFFER_WRITE_READY
            };
            self.raise(next);
            return;
        }

        let Some(phase) = self.data.take() else {
            return;
        };
        let written = (!phase.read).then_some(phase.data.as_slice());
        self.end_data(phase.index, phase.arg, phase.block_size, written, phase.auto_stop);
    }

    /// Commits written data, returns the card to the transfer state and
    /// signals transfer complete.
    fn end_data(
        &mut self,
        index: u8,
        arg: u32,
        block_size: usize,
        written: Option<&[u8]>,
        auto_stop: bool,
    ) {
        let mut stop_status = None;
        if let Some(card) = self.card.as_mut() {
            if let Some(data) = written {
                card.write_data(index, arg, block_size, data);
            }
            card.state = 4;
            if auto_stop {
                stop_status = Some(card.status());
            }
        }
        if let Some(status) = stop_status {
            self.set_mem_u32(offset::RESPONSE + 12, status);
        }
        self.raise(Interrupt::TRANSFER_COMPLETE);
    }

    /// Host address behind a bus address handed out by `dma_address`.
    fn host_address(&self, bus: u32) -> Option<usize> {
        let index = usize::try_from(bus >> 24).ok()?.checked_sub(1)?;
        let base = *self.regions.borrow().get(index)?;
        Some(base + (bus & 0x00FF_FFFF) as usize)
    }

    /// Walks the descriptor table and moves the whole transfer at once.
    #[allow(clippy::too_many_arguments)]
    fn run_adma(
        &mut self,
        index: u8,
        arg: u32,
        read: bool,
        block_size: usize,
        total: usize,
        source: &[u8],
        auto_stop: bool,
    ) {
        let Some(table) = self.host_address(self.mem_u32(offset::ADMA_ADDRESS)) else {
            self.raise(Interrupt::ERROR | Interrupt::ADMA);
            return;
        };
        let mut moved = Vec::with_capacity(total);
        let mut done = 0;
        for line in 0..MAX_LINES {
            // SAFETY: the table belongs to the engine, which is blocked in
            // the register write that started this command.
            let raw = unsafe { std::ptr::read_unaligned((table as *const u64).add(line)) };
            let attr = Attr::from_bits_truncate(raw as u8);
            let len = match (raw >> 16) as u16 {
                0 => MAX_LINE_LEN,
                len => usize::from(len),
            };
            let addr = (raw >> 32) as u32;
            if !attr.contains(Attr::VALID) || done + len > total {
                self.raise(Interrupt::ERROR | Interrupt::ADMA);
                return;
            }
            self.adma_lines.push((addr, len));
            if attr & Attr::ACTION_MASK == Attr::ACTION_TRAN {
                let Some(host) = self.host_address(addr) else {
                    self.raise(Interrupt::ERROR | Interrupt::ADMA);
                    return;
                };
                if read {
                    // SAFETY: receive buffers are handed out for DMA writes
                    // and outlive the command.
                    unsafe {
                        let to = host as *mut u8;
                        std::ptr::copy_nonoverlapping(source[done..].as_ptr(), to, len);
                    }
                } else {
                    // SAFETY: transmit buffers outlive the command.
                    let sent = unsafe { std::slice::from_raw_parts(host as *const u8, len) };
                    moved.extend_from_slice(sent);
                }
                done += len;
            }
            if attr.contains(Attr::END) {
                break;
            }
        }
        let written = (!read).then_some(moved.as_slice());
        self.end_data(index, arg, block_size, written, auto_stop);
    }

    fn read_port(&mut self) -> u32 {
        let Some(phase) = self.data.as_mut().filter(|phase| phase.read) else {
            return 0;
        };
        let mut word = [0u8; 4];
        for byte in word.iter_mut() {
            if phase.pos < phase.total {
                *byte = phase.data[phase.pos];
                phase.pos += 1;
            }
        }
        self.advance();
        u32::from_le_bytes(word)
    }

    fn write_port(&mut self, value: u32) {
        let Some(phase) = self.data.as_mut().filter(|phase| !phase.read) else {
            return;
        };
        for byte in value.to_le_bytes() {
            if phase.pos < phase.total {
                phase.data.push(byte);
                phase.pos += 1;
            }
        }
        self.advance();
    }
}

impl SdhcRegisters for SimHost {
    fn read_u8(&mut self, offset: u16) -> u8 {
        self.accesses += 1;
        match offset {
            offset::SOFTWARE_RESET => 0,
            _ => self.mem[usize::from(offset)],
        }
    }

    fn read_u16(&mut self, offset: u16) -> u16 {
        self.accesses += 1;
        match offset {
            offset::CLOCK_CONTROL => {
                let mut ccr = ClockControl::from_bits_retain(self.mem_u16(offset));
                if ccr.contains(ClockControl::INTERNAL_ENABLE) {
                    ccr |= ClockControl::INTERNAL_STABLE;
                }
                ccr.bits()
            }
            _ => self.mem_u16(offset),
        }
    }

    fn read_u32(&mut self, offset: u16) -> u32 {
        self.accesses += 1;
        match offset {
            offset::CAPABILITIES => self.caps as u32,
            offset::CAPABILITIES1 => (self.caps >> 32) as u32,
            offset::PRESENT_STATE => {
                let mut state = PresentState::WRITE_ENABLED | PresentState::LINE_LEVELS;
                if let Some(card) = self.card.as_ref() {
                    state |= PresentState::CARD_INSERTED | PresentState::CARD_STABLE;
                    if card.switching {
                        state -= PresentState::LINE_LEVELS;
                    }
                }
                state.bits()
            }
            offset::RESPONSE => {
                self.response_reads += 1;
                self.mem_u32(offset)
            }
            offset::INT_STATUS => self.int_status,
            offset::BUFFER => self.read_port(),
            _ => self.mem_u32(offset),
        }
    }

    fn write_u8(&mut self, offset: u16, value: u8) {
        self.accesses += 1;
        match offset {
            offset::SOFTWARE_RESET => {
                let lines = SoftwareReset::from_bits_retain(value);
                if lines.intersects(SoftwareReset::ALL | SoftwareReset::DATA) {
                    self.data = None;
                }
                if lines.contains(SoftwareReset::ALL) {
                    self.mem = [0; 0x100];
                    self.int_status = 0;
                }
            }
            _ => self.mem[usize::from(offset)] = value,
        }
    }

    fn write_u16(&mut self, offset: u16, value: u16) {
        self.accesses += 1;
        self.set_mem_u16(offset, value);
        match offset {
            offset::COMMAND => self.execute(CommandFlags::from_bits_retain(value)),
            offset::HOST_CONTROL2 if value & HostControl2::SIGNALING_1_8.bits() != 0 => {
                if let Some(card) = self.card.as_mut() {
                    card.switching = false;
                }
            }
            _ => {}
        }
    }

    fn write_u32(&mut self, offset: u16, value: u32) {
        self.accesses += 1;
        match offset {
            offset::INT_STATUS => self.int_status &= !value,
            offset::BUFFER => self.write_port(value),
            _ => self.set_mem_u32(offset, value),
        }
    }

    fn dma_address(&self, ptr: *const u8) -> Option<u32> {
        if !self.dma {
            return None;
        }
        let mut regions = self.regions.borrow_mut();
        let at = ptr as usize;
        let index = match regions.iter().position(|&base| base == at) {
            Some(index) => index,
            None => {
                regions.push(at);
                regions.len() - 1
            }
        };
        u32::try_from(index + 1).ok().filter(|&n| n < 0x100).map(|n| n << 24)
    }

    fn clean_dcache(&mut self, _addr: usize, len: usize) {
        self.cache_ops.push(CacheOp::Clean(len));
    }

    fn invalidate_dcache(&mut self, _addr: usize, len: usize) {
        self.cache_ops.push(CacheOp::Invalidate(len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::get_field;

    #[test]
    fn put_field_inverts_get_field() {
        let mut reg = [0u8; 64];
        put_field(&mut reg, 376, 4, 0xA);
        put_field(&mut reg, 496, 16, 200);
        assert_eq!(get_field(&reg, 376, 4), 0xA);
        assert_eq!(get_field(&reg, 496, 16), 200);
        assert_eq!(reg[1], 200);
    }
}
