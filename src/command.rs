//! Command descriptors handed to the engine.

use crate::{Error, Outcome};

/// Response format expected from the device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// No response.
    R0,
    /// Card status.
    R1,
    /// CID or CSD, 136 bits.
    R2,
    /// OCR, no CRC.
    R3,
    /// SDIO OCR.
    R4,
    /// SDIO direct access.
    R5,
    /// Published RCA.
    R6,
    /// Interface condition.
    R7,
}

/// Data phase of a command.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    /// Device to host.
    Rx,
    /// Host to device.
    Tx,
    /// Abort of a running transfer.
    Stop,
}

/// How a command is framed on the bus.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdOp {
    /// Initialization clocks only, nothing is sent.
    pub power_on: bool,
    pub send: bool,
    pub direction: DataDirection,
    pub response: ResponseType,
    /// Check the response CRC.
    pub crc: bool,
    pub open_drain: bool,
    /// SDIO command.
    pub io: bool,
    /// Device signals busy on DAT0 after the response.
    pub busy: bool,
}

impl CmdOp {
    /// A command sent with the given response type and no data phase.
    pub const fn send(response: ResponseType) -> Self {
        CmdOp {
            power_on: false,
            send: true,
            direction: DataDirection::None,
            response,
            crc: true,
            open_drain: false,
            io: false,
            busy: false,
        }
    }

    /// The initialization clock sequence.
    pub const fn power_on() -> Self {
        CmdOp {
            power_on: true,
            send: false,
            direction: DataDirection::None,
            response: ResponseType::R0,
            crc: false,
            open_drain: false,
            io: false,
            busy: false,
        }
    }

    pub const fn rx(mut self) -> Self {
        self.direction = DataDirection::Rx;
        self
    }

    pub const fn tx(mut self) -> Self {
        self.direction = DataDirection::Tx;
        self
    }

    pub const fn stop(mut self) -> Self {
        self.direction = DataDirection::Stop;
        self
    }

    pub const fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub const fn open_drain(mut self) -> Self {
        self.open_drain = true;
        self
    }

    pub const fn io(mut self) -> Self {
        self.io = true;
        self
    }

    /// Whether a data block moves through the buffer.
    pub fn has_data(&self) -> bool {
        matches!(self.direction, DataDirection::Rx | DataDirection::Tx)
    }

    /// Whether the controller may verify the response CRC.
    pub fn checks_crc(&self) -> bool {
        self.crc
            && !matches!(self.response, ResponseType::R0 | ResponseType::R3)
            && !(self.response == ResponseType::R4 && self.io)
    }

    /// Whether the controller may verify the echoed command index.
    pub fn checks_index(&self) -> bool {
        !matches!(
            self.response,
            ResponseType::R0 | ResponseType::R2 | ResponseType::R3
        ) && !(self.response == ResponseType::R4 && self.io)
    }
}

/// Data buffer attached to a command.
#[derive(Debug, Default)]
pub enum DataBuffer<'a> {
    #[default]
    None,
    Rx(&'a mut [u8]),
    Tx(&'a [u8]),
}

impl DataBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Rx(buf) => buf.len(),
            DataBuffer::Tx(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start of the buffer as handed to a DMA engine, which writes through
    /// it for receive buffers.
    pub fn dma_ptr(&mut self) -> Option<*const u8> {
        match self {
            DataBuffer::None => None,
            DataBuffer::Rx(buf) => Some(buf.as_mut_ptr().cast_const()),
            DataBuffer::Tx(buf) => Some(buf.as_ptr()),
        }
    }
}

/// One command, from issue to response retrieval.
///
/// The engine fills `response` and `status`; the descriptor stays owned by
/// the caller for the whole lifetime of the command.
#[derive(Debug)]
pub struct Command<'a> {
    pub index: u8,
    pub arg: u32,
    pub op: CmdOp,
    pub buffer: DataBuffer<'a>,
    pub block_size: u16,
    pub block_count: u16,
    /// Response words, most significant first for R2.
    pub response: [u32; 4],
    pub status: Result<Outcome, Error>,
}

impl<'a> Command<'a> {
    pub fn new(index: u8, arg: u32, op: CmdOp) -> Self {
        Command {
            index,
            arg,
            op,
            buffer: DataBuffer::None,
            block_size: 0,
            block_count: 0,
            response: [0; 4],
            status: Ok(Outcome::Done),
        }
    }

    /// Attaches a receive buffer of `block_count` blocks.
    pub fn with_rx(mut self, buf: &'a mut [u8], block_size: u16, block_count: u16) -> Self {
        self.op = self.op.rx();
        self.buffer = DataBuffer::Rx(buf);
        self.block_size = block_size;
        self.block_count = block_count;
        self
    }

    /// Attaches a transmit buffer of `block_count` blocks.
    pub fn with_tx(mut self, buf: &'a [u8], block_size: u16, block_count: u16) -> Self {
        self.op = self.op.tx();
        self.buffer = DataBuffer::Tx(buf);
        self.block_size = block_size;
        self.block_count = block_count;
        self
    }

    /// First response word.
    pub fn r1(&self) -> u32 {
        self.response[0]
    }

    /// Response as big-endian bytes, for 136-bit registers.
    pub fn r2_bytes(&self) -> [u8; 16] {
        let mut bytes = [0; 16];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.response.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    /// Total bytes of the data phase.
    pub fn data_len(&self) -> usize {
        usize::from(self.block_size) * usize::from(self.block_count)
    }
}
