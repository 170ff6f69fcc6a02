//! ADMA2 descriptor table, 32-bit addressing.

use bitflags::bitflags;

/// Lines in the table.
pub const MAX_LINES: usize = 64;
/// Largest transfer of one line. Encoded as length 0.
pub const MAX_LINE_LEN: usize = 1 << 16;
/// Required alignment of data addresses.
pub const ADDR_ALIGN: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Attr: u8 {
        const VALID = 1 << 0;
        const END = 1 << 1;
        const GEN_INTR = 1 << 2;

        const ACTION_NOP = 0;
        const ACTION_TRAN = 0b100_000;
        const ACTION_LINK = 0b110_000;
        const ACTION_MASK = 0b110_000;
    }
}

/// One table line: attributes, 16-bit length, 32-bit address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    pub fn new(addr: u32, len: usize, attr: Attr) -> Self {
        let len = if len >= MAX_LINE_LEN { 0 } else { len as u64 };
        Descriptor(u64::from(addr) << 32 | len << 16 | u64::from(attr.bits()))
    }

    pub fn addr(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn len(&self) -> usize {
        match (self.0 >> 16) as u16 {
            0 => MAX_LINE_LEN,
            len => usize::from(len),
        }
    }

    pub fn attr(&self) -> Attr {
        Attr::from_bits_truncate(self.0 as u8)
    }
}

/// Descriptor table owned by one controller.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct DescTable {
    lines: [Descriptor; MAX_LINES],
}

impl Default for DescTable {
    fn default() -> Self {
        DescTable {
            lines: [Descriptor::default(); MAX_LINES],
        }
    }
}

impl DescTable {
    /// Bytes one table can describe.
    pub const MAX_LEN: usize = MAX_LINES * MAX_LINE_LEN;

    pub fn as_ptr(&self) -> *const u8 {
        self.lines.as_ptr().cast()
    }

    pub fn lines(&self) -> &[Descriptor] {
        &self.lines
    }

    /// Describes `block_count` blocks starting at bus address `addr`.
    ///
    /// Returns the number of blocks the table covers, which is lower than
    /// `block_count` when the table would overflow. `None` when the region
    /// does not fit the 32-bit address space.
    pub fn fill(&mut self, addr: u32, block_size: u16, block_count: u16) -> Option<u16> {
        let block_size = usize::from(block_size);
        let blocks = usize::from(block_count).min(Self::MAX_LEN / block_size);
        let total = blocks * block_size;
        if blocks == 0 || u64::from(addr) + total as u64 > 1 << 32 {
            return None;
        }

        let mut filled = 0;
        let mut used = 0;
        for line in self.lines.iter_mut() {
            let len = (total - filled).min(MAX_LINE_LEN);
            let mut attr = Attr::VALID | Attr::ACTION_TRAN;
            if filled + len == total {
                attr |= Attr::END;
            }
            *line = Descriptor::new(addr + filled as u32, len, attr);
            filled += len;
            used += 1;
            if filled == total {
                break;
            }
        }
        for line in self.lines[used..].iter_mut() {
            *line = Descriptor::default();
        }

        u16::try_from(blocks).ok()
    }
}
