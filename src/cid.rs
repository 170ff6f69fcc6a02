use bitfield::bitfield;

/// Card Identification block.
pub type CidData = [u8; 16];

bitfield! {
    /// SD Card Identification.
    #[derive(Clone, Copy)]
    pub struct SdCid(u128);
    impl Debug;
    pub u8, manufacturer_id, _: 127, 120;
    pub u16, oem_id, _: 119, 104;
    pub u64, product_name, _: 103, 64;
    pub u8, product_revision, _: 63, 56;
    pub u32, serial_number, _: 55, 24;
    pub u8, manufacturing_year, _: 19, 12;
    pub u8, manufacturing_month, _: 11, 8;
    pub u8, crc, _: 7, 1;
}

bitfield! {
    /// MMC Card Identification.
    #[derive(Clone, Copy)]
    pub struct MmcCid(u128);
    impl Debug;
    pub u8, manufacturer_id, _: 127, 120;
    pub u8, device_type, _: 113, 112;
    pub u8, oem_id, _: 111, 104;
    pub u64, product_name, _: 103, 56;
    pub u8, product_revision, _: 55, 48;
    pub u32, serial_number, _: 47, 16;
    pub u8, manufacturing_month, _: 15, 12;
    pub u8, manufacturing_year, _: 11, 8;
    pub u8, crc, _: 7, 1;
}

/// Card Identification, layout picked by card family.
#[derive(Clone, Copy, Debug)]
pub enum Cid {
    Sd(SdCid),
    Mmc(MmcCid),
}

impl Cid {
    pub fn sd(data: CidData) -> Self {
        Cid::Sd(SdCid(u128::from_be_bytes(data)))
    }

    pub fn mmc(data: CidData) -> Self {
        Cid::Mmc(MmcCid(u128::from_be_bytes(data)))
    }

    pub fn manufacturer_id(&self) -> u8 {
        match self {
            Cid::Sd(cid) => cid.manufacturer_id(),
            Cid::Mmc(cid) => cid.manufacturer_id(),
        }
    }

    pub fn serial_number(&self) -> u32 {
        match self {
            Cid::Sd(cid) => cid.serial_number(),
            Cid::Mmc(cid) => cid.serial_number(),
        }
    }

    /// Product name as ASCII bytes, 5 for SD and 6 for MMC.
    pub fn product_name(&self) -> ([u8; 6], usize) {
        let (raw, len) = match self {
            Cid::Sd(cid) => (cid.product_name(), 5),
            Cid::Mmc(cid) => (cid.product_name(), 6),
        };
        let mut name = [0; 6];
        for (i, byte) in name.iter_mut().take(len).enumerate() {
            *byte = (raw >> (8 * (len - 1 - i))) as u8;
        }
        (name, len)
    }

    /// Manufacturing date as (year, month).
    pub fn manufacturing_date(&self) -> (u16, u8) {
        match self {
            Cid::Sd(cid) => (
                2000 + u16::from(cid.manufacturing_year()),
                cid.manufacturing_month(),
            ),
            Cid::Mmc(cid) => (
                1997 + u16::from(cid.manufacturing_year()),
                cid.manufacturing_month(),
            ),
        }
    }
}
