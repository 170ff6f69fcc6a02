use bitfield::bitfield;

/// SD Configuration Register block.
pub type ScrData = [u8; 8];

bitfield! {
    /// SD Configuration Register.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Scr(u64);
    impl Debug;
    pub u8, structure, _: 63, 60;
    pub u8, sd_spec, _: 59, 56;
    pub data_stat_after_erase, _: 55;
    pub u8, sd_security, _: 54, 52;
    pub u8, sd_bus_widths, _: 51, 48;
    pub sd_spec3, _: 47;
    pub u8, ex_security, _: 46, 43;
    pub sd_spec4, _: 42;
    pub u8, sd_specx, _: 41, 38;
    pub cmd58_cmd59, _: 35;
    pub cmd48_cmd49, _: 34;
    pub cmd23, _: 33;
    pub cmd20, _: 32;
}

impl From<ScrData> for Scr {
    fn from(data: ScrData) -> Self {
        Scr(u64::from_be_bytes(data))
    }
}

impl Scr {
    /// 4-bit bus supported.
    pub fn bus_width_4(&self) -> bool {
        self.sd_bus_widths() & 0b0100 != 0
    }

    /// Physical layer version as (major, minor).
    pub fn version(&self) -> (u8, u8) {
        match (self.sd_spec(), self.sd_spec3(), self.sd_spec4(), self.sd_specx()) {
            (0, ..) => (1, 0),
            (1, ..) => (1, 10),
            (2, false, ..) => (2, 0),
            (2, true, false, 0) => (3, 0),
            (2, true, true, 0) => (4, 0),
            (2, true, _, 1) => (5, 0),
            (2, true, _, 2) => (6, 0),
            (2, true, _, 3) => (7, 0),
            _ => (8, 0),
        }
    }
}
