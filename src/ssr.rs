use crate::field::get_field;

/// SD Status block.
pub type SsrData = [u8; 64];

/// SD Status, returned by ACMD13.
#[derive(Clone, Copy)]
pub struct Ssr(pub SsrData);

impl Default for Ssr {
    fn default() -> Self {
        Ssr([0; 64])
    }
}

impl core::fmt::Debug for Ssr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ssr")
            .field("dat_bus_width", &self.dat_bus_width())
            .field("speed_class", &self.speed_class())
            .field("au_size", &self.au_size())
            .field("uhs_speed_grade", &self.uhs_speed_grade())
            .finish()
    }
}

impl Ssr {
    fn field(&self, lsb: usize, width: usize) -> u32 {
        get_field(&self.0, lsb, width)
    }

    /// Current bus width: 0 for 1-bit, 2 for 4-bit.
    pub fn dat_bus_width(&self) -> u8 {
        self.field(510, 2) as u8
    }

    pub fn secured_mode(&self) -> bool {
        self.field(509, 1) != 0
    }

    pub fn card_type(&self) -> u16 {
        self.field(480, 16) as u16
    }

    pub fn protected_area_size(&self) -> u32 {
        self.field(448, 32)
    }

    pub fn speed_class(&self) -> u8 {
        self.field(440, 8) as u8
    }

    pub fn performance_move(&self) -> u8 {
        self.field(432, 8) as u8
    }

    pub fn au_size(&self) -> u8 {
        self.field(428, 4) as u8
    }

    pub fn erase_size(&self) -> u16 {
        self.field(408, 16) as u16
    }

    pub fn erase_timeout(&self) -> u8 {
        self.field(402, 6) as u8
    }

    pub fn erase_offset(&self) -> u8 {
        self.field(400, 2) as u8
    }

    pub fn uhs_speed_grade(&self) -> u8 {
        self.field(396, 4) as u8
    }

    pub fn uhs_au_size(&self) -> u8 {
        self.field(392, 4) as u8
    }

    pub fn video_speed_class(&self) -> u8 {
        self.field(384, 8) as u8
    }
}
