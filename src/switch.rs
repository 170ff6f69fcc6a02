//! SD switch function (CMD6) status.

use crate::field::get_field;

/// Switch function status block.
pub type SwitchData = [u8; 64];

/// Function group 1: bus speed mode.
pub mod access_mode {
    pub const SDR12: u8 = 0;
    pub const SDR25: u8 = 1;
    pub const SDR50: u8 = 2;
    pub const SDR104: u8 = 3;
    pub const DDR50: u8 = 4;
    /// Default speed, same code as SDR12.
    pub const DS: u8 = SDR12;
    /// High speed, same code as SDR25.
    pub const HS: u8 = SDR25;
}

/// Function group 3: driver strength.
pub mod driver_strength {
    pub const TYPE_B: u8 = 0;
    pub const TYPE_A: u8 = 1;
    pub const TYPE_C: u8 = 2;
    pub const TYPE_D: u8 = 3;
}

/// Function group 4: current limit.
pub mod current_limit {
    pub const MA_200: u8 = 0;
    pub const MA_400: u8 = 1;
    pub const MA_600: u8 = 2;
    pub const MA_800: u8 = 3;
}

/// Function selector leaving a group unchanged.
pub const KEEP_CURRENT: u8 = 0xF;
/// Reply of a group whose requested function cannot be switched to.
pub const SWITCH_FAILED: u8 = 0xF;

/// Status returned on the data lines by CMD6.
#[derive(Clone, Copy)]
pub struct SwitchStatus(pub SwitchData);

impl Default for SwitchStatus {
    fn default() -> Self {
        SwitchStatus([0; 64])
    }
}

impl core::fmt::Debug for SwitchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SwitchStatus")
            .field("max_current", &self.max_current())
            .field("group1", &self.supported(1))
            .field("selected1", &self.selected(1))
            .finish()
    }
}

impl SwitchStatus {
    /// Maximum current consumption of the selection, in mA. 0 is an error.
    pub fn max_current(&self) -> u16 {
        get_field(&self.0, 496, 16) as u16
    }

    /// Support bitmap of a function group, 1 through 6.
    pub fn supported(&self, group: u8) -> u16 {
        match group {
            1..=6 => get_field(&self.0, 400 + 16 * usize::from(group - 1), 16) as u16,
            _ => 0,
        }
    }

    /// Whether `function` of `group` is supported.
    pub fn supports(&self, group: u8, function: u8) -> bool {
        function < 16 && self.supported(group) & (1 << function) != 0
    }

    /// Function selected (or that would be selected) in a group.
    pub fn selected(&self, group: u8) -> u8 {
        match group {
            1..=6 => get_field(&self.0, 376 + 4 * usize::from(group - 1), 4) as u8,
            _ => SWITCH_FAILED,
        }
    }

    pub fn structure_version(&self) -> u8 {
        get_field(&self.0, 368, 8) as u8
    }

    /// Busy bitmap of a function group, valid with structure version 1.
    pub fn busy(&self, group: u8) -> u16 {
        match group {
            1..=6 if self.structure_version() >= 1 => {
                get_field(&self.0, 272 + 16 * usize::from(group - 1), 16) as u16
            }
            _ => 0,
        }
    }
}

/// Argument of SD CMD6, `set` selects switch versus check mode.
pub fn switch_argument(set: bool, groups: [u8; 6]) -> u32 {
    groups
        .iter()
        .enumerate()
        .fold(u32::from(set) << 31 | 0x00FF_FFFF, |arg, (i, function)| {
            let shift = 4 * i;
            arg & !(0xF << shift) | u32::from(function & 0xF) << shift
        })
}
