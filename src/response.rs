use bitfield::bitfield;
use bitflags::bitflags;

bitflags! {
    /// Card status carried by R1 responses.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CardStatus: u32 {
        const AKE_SEQ_ERROR         = 1 << 3;
        const APP_CMD               = 1 << 5;
        const EXCEPTION_EVENT       = 1 << 6;
        const SWITCH_ERROR          = 1 << 7;
        const READY_FOR_DATA        = 1 << 8;
        const CURRENT_STATE         = 0xF << 9;
        const ERASE_RESET           = 1 << 13;
        const CARD_ECC_DISABLED     = 1 << 14;
        const WP_ERASE_SKIP         = 1 << 15;
        const CID_CSD_OVERWRITE     = 1 << 16;
        const ERROR                 = 1 << 19;
        const CC_ERROR              = 1 << 20;
        const CARD_ECC_FAILED       = 1 << 21;
        const ILLEGAL_COMMAND       = 1 << 22;
        const COM_CRC_ERROR         = 1 << 23;
        const LOCK_UNLOCK_FAILED    = 1 << 24;
        const CARD_IS_LOCKED        = 1 << 25;
        const WP_VIOLATION          = 1 << 26;
        const ERASE_PARAM           = 1 << 27;
        const ERASE_SEQ_ERROR       = 1 << 28;
        const BLOCK_LEN_ERROR       = 1 << 29;
        const ADDRESS_MISALIGN      = 1 << 30;
        const OUT_OF_RANGE          = 1 << 31;

        /// Bits that matter after a read command.
        const READ_ERRORS = Self::OUT_OF_RANGE.bits()
            | Self::ADDRESS_MISALIGN.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::ILLEGAL_COMMAND.bits()
            | Self::CARD_ECC_FAILED.bits()
            | Self::CC_ERROR.bits()
            | Self::ERROR.bits()
            | Self::ERASE_RESET.bits()
            | Self::SWITCH_ERROR.bits();

        /// Bits that matter after a write command.
        const WRITE_ERRORS = Self::OUT_OF_RANGE.bits()
            | Self::ADDRESS_MISALIGN.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::WP_VIOLATION.bits()
            | Self::ILLEGAL_COMMAND.bits()
            | Self::CC_ERROR.bits()
            | Self::ERROR.bits()
            | Self::ERASE_RESET.bits()
            | Self::SWITCH_ERROR.bits();

        /// Status bits that only reflect the current state, not an exception.
        const NON_EXCEPTION = Self::CARD_IS_LOCKED.bits()
            | Self::CARD_ECC_DISABLED.bits()
            | Self::CURRENT_STATE.bits()
            | Self::READY_FOR_DATA.bits()
            | Self::EXCEPTION_EVENT.bits()
            | Self::APP_CMD.bits();

        /// Sequence errors reported after a failed multi-block transfer.
        const STATE_ERRORS = Self::ERASE_SEQ_ERROR.bits()
            | Self::ERASE_PARAM.bits()
            | Self::LOCK_UNLOCK_FAILED.bits()
            | Self::ILLEGAL_COMMAND.bits()
            | Self::CID_CSD_OVERWRITE.bits()
            | Self::ERASE_RESET.bits()
            | Self::SWITCH_ERROR.bits();

        /// Data integrity errors.
        const IO_ERRORS = Self::COM_CRC_ERROR.bits()
            | Self::CARD_ECC_FAILED.bits()
            | Self::ERROR.bits();

        /// Addressing errors.
        const PARAM_ERRORS = Self::OUT_OF_RANGE.bits()
            | Self::ADDRESS_MISALIGN.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::WP_VIOLATION.bits()
            | Self::WP_ERASE_SKIP.bits();
    }
}

/// Card state, as reported in [`CardStatus::CURRENT_STATE`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Ident,
    Standby,
    Transfer,
    Data,
    Receive,
    Program,
    Disconnect,
    BusTest,
    Sleep,
    Reserved(u8),
}

impl From<u8> for CardState {
    fn from(value: u8) -> Self {
        match value {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::Data,
            6 => CardState::Receive,
            7 => CardState::Program,
            8 => CardState::Disconnect,
            9 => CardState::BusTest,
            10 => CardState::Sleep,
            other => CardState::Reserved(other),
        }
    }
}

impl CardStatus {
    /// Raw 32-bit R1 payload.
    pub fn from_response(resp: u32) -> Self {
        CardStatus::from_bits_retain(resp)
    }

    /// Current card state.
    pub fn state(&self) -> CardState {
        CardState::from(((self.bits() >> 9) & 0xF) as u8)
    }

    /// In transfer state and ready for data.
    pub fn is_ready(&self) -> bool {
        self.state() == CardState::Transfer && self.contains(CardStatus::READY_FOR_DATA)
    }

    /// Exception bits left once the state bits have been removed.
    pub fn exceptions(&self, mask: CardStatus) -> CardStatus {
        (*self & mask) - CardStatus::READY_FOR_DATA - CardStatus::CURRENT_STATE
    }
}

bitfield! {
    /// R4 response, SDIO operating conditions.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IoOcr(u32);
    impl Debug;
    pub ready, _: 31;
    pub u8, function_count, _: 30, 28;
    pub memory_present, _: 27;
    pub s18a, _: 24;
    pub u32, voltage_window, _: 23, 0;
}

bitfield! {
    /// R5 response, SDIO direct register access.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R5Response(u32);
    impl Debug;
    pub com_crc_error, _: 15;
    pub illegal_command, _: 14;
    pub u8, io_state, _: 13, 12;
    pub error, _: 11;
    pub function_number_error, _: 9;
    pub out_of_range, _: 8;
    pub u8, data, _: 7, 0;
}

impl R5Response {
    /// Any flag signaling a failed access.
    pub fn has_error(&self) -> bool {
        self.com_crc_error()
            || self.illegal_command()
            || self.error()
            || self.function_number_error()
            || self.out_of_range()
    }
}
