/// Extracts `width` bits starting at register bit `lsb`.
///
/// `reg` holds a wide register as transmitted, most significant byte first,
/// so bit 0 is the least significant bit of the last byte. Bits past the end
/// of the buffer read as zero.
pub fn get_field(reg: &[u8], lsb: usize, width: usize) -> u32 {
    let bits = reg.len() * 8;
    (lsb..lsb + width.min(32)).rev().fold(0, |value, bit| {
        let set = bit < bits && (reg[reg.len() - 1 - bit / 8] >> (bit % 8)) & 1 != 0;
        value << 1 | u32::from(set)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_across_bytes() {
        let reg = [0xA5, 0x0F, 0xF0];
        assert_eq!(get_field(&reg, 0, 8), 0xF0);
        assert_eq!(get_field(&reg, 4, 8), 0xFF);
        assert_eq!(get_field(&reg, 22, 2), 0b10);
        assert_eq!(get_field(&reg, 16, 8), 0xA5);
        assert_eq!(get_field(&reg, 20, 8), 0x0A);
    }
}
