const UMASKS: [u64; 9] = [
    0,
    0xff,
    0xffff,
    0xffffff,
    0xffffffff,
    0xffffffffff,
    0xffffffffffff,
    0xffffffffffffff,
    0xffffffffffffffff,
];

/// Mask covering `size` bytes (saturating at eight).
#[inline(always)]
pub fn calculate_mask(size: usize) -> u64 {
    UMASKS[size.min(UMASKS.len() - 1)]
}

/// Sign extends `value` treating bit `bit` as the sign bit.
#[inline(always)]
pub fn sign_extend(value: i64, bit: usize) -> i64 {
    let mask = (!0i64).checked_shl(bit as u32).unwrap_or(0);
    if (shr_arith(value, bit as u32) & 1) != 0 {
        value | mask
    } else {
        value & !mask
    }
}

/// Clears every bit above bit `bit`.
#[inline(always)]
pub fn zero_extend(value: i64, bit: usize) -> i64 {
    let mask = (!0i64)
        .checked_shl(bit as u32)
        .and_then(|m| m.checked_shl(1))
        .unwrap_or(0);
    value & !mask
}

#[inline(always)]
pub fn shr_arith(value: i64, amount: u32) -> i64 {
    value
        .checked_shr(amount)
        .unwrap_or(if value < 0 { -1 } else { 0 })
}

#[inline(always)]
pub fn shl(value: i64, amount: u32) -> i64 {
    value.checked_shl(amount).unwrap_or(0)
}

#[inline(always)]
pub fn wrap_offset(highest: u64, offset: u64) -> u64 {
    if offset <= highest {
        offset
    } else {
        offset % (highest + 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(calculate_mask(0), 0);
        assert_eq!(calculate_mask(2), 0xffff);
        assert_eq!(calculate_mask(12), u64::MAX);
    }

    #[test]
    fn extension() {
        assert_eq!(sign_extend(0xf, 3), -1);
        assert_eq!(sign_extend(0x7, 3), 7);
        assert_eq!(zero_extend(-1, 3), 0xf);
        assert_eq!(zero_extend(-1, 63), -1);
        assert_eq!(shr_arith(-8, 70), -1);
        assert_eq!(shl(1, 64), 0);
    }

    #[test]
    fn wrapping() {
        assert_eq!(wrap_offset(0xffff, 0x1_0002), 2);
        assert_eq!(wrap_offset(u64::MAX, 42), 42);
    }
}
