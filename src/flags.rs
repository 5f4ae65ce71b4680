//! Operating mode flags packed into the controller's mode status word.
//!
//! Every meaningful bit of the word has exactly one name in [`FLAGS`]. Decoding and single-flag
//! updates both go through that one table, so a bit index is never spelled out anywhere else.

/// `(bit index, flag name)` for every known bit of the mode status word, in bit order.
///
/// Bit 0 is set by the controller while no override mode is active.
pub static FLAGS: [(u8, &str); 15] = [
    (0, "normal"),
    (1, "away"),
    (2, "boost"),
    (3, "fireplace"),
    (4, "kitchenHood"),
    (5, "night"),
    (6, "holiday"),
    (7, "standby"),
    (8, "bypass"),
    (9, "summer"),
    (10, "defrost"),
    (11, "heating"),
    (12, "cooling"),
    (13, "preheater"),
    (14, "filterAlarm"),
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("`{0}` is not a known mode flag")]
pub struct UnknownFlag(pub String);

/// The state of every flag in [`FLAGS`], decoded from one status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagSummary([bool; FLAGS.len()]);

impl FlagSummary {
    pub fn get(&self, name: &str) -> Option<bool> {
        let index = FLAGS.iter().position(|(_, n)| *n == name)?;
        Some(self.0[index])
    }

    /// Iterate over `(flag name, state)` in bit order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        FLAGS.iter().zip(self.0.iter()).map(|((_, name), &set)| (*name, set))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

pub fn bit_of(name: &str) -> Option<u8> {
    FLAGS.iter().find(|(_, n)| *n == name).map(|(bit, _)| *bit)
}

pub fn decode_flags(word: u16) -> FlagSummary {
    let mut result = [false; FLAGS.len()];
    for (slot, (bit, _)) in result.iter_mut().zip(FLAGS.iter()) {
        *slot = (word >> bit) & 1 == 1;
    }
    FlagSummary(result)
}

/// Set or clear the bit behind `name` in `current`, leaving all other bits as they were.
pub fn set_flag(current: u16, name: &str, desired: bool) -> Result<u16, UnknownFlag> {
    let bit = bit_of(name).ok_or_else(|| UnknownFlag(name.to_string()))?;
    let mask = 1u16 << bit;
    Ok(if desired { current | mask } else { current & !mask })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_in_bit_order_without_gaps() {
        for (index, (bit, _)) in FLAGS.iter().enumerate() {
            assert_eq!(usize::from(*bit), index);
        }
    }

    #[test]
    fn decode_is_total_and_matches_bits() {
        for word in [0u16, 1, 0b10, 0x7FFF, 0x8000, 0xFFFF, 0b0100_0000_0010_0101, 0x1234] {
            let summary = decode_flags(word);
            assert_eq!(summary.len(), FLAGS.len());
            for (bit, name) in FLAGS {
                assert_eq!(summary.get(name), Some(word & (1 << bit) != 0), "{name} in {word:#x}");
            }
        }
    }

    #[test]
    fn reserved_bit_is_ignored() {
        assert_eq!(decode_flags(0x8000), decode_flags(0));
    }

    #[test]
    fn normal_operation() {
        let summary = decode_flags(1);
        assert_eq!(summary.get("normal"), Some(true));
        assert!(summary.iter().filter(|(_, set)| *set).count() == 1);
    }

    #[test]
    fn set_flag_only_touches_its_bit() {
        let current = 0b0101_0000_1000_0001;
        let updated = set_flag(current, "away", true).unwrap();
        assert_eq!(updated, current | 0b10);
        assert_eq!(set_flag(updated, "away", true).unwrap(), updated);
        let cleared = set_flag(updated, "away", false).unwrap();
        assert_eq!(cleared, current);
        assert_eq!(set_flag(cleared, "away", false).unwrap(), cleared);
    }

    #[test]
    fn set_flag_keeps_reserved_bit() {
        assert_eq!(set_flag(0x8000, "night", true).unwrap(), 0x8020);
    }

    #[test]
    fn set_unknown_flag() {
        assert_eq!(set_flag(0, "turbo", true), Err(UnknownFlag("turbo".into())));
    }
}
