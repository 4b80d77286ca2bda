//! Register decoding.
//!
//! A [`RegisterSpec`] describes one physical field of a meter: where it
//! lives, how many 16-bit words it spans, the order those words arrive in,
//! whether the combined integer is two's complement, and the factor that
//! turns the raw integer into physical units. Decoding is pure and cannot
//! fail on data; every bit pattern is a valid value.

use serde::{Deserialize, Serialize};

use crate::utils::error::DecodeError;

const MAX_WIDTH: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Most significant word at the lowest address.
    #[default]
    HighFirst,
    /// Least significant word at the lowest address.
    LowFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub word_order: WordOrder,
    pub scale: f64,
}

fn default_count() -> u16 {
    2
}

impl RegisterSpec {
    pub fn unsigned(address: u16, scale: f64) -> Self {
        Self {
            address,
            count: 2,
            signed: false,
            word_order: WordOrder::HighFirst,
            scale,
        }
    }

    pub fn signed(address: u16, scale: f64) -> Self {
        Self {
            signed: true,
            ..Self::unsigned(address, scale)
        }
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.count == 0 || self.count > MAX_WIDTH {
            return Err(DecodeError::UnsupportedWidth(self.count));
        }
        Ok(())
    }

    /// Combines the words into one integer, applying word order and sign.
    pub fn raw_value(&self, words: &[u16]) -> Result<i128, DecodeError> {
        self.validate()?;
        if words.len() != self.count as usize {
            return Err(DecodeError::RegisterCountMismatch {
                expected: self.count,
                actual: words.len(),
            });
        }

        let fold = |acc: u64, word: &u16| (acc << 16) | u64::from(*word);
        let unsigned = match self.word_order {
            WordOrder::HighFirst => words.iter().fold(0u64, fold),
            WordOrder::LowFirst => words.iter().rev().fold(0u64, fold),
        };

        let bits = 16 * u32::from(self.count);
        let value = i128::from(unsigned);
        if self.signed && value >= 1i128 << (bits - 1) {
            Ok(value - (1i128 << bits))
        } else {
            Ok(value)
        }
    }

    pub fn decode(&self, words: &[u16]) -> Result<f64, DecodeError> {
        Ok(self.raw_value(words)? as f64 * self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the register words a meter would send for `value`.
    fn encode(spec: &RegisterSpec, value: f64) -> Vec<u16> {
        let raw = (value / spec.scale).round() as i64;
        let bits = 16 * u32::from(spec.count);
        let pattern = if bits == 64 { raw as u64 } else { (raw as u64) & ((1u64 << bits) - 1) };
        let mut words: Vec<u16> = (0..spec.count)
            .rev()
            .map(|i| (pattern >> (16 * u32::from(i))) as u16)
            .collect();
        if spec.word_order == WordOrder::LowFirst {
            words.reverse();
        }
        words
    }

    #[test]
    fn test_high_word_first_combination() {
        let spec = RegisterSpec::unsigned(0, 1.0);
        assert_eq!(spec.decode(&[0x0001, 0x0002]).unwrap(), 65538.0);
    }

    #[test]
    fn test_low_word_first_combination() {
        let spec = RegisterSpec::unsigned(0, 1.0).with_word_order(WordOrder::LowFirst);
        assert_eq!(spec.decode(&[0x0002, 0x0001]).unwrap(), 65538.0);
    }

    #[test]
    fn test_signed_reinterpretation() {
        let spec = RegisterSpec::signed(12, 1.0);
        assert_eq!(spec.decode(&[0xFFFF, 0xFFFF]).unwrap(), -1.0);
        assert_eq!(spec.decode(&[0x8000, 0x0000]).unwrap(), -2_147_483_648.0);
        assert_eq!(spec.decode(&[0x7FFF, 0xFFFF]).unwrap(), 2_147_483_647.0);

        let unsigned = RegisterSpec::unsigned(12, 1.0);
        assert_eq!(unsigned.decode(&[0xFFFF, 0xFFFF]).unwrap(), 4_294_967_295.0);
    }

    #[test]
    fn test_scale_applied() {
        // 230.1 V at 0.1 V resolution
        let spec = RegisterSpec::unsigned(0, 0.1);
        let volts = spec.decode(&[0x0000, 2301]).unwrap();
        assert!((volts - 230.1).abs() < 1e-9);
    }

    #[test]
    fn test_round_trip_all_orders_and_signedness() {
        let cases = [
            (0.1, 231.7),
            (0.001, 12.345),
            (0.001, -3.5),
            (0.0001, -0.4321),
            (0.001, 98765.432),
        ];
        for order in [WordOrder::HighFirst, WordOrder::LowFirst] {
            for signed in [false, true] {
                for (scale, value) in cases {
                    if !signed && value < 0.0 {
                        continue;
                    }
                    let spec = RegisterSpec {
                        address: 0,
                        count: 2,
                        signed,
                        word_order: order,
                        scale,
                    };
                    let words = encode(&spec, value);
                    let decoded = spec.decode(&words).unwrap();
                    assert!(
                        (decoded - value).abs() <= scale / 2.0,
                        "{:?} signed={} scale={} value={} decoded={}",
                        order, signed, scale, value, decoded
                    );
                }
            }
        }
    }

    #[test]
    fn test_single_and_wide_registers() {
        let single = RegisterSpec { count: 1, ..RegisterSpec::signed(0, 1.0) };
        assert_eq!(single.decode(&[0xFFFE]).unwrap(), -2.0);

        let wide = RegisterSpec { count: 3, ..RegisterSpec::unsigned(0, 1.0) };
        assert_eq!(wide.decode(&[0x0001, 0x0000, 0x0000]).unwrap(), 4_294_967_296.0);

        let wide_low = wide.clone().with_word_order(WordOrder::LowFirst);
        assert_eq!(wide_low.decode(&[0x0000, 0x0000, 0x0001]).unwrap(), 4_294_967_296.0);
    }

    #[test]
    fn test_register_count_mismatch() {
        let spec = RegisterSpec::unsigned(0, 1.0);
        assert_eq!(
            spec.decode(&[1]),
            Err(DecodeError::RegisterCountMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_unsupported_width() {
        let spec = RegisterSpec { count: 5, ..RegisterSpec::unsigned(0, 1.0) };
        assert_eq!(spec.validate(), Err(DecodeError::UnsupportedWidth(5)));
        assert_eq!(spec.decode(&[0; 5]), Err(DecodeError::UnsupportedWidth(5)));
    }
}
