//! Conversion between bank values and 16-bit register words.

use crate::config::{RegisterConfig, RegisterEncoding};

/// Register layout of a bank: encoding plus scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterLayout {
    encoding: RegisterEncoding,
    scale: f64,
}

impl RegisterLayout {
    pub fn new(encoding: RegisterEncoding, scale: f64) -> Self {
        Self { encoding, scale }
    }

    pub fn encoding(&self) -> RegisterEncoding {
        self.encoding
    }

    /// Registers occupied by one value.
    pub fn words_per_value(&self) -> usize {
        match self.encoding {
            RegisterEncoding::U16 | RegisterEncoding::I16 => 1,
            RegisterEncoding::F32 => 2,
        }
    }

    /// Registers occupied by a bank of `len` values.
    pub fn register_count(&self, len: usize) -> usize {
        len * self.words_per_value()
    }

    /// Encode a whole bank into registers.
    pub fn encode(&self, values: &[f64]) -> Vec<u16> {
        let mut words = Vec::with_capacity(self.register_count(values.len()));
        for value in values {
            match self.encoding {
                RegisterEncoding::U16 => {
                    let scaled = (value * self.scale).round().clamp(0.0, u16::MAX as f64);
                    words.push(scaled as u16);
                }
                RegisterEncoding::I16 => {
                    let scaled = (value * self.scale)
                        .round()
                        .clamp(i16::MIN as f64, i16::MAX as f64);
                    words.push(scaled as i16 as u16);
                }
                RegisterEncoding::F32 => {
                    let bits = (*value as f32).to_bits();
                    words.push((bits >> 16) as u16);
                    words.push(bits as u16);
                }
            }
        }
        words
    }

    /// Decode registers into values. `words` must hold whole values.
    pub fn decode(&self, words: &[u16]) -> Vec<f64> {
        words
            .chunks_exact(self.words_per_value())
            .map(|chunk| match self.encoding {
                RegisterEncoding::U16 => chunk[0] as f64 / self.scale,
                RegisterEncoding::I16 => chunk[0] as i16 as f64 / self.scale,
                RegisterEncoding::F32 => {
                    let bits = ((chunk[0] as u32) << 16) | (chunk[1] as u32);
                    f32::from_bits(bits) as f64
                }
            })
            .collect()
    }
}

impl From<&RegisterConfig> for RegisterLayout {
    fn from(config: &RegisterConfig) -> Self {
        Self::new(config.encoding, config.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_scaled() {
        let layout = RegisterLayout::new(RegisterEncoding::U16, 100.0);
        assert_eq!(layout.encode(&[10.0, 0.01, 199.99]), vec![1000, 1, 19999]);
        assert_eq!(layout.decode(&[1234]), vec![12.34]);
    }

    #[test]
    fn test_u16_saturates() {
        let layout = RegisterLayout::new(RegisterEncoding::U16, 100.0);
        assert_eq!(layout.encode(&[-3.0, 1000.0]), vec![0, u16::MAX]);
    }

    #[test]
    fn test_i16_signed() {
        let layout = RegisterLayout::new(RegisterEncoding::I16, 10.0);
        assert_eq!(layout.encode(&[-1.5, 2.0]), vec![(-15i16) as u16, 20]);
        assert_eq!(layout.decode(&[(-15i16) as u16]), vec![-1.5]);
        assert_eq!(layout.encode(&[-5000.0]), vec![i16::MIN as u16]);
    }

    #[test]
    fn test_f32_big_endian_words() {
        let layout = RegisterLayout::new(RegisterEncoding::F32, 1.0);
        // 123.456f32 = 0x42F6E979
        let words = layout.encode(&[123.456]);
        assert_eq!(words, vec![0x42F6, 0xE979]);

        let decoded = layout.decode(&words);
        assert!((decoded[0] - 123.456).abs() < 1e-4);
        assert_eq!(layout.register_count(11), 22);
    }
}
