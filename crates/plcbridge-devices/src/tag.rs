/*!
 * Tag values and the conversions between raw controller memory and
 * typed values.
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plcbridge_core::types::Value;

use crate::address::BitWidth;
use crate::device::{DeviceError, Result};

/// Quality of a sampled value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Value read successfully
    Good,
    /// Read failed; the value is meaningless
    Bad,
    /// Value read but may be stale or out of range
    Uncertain,
}

/// Data type of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Single bit
    Bool,
    /// Unsigned 8 bit
    Byte,
    /// Unsigned 16 bit
    Word,
    /// Unsigned 32 bit
    DWord,
    /// Signed 16 bit
    Int,
    /// Signed 32 bit
    DInt,
    /// IEEE-754 single
    Real,
    /// IEEE-754 double
    LReal,
    /// Text
    String,
    /// Uninterpreted bytes
    Raw,
}

/// Byte order of multi-byte values on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first (S7, FINS, Modbus registers)
    Big,
    /// Least significant byte first (CIP, ADS, MC)
    Little,
}

impl DataType {
    /// Default type for an access width
    pub fn for_width(width: BitWidth) -> Self {
        match width {
            BitWidth::Bit => DataType::Bool,
            BitWidth::Byte => DataType::Byte,
            BitWidth::Word => DataType::Word,
            BitWidth::DWord => DataType::DWord,
        }
    }

    /// Encoded size in bytes, `None` for variable length types
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Byte => Some(1),
            DataType::Word | DataType::Int => Some(2),
            DataType::DWord | DataType::DInt | DataType::Real => Some(4),
            DataType::LReal => Some(8),
            DataType::String | DataType::Raw => None,
        }
    }

    /// Decode a value from raw bytes
    ///
    /// Returns `None` when `bytes` is too short for the type.
    pub fn decode(&self, bytes: &[u8], order: ByteOrder) -> Option<Value> {
        if let Some(size) = self.size() {
            if bytes.len() < size {
                return None;
            }
        }

        fn arr<const N: usize>(bytes: &[u8], order: ByteOrder) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(&bytes[..N]);
            if order == ByteOrder::Little {
                out.reverse();
            }
            out
        }

        let value = match self {
            DataType::Bool => Value::Bool(bytes[0] & 0x01 != 0),
            DataType::Byte => Value::from(bytes[0]),
            DataType::Word => Value::from(u16::from_be_bytes(arr(bytes, order))),
            DataType::Int => Value::from(i16::from_be_bytes(arr(bytes, order))),
            DataType::DWord => Value::from(u32::from_be_bytes(arr(bytes, order))),
            DataType::DInt => Value::from(i32::from_be_bytes(arr(bytes, order))),
            DataType::Real => Value::from(f32::from_be_bytes(arr(bytes, order))),
            DataType::LReal => Value::from(f64::from_be_bytes(arr(bytes, order))),
            DataType::String => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Value::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            DataType::Raw => Value::Binary(bytes.to_vec()),
        };
        Some(value)
    }

    /// Encode a value into raw bytes, range checked against the type
    pub fn encode(&self, value: &Value, order: ByteOrder, tag: &str) -> Result<Vec<u8>> {
        fn int_in(value: &Value, tag: &str, min: i64, max: i64) -> Result<i64> {
            let i = value
                .as_integer()
                .ok_or_else(|| DeviceError::invalid_value(tag, format!("expected an integer, got {}", value)))?;
            if i < min || i > max {
                return Err(DeviceError::invalid_value(
                    tag,
                    format!("{} is outside {}..={}", i, min, max),
                ));
            }
            Ok(i)
        }

        fn ordered(mut be: Vec<u8>, order: ByteOrder) -> Vec<u8> {
            if order == ByteOrder::Little {
                be.reverse();
            }
            be
        }

        let bytes = match self {
            DataType::Bool => {
                let b = value
                    .as_bool()
                    .ok_or_else(|| DeviceError::invalid_value(tag, format!("expected a boolean, got {}", value)))?;
                vec![u8::from(b)]
            }
            DataType::Byte => vec![int_in(value, tag, 0, u8::MAX as i64)? as u8],
            DataType::Word => ordered(
                (int_in(value, tag, 0, u16::MAX as i64)? as u16).to_be_bytes().to_vec(),
                order,
            ),
            DataType::Int => ordered(
                (int_in(value, tag, i16::MIN as i64, i16::MAX as i64)? as i16)
                    .to_be_bytes()
                    .to_vec(),
                order,
            ),
            DataType::DWord => ordered(
                (int_in(value, tag, 0, u32::MAX as i64)? as u32).to_be_bytes().to_vec(),
                order,
            ),
            DataType::DInt => ordered(
                (int_in(value, tag, i32::MIN as i64, i32::MAX as i64)? as i32)
                    .to_be_bytes()
                    .to_vec(),
                order,
            ),
            DataType::Real => {
                let f = value
                    .as_float()
                    .ok_or_else(|| DeviceError::invalid_value(tag, format!("expected a number, got {}", value)))?;
                ordered((f as f32).to_be_bytes().to_vec(), order)
            }
            DataType::LReal => {
                let f = value
                    .as_float()
                    .ok_or_else(|| DeviceError::invalid_value(tag, format!("expected a number, got {}", value)))?;
                ordered(f.to_be_bytes().to_vec(), order)
            }
            DataType::String => value
                .as_str()
                .ok_or_else(|| DeviceError::invalid_value(tag, format!("expected a string, got {}", value)))?
                .as_bytes()
                .to_vec(),
            DataType::Raw => value
                .as_binary()
                .ok_or_else(|| DeviceError::invalid_value(tag, "expected binary data"))?
                .to_vec(),
        };
        Ok(bytes)
    }
}

/// A sampled tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    /// Tag name or address as requested
    pub name: String,
    /// The value
    pub value: Value,
    /// Type the value was decoded as
    pub data_type: DataType,
    /// Sample quality
    pub quality: Quality,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

impl TagValue {
    /// A good quality sample taken now
    pub fn good<S: Into<String>>(name: S, value: Value, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            value,
            data_type,
            quality: Quality::Good,
            timestamp: Utc::now(),
        }
    }

    /// A bad quality sample taken now
    pub fn bad<S: Into<String>>(name: S, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
            data_type,
            quality: Quality::Bad,
            timestamp: Utc::now(),
        }
    }

    /// True for good quality samples
    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

/// Pack bits least significant first into bytes
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits, least significant first
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map_or(false, |b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Serialize 16 bit registers high byte first
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Group bytes into 16 bit registers high byte first, zero padding an odd tail
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_orders() {
        assert_eq!(
            DataType::Word.decode(&[0x12, 0x34], ByteOrder::Big),
            Some(Value::Integer(0x1234))
        );
        assert_eq!(
            DataType::Word.decode(&[0x12, 0x34], ByteOrder::Little),
            Some(Value::Integer(0x3412))
        );
        assert_eq!(
            DataType::Int.decode(&[0xFF, 0xFE], ByteOrder::Big),
            Some(Value::Integer(-2))
        );
        assert_eq!(DataType::DWord.decode(&[0, 1], ByteOrder::Big), None);
        assert_eq!(
            DataType::String.decode(b"CPU 315\0\0", ByteOrder::Big),
            Some(Value::String("CPU 315".to_string()))
        );
    }

    #[test]
    fn test_encode_range_checks() {
        assert_eq!(
            DataType::Word.encode(&Value::Integer(258), ByteOrder::Big, "MW0").unwrap(),
            vec![0x01, 0x02]
        );
        assert_eq!(
            DataType::DInt.encode(&Value::Integer(-1), ByteOrder::Little, "D0").unwrap(),
            vec![0xFF; 4]
        );
        assert!(matches!(
            DataType::Byte.encode(&Value::Integer(300), ByteOrder::Big, "MB0"),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(matches!(
            DataType::Word.encode(&Value::String("x".into()), ByteOrder::Big, "MW0"),
            Err(DeviceError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_real_encoding() {
        let bytes = DataType::Real.encode(&Value::Float(1.5), ByteOrder::Big, "MD0").unwrap();
        assert_eq!(bytes, vec![0x3F, 0xC0, 0x00, 0x00]);
        assert_eq!(
            DataType::Real.decode(&bytes, ByteOrder::Big),
            Some(Value::Float(1.5))
        );
    }

    #[test]
    fn test_bit_packing() {
        let bits = [true, false, true, false, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_0101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, 9), bits.to_vec());
    }

    #[test]
    fn test_word_conversion() {
        assert_eq!(words_to_bytes(&[0x0102, 0xA0B0]), vec![1, 2, 0xA0, 0xB0]);
        assert_eq!(bytes_to_words(&[1, 2, 3]), vec![0x0102, 0x0300]);
    }
}
