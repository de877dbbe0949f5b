//! TwinCAT IEC direct addresses: `%IX0.1`, `%IB3`, `%QW4`, `%MD12`, `%MX100.7`.
//!
//! Byte addressed like S7; offsets of word and double word accesses are
//! byte offsets into the process image or flag area.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Beckhoff TwinCAT address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct BeckhoffSyntax;

const AREAS: &[(&str, MemoryArea)] = &[
    ("I", MemoryArea::Input),
    ("Q", MemoryArea::Output),
    ("M", MemoryArea::Memory),
];

const WIDTHS: &[(&str, BitWidth)] = &[
    ("X", BitWidth::Bit),
    ("B", BitWidth::Byte),
    ("W", BitWidth::Word),
    ("D", BitWidth::DWord),
];

impl AddressSyntax for BeckhoffSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Beckhoff
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Beckhoff, input);
        cur.expect("%")?;
        let area = cur.eat_any(AREAS).ok_or_else(|| cur.error())?;
        let width = cur.eat_any(WIDTHS).ok_or_else(|| cur.error())?;
        let offset = cur.number(10)?;

        let address = Address::new(area, offset, width);
        let address = if width == BitWidth::Bit {
            address.with_bit(cur.bit(7)?)
        } else {
            address
        };

        cur.finish()?;
        Ok(address)
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        let letter = match address.area {
            MemoryArea::Input => "I",
            MemoryArea::Output => "Q",
            MemoryArea::Memory => "M",
            _ => return Err(self.unrepresentable(address)),
        };
        match (address.width, address.bit_offset) {
            (BitWidth::Bit, Some(bit)) if bit <= 7 => {
                Ok(format!("%{}X{}.{}", letter, address.offset, bit))
            }
            (BitWidth::Byte, None) => Ok(format!("%{}B{}", letter, address.offset)),
            (BitWidth::Word, None) => Ok(format!("%{}W{}", letter, address.offset)),
            (BitWidth::DWord, None) => Ok(format!("%{}D{}", letter, address.offset)),
            _ => Err(self.unrepresentable(address)),
        }
    }

    fn unit(&self, area: MemoryArea, _width: BitWidth) -> Option<AddressUnit> {
        match area {
            MemoryArea::Input | MemoryArea::Output | MemoryArea::Memory => Some(AddressUnit::Byte),
            _ => None,
        }
    }

    fn max_bit(&self) -> u8 {
        7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_and_words() {
        assert_eq!(
            BeckhoffSyntax.parse("%IX0.1").unwrap(),
            Address::new(MemoryArea::Input, 0, BitWidth::Bit).with_bit(1)
        );
        assert_eq!(
            BeckhoffSyntax.parse("%QW4").unwrap(),
            Address::new(MemoryArea::Output, 4, BitWidth::Word)
        );
        let md = Address::new(MemoryArea::Memory, 12, BitWidth::DWord);
        assert_eq!(BeckhoffSyntax.format(&md).unwrap(), "%MD12");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["%IX0", "%IX0.8", "%I0", "%DW1", "IW2"] {
            assert!(
                matches!(BeckhoffSyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
