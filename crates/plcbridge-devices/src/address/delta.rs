//! Delta DVP device addresses.
//!
//! `X` and `Y` are numbered in octal; `M`, `S`, `T`, `C` and `D` in decimal.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Delta DVP address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaSyntax;

impl AddressSyntax for DeltaSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Delta
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Delta, input);

        let address = if cur.eat("X") {
            Address::new(MemoryArea::Input, cur.number(8)?, BitWidth::Bit)
        } else if cur.eat("Y") {
            Address::new(MemoryArea::Output, cur.number(8)?, BitWidth::Bit)
        } else if cur.eat("M") {
            Address::new(MemoryArea::Memory, cur.number(10)?, BitWidth::Bit)
        } else if cur.eat("S") {
            Address::new(MemoryArea::Special, cur.number(10)?, BitWidth::Bit)
        } else if cur.eat("D") {
            Address::new(MemoryArea::Data, cur.number(10)?, BitWidth::Word)
        } else if cur.eat("T") {
            Address::new(MemoryArea::Timer, cur.number(10)?, BitWidth::Word)
        } else if cur.eat("C") {
            Address::new(MemoryArea::Counter, cur.number(10)?, BitWidth::Word)
        } else {
            return Err(cur.error());
        };

        cur.finish()?;
        Ok(address)
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        if address.bit_offset.is_some() {
            return Err(self.unrepresentable(address));
        }
        match (address.area, address.width) {
            (MemoryArea::Input, BitWidth::Bit) => Ok(format!("X{:o}", address.offset)),
            (MemoryArea::Output, BitWidth::Bit) => Ok(format!("Y{:o}", address.offset)),
            (MemoryArea::Memory, BitWidth::Bit) => Ok(format!("M{}", address.offset)),
            (MemoryArea::Special, BitWidth::Bit) => Ok(format!("S{}", address.offset)),
            (MemoryArea::Data, BitWidth::Word) => Ok(format!("D{}", address.offset)),
            (MemoryArea::Timer, _) => Ok(format!("T{}", address.offset)),
            (MemoryArea::Counter, _) => Ok(format!("C{}", address.offset)),
            _ => Err(self.unrepresentable(address)),
        }
    }

    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
        match (area, width) {
            (
                MemoryArea::Input | MemoryArea::Output | MemoryArea::Memory | MemoryArea::Special,
                BitWidth::Bit,
            ) => Some(AddressUnit::Bit),
            (MemoryArea::Data, BitWidth::Word) => Some(AddressUnit::Word),
            (MemoryArea::Timer | MemoryArea::Counter, _) => Some(AddressUnit::Element),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octal_io() {
        assert_eq!(
            DeltaSyntax.parse("X17").unwrap(),
            Address::new(MemoryArea::Input, 15, BitWidth::Bit)
        );
        assert_eq!(
            DeltaSyntax.format(&Address::new(MemoryArea::Output, 8, BitWidth::Bit)).unwrap(),
            "Y10"
        );
    }

    #[test]
    fn test_data_register() {
        assert_eq!(
            DeltaSyntax.parse("D100").unwrap(),
            Address::new(MemoryArea::Data, 100, BitWidth::Word)
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["X8", "Y19", "D", "D1.2", "Q0", "M-1"] {
            assert!(
                matches!(DeltaSyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
