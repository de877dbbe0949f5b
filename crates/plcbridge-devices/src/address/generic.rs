//! Classic Modicon register references for plain Modbus devices.
//!
//! The leading digit selects the table (`0` coils, `1` discrete inputs,
//! `3` input registers, `4` holding registers) and the remaining four or
//! five digits are a one-based register number.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Modicon reference grammar for generic Modbus devices
#[derive(Debug, Clone, Copy, Default)]
pub struct ModiconSyntax;

impl AddressSyntax for ModiconSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Generic
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Generic, input);
        let (table, area, width) = cur
            .eat_any(&[
                ("0", (0u8, MemoryArea::Output, BitWidth::Bit)),
                ("1", (1u8, MemoryArea::Input, BitWidth::Bit)),
                ("3", (3u8, MemoryArea::Input, BitWidth::Word)),
                ("4", (4u8, MemoryArea::Data, BitWidth::Word)),
            ])
            .ok_or_else(|| cur.error())?;

        let before = cur.error();
        let (number, digits) = cur.digits()?;
        cur.finish()?;

        if !(4..=5).contains(&digits) || number == 0 || number > 65536 {
            return Err(before);
        }
        tracing::trace!(table, number, "parsed Modicon reference");

        Ok(Address::new(area, number - 1, width))
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        let table = match (address.area, address.width) {
            (MemoryArea::Output, BitWidth::Bit) => '0',
            (MemoryArea::Input, BitWidth::Bit) => '1',
            (MemoryArea::Input, BitWidth::Word) => '3',
            (MemoryArea::Data, BitWidth::Word) => '4',
            _ => return Err(self.unrepresentable(address)),
        };
        if address.bit_offset.is_some() || address.offset > 65535 {
            return Err(self.unrepresentable(address));
        }

        let number = address.offset + 1;
        if number <= 9999 {
            Ok(format!("{}{:04}", table, number))
        } else {
            Ok(format!("{}{:05}", table, number))
        }
    }

    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
        match (area, width) {
            (MemoryArea::Output | MemoryArea::Input, BitWidth::Bit) => Some(AddressUnit::Bit),
            (MemoryArea::Input | MemoryArea::Data, BitWidth::Word) => Some(AddressUnit::Word),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        assert_eq!(
            ModiconSyntax.parse("00001").unwrap(),
            Address::new(MemoryArea::Output, 0, BitWidth::Bit)
        );
        assert_eq!(
            ModiconSyntax.parse("10020").unwrap(),
            Address::new(MemoryArea::Input, 19, BitWidth::Bit)
        );
        assert_eq!(
            ModiconSyntax.parse("30001").unwrap(),
            Address::new(MemoryArea::Input, 0, BitWidth::Word)
        );
        assert_eq!(
            ModiconSyntax.parse("440001").unwrap(),
            Address::new(MemoryArea::Data, 40000, BitWidth::Word)
        );
    }

    #[test]
    fn test_six_digit_format() {
        let address = Address::new(MemoryArea::Data, 12344, BitWidth::Word);
        assert_eq!(ModiconSyntax.format(&address).unwrap(), "412345");
        assert_eq!(
            ModiconSyntax.format(&Address::new(MemoryArea::Data, 99, BitWidth::Word)).unwrap(),
            "40100"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["40000", "2001", "50001", "4001", "4000001", "4x001"] {
            assert!(
                matches!(ModiconSyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
