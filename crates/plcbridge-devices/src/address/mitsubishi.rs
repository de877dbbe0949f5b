//! MELSEC device addresses as used by MC protocol.
//!
//! `X`, `Y` and `W` are hexadecimal; `M`, `D`, `TN`, `CN`, `SM` and `SD` decimal.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Mitsubishi MELSEC address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct MitsubishiSyntax;

impl AddressSyntax for MitsubishiSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Mitsubishi
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Mitsubishi, input);

        // Two letter devices first so that `SM`/`SD` are not read as something else.
        let address = if cur.eat("SM") {
            Address::new(MemoryArea::Special, cur.number(10)?, BitWidth::Bit)
        } else if cur.eat("SD") {
            Address::new(MemoryArea::Special, cur.number(10)?, BitWidth::Word)
        } else if cur.eat("TN") || cur.eat("T") {
            Address::new(MemoryArea::Timer, cur.number(10)?, BitWidth::Word)
        } else if cur.eat("CN") || cur.eat("C") {
            Address::new(MemoryArea::Counter, cur.number(10)?, BitWidth::Word)
        } else if cur.eat("X") {
            Address::new(MemoryArea::Input, cur.number(16)?, BitWidth::Bit)
        } else if cur.eat("Y") {
            Address::new(MemoryArea::Output, cur.number(16)?, BitWidth::Bit)
        } else if cur.eat("M") {
            Address::new(MemoryArea::Memory, cur.number(10)?, BitWidth::Bit)
        } else if cur.eat("W") {
            Address::new(MemoryArea::Memory, cur.number(16)?, BitWidth::Word)
        } else if cur.eat("D") {
            Address::new(MemoryArea::Data, cur.number(10)?, BitWidth::Word)
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
            (MemoryArea::Input, BitWidth::Bit) => Ok(format!("X{:X}", address.offset)),
            (MemoryArea::Output, BitWidth::Bit) => Ok(format!("Y{:X}", address.offset)),
            (MemoryArea::Memory, BitWidth::Bit) => Ok(format!("M{}", address.offset)),
            (MemoryArea::Memory, BitWidth::Word) => Ok(format!("W{:X}", address.offset)),
            (MemoryArea::Data, BitWidth::Word) => Ok(format!("D{}", address.offset)),
            (MemoryArea::Special, BitWidth::Bit) => Ok(format!("SM{}", address.offset)),
            (MemoryArea::Special, BitWidth::Word) => Ok(format!("SD{}", address.offset)),
            (MemoryArea::Timer, _) => Ok(format!("TN{}", address.offset)),
            (MemoryArea::Counter, _) => Ok(format!("CN{}", address.offset)),
            _ => Err(self.unrepresentable(address)),
        }
    }

    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
        match (area, width) {
            (MemoryArea::Input | MemoryArea::Output | MemoryArea::Memory | MemoryArea::Special, BitWidth::Bit) => {
                Some(AddressUnit::Bit)
            }
            (MemoryArea::Memory | MemoryArea::Data | MemoryArea::Special, BitWidth::Word) => {
                Some(AddressUnit::Word)
            }
            (MemoryArea::Timer | MemoryArea::Counter, _) => Some(AddressUnit::Element),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_devices() {
        assert_eq!(
            MitsubishiSyntax.parse("X1F").unwrap(),
            Address::new(MemoryArea::Input, 31, BitWidth::Bit)
        );
        assert_eq!(
            MitsubishiSyntax.parse("W10").unwrap(),
            Address::new(MemoryArea::Memory, 16, BitWidth::Word)
        );
        assert_eq!(
            MitsubishiSyntax
                .format(&Address::new(MemoryArea::Output, 255, BitWidth::Bit))
                .unwrap(),
            "YFF"
        );
    }

    #[test]
    fn test_special_relays_and_registers() {
        assert_eq!(
            MitsubishiSyntax.parse("SM400").unwrap(),
            Address::new(MemoryArea::Special, 400, BitWidth::Bit)
        );
        assert_eq!(
            MitsubishiSyntax.parse("SD203").unwrap(),
            Address::new(MemoryArea::Special, 203, BitWidth::Word)
        );
    }

    #[test]
    fn test_timer_short_form() {
        let address = MitsubishiSyntax.parse("T7").unwrap();
        assert_eq!(MitsubishiSyntax.format(&address).unwrap(), "TN7");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["XG", "D1A", "M", "ZR100", "D1.0"] {
            assert!(
                matches!(MitsubishiSyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
