//! Omron CS/CJ/NJ memory area addresses: `CIO 100`, `CIO0.05`, `W3.15`,
//! `D200` (or `DM200`), `T1`, `C2`, `A500`.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Omron address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct OmronSyntax;

const PREFIXES: &[(&str, MemoryArea)] = &[
    ("CIO", MemoryArea::Input),
    ("DM", MemoryArea::Data),
    ("D", MemoryArea::Data),
    ("W", MemoryArea::Memory),
    ("A", MemoryArea::Special),
    ("T", MemoryArea::Timer),
    ("C", MemoryArea::Counter),
];

impl AddressSyntax for OmronSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Omron
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Omron, input);
        let area = cur.eat_any(PREFIXES).ok_or_else(|| cur.error())?;
        cur.skip_spaces();
        let word = cur.number(10)?;

        let address = match area {
            MemoryArea::Timer | MemoryArea::Counter | MemoryArea::Data => {
                Address::new(area, word, BitWidth::Word)
            }
            _ if !cur.at_end() => Address::new(area, word, BitWidth::Word).with_bit(cur.bit(15)?),
            _ => Address::new(area, word, BitWidth::Word),
        };

        cur.finish()?;
        Ok(address)
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        let prefix = match address.area {
            MemoryArea::Input => "CIO",
            MemoryArea::Memory => "W",
            MemoryArea::Special => "A",
            MemoryArea::Data if address.width == BitWidth::Word => "D",
            MemoryArea::Timer => return Ok(format!("T{}", address.offset)),
            MemoryArea::Counter => return Ok(format!("C{}", address.offset)),
            _ => return Err(self.unrepresentable(address)),
        };

        match (address.width, address.bit_offset) {
            (BitWidth::Word, None) => Ok(format!("{}{}", prefix, address.offset)),
            (BitWidth::Bit, Some(bit)) if bit <= 15 && address.area != MemoryArea::Data => {
                Ok(format!("{}{}.{:02}", prefix, address.offset, bit))
            }
            _ => Err(self.unrepresentable(address)),
        }
    }

    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
        match (area, width) {
            (MemoryArea::Input | MemoryArea::Memory | MemoryArea::Special, BitWidth::Word | BitWidth::Bit) => {
                Some(AddressUnit::Word)
            }
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
    fn test_cio_word_and_bit() {
        assert_eq!(
            OmronSyntax.parse("CIO 100").unwrap(),
            Address::new(MemoryArea::Input, 100, BitWidth::Word)
        );
        let bit = OmronSyntax.parse("cio0.05").unwrap();
        assert_eq!(bit, Address::new(MemoryArea::Input, 0, BitWidth::Word).with_bit(5));
        assert_eq!(OmronSyntax.format(&bit).unwrap(), "CIO0.05");
    }

    #[test]
    fn test_dm_alias() {
        assert_eq!(OmronSyntax.parse("DM10").unwrap(), OmronSyntax.parse("D10").unwrap());
        assert_eq!(
            OmronSyntax.format(&OmronSyntax.parse("DM10").unwrap()).unwrap(),
            "D10"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["CIO", "W1.16", "D1.2", "H10", "T1.1", "CIO1.x"] {
            assert!(
                matches!(OmronSyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
