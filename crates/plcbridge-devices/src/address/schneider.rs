//! Unity / Modicon IEC located variables: `%I3`, `%IW2`, `%Q1`, `%QW0`,
//! `%M100`, `%MW100`, `%MD20`, `%S6`, `%SW50`.
//!
//! `%MD` overlays two consecutive `%MW` words, so its offset counts words.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Schneider Electric address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct SchneiderSyntax;

const AREAS: &[(&str, MemoryArea)] = &[
    ("I", MemoryArea::Input),
    ("Q", MemoryArea::Output),
    ("M", MemoryArea::Memory),
    ("S", MemoryArea::Special),
];

fn area_letter(area: MemoryArea) -> Option<&'static str> {
    match area {
        MemoryArea::Input => Some("I"),
        MemoryArea::Output => Some("Q"),
        MemoryArea::Memory => Some("M"),
        MemoryArea::Special => Some("S"),
        _ => None,
    }
}

impl AddressSyntax for SchneiderSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Schneider
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Schneider, input);
        cur.expect("%")?;
        let area = cur.eat_any(AREAS).ok_or_else(|| cur.error())?;

        let width = if cur.eat("W") {
            BitWidth::Word
        } else if area == MemoryArea::Memory && cur.eat("D") {
            BitWidth::DWord
        } else {
            BitWidth::Bit
        };

        let address = Address::new(area, cur.number(10)?, width);
        cur.finish()?;
        Ok(address)
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        let letter = area_letter(address.area).ok_or_else(|| self.unrepresentable(address))?;
        if address.bit_offset.is_some() {
            return Err(self.unrepresentable(address));
        }
        match address.width {
            BitWidth::Bit => Ok(format!("%{}{}", letter, address.offset)),
            BitWidth::Word => Ok(format!("%{}W{}", letter, address.offset)),
            BitWidth::DWord if address.area == MemoryArea::Memory => {
                Ok(format!("%MD{}", address.offset))
            }
            _ => Err(self.unrepresentable(address)),
        }
    }

    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
        area_letter(area)?;
        match (area, width) {
            (_, BitWidth::Bit) => Some(AddressUnit::Bit),
            (_, BitWidth::Word) => Some(AddressUnit::Word),
            (MemoryArea::Memory, BitWidth::DWord) => Some(AddressUnit::Word),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_word() {
        let address = SchneiderSyntax.parse("%MW100").unwrap();
        assert_eq!(address, Address::new(MemoryArea::Memory, 100, BitWidth::Word));
        assert_eq!(SchneiderSyntax.format(&address).unwrap(), "%MW100");
    }

    #[test]
    fn test_bits_and_double_words() {
        assert_eq!(
            SchneiderSyntax.parse("%m7").unwrap(),
            Address::new(MemoryArea::Memory, 7, BitWidth::Bit)
        );
        assert_eq!(
            SchneiderSyntax.parse("%MD20").unwrap(),
            Address::new(MemoryArea::Memory, 20, BitWidth::DWord)
        );
        assert_eq!(
            SchneiderSyntax.parse("%SW50").unwrap(),
            Address::new(MemoryArea::Special, 50, BitWidth::Word)
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["MW100", "%ID3", "%X1", "%MW", "%MF10", "%MW1.2"] {
            assert!(
                matches!(SchneiderSyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }
}
