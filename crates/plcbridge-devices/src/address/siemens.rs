//! S7 absolute addresses: `I0.0`, `IW2`, `MD8`, `DB1.DBX0.3`, `DB1.DBW0`, `T5`, `C3`.
//!
//! German mnemonics (`E`, `A`, `Z`) are accepted and formatted in English.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Siemens S7 address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct SiemensSyntax;

const AREA_PREFIXES: &[(&str, MemoryArea)] = &[
    ("I", MemoryArea::Input),
    ("E", MemoryArea::Input),
    ("Q", MemoryArea::Output),
    ("A", MemoryArea::Output),
    ("M", MemoryArea::Memory),
];

const WIDTHS: &[(&str, BitWidth)] = &[
    ("B", BitWidth::Byte),
    ("W", BitWidth::Word),
    ("D", BitWidth::DWord),
];

const DB_WIDTHS: &[(&str, BitWidth)] = &[
    ("X", BitWidth::Bit),
    ("B", BitWidth::Byte),
    ("W", BitWidth::Word),
    ("D", BitWidth::DWord),
];

fn width_letter(width: BitWidth) -> &'static str {
    match width {
        BitWidth::Bit => "X",
        BitWidth::Byte => "B",
        BitWidth::Word => "W",
        BitWidth::DWord => "D",
    }
}

impl AddressSyntax for SiemensSyntax {
    fn vendor(&self) -> Vendor {
        Vendor::Siemens
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::Siemens, input);

        let address = if cur.eat("DB") {
            let block = cur.number(10)?;
            cur.expect(".DB")?;
            let width = cur.eat_any(DB_WIDTHS).ok_or_else(|| cur.error())?;
            let offset = cur.number(10)?;
            let address = Address::new(MemoryArea::Data, offset, width).with_block(block);
            if width == BitWidth::Bit {
                address.with_bit(cur.bit(7)?)
            } else {
                address
            }
        } else if cur.eat("T") {
            Address::new(MemoryArea::Timer, cur.number(10)?, BitWidth::Word)
        } else if cur.eat("C") || cur.eat("Z") {
            Address::new(MemoryArea::Counter, cur.number(10)?, BitWidth::Word)
        } else if let Some(area) = cur.eat_any(AREA_PREFIXES) {
            match cur.eat_any(WIDTHS) {
                Some(width) => Address::new(area, cur.number(10)?, width),
                None => {
                    let offset = cur.number(10)?;
                    Address::new(area, offset, BitWidth::Bit).with_bit(cur.bit(7)?)
                }
            }
        } else {
            return Err(cur.error());
        };

        cur.finish()?;
        Ok(address)
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        let prefix = match address.area {
            MemoryArea::Input => "I",
            MemoryArea::Output => "Q",
            MemoryArea::Memory => "M",
            MemoryArea::Timer => return Ok(format!("T{}", address.offset)),
            MemoryArea::Counter => return Ok(format!("C{}", address.offset)),
            MemoryArea::Data => {
                let block = address.block.ok_or_else(|| self.unrepresentable(address))?;
                let mut text = format!(
                    "DB{}.DB{}{}",
                    block,
                    width_letter(address.width),
                    address.offset
                );
                if address.width == BitWidth::Bit {
                    let bit = address.bit_offset.ok_or_else(|| self.unrepresentable(address))?;
                    text.push_str(&format!(".{}", bit));
                }
                return Ok(text);
            }
            MemoryArea::Special => return Err(self.unrepresentable(address)),
        };

        match (address.width, address.bit_offset) {
            (BitWidth::Bit, Some(bit)) if bit <= 7 => Ok(format!("{}{}.{}", prefix, address.offset, bit)),
            (BitWidth::Bit, _) => Err(self.unrepresentable(address)),
            (width, _) => Ok(format!("{}{}{}", prefix, width_letter(width), address.offset)),
        }
    }

    fn unit(&self, area: MemoryArea, _width: BitWidth) -> Option<AddressUnit> {
        match area {
            MemoryArea::Input | MemoryArea::Output | MemoryArea::Memory | MemoryArea::Data => {
                Some(AddressUnit::Byte)
            }
            MemoryArea::Timer | MemoryArea::Counter => Some(AddressUnit::Element),
            MemoryArea::Special => None,
        }
    }

    fn default_block(&self, area: MemoryArea, _width: BitWidth) -> Option<u32> {
        (area == MemoryArea::Data).then_some(1)
    }

    fn max_bit(&self) -> u8 {
        7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Address, AddressError> {
        SiemensSyntax.parse(s)
    }

    #[test]
    fn test_data_block_word() {
        let address = parse("DB1.DBW0").unwrap();
        assert_eq!(
            address,
            Address {
                area: MemoryArea::Data,
                block: Some(1),
                offset: 0,
                bit_offset: None,
                width: BitWidth::Word,
            }
        );
        assert_eq!(SiemensSyntax.format(&address).unwrap(), "DB1.DBW0");
    }

    #[test]
    fn test_data_block_bit() {
        let address = parse("DB10.DBX4.7").unwrap();
        assert_eq!(address.block, Some(10));
        assert_eq!(address.offset, 4);
        assert_eq!(address.bit_offset, Some(7));
        assert_eq!(address.width, BitWidth::Bit);
    }

    #[test]
    fn test_process_image_and_flags() {
        assert_eq!(
            parse("I0.3").unwrap(),
            Address::new(MemoryArea::Input, 0, BitWidth::Bit).with_bit(3)
        );
        assert_eq!(parse("EW4").unwrap(), Address::new(MemoryArea::Input, 4, BitWidth::Word));
        assert_eq!(parse("qb2").unwrap(), Address::new(MemoryArea::Output, 2, BitWidth::Byte));
        assert_eq!(parse("MD100").unwrap(), Address::new(MemoryArea::Memory, 100, BitWidth::DWord));
        assert_eq!(parse("Z7").unwrap(), Address::new(MemoryArea::Counter, 7, BitWidth::Word));
    }

    #[test]
    fn test_german_mnemonics_format_in_english() {
        let address = parse("A1.0").unwrap();
        assert_eq!(SiemensSyntax.format(&address).unwrap(), "Q1.0");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "DB1", "DB1.DBW", "M10", "M10.8", "MW", "X0.0", "DB1.DBX0", "MW10x"] {
            assert!(
                matches!(parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_offending_substring() {
        match parse("MW10x") {
            Err(AddressError::Parse { offending, .. }) => assert_eq!(offending, "x"),
            other => panic!("unexpected {:?}", other),
        }
        match parse("I0.9") {
            Err(AddressError::Parse { offending, .. }) => assert_eq!(offending, "9"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_special_area_is_unrepresentable() {
        let address = Address::new(MemoryArea::Special, 0, BitWidth::Word);
        assert!(matches!(
            SiemensSyntax.format(&address),
            Err(AddressError::Unrepresentable { .. })
        ));
    }
}
