//! PLC-5 / SLC 500 data table addresses.
//!
//! `I:e/b` and `O:e/b` address the I/O image, `S:e/b` the status file and
//! `Nf:e/b`, `Lf:e`, `Bf:e/b`, `Tf:e`, `Cf:e` the numbered data files.
//! Logix controllers use symbolic tag names instead, handled by the driver.

use super::{Address, AddressError, AddressSyntax, AddressUnit, BitWidth, Cursor, MemoryArea};
use crate::vendor::Vendor;

/// Allen-Bradley data table address grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct AllenBradleySyntax;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Input,
    Output,
    Status,
    Integer,
    Long,
    Binary,
    Timer,
    Counter,
}

const FILE_PREFIXES: &[(&str, FileKind)] = &[
    ("I", FileKind::Input),
    ("O", FileKind::Output),
    ("S", FileKind::Status),
    ("N", FileKind::Integer),
    ("L", FileKind::Long),
    ("B", FileKind::Binary),
    ("T", FileKind::Timer),
    ("C", FileKind::Counter),
];

impl AllenBradleySyntax {
    fn parse_bit(cur: &mut Cursor<'_>, address: Address) -> Result<Address, AddressError> {
        if cur.eat("/") {
            let start_error = cur.error();
            let bit = cur.number(10)?;
            if bit > 15 {
                return Err(start_error);
            }
            Ok(address.with_bit(bit as u8))
        } else {
            Ok(address)
        }
    }
}

impl AddressSyntax for AllenBradleySyntax {
    fn vendor(&self) -> Vendor {
        Vendor::AllenBradley
    }

    fn parse(&self, input: &str) -> Result<Address, AddressError> {
        let mut cur = Cursor::new(Vendor::AllenBradley, input);
        let kind = cur.eat_any(FILE_PREFIXES).ok_or_else(|| cur.error())?;

        let address = match kind {
            FileKind::Input | FileKind::Output | FileKind::Status => {
                cur.expect(":")?;
                let element = cur.number(10)?;
                let area = match kind {
                    FileKind::Input => MemoryArea::Input,
                    FileKind::Output => MemoryArea::Output,
                    _ => MemoryArea::Special,
                };
                Self::parse_bit(&mut cur, Address::new(area, element, BitWidth::Word))?
            }
            _ => {
                let file = cur.number(10)?;
                cur.expect(":")?;
                let element = cur.number(10)?;
                match kind {
                    FileKind::Integer => Self::parse_bit(
                        &mut cur,
                        Address::new(MemoryArea::Data, element, BitWidth::Word).with_block(file),
                    )?,
                    FileKind::Binary => Self::parse_bit(
                        &mut cur,
                        Address::new(MemoryArea::Memory, element, BitWidth::Word).with_block(file),
                    )?,
                    FileKind::Long => {
                        Address::new(MemoryArea::Data, element, BitWidth::DWord).with_block(file)
                    }
                    FileKind::Timer => {
                        Address::new(MemoryArea::Timer, element, BitWidth::Word).with_block(file)
                    }
                    _ => Address::new(MemoryArea::Counter, element, BitWidth::Word).with_block(file),
                }
            }
        };

        cur.finish()?;
        Ok(address)
    }

    fn format(&self, address: &Address) -> Result<String, AddressError> {
        let bit_suffix = match (address.width, address.bit_offset) {
            (BitWidth::Bit, Some(bit)) if bit <= 15 => format!("/{}", bit),
            (BitWidth::Bit, _) => return Err(self.unrepresentable(address)),
            _ => String::new(),
        };
        let file = || address.block.ok_or_else(|| self.unrepresentable(address));

        let text = match (address.area, address.width) {
            (MemoryArea::Input, BitWidth::Word | BitWidth::Bit) => format!("I:{}{}", address.offset, bit_suffix),
            (MemoryArea::Output, BitWidth::Word | BitWidth::Bit) => format!("O:{}{}", address.offset, bit_suffix),
            (MemoryArea::Special, BitWidth::Word | BitWidth::Bit) => format!("S:{}{}", address.offset, bit_suffix),
            (MemoryArea::Data, BitWidth::Word | BitWidth::Bit) => {
                format!("N{}:{}{}", file()?, address.offset, bit_suffix)
            }
            (MemoryArea::Data, BitWidth::DWord) => format!("L{}:{}", file()?, address.offset),
            (MemoryArea::Memory, BitWidth::Word | BitWidth::Bit) => {
                format!("B{}:{}{}", file()?, address.offset, bit_suffix)
            }
            (MemoryArea::Timer, _) => format!("T{}:{}", file()?, address.offset),
            (MemoryArea::Counter, _) => format!("C{}:{}", file()?, address.offset),
            _ => return Err(self.unrepresentable(address)),
        };
        Ok(text)
    }

    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
        match (area, width) {
            (MemoryArea::Timer | MemoryArea::Counter, _) => Some(AddressUnit::Element),
            (MemoryArea::Data, BitWidth::DWord) => Some(AddressUnit::DWord),
            (
                MemoryArea::Input
                | MemoryArea::Output
                | MemoryArea::Special
                | MemoryArea::Data
                | MemoryArea::Memory,
                BitWidth::Word | BitWidth::Bit,
            ) => Some(AddressUnit::Word),
            _ => None,
        }
    }

    fn default_block(&self, area: MemoryArea, width: BitWidth) -> Option<u32> {
        match (area, width) {
            (MemoryArea::Data, BitWidth::DWord) => Some(9),
            (MemoryArea::Data, _) => Some(7),
            (MemoryArea::Memory, _) => Some(3),
            (MemoryArea::Timer, _) => Some(4),
            (MemoryArea::Counter, _) => Some(5),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_file() {
        let address = AllenBradleySyntax.parse("N7:10/3").unwrap();
        assert_eq!(
            address,
            Address::new(MemoryArea::Data, 10, BitWidth::Word)
                .with_block(7)
                .with_bit(3)
        );
        assert_eq!(AllenBradleySyntax.format(&address).unwrap(), "N7:10/3");
    }

    #[test]
    fn test_io_and_status() {
        assert_eq!(
            AllenBradleySyntax.parse("I:1/15").unwrap(),
            Address::new(MemoryArea::Input, 1, BitWidth::Word).with_bit(15)
        );
        assert_eq!(
            AllenBradleySyntax.parse("o:3").unwrap(),
            Address::new(MemoryArea::Output, 3, BitWidth::Word)
        );
        assert_eq!(
            AllenBradleySyntax.parse("S:2").unwrap(),
            Address::new(MemoryArea::Special, 2, BitWidth::Word)
        );
    }

    #[test]
    fn test_long_timer_counter() {
        assert_eq!(
            AllenBradleySyntax.parse("L9:4").unwrap().width,
            BitWidth::DWord
        );
        assert_eq!(AllenBradleySyntax.parse("T4:2").unwrap().area, MemoryArea::Timer);
        assert_eq!(AllenBradleySyntax.parse("C5:0").unwrap().block, Some(5));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["N7", "N:1", "N7:1/16", "Q:0", "L9:1/2", "T4:1/1", "N7:1x"] {
            assert!(
                matches!(AllenBradleySyntax.parse(bad), Err(AddressError::Parse { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_format_requires_file_number() {
        let address = Address::new(MemoryArea::Data, 1, BitWidth::Word);
        assert!(AllenBradleySyntax.format(&address).is_err());
    }
}
