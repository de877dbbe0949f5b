/*!
 * Cross-vendor memory addressing.
 *
 * Every vendor grammar maps its native address strings onto the canonical
 * [`Address`] triple. `parse` and `format` are per vendor; [`translate`]
 * moves an address between two vendors through its absolute bit position.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vendor::Vendor;

mod allen_bradley;
mod beckhoff;
mod delta;
mod generic;
mod mitsubishi;
mod omron;
mod schneider;
mod siemens;

pub use allen_bradley::AllenBradleySyntax;
pub use beckhoff::BeckhoffSyntax;
pub use delta::DeltaSyntax;
pub use generic::ModiconSyntax;
pub use mitsubishi::MitsubishiSyntax;
pub use omron::OmronSyntax;
pub use schneider::SchneiderSyntax;
pub use siemens::SiemensSyntax;

/// Vendor-neutral classification of controller memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryArea {
    /// Process inputs (I, X, CIO, %I)
    Input,
    /// Process outputs (Q, Y, %Q)
    Output,
    /// Internal flags and work memory (M, B, W, %M)
    Memory,
    /// Data registers and data blocks (DB, D, DM, N)
    Data,
    /// Timers
    Timer,
    /// Counters
    Counter,
    /// Vendor specific system memory (S, SM, SD, A)
    Special,
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryArea::Input => "Input",
            MemoryArea::Output => "Output",
            MemoryArea::Memory => "Memory",
            MemoryArea::Data => "Data",
            MemoryArea::Timer => "Timer",
            MemoryArea::Counter => "Counter",
            MemoryArea::Special => "Special",
        };
        f.write_str(name)
    }
}

/// Access width of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitWidth {
    /// A single bit
    Bit,
    /// 8 bits
    Byte,
    /// 16 bits
    Word,
    /// 32 bits
    DWord,
}

impl BitWidth {
    /// Number of bits covered by one access of this width
    pub fn bits(self) -> u32 {
        match self {
            BitWidth::Bit => 1,
            BitWidth::Byte => 8,
            BitWidth::Word => 16,
            BitWidth::DWord => 32,
        }
    }

    /// Number of whole bytes needed to hold one access of this width
    pub fn byte_len(self) -> usize {
        match self {
            BitWidth::Bit | BitWidth::Byte => 1,
            BitWidth::Word => 2,
            BitWidth::DWord => 4,
        }
    }
}

/// What one step of `Address::offset` counts in a vendor's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressUnit {
    /// Offsets count bits
    Bit,
    /// Offsets count bytes
    Byte,
    /// Offsets count 16-bit words
    Word,
    /// Offsets count 32-bit double words
    DWord,
    /// Offsets count elements (timer / counter numbers)
    Element,
}

impl AddressUnit {
    fn bits(self) -> Option<u64> {
        match self {
            AddressUnit::Bit => Some(1),
            AddressUnit::Byte => Some(8),
            AddressUnit::Word => Some(16),
            AddressUnit::DWord => Some(32),
            AddressUnit::Element => None,
        }
    }
}

/// A canonical controller address
///
/// `bit_offset` is only set for bit accesses inside a byte or word;
/// `block` is only set where the vendor has numbered blocks or files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Memory area
    pub area: MemoryArea,
    /// Data block or file number
    pub block: Option<u32>,
    /// Offset in the vendor's addressing unit
    pub offset: u32,
    /// Bit inside the addressed byte or word
    pub bit_offset: Option<u8>,
    /// Access width
    pub width: BitWidth,
}

impl Address {
    /// Create an address without block or bit
    pub fn new(area: MemoryArea, offset: u32, width: BitWidth) -> Self {
        Self {
            area,
            block: None,
            offset,
            bit_offset: None,
            width,
        }
    }

    /// Set the block / file number
    pub fn with_block(mut self, block: u32) -> Self {
        self.block = Some(block);
        self
    }

    /// Set the bit offset; the width becomes `Bit`
    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit_offset = Some(bit);
        self.width = BitWidth::Bit;
        self
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.area)?;
        if let Some(block) = self.block {
            write!(f, "[{}]", block)?;
        }
        write!(f, "+{}", self.offset)?;
        if let Some(bit) = self.bit_offset {
            write!(f, ".{}", bit)?;
        }
        write!(f, ":{:?}", self.width)
    }
}

/// Address parsing and translation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The string is not valid in the vendor's grammar
    #[error("Invalid {vendor} address '{input}': unexpected '{offending}'")]
    Parse {
        /// Grammar that rejected the input
        vendor: Vendor,
        /// The full input string
        input: String,
        /// The part of the input that could not be parsed
        offending: String,
    },

    /// No equivalent address exists in the target vendor
    #[error("Cannot translate {address} from {from} to {to}: {reason}")]
    UnsupportedTranslation {
        /// Source vendor
        from: Vendor,
        /// Target vendor
        to: Vendor,
        /// The canonical address being translated
        address: String,
        /// Why the mapping failed
        reason: String,
    },

    /// The vendor grammar has no string form for this address
    #[error("{vendor} has no address syntax for {address}")]
    Unrepresentable {
        /// Grammar asked to format
        vendor: Vendor,
        /// The canonical address
        address: String,
    },

    /// The vendor has no address grammar at all
    #[error("{0} has no address syntax")]
    NoSyntax(Vendor),
}

/// One vendor's address grammar
pub trait AddressSyntax: Send + Sync {
    /// The vendor this grammar belongs to
    fn vendor(&self) -> Vendor;

    /// Parse a vendor address string
    fn parse(&self, input: &str) -> Result<Address, AddressError>;

    /// Format a canonical address in vendor syntax
    fn format(&self, address: &Address) -> Result<String, AddressError>;

    /// Unit of `offset` for an area and width, `None` when the vendor has no such memory
    fn unit(&self, area: MemoryArea, width: BitWidth) -> Option<AddressUnit>;

    /// Block number to use when an address without one is translated into this vendor
    fn default_block(&self, _area: MemoryArea, _width: BitWidth) -> Option<u32> {
        None
    }

    /// Highest valid bit offset inside one addressing unit
    fn max_bit(&self) -> u8 {
        15
    }

    /// Reject an address this grammar cannot write out
    fn unrepresentable(&self, address: &Address) -> AddressError {
        AddressError::Unrepresentable {
            vendor: self.vendor(),
            address: address.to_string(),
        }
    }
}

static SIEMENS: SiemensSyntax = SiemensSyntax;
static ALLEN_BRADLEY: AllenBradleySyntax = AllenBradleySyntax;
static DELTA: DeltaSyntax = DeltaSyntax;
static OMRON: OmronSyntax = OmronSyntax;
static BECKHOFF: BeckhoffSyntax = BeckhoffSyntax;
static MITSUBISHI: MitsubishiSyntax = MitsubishiSyntax;
static SCHNEIDER: SchneiderSyntax = SchneiderSyntax;
static MODICON: ModiconSyntax = ModiconSyntax;

/// The address grammar of a vendor
pub fn syntax_for(vendor: Vendor) -> Result<&'static dyn AddressSyntax, AddressError> {
    match vendor {
        Vendor::Siemens => Ok(&SIEMENS),
        Vendor::AllenBradley => Ok(&ALLEN_BRADLEY),
        Vendor::Delta => Ok(&DELTA),
        Vendor::Omron => Ok(&OMRON),
        Vendor::Beckhoff => Ok(&BECKHOFF),
        Vendor::Mitsubishi => Ok(&MITSUBISHI),
        Vendor::Schneider => Ok(&SCHNEIDER),
        Vendor::Generic => Ok(&MODICON),
        Vendor::Unknown => Err(AddressError::NoSyntax(vendor)),
    }
}

/// Parse a vendor address string
pub fn parse(vendor: Vendor, input: &str) -> Result<Address, AddressError> {
    syntax_for(vendor)?.parse(input)
}

/// Format an address in vendor syntax
pub fn format(vendor: Vendor, address: &Address) -> Result<String, AddressError> {
    syntax_for(vendor)?.format(address)
}

/// What one offset step counts for an area and width in a vendor's memory model
///
/// `None` when the vendor has no such memory.
pub fn memory_unit(vendor: Vendor, area: MemoryArea, width: BitWidth) -> Option<AddressUnit> {
    syntax_for(vendor).ok()?.unit(area, width)
}

/// Best-effort conversion of an address between two vendors
///
/// The address keeps its area and width. Offsets are converted through the
/// absolute bit position, so a byte-addressed word must land on a word
/// boundary in a word-addressed vendor. Timers and counters map element by
/// element.
pub fn translate(address: &Address, from: Vendor, to: Vendor) -> Result<Address, AddressError> {
    let source = syntax_for(from)?;
    let target = syntax_for(to)?;

    let unsupported = |reason: String| AddressError::UnsupportedTranslation {
        from,
        to,
        address: address.to_string(),
        reason,
    };

    let src_unit = source
        .unit(address.area, address.width)
        .ok_or_else(|| unsupported(format!("{} has no {:?} {} memory", from, address.width, address.area)))?;
    let dst_unit = target
        .unit(address.area, address.width)
        .ok_or_else(|| unsupported(format!("{} has no {:?} {} memory", to, address.width, address.area)))?;

    let block = target
        .default_block(address.area, address.width)
        .map(|default| address.block.unwrap_or(default));

    let mut translated = Address {
        area: address.area,
        block,
        offset: 0,
        bit_offset: None,
        width: address.width,
    };

    match (src_unit.bits(), dst_unit.bits()) {
        (None, None) => {
            translated.offset = address.offset;
        }
        (Some(src_bits), Some(dst_bits)) => {
            let position =
                u64::from(address.offset) * src_bits + u64::from(address.bit_offset.unwrap_or(0));

            if address.width == BitWidth::Bit && dst_bits > 1 {
                translated.offset = to_offset(position / dst_bits).map_err(&unsupported)?;
                let bit = (position % dst_bits) as u8;
                if bit > target.max_bit() {
                    return Err(unsupported(format!("bit {} is out of range", bit)));
                }
                translated.bit_offset = Some(bit);
            } else {
                if position % dst_bits != 0 {
                    return Err(unsupported(format!(
                        "bit position {} is not aligned to the target unit",
                        position
                    )));
                }
                translated.offset = to_offset(position / dst_bits).map_err(&unsupported)?;
            }
        }
        _ => {
            return Err(unsupported(
                "element addressed memory has no bit position".to_string(),
            ));
        }
    }

    // Make sure the result has a string form before handing it out.
    target
        .format(&translated)
        .map_err(|e| unsupported(e.to_string()))?;

    Ok(translated)
}

fn to_offset(value: u64) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("offset {} is out of range", value))
}

/// Cursor over an address string used by the vendor grammars
///
/// Matching is case-insensitive; offending substrings are reported in the
/// caller's original casing.
pub(crate) struct Cursor<'a> {
    vendor: Vendor,
    input: &'a str,
    original: &'a str,
    upper: String,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(vendor: Vendor, input: &'a str) -> Self {
        let original = input.trim();
        Self {
            vendor,
            input,
            original,
            upper: original.to_ascii_uppercase(),
            pos: 0,
        }
    }

    fn rest(&self) -> &str {
        &self.upper[self.pos..]
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.upper.len()
    }

    /// Consume `prefix` if the remaining input starts with it
    pub(crate) fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// Consume the first matching prefix of `choices`
    pub(crate) fn eat_any<T: Copy>(&mut self, choices: &[(&str, T)]) -> Option<T> {
        for (prefix, value) in choices {
            if self.eat(prefix) {
                return Some(*value);
            }
        }
        None
    }

    pub(crate) fn skip_spaces(&mut self) {
        while self.rest().starts_with(' ') {
            self.pos += 1;
        }
    }

    pub(crate) fn expect(&mut self, token: &str) -> Result<(), AddressError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Read an unsigned number in `radix`
    pub(crate) fn number(&mut self, radix: u32) -> Result<u32, AddressError> {
        let digits = self
            .rest()
            .chars()
            .take_while(|c| c.is_digit(radix))
            .count();
        if digits == 0 {
            return Err(self.error());
        }
        let start = self.pos;
        let value = u32::from_str_radix(&self.upper[start..start + digits], radix)
            .map_err(|_| self.error_at(start, start + digits))?;
        self.pos += digits;
        Ok(value)
    }

    /// Read a decimal number and return it with its digit count
    pub(crate) fn digits(&mut self) -> Result<(u32, usize), AddressError> {
        let start = self.pos;
        let value = self.number(10)?;
        Ok((value, self.pos - start))
    }

    /// Read a `.bit` suffix bounded by `max`
    pub(crate) fn bit(&mut self, max: u8) -> Result<u8, AddressError> {
        self.expect(".")?;
        let start = self.pos;
        let value = self.number(10)?;
        if value > u32::from(max) || self.pos - start > 2 {
            return Err(self.error_at(start, self.pos));
        }
        Ok(value as u8)
    }

    /// Succeed only if all input was consumed
    pub(crate) fn finish(&self) -> Result<(), AddressError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Error pointing at the remaining input
    pub(crate) fn error(&self) -> AddressError {
        self.error_at(self.pos, self.original.len())
    }

    /// Error pointing at a byte range of the trimmed input
    pub(crate) fn error_at(&self, start: usize, end: usize) -> AddressError {
        let offending = if start >= self.original.len() {
            "<end of input>".to_string()
        } else {
            self.original[start..end.min(self.original.len())].to_string()
        };
        AddressError::Parse {
            vendor: self.vendor,
            input: self.input.to_string(),
            offending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(vendor: Vendor, input: &str) {
        let address = parse(vendor, input).unwrap();
        let formatted = format(vendor, &address).unwrap();
        assert_eq!(
            parse(vendor, &formatted).unwrap(),
            address,
            "{} -> {} did not round trip",
            input,
            formatted
        );
    }

    #[test]
    fn test_round_trip_every_grammar() {
        let cases: &[(Vendor, &[&str])] = &[
            (
                Vendor::Siemens,
                &["I0.0", "E1.7", "QW4", "AB2", "M10.3", "MD8", "DB1.DBW0", "DB12.DBX3.5", "T5", "Z9"],
            ),
            (
                Vendor::AllenBradley,
                &["I:0/3", "O:2", "N7:10", "N7:10/15", "L9:2", "B3:0/1", "T4:0", "C5:3", "S:1/5"],
            ),
            (Vendor::Delta, &["X17", "Y0", "M100", "S5", "D100", "T12", "C3"]),
            (Vendor::Omron, &["CIO 100", "CIO0.05", "W3.15", "D200", "DM10", "T1", "C2", "A500"]),
            (Vendor::Mitsubishi, &["X1F", "Y10", "M8000", "W1A", "D0", "TN4", "CN2", "SM400", "SD203"]),
            (Vendor::Schneider, &["%I3", "%IW2", "%Q1", "%QW0", "%M100", "%MW100", "%MD20", "%S6", "%SW50"]),
            (Vendor::Beckhoff, &["%IX0.1", "%IB3", "%QW4", "%MD12", "%MX100.7"]),
            (Vendor::Generic, &["00001", "10020", "30001", "40100", "400001"]),
        ];

        for (vendor, inputs) in cases {
            for input in *inputs {
                roundtrip(*vendor, input);
            }
        }
    }

    #[test]
    fn test_memory_units() {
        assert_eq!(
            memory_unit(Vendor::Siemens, MemoryArea::Memory, BitWidth::Word),
            Some(AddressUnit::Byte)
        );
        assert_eq!(
            memory_unit(Vendor::Schneider, MemoryArea::Memory, BitWidth::Word),
            Some(AddressUnit::Word)
        );
        assert_eq!(
            memory_unit(Vendor::Delta, MemoryArea::Timer, BitWidth::Word),
            Some(AddressUnit::Element)
        );
        assert_eq!(memory_unit(Vendor::Generic, MemoryArea::Timer, BitWidth::Word), None);
        assert_eq!(memory_unit(Vendor::Unknown, MemoryArea::Data, BitWidth::Word), None);
    }

    #[test]
    fn test_unknown_vendor_has_no_syntax() {
        assert_eq!(
            parse(Vendor::Unknown, "D100"),
            Err(AddressError::NoSyntax(Vendor::Unknown))
        );
    }

    #[test]
    fn test_translate_word_between_byte_and_word_addressing() {
        let mw = parse(Vendor::Siemens, "MW100").unwrap();
        let translated = translate(&mw, Vendor::Siemens, Vendor::Schneider).unwrap();
        assert_eq!(format(Vendor::Schneider, &translated).unwrap(), "%MW50");

        let back = translate(&translated, Vendor::Schneider, Vendor::Siemens).unwrap();
        assert_eq!(format(Vendor::Siemens, &back).unwrap(), "MW100");
    }

    #[test]
    fn test_translate_data_register_gets_default_block() {
        let d = parse(Vendor::Delta, "D100").unwrap();
        let translated = translate(&d, Vendor::Delta, Vendor::Siemens).unwrap();
        assert_eq!(translated.block, Some(1));
        assert_eq!(format(Vendor::Siemens, &translated).unwrap(), "DB1.DBW200");

        let n = translate(&d, Vendor::Delta, Vendor::AllenBradley).unwrap();
        assert_eq!(format(Vendor::AllenBradley, &n).unwrap(), "N7:100");
    }

    #[test]
    fn test_translate_block_is_dropped_for_flat_vendors() {
        let dbw = parse(Vendor::Siemens, "DB5.DBW4").unwrap();
        let translated = translate(&dbw, Vendor::Siemens, Vendor::Mitsubishi).unwrap();
        assert_eq!(translated.block, None);
        assert_eq!(format(Vendor::Mitsubishi, &translated).unwrap(), "D2");
    }

    #[test]
    fn test_translate_bits() {
        let bit = parse(Vendor::Siemens, "I1.2").unwrap();
        let x = translate(&bit, Vendor::Siemens, Vendor::Delta).unwrap();
        assert_eq!(format(Vendor::Delta, &x).unwrap(), "X12");

        let cio = translate(&bit, Vendor::Siemens, Vendor::Omron).unwrap();
        assert_eq!(format(Vendor::Omron, &cio).unwrap(), "CIO0.10");
    }

    #[test]
    fn test_translate_timers_map_elements() {
        let t = parse(Vendor::Siemens, "T5").unwrap();
        let tn = translate(&t, Vendor::Siemens, Vendor::Mitsubishi).unwrap();
        assert_eq!(format(Vendor::Mitsubishi, &tn).unwrap(), "TN5");
    }

    #[test]
    fn test_translate_rejects_missing_area() {
        let t = parse(Vendor::Siemens, "T5").unwrap();
        assert!(matches!(
            translate(&t, Vendor::Siemens, Vendor::Generic),
            Err(AddressError::UnsupportedTranslation { .. })
        ));

        let md = parse(Vendor::Siemens, "MD4").unwrap();
        assert!(matches!(
            translate(&md, Vendor::Siemens, Vendor::Omron),
            Err(AddressError::UnsupportedTranslation { .. })
        ));
    }

    #[test]
    fn test_translate_rejects_misaligned_word() {
        let mw = parse(Vendor::Siemens, "MW1").unwrap();
        assert!(matches!(
            translate(&mw, Vendor::Siemens, Vendor::Schneider),
            Err(AddressError::UnsupportedTranslation { .. })
        ));
    }

    #[test]
    fn test_parse_error_reports_original_casing() {
        let err = parse(Vendor::Siemens, "db1.dbq0").unwrap_err();
        assert_eq!(
            err,
            AddressError::Parse {
                vendor: Vendor::Siemens,
                input: "db1.dbq0".to_string(),
                offending: "q0".to_string(),
            }
        );
    }
}
