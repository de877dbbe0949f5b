/*!
 * PLC program representation used by upload, download and backup.
 */
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plcbridge_core::{error::Error as CoreError, types::Metadata};

use crate::device::Result;
use crate::vendor::Vendor;

/// Kind of program block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    /// Organization block
    OB,
    /// Function block
    FB,
    /// Function
    FC,
    /// Data block
    DB,
    /// User defined type
    UDT,
    /// Add-on instruction (Rockwell)
    AOI,
    /// Program (Rockwell / Omron)
    Program,
    /// Task
    Task,
}

/// Programming language of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeLanguage {
    /// Ladder diagram
    Ladder,
    /// Structured text
    StructuredText,
    /// Function block diagram
    FunctionBlock,
    /// Instruction list
    InstructionList,
    /// Sequential function chart
    Sfc,
    /// S7-GRAPH
    Graph,
}

/// Block header information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block kind
    pub block_type: BlockType,
    /// Block number
    pub number: u32,
    /// Symbolic name
    pub name: String,
    /// Language, when reported
    pub language: Option<CodeLanguage>,
    /// Size in bytes
    pub size: u32,
    /// Know-how or read protection
    pub protected: bool,
    /// Last modification
    pub timestamp: Option<DateTime<Utc>>,
    /// Author field
    pub author: String,
    /// Comment / family field
    pub comment: String,
}

impl BlockInfo {
    /// Minimal block header
    pub fn new(block_type: BlockType, number: u32) -> Self {
        Self {
            block_type,
            number,
            name: String::new(),
            language: None,
            size: 0,
            protected: false,
            timestamp: None,
            author: String::new(),
            comment: String::new(),
        }
    }
}

/// A program block with its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Header
    pub info: BlockInfo,
    /// Source text, when the controller keeps it
    pub source_code: Option<String>,
    /// Compiled (MC7 / binary) image
    pub compiled_code: Option<Vec<u8>>,
    /// Interface description
    pub interface: Metadata,
}

impl Block {
    /// Block holding only a compiled image
    pub fn compiled(info: BlockInfo, code: Vec<u8>) -> Self {
        Self {
            info,
            source_code: None,
            compiled_code: Some(code),
            interface: Metadata::new(),
        }
    }
}

/// A complete PLC program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcProgram {
    /// Vendor the program was uploaded from
    pub vendor: Vendor,
    /// Controller model
    pub model: String,
    /// Program blocks
    pub blocks: Vec<Block>,
    /// Tag table
    pub tags: Metadata,
    /// Hardware / task configuration
    pub configuration: Metadata,
    /// Free form metadata
    pub metadata: Metadata,
}

impl PlcProgram {
    /// Empty program for a vendor and model
    pub fn new<S: Into<String>>(vendor: Vendor, model: S) -> Self {
        Self {
            vendor,
            model: model.into(),
            blocks: Vec::new(),
            tags: Metadata::new(),
            configuration: Metadata::new(),
            metadata: Metadata::new(),
        }
    }

    /// Find a block by type and number
    pub fn block(&self, block_type: BlockType, number: u32) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.info.block_type == block_type && b.info.number == number)
    }

    /// Write the program to a JSON file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(CoreError::from)?;
        tokio::fs::write(path.as_ref(), json)
            .await
            .map_err(CoreError::from)?;
        tracing::debug!("Saved program with {} blocks to {}", self.blocks.len(), path.as_ref().display());
        Ok(())
    }

    /// Read a program from a JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = tokio::fs::read(path.as_ref())
            .await
            .map_err(CoreError::from)?;
        let program = serde_json::from_slice(&json).map_err(CoreError::from)?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plcbridge_core::types::Value;

    fn sample() -> PlcProgram {
        let mut program = PlcProgram::new(Vendor::Siemens, "6ES7 315-2EH14-0AB0");
        let mut info = BlockInfo::new(BlockType::OB, 1);
        info.language = Some(CodeLanguage::Ladder);
        info.size = 4;
        program.blocks.push(Block::compiled(info, vec![0x70, 0x70, 0x01, 0x01]));
        program.tags.insert("Motor_On".to_string(), Value::from("Q0.0"));
        program
    }

    #[test]
    fn test_block_lookup() {
        let program = sample();
        assert!(program.block(BlockType::OB, 1).is_some());
        assert!(program.block(BlockType::FC, 1).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");

        let program = sample();
        program.save(&path).await.unwrap();
        let loaded = PlcProgram::load(&path).await.unwrap();
        assert_eq!(loaded, program);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio_test::assert_err!(PlcProgram::load(dir.path().join("nope.json")).await);
    }
}
