//! Flash image model
//!
//! A [`FlashFile`] is an ordered set of address-tagged [`FlashBlock`]s
//! whose ranges must be pairwise disjoint. Parsers may coalesce contiguous
//! records into one block but are not required to.

use std::fmt;
use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FlashError, ParseError};
use crate::{ihex, srec};

/// CRC-32 used for block checksums.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn block_checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Supported flash image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashFileFormat {
    IntelHex,
    SRecord,
    Binary,
}

impl FlashFileFormat {
    /// Detect the format from a file extension. Unknown extensions fall
    /// back to raw binary.
    pub fn from_extension(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("hex") => Self::IntelHex,
            Some("s19") | Some("s28") | Some("s37") | Some("srec") => Self::SRecord,
            _ => Self::Binary,
        }
    }
}

impl fmt::Display for FlashFileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IntelHex => "Intel HEX",
            Self::SRecord => "Motorola S-Record",
            Self::Binary => "Binary",
        };
        f.write_str(s)
    }
}

/// One contiguous run of image bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    pub address: u32,
    pub data: Vec<u8>,
    pub checksum: u32,
}

impl FlashBlock {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        let checksum = block_checksum(&data);
        Self {
            address,
            data,
            checksum,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Last address covered by this block.
    pub fn end_address(&self) -> u32 {
        self.address + self.data.len().saturating_sub(1) as u32
    }

    fn overlaps(&self, other: &FlashBlock) -> bool {
        !(self.is_empty() || other.is_empty())
            && self.address <= other.end_address()
            && other.address <= self.end_address()
    }
}

/// A region of ECU flash memory, for erase planning and address checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashRegion {
    pub name: String,
    pub start_address: u32,
    pub end_address: u32,
    /// Write-protected regions are never erased or programmed.
    #[serde(default)]
    pub protected: bool,
}

impl FlashRegion {
    pub fn size(&self) -> u32 {
        self.end_address - self.start_address + 1
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_address && address <= self.end_address
    }

    /// Whether any byte of `block` falls inside this region.
    pub fn overlaps_block(&self, block: &FlashBlock) -> bool {
        !block.is_empty()
            && self.start_address <= block.end_address()
            && block.address <= self.end_address
    }
}

/// Find the region covering an address, if any.
pub fn find_region_for_address(address: u32, regions: &[FlashRegion]) -> Option<&FlashRegion> {
    regions.iter().find(|r| r.contains(address))
}

/// Accumulates data records into blocks, coalescing runs at consecutive
/// addresses and starting a new block on any gap.
#[derive(Default)]
pub(crate) struct BlockAccumulator {
    blocks: Vec<FlashBlock>,
    current: Option<(u32, Vec<u8>)>,
}

impl BlockAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, address: u32, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match &mut self.current {
            Some((start, data)) if address == *start + data.len() as u32 => {
                data.extend_from_slice(bytes);
            }
            _ => {
                self.flush();
                self.current = Some((address, bytes.to_vec()));
            }
        }
    }

    fn flush(&mut self) {
        if let Some((address, data)) = self.current.take() {
            self.blocks.push(FlashBlock::new(address, data));
        }
    }

    pub(crate) fn finish(mut self) -> Vec<FlashBlock> {
        self.flush();
        self.blocks
    }
}

/// A parsed flash image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashFile {
    format: FlashFileFormat,
    blocks: Vec<FlashBlock>,
}

impl FlashFile {
    /// Assemble an image from pre-built blocks.
    pub fn from_blocks(format: FlashFileFormat, blocks: Vec<FlashBlock>) -> Self {
        Self { format, blocks }
    }

    /// Load and parse a file, detecting the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let format = FlashFileFormat::from_extension(path);
        let data = std::fs::read(path).map_err(|e| FlashError::FileLoad(e.to_string()))?;
        info!(path = %path.display(), %format, bytes = data.len(), "loading flash file");
        Self::parse(&data, format)
    }

    /// Parse raw input in the given format.
    pub fn parse(data: &[u8], format: FlashFileFormat) -> Result<Self, FlashError> {
        let blocks = match format {
            FlashFileFormat::IntelHex => ihex::parse(data)?,
            FlashFileFormat::SRecord => srec::parse(data)?,
            FlashFileFormat::Binary => {
                if data.is_empty() {
                    return Err(ParseError::new("empty binary image").into());
                }
                vec![FlashBlock::new(0, data.to_vec())]
            }
        };
        debug!(%format, blocks = blocks.len(), "flash file parsed");
        Ok(Self { format, blocks })
    }

    /// Serialize back to raw bytes. Only meaningful for the binary
    /// format's single-block layout.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        for block in &self.blocks {
            out.extend_from_slice(&block.data);
        }
        out
    }

    pub fn format(&self) -> FlashFileFormat {
        self.format
    }

    pub fn blocks(&self) -> &[FlashBlock] {
        &self.blocks
    }

    /// Blocks whose start address falls inside `region`.
    pub fn blocks_for_region(&self, region: &FlashRegion) -> Vec<&FlashBlock> {
        self.blocks
            .iter()
            .filter(|b| region.contains(b.address))
            .collect()
    }

    pub fn total_size(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    /// Lowest and highest address covered, or `None` for an empty image.
    pub fn address_range(&self) -> Option<(u32, u32)> {
        let min = self.blocks.iter().map(|b| b.address).min()?;
        let max = self.blocks.iter().map(|b| b.end_address()).max()?;
        Some((min, max))
    }

    /// Check the no-overlap invariant across all block pairs.
    pub fn validate(&self) -> bool {
        if self.blocks.is_empty() {
            return false;
        }
        for (i, a) in self.blocks.iter().enumerate() {
            for b in &self.blocks[i + 1..] {
                if a.overlaps(b) {
                    return false;
                }
            }
        }
        true
    }
}
