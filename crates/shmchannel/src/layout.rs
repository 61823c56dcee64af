//! Shared segment layouts.
//!
//! # Duplex segment
//!
//! ```text
//! +--------------------------------+--------------------------------+
//! | block 0                        | block 1                        |
//! | [u32 LE length][payload ...]   | [u32 LE length][payload ...]   |
//! +--------------------------------+--------------------------------+
//!   creator writes, joiner reads     joiner writes, creator reads
//! ```
//!
//! The length field of every chunk carries the number of message bytes still
//! to transfer, so the first chunk announces the whole message size.
//!
//! # Rendezvous segment
//!
//! A fixed 520-byte area holding one UTF-16LE name followed by a zero unit.

/// Default total size of a duplex segment.
pub const DEFAULT_SECTION_SIZE: usize = 32 * 1024;

/// Size of the chunk length prefix.
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Smallest section that still carries four payload bytes per direction.
pub const MIN_SECTION_SIZE: usize = 2 * (CHUNK_HEADER_SIZE + 4);

/// Size of the rendezvous segment.
pub const CONNECTOR_SECTION_SIZE: usize = 260 * 2;

/// Rendezvous names must be strictly shorter than this many UTF-16 units,
/// leaving room for the terminator.
pub const MAX_NAME_UNITS: usize = CONNECTOR_SECTION_SIZE / 2 - 1;

/// Which end of a duplex connection a handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Created the objects; the server.
    Creator,
    /// Opened existing objects; the client.
    Joiner,
}

/// Geometry of a duplex segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLayout {
    block_size: usize,
}

impl TransferLayout {
    /// Layout for a section of `section_size` bytes, if it is usable.
    pub fn new(section_size: usize) -> Option<Self> {
        if section_size % 2 != 0 || section_size < MIN_SECTION_SIZE {
            return None;
        }
        Some(Self {
            block_size: section_size / 2,
        })
    }

    pub fn section_size(&self) -> usize {
        self.block_size * 2
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Payload bytes per chunk.
    pub fn capacity(&self) -> usize {
        self.block_size - CHUNK_HEADER_SIZE
    }

    /// Offset of the block `side` writes into.
    pub fn write_block(&self, side: Side) -> usize {
        match side {
            Side::Creator => 0,
            Side::Joiner => self.block_size,
        }
    }

    /// Offset of the block `side` reads from.
    pub fn read_block(&self, side: Side) -> usize {
        match side {
            Side::Creator => self.block_size,
            Side::Joiner => 0,
        }
    }

    /// Chunks needed for a message of `total` bytes. An empty message still
    /// occupies one chunk.
    pub fn chunk_count(&self, total: usize) -> usize {
        total.div_ceil(self.capacity()).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let layout = TransferLayout::new(DEFAULT_SECTION_SIZE).unwrap();
        assert_eq!(layout.block_size(), 16384);
        assert_eq!(layout.capacity(), 16380);
        assert_eq!(layout.chunk_count(0), 1);
        assert_eq!(layout.chunk_count(16380), 1);
        assert_eq!(layout.chunk_count(16381), 2);
        assert_eq!(layout.chunk_count(40_000), 3);
    }

    #[test]
    fn blocks_are_mirrored() {
        let layout = TransferLayout::new(1024).unwrap();
        assert_eq!(layout.write_block(Side::Creator), layout.read_block(Side::Joiner));
        assert_eq!(layout.write_block(Side::Joiner), layout.read_block(Side::Creator));
        assert_ne!(layout.write_block(Side::Creator), layout.write_block(Side::Joiner));
    }

    #[test]
    fn rejects_unusable_sections() {
        assert!(TransferLayout::new(1023).is_none());
        assert!(TransferLayout::new(8).is_none());
        assert!(TransferLayout::new(MIN_SECTION_SIZE).is_some());
    }

    #[test]
    fn name_bound() {
        assert_eq!(MAX_NAME_UNITS, 259);
    }
}
