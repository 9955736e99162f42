//! Page header and type definitions.
//!
//! Every page starts with a [`PageHeader`] containing metadata:
//! - [`PageType`] discriminator
//! - tree level (leaf = 0)
//! - key-block count and tail allocation offset
//! - page id and right-sibling id
//! - timestamp of last modification
//! - CRC32 checksum for integrity

use crate::common::{PageId, Timestamp};

/// Type of page stored in a volume.
///
/// Uses `#[repr(u8)]` to guarantee a 1-byte representation for serialization.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Uninitialized or corrupted page.
    #[default]
    Invalid = 0,
    /// B+-tree leaf holding key/value records.
    Data = 1,
    /// B+-tree index page holding key/child-id separators.
    Index = 2,
    /// One link of a long-record chain.
    LongRecord = 3,
    /// Page on the volume free chain.
    Garbage = 4,
    /// The volume header page (page 0).
    Header = 5,
}

impl PageType {
    /// Convert from u8, returning Invalid for unknown values.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Data,
            2 => PageType::Index,
            3 => PageType::LongRecord,
            4 => PageType::Garbage,
            5 => PageType::Header,
            _ => PageType::Invalid,
        }
    }
}

/// Metadata stored at the beginning of every page.
///
/// # Layout (40 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     page_type (PageType as u8)
/// 1       1     level (leaf = 0)
/// 2       2     key_block_count (little-endian)
/// 4       4     checksum (CRC32, little-endian)
/// 8       8     page_id
/// 16      8     right_sibling page id
/// 24      8     timestamp of last modification
/// 32      4     tail_offset (start of the used tail region)
/// 36      4     reserved (zero)
/// ```
///
/// # Checksum
/// The checksum is computed over the entire page with the checksum field
/// itself set to zero. This allows verification without special handling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub level: u8,
    pub key_block_count: u16,
    pub checksum: u32,
    pub page_id: u64,
    pub right_sibling: u64,
    pub timestamp: Timestamp,
    pub tail_offset: u32,
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 40;

    /// Offset of each field within the header.
    pub const OFFSET_PAGE_TYPE: usize = 0;
    pub const OFFSET_LEVEL: usize = 1;
    pub const OFFSET_KEY_BLOCK_COUNT: usize = 2;
    pub const OFFSET_CHECKSUM: usize = 4;
    pub const OFFSET_PAGE_ID: usize = 8;
    pub const OFFSET_RIGHT_SIBLING: usize = 16;
    pub const OFFSET_TIMESTAMP: usize = 24;
    pub const OFFSET_TAIL: usize = 32;

    /// Read a header from the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
        let u32_at =
            |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[off..off + 8]);
            u64::from_le_bytes(b)
        };

        Self {
            page_type: PageType::from_u8(data[Self::OFFSET_PAGE_TYPE]),
            level: data[Self::OFFSET_LEVEL],
            key_block_count: u16_at(Self::OFFSET_KEY_BLOCK_COUNT),
            checksum: u32_at(Self::OFFSET_CHECKSUM),
            page_id: u64_at(Self::OFFSET_PAGE_ID),
            right_sibling: u64_at(Self::OFFSET_RIGHT_SIBLING),
            timestamp: u64_at(Self::OFFSET_TIMESTAMP),
            tail_offset: u32_at(Self::OFFSET_TAIL),
        }
    }

    /// Write this header to the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        data[Self::OFFSET_PAGE_TYPE] = self.page_type as u8;
        data[Self::OFFSET_LEVEL] = self.level;
        data[Self::OFFSET_KEY_BLOCK_COUNT..Self::OFFSET_KEY_BLOCK_COUNT + 2]
            .copy_from_slice(&self.key_block_count.to_le_bytes());
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_le_bytes());
        data[Self::OFFSET_PAGE_ID..Self::OFFSET_PAGE_ID + 8]
            .copy_from_slice(&self.page_id.to_le_bytes());
        data[Self::OFFSET_RIGHT_SIBLING..Self::OFFSET_RIGHT_SIBLING + 8]
            .copy_from_slice(&self.right_sibling.to_le_bytes());
        data[Self::OFFSET_TIMESTAMP..Self::OFFSET_TIMESTAMP + 8]
            .copy_from_slice(&self.timestamp.to_le_bytes());
        data[Self::OFFSET_TAIL..Self::OFFSET_TAIL + 4]
            .copy_from_slice(&self.tail_offset.to_le_bytes());
        data[36..40].fill(0);
    }

    /// Compute the CRC32 checksum of a page image.
    ///
    /// The checksum is computed with the checksum field (bytes 4-8) zeroed
    /// out, so the checksum doesn't include itself.
    pub fn compute_checksum(page_data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_data[..Self::OFFSET_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page_data[Self::OFFSET_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Verify that the stored checksum matches the computed checksum.
    pub fn verify_checksum(&self, page_data: &[u8]) -> bool {
        self.checksum == Self::compute_checksum(page_data)
    }

    /// The right-sibling id as a typed [`PageId`].
    pub fn right_sibling_id(&self) -> PageId {
        PageId::new(self.right_sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_from_u8() {
        assert_eq!(PageType::from_u8(0), PageType::Invalid);
        assert_eq!(PageType::from_u8(1), PageType::Data);
        assert_eq!(PageType::from_u8(2), PageType::Index);
        assert_eq!(PageType::from_u8(3), PageType::LongRecord);
        assert_eq!(PageType::from_u8(4), PageType::Garbage);
        assert_eq!(PageType::from_u8(5), PageType::Header);
        assert_eq!(PageType::from_u8(255), PageType::Invalid);
    }

    #[test]
    fn test_page_header_roundtrip() {
        let original = PageHeader {
            page_type: PageType::Data,
            level: 2,
            key_block_count: 17,
            checksum: 0xDEADBEEF,
            page_id: 42,
            right_sibling: 43,
            timestamp: 0x123456789ABCDEF0,
            tail_offset: 8000,
        };

        let mut buffer = [0u8; PageHeader::SIZE];
        original.write_to(&mut buffer);

        let recovered = PageHeader::from_bytes(&buffer);
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let mut page_data = vec![0u8; 4096];
        page_data[100] = 0xAB;

        let checksum1 = PageHeader::compute_checksum(&page_data);

        page_data[PageHeader::OFFSET_CHECKSUM..PageHeader::OFFSET_CHECKSUM + 4].fill(0xFF);
        let checksum2 = PageHeader::compute_checksum(&page_data);

        assert_eq!(checksum1, checksum2);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page_data = vec![0u8; 4096];
        page_data[100] = 0xAB;

        let mut header = PageHeader {
            page_type: PageType::Data,
            ..Default::default()
        };
        header.checksum = PageHeader::compute_checksum(&page_data);
        assert!(header.verify_checksum(&page_data));

        page_data[100] = 0xFF;
        assert!(!header.verify_checksum(&page_data));
    }
}
