#![forbid(unsafe_code)]

use super::page::{CRC32, PAGE_NO};
use super::{PageId, Result, TreeError};

/// Computes the CRC32 of a page image, skipping the checksum field itself and
/// mixing in the page number so that misdirected writes are detected.
pub fn page_crc32(page_no: u64, image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&image[..CRC32.start]);
    hasher.update(&image[CRC32.end..]);
    hasher.finalize()
}

/// Stamps the page number and checksum into an encoded page image.
pub fn seal_page(id: PageId, image: &mut [u8]) {
    image[PAGE_NO].copy_from_slice(&(id.0 as u32).to_be_bytes());
    let crc = page_crc32(id.0, image);
    image[CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Validates the checksum of a page image read back from storage.
pub fn verify_page(id: PageId, image: &[u8]) -> Result<()> {
    let stored = u32::from_be_bytes([
        image[CRC32.start],
        image[CRC32.start + 1],
        image[CRC32.start + 2],
        image[CRC32.start + 3],
    ]);
    if stored != page_crc32(id.0, image) {
        return Err(TreeError::Corruption("page checksum mismatch"));
    }
    let page_no = u32::from_be_bytes([
        image[PAGE_NO.start],
        image[PAGE_NO.start + 1],
        image[PAGE_NO.start + 2],
        image[PAGE_NO.start + 3],
    ]);
    if page_no != id.0 as u32 {
        return Err(TreeError::Corruption("page number mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::PAGE_HDR_LEN;

    #[test]
    fn sealed_page_verifies() {
        let mut image = vec![7u8; 256];
        seal_page(PageId(9), &mut image);
        verify_page(PageId(9), &image).unwrap();
    }

    #[test]
    fn crc_changes_with_components() {
        let mut image = vec![0u8; 64];
        seal_page(PageId(1), &mut image);
        let mut flipped = image.clone();
        flipped[PAGE_HDR_LEN + 3] ^= 0x10;
        assert!(verify_page(PageId(1), &flipped).is_err());
        assert!(verify_page(PageId(2), &image).is_err());
        assert_ne!(page_crc32(1, &image), page_crc32(3, &image));
    }
}
