use crate::pipeline::types::SourceFormat;

/// Byte offset of the `DICM` magic after the 128-byte Part 10 preamble.
pub const DICOM_MAGIC_OFFSET: usize = 128;
const DICOM_MAGIC: &[u8; 4] = b"DICM";

/// Detect the payload format from magic bytes (NOT file extensions).
/// Goes by magic bytes; extensions can be wrong.
pub fn detect_format(bytes: &[u8]) -> Option<SourceFormat> {
    if has_dicom_preamble(bytes) {
        return Some(SourceFormat::Dicom);
    }

    match bytes {
        // PNG: 89 50 4E 47 0D 0A 1A 0A
        [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(SourceFormat::Png),
        // JPEG: FF D8 FF
        [0xFF, 0xD8, 0xFF, ..] => Some(SourceFormat::Jpeg),
        // TIFF: little-endian (49 49 2A 00) or big-endian (4D 4D 00 2A)
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some(SourceFormat::Tiff),
        // BMP: "BM"
        [0x42, 0x4D, ..] if bytes.len() >= 26 => Some(SourceFormat::Bmp),
        _ if looks_like_bare_dicom(bytes) => Some(SourceFormat::Dicom),
        _ => None,
    }
}

/// Part 10 file: 128-byte preamble followed by `DICM`.
pub fn has_dicom_preamble(bytes: &[u8]) -> bool {
    bytes.len() >= DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()
        && &bytes[DICOM_MAGIC_OFFSET..DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()] == DICOM_MAGIC
}

/// Preamble-less dataset: starts with a little-endian tag from the file meta
/// group (0002) or the identifying group (0008), followed by a plausible VR
/// or a 32-bit implicit length.
fn looks_like_bare_dicom(bytes: &[u8]) -> bool {
    if bytes.len() < 8 {
        return false;
    }
    let group = u16::from_le_bytes([bytes[0], bytes[1]]);
    if group != 0x0002 && group != 0x0008 {
        return false;
    }
    let vr = &bytes[4..6];
    let explicit_vr = vr.iter().all(|b| b.is_ascii_uppercase());
    let implicit_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    explicit_vr || implicit_len < 0x1_0000
}

/// Map to the `image` crate decoder. `None` for DICOM, which is read in-house.
pub fn raster_format(format: SourceFormat) -> Option<image::ImageFormat> {
    match format {
        SourceFormat::Png => Some(image::ImageFormat::Png),
        SourceFormat::Jpeg => Some(image::ImageFormat::Jpeg),
        SourceFormat::Tiff => Some(image::ImageFormat::Tiff),
        SourceFormat::Bmp => Some(image::ImageFormat::Bmp),
        SourceFormat::Dicom => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_png() {
        let bytes = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(detect_format(&bytes), Some(SourceFormat::Png));
    }

    #[test]
    fn detects_jpeg() {
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), Some(SourceFormat::Jpeg));
    }

    #[test]
    fn detects_tiff_both_endians() {
        assert_eq!(detect_format(&[0x49, 0x49, 0x2A, 0x00, 8, 0]), Some(SourceFormat::Tiff));
        assert_eq!(detect_format(&[0x4D, 0x4D, 0x00, 0x2A, 0, 8]), Some(SourceFormat::Tiff));
    }

    #[test]
    fn detects_dicom_with_preamble() {
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[0x02, 0x00, 0x10, 0x00]);
        assert_eq!(detect_format(&bytes), Some(SourceFormat::Dicom));
    }

    #[test]
    fn detects_bare_dicom_dataset() {
        // (0008,0060) CS "CT" explicit VR
        let bytes = [0x08, 0x00, 0x60, 0x00, b'C', b'S', 0x02, 0x00, b'C', b'T'];
        assert_eq!(detect_format(&bytes), Some(SourceFormat::Dicom));
    }

    #[test]
    fn empty_and_garbage_are_unknown() {
        assert_eq!(detect_format(&[]), None);
        assert_eq!(detect_format(b"fake file content"), None);
        assert_eq!(detect_format(&[0x25, 0x50, 0x44, 0x46, 0x2D]), None);
    }

    #[test]
    fn short_bm_prefix_is_not_bmp() {
        assert_eq!(detect_format(b"BM"), None);
    }

    #[test]
    fn dicom_has_no_raster_decoder() {
        assert!(raster_format(SourceFormat::Dicom).is_none());
        assert_eq!(raster_format(SourceFormat::Png), Some(image::ImageFormat::Png));
    }
}
