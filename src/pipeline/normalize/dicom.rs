//! Minimal DICOM Part 10 reader: enough of the dataset to pull one frame of
//! native (uncompressed) pixel data and the attributes that drive windowing.
//!
//! Supported transfer syntaxes: implicit VR little endian and explicit VR
//! little endian. Everything else (big endian, deflate, JPEG/RLE encapsulation)
//! is reported as unsupported rather than guessed at.

use image::RgbImage;
use thiserror::Error;

use super::format::{has_dicom_preamble, DICOM_MAGIC_OFFSET};
use super::window::Window;

const TS_IMPLICIT_LE: &str = "1.2.840.10008.1.2";
const TS_EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

/// Deepest nesting of undefined-length sequences accepted before the stream
/// is rejected as malformed.
const MAX_SEQUENCE_DEPTH: usize = 32;

/// Explicit VRs that use a 2-byte reserved field and a 32-bit length.
const LONG_VRS: &[&[u8; 2]] = &[
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"SV", b"UC", b"UN", b"UR", b"UT", b"UV",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag(u16, u16);

const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
const MODALITY: Tag = Tag(0x0008, 0x0060);
const BODY_PART_EXAMINED: Tag = Tag(0x0018, 0x0015);
const SAMPLES_PER_PIXEL: Tag = Tag(0x0028, 0x0002);
const PHOTOMETRIC_INTERPRETATION: Tag = Tag(0x0028, 0x0004);
const PLANAR_CONFIGURATION: Tag = Tag(0x0028, 0x0006);
const ROWS: Tag = Tag(0x0028, 0x0010);
const COLUMNS: Tag = Tag(0x0028, 0x0011);
const BITS_ALLOCATED: Tag = Tag(0x0028, 0x0100);
const BITS_STORED: Tag = Tag(0x0028, 0x0101);
const PIXEL_REPRESENTATION: Tag = Tag(0x0028, 0x0103);
const WINDOW_CENTER: Tag = Tag(0x0028, 0x1050);
const WINDOW_WIDTH: Tag = Tag(0x0028, 0x1051);
const RESCALE_INTERCEPT: Tag = Tag(0x0028, 0x1052);
const RESCALE_SLOPE: Tag = Tag(0x0028, 0x1053);
const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);
const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DicomError {
    #[error("Truncated DICOM stream at byte {0}")]
    Truncated(usize),

    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Encapsulated (compressed) pixel data is not supported")]
    Encapsulated,

    #[error("Unsupported pixel layout: {0}")]
    UnsupportedPixelLayout(String),

    #[error("Missing required element: {0}")]
    MissingElement(&'static str),

    #[error("Zero-area image ({rows}x{columns})")]
    ZeroArea { rows: u32, columns: u32 },

    #[error("Pixel data too short: expected {expected} bytes, found {found}")]
    ShortPixelData { expected: usize, found: usize },

    #[error("Malformed element: {0}")]
    Malformed(&'static str),
}

impl DicomError {
    /// Valid DICOM we deliberately do not decode, as opposed to broken DICOM.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedTransferSyntax(_) | Self::Encapsulated | Self::UnsupportedPixelLayout(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Photometric {
    /// Lowest value displays as white.
    Monochrome1,
    Monochrome2,
    Rgb,
}

/// Decoded single-frame DICOM image.
#[derive(Debug, Clone)]
pub struct DicomImage {
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub signed: bool,
    pub photometric: Photometric,
    pub planar_configuration: u16,
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
    /// First VOI window stored in the file, if any.
    pub window: Option<Window>,
    pub modality: Option<String>,
    pub body_part: Option<String>,
    frame: Vec<u8>,
}

impl DicomImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, DicomError> {
        let start = if has_dicom_preamble(bytes) {
            DICOM_MAGIC_OFFSET + 4
        } else {
            0
        };

        // File meta group is always explicit VR little endian.
        let mut reader = Reader::new(bytes, start, true);
        let mut transfer_syntax = None;
        while reader.peek_group() == Some(0x0002) {
            let header = reader.read_header()?;
            if header.length == UNDEFINED_LENGTH {
                return Err(DicomError::Malformed("undefined length in file meta"));
            }
            let value = reader.take(header.length as usize)?;
            if header.tag == TRANSFER_SYNTAX_UID {
                transfer_syntax = Some(text_value(value));
            }
        }

        // No meta header: the historical default is implicit VR little endian.
        let syntax = transfer_syntax.unwrap_or_else(|| TS_IMPLICIT_LE.to_string());
        reader.explicit_vr = match syntax.as_str() {
            TS_IMPLICIT_LE => false,
            TS_EXPLICIT_LE => true,
            other => return Err(DicomError::UnsupportedTransferSyntax(other.to_string())),
        };

        let attrs = reader.read_dataset()?;
        attrs.into_image()
    }

    /// Modality values (stored value × slope + intercept) of a monochrome frame,
    /// in row-major order.
    pub fn modality_values(&self) -> Vec<f64> {
        let bytes_per_sample = (self.bits_allocated / 8) as usize;
        self.frame
            .chunks_exact(bytes_per_sample)
            .map(|chunk| {
                let raw = match chunk {
                    [a] => *a as u32,
                    [a, b] => u16::from_le_bytes([*a, *b]) as u32,
                    [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]),
                    _ => 0,
                };
                self.stored_value(raw) * self.rescale_slope + self.rescale_intercept
            })
            .collect()
    }

    /// Mask to `bits_stored` and sign-extend when pixel representation is signed.
    fn stored_value(&self, raw: u32) -> f64 {
        let bits = self.bits_stored as u32;
        if bits >= 32 {
            return if self.signed {
                raw as i32 as f64
            } else {
                raw as f64
            };
        }
        let value = raw & ((1u32 << bits) - 1);
        if self.signed && value & (1u32 << (bits - 1)) != 0 {
            (value as i64 - (1i64 << bits)) as f64
        } else {
            value as f64
        }
    }

    /// 8-bit RGB frame as a raster; `None` for monochrome images.
    pub fn rgb_raster(&self) -> Option<RgbImage> {
        if self.photometric != Photometric::Rgb {
            return None;
        }
        let pixels = (self.rows * self.columns) as usize;
        let interleaved = if self.planar_configuration == 1 {
            let (r, rest) = self.frame.split_at(pixels);
            let (g, b) = rest.split_at(pixels);
            (0..pixels).flat_map(|i| [r[i], g[i], b[i]]).collect()
        } else {
            self.frame.clone()
        };
        RgbImage::from_raw(self.columns, self.rows, interleaved)
    }
}

// ──────────────────────────────────────────────
// Stream reader
// ──────────────────────────────────────────────

struct ElementHeader {
    tag: Tag,
    vr: Option<[u8; 2]>,
    length: u32,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    explicit_vr: bool,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize, explicit_vr: bool) -> Self {
        Self {
            data,
            pos,
            explicit_vr,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DicomError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DicomError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, DicomError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DicomError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn peek_group(&self) -> Option<u16> {
        let b = self.data.get(self.pos..self.pos + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_header(&mut self) -> Result<ElementHeader, DicomError> {
        let tag = Tag(self.read_u16()?, self.read_u16()?);

        // Item and delimiter tags never carry a VR.
        if tag.0 == 0xFFFE {
            let length = self.read_u32()?;
            return Ok(ElementHeader {
                tag,
                vr: None,
                length,
            });
        }

        if self.explicit_vr {
            let raw = self.take(2)?;
            let vr = [raw[0], raw[1]];
            let length = if LONG_VRS.contains(&&vr) {
                self.take(2)?;
                self.read_u32()?
            } else {
                self.read_u16()? as u32
            };
            Ok(ElementHeader {
                tag,
                vr: Some(vr),
                length,
            })
        } else {
            let length = self.read_u32()?;
            Ok(ElementHeader {
                tag,
                vr: None,
                length,
            })
        }
    }

    /// Walk the top-level dataset up to (and including) Pixel Data.
    fn read_dataset(&mut self) -> Result<Attributes<'a>, DicomError> {
        let mut attrs = Attributes::default();

        while self.remaining() > 0 {
            let header = self.read_header()?;

            if header.length == UNDEFINED_LENGTH {
                if header.tag == PIXEL_DATA {
                    return Err(DicomError::Encapsulated);
                }
                // UN with undefined length is an implicit-VR encoded sequence.
                let saved = self.explicit_vr;
                if header.vr == Some(*b"UN") {
                    self.explicit_vr = false;
                }
                let skipped = self.skip_undefined_sequence(1);
                self.explicit_vr = saved;
                skipped?;
                continue;
            }

            let value = self.take(header.length as usize)?;
            if header.tag == PIXEL_DATA {
                attrs.pixel_data = Some(value);
                break;
            }
            attrs.record(header.tag, value);
        }

        Ok(attrs)
    }

    fn skip_undefined_sequence(&mut self, depth: usize) -> Result<(), DicomError> {
        if depth > MAX_SEQUENCE_DEPTH {
            return Err(DicomError::Malformed("sequence nesting too deep"));
        }
        loop {
            let tag = Tag(self.read_u16()?, self.read_u16()?);
            let length = self.read_u32()?;
            match tag {
                SEQUENCE_DELIMITATION => return Ok(()),
                ITEM if length == UNDEFINED_LENGTH => self.skip_undefined_item(depth)?,
                ITEM => {
                    self.take(length as usize)?;
                }
                _ => return Err(DicomError::Malformed("expected sequence item")),
            }
        }
    }

    fn skip_undefined_item(&mut self, depth: usize) -> Result<(), DicomError> {
        loop {
            let header = self.read_header()?;
            if header.tag == ITEM_DELIMITATION {
                return Ok(());
            }
            if header.length == UNDEFINED_LENGTH {
                self.skip_undefined_sequence(depth + 1)?;
            } else {
                self.take(header.length as usize)?;
            }
        }
    }
}

// ──────────────────────────────────────────────
// Attribute collection
// ──────────────────────────────────────────────

#[derive(Default)]
struct Attributes<'a> {
    rows: Option<u16>,
    columns: Option<u16>,
    samples_per_pixel: Option<u16>,
    photometric: Option<String>,
    planar_configuration: Option<u16>,
    bits_allocated: Option<u16>,
    bits_stored: Option<u16>,
    pixel_representation: Option<u16>,
    window_center: Option<f64>,
    window_width: Option<f64>,
    rescale_intercept: Option<f64>,
    rescale_slope: Option<f64>,
    modality: Option<String>,
    body_part: Option<String>,
    pixel_data: Option<&'a [u8]>,
}

impl<'a> Attributes<'a> {
    fn record(&mut self, tag: Tag, value: &[u8]) {
        match tag {
            ROWS => self.rows = us_value(value),
            COLUMNS => self.columns = us_value(value),
            SAMPLES_PER_PIXEL => self.samples_per_pixel = us_value(value),
            PHOTOMETRIC_INTERPRETATION => self.photometric = Some(text_value(value)),
            PLANAR_CONFIGURATION => self.planar_configuration = us_value(value),
            BITS_ALLOCATED => self.bits_allocated = us_value(value),
            BITS_STORED => self.bits_stored = us_value(value),
            PIXEL_REPRESENTATION => self.pixel_representation = us_value(value),
            WINDOW_CENTER => self.window_center = ds_value(value),
            WINDOW_WIDTH => self.window_width = ds_value(value),
            RESCALE_INTERCEPT => self.rescale_intercept = ds_value(value),
            RESCALE_SLOPE => self.rescale_slope = ds_value(value),
            MODALITY => self.modality = Some(text_value(value)).filter(|s| !s.is_empty()),
            BODY_PART_EXAMINED => self.body_part = Some(text_value(value)).filter(|s| !s.is_empty()),
            _ => {}
        }
    }

    fn into_image(self) -> Result<DicomImage, DicomError> {
        let rows = self.rows.ok_or(DicomError::MissingElement("Rows"))? as u32;
        let columns = self.columns.ok_or(DicomError::MissingElement("Columns"))? as u32;
        let pixel_data = self
            .pixel_data
            .ok_or(DicomError::MissingElement("PixelData"))?;
        if rows == 0 || columns == 0 {
            return Err(DicomError::ZeroArea { rows, columns });
        }

        let samples_per_pixel = self.samples_per_pixel.unwrap_or(1);
        let bits_allocated = self
            .bits_allocated
            .ok_or(DicomError::MissingElement("BitsAllocated"))?;
        let bits_stored = self.bits_stored.unwrap_or(bits_allocated);
        if bits_stored == 0 || bits_stored > bits_allocated {
            return Err(DicomError::Malformed("BitsStored"));
        }

        let photometric = match self.photometric.as_deref() {
            None | Some("MONOCHROME2") if samples_per_pixel == 1 => Photometric::Monochrome2,
            Some("MONOCHROME1") if samples_per_pixel == 1 => Photometric::Monochrome1,
            Some("RGB") if samples_per_pixel == 3 => Photometric::Rgb,
            other => {
                return Err(DicomError::UnsupportedPixelLayout(format!(
                    "{} with {samples_per_pixel} samples per pixel",
                    other.unwrap_or("unspecified photometric interpretation")
                )))
            }
        };

        let supported_depth = match photometric {
            Photometric::Rgb => bits_allocated == 8,
            _ => matches!(bits_allocated, 8 | 16 | 32),
        };
        if !supported_depth {
            return Err(DicomError::UnsupportedPixelLayout(format!(
                "{bits_allocated} bits allocated"
            )));
        }

        let expected = (rows as usize)
            .checked_mul(columns as usize)
            .and_then(|n| n.checked_mul(samples_per_pixel as usize))
            .and_then(|n| n.checked_mul((bits_allocated / 8) as usize))
            .ok_or(DicomError::Malformed("frame size overflow"))?;
        if pixel_data.len() < expected {
            return Err(DicomError::ShortPixelData {
                expected,
                found: pixel_data.len(),
            });
        }

        let window = match (self.window_center, self.window_width) {
            (Some(center), Some(width)) if center.is_finite() && width.is_finite() && width > 0.0 => {
                Some(Window { center, width })
            }
            _ => None,
        };

        Ok(DicomImage {
            rows,
            columns,
            samples_per_pixel,
            bits_allocated,
            bits_stored,
            signed: self.pixel_representation == Some(1),
            photometric,
            planar_configuration: self.planar_configuration.unwrap_or(0),
            rescale_slope: self.rescale_slope.unwrap_or(1.0),
            rescale_intercept: self.rescale_intercept.unwrap_or(0.0),
            window,
            modality: self.modality,
            body_part: self.body_part,
            // Multi-frame: first frame only.
            frame: pixel_data[..expected].to_vec(),
        })
    }
}

fn us_value(value: &[u8]) -> Option<u16> {
    match value {
        [a, b, ..] => Some(u16::from_le_bytes([*a, *b])),
        _ => None,
    }
}

/// Text VRs are padded with spaces (or NUL for UI).
fn text_value(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// First value of a (possibly multi-valued) decimal string.
fn ds_value(value: &[u8]) -> Option<f64> {
    text_value(value)
        .split('\\')
        .next()
        .and_then(|first| first.trim().parse().ok())
}

// ──────────────────────────────────────────────
// Test support: synthetic DICOM writer
// ──────────────────────────────────────────────
