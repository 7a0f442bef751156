//! Payloads: opaque bytes plus a discriminator that never travels on the wire.
//!
//! Receivers classify by content: try an image header first, then strict UTF-8 text.
//! Text that happens to begin with a valid image header is read as an image.

use crate::identity::PeerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Image,
    Text,
}

/// Outbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    kind: PayloadKind,
    bytes: Vec<u8>,
}

impl Payload {
    pub fn image(bytes: Vec<u8>) -> Self {
        Self {
            kind: PayloadKind::Image,
            bytes,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            bytes: text.into().into_bytes(),
        }
    }

    /// Companion text sent after an image in the dual-payload variant.
    pub fn provenance(sender: &PeerIdentity) -> Self {
        Self::text(format!("Sent from {}", sender))
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
        }
    }
}

/// Inbound payload after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedPayload {
    Image { format: ImageFormat, bytes: Vec<u8> },
    Text(String),
}

/// Classify received bytes: image first, then text. `None` when neither decodes.
pub fn classify(bytes: Vec<u8>) -> Option<ReceivedPayload> {
    if let Some(format) = sniff_image(&bytes) {
        return Some(ReceivedPayload::Image { format, bytes });
    }
    String::from_utf8(bytes).ok().map(ReceivedPayload::Text)
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Parse enough of an image header to be confident about the format.
pub fn sniff_image(bytes: &[u8]) -> Option<ImageFormat> {
    if is_png(bytes) {
        Some(ImageFormat::Png)
    } else if is_jpeg(bytes) {
        Some(ImageFormat::Jpeg)
    } else if is_gif(bytes) {
        Some(ImageFormat::Gif)
    } else {
        None
    }
}

// Signature, then IHDR as the first chunk: length 13, non-zero width and height, CRC present.
fn is_png(b: &[u8]) -> bool {
    if b.len() < 33 || b[..8] != PNG_SIGNATURE {
        return false;
    }
    let len = u32::from_be_bytes([b[8], b[9], b[10], b[11]]);
    let width = u32::from_be_bytes([b[16], b[17], b[18], b[19]]);
    let height = u32::from_be_bytes([b[20], b[21], b[22], b[23]]);
    len == 13 && &b[12..16] == b"IHDR" && width > 0 && height > 0
}

fn is_jpeg(b: &[u8]) -> bool {
    b.len() >= 4 && b[..3] == [0xff, 0xd8, 0xff] && b[b.len() - 2..] == [0xff, 0xd9]
}

fn is_gif(b: &[u8]) -> bool {
    if b.len() < 13 || !(b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a")) {
        return false;
    }
    let width = u16::from_le_bytes([b[6], b[7]]);
    let height = u16::from_le_bytes([b[8], b[9]]);
    width > 0 && height > 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Smallest byte string that passes the PNG header check.
    pub(crate) fn tiny_png() -> Vec<u8> {
        let mut b = PNG_SIGNATURE.to_vec();
        b.extend_from_slice(&13u32.to_be_bytes());
        b.extend_from_slice(b"IHDR");
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(&[8, 6, 0, 0, 0]);
        b.extend_from_slice(&[0x1f, 0x15, 0xc4, 0x89]);
        b
    }

    #[test]
    fn png_is_image() {
        assert_eq!(
            classify(tiny_png()),
            Some(ReceivedPayload::Image {
                format: ImageFormat::Png,
                bytes: tiny_png()
            })
        );
    }

    #[test]
    fn truncated_png_falls_back() {
        let truncated = tiny_png()[..20].to_vec();
        assert_eq!(sniff_image(&truncated), None);
        // The signature's high byte is not valid UTF-8 either.
        assert_eq!(classify(truncated), None);
    }

    #[test]
    fn zero_sized_png_is_not_an_image() {
        let mut b = tiny_png();
        b[16..20].copy_from_slice(&0u32.to_be_bytes());
        assert_eq!(sniff_image(&b), None);
    }

    #[test]
    fn jpeg_and_gif_headers() {
        let jpeg = vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0xff, 0xd9];
        assert_eq!(sniff_image(&jpeg), Some(ImageFormat::Jpeg));
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[2, 0, 3, 0, 0, 0, 0]);
        assert_eq!(sniff_image(&gif), Some(ImageFormat::Gif));
    }

    #[test]
    fn text_falls_back_to_utf8() {
        let p = Payload::provenance(&PeerIdentity::new("Alice#00ff"));
        assert_eq!(p.kind(), PayloadKind::Text);
        assert_eq!(
            classify(p.bytes().to_vec()),
            Some(ReceivedPayload::Text("Sent from Alice#00ff".into()))
        );
    }

    #[test]
    fn text_with_image_magic_reads_as_image() {
        let looks_like_gif = "GIF89a\u{1}\u{1}\u{1}\u{1} not really".as_bytes().to_vec();
        assert!(matches!(
            classify(looks_like_gif),
            Some(ReceivedPayload::Image {
                format: ImageFormat::Gif,
                ..
            })
        ));
    }

    #[test]
    fn binary_garbage_is_unrecognized() {
        assert_eq!(classify(vec![0xfe, 0xfe, 0x00, 0x01]), None);
    }
}
