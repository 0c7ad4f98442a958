use std::fmt;
use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use serde::Serialize;

use crate::types::MB;

/// File types the engine can carve. Growing this list is a data change:
/// add a [`FileKind`] row here and a descriptor row to the built-in table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Pdf,
    Zip,
    Docx,
    Doc,
    Mp3,
    Mp4,
    Rar,
    /// Metadata-recovered file whose content matched no known signature.
    /// Never appears in the catalog.
    Unknown,
}

impl FileKind {
    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Jpeg => "jpg",
            FileKind::Png => "png",
            FileKind::Gif => "gif",
            FileKind::Bmp => "bmp",
            FileKind::Pdf => "pdf",
            FileKind::Zip => "zip",
            FileKind::Docx => "docx",
            FileKind::Doc => "doc",
            FileKind::Mp3 => "mp3",
            FileKind::Mp4 => "mp4",
            FileKind::Rar => "rar",
            FileKind::Unknown => "bin",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Jpeg => "JPEG Image",
            FileKind::Png => "PNG Image",
            FileKind::Gif => "GIF Image",
            FileKind::Bmp => "BMP Image",
            FileKind::Pdf => "PDF Document",
            FileKind::Zip => "ZIP Archive",
            FileKind::Docx => "Office Open XML Document",
            FileKind::Doc => "Legacy Office Document",
            FileKind::Mp3 => "MP3 Audio",
            FileKind::Mp4 => "MP4 Video",
            FileKind::Rar => "RAR Archive",
            FileKind::Unknown => "Unknown",
        }
    }

    /// Parses a user-supplied extension, as given to a type filter.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(FileKind::Jpeg),
            "png" => Some(FileKind::Png),
            "gif" => Some(FileKind::Gif),
            "bmp" => Some(FileKind::Bmp),
            "pdf" => Some(FileKind::Pdf),
            "zip" => Some(FileKind::Zip),
            "docx" => Some(FileKind::Docx),
            "doc" => Some(FileKind::Doc),
            "mp3" => Some(FileKind::Mp3),
            "mp4" => Some(FileKind::Mp4),
            "rar" => Some(FileKind::Rar),
            _ => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One row of the signature catalog. Immutable after construction.
#[derive(Debug, Clone)]
pub struct SignatureDescriptor {
    kind: FileKind,
    header: Vec<u8>,
    footer: Option<Vec<u8>>,
    /// Bytes belonging to the file after the footer magic (e.g. the 18
    /// remaining bytes of a ZIP end-of-central-directory record).
    footer_trailer: u64,
    max_size: u64,
    is_container: bool,
}

impl SignatureDescriptor {
    pub fn new(
        kind: FileKind,
        header: Vec<u8>,
        footer: Option<Vec<u8>>,
        footer_trailer: u64,
        max_size: u64,
        is_container: bool,
    ) -> Self {
        assert!(!header.is_empty());
        Self {
            kind,
            header,
            footer,
            footer_trailer,
            max_size,
            is_container,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn footer(&self) -> Option<&[u8]> {
        self.footer.as_deref()
    }

    pub fn footer_trailer(&self) -> u64 {
        self.footer_trailer
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn is_container(&self) -> bool {
        self.is_container
    }

    /// Length field embedded in the header, for formats that define one.
    /// An implausible value means the header match is a false positive and
    /// the window should not be carved at all.
    pub fn embedded_length(&self, window: &[u8]) -> Option<u64> {
        match self.kind {
            FileKind::Bmp => {
                let bytes = window.get(2..6)?;
                let size = u32::from_le_bytes(bytes.try_into().ok()?) as u64;
                // A BMP smaller than its own headers is not a BMP.
                if size >= 26 && size <= self.max_size {
                    Some(size)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn has_embedded_length(&self) -> bool {
        matches!(self.kind, FileKind::Bmp)
    }
}

/// Static, read-only table of known file signatures with an Aho-Corasick
/// matcher over all headers. Built once; reads need no synchronization.
pub struct SignatureCatalog {
    descriptors: Vec<SignatureDescriptor>,
    matcher: AhoCorasick,
    max_header_len: usize,
}

impl SignatureCatalog {
    pub fn new(descriptors: Vec<SignatureDescriptor>) -> Self {
        assert!(!descriptors.is_empty());
        let matcher = AhoCorasick::new(descriptors.iter().map(|d| d.header()))
            .expect("signature headers form a valid pattern set");
        let max_header_len = descriptors.iter().map(|d| d.header.len()).max().unwrap_or(1);
        Self {
            descriptors,
            matcher,
            max_header_len,
        }
    }

    /// The built-in table: every type the original toolkit knew, with the
    /// footers and size caps carving needs.
    pub fn builtin() -> &'static SignatureCatalog {
        static CATALOG: LazyLock<SignatureCatalog> =
            LazyLock::new(|| SignatureCatalog::new(builtin_descriptors()));
        &CATALOG
    }

    pub fn descriptors(&self) -> &[SignatureDescriptor] {
        &self.descriptors
    }

    /// Longest header length; window overlap is this minus one so no
    /// signature can straddle a chunk boundary unseen.
    pub fn max_header_len(&self) -> usize {
        self.max_header_len
    }

    /// Descriptors whose header matches at offset 0 of `window`.
    pub fn matches_at(&self, window: &[u8]) -> Vec<&SignatureDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| window.len() >= d.header.len() && window[..d.header.len()] == *d.header)
            .collect()
    }

    /// All header matches in `data`, including overlapping ones, as
    /// `(offset, descriptor)` pairs ordered by offset.
    pub fn find_in(&self, data: &[u8]) -> Vec<(usize, &SignatureDescriptor)> {
        let mut out: Vec<(usize, &SignatureDescriptor)> = self
            .matcher
            .find_overlapping_iter(data)
            .map(|m| (m.start(), &self.descriptors[m.pattern().as_usize()]))
            .collect();
        out.sort_by_key(|(off, d)| (*off, usize::MAX - d.header.len()));
        out
    }

    /// Tie-break for several signatures matching at one offset: the most
    /// specific (longest) header wins; at equal length, prefer the
    /// container-aware descriptor.
    pub fn resolve<'a>(
        &self,
        matches: &[&'a SignatureDescriptor],
    ) -> Option<&'a SignatureDescriptor> {
        matches
            .iter()
            .copied()
            .max_by_key(|d| (d.header.len(), d.is_container))
    }
}

fn builtin_descriptors() -> Vec<SignatureDescriptor> {
    vec![
        SignatureDescriptor::new(
            FileKind::Jpeg,
            vec![0xFF, 0xD8, 0xFF],
            Some(vec![0xFF, 0xD9]),
            0,
            50 * MB,
            false,
        ),
        SignatureDescriptor::new(
            FileKind::Png,
            vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            Some(vec![0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]),
            0,
            100 * MB,
            false,
        ),
        SignatureDescriptor::new(
            FileKind::Gif,
            b"GIF8".to_vec(),
            Some(vec![0x00, 0x3B]),
            0,
            20 * MB,
            false,
        ),
        SignatureDescriptor::new(FileKind::Bmp, b"BM".to_vec(), None, 0, 64 * MB, false),
        SignatureDescriptor::new(
            FileKind::Pdf,
            b"%PDF".to_vec(),
            Some(b"%%EOF".to_vec()),
            0,
            200 * MB,
            false,
        ),
        SignatureDescriptor::new(
            FileKind::Zip,
            vec![0x50, 0x4B, 0x03, 0x04],
            Some(vec![0x50, 0x4B, 0x05, 0x06]),
            // End-of-central-directory record minus its 4-byte magic.
            18,
            500 * MB,
            true,
        ),
        SignatureDescriptor::new(
            FileKind::Docx,
            vec![0x50, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x06, 0x00],
            Some(vec![0x50, 0x4B, 0x05, 0x06]),
            18,
            100 * MB,
            true,
        ),
        SignatureDescriptor::new(
            FileKind::Doc,
            vec![0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
            None,
            0,
            50 * MB,
            false,
        ),
        SignatureDescriptor::new(FileKind::Mp3, b"ID3".to_vec(), None, 0, 30 * MB, false),
        // MP4 has no fixed byte at offset 0; cover the two ftyp box sizes
        // that dominate real files.
        SignatureDescriptor::new(
            FileKind::Mp4,
            vec![0x00, 0x00, 0x00, 0x18, 0x66, 0x74, 0x79, 0x70],
            None,
            0,
            300 * MB,
            false,
        ),
        SignatureDescriptor::new(
            FileKind::Mp4,
            vec![0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x70],
            None,
            0,
            300 * MB,
            false,
        ),
        SignatureDescriptor::new(
            FileKind::Rar,
            vec![0x52, 0x61, 0x72, 0x21, 0x1A, 0x07],
            None,
            0,
            500 * MB,
            false,
        ),
    ]
}
