//! Extractor registry: file bytes in, extractable text and side-metadata out.
//!
//! Resolution order: extension map → magic-byte sniff → plaintext fallback
//! for mostly-printable content. Formats whose parsing belongs to external
//! adapter crates (PDF, DOCX, OCR) resolve to `Unsupported` and fail the
//! extraction cleanly rather than producing garbage text.
//!
//! Image and audio files yield no body text from the core (no OCR or
//! transcription adapter in-process) but do yield typed side-metadata read
//! from their container headers.

use anyhow::{bail, Result};
use std::path::Path;

use crate::models::ChunkKind;

/// What the registry resolved a file to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    PlainText,
    Markdown,
    Code,
    Html,
    Json,
    Yaml,
    Fae,
    Image,
    Audio,
    Unsupported,
}

/// Image facts read from container headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfo {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub format: Option<String>,
}

/// Audio facts read from container headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioInfo {
    pub duration_seconds: Option<f64>,
    pub sample_rate: Option<i64>,
    pub channels: Option<i64>,
    pub codec: Option<String>,
}

/// Result of running an extractor over one file's bytes.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub kind: ChunkKind,
    pub image: Option<ImageInfo>,
    pub audio: Option<AudioInfo>,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "kt", "c", "cc", "cpp", "h", "hpp",
    "rb", "sh", "sql", "lua",
];

const TEXT_EXTENSIONS: &[&str] = &["txt", "text", "rst", "org", "csv", "tsv", "ini", "cfg", "toml"];

/// Extensions handled only by out-of-process adapters.
const ADAPTER_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "pptx", "xlsx"];

/// Resolve an extractor by extension, falling back to a magic-byte sniff,
/// then to plaintext for mostly-printable bytes.
pub fn resolve(extension: &str, bytes: &[u8]) -> ExtractorKind {
    let ext = extension.to_lowercase();

    if ext == "md" || ext == "markdown" {
        return ExtractorKind::Markdown;
    }
    if ext == "html" || ext == "htm" {
        return ExtractorKind::Html;
    }
    if ext == "json" {
        return ExtractorKind::Json;
    }
    if ext == "yaml" || ext == "yml" {
        return ExtractorKind::Yaml;
    }
    if CODE_EXTENSIONS.contains(&ext.as_str()) {
        return ExtractorKind::Code;
    }
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return ExtractorKind::PlainText;
    }
    if ADAPTER_EXTENSIONS.contains(&ext.as_str()) {
        return ExtractorKind::Unsupported;
    }
    if matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp") {
        return ExtractorKind::Image;
    }
    if matches!(ext.as_str(), "wav" | "mp3" | "flac" | "ogg" | "m4a") {
        return ExtractorKind::Audio;
    }

    sniff(bytes)
}

/// Magic-byte sniff for extensionless or unknown files.
pub fn sniff(bytes: &[u8]) -> ExtractorKind {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") || bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return ExtractorKind::Image;
    }
    if bytes.starts_with(b"RIFF") && bytes.len() >= 12 && &bytes[8..12] == b"WAVE" {
        return ExtractorKind::Audio;
    }
    if bytes.starts_with(b"ID3") {
        return ExtractorKind::Audio;
    }
    if bytes.starts_with(b"%PDF") || bytes.starts_with(b"PK\x03\x04") {
        return ExtractorKind::Unsupported;
    }

    if is_mostly_printable(bytes) {
        ExtractorKind::PlainText
    } else {
        ExtractorKind::Unsupported
    }
}

fn is_mostly_printable(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    let sample = &bytes[..bytes.len().min(4096)];
    if sample.contains(&0) {
        return false;
    }
    let printable = sample
        .iter()
        .filter(|&&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7F).contains(&b) || b >= 0x80)
        .count();
    printable * 100 / sample.len() >= 95
}

/// Run the resolved extractor. `Unsupported` is an extraction failure, not
/// a panic: the file is marked failed and the job terminates.
pub fn extract(kind: ExtractorKind, path: &Path, bytes: &[u8]) -> Result<Extraction> {
    match kind {
        ExtractorKind::PlainText | ExtractorKind::Markdown | ExtractorKind::Json
        | ExtractorKind::Yaml => Ok(Extraction {
            text: decode_text(bytes)?,
            kind: ChunkKind::Prose,
            image: None,
            audio: None,
        }),
        ExtractorKind::Code => Ok(Extraction {
            text: decode_text(bytes)?,
            kind: ChunkKind::Code,
            image: None,
            audio: None,
        }),
        ExtractorKind::Html => Ok(Extraction {
            text: strip_html(&decode_text(bytes)?),
            kind: ChunkKind::Prose,
            image: None,
            audio: None,
        }),
        ExtractorKind::Fae => {
            // FAE files go through the dedicated parser; reaching the plain
            // extractor with them is a dispatch error in the pipeline.
            bail!("FAE archives are handled by the conversation importer")
        }
        ExtractorKind::Image => Ok(Extraction {
            text: String::new(),
            kind: ChunkKind::Ocr,
            image: Some(read_image_info(bytes)),
            audio: None,
        }),
        ExtractorKind::Audio => Ok(Extraction {
            text: String::new(),
            kind: ChunkKind::Prose,
            image: None,
            audio: Some(read_audio_info(bytes)),
        }),
        ExtractorKind::Unsupported => {
            bail!(
                "No extractor for file: {} (format requires an external adapter)",
                path.display()
            )
        }
    }
}

fn decode_text(bytes: &[u8]) -> Result<String> {
    match String::from_utf8(bytes.to_vec()) {
        Ok(s) => Ok(s),
        Err(_) => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Minimal tag stripper: removes markup, keeps text content, drops
/// script/style bodies.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.char_indices().peekable();
    let mut skip_until: Option<&str> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(close) = skip_until {
            if html[i..].to_lowercase().starts_with(close) {
                for _ in 0..close.len() - 1 {
                    chars.next();
                }
                skip_until = None;
            }
            continue;
        }

        if c == '<' {
            let rest = html[i..].to_lowercase();
            if rest.starts_with("<script") {
                skip_until = Some("</script>");
                continue;
            }
            if rest.starts_with("<style") {
                skip_until = Some("</style>");
                continue;
            }
            // Skip to the closing '>'
            for (_, tc) in chars.by_ref() {
                if tc == '>' {
                    break;
                }
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ Container header readers ============
//
// Enough header parsing to fill the typed side-metadata records without an
// external format crate. EXIF and tag blocks are adapter territory.

fn read_image_info(bytes: &[u8]) -> ImageInfo {
    // PNG: IHDR directly after the 8-byte signature.
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") && bytes.len() >= 24 {
        let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        return ImageInfo {
            width: Some(width as i64),
            height: Some(height as i64),
            format: Some("PNG".to_string()),
        };
    }

    // JPEG: walk segments to the first SOF marker.
    if bytes.starts_with(&[0xFF, 0xD8]) {
        let mut pos = 2usize;
        while pos + 9 < bytes.len() {
            if bytes[pos] != 0xFF {
                break;
            }
            let marker = bytes[pos + 1];
            let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            if (0xC0..=0xCF).contains(&marker) && marker != 0xC4 && marker != 0xC8 && marker != 0xCC
            {
                let height = u16::from_be_bytes([bytes[pos + 5], bytes[pos + 6]]);
                let width = u16::from_be_bytes([bytes[pos + 7], bytes[pos + 8]]);
                return ImageInfo {
                    width: Some(width as i64),
                    height: Some(height as i64),
                    format: Some("JPEG".to_string()),
                };
            }
            pos += 2 + length;
        }
        return ImageInfo {
            format: Some("JPEG".to_string()),
            ..Default::default()
        };
    }

    ImageInfo::default()
}

fn read_audio_info(bytes: &[u8]) -> AudioInfo {
    // WAV: fmt chunk carries rate/channels, data chunk length gives duration.
    if bytes.starts_with(b"RIFF") && bytes.len() >= 12 && &bytes[8..12] == b"WAVE" {
        let mut info = AudioInfo {
            codec: Some("pcm".to_string()),
            ..Default::default()
        };
        let mut byte_rate: Option<u32> = None;
        let mut pos = 12usize;

        while pos + 8 <= bytes.len() {
            let chunk_id = &bytes[pos..pos + 4];
            let chunk_len =
                u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
                    as usize;
            let body = pos + 8;

            if chunk_id == b"fmt " && body + 16 <= bytes.len() {
                info.channels =
                    Some(u16::from_le_bytes([bytes[body + 2], bytes[body + 3]]) as i64);
                info.sample_rate = Some(u32::from_le_bytes([
                    bytes[body + 4],
                    bytes[body + 5],
                    bytes[body + 6],
                    bytes[body + 7],
                ]) as i64);
                byte_rate = Some(u32::from_le_bytes([
                    bytes[body + 8],
                    bytes[body + 9],
                    bytes[body + 10],
                    bytes[body + 11],
                ]));
            } else if chunk_id == b"data" {
                if let Some(rate) = byte_rate {
                    if rate > 0 {
                        info.duration_seconds = Some(chunk_len as f64 / rate as f64);
                    }
                }
            }

            pos = body + chunk_len + (chunk_len % 2);
        }

        return info;
    }

    if bytes.starts_with(b"ID3") {
        return AudioInfo {
            codec: Some("mp3".to_string()),
            ..Default::default()
        };
    }

    AudioInfo::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_resolve_by_extension() {
        assert_eq!(resolve("md", b""), ExtractorKind::Markdown);
        assert_eq!(resolve("rs", b""), ExtractorKind::Code);
        assert_eq!(resolve("json", b""), ExtractorKind::Json);
        assert_eq!(resolve("pdf", b""), ExtractorKind::Unsupported);
        assert_eq!(resolve("png", b""), ExtractorKind::Image);
        assert_eq!(resolve("wav", b""), ExtractorKind::Audio);
    }

    #[test]
    fn test_sniff_fallback() {
        assert_eq!(resolve("", b"plain old notes\n"), ExtractorKind::PlainText);
        assert_eq!(resolve("", b"%PDF-1.4 ..."), ExtractorKind::Unsupported);
        assert_eq!(
            resolve("", b"\x89PNG\r\n\x1a\n rest"),
            ExtractorKind::Image
        );
        assert_eq!(resolve("", &[0u8, 1, 2, 3]), ExtractorKind::Unsupported);
    }

    #[test]
    fn test_extract_unsupported_fails() {
        let err = extract(
            ExtractorKind::Unsupported,
            &PathBuf::from("report.pdf"),
            b"%PDF",
        )
        .unwrap_err();
        assert!(err.to_string().contains("No extractor"));
    }

    #[test]
    fn test_strip_html() {
        let html = "<html><head><style>p{color:red}</style></head><body><p>Hello <b>world</b></p><script>alert(1)</script></body></html>";
        assert_eq!(strip_html(html), "Hello world");
    }

    #[test]
    fn test_png_dimensions() {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&640u32.to_be_bytes());
        bytes.extend_from_slice(&480u32.to_be_bytes());
        let info = read_image_info(&bytes);
        assert_eq!(info.width, Some(640));
        assert_eq!(info.height, Some(480));
        assert_eq!(info.format.as_deref(), Some("PNG"));
    }

    #[test]
    fn test_wav_header() {
        // 1 second of 8kHz mono 8-bit PCM.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&36u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // pcm
        bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
        bytes.extend_from_slice(&8000u32.to_le_bytes()); // sample rate
        bytes.extend_from_slice(&8000u32.to_le_bytes()); // byte rate
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&8000u32.to_le_bytes());
        bytes.resize(bytes.len() + 8000, 0x80);

        let info = read_audio_info(&bytes);
        assert_eq!(info.sample_rate, Some(8000));
        assert_eq!(info.channels, Some(1));
        assert_eq!(info.duration_seconds, Some(1.0));
    }
}
