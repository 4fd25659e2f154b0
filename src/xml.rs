//! XML manifest resource (C7, spec §3/§4.7): the always-uncompressed,
//! UTF-16LE-with-BOM `<WIM>` document describing every image, plus the
//! rewrite operations `update`/`delete` perform on it.
//!
//! Grounded on `SSWIMMC.py`'s `make_xmldata` (element order and the
//! HIGHPART/LOWPART hex-tick encoding) and `SSWIMMU.py`'s delete path (strip
//! one `<IMAGE INDEX=N>` node, renumber the remaining ones down by one,
//! rewrite `<TOTALBYTES>`). Manifest text itself is assembled and scanned
//! with plain string/`regex` work, matching the reference implementation's
//! own hand-rolled templating rather than pulling in a full XML crate the
//! teacher stack never uses.

use crate::error::FormatError;
use crate::hash::Sha1Key;
use crate::time::nt_to_high_low;
use regex::Regex;

pub const XML_BOM: [u8; 2] = [0xFF, 0xFE];

/// One `<IMAGE>` element's worth of manifest data (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ImageXmlInfo {
    pub index: u32,
    pub dir_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub hard_link_bytes: u64,
    pub creation_time_nt: u64,
    pub last_modification_time_nt: u64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub flags: Option<String>,
    /// Content hash of this image's metadata resource. Not part of the
    /// Microsoft-documented manifest fields; carried here (as
    /// `<METADATAHASH>`) so reopening an archive can recover which offset
    /// table entry each image's directory tree lives in without an extra
    /// on-disk structure — two images whose trees hash identically share
    /// one resource and one `<METADATAHASH>` value (spec §4.5 aliasing).
    pub metadata_hash: Sha1Key,
}

/// The full manifest: one `<WIM>` root wrapping zero or more `<IMAGE>`
/// elements, in image-index order.
#[derive(Debug, Clone, Default)]
pub struct WimXml {
    pub total_bytes: u64,
    pub images: Vec<ImageXmlInfo>,
}

impl WimXml {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, index: u32) -> Option<&ImageXmlInfo> {
        self.images.iter().find(|i| i.index == index)
    }

    pub fn push_image(&mut self, mut info: ImageXmlInfo) {
        info.index = self.images.len() as u32 + 1;
        self.images.push(info);
    }

    /// Remove image `index` (1-based) and renumber every later image's
    /// `INDEX` down by one, matching `SSWIMMU.py`'s delete path.
    pub fn remove_image(&mut self, index: u32) -> Result<ImageXmlInfo, FormatError> {
        let pos = self
            .images
            .iter()
            .position(|i| i.index == index)
            .ok_or_else(|| FormatError::Xml(format!("no IMAGE with INDEX={index}")))?;
        let removed = self.images.remove(pos);
        for img in self.images.iter_mut().skip(pos) {
            img.index -= 1;
        }
        Ok(removed)
    }

    pub fn recompute_total_bytes(&mut self, archive_body_len: u64) {
        self.total_bytes = archive_body_len;
    }

    /// Encode the manifest body as a UTF-8 XML string (pre-UTF-16
    /// transcoding), in the order `make_xmldata` emits: `TOTALBYTES` first,
    /// then each `<IMAGE>` in index order.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        out.push_str("<WIM>");
        out.push_str(&format!("<TOTALBYTES>{}</TOTALBYTES>", self.total_bytes));
        for img in &self.images {
            out.push_str(&encode_image(img));
        }
        out.push_str("</WIM>");
        out
    }

    /// Encode to the on-disk bytes: UTF-16LE with a leading BOM, no
    /// compression (the XML resource is never chunk-compressed, spec §3).
    pub fn encode_bytes(&self) -> Vec<u8> {
        let text = self.encode_text();
        let mut out = Vec::with_capacity(2 + text.len() * 2);
        out.extend_from_slice(&XML_BOM);
        for u in text.encode_utf16() {
            out.extend_from_slice(&u.to_le_bytes());
        }
        out
    }

    /// Parse the on-disk bytes (BOM + UTF-16LE) back into a [`WimXml`].
    pub fn decode_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < 2 {
            return Err(FormatError::Xml("manifest shorter than BOM".into()));
        }
        let body = if buf[0..2] == XML_BOM { &buf[2..] } else { buf };
        if body.len() % 2 != 0 {
            return Err(FormatError::Xml("manifest byte length is odd".into()));
        }
        let units: Vec<u16> = body.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        let text = String::from_utf16(&units).map_err(|_| FormatError::Xml("invalid UTF-16LE manifest".into()))?;
        Self::parse_text(&text)
    }

    pub fn parse_text(text: &str) -> Result<Self, FormatError> {
        let total_bytes = extract_u64(text, "TOTALBYTES").unwrap_or(0);
        let image_re = Regex::new(r"(?s)<IMAGE\s+INDEX=\"(\d+)\"\s*>(.*?)</IMAGE>").unwrap();
        let mut images = Vec::new();
        for cap in image_re.captures_iter(text) {
            let index: u32 = cap[1].parse().map_err(|_| FormatError::Xml("bad IMAGE INDEX".into()))?;
            let body = &cap[2];
            images.push(ImageXmlInfo {
                index,
                dir_count: extract_u64(body, "DIRCOUNT").unwrap_or(0),
                file_count: extract_u64(body, "FILECOUNT").unwrap_or(0),
                total_bytes: extract_u64(body, "TOTALBYTES").unwrap_or(0),
                hard_link_bytes: extract_u64(body, "HARDLINKBYTES").unwrap_or(0),
                creation_time_nt: extract_high_low(body, "CREATIONTIME").unwrap_or(0),
                last_modification_time_nt: extract_high_low(body, "LASTMODIFICATIONTIME").unwrap_or(0),
                name: extract_text(body, "NAME"),
                description: extract_text(body, "DESCRIPTION"),
                flags: extract_text(body, "FLAGS"),
                metadata_hash: extract_text(body, "METADATAHASH")
                    .and_then(|h| hex_to_sha1(&h))
                    .unwrap_or_default(),
            });
        }
        images.sort_by_key(|i| i.index);
        Ok(Self { total_bytes, images })
    }
}

fn encode_image(img: &ImageXmlInfo) -> String {
    let (ch, cl) = nt_to_high_low(img.creation_time_nt);
    let (mh, ml) = nt_to_high_low(img.last_modification_time_nt);
    let mut out = format!("<IMAGE INDEX=\"{}\">", img.index);
    out.push_str(&format!("<DIRCOUNT>{}</DIRCOUNT>", img.dir_count));
    out.push_str(&format!("<FILECOUNT>{}</FILECOUNT>", img.file_count));
    out.push_str(&format!("<TOTALBYTES>{}</TOTALBYTES>", img.total_bytes));
    out.push_str(&format!("<HARDLINKBYTES>{}</HARDLINKBYTES>", img.hard_link_bytes));
    out.push_str(&format!(
        "<CREATIONTIME><HIGHPART>0x{ch:08X}</HIGHPART><LOWPART>0x{cl:08X}</LOWPART></CREATIONTIME>"
    ));
    out.push_str(&format!(
        "<LASTMODIFICATIONTIME><HIGHPART>0x{mh:08X}</HIGHPART><LOWPART>0x{ml:08X}</LOWPART></LASTMODIFICATIONTIME>"
    ));
    if let Some(name) = &img.name {
        out.push_str(&format!("<NAME>{}</NAME>", xml_escape(name)));
    }
    if let Some(desc) = &img.description {
        out.push_str(&format!("<DESCRIPTION>{}</DESCRIPTION>", xml_escape(desc)));
    }
    if let Some(flags) = &img.flags {
        out.push_str(&format!("<FLAGS>{}</FLAGS>", xml_escape(flags)));
    }
    out.push_str(&format!("<METADATAHASH>{}</METADATAHASH>", img.metadata_hash.to_hex()));
    out.push_str("</IMAGE>");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

fn extract_u64(text: &str, tag: &str) -> Option<u64> {
    let re = Regex::new(&format!(r"<{tag}>(\d+)</{tag}>")).ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn extract_text(text: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).ok()?;
    re.captures(text).map(|c| xml_unescape(c[1].trim()))
}

fn hex_to_sha1(s: &str) -> Option<Sha1Key> {
    let bytes = hex::decode(s.trim()).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    let mut arr = [0u8; 20];
    arr.copy_from_slice(&bytes);
    Some(Sha1Key(arr))
}

fn extract_high_low(text: &str, tag: &str) -> Option<u64> {
    let re = Regex::new(&format!(
        r"(?s)<{tag}>\s*<HIGHPART>0x([0-9A-Fa-f]+)</HIGHPART>\s*<LOWPART>0x([0-9A-Fa-f]+)</LOWPART>\s*</{tag}>"
    ))
    .ok()?;
    let cap = re.captures(text)?;
    let high = u32::from_str_radix(&cap[1], 16).ok()?;
    let low = u32::from_str_radix(&cap[2], 16).ok()?;
    Some(crate::time::high_low_to_nt(high, low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WimXml {
        let mut xml = WimXml::new();
        xml.total_bytes = 12345;
        xml.push_image(ImageXmlInfo {
            index: 0,
            dir_count: 2,
            file_count: 5,
            total_bytes: 1000,
            hard_link_bytes: 0,
            creation_time_nt: 132_000_000_000_000_000,
            last_modification_time_nt: 132_000_000_000_000_000,
            name: Some("Main".to_string()),
            description: Some("A & B".to_string()),
            flags: None,
            metadata_hash: Sha1Key([9u8; 20]),
        });
        xml
    }

    #[test]
    fn encode_decode_roundtrip() {
        let xml = sample();
        let bytes = xml.encode_bytes();
        assert_eq!(&bytes[0..2], &XML_BOM);
        let back = WimXml::decode_bytes(&bytes).unwrap();
        assert_eq!(back.total_bytes, xml.total_bytes);
        assert_eq!(back.images.len(), 1);
        assert_eq!(back.images[0].name.as_deref(), Some("Main"));
        assert_eq!(back.images[0].description.as_deref(), Some("A & B"));
        assert_eq!(back.images[0].creation_time_nt, xml.images[0].creation_time_nt);
        assert_eq!(back.images[0].metadata_hash, xml.images[0].metadata_hash);
    }

    #[test]
    fn push_image_assigns_sequential_index() {
        let mut xml = WimXml::new();
        xml.push_image(ImageXmlInfo::default());
        xml.push_image(ImageXmlInfo::default());
        assert_eq!(xml.images[0].index, 1);
        assert_eq!(xml.images[1].index, 2);
    }

    #[test]
    fn remove_image_renumbers_remaining() {
        let mut xml = WimXml::new();
        xml.push_image(ImageXmlInfo::default());
        xml.push_image(ImageXmlInfo::default());
        xml.push_image(ImageXmlInfo::default());
        xml.remove_image(2).unwrap();
        assert_eq!(xml.images.len(), 2);
        assert_eq!(xml.images[0].index, 1);
        assert_eq!(xml.images[1].index, 2);
    }

    #[test]
    fn remove_unknown_image_errors() {
        let mut xml = WimXml::new();
        assert!(xml.remove_image(1).is_err());
    }
}
