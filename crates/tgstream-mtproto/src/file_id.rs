//! Codec for the opaque file-id strings the backend embeds in messages.
//!
//! A file-id is URL-safe base64 (unpadded) over an RLE-compressed binary
//! payload: a type word with feature flags, the owning DC, an optional file
//! reference in TL `bytes` form, the media/access-hash pair, kind-specific
//! location fields, and a trailing format-version byte. Decoding yields a
//! [`FileHandle`], which is everything `GetFile` needs to locate the object.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;

use crate::proto::{DcId, FileLocation, Peer};

const FILE_ID_VERSION: u8 = 4;

const WEB_LOCATION_FLAG: u32 = 1 << 24;
const FILE_REFERENCE_FLAG: u32 = 1 << 25;
pub(crate) const TYPE_MASK: u32 = WEB_LOCATION_FLAG - 1;

// Raw media-type discriminants carried in the type word.
pub(crate) const TYPE_CHAT_PHOTO: u32 = 1;
pub(crate) const TYPE_PHOTO: u32 = 2;
pub(crate) const TYPE_VOICE: u32 = 3;
pub(crate) const TYPE_VIDEO: u32 = 4;
pub(crate) const TYPE_DOCUMENT: u32 = 5;
pub(crate) const TYPE_STICKER: u32 = 8;
pub(crate) const TYPE_AUDIO: u32 = 9;
pub(crate) const TYPE_ANIMATION: u32 = 10;
pub(crate) const TYPE_VIDEO_NOTE: u32 = 13;

/// Location family a handle belongs to, derived from the raw media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Documents, video, audio, voice, stickers, animations.
    Document,
    /// Standalone photos.
    Photo,
    /// Profile photos of users, chats and channels.
    ChatPhoto,
}

/// Decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileIdError {
    #[error("file id is not valid base64")]
    InvalidBase64,
    #[error("file id payload truncated")]
    Truncated,
    #[error("unsupported file id version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown media type {0}")]
    UnknownMediaType(u32),
    #[error("web locations are not streamable")]
    WebLocation,
}

/// Decoded descriptor of one media object.
///
/// Immutable for the lifetime of its `file_reference`; when the backend
/// reports the reference expired, the handle is discarded and re-derived
/// from the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub kind: FileKind,
    pub raw_type: u32,
    pub dc_id: DcId,
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Bytes,
    /// Photo size discriminator; empty for the full-size object.
    pub thumb_size: String,
    pub volume_id: Option<i64>,
    pub local_id: Option<i32>,
    /// Chat-photo peer fields.
    pub chat_id: Option<i64>,
    pub chat_access_hash: Option<i64>,
    pub big_photo: bool,
    /// Stable identity of the object, independent of the file reference.
    pub unique_id: String,
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} media_id={} on {}",
            self.kind, self.media_id, self.dc_id
        )
    }
}

impl FileHandle {
    /// Builds the `GetFile` location for this handle.
    ///
    /// Chat photos need a peer discriminant: positive ids are users, zero
    /// access hashes are basic groups, everything else is a channel whose id
    /// is recovered from the `-100…` form.
    pub fn location(&self) -> FileLocation {
        match self.kind {
            FileKind::Document => FileLocation::Document {
                id: self.media_id,
                access_hash: self.access_hash,
                file_reference: self.file_reference.clone(),
                thumb_size: self.thumb_size.clone(),
            },
            FileKind::Photo => FileLocation::Photo {
                id: self.media_id,
                access_hash: self.access_hash,
                file_reference: self.file_reference.clone(),
                thumb_size: self.thumb_size.clone(),
            },
            FileKind::ChatPhoto => {
                let chat_id = self.chat_id.unwrap_or_default();
                let chat_access_hash = self.chat_access_hash.unwrap_or_default();
                let peer = if chat_id > 0 {
                    Peer::User {
                        user_id: chat_id,
                        access_hash: chat_access_hash,
                    }
                } else if chat_access_hash == 0 {
                    Peer::Chat { chat_id: -chat_id }
                } else {
                    Peer::Channel {
                        channel_id: channel_id_from_chat(chat_id),
                        access_hash: chat_access_hash,
                    }
                };
                FileLocation::PeerPhoto {
                    peer,
                    volume_id: self.volume_id.unwrap_or_default(),
                    local_id: self.local_id.unwrap_or_default(),
                    big: self.big_photo,
                }
            }
        }
    }
}

/// Recovers a bare channel id from its `-100…`-prefixed chat id.
pub fn channel_id_from_chat(chat_id: i64) -> i64 {
    -chat_id - 1_000_000_000_000
}

fn kind_of(raw_type: u32) -> Result<FileKind, FileIdError> {
    match raw_type {
        TYPE_CHAT_PHOTO => Ok(FileKind::ChatPhoto),
        TYPE_PHOTO => Ok(FileKind::Photo),
        TYPE_VOICE | TYPE_VIDEO | TYPE_DOCUMENT | TYPE_STICKER | TYPE_AUDIO | TYPE_ANIMATION
        | TYPE_VIDEO_NOTE => Ok(FileKind::Document),
        other => Err(FileIdError::UnknownMediaType(other)),
    }
}

/// Decodes an opaque file-id string.
pub fn decode(file_id: &str) -> Result<FileHandle, FileIdError> {
    let compressed = URL_SAFE_NO_PAD
        .decode(file_id.trim_end_matches('='))
        .map_err(|_| FileIdError::InvalidBase64)?;
    let payload = rle_decode(&compressed)?;

    let (version, body) = payload.split_last().ok_or(FileIdError::Truncated)?;
    if *version != FILE_ID_VERSION {
        return Err(FileIdError::UnsupportedVersion(*version));
    }

    let mut reader = Reader::new(body);
    let type_word = reader.read_u32()?;
    if type_word & WEB_LOCATION_FLAG != 0 {
        return Err(FileIdError::WebLocation);
    }
    let raw_type = type_word & TYPE_MASK;
    let kind = kind_of(raw_type)?;
    let dc_id = DcId(reader.read_u32()? as i32);

    let file_reference = if type_word & FILE_REFERENCE_FLAG != 0 {
        Bytes::from(reader.read_tl_bytes()?)
    } else {
        Bytes::new()
    };

    let media_id = reader.read_i64()?;
    let access_hash = reader.read_i64()?;

    let mut handle = FileHandle {
        kind,
        raw_type,
        dc_id,
        media_id,
        access_hash,
        file_reference,
        thumb_size: String::new(),
        volume_id: None,
        local_id: None,
        chat_id: None,
        chat_access_hash: None,
        big_photo: false,
        unique_id: unique_id(raw_type, media_id),
    };

    match kind {
        FileKind::Document => {}
        FileKind::Photo => {
            handle.volume_id = Some(reader.read_i64()?);
            handle.local_id = Some(reader.read_i32()?);
            handle.thumb_size =
                String::from_utf8_lossy(&reader.read_tl_bytes()?).into_owned();
        }
        FileKind::ChatPhoto => {
            handle.volume_id = Some(reader.read_i64()?);
            handle.local_id = Some(reader.read_i32()?);
            handle.chat_id = Some(reader.read_i64()?);
            handle.chat_access_hash = Some(reader.read_i64()?);
            handle.big_photo = reader.read_u8()? != 0;
        }
    }

    reader.expect_end()?;
    Ok(handle)
}

/// Encodes a handle back into its opaque string form.
///
/// The inverse of [`decode`]; the emulated cluster uses it to mint file-ids
/// and tests use it to prove round-trips.
pub fn encode(handle: &FileHandle) -> String {
    let mut body = Vec::with_capacity(64);

    let mut type_word = handle.raw_type;
    if !handle.file_reference.is_empty() {
        type_word |= FILE_REFERENCE_FLAG;
    }
    body.extend_from_slice(&type_word.to_le_bytes());
    body.extend_from_slice(&(handle.dc_id.0 as u32).to_le_bytes());
    if !handle.file_reference.is_empty() {
        write_tl_bytes(&mut body, &handle.file_reference);
    }
    body.extend_from_slice(&handle.media_id.to_le_bytes());
    body.extend_from_slice(&handle.access_hash.to_le_bytes());

    match handle.kind {
        FileKind::Document => {}
        FileKind::Photo => {
            body.extend_from_slice(&handle.volume_id.unwrap_or_default().to_le_bytes());
            body.extend_from_slice(&handle.local_id.unwrap_or_default().to_le_bytes());
            write_tl_bytes(&mut body, handle.thumb_size.as_bytes());
        }
        FileKind::ChatPhoto => {
            body.extend_from_slice(&handle.volume_id.unwrap_or_default().to_le_bytes());
            body.extend_from_slice(&handle.local_id.unwrap_or_default().to_le_bytes());
            body.extend_from_slice(&handle.chat_id.unwrap_or_default().to_le_bytes());
            body.extend_from_slice(&handle.chat_access_hash.unwrap_or_default().to_le_bytes());
            body.push(u8::from(handle.big_photo));
        }
    }

    body.push(FILE_ID_VERSION);
    URL_SAFE_NO_PAD.encode(rle_encode(&body))
}

/// Stable object identity: the cleaned type word plus the media id.
fn unique_id(raw_type: u32, media_id: i64) -> String {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&raw_type.to_le_bytes());
    buf.extend_from_slice(&media_id.to_le_bytes());
    URL_SAFE_NO_PAD.encode(buf)
}

// Zero-run compression: a run of `n` zero bytes is stored as `0x00, n`.

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0u8;
    for &b in data {
        if b == 0 {
            if zeros == u8::MAX {
                out.push(0);
                out.push(zeros);
                zeros = 0;
            }
            zeros += 1;
        } else {
            if zeros > 0 {
                out.push(0);
                out.push(zeros);
                zeros = 0;
            }
            out.push(b);
        }
    }
    if zeros > 0 {
        out.push(0);
        out.push(zeros);
    }
    out
}

fn rle_decode(data: &[u8]) -> Result<Vec<u8>, FileIdError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == 0 {
            let &count = iter.next().ok_or(FileIdError::Truncated)?;
            out.resize(out.len() + count as usize, 0);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FileIdError> {
        let end = self.pos.checked_add(n).ok_or(FileIdError::Truncated)?;
        if end > self.data.len() {
            return Err(FileIdError::Truncated);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, FileIdError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, FileIdError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, FileIdError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, FileIdError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// TL `bytes`: short form is a length byte then data, long form is 0xfe
    /// then a 24-bit length; both are padded to a 4-byte boundary.
    fn read_tl_bytes(&mut self) -> Result<Vec<u8>, FileIdError> {
        let first = self.read_u8()?;
        let (len, prefix) = if first == 0xfe {
            let len_bytes = self.take(3)?;
            let len =
                u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], 0]) as usize;
            (len, 4)
        } else {
            (first as usize, 1)
        };
        let data = self.take(len)?.to_vec();
        let pad = (4 - (prefix + len) % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }

    fn expect_end(&self) -> Result<(), FileIdError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(FileIdError::Truncated)
        }
    }
}

fn write_tl_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let prefix = if data.len() < 0xfe {
        out.push(data.len() as u8);
        1
    } else {
        out.push(0xfe);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
        4
    };
    out.extend_from_slice(data);
    let pad = (4 - (prefix + data.len()) % 4) % 4;
    out.extend_from_slice(&[0u8; 3][..pad]);
}
