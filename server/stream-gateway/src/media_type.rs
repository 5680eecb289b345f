//! MIME inference for stream responses.
//!
//! Players pick demuxers off `Content-Type`, and the backend frequently
//! reports `application/octet-stream` for perfectly identifiable media, so a
//! generic declared type is overridden by an extension guess when possible.

use tgstream_mtproto::MediaMeta;

const GENERIC: &str = "application/octet-stream";

/// The `Content-Type` to serve for this media.
pub fn response_mime(meta: &MediaMeta) -> String {
    match meta.mime_type.as_deref() {
        Some(declared) if declared != GENERIC => declared.to_string(),
        _ => meta
            .file_name
            .as_deref()
            .and_then(guess_by_extension)
            .unwrap_or(GENERIC)
            .to_string(),
    }
}

fn guess_by_extension(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "srt" => "application/x-subrip",
        _ => return None,
    };
    Some(mime)
}

/// Makes a filename safe for a quoted `Content-Disposition` parameter.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' {
                c
            } else if c == ' ' {
                ' '
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim().is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
