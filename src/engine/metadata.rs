// src/engine/metadata.rs
//
// EXIF payload for the user comment: a big-endian TIFF block whose Exif
// sub-IFD carries UserComment (0x9286) with the ASCII character code.

use crate::error::{ImageDeliveryError, Result};
use exif::experimental::Writer;
use exif::{Field, In, Tag, Value};
use std::io::Cursor;

const ASCII_CHARSET: &[u8; 8] = b"ASCII\0\0\0";

/// Longest comment kept, in bytes. The whole EXIF block has to fit one JPEG APP1 segment.
pub const MAX_COMMENT_BYTES: usize = 60 * 1024;

/// Cut `comment` to [`MAX_COMMENT_BYTES`] on a char boundary.
pub(crate) fn truncate_comment(comment: &str) -> &str {
    if comment.len() <= MAX_COMMENT_BYTES {
        return comment;
    }
    let mut end = MAX_COMMENT_BYTES;
    while !comment.is_char_boundary(end) {
        end -= 1;
    }
    &comment[..end]
}

/// Raw TIFF/EXIF payload carrying `comment` as an ASCII UserComment.
pub fn user_comment_exif(comment: &str) -> Result<Vec<u8>> {
    let text = truncate_comment(comment).as_bytes();
    let mut value = Vec::with_capacity(ASCII_CHARSET.len() + text.len());
    value.extend_from_slice(ASCII_CHARSET);
    value.extend_from_slice(text);

    let field = Field {
        tag: Tag::UserComment,
        ifd_num: In::PRIMARY,
        value: Value::Undefined(value, 0),
    };
    let mut writer = Writer::new();
    writer.push_field(&field);

    let mut out = Cursor::new(Vec::new());
    writer
        .write(&mut out, false)
        .map_err(|e| ImageDeliveryError::encode_failed("exif", format!("UserComment: {e}")))?;
    Ok(out.into_inner())
}
