//! Reader frame decoding
//!
//! Frame format: `reader_id,epc,metadata` terminated by a newline.
//! No escaping: a comma inside any field makes the frame malformed.

use crate::domain::error::DecodeError;
use crate::domain::types::ReadEvent;

/// Decode one raw line (with or without its line terminator)
pub fn decode_frame(raw: &[u8]) -> Result<ReadEvent, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotText)?;
    let line = text.trim();

    let fields: Vec<&str> = line.split(',').collect();
    let &[reader_id, epc, metadata] = fields.as_slice() else {
        return Err(DecodeError::FieldCount { found: fields.len() });
    };

    Ok(ReadEvent {
        reader_id: reader_id.to_string(),
        epc: epc.to_string(),
        metadata: metadata.to_string(),
    })
}
