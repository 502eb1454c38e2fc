//! Length-prefixed block framing shared by chunk and segment files.
//!
//! Every stored block is written as a 4-byte big-endian length followed
//! by the raw block encoding. A frame that claims more bytes than the
//! file still holds is a torn trailing write and is reported as such so
//! recovery can truncate at the frame boundary.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Size of the length prefix preceding every frame.
pub const FRAME_HEADER_SIZE: u64 = 4;

/// Outcome of reading one frame at the current file position.
pub enum FrameRead {
    /// A complete frame and its payload.
    Frame(Vec<u8>),
    /// Clean end of file at a frame boundary.
    Eof,
    /// The file ends mid-frame; `offset` is the frame's start.
    Torn { offset: u64 },
}

/// Append one frame and return the offset it was written at.
pub fn append_frame(file: &mut File, payload: &[u8]) -> io::Result<u64> {
    let offset = file.seek(SeekFrom::End(0))?;
    file.write_all(&(payload.len() as u32).to_be_bytes())?;
    file.write_all(payload)?;
    Ok(offset)
}

/// Read the frame starting at `offset`.
pub fn read_frame_at(file: &mut File, offset: u64) -> io::Result<FrameRead> {
    file.seek(SeekFrom::Start(offset))?;
    read_next_frame(file, offset)
}

/// Read the frame at the current position, assumed to be `offset`.
pub fn read_next_frame(file: &mut File, offset: u64) -> io::Result<FrameRead> {
    let mut len_bytes = [0u8; 4];
    match read_exact_or_eof(file, &mut len_bytes)? {
        0 => return Ok(FrameRead::Eof),
        4 => {}
        _ => return Ok(FrameRead::Torn { offset }),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    match read_exact_or_eof(file, &mut payload)? {
        n if n == len => Ok(FrameRead::Frame(payload)),
        _ => Ok(FrameRead::Torn { offset }),
    }
}

/// Read a byte range, e.g. a header slice inside a frame.
pub fn read_range(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}
