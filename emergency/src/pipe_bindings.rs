use crate::helpers::E_BROKEN_PIPE;
use std::io::{ErrorKind, Read, Write};
use windows::{core::*, Win32::Foundation::*};

pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Upper bound on a single framed message. A request is a handful of paths
/// and names; anything bigger is somebody feeding us garbage.
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024;

pub fn pipe_path(channel: &str) -> String {
    format!("{PIPE_PREFIX}{channel}")
}

fn is_disconnect(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::UnexpectedEof
        || err.kind() == ErrorKind::BrokenPipe
        || err.raw_os_error() == Some(ERROR_BROKEN_PIPE.0 as i32)
        || err.raw_os_error() == Some(ERROR_PIPE_NOT_CONNECTED.0 as i32)
        || err.raw_os_error() == Some(ERROR_NO_DATA.0 as i32)
}

/// Any flavour of "the other end went away" comes out as E_BROKEN_PIPE, so
/// callers can tell a dead peer from an error the peer reported.
fn transport_error(err: std::io::Error) -> Error {
    if is_disconnect(&err) {
        E_BROKEN_PIPE.into()
    } else {
        err.into()
    }
}

/// Frame: little-endian u32 byte count, then that many bytes of UTF-8.
pub fn write_message<W: Write>(pipe: &mut W, payload: &str) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_LEN)
        .ok_or_else(|| Error::from(ERROR_BUFFER_OVERFLOW))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload.as_bytes());
    pipe.write_all(&frame).map_err(transport_error)?;
    Ok(())
}

/// Reads one frame. Returns Ok(None) if the other end hung up cleanly between
/// messages.
pub fn read_message<R: Read>(pipe: &mut R) -> Result<Option<String>> {
    let mut len = [0u8; 4];
    match pipe.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if is_disconnect(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_MESSAGE_LEN {
        return Err(ERROR_BUFFER_OVERFLOW.into());
    }

    let mut payload = vec![0u8; len as usize];
    pipe.read_exact(&mut payload)?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| ERROR_NO_UNICODE_TRANSLATION.to_hresult().into())
}

pub fn write_status<W: Write>(pipe: &mut W, status: HRESULT) -> Result<()> {
    pipe.write_all(&status.0.to_le_bytes())?;
    Ok(())
}

pub fn read_status<R: Read>(pipe: &mut R) -> Result<HRESULT> {
    let mut status = [0u8; 4];
    pipe.read_exact(&mut status).map_err(transport_error)?;
    Ok(HRESULT(i32::from_le_bytes(status)))
}
