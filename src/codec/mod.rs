//! MQTT v3.1.1 packet codec
//!
//! Binary framing of control packets: a buffer-oriented [`Decoder`] /
//! [`Encoder`] pair for connection loops that manage their own read
//! buffer, plus [`read_packet`] / [`write_packet`] for callers that work
//! directly against a [`StreamAdapter`](crate::transport::StreamAdapter).

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError, HandlerError, Packet};
use crate::transport::{receive_exact, StreamAdapter};

/// Maximum remaining length (268,435,455 bytes)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum packet size accepted by a [`Decoder`]
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a variable-length remaining-length integer from the buffer.
/// Returns (value, bytes_consumed). Each byte carries 7 data bits with the
/// high bit as continuation; a fifth continuation byte is malformed.
#[inline]
pub fn read_remaining_length(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a variable-length remaining-length integer. Returns bytes written.
#[inline]
pub fn write_remaining_length(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Read a length-prefixed UTF-8 string. Returns (string, bytes_consumed).
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, total_len) = read_binary(buf)?;
    let s = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;

    // Null characters are forbidden by [MQTT-1.5.3-2]
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }

    Ok((s, total_len))
}

/// Read length-prefixed binary data. Returns (data, bytes_consumed).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::InsufficientData);
    }

    Ok((&buf[2..total_len], total_len))
}

/// Write a length-prefixed UTF-8 string.
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data.
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = data.len();
    if len > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(data);
    Ok(())
}

/// Read one complete packet from a stream adapter.
///
/// Reads the fixed header, the remaining length, then exactly that many
/// bytes. A clean EOF on the first header byte yields `ConnectionClosed`;
/// a truncated packet is malformed.
pub async fn read_packet(stream: &mut dyn StreamAdapter) -> Result<Packet, HandlerError> {
    let mut header = BytesMut::with_capacity(5);

    let first = receive_exact(stream, 1).await?;
    if first.is_empty() {
        return Err(HandlerError::ConnectionClosed);
    }
    header.extend_from_slice(&first);

    // Pull remaining-length bytes one at a time until the continuation
    // bit clears (at most four).
    let remaining = loop {
        let b = receive_exact(stream, 1).await?;
        if b.is_empty() {
            return Err(HandlerError::Malformed(DecodeError::InsufficientData));
        }
        header.extend_from_slice(&b);
        match read_remaining_length(&header[1..]) {
            Ok((len, _)) => break len as usize,
            Err(DecodeError::InsufficientData) => continue,
            Err(e) => return Err(HandlerError::Malformed(e)),
        }
    };

    let body = receive_exact(stream, remaining).await?;
    if body.len() < remaining {
        return Err(HandlerError::Malformed(DecodeError::InsufficientData));
    }
    header.extend_from_slice(&body);

    let mut decoder = Decoder::new();
    match decoder.decode(&header)? {
        Some((packet, _)) => Ok(packet),
        None => Err(HandlerError::Malformed(DecodeError::InsufficientData)),
    }
}

/// Encode one packet and send it over a stream adapter.
pub async fn write_packet(
    stream: &mut dyn StreamAdapter,
    packet: &Packet,
) -> Result<(), HandlerError> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf)?;
    stream.send(&buf).await?;
    Ok(())
}
