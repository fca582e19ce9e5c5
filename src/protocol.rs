//! Wire framing: a fixed 16-byte header (§6) followed by an optional payload.
//!
//! Byte order is big-endian on the wire; `byteorder` handles the conversion
//! to/from host order the same way the pack's protocol crates do (e.g.
//! `valence_protocol`'s `VarInt` codec).

use std::time::Instant;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ServerError};

pub const HEADER_LEN: usize = 16;

/// Client→server and server→client packet type codes (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    None = 0,
    Login = 1,
    Users = 2,
    Invite = 3,
    Revoke = 4,
    Accept = 5,
    Decline = 6,
    Move = 7,
    Resign = 8,
    Ack = 9,
    Nack = 10,
    Invited = 11,
    Revoked = 12,
    Accepted = 13,
    Declined = 14,
    Moved = 15,
    Resigned = 16,
    Ended = 17,
}

impl PacketType {
    fn from_u8(b: u8) -> Result<Self> {
        use PacketType::*;
        Ok(match b {
            0 => None,
            1 => Login,
            2 => Users,
            3 => Invite,
            4 => Revoke,
            5 => Accept,
            6 => Decline,
            7 => Move,
            8 => Resign,
            9 => Ack,
            10 => Nack,
            11 => Invited,
            12 => Revoked,
            13 => Accepted,
            14 => Declined,
            15 => Moved,
            16 => Resigned,
            17 => Ended,
            _ => return Err(ServerError::InvalidPacket),
        })
    }
}

/// Game role carried in the header's `role` field. `None` is the sentinel
/// used where no side is implied (e.g. an OPEN invitation with no game yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    None = 0,
    First = 1,
    Second = 2,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::None => Role::None,
            Role::First => Role::Second,
            Role::Second => Role::First,
        }
    }

    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Role::None,
            1 => Role::First,
            2 => Role::Second,
            _ => return Err(ServerError::InvalidPacket),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub ptype: PacketType,
    pub id: u8,
    pub role: Role,
    pub size: u16,
    pub ts_sec: u32,
    pub ts_nsec: u32,
}

impl Header {
    /// Build a header with a zeroed timestamp; `send` stamps it before
    /// writing.
    pub fn new(ptype: PacketType, id: u8, role: Role, size: u16) -> Self {
        Self { ptype, id, role, size, ts_sec: 0, ts_nsec: 0 }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut w = &mut buf[..];
        w.write_u8(self.ptype as u8).unwrap();
        w.write_u8(self.id).unwrap();
        w.write_u8(self.role as u8).unwrap();
        w.write_u8(0).unwrap(); // reserved
        w.write_u16::<BigEndian>(self.size).unwrap();
        w.write_u16::<BigEndian>(0).unwrap(); // reserved
        w.write_u32::<BigEndian>(self.ts_sec).unwrap();
        w.write_u32::<BigEndian>(self.ts_nsec).unwrap();
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut r = &buf[..];
        let ptype = PacketType::from_u8(r.read_u8().unwrap())?;
        let id = r.read_u8().unwrap();
        let role = Role::from_u8(r.read_u8().unwrap())?;
        let _reserved = r.read_u8().unwrap();
        let size = r.read_u16::<BigEndian>().unwrap();
        let _reserved = r.read_u16::<BigEndian>().unwrap();
        let ts_sec = r.read_u32::<BigEndian>().unwrap();
        let ts_nsec = r.read_u32::<BigEndian>().unwrap();
        Ok(Self { ptype, id, role, size, ts_sec, ts_nsec })
    }
}

/// Monotonic sender clock (§4.1). `SystemTime` is not guaranteed monotonic,
/// so timestamps are seconds/nanoseconds elapsed since this clock's creation.
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    fn now(&self) -> (u32, u32) {
        let d = self.start.elapsed();
        (d.as_secs() as u32, d.subsec_nanos())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize `header` (timestamp freshly stamped from `clock`) and `payload`,
/// writing header then payload. `payload_size == 0` must agree with
/// `payload` being empty (§4.1).
pub async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mut header: Header,
    payload: &[u8],
    clock: &Clock,
) -> Result<()> {
    if (header.size as usize == 0) != payload.is_empty() {
        return Err(ServerError::InvalidPacket);
    }
    let (sec, nsec) = clock.now();
    header.ts_sec = sec;
    header.ts_nsec = nsec;

    let bytes = header.encode();
    writer
        .write_all(&bytes)
        .await
        .map_err(|_| ServerError::PeerGone)?;
    if !payload.is_empty() {
        writer
            .write_all(payload)
            .await
            .map_err(|_| ServerError::PeerGone)?;
    }
    writer.flush().await.map_err(|_| ServerError::PeerGone)?;
    Ok(())
}

/// Read exactly one header and, if `size > 0`, exactly `size` payload bytes.
/// Any short read (including a clean EOF before a full header) is
/// `DISCONNECTED`.
pub async fn recv<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Header, Option<Vec<u8>>)> {
    let mut buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|_| ServerError::Disconnected)?;
    let header = Header::decode(&buf)?;

    if header.size == 0 {
        return Ok((header, None));
    }

    let mut payload = vec![0u8; header.size as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ServerError::Disconnected)?;
    Ok((header, Some(payload)))
}
