//! The wire protocol spoken between the server and its trading clients.
//!
//! Every message is a fixed 12-byte header followed by an optional payload.
//! All multi-byte fields are transmitted in network byte order. The header
//! carries the packet type, the payload size, and a monotonic timestamp
//! taken when the packet was built.
//!
//! Encoding to and from network byte order happens here and only here;
//! everything above this module works with host-order values.

use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed packet header on the wire.
pub const HEADER_SIZE: usize = 12;

/// Size of the [`StatusInfo`] payload on the wire.
pub const STATUS_INFO_SIZE: usize = 28;

/// Size of the [`NotifyInfo`] payload on the wire.
pub const NOTIFY_INFO_SIZE: usize = 16;

/// An error at the wire-protocol layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error on peer stream")]
    Io(#[from] std::io::Error),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("packet type {0:?} is not a request")]
    NotARequest(PacketType),
    #[error("malformed {0:?} payload")]
    MalformedPayload(PacketType),
    #[error("payload too large for a single packet")]
    Oversize,
}

/// Enumeration of all packet types. The wire values are stable and known
/// to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    // requests (client -> server)
    Login = 1,
    Status = 2,
    Deposit = 3,
    Withdraw = 4,
    Escrow = 5,
    Release = 6,
    Buy = 7,
    Sell = 8,
    Cancel = 9,
    // replies (server -> client)
    Ack = 10,
    Nack = 11,
    // unsolicited notifications (server -> client)
    Bought = 12,
    Sold = 13,
    Posted = 14,
    Canceled = 15,
    Traded = 16,
}

impl PacketType {
    /// Decode a wire type code.
    pub fn from_wire(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Login,
            2 => Self::Status,
            3 => Self::Deposit,
            4 => Self::Withdraw,
            5 => Self::Escrow,
            6 => Self::Release,
            7 => Self::Buy,
            8 => Self::Sell,
            9 => Self::Cancel,
            10 => Self::Ack,
            11 => Self::Nack,
            12 => Self::Bought,
            13 => Self::Sold,
            14 => Self::Posted,
            15 => Self::Canceled,
            16 => Self::Traded,
            _ => return None,
        })
    }
}

/// A monotonic timestamp, measured from the moment the process first asked
/// for one. Split into seconds and nanoseconds the way it travels on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
        Self {
            sec: elapsed.as_secs() as u32,
            nsec: elapsed.subsec_nanos(),
        }
    }
}

/// The fixed header that begins every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    /// Payload size in bytes; zero when there is no payload.
    pub size: u16,
    pub timestamp: Timestamp,
}

impl PacketHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0] = self.packet_type as u8;
        // raw[1] is reserved and always zero
        raw[2..4].copy_from_slice(&self.size.to_be_bytes());
        raw[4..8].copy_from_slice(&self.timestamp.sec.to_be_bytes());
        raw[8..12].copy_from_slice(&self.timestamp.nsec.to_be_bytes());
        raw
    }

    fn from_bytes(raw: [u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let packet_type =
            PacketType::from_wire(raw[0]).ok_or(ProtocolError::UnknownType(raw[0]))?;
        Ok(Self {
            packet_type,
            size: u16::from_be_bytes([raw[2], raw[3]]),
            timestamp: Timestamp {
                sec: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
                nsec: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            },
        })
    }
}

/// Payload of an ACK packet: a consistent snapshot of the trader's account
/// together with the market summary. Which fields are populated depends on
/// the request being acknowledged; unused fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInfo {
    pub order_id: u32,
    pub quantity: u32,
    pub balance: u32,
    pub inventory: u32,
    /// Price of the most recent trade, or zero if nothing has traded yet.
    pub last: u32,
    /// Highest resting buy price, or zero if there are no buy orders.
    pub bid: u32,
    /// Lowest resting sell price, or zero if there are no sell orders.
    pub ask: u32,
}

impl StatusInfo {
    pub fn to_bytes(self) -> [u8; STATUS_INFO_SIZE] {
        let mut raw = [0u8; STATUS_INFO_SIZE];
        for (slot, field) in [
            self.order_id,
            self.quantity,
            self.balance,
            self.inventory,
            self.last,
            self.bid,
            self.ask,
        ]
        .into_iter()
        .enumerate()
        {
            raw[slot * 4..slot * 4 + 4].copy_from_slice(&field.to_be_bytes());
        }
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; STATUS_INFO_SIZE] = raw.try_into().ok()?;
        let field = |slot: usize| {
            u32::from_be_bytes([raw[slot * 4], raw[slot * 4 + 1], raw[slot * 4 + 2], raw[slot * 4 + 3]])
        };
        Some(Self {
            order_id: field(0),
            quantity: field(1),
            balance: field(2),
            inventory: field(3),
            last: field(4),
            bid: field(5),
            ask: field(6),
        })
    }
}

/// Payload of the BOUGHT, SOLD, POSTED, CANCELED and TRADED notifications.
///
/// A notification about a buy order sets `seller` to zero and vice versa;
/// TRADED sets both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyInfo {
    pub buyer: u32,
    pub seller: u32,
    pub quantity: u32,
    pub price: u32,
}

impl NotifyInfo {
    pub fn to_bytes(self) -> [u8; NOTIFY_INFO_SIZE] {
        let mut raw = [0u8; NOTIFY_INFO_SIZE];
        raw[0..4].copy_from_slice(&self.buyer.to_be_bytes());
        raw[4..8].copy_from_slice(&self.seller.to_be_bytes());
        raw[8..12].copy_from_slice(&self.quantity.to_be_bytes());
        raw[12..16].copy_from_slice(&self.price.to_be_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; NOTIFY_INFO_SIZE] = raw.try_into().ok()?;
        let field = |slot: usize| {
            u32::from_be_bytes([raw[slot * 4], raw[slot * 4 + 1], raw[slot * 4 + 2], raw[slot * 4 + 3]])
        };
        Some(Self {
            buyer: field(0),
            seller: field(1),
            quantity: field(2),
            price: field(3),
        })
    }
}

/// Write one framed packet to a peer stream: header first, then the payload
/// if there is one. Does not retry on failure.
pub async fn send_packet<W>(
    writer: &mut W,
    packet_type: PacketType,
    timestamp: Timestamp,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let size = u16::try_from(payload.len()).map_err(|_| ProtocolError::Oversize)?;
    let header = PacketHeader {
        packet_type,
        size,
        timestamp,
    };
    writer.write_all(&header.to_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one framed packet from a peer stream. Returns the decoded header and
/// the raw payload bytes; an end-of-stream or short read surfaces as
/// [`ProtocolError::Io`].
///
/// An unrecognized type code surfaces as [`ProtocolError::UnknownType`]
/// only after the whole frame has been consumed, so the stream stays in
/// sync and the caller can keep reading.
pub async fn recv_packet<R>(reader: &mut R) -> Result<(PacketHeader, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let size = u16::from_be_bytes([raw[2], raw[3]]);
    let mut payload = vec![0u8; size as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    let header = PacketHeader::from_bytes(raw)?;
    Ok((header, payload))
}

/// A request decoded from an inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login(String),
    Status,
    Deposit(u32),
    Withdraw(u32),
    Escrow(u32),
    Release(u32),
    Buy { quantity: u32, price: u32 },
    Sell { quantity: u32, price: u32 },
    Cancel(u32),
}

fn one_u32(packet_type: PacketType, payload: &[u8]) -> Result<u32, ProtocolError> {
    let raw: [u8; 4] = payload
        .try_into()
        .map_err(|_| ProtocolError::MalformedPayload(packet_type))?;
    Ok(u32::from_be_bytes(raw))
}

fn two_u32(packet_type: PacketType, payload: &[u8]) -> Result<(u32, u32), ProtocolError> {
    let raw: [u8; 8] = payload
        .try_into()
        .map_err(|_| ProtocolError::MalformedPayload(packet_type))?;
    Ok((
        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
    ))
}

impl Request {
    /// Decode a request from a packet type and payload. Wrong-sized payloads,
    /// empty or non-UTF-8 login names, and reply/notification type codes all
    /// fail here; the caller answers such packets with a NACK.
    pub fn decode(packet_type: PacketType, payload: &[u8]) -> Result<Self, ProtocolError> {
        match packet_type {
            PacketType::Login => {
                let name = std::str::from_utf8(payload)
                    .map_err(|_| ProtocolError::MalformedPayload(packet_type))?;
                if name.is_empty() {
                    return Err(ProtocolError::MalformedPayload(packet_type));
                }
                Ok(Self::Login(name.to_owned()))
            }
            PacketType::Status => {
                if !payload.is_empty() {
                    return Err(ProtocolError::MalformedPayload(packet_type));
                }
                Ok(Self::Status)
            }
            PacketType::Deposit => Ok(Self::Deposit(one_u32(packet_type, payload)?)),
            PacketType::Withdraw => Ok(Self::Withdraw(one_u32(packet_type, payload)?)),
            PacketType::Escrow => Ok(Self::Escrow(one_u32(packet_type, payload)?)),
            PacketType::Release => Ok(Self::Release(one_u32(packet_type, payload)?)),
            PacketType::Buy => {
                let (quantity, price) = two_u32(packet_type, payload)?;
                Ok(Self::Buy { quantity, price })
            }
            PacketType::Sell => {
                let (quantity, price) = two_u32(packet_type, payload)?;
                Ok(Self::Sell { quantity, price })
            }
            PacketType::Cancel => Ok(Self::Cancel(one_u32(packet_type, payload)?)),
            other => Err(ProtocolError::NotARequest(other)),
        }
    }
}
