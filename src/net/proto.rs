//! Wire protocol message schemas and CBOR encoding.
//!
//! Every frame body is a CBOR map `{v, type, body}` with string keys. Type
//! tags are stable across versions; decoders skip unknown keys so fields can
//! be added without breaking older peers.

use std::collections::BTreeMap;
use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{ChannelId, Limits, ListenAddr, NodeName, NodeSpec, RefFormat, RemoteRef};

pub const PROTOCOL_VERSION_V1: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub message: Message,
}

impl Envelope {
    pub fn v1(message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION_V1,
            message,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Hello(Hello),
    ForwardJoin(ForwardJoin),
    Neighbor(Neighbor),
    NeighborAccepted(NeighborAccepted),
    NeighborRejected(NeighborRejected),
    Shuffle(Shuffle),
    ShuffleReply(ShuffleReply),
    Disconnect(Disconnect),
    Data(Data),
    Forward(Forward),
    DataWithId(DataWithId),
    Ack(Ack),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// Protocol frames go to the membership manager; the rest go to the
    /// dispatcher's receive path.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Message::ForwardJoin(_)
                | Message::Neighbor(_)
                | Message::NeighborAccepted(_)
                | Message::NeighborRejected(_)
                | Message::Shuffle(_)
                | Message::ShuffleReply(_)
                | Message::Disconnect(_)
        )
    }
}

/// First frame on every new peer socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub node: NodeName,
    pub channel: ChannelId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardJoin {
    pub peer: NodeSpec,
    pub ttl: u32,
    pub sender: NodeName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neighbor {
    pub peer: NodeSpec,
    pub high_priority: bool,
    pub sender: NodeName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborAccepted {
    pub sender: NodeSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborRejected {
    pub sender: NodeName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shuffle {
    pub exchange: Vec<NodeSpec>,
    pub ttl: u32,
    pub sender: NodeSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleReply {
    pub exchange: Vec<NodeSpec>,
    pub sender: NodeName,
}

/// Doubles as eviction notice and leave delta: when `peer` equals the
/// receiver's own name the sender is evicting the receiver from its active
/// view; otherwise the receiver should forget `peer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub peer: NodeName,
    pub sender: NodeName,
}

/// Causal-delivery metadata attached to data frames on labelled channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CausalMeta {
    pub label: String,
    pub sender: NodeName,
    pub clock: BTreeMap<NodeName, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    pub channel: ChannelId,
    pub payload: Bytes,
    pub compressed: bool,
    pub padding: u32,
    pub causal: Option<CausalMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forward {
    pub channel: ChannelId,
    pub server_ref: RemoteRef,
    pub payload: Bytes,
    pub compressed: bool,
    pub padding: u32,
    pub causal: Option<CausalMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataWithId {
    pub id: u64,
    pub data: Data,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Hello,
    ForwardJoin,
    Neighbor,
    NeighborAccepted,
    NeighborRejected,
    Shuffle,
    ShuffleReply,
    Disconnect,
    Data,
    Forward,
    DataWithId,
    Ack,
    Ping,
    Pong,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::ForwardJoin => "FORWARD_JOIN",
            MessageType::Neighbor => "NEIGHBOR",
            MessageType::NeighborAccepted => "NEIGHBOR_ACCEPTED",
            MessageType::NeighborRejected => "NEIGHBOR_REJECTED",
            MessageType::Shuffle => "SHUFFLE",
            MessageType::ShuffleReply => "SHUFFLE_REPLY",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::Data => "DATA",
            MessageType::Forward => "FORWARD",
            MessageType::DataWithId => "DATA_WITH_ID",
            MessageType::Ack => "ACK",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HELLO" => Some(MessageType::Hello),
            "FORWARD_JOIN" => Some(MessageType::ForwardJoin),
            "NEIGHBOR" => Some(MessageType::Neighbor),
            "NEIGHBOR_ACCEPTED" => Some(MessageType::NeighborAccepted),
            "NEIGHBOR_REJECTED" => Some(MessageType::NeighborRejected),
            "SHUFFLE" => Some(MessageType::Shuffle),
            "SHUFFLE_REPLY" => Some(MessageType::ShuffleReply),
            "DISCONNECT" => Some(MessageType::Disconnect),
            "DATA" => Some(MessageType::Data),
            "FORWARD" => Some(MessageType::Forward),
            "DATA_WITH_ID" => Some(MessageType::DataWithId),
            "ACK" => Some(MessageType::Ack),
            "PING" => Some(MessageType::Ping),
            "PONG" => Some(MessageType::Pong),
            _ => None,
        }
    }
}

impl Message {
    fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::ForwardJoin(_) => MessageType::ForwardJoin,
            Message::Neighbor(_) => MessageType::Neighbor,
            Message::NeighborAccepted(_) => MessageType::NeighborAccepted,
            Message::NeighborRejected(_) => MessageType::NeighborRejected,
            Message::Shuffle(_) => MessageType::Shuffle,
            Message::ShuffleReply(_) => MessageType::ShuffleReply,
            Message::Disconnect(_) => MessageType::Disconnect,
            Message::Data(_) => MessageType::Data,
            Message::Forward(_) => MessageType::Forward,
            Message::DataWithId(_) => MessageType::DataWithId,
            Message::Ack(_) => MessageType::Ack,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn encode_envelope(
    envelope: &Envelope,
    format: RefFormat,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("body")?;
    encode_message_body(&mut enc, &envelope.message, format)?;
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8], limits: &Limits) -> Result<Envelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => {
                if is_indefinite(&dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION_V1 {
        return Err(ProtoDecodeError::UnsupportedVersion(version));
    }
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    let body_bytes = &bytes[start..end];

    let message = decode_message_body(message_type, body_bytes, limits)?;

    Ok(Envelope { version, message })
}

fn encode_message_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    message: &Message,
    format: RefFormat,
) -> Result<(), ProtoEncodeError> {
    match message {
        Message::Hello(msg) => {
            enc.map(2)?;
            enc.str("node")?;
            enc.str(msg.node.as_str())?;
            enc.str("channel")?;
            enc.str(msg.channel.as_str())?;
        }
        Message::ForwardJoin(msg) => {
            enc.map(3)?;
            enc.str("peer")?;
            encode_node_spec(enc, &msg.peer)?;
            enc.str("ttl")?;
            enc.u32(msg.ttl)?;
            enc.str("sender")?;
            enc.str(msg.sender.as_str())?;
        }
        Message::Neighbor(msg) => {
            enc.map(3)?;
            enc.str("peer")?;
            encode_node_spec(enc, &msg.peer)?;
            enc.str("priority")?;
            enc.str(if msg.high_priority { "high" } else { "low" })?;
            enc.str("sender")?;
            enc.str(msg.sender.as_str())?;
        }
        Message::NeighborAccepted(msg) => {
            enc.map(1)?;
            enc.str("sender")?;
            encode_node_spec(enc, &msg.sender)?;
        }
        Message::NeighborRejected(msg) => {
            enc.map(1)?;
            enc.str("sender")?;
            enc.str(msg.sender.as_str())?;
        }
        Message::Shuffle(msg) => {
            enc.map(3)?;
            enc.str("exchange")?;
            encode_spec_list(enc, &msg.exchange)?;
            enc.str("ttl")?;
            enc.u32(msg.ttl)?;
            enc.str("sender")?;
            encode_node_spec(enc, &msg.sender)?;
        }
        Message::ShuffleReply(msg) => {
            enc.map(2)?;
            enc.str("exchange")?;
            encode_spec_list(enc, &msg.exchange)?;
            enc.str("sender")?;
            enc.str(msg.sender.as_str())?;
        }
        Message::Disconnect(msg) => {
            enc.map(2)?;
            enc.str("peer")?;
            enc.str(msg.peer.as_str())?;
            enc.str("sender")?;
            enc.str(msg.sender.as_str())?;
        }
        Message::Data(msg) => encode_data(enc, msg)?,
        Message::Forward(msg) => {
            let mut len = 4;
            if msg.padding > 0 {
                len += 1;
            }
            if msg.causal.is_some() {
                len += 1;
            }
            enc.map(len)?;
            enc.str("channel")?;
            enc.str(msg.channel.as_str())?;
            enc.str("server_ref")?;
            encode_remote_ref(enc, &msg.server_ref, format)?;
            enc.str("payload")?;
            enc.bytes(&msg.payload)?;
            enc.str("compressed")?;
            enc.bool(msg.compressed)?;
            if msg.padding > 0 {
                enc.str("padding")?;
                enc.bytes(&vec![0u8; msg.padding as usize])?;
            }
            if let Some(causal) = &msg.causal {
                enc.str("causal")?;
                encode_causal_meta(enc, causal)?;
            }
        }
        Message::DataWithId(msg) => {
            enc.map(2)?;
            enc.str("id")?;
            enc.u64(msg.id)?;
            enc.str("data")?;
            encode_data(enc, &msg.data)?;
        }
        Message::Ack(msg) => {
            enc.map(1)?;
            enc.str("id")?;
            enc.u64(msg.id)?;
        }
        Message::Ping(msg) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(msg.nonce)?;
        }
        Message::Pong(msg) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(msg.nonce)?;
        }
    }
    Ok(())
}

fn decode_message_body(
    message_type: MessageType,
    bytes: &[u8],
    limits: &Limits,
) -> Result<Message, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let message = match message_type {
        MessageType::Hello => Message::Hello(decode_hello(&mut dec, limits)?),
        MessageType::ForwardJoin => Message::ForwardJoin(decode_forward_join(&mut dec, limits)?),
        MessageType::Neighbor => Message::Neighbor(decode_neighbor(&mut dec, limits)?),
        MessageType::NeighborAccepted => {
            Message::NeighborAccepted(decode_neighbor_accepted(&mut dec, limits)?)
        }
        MessageType::NeighborRejected => {
            Message::NeighborRejected(decode_neighbor_rejected(&mut dec, limits)?)
        }
        MessageType::Shuffle => Message::Shuffle(decode_shuffle(&mut dec, limits)?),
        MessageType::ShuffleReply => Message::ShuffleReply(decode_shuffle_reply(&mut dec, limits)?),
        MessageType::Disconnect => Message::Disconnect(decode_disconnect(&mut dec, limits)?),
        MessageType::Data => Message::Data(decode_data(&mut dec, limits)?),
        MessageType::Forward => Message::Forward(decode_forward(&mut dec, limits)?),
        MessageType::DataWithId => Message::DataWithId(decode_data_with_id(&mut dec, limits)?),
        MessageType::Ack => Message::Ack(Ack {
            id: decode_single_u64(&mut dec, limits, "id")?,
        }),
        MessageType::Ping => Message::Ping(Ping {
            nonce: decode_single_u64(&mut dec, limits, "nonce")?,
        }),
        MessageType::Pong => Message::Pong(Pong {
            nonce: decode_single_u64(&mut dec, limits, "nonce")?,
        }),
    };

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    Ok(message)
}

fn encode_data(enc: &mut Encoder<&mut Vec<u8>>, msg: &Data) -> Result<(), ProtoEncodeError> {
    let mut len = 3;
    if msg.padding > 0 {
        len += 1;
    }
    if msg.causal.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("channel")?;
    enc.str(msg.channel.as_str())?;
    enc.str("payload")?;
    enc.bytes(&msg.payload)?;
    enc.str("compressed")?;
    enc.bool(msg.compressed)?;
    if msg.padding > 0 {
        enc.str("padding")?;
        enc.bytes(&vec![0u8; msg.padding as usize])?;
    }
    if let Some(causal) = &msg.causal {
        enc.str("causal")?;
        encode_causal_meta(enc, causal)?;
    }
    Ok(())
}

pub(crate) fn encode_node_spec(
    enc: &mut Encoder<&mut Vec<u8>>,
    spec: &NodeSpec,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("name")?;
    enc.str(spec.name.as_str())?;
    enc.str("addrs")?;
    enc.array(spec.listen_addrs.len() as u64)?;
    for addr in &spec.listen_addrs {
        enc.str(&addr.to_string())?;
    }
    enc.str("channels")?;
    enc.array(spec.channels.len() as u64)?;
    for channel in &spec.channels {
        enc.str(channel.as_str())?;
    }
    Ok(())
}

fn encode_spec_list(
    enc: &mut Encoder<&mut Vec<u8>>,
    specs: &[NodeSpec],
) -> Result<(), ProtoEncodeError> {
    enc.array(specs.len() as u64)?;
    for spec in specs {
        encode_node_spec(enc, spec)?;
    }
    Ok(())
}

fn encode_causal_meta(
    enc: &mut Encoder<&mut Vec<u8>>,
    causal: &CausalMeta,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("label")?;
    enc.str(&causal.label)?;
    enc.str("sender")?;
    enc.str(causal.sender.as_str())?;
    enc.str("clock")?;
    enc.map(causal.clock.len() as u64)?;
    for (node, count) in &causal.clock {
        enc.str(node.as_str())?;
        enc.u64(*count)?;
    }
    Ok(())
}

fn encode_remote_ref(
    enc: &mut Encoder<&mut Vec<u8>>,
    server_ref: &RemoteRef,
    format: RefFormat,
) -> Result<(), ProtoEncodeError> {
    match format {
        RefFormat::Uri => {
            enc.str(&server_ref.to_uri())?;
        }
        RefFormat::ImproperList => {
            let (node, kind, target) = server_ref.as_pair();
            match target {
                Some(target) => {
                    enc.array(3)?;
                    enc.str(node.as_str())?;
                    enc.str(kind)?;
                    enc.str(target)?;
                }
                None => {
                    enc.array(2)?;
                    enc.str(node.as_str())?;
                    enc.str(kind)?;
                }
            }
        }
    }
    Ok(())
}

fn decode_hello(dec: &mut Decoder, limits: &Limits) -> Result<Hello, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut node = None;
    let mut channel = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "node" => node = Some(decode_node_name(dec, limits, "node")?),
            "channel" => channel = Some(decode_channel_id(dec, limits, "channel")?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(Hello {
        node: node.ok_or(ProtoDecodeError::MissingField("node"))?,
        channel: channel.ok_or(ProtoDecodeError::MissingField("channel"))?,
    })
}

fn decode_forward_join(dec: &mut Decoder, limits: &Limits) -> Result<ForwardJoin, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut peer = None;
    let mut ttl = None;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "peer" => peer = Some(decode_node_spec(dec, limits)?),
            "ttl" => ttl = Some(decode_u32(dec, "ttl")?),
            "sender" => sender = Some(decode_node_name(dec, limits, "sender")?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(ForwardJoin {
        peer: peer.ok_or(ProtoDecodeError::MissingField("peer"))?,
        ttl: ttl.ok_or(ProtoDecodeError::MissingField("ttl"))?,
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_neighbor(dec: &mut Decoder, limits: &Limits) -> Result<Neighbor, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut peer = None;
    let mut high_priority = None;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "peer" => peer = Some(decode_node_spec(dec, limits)?),
            "priority" => {
                let raw = decode_text(dec, limits)?;
                high_priority = Some(match raw {
                    "high" => true,
                    "low" => false,
                    other => {
                        return Err(ProtoDecodeError::InvalidField {
                            field: "priority",
                            reason: format!("expected high/low, got {other}"),
                        })
                    }
                });
            }
            "sender" => sender = Some(decode_node_name(dec, limits, "sender")?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(Neighbor {
        peer: peer.ok_or(ProtoDecodeError::MissingField("peer"))?,
        high_priority: high_priority.ok_or(ProtoDecodeError::MissingField("priority"))?,
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_neighbor_accepted(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<NeighborAccepted, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "sender" => sender = Some(decode_node_spec(dec, limits)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(NeighborAccepted {
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_neighbor_rejected(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<NeighborRejected, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "sender" => sender = Some(decode_node_name(dec, limits, "sender")?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(NeighborRejected {
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_shuffle(dec: &mut Decoder, limits: &Limits) -> Result<Shuffle, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut exchange = None;
    let mut ttl = None;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "exchange" => exchange = Some(decode_spec_list(dec, limits)?),
            "ttl" => ttl = Some(decode_u32(dec, "ttl")?),
            "sender" => sender = Some(decode_node_spec(dec, limits)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(Shuffle {
        exchange: exchange.ok_or(ProtoDecodeError::MissingField("exchange"))?,
        ttl: ttl.ok_or(ProtoDecodeError::MissingField("ttl"))?,
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_shuffle_reply(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<ShuffleReply, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut exchange = None;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "exchange" => exchange = Some(decode_spec_list(dec, limits)?),
            "sender" => sender = Some(decode_node_name(dec, limits, "sender")?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(ShuffleReply {
        exchange: exchange.ok_or(ProtoDecodeError::MissingField("exchange"))?,
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_disconnect(dec: &mut Decoder, limits: &Limits) -> Result<Disconnect, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut peer = None;
    let mut sender = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "peer" => peer = Some(decode_node_name(dec, limits, "peer")?),
            "sender" => sender = Some(decode_node_name(dec, limits, "sender")?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(Disconnect {
        peer: peer.ok_or(ProtoDecodeError::MissingField("peer"))?,
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
    })
}

fn decode_data(dec: &mut Decoder, limits: &Limits) -> Result<Data, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut channel = None;
    let mut payload = None;
    let mut compressed = None;
    let mut padding = 0u32;
    let mut causal = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "channel" => channel = Some(decode_channel_id(dec, limits, "channel")?),
            "payload" => payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits)?)),
            "compressed" => compressed = Some(dec.bool()?),
            "padding" => padding = decode_bytes(dec, limits)?.len() as u32,
            "causal" => causal = Some(decode_causal_meta(dec, limits)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(Data {
        channel: channel.ok_or(ProtoDecodeError::MissingField("channel"))?,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
        compressed: compressed.ok_or(ProtoDecodeError::MissingField("compressed"))?,
        padding,
        causal,
    })
}

fn decode_forward(dec: &mut Decoder, limits: &Limits) -> Result<Forward, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut channel = None;
    let mut server_ref = None;
    let mut payload = None;
    let mut compressed = None;
    let mut padding = 0u32;
    let mut causal = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "channel" => channel = Some(decode_channel_id(dec, limits, "channel")?),
            "server_ref" => server_ref = Some(decode_remote_ref(dec, limits)?),
            "payload" => payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits)?)),
            "compressed" => compressed = Some(dec.bool()?),
            "padding" => padding = decode_bytes(dec, limits)?.len() as u32,
            "causal" => causal = Some(decode_causal_meta(dec, limits)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(Forward {
        channel: channel.ok_or(ProtoDecodeError::MissingField("channel"))?,
        server_ref: server_ref.ok_or(ProtoDecodeError::MissingField("server_ref"))?,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
        compressed: compressed.ok_or(ProtoDecodeError::MissingField("compressed"))?,
        padding,
        causal,
    })
}

fn decode_data_with_id(dec: &mut Decoder, limits: &Limits) -> Result<DataWithId, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut id = None;
    let mut data = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "id" => id = Some(dec.u64()?),
            "data" => data = Some(decode_data(dec, limits)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(DataWithId {
        id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
        data: data.ok_or(ProtoDecodeError::MissingField("data"))?,
    })
}

fn decode_single_u64(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<u64, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut value = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        if key == field {
            value = Some(dec.u64()?);
        } else {
            skip_unknown(dec)?;
        }
    }

    value.ok_or(ProtoDecodeError::MissingField(field))
}

pub(crate) fn decode_node_spec(dec: &mut Decoder, limits: &Limits) -> Result<NodeSpec, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut name = None;
    let mut addrs = None;
    let mut channels = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "name" => name = Some(decode_node_name(dec, limits, "name")?),
            "addrs" => {
                let len = decode_array_len(dec, limits)?;
                let mut list = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    let raw = decode_text(dec, limits)?;
                    let addr =
                        ListenAddr::parse(raw).map_err(|e| ProtoDecodeError::InvalidField {
                            field: "addrs",
                            reason: e.to_string(),
                        })?;
                    list.push(addr);
                }
                addrs = Some(list);
            }
            "channels" => {
                let len = decode_array_len(dec, limits)?;
                let mut list = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    list.push(decode_channel_id(dec, limits, "channels")?);
                }
                channels = Some(list);
            }
            _ => skip_unknown(dec)?,
        }
    }

    Ok(NodeSpec {
        name: name.ok_or(ProtoDecodeError::MissingField("name"))?,
        listen_addrs: addrs.ok_or(ProtoDecodeError::MissingField("addrs"))?,
        channels: channels.ok_or(ProtoDecodeError::MissingField("channels"))?,
    })
}

fn decode_spec_list(dec: &mut Decoder, limits: &Limits) -> Result<Vec<NodeSpec>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits)?;
    let mut list = Vec::with_capacity(len as usize);
    for _ in 0..len {
        list.push(decode_node_spec(dec, limits)?);
    }
    Ok(list)
}

fn decode_causal_meta(dec: &mut Decoder, limits: &Limits) -> Result<CausalMeta, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut label = None;
    let mut sender = None;
    let mut clock = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "label" => label = Some(decode_text(dec, limits)?.to_string()),
            "sender" => sender = Some(decode_node_name(dec, limits, "sender")?),
            "clock" => {
                let len = decode_map_len(dec, limits)?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let node = decode_node_name(dec, limits, "clock")?;
                    let count = dec.u64()?;
                    map.insert(node, count);
                }
                clock = Some(map);
            }
            _ => skip_unknown(dec)?,
        }
    }

    Ok(CausalMeta {
        label: label.ok_or(ProtoDecodeError::MissingField("label"))?,
        sender: sender.ok_or(ProtoDecodeError::MissingField("sender"))?,
        clock: clock.ok_or(ProtoDecodeError::MissingField("clock"))?,
    })
}

/// Remote refs decode from either wire form; the form in use is fixed by
/// configuration, so a mixed cluster never sees both.
fn decode_remote_ref(dec: &mut Decoder, limits: &Limits) -> Result<RemoteRef, ProtoDecodeError> {
    match dec.datatype()? {
        Type::String => {
            let raw = decode_text(dec, limits)?;
            RemoteRef::parse_uri(raw).map_err(|e| ProtoDecodeError::InvalidField {
                field: "server_ref",
                reason: e.to_string(),
            })
        }
        Type::Array => {
            let len = decode_array_len(dec, limits)?;
            if len != 2 && len != 3 {
                return Err(ProtoDecodeError::InvalidField {
                    field: "server_ref",
                    reason: format!("expected 2 or 3 elements, got {len}"),
                });
            }
            let node = decode_node_name(dec, limits, "server_ref")?;
            let kind = decode_text(dec, limits)?.to_string();
            let target = if len == 3 {
                Some(decode_text(dec, limits)?.to_string())
            } else {
                None
            };
            RemoteRef::from_pair(node, &kind, target.as_deref()).map_err(|e| {
                ProtoDecodeError::InvalidField {
                    field: "server_ref",
                    reason: e.to_string(),
                }
            })
        }
        other => Err(ProtoDecodeError::InvalidField {
            field: "server_ref",
            reason: format!("unexpected type {other:?}"),
        }),
    }
}

fn decode_node_name(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<NodeName, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    NodeName::parse(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn decode_channel_id(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<ChannelId, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    ChannelId::parse(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

pub(crate) fn decode_map_len(dec: &mut Decoder, limits: &Limits) -> Result<u64, ProtoDecodeError> {
    let len = dec.map()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    if len > limits.max_cbor_map_entries {
        return Err(ProtoDecodeError::DecodeLimit("map entries"));
    }
    Ok(len)
}

pub(crate) fn decode_array_len(dec: &mut Decoder, limits: &Limits) -> Result<u64, ProtoDecodeError> {
    let len = dec.array()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    if len > limits.max_cbor_array_entries {
        return Err(ProtoDecodeError::DecodeLimit("array entries"));
    }
    Ok(len)
}

pub(crate) fn decode_text<'b>(dec: &mut Decoder<'b>, limits: &Limits) -> Result<&'b str, ProtoDecodeError> {
    if dec.datatype()? == Type::StringIndef {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let raw = dec.str()?;
    if raw.len() as u64 > limits.max_cbor_text_len {
        return Err(ProtoDecodeError::DecodeLimit("text length"));
    }
    Ok(raw)
}

fn decode_bytes<'b>(dec: &mut Decoder<'b>, limits: &Limits) -> Result<&'b [u8], ProtoDecodeError> {
    if dec.datatype()? == Type::BytesIndef {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let raw = dec.bytes()?;
    if raw.len() as u64 > limits.max_cbor_bytes_len {
        return Err(ProtoDecodeError::DecodeLimit("bytes length"));
    }
    Ok(raw)
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    dec.u32().map_err(|e| ProtoDecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn skip_unknown(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if is_indefinite(dec)? {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

fn is_indefinite(dec: &Decoder) -> Result<bool, ProtoDecodeError> {
    Ok(matches!(
        dec.datatype()?,
        Type::ArrayIndef | Type::MapIndef | Type::BytesIndef | Type::StringIndef
    ))
}
