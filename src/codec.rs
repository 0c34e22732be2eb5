//! Wire framing: `[varint header_len][varint payload_len][header][payload]`.
//!
//! Header and payload are encoded independently with bincode. The header's
//! `domain` and `payload_tag` select the payload decoder from a [`Registry`]
//! built at startup.

use std::collections::HashMap;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;
use crate::protocol::{self, tag, Payload, DOMAIN_CORE, DOMAIN_LINK};

/// Largest frame either transport carries (the stream length prefix is 16 bits).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("malformed length prefix")]
    MalformedLength,
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    Oversized(usize),
    #[error("unknown domain {0}")]
    UnknownDomain(u32),
    #[error("unknown payload tag {tag} in domain {domain}")]
    UnknownPayloadTag { domain: u32, tag: u32 },
    #[error("malformed header: {0}")]
    MalformedHeader(#[source] bincode::Error),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] bincode::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] bincode::Error),
}

/// Never checked; carried so the header layout leaves room for credentials.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthStub {
    pub username: String,
    pub nonce: String,
    pub hash: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    pub source: [u8; 16],
    pub domain: u32,
    pub payload_tag: u32,
    /// Chosen by the originating instance and kept unchanged across relays.
    pub message_id: u64,
    pub authenticated: bool,
    pub auth: Option<AuthStub>,
}

impl WireHeader {
    pub fn new(source: PeerId, payload: &Payload, message_id: u64) -> Self {
        Self {
            source: *source.as_bytes(),
            domain: payload.domain(),
            payload_tag: payload.payload_tag(),
            message_id,
            authenticated: false,
            auth: None,
        }
    }

    pub fn source_id(&self) -> PeerId {
        PeerId::from_bytes(self.source)
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

fn decode_as<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    options().deserialize(bytes).map_err(FrameError::MalformedPayload)
}

pub type Decoder = fn(&[u8]) -> Result<Payload, FrameError>;

pub struct DomainDescriptor {
    pub name: &'static str,
    decoders: HashMap<u32, Decoder>,
}

/// Decoder lookup table keyed by domain, then payload tag.
#[derive(Default)]
pub struct Registry {
    domains: HashMap<u32, DomainDescriptor>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every payload this crate knows about.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(DOMAIN_LINK, "link", tag::ALIVE, |b| {
            decode_as::<protocol::Alive>(b).map(Payload::Alive)
        });
        registry.register(DOMAIN_CORE, "core", tag::ACTIVITY_STATE, |b| {
            decode_as::<protocol::ActivityState>(b).map(Payload::ActivityState)
        });
        registry.register(DOMAIN_CORE, "core", tag::BREAK_EVENT, |b| {
            decode_as::<protocol::BreakEvent>(b).map(Payload::BreakEvent)
        });
        registry.register(DOMAIN_CORE, "core", tag::OPERATION_MODE, |b| {
            decode_as::<protocol::OperationModeUpdate>(b).map(Payload::OperationMode)
        });
        registry.register(DOMAIN_CORE, "core", tag::USAGE_MODE, |b| {
            decode_as::<protocol::UsageModeUpdate>(b).map(Payload::UsageMode)
        });
        registry.register(DOMAIN_CORE, "core", tag::TIMERS, |b| {
            decode_as::<protocol::Timers>(b).map(Payload::Timers)
        });
        registry.register(DOMAIN_CORE, "core", tag::CONFIGURATION, |b| {
            decode_as::<protocol::Configuration>(b).map(Payload::Configuration)
        });
        registry
    }

    pub fn register(&mut self, domain: u32, name: &'static str, payload_tag: u32, decoder: Decoder) {
        self.domains
            .entry(domain)
            .or_insert_with(|| DomainDescriptor {
                name,
                decoders: HashMap::new(),
            })
            .decoders
            .insert(payload_tag, decoder);
    }

    pub fn domain(&self, domain: u32) -> Option<&DomainDescriptor> {
        self.domains.get(&domain)
    }

    fn decoder(&self, domain: u32, payload_tag: u32) -> Result<Decoder, FrameError> {
        let descriptor = self
            .domains
            .get(&domain)
            .ok_or(FrameError::UnknownDomain(domain))?;
        descriptor
            .decoders
            .get(&payload_tag)
            .copied()
            .ok_or(FrameError::UnknownPayloadTag {
                domain,
                tag: payload_tag,
            })
    }
}

pub struct Codec {
    registry: Registry,
}

impl Codec {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn encode(&self, header: &WireHeader, payload: &Payload) -> Result<Vec<u8>, FrameError> {
        let header_bytes = options().serialize(header).map_err(FrameError::Encode)?;
        let payload_bytes = encode_payload(payload)?;

        let mut frame = Vec::with_capacity(header_bytes.len() + payload_bytes.len() + 6);
        write_varint(&mut frame, header_bytes.len() as u64);
        write_varint(&mut frame, payload_bytes.len() as u64);
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&payload_bytes);

        if frame.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(frame.len()));
        }
        Ok(frame)
    }

    /// Decodes a complete frame. Bytes after the declared payload are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Result<(WireHeader, Payload), FrameError> {
        let mut pos = 0;
        let header_len = read_length(bytes, &mut pos)?;
        let payload_len = read_length(bytes, &mut pos)?;

        let header_end = pos.checked_add(header_len).ok_or(FrameError::Truncated)?;
        let payload_end = header_end
            .checked_add(payload_len)
            .ok_or(FrameError::Truncated)?;
        if payload_end > bytes.len() {
            return Err(FrameError::Truncated);
        }

        let header: WireHeader = options()
            .deserialize(&bytes[pos..header_end])
            .map_err(FrameError::MalformedHeader)?;

        let decoder = self.registry.decoder(header.domain, header.payload_tag)?;
        let payload = decoder(&bytes[header_end..payload_end]).map_err(|e| {
            let domain = self.registry.domain(header.domain).map_or("?", |d| d.name);
            tracing::debug!(domain, tag = header.payload_tag, "payload does not match its tag");
            e
        })?;

        Ok((header, payload))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Registry::standard())
    }
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>, FrameError> {
    let opts = options();
    let encoded = match payload {
        Payload::Alive(m) => opts.serialize(m),
        Payload::ActivityState(m) => opts.serialize(m),
        Payload::BreakEvent(m) => opts.serialize(m),
        Payload::OperationMode(m) => opts.serialize(m),
        Payload::UsageMode(m) => opts.serialize(m),
        Payload::Timers(m) => opts.serialize(m),
        Payload::Configuration(m) => opts.serialize(m),
    };
    encoded.map_err(FrameError::Encode)
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, FrameError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(FrameError::Truncated)?;
        *pos += 1;
        if shift >= 64 {
            return Err(FrameError::MalformedLength);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn read_length(bytes: &[u8], pos: &mut usize) -> Result<usize, FrameError> {
    let len = read_varint(bytes, pos)?;
    usize::try_from(len).map_err(|_| FrameError::MalformedLength)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;
    use rand::Rng;

    fn sample_payloads() -> Vec<Payload> {
        vec![
            Payload::Alive(Alive {
                hostname: "desk-1".into(),
                listen_port: 2773,
            }),
            Payload::ActivityState(ActivityState { active: true }),
            Payload::BreakEvent(BreakEvent {
                break_id: 1,
                break_event: 2,
                break_hint: 0,
            }),
            Payload::OperationMode(OperationModeUpdate { mode: 1 }),
            Payload::UsageMode(UsageModeUpdate { mode: 1 }),
            Payload::Timers(Timers {
                timers: vec![TimerState {
                    break_id: 0,
                    elapsed_secs: 170,
                    idle_secs: 3,
                    limit_secs: 180,
                    taking: false,
                }],
            }),
            Payload::Configuration(Configuration {
                reason: ConfigReason::User,
                changes: vec![Setting {
                    key: "timers/micro_pause/limit".into(),
                    value: "240".into(),
                }],
            }),
        ]
    }

    fn header_for(payload: &Payload) -> WireHeader {
        WireHeader::new(PeerId::random(), payload, rand::random())
    }

    #[test]
    fn every_registered_payload_round_trips() {
        let codec = Codec::default();
        for payload in sample_payloads() {
            let header = header_for(&payload);
            let frame = codec.encode(&header, &payload).expect("encode");
            let (decoded_header, decoded) = codec.decode(&frame).expect("decode");
            assert_eq!(decoded_header, header);
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn any_truncation_is_rejected() {
        let codec = Codec::default();
        for payload in sample_payloads() {
            let frame = codec.encode(&header_for(&payload), &payload).unwrap();
            for cut in 0..frame.len() {
                assert!(
                    codec.decode(&frame[..cut]).is_err(),
                    "truncated frame of {} bytes decoded",
                    cut
                );
            }
        }
    }

    #[test]
    fn unknown_domain_and_tag_are_reported() {
        let codec = Codec::default();
        let payload = Payload::ActivityState(ActivityState { active: false });

        let mut header = header_for(&payload);
        header.domain = 7;
        let frame = codec.encode(&header, &payload).unwrap();
        assert!(matches!(codec.decode(&frame), Err(FrameError::UnknownDomain(7))));

        let mut header = header_for(&payload);
        header.payload_tag = 99;
        let frame = codec.encode(&header, &payload).unwrap();
        assert!(matches!(
            codec.decode(&frame),
            Err(FrameError::UnknownPayloadTag { domain: 1, tag: 99 })
        ));
    }

    #[test]
    fn standard_registry_names_its_domains() {
        let registry = Registry::standard();
        assert_eq!(registry.domain(DOMAIN_LINK).map(|d| d.name), Some("link"));
        assert_eq!(registry.domain(DOMAIN_CORE).map(|d| d.name), Some("core"));
        assert!(registry.domain(7).is_none());
    }

    #[test]
    fn payload_bytes_that_do_not_match_the_tag_are_malformed() {
        let codec = Codec::default();
        let payload = Payload::ActivityState(ActivityState { active: true });
        let mut frame = codec.encode(&header_for(&payload), &payload).unwrap();
        // Single payload byte is the bool; 2 is not a valid encoding.
        let last = frame.len() - 1;
        frame[last] = 2;
        assert!(matches!(codec.decode(&frame), Err(FrameError::MalformedPayload(_))));
    }

    #[test]
    fn garbage_never_panics() {
        let codec = Codec::default();
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let len = rng.gen_range(0..64);
            let junk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let _ = codec.decode(&junk);
        }
        // Overlong varint
        assert!(matches!(
            codec.decode(&[0xff; 12]),
            Err(FrameError::MalformedLength)
        ));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let codec = Codec::default();
        let payload = Payload::Configuration(Configuration {
            reason: ConfigReason::Initial,
            changes: vec![Setting {
                key: "k".into(),
                value: "x".repeat(MAX_FRAME_LEN),
            }],
        });
        assert!(codec.encode(&header_for(&payload), &payload).is_err());
    }

    #[test]
    fn varint_uses_leb128() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);
        let mut pos = 0;
        assert_eq!(read_varint(&buf, &mut pos).unwrap(), 300);
        assert_eq!(pos, 2);
    }
}
