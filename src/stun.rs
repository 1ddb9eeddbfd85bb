use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use sha1::Sha1;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The fixed magic cookie every RFC 5389 message carries.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354554E;

const IPV4: u8 = 0x01;
const IPV6: u8 = 0x02;

/// STUN methods (low 14 bits of the message type, class bits masked out).
pub mod method {
    pub const BINDING: u16 = 0x001;
    pub const SHARED_SECRET: u16 = 0x002;
    pub const ALLOCATE: u16 = 0x003;
    pub const REFRESH: u16 = 0x004;
    pub const SEND: u16 = 0x006;
    pub const DATA: u16 = 0x007;
    pub const CREATE_PERMISSION: u16 = 0x008;
    pub const CHANNEL_BIND: u16 = 0x009;
}

/// STUN message classes (the two scattered class bits).
pub mod class {
    pub const REQUEST: u16 = 0x000;
    pub const INDICATION: u16 = 0x010;
    pub const RESPONSE: u16 = 0x100;
    pub const ERROR: u16 = 0x110;
}

pub const CLASS_MASK: u16 = 0x0110;
pub const METHOD_MASK: u16 = 0x3EEF;

// Attribute type codes.
const MAPPED_ADDRESS: u16 = 0x0001;
const CHANGE_REQUEST: u16 = 0x0003;
const SOURCE_ADDRESS: u16 = 0x0004;
const CHANGED_ADDRESS: u16 = 0x0005;
const USERNAME: u16 = 0x0006;
const MESSAGE_INTEGRITY: u16 = 0x0008;
const ERROR_CODE: u16 = 0x0009;
const CHANNEL_NUMBER: u16 = 0x000C;
const LIFETIME: u16 = 0x000D;
const XOR_PEER_ADDRESS: u16 = 0x0012;
const DATA: u16 = 0x0013;
const REALM: u16 = 0x0014;
const NONCE: u16 = 0x0015;
const XOR_RELAYED_ADDRESS: u16 = 0x0016;
const REQUESTED_TRANSPORT: u16 = 0x0019;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const RESERVATION_TOKEN: u16 = 0x0022;
const PRIORITY: u16 = 0x0024;
const USE_CANDIDATE: u16 = 0x0025;
const SOFTWARE: u16 = 0x8022;
const FINGERPRINT: u16 = 0x8028;
const ICE_CONTROLLED: u16 = 0x8029;
const ICE_CONTROLLING: u16 = 0x802A;
const OTHER_ADDRESS: u16 = 0x802C;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StunError {
    #[error("truncated STUN packet")]
    Truncated,
    #[error("header body length {declared} does not match packet size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("bad attribute length {len} for attribute {attribute:#06x}")]
    BadAttributeLength { attribute: u16, len: usize },
    #[error("unknown address family {0:#04x}")]
    UnknownAddressFamily(u8),
    #[error("bad message integrity")]
    BadIntegrity,
    #[error("bad fingerprint")]
    BadFingerprint,
}

/// A 12-byte STUN transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The key used to sign an ICE connectivity check: the peer's password, verbatim.
pub fn short_term_key(password: &str) -> Vec<u8> {
    password.as_bytes().to_vec()
}

/// The key used to authenticate against a TURN server: `MD5(username:realm:password)`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    Md5::digest(format!("{username}:{realm}:{password}").as_bytes()).to_vec()
}

/// A single STUN message: type, cookie, transaction id and a set of typed attributes.
///
/// At most one instance of each attribute can be present. MESSAGE-INTEGRITY and
/// FINGERPRINT are computed on [`StunMessage::encode`] and verified on
/// [`StunMessage::decode`]; they are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StunMessage {
    message_type: u16,
    cookie: u32,
    transaction_id: TransactionId,

    mapped_address: Option<SocketAddr>,
    change_request: Option<u32>,
    source_address: Option<SocketAddr>,
    changed_address: Option<SocketAddr>,
    other_address: Option<SocketAddr>,
    xor_mapped_address: Option<SocketAddr>,
    xor_peer_address: Option<SocketAddr>,
    xor_relayed_address: Option<SocketAddr>,
    error_code: Option<(u16, String)>,
    priority: Option<u32>,
    use_candidate: bool,
    channel_number: Option<u16>,
    data: Option<Vec<u8>>,
    lifetime: Option<u32>,
    nonce: Option<String>,
    realm: Option<String>,
    requested_transport: Option<u8>,
    reservation_token: Option<[u8; 8]>,
    software: Option<String>,
    username: Option<String>,
    ice_controlling: Option<[u8; 8]>,
    ice_controlled: Option<[u8; 8]>,
}

impl StunMessage {
    pub fn new(message_type: u16, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            cookie: MAGIC_COOKIE,
            transaction_id,
            ..Default::default()
        }
    }

    pub fn message_type(&self) -> u16 {
        self.message_type
    }

    pub fn class(&self) -> u16 {
        self.message_type & CLASS_MASK
    }

    pub fn method(&self) -> u16 {
        self.message_type & METHOD_MASK
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn set_transaction_id(&mut self, id: TransactionId) {
        self.transaction_id = id;
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.mapped_address
    }

    pub fn set_mapped_address(&mut self, addr: SocketAddr) {
        self.mapped_address = Some(addr);
    }

    pub fn change_request(&self) -> Option<u32> {
        self.change_request
    }

    pub fn set_change_request(&mut self, flags: u32) {
        self.change_request = Some(flags);
    }

    pub fn source_address(&self) -> Option<SocketAddr> {
        self.source_address
    }

    pub fn set_source_address(&mut self, addr: SocketAddr) {
        self.source_address = Some(addr);
    }

    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.changed_address
    }

    pub fn set_changed_address(&mut self, addr: SocketAddr) {
        self.changed_address = Some(addr);
    }

    pub fn other_address(&self) -> Option<SocketAddr> {
        self.other_address
    }

    pub fn set_other_address(&mut self, addr: SocketAddr) {
        self.other_address = Some(addr);
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.xor_mapped_address
    }

    pub fn set_xor_mapped_address(&mut self, addr: SocketAddr) {
        self.xor_mapped_address = Some(addr);
    }

    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.xor_peer_address
    }

    pub fn set_xor_peer_address(&mut self, addr: SocketAddr) {
        self.xor_peer_address = Some(addr);
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.xor_relayed_address
    }

    pub fn set_xor_relayed_address(&mut self, addr: SocketAddr) {
        self.xor_relayed_address = Some(addr);
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.error_code.as_ref().map(|(c, p)| (*c, p.as_str()))
    }

    pub fn set_error_code(&mut self, code: u16, phrase: impl Into<String>) {
        self.error_code = Some((code, phrase.into()));
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = Some(priority);
    }

    pub fn use_candidate(&self) -> bool {
        self.use_candidate
    }

    pub fn set_use_candidate(&mut self, use_candidate: bool) {
        self.use_candidate = use_candidate;
    }

    pub fn channel_number(&self) -> Option<u16> {
        self.channel_number
    }

    pub fn set_channel_number(&mut self, channel: u16) {
        self.channel_number = Some(channel);
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
    }

    pub fn lifetime(&self) -> Option<u32> {
        self.lifetime
    }

    pub fn set_lifetime(&mut self, lifetime: u32) {
        self.lifetime = Some(lifetime);
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn set_nonce(&mut self, nonce: impl Into<String>) {
        self.nonce = Some(nonce.into());
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn set_realm(&mut self, realm: impl Into<String>) {
        self.realm = Some(realm.into());
    }

    pub fn requested_transport(&self) -> Option<u8> {
        self.requested_transport
    }

    pub fn set_requested_transport(&mut self, protocol: u8) {
        self.requested_transport = Some(protocol);
    }

    pub fn reservation_token(&self) -> Option<[u8; 8]> {
        self.reservation_token
    }

    pub fn set_reservation_token(&mut self, token: [u8; 8]) {
        self.reservation_token = Some(token);
    }

    pub fn software(&self) -> Option<&str> {
        self.software.as_deref()
    }

    pub fn set_software(&mut self, software: impl Into<String>) {
        self.software = Some(software.into());
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = Some(username.into());
    }

    pub fn ice_controlling(&self) -> Option<[u8; 8]> {
        self.ice_controlling
    }

    pub fn set_ice_controlling(&mut self, tie_breaker: [u8; 8]) {
        self.ice_controlling = Some(tie_breaker);
    }

    pub fn ice_controlled(&self) -> Option<[u8; 8]> {
        self.ice_controlled
    }

    pub fn set_ice_controlled(&mut self, tie_breaker: [u8; 8]) {
        self.ice_controlled = Some(tie_breaker);
    }

    /// Parses only the 20-byte header.
    ///
    /// Returns the message type, cookie and transaction id without touching any
    /// attribute, or `None` if the buffer cannot be a STUN message at all.
    pub fn peek(buf: &[u8]) -> Option<(u16, u32, TransactionId)> {
        if buf.len() < HEADER_LEN {
            return None;
        }

        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if length != buf.len() - HEADER_LEN {
            return None;
        }

        let mut id = [0u8; 12];
        id.copy_from_slice(&buf[8..HEADER_LEN]);

        Some((message_type, cookie, TransactionId(id)))
    }

    /// Decodes a message, verifying MESSAGE-INTEGRITY against `key` (skipped if
    /// `key` is empty) and FINGERPRINT if present.
    pub fn decode(buf: &[u8], key: &[u8]) -> Result<Self, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::Truncated);
        }

        let mut message = StunMessage {
            message_type: u16::from_be_bytes([buf[0], buf[1]]),
            cookie: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ..Default::default()
        };
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let mut id = [0u8; 12];
        id.copy_from_slice(&buf[8..HEADER_LEN]);
        message.transaction_id = TransactionId(id);

        if length != buf.len() - HEADER_LEN {
            return Err(StunError::LengthMismatch {
                declared: length,
                actual: buf.len() - HEADER_LEN,
            });
        }

        let mut done = 0;
        let mut after_integrity = false;

        while done < length {
            let attrs = &buf[HEADER_LEN + done..];
            if attrs.len() < 4 {
                return Err(StunError::Truncated);
            }

            let a_type = u16::from_be_bytes([attrs[0], attrs[1]]);
            let a_length = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
            let pad_length = (4 - a_length % 4) % 4;

            if attrs.len() < 4 + a_length {
                return Err(StunError::Truncated);
            }
            let value = &attrs[4..4 + a_length];

            // Only FINGERPRINT is allowed after MESSAGE-INTEGRITY.
            if after_integrity && a_type != FINGERPRINT {
                tracing::debug!(
                    attribute = format_args!("{a_type:#06x}"),
                    "Skipping attribute after MESSAGE-INTEGRITY"
                );
                done += 4 + a_length + pad_length;
                continue;
            }

            match a_type {
                MAPPED_ADDRESS => {
                    message.mapped_address = Some(decode_address(a_type, value, None)?);
                }
                CHANGE_REQUEST => {
                    message.change_request = Some(decode_u32(a_type, value)?);
                }
                SOURCE_ADDRESS => {
                    message.source_address = Some(decode_address(a_type, value, None)?);
                }
                CHANGED_ADDRESS => {
                    message.changed_address = Some(decode_address(a_type, value, None)?);
                }
                OTHER_ADDRESS => {
                    message.other_address = Some(decode_address(a_type, value, None)?);
                }
                XOR_MAPPED_ADDRESS => {
                    message.xor_mapped_address =
                        Some(decode_address(a_type, value, Some(&message.transaction_id))?);
                }
                XOR_PEER_ADDRESS => {
                    message.xor_peer_address =
                        Some(decode_address(a_type, value, Some(&message.transaction_id))?);
                }
                XOR_RELAYED_ADDRESS => {
                    message.xor_relayed_address =
                        Some(decode_address(a_type, value, Some(&message.transaction_id))?);
                }
                ERROR_CODE => {
                    if a_length < 4 {
                        return Err(StunError::BadAttributeLength {
                            attribute: a_type,
                            len: a_length,
                        });
                    }
                    let code = value[2] as u16 * 100 + value[3] as u16;
                    let phrase = String::from_utf8_lossy(&value[4..]).into_owned();
                    message.error_code = Some((code, phrase));
                }
                PRIORITY => {
                    message.priority = Some(decode_u32(a_type, value)?);
                }
                USE_CANDIDATE => {
                    if a_length != 0 {
                        return Err(StunError::BadAttributeLength {
                            attribute: a_type,
                            len: a_length,
                        });
                    }
                    message.use_candidate = true;
                }
                CHANNEL_NUMBER => {
                    // Two bytes of channel number, two bytes reserved.
                    if a_length != 4 {
                        return Err(StunError::BadAttributeLength {
                            attribute: a_type,
                            len: a_length,
                        });
                    }
                    message.channel_number = Some(u16::from_be_bytes([value[0], value[1]]));
                }
                DATA => {
                    message.data = Some(value.to_vec());
                }
                LIFETIME => {
                    message.lifetime = Some(decode_u32(a_type, value)?);
                }
                NONCE => {
                    message.nonce = Some(String::from_utf8_lossy(value).into_owned());
                }
                REALM => {
                    message.realm = Some(String::from_utf8_lossy(value).into_owned());
                }
                REQUESTED_TRANSPORT => {
                    // One byte of protocol, three bytes reserved.
                    if a_length != 4 {
                        return Err(StunError::BadAttributeLength {
                            attribute: a_type,
                            len: a_length,
                        });
                    }
                    message.requested_transport = Some(value[0]);
                }
                RESERVATION_TOKEN => {
                    let token: [u8; 8] =
                        value
                            .try_into()
                            .map_err(|_| StunError::BadAttributeLength {
                                attribute: a_type,
                                len: a_length,
                            })?;
                    message.reservation_token = Some(token);
                }
                SOFTWARE => {
                    message.software = Some(String::from_utf8_lossy(value).into_owned());
                }
                USERNAME => {
                    message.username = Some(String::from_utf8_lossy(value).into_owned());
                }
                ICE_CONTROLLING => {
                    let tie_breaker: [u8; 8] =
                        value
                            .try_into()
                            .map_err(|_| StunError::BadAttributeLength {
                                attribute: a_type,
                                len: a_length,
                            })?;
                    message.ice_controlling = Some(tie_breaker);
                }
                ICE_CONTROLLED => {
                    let tie_breaker: [u8; 8] =
                        value
                            .try_into()
                            .map_err(|_| StunError::BadAttributeLength {
                                attribute: a_type,
                                len: a_length,
                            })?;
                    message.ice_controlled = Some(tie_breaker);
                }
                MESSAGE_INTEGRITY => {
                    if a_length != 20 {
                        return Err(StunError::BadAttributeLength {
                            attribute: a_type,
                            len: a_length,
                        });
                    }

                    if !key.is_empty() {
                        // The HMAC covers the message up to this attribute, with the
                        // header's body length rewritten to include the attribute.
                        let mut covered = buf[..HEADER_LEN + done].to_vec();
                        set_body_length(&mut covered, (done + 24) as u16);

                        if hmac_sha1(key, &covered) != value {
                            return Err(StunError::BadIntegrity);
                        }
                    }

                    after_integrity = true;
                }
                FINGERPRINT => {
                    let fingerprint = decode_u32(a_type, value)?;

                    let mut covered = buf[..HEADER_LEN + done].to_vec();
                    set_body_length(&mut covered, (done + 8) as u16);

                    if fingerprint != crc32(&covered) ^ FINGERPRINT_XOR {
                        return Err(StunError::BadFingerprint);
                    }

                    // No attributes are allowed after a valid FINGERPRINT.
                    return Ok(message);
                }
                unknown => {
                    tracing::debug!(
                        attribute = format_args!("{unknown:#06x}"),
                        "Skipping unknown attribute"
                    );
                }
            }

            done += 4 + a_length + pad_length;
        }

        Ok(message)
    }

    /// Serializes the message, appending MESSAGE-INTEGRITY keyed with `key`
    /// (skipped if `key` is empty) and, optionally, FINGERPRINT.
    pub fn encode(&self, key: &[u8], with_fingerprint: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&self.cookie.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.0);

        // Payload attributes in ascending type-code order; the specific order
        // only matters for byte-for-byte reproducibility.
        if let Some(addr) = self.mapped_address {
            encode_address(&mut buf, MAPPED_ADDRESS, addr, None);
        }
        if let Some(flags) = self.change_request {
            encode_u32(&mut buf, CHANGE_REQUEST, flags);
        }
        if let Some(addr) = self.source_address {
            encode_address(&mut buf, SOURCE_ADDRESS, addr, None);
        }
        if let Some(addr) = self.changed_address {
            encode_address(&mut buf, CHANGED_ADDRESS, addr, None);
        }
        if let Some(username) = &self.username {
            encode_bytes(&mut buf, USERNAME, username.as_bytes());
        }
        if let Some((code, phrase)) = &self.error_code {
            let phrase = phrase.as_bytes();
            buf.extend_from_slice(&ERROR_CODE.to_be_bytes());
            buf.extend_from_slice(&(4 + phrase.len() as u16).to_be_bytes());
            buf.extend_from_slice(&[0, 0, (code / 100) as u8, (code % 100) as u8]);
            buf.extend_from_slice(phrase);
            pad(&mut buf, phrase.len());
        }
        if let Some(channel) = self.channel_number {
            buf.extend_from_slice(&CHANNEL_NUMBER.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&channel.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
        }
        if let Some(lifetime) = self.lifetime {
            encode_u32(&mut buf, LIFETIME, lifetime);
        }
        if let Some(addr) = self.xor_peer_address {
            encode_address(&mut buf, XOR_PEER_ADDRESS, addr, Some(&self.transaction_id));
        }
        if let Some(data) = &self.data {
            encode_bytes(&mut buf, DATA, data);
        }
        if let Some(realm) = &self.realm {
            encode_bytes(&mut buf, REALM, realm.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            encode_bytes(&mut buf, NONCE, nonce.as_bytes());
        }
        if let Some(addr) = self.xor_relayed_address {
            encode_address(
                &mut buf,
                XOR_RELAYED_ADDRESS,
                addr,
                Some(&self.transaction_id),
            );
        }
        if let Some(protocol) = self.requested_transport {
            buf.extend_from_slice(&REQUESTED_TRANSPORT.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&[protocol, 0, 0, 0]);
        }
        if let Some(addr) = self.xor_mapped_address {
            encode_address(
                &mut buf,
                XOR_MAPPED_ADDRESS,
                addr,
                Some(&self.transaction_id),
            );
        }
        if let Some(token) = self.reservation_token {
            encode_bytes(&mut buf, RESERVATION_TOKEN, &token);
        }
        if let Some(priority) = self.priority {
            encode_u32(&mut buf, PRIORITY, priority);
        }
        if self.use_candidate {
            buf.extend_from_slice(&USE_CANDIDATE.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
        }
        if let Some(software) = &self.software {
            encode_bytes(&mut buf, SOFTWARE, software.as_bytes());
        }
        if let Some(tie_breaker) = self.ice_controlled {
            encode_bytes(&mut buf, ICE_CONTROLLED, &tie_breaker);
        }
        if let Some(tie_breaker) = self.ice_controlling {
            encode_bytes(&mut buf, ICE_CONTROLLING, &tie_breaker);
        }
        if let Some(addr) = self.other_address {
            encode_address(&mut buf, OTHER_ADDRESS, addr, None);
        }

        let body = (buf.len() - HEADER_LEN) as u16;
        set_body_length(&mut buf, body);

        if !key.is_empty() {
            // The body length must cover the 24-byte attribute before hashing.
            let len = (buf.len() - HEADER_LEN + 24) as u16;
            set_body_length(&mut buf, len);
            let mac = hmac_sha1(key, &buf);
            buf.extend_from_slice(&MESSAGE_INTEGRITY.to_be_bytes());
            buf.extend_from_slice(&20u16.to_be_bytes());
            buf.extend_from_slice(&mac);
        }

        if with_fingerprint {
            let len = (buf.len() - HEADER_LEN + 8) as u16;
            set_body_length(&mut buf, len);
            let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
            buf.extend_from_slice(&FINGERPRINT.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&fingerprint.to_be_bytes());
        }

        buf
    }
}

impl fmt::Display for StunMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = match self.method() {
            method::BINDING => "Binding",
            method::SHARED_SECRET => "SharedSecret",
            method::ALLOCATE => "Allocate",
            method::REFRESH => "Refresh",
            method::SEND => "Send",
            method::DATA => "Data",
            method::CREATE_PERMISSION => "CreatePermission",
            method::CHANNEL_BIND => "ChannelBind",
            _ => "Unknown",
        };
        let class = match self.class() {
            class::REQUEST => "Request",
            class::INDICATION => "Indication",
            class::RESPONSE => "Response",
            class::ERROR => "Error",
            _ => "",
        };
        write!(f, "{method} {class} ({:#06x})", self.message_type)?;
        write!(f, "\n id {}", self.transaction_id)?;

        if let Some(channel) = self.channel_number {
            write!(f, "\n * CHANNEL-NUMBER {channel:#06x}")?;
        }
        if let Some((code, phrase)) = &self.error_code {
            write!(f, "\n * ERROR-CODE {code} {phrase}")?;
        }
        if let Some(lifetime) = self.lifetime {
            write!(f, "\n * LIFETIME {lifetime}")?;
        }
        if let Some(nonce) = &self.nonce {
            write!(f, "\n * NONCE {nonce}")?;
        }
        if let Some(realm) = &self.realm {
            write!(f, "\n * REALM {realm}")?;
        }
        if let Some(protocol) = self.requested_transport {
            write!(f, "\n * REQUESTED-TRANSPORT {protocol:#04x}")?;
        }
        if let Some(token) = self.reservation_token {
            write!(f, "\n * RESERVATION-TOKEN {}", hex::encode(token))?;
        }
        if let Some(software) = &self.software {
            write!(f, "\n * SOFTWARE {software}")?;
        }
        if let Some(username) = &self.username {
            write!(f, "\n * USERNAME {username}")?;
        }
        if let Some(addr) = self.mapped_address {
            write!(f, "\n * MAPPED-ADDRESS {addr}")?;
        }
        if let Some(flags) = self.change_request {
            write!(f, "\n * CHANGE-REQUEST {flags}")?;
        }
        if let Some(addr) = self.source_address {
            write!(f, "\n * SOURCE-ADDRESS {addr}")?;
        }
        if let Some(addr) = self.changed_address {
            write!(f, "\n * CHANGED-ADDRESS {addr}")?;
        }
        if let Some(addr) = self.other_address {
            write!(f, "\n * OTHER-ADDRESS {addr}")?;
        }
        if let Some(addr) = self.xor_mapped_address {
            write!(f, "\n * XOR-MAPPED-ADDRESS {addr}")?;
        }
        if let Some(addr) = self.xor_peer_address {
            write!(f, "\n * XOR-PEER-ADDRESS {addr}")?;
        }
        if let Some(addr) = self.xor_relayed_address {
            write!(f, "\n * XOR-RELAYED-ADDRESS {addr}")?;
        }
        if let Some(priority) = self.priority {
            write!(f, "\n * PRIORITY {priority}")?;
        }
        if self.use_candidate {
            write!(f, "\n * USE-CANDIDATE")?;
        }
        if let Some(tie_breaker) = self.ice_controlling {
            write!(f, "\n * ICE-CONTROLLING {}", hex::encode(tie_breaker))?;
        }
        if let Some(tie_breaker) = self.ice_controlled {
            write!(f, "\n * ICE-CONTROLLED {}", hex::encode(tie_breaker))?;
        }

        Ok(())
    }
}

fn set_body_length(buf: &mut [u8], length: u16) {
    buf[2..4].copy_from_slice(&length.to_be_bytes());
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC-SHA1 accepts keys of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn crc32(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data)
}

fn decode_u32(a_type: u16, value: &[u8]) -> Result<u32, StunError> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| StunError::BadAttributeLength {
        attribute: a_type,
        len: value.len(),
    })?;

    Ok(u32::from_be_bytes(bytes))
}

fn decode_address(
    a_type: u16,
    value: &[u8],
    xor_id: Option<&TransactionId>,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::BadAttributeLength {
            attribute: a_type,
            len: value.len(),
        });
    }

    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_id.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        IPV4 => {
            if value.len() != 8 {
                return Err(StunError::BadAttributeLength {
                    attribute: a_type,
                    len: value.len(),
                });
            }
            let mut addr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            if xor_id.is_some() {
                addr ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(addr))
        }
        IPV6 => {
            if value.len() != 20 {
                return Err(StunError::BadAttributeLength {
                    attribute: a_type,
                    len: value.len(),
                });
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(id) = xor_id {
                for (octet, mask) in octets.iter_mut().zip(xor_pad(id)) {
                    *octet ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(StunError::UnknownAddressFamily(other)),
    };

    Ok(SocketAddr::new(ip, port))
}

fn encode_address(buf: &mut Vec<u8>, a_type: u16, addr: SocketAddr, xor_id: Option<&TransactionId>) {
    let mut port = addr.port();
    if xor_id.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    buf.extend_from_slice(&a_type.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut raw = u32::from(ip);
            if xor_id.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            buf.extend_from_slice(&8u16.to_be_bytes());
            buf.extend_from_slice(&[0, IPV4]);
            buf.extend_from_slice(&port.to_be_bytes());
            buf.extend_from_slice(&raw.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            if let Some(id) = xor_id {
                for (octet, mask) in octets.iter_mut().zip(xor_pad(id)) {
                    *octet ^= mask;
                }
            }
            buf.extend_from_slice(&20u16.to_be_bytes());
            buf.extend_from_slice(&[0, IPV6]);
            buf.extend_from_slice(&port.to_be_bytes());
            buf.extend_from_slice(&octets);
        }
    }
}

/// The 16-byte XOR mask for IPv6 addresses: cookie followed by transaction id.
fn xor_pad(id: &TransactionId) -> [u8; 16] {
    let mut pad = [0u8; 16];
    pad[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    pad[4..].copy_from_slice(&id.0);
    pad
}

fn encode_bytes(buf: &mut Vec<u8>, a_type: u16, value: &[u8]) {
    buf.extend_from_slice(&a_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    pad(buf, value.len());
}

fn pad(buf: &mut Vec<u8>, len: usize) {
    for _ in 0..(4 - len % 4) % 4 {
        buf.push(0);
    }
}

fn encode_u32(buf: &mut Vec<u8>, a_type: u16, value: u32) {
    buf.extend_from_slice(&a_type.to_be_bytes());
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&value.to_be_bytes());
}
