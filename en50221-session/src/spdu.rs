//! SPDU encoding and decoding
//!
//! Session Protocol Data Units are the byte-level messages of the session
//! layer (EN 50221 section 8.4): a tag byte, a single-byte short-form length
//! and a tag-dependent body. Multi-byte integers are big-endian.

use en50221_core::{En50221Error, En50221Result, ResourceId};

/// Session number carried on the wire when an open failed
pub const SESSION_NUMBER_NONE: u16 = 0xFFFF;

// SPDU tag values
const TAG_SESSION_NUMBER: u8 = 0x90;
const TAG_OPEN_SESSION_REQUEST: u8 = 0x91;
const TAG_OPEN_SESSION_RESPONSE: u8 = 0x92;
const TAG_CREATE_SESSION: u8 = 0x93;
const TAG_CREATE_SESSION_RESPONSE: u8 = 0x94;
const TAG_CLOSE_SESSION_REQUEST: u8 = 0x95;
const TAG_CLOSE_SESSION_RESPONSE: u8 = 0x96;

/// Status byte carried in open, create and close response SPDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session opened or closed successfully
    Open,
    /// The requested resource does not exist
    CloseNoResource,
    /// The resource exists but cannot be used right now
    CloseResourceUnavailable,
    /// The resource exists only in a lower version than requested
    CloseResourceLowVersion,
    /// The resource exists but is busy
    CloseResourceBusy,
}

impl SessionStatus {
    /// Decode a status byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(SessionStatus::Open),
            0xF0 => Some(SessionStatus::CloseNoResource),
            0xF1 => Some(SessionStatus::CloseResourceUnavailable),
            0xF2 => Some(SessionStatus::CloseResourceLowVersion),
            0xF3 => Some(SessionStatus::CloseResourceBusy),
            _ => None,
        }
    }

    /// Get the wire value of this status
    pub fn to_byte(self) -> u8 {
        match self {
            SessionStatus::Open => 0x00,
            SessionStatus::CloseNoResource => 0xF0,
            SessionStatus::CloseResourceUnavailable => 0xF1,
            SessionStatus::CloseResourceLowVersion => 0xF2,
            SessionStatus::CloseResourceBusy => 0xF3,
        }
    }

    /// Check for the success status
    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Open)
    }
}

/// Session protocol data unit
///
/// One case per wire tag, with typed fields in place of manual bit packing.
/// The data case borrows its payload; the bytes stay owned by whoever read
/// the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spdu<'a> {
    /// Module asks the host to open a session to a resource (0x91)
    OpenSessionRequest { resource_id: ResourceId },
    /// Host answers an open session request (0x92)
    OpenSessionResponse {
        status: SessionStatus,
        resource_id: ResourceId,
        session_number: u16,
    },
    /// Host asks the module to create a session (0x93)
    CreateSession {
        resource_id: ResourceId,
        session_number: u16,
    },
    /// Module answers a create session request (0x94)
    CreateSessionResponse {
        status: SessionStatus,
        resource_id: ResourceId,
        session_number: u16,
    },
    /// Either side asks to close a session (0x95)
    CloseSessionRequest { session_number: u16 },
    /// Either side answers a close session request (0x96)
    CloseSessionResponse {
        status: SessionStatus,
        session_number: u16,
    },
    /// Data for one session; the APDU bytes ride behind the header (0x90)
    SessionNumber {
        session_number: u16,
        payload: &'a [u8],
    },
}

impl<'a> Spdu<'a> {
    /// Get the wire tag of this SPDU
    pub fn tag(&self) -> u8 {
        match self {
            Spdu::SessionNumber { .. } => TAG_SESSION_NUMBER,
            Spdu::OpenSessionRequest { .. } => TAG_OPEN_SESSION_REQUEST,
            Spdu::OpenSessionResponse { .. } => TAG_OPEN_SESSION_RESPONSE,
            Spdu::CreateSession { .. } => TAG_CREATE_SESSION,
            Spdu::CreateSessionResponse { .. } => TAG_CREATE_SESSION_RESPONSE,
            Spdu::CloseSessionRequest { .. } => TAG_CLOSE_SESSION_REQUEST,
            Spdu::CloseSessionResponse { .. } => TAG_CLOSE_SESSION_RESPONSE,
        }
    }

    /// Encode the SPDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(9);
        result.push(self.tag());
        match *self {
            Spdu::OpenSessionRequest { resource_id } => {
                result.push(4);
                result.extend_from_slice(&resource_id.raw().to_be_bytes());
            }
            Spdu::OpenSessionResponse {
                status,
                resource_id,
                session_number,
            } => {
                result.push(7);
                result.push(status.to_byte());
                result.extend_from_slice(&resource_id.raw().to_be_bytes());
                result.extend_from_slice(&session_number.to_be_bytes());
            }
            Spdu::CreateSession {
                resource_id,
                session_number,
            } => {
                result.push(6);
                result.extend_from_slice(&resource_id.raw().to_be_bytes());
                result.extend_from_slice(&session_number.to_be_bytes());
            }
            Spdu::CreateSessionResponse {
                status,
                resource_id,
                session_number,
            } => {
                result.push(7);
                result.push(status.to_byte());
                result.extend_from_slice(&resource_id.raw().to_be_bytes());
                result.extend_from_slice(&session_number.to_be_bytes());
            }
            Spdu::CloseSessionRequest { session_number } => {
                result.push(2);
                result.extend_from_slice(&session_number.to_be_bytes());
            }
            Spdu::CloseSessionResponse {
                status,
                session_number,
            } => {
                result.push(3);
                result.push(status.to_byte());
                result.extend_from_slice(&session_number.to_be_bytes());
            }
            Spdu::SessionNumber {
                session_number,
                payload,
            } => {
                // the length byte covers only the session number; the APDU
                // follows the header in the same transport frame
                result.push(2);
                result.extend_from_slice(&session_number.to_be_bytes());
                result.extend_from_slice(payload);
            }
        }
        result
    }

    /// Decode an SPDU from bytes
    ///
    /// The length byte must match the residual payload exactly; for the data
    /// SPDU it must be 2 and everything after the session number is the
    /// payload. Anything else is malformed.
    pub fn decode(data: &'a [u8]) -> En50221Result<Self> {
        if data.is_empty() {
            return Err(En50221Error::MalformedSpdu("empty SPDU".to_string()));
        }
        if data.len() < 2 {
            return Err(En50221Error::MalformedSpdu(
                "SPDU too short for length byte".to_string(),
            ));
        }

        let tag = data[0];
        let length = data[1] as usize;
        let body = &data[2..];

        match tag {
            TAG_SESSION_NUMBER => {
                if length != 2 || body.len() < 2 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::SessionNumber {
                    session_number: u16::from_be_bytes([body[0], body[1]]),
                    payload: &body[2..],
                })
            }
            TAG_OPEN_SESSION_REQUEST => {
                if length != 4 || body.len() != 4 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::OpenSessionRequest {
                    resource_id: read_resource_id(&body[0..4]),
                })
            }
            TAG_OPEN_SESSION_RESPONSE => {
                if length != 7 || body.len() != 7 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::OpenSessionResponse {
                    status: read_status(body[0])?,
                    resource_id: read_resource_id(&body[1..5]),
                    session_number: u16::from_be_bytes([body[5], body[6]]),
                })
            }
            TAG_CREATE_SESSION => {
                if length != 6 || body.len() != 6 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::CreateSession {
                    resource_id: read_resource_id(&body[0..4]),
                    session_number: u16::from_be_bytes([body[4], body[5]]),
                })
            }
            TAG_CREATE_SESSION_RESPONSE => {
                if length != 7 || body.len() != 7 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::CreateSessionResponse {
                    status: read_status(body[0])?,
                    resource_id: read_resource_id(&body[1..5]),
                    session_number: u16::from_be_bytes([body[5], body[6]]),
                })
            }
            TAG_CLOSE_SESSION_REQUEST => {
                if length != 2 || body.len() != 2 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::CloseSessionRequest {
                    session_number: u16::from_be_bytes([body[0], body[1]]),
                })
            }
            TAG_CLOSE_SESSION_RESPONSE => {
                if length != 3 || body.len() != 3 {
                    return Err(bad_length(tag, length, body.len()));
                }
                Ok(Spdu::CloseSessionResponse {
                    status: read_status(body[0])?,
                    session_number: u16::from_be_bytes([body[1], body[2]]),
                })
            }
            _ => Err(En50221Error::MalformedSpdu(format!(
                "unknown SPDU tag 0x{:02X}",
                tag
            ))),
        }
    }
}

fn read_resource_id(bytes: &[u8]) -> ResourceId {
    ResourceId::from_raw(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_status(byte: u8) -> En50221Result<SessionStatus> {
    SessionStatus::from_byte(byte).ok_or_else(|| {
        En50221Error::MalformedSpdu(format!("unknown session status 0x{:02X}", byte))
    })
}

fn bad_length(tag: u8, length: usize, body_len: usize) -> En50221Error {
    En50221Error::MalformedSpdu(format!(
        "tag 0x{:02X}: length byte {} does not match body of {} bytes",
        tag, length, body_len
    ))
}
