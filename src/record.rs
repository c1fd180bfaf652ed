//! FastCGI record codec: the framed wire protocol of FCGI version 1.
//!
//! A `Record` round-trips byte-for-byte through [`Record::read_from_stream`]
//! and [`Record::write_to_stream`] (ignoring padding bytes, which are
//! opaque). Construction is validated through smart constructors rather
//! than public struct literals, so an out-of-discipline `request_id` can't
//! be built by accident.
//!
//! Reference: https://www.mit.edu/~yandros/doc/specs/fcgi-spec.html

use crate::error::FcgiError;
use crate::nvpair::{decode_name_values, encode_name_values, NameValues};
use indexmap::IndexSet;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use std::io::{BufRead, Write};

const VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
const MAX_CONTENT_LEN: usize = 0xFFFF;

/// FastCGI application role, from `BeginRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

/// `EndRequest` protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

#[derive(Debug, Clone, Copy, FromPrimitive)]
#[repr(u8)]
enum RecordTag {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

/// One framed protocol message on the wire. Two records compare equal iff
/// their tag and all payload fields -- including `request_id` and
/// `padding_length` -- are equal; padding bytes themselves are never
/// compared.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    BeginRequest {
        request_id: u16,
        role: Role,
        keep_conn: bool,
        padding_length: u8,
    },
    AbortRequest {
        request_id: u16,
        padding_length: u8,
    },
    EndRequest {
        request_id: u16,
        application_status: u32,
        protocol_status: ProtocolStatus,
        padding_length: u8,
    },
    Params {
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    },
    Stdin {
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    },
    Stdout {
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    },
    Stderr {
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    },
    Data {
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    },
    GetValues {
        names: IndexSet<Vec<u8>>,
        padding_length: u8,
    },
    GetValuesResult {
        pairs: NameValues,
        padding_length: u8,
    },
    UnknownType {
        unknown_type: u8,
        padding_length: u8,
    },
    Custom {
        r#type: u8,
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    },
}

fn require_request_scoped(request_id: u16) -> Result<(), FcgiError> {
    if request_id == 0 {
        Err(FcgiError::ValueOutOfRange(
            "request-scoped record requires a non-zero request_id".into(),
        ))
    } else {
        Ok(())
    }
}

fn require_management(request_id: u16) -> Result<(), FcgiError> {
    if request_id != 0 {
        Err(FcgiError::ValueOutOfRange(
            "management record requires request_id == 0".into(),
        ))
    } else {
        Ok(())
    }
}

fn require_content_fits(content: &[u8]) -> Result<(), FcgiError> {
    if content.len() > MAX_CONTENT_LEN {
        Err(FcgiError::ValueOutOfRange(format!(
            "content length {} exceeds {}",
            content.len(),
            MAX_CONTENT_LEN
        )))
    } else {
        Ok(())
    }
}

impl Record {
    pub fn get_request_id(&self) -> u16 {
        match self {
            Record::BeginRequest { request_id, .. }
            | Record::AbortRequest { request_id, .. }
            | Record::EndRequest { request_id, .. }
            | Record::Params { request_id, .. }
            | Record::Stdin { request_id, .. }
            | Record::Stdout { request_id, .. }
            | Record::Stderr { request_id, .. }
            | Record::Data { request_id, .. }
            | Record::Custom { request_id, .. } => *request_id,
            Record::GetValues { .. }
            | Record::GetValuesResult { .. }
            | Record::UnknownType { .. } => 0,
        }
    }

    pub fn get_padding_length(&self) -> u8 {
        match self {
            Record::BeginRequest { padding_length, .. }
            | Record::AbortRequest { padding_length, .. }
            | Record::EndRequest { padding_length, .. }
            | Record::Params { padding_length, .. }
            | Record::Stdin { padding_length, .. }
            | Record::Stdout { padding_length, .. }
            | Record::Stderr { padding_length, .. }
            | Record::Data { padding_length, .. }
            | Record::GetValues { padding_length, .. }
            | Record::GetValuesResult { padding_length, .. }
            | Record::UnknownType { padding_length, .. }
            | Record::Custom { padding_length, .. } => *padding_length,
        }
    }

    // ---- smart constructors ----

    pub fn begin_request(request_id: u16, role: Role, keep_conn: bool) -> Result<Self, FcgiError> {
        Self::begin_request_padded(request_id, role, keep_conn, 0)
    }

    pub fn begin_request_padded(
        request_id: u16,
        role: Role,
        keep_conn: bool,
        padding_length: u8,
    ) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        Ok(Record::BeginRequest {
            request_id,
            role,
            keep_conn,
            padding_length,
        })
    }

    pub fn abort_request(request_id: u16) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        Ok(Record::AbortRequest {
            request_id,
            padding_length: 0,
        })
    }

    pub fn end_request(
        request_id: u16,
        application_status: u32,
        protocol_status: ProtocolStatus,
    ) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        Ok(Record::EndRequest {
            request_id,
            application_status,
            protocol_status,
            padding_length: 0,
        })
    }

    pub fn params(request_id: u16, content: Vec<u8>) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        require_content_fits(&content)?;
        Ok(Record::Params {
            request_id,
            content,
            padding_length: 0,
        })
    }

    pub fn stdin(request_id: u16, content: Vec<u8>) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        require_content_fits(&content)?;
        Ok(Record::Stdin {
            request_id,
            content,
            padding_length: 0,
        })
    }

    pub fn stdout(request_id: u16, content: Vec<u8>) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        require_content_fits(&content)?;
        Ok(Record::Stdout {
            request_id,
            content,
            padding_length: 0,
        })
    }

    pub fn stderr(request_id: u16, content: Vec<u8>) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        require_content_fits(&content)?;
        Ok(Record::Stderr {
            request_id,
            content,
            padding_length: 0,
        })
    }

    pub fn data(request_id: u16, content: Vec<u8>) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        require_content_fits(&content)?;
        Ok(Record::Data {
            request_id,
            content,
            padding_length: 0,
        })
    }

    pub fn get_values(names: IndexSet<Vec<u8>>) -> Self {
        Record::GetValues {
            names,
            padding_length: 0,
        }
    }

    pub fn get_values_result(pairs: NameValues) -> Self {
        Record::GetValuesResult {
            pairs,
            padding_length: 0,
        }
    }

    pub fn unknown_type(unknown_type: u8) -> Self {
        Record::UnknownType {
            unknown_type,
            padding_length: 0,
        }
    }

    pub fn custom(r#type: u8, request_id: u16, content: Vec<u8>) -> Result<Self, FcgiError> {
        require_request_scoped(request_id)?;
        require_content_fits(&content)?;
        Ok(Record::Custom {
            r#type,
            request_id,
            content,
            padding_length: 0,
        })
    }

    // ---- wire I/O ----

    /// Read one record from a buffered stream. Returns `Ok(None)` on a
    /// clean end-of-stream (zero bytes available when the header read
    /// begins); any EOF after that point is `Err(FcgiError::Truncated)`.
    pub fn read_from_stream<R: BufRead>(r: &mut R) -> Result<Option<Record>, FcgiError> {
        let mut header = [0u8; HEADER_LEN];
        let n = r.read(&mut header[0..1]).map_err(FcgiError::from_io)?;
        if n == 0 {
            return Ok(None);
        }
        r.read_exact(&mut header[1..HEADER_LEN])
            .map_err(map_eof_to_truncated)?;

        let version = header[0];
        if version != VERSION {
            return Err(FcgiError::UnsupportedVersion(version));
        }
        let type_byte = header[1];
        let request_id = u16::from_be_bytes([header[2], header[3]]);
        let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_length = header[6];

        let mut content = vec![0u8; content_length];
        if content_length > 0 {
            r.read_exact(&mut content).map_err(map_eof_to_truncated)?;
        }
        if padding_length > 0 {
            let mut padding = vec![0u8; padding_length as usize];
            r.read_exact(&mut padding).map_err(map_eof_to_truncated)?;
        }

        Self::parse_content(type_byte, request_id, content, padding_length).map(Some)
    }

    fn parse_content(
        type_byte: u8,
        request_id: u16,
        content: Vec<u8>,
        padding_length: u8,
    ) -> Result<Record, FcgiError> {
        match RecordTag::from_u8(type_byte) {
            Some(RecordTag::BeginRequest) => {
                if content.len() != 8 {
                    return Err(FcgiError::MalformedInput(
                        "BeginRequest content must be 8 bytes".into(),
                    ));
                }
                let role_int = u16::from_be_bytes([content[0], content[1]]);
                let role = Role::from_u16(role_int).ok_or_else(|| {
                    FcgiError::MalformedInput(format!("unrecognized role {role_int}"))
                })?;
                let flags = content[2];
                const KEEP_CONN: u8 = 1;
                let keep_conn = flags & KEEP_CONN != 0;
                if flags & !KEEP_CONN != 0 {
                    return Err(FcgiError::MalformedInput(
                        "unrecognized BeginRequest flag bit set".into(),
                    ));
                }
                Record::begin_request_padded(request_id, role, keep_conn, padding_length)
            }
            Some(RecordTag::AbortRequest) => {
                if !content.is_empty() {
                    return Err(FcgiError::MalformedInput(
                        "AbortRequest content must be empty".into(),
                    ));
                }
                require_request_scoped(request_id)?;
                Ok(Record::AbortRequest {
                    request_id,
                    padding_length,
                })
            }
            Some(RecordTag::EndRequest) => {
                if content.len() != 8 {
                    return Err(FcgiError::MalformedInput(
                        "EndRequest content must be 8 bytes".into(),
                    ));
                }
                let application_status =
                    u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
                let status_int = content[4];
                let protocol_status = ProtocolStatus::from_u8(status_int).ok_or_else(|| {
                    FcgiError::MalformedInput(format!(
                        "unrecognized protocol status {status_int}"
                    ))
                })?;
                require_request_scoped(request_id)?;
                Ok(Record::EndRequest {
                    request_id,
                    application_status,
                    protocol_status,
                    padding_length,
                })
            }
            Some(RecordTag::Params) => {
                require_request_scoped(request_id)?;
                Ok(Record::Params {
                    request_id,
                    content,
                    padding_length,
                })
            }
            Some(RecordTag::Stdin) => {
                require_request_scoped(request_id)?;
                Ok(Record::Stdin {
                    request_id,
                    content,
                    padding_length,
                })
            }
            Some(RecordTag::Stdout) => {
                require_request_scoped(request_id)?;
                Ok(Record::Stdout {
                    request_id,
                    content,
                    padding_length,
                })
            }
            Some(RecordTag::Stderr) => {
                require_request_scoped(request_id)?;
                Ok(Record::Stderr {
                    request_id,
                    content,
                    padding_length,
                })
            }
            Some(RecordTag::Data) => {
                require_request_scoped(request_id)?;
                Ok(Record::Data {
                    request_id,
                    content,
                    padding_length,
                })
            }
            Some(RecordTag::GetValues) => {
                require_management(request_id)?;
                let pairs = decode_name_values(&content)?;
                if pairs.values().any(|v| !v.is_empty()) {
                    return Err(FcgiError::MalformedInput(
                        "GetValues must carry only empty values".into(),
                    ));
                }
                let names: IndexSet<Vec<u8>> = pairs.into_keys().collect();
                Ok(Record::GetValues {
                    names,
                    padding_length,
                })
            }
            Some(RecordTag::GetValuesResult) => {
                require_management(request_id)?;
                let pairs = decode_name_values(&content)?;
                Ok(Record::GetValuesResult {
                    pairs,
                    padding_length,
                })
            }
            Some(RecordTag::UnknownType) => {
                require_management(request_id)?;
                if content.len() != 8 {
                    return Err(FcgiError::MalformedInput(
                        "UnknownType content must be 8 bytes".into(),
                    ));
                }
                Ok(Record::UnknownType {
                    unknown_type: content[0],
                    padding_length,
                })
            }
            None => {
                require_request_scoped(request_id)?;
                Ok(Record::Custom {
                    r#type: type_byte,
                    request_id,
                    content,
                    padding_length,
                })
            }
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Record::BeginRequest { .. } => RecordTag::BeginRequest as u8,
            Record::AbortRequest { .. } => RecordTag::AbortRequest as u8,
            Record::EndRequest { .. } => RecordTag::EndRequest as u8,
            Record::Params { .. } => RecordTag::Params as u8,
            Record::Stdin { .. } => RecordTag::Stdin as u8,
            Record::Stdout { .. } => RecordTag::Stdout as u8,
            Record::Stderr { .. } => RecordTag::Stderr as u8,
            Record::Data { .. } => RecordTag::Data as u8,
            Record::GetValues { .. } => RecordTag::GetValues as u8,
            Record::GetValuesResult { .. } => RecordTag::GetValuesResult as u8,
            Record::UnknownType { .. } => RecordTag::UnknownType as u8,
            Record::Custom { r#type, .. } => *r#type,
        }
    }

    fn content_bytes(&self) -> Vec<u8> {
        match self {
            Record::BeginRequest {
                role, keep_conn, ..
            } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&role.to_u16().unwrap().to_be_bytes());
                buf.push(if *keep_conn { 1 } else { 0 });
                buf.extend_from_slice(&[0u8; 5]);
                buf
            }
            Record::AbortRequest { .. } => Vec::new(),
            Record::EndRequest {
                application_status,
                protocol_status,
                ..
            } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&application_status.to_be_bytes());
                buf.push(protocol_status.to_u8().unwrap());
                buf.extend_from_slice(&[0u8; 3]);
                buf
            }
            Record::Params { content, .. }
            | Record::Stdin { content, .. }
            | Record::Stdout { content, .. }
            | Record::Stderr { content, .. }
            | Record::Data { content, .. }
            | Record::Custom { content, .. } => content.clone(),
            Record::GetValues { names, .. } => {
                let mut pairs = NameValues::new();
                for name in names {
                    pairs.insert(name.clone(), Vec::new());
                }
                encode_name_values(&pairs)
            }
            Record::GetValuesResult { pairs, .. } => encode_name_values(pairs),
            Record::UnknownType { unknown_type, .. } => {
                let mut buf = Vec::with_capacity(8);
                buf.push(*unknown_type);
                buf.extend_from_slice(&[0u8; 7]);
                buf
            }
        }
    }

    /// Serialize to exactly `8 + content_length + padding_length` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FcgiError> {
        let content = self.content_bytes();
        require_content_fits(&content)?;
        let request_id = self.get_request_id();
        let padding_length = self.get_padding_length();

        let mut out = Vec::with_capacity(HEADER_LEN + content.len() + padding_length as usize);
        out.push(VERSION);
        out.push(self.type_byte());
        out.extend_from_slice(&request_id.to_be_bytes());
        out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        out.push(padding_length);
        out.push(0); // reserved
        out.extend_from_slice(&content);
        out.extend(std::iter::repeat(0u8).take(padding_length as usize));
        Ok(out)
    }

    pub fn write_to_stream<W: Write>(&self, w: &mut W) -> Result<(), FcgiError> {
        let bytes = self.to_bytes()?;
        w.write_all(&bytes).map_err(FcgiError::from_io)
    }
}

fn map_eof_to_truncated(e: std::io::Error) -> FcgiError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FcgiError::Truncated
    } else {
        FcgiError::from_io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_hex(hex: &str) -> Record {
        let bytes = hex_to_bytes(hex);
        let mut cursor = Cursor::new(bytes);
        Record::read_from_stream(&mut cursor)
            .expect("parse should succeed")
            .expect("should not be EOF")
    }

    fn hex_to_bytes(hex: &str) -> Vec<u8> {
        let cleaned: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
        (0..cleaned.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn seed_scenario_begin_request() {
        let rec = parse_hex("01 01 31DA 0008 00 00  0002 01 0000000000");
        assert_eq!(
            rec,
            Record::begin_request_padded(0x31DA, Role::Authorizer, true, 0).unwrap()
        );
    }

    #[test]
    fn seed_scenario_end_request() {
        let rec = parse_hex("01 03 4438 0008 00 00  1E30DB12 01 000000");
        assert_eq!(
            rec,
            Record::EndRequest {
                request_id: 0x4438,
                application_status: 0x1E30DB12,
                protocol_status: ProtocolStatus::CantMpxConn,
                padding_length: 0,
            }
        );
    }

    #[test]
    fn seed_scenario_get_values() {
        let rec = parse_hex("01 09 0000 0013 00 00  05 80000000 44454C5441 80000004 00 414C4641");
        match rec {
            Record::GetValues { names, padding_length } => {
                assert_eq!(padding_length, 0);
                let expect: IndexSet<Vec<u8>> =
                    [b"DELTA".to_vec(), b"ALFA".to_vec()].into_iter().collect();
                assert_eq!(names, expect);
            }
            other => panic!("expected GetValues, got {other:?}"),
        }
    }

    #[test]
    fn seed_scenario_custom() {
        let rec = parse_hex("01 FE CA04 0005 03 00  F0E31CF2C6  000000");
        assert_eq!(
            rec,
            Record::Custom {
                r#type: 0xFE,
                request_id: 0xCA04,
                content: hex_to_bytes("F0E31CF2C6"),
                padding_length: 3,
            }
        );
    }

    #[test]
    fn seed_scenario_unknown_type_serialize() {
        let rec = Record::unknown_type(0xFF);
        let bytes = rec.to_bytes().unwrap();
        assert_eq!(
            bytes,
            hex_to_bytes("01 0B 0000 0008 00 00  FF 00000000000000")
        );
    }

    #[test]
    fn round_trip_all_variants() {
        let records = vec![
            Record::begin_request(7, Role::Responder, true).unwrap(),
            Record::abort_request(7).unwrap(),
            Record::end_request(7, 42, ProtocolStatus::RequestComplete).unwrap(),
            Record::params(7, b"hello".to_vec()).unwrap(),
            Record::stdin(7, b"".to_vec()).unwrap(),
            Record::stdout(7, b"pong".to_vec()).unwrap(),
            Record::stderr(7, b"oops".to_vec()).unwrap(),
            Record::data(7, b"raw".to_vec()).unwrap(),
            Record::get_values(IndexSet::from([b"FCGI_MAX_CONNS".to_vec()])),
            Record::get_values_result({
                let mut m = NameValues::new();
                m.insert(b"FCGI_MAX_CONNS".to_vec(), b"10".to_vec());
                m
            }),
            Record::unknown_type(200),
            Record::custom(0x50, 7, b"xyz".to_vec()).unwrap(),
        ];
        for rec in records {
            let bytes = rec.to_bytes().unwrap();
            let mut cursor = Cursor::new(bytes.clone());
            let parsed = Record::read_from_stream(&mut cursor).unwrap().unwrap();
            assert_eq!(parsed, rec);
            assert_eq!(
                bytes.len(),
                HEADER_LEN + rec.content_bytes().len() + rec.get_padding_length() as usize
            );
        }
    }

    #[test]
    fn clean_eof_returns_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(Record::read_from_stream(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_header_errors() {
        let mut cursor = Cursor::new(vec![1u8, 2, 3]);
        assert!(matches!(
            Record::read_from_stream(&mut cursor),
            Err(FcgiError::Truncated)
        ));
    }

    #[test]
    fn unsupported_version_errors() {
        let bytes = hex_to_bytes("02 01 0001 0000 00 00");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            Record::read_from_stream(&mut cursor),
            Err(FcgiError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn begin_request_rejects_reserved_flag_bit() {
        let bytes = hex_to_bytes("01 01 0001 0008 00 00  0001 02 0000000000");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            Record::read_from_stream(&mut cursor),
            Err(FcgiError::MalformedInput(_))
        ));
    }

    #[test]
    fn begin_request_rejects_unknown_role() {
        let bytes = hex_to_bytes("01 01 0001 0008 00 00  0099 00 0000000000");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            Record::read_from_stream(&mut cursor),
            Err(FcgiError::MalformedInput(_))
        ));
    }

    #[test]
    fn request_scoped_record_with_zero_id_rejected() {
        assert!(Record::begin_request(0, Role::Responder, false).is_err());
        assert!(Record::abort_request(0).is_err());
        assert!(Record::end_request(0, 0, ProtocolStatus::RequestComplete).is_err());
        assert!(Record::params(0, Vec::new()).is_err());
    }

    #[test]
    fn management_record_parse_rejects_nonzero_id() {
        let bytes = hex_to_bytes("01 09 0001 0000 00 00");
        let mut cursor = Cursor::new(bytes);
        assert!(Record::read_from_stream(&mut cursor).is_err());
    }

    #[test]
    fn content_over_max_rejected_at_construction() {
        let content = vec![0u8; 0x10000];
        assert!(matches!(
            Record::stdout(1, content),
            Err(FcgiError::ValueOutOfRange(_))
        ));
    }
}
