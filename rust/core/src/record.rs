//! Request/response records
//!
//! Typed records are what callers build and inspect. The `Raw*` structs are
//! the `#[repr(C)]` wire layout stored inside a channel segment; both sides of
//! a channel must be built from the same layout version.

use crate::{RecordError, Result};

/// Maximum number of bytes kept from an owner name
pub const OWNER_NAME_CAP: usize = 64;

/// Request kinds understood by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestKind {
    Arithmetic = 1,
    EvenOrOdd = 2,
    IsPrime = 3,
    IsNegative = 4,
    Unregister = 5,
}

impl TryFrom<u32> for RequestKind {
    type Error = RecordError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(RequestKind::Arithmetic),
            2 => Ok(RequestKind::EvenOrOdd),
            3 => Ok(RequestKind::IsPrime),
            4 => Ok(RequestKind::IsNegative),
            5 => Ok(RequestKind::Unregister),
            other => Err(RecordError::InvalidKind(other)),
        }
    }
}

/// Outcome reported in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Unsupported = 1,
    UnknownFailure = 2,
}

impl TryFrom<u32> for Status {
    type Error = RecordError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Status::Success),
            1 => Ok(Status::Unsupported),
            2 => Ok(Status::UnknownFailure),
            other => Err(RecordError::InvalidStatus(other)),
        }
    }
}

/// A client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    /// ASCII operator byte, only meaningful for `Arithmetic`
    pub operator: u8,
    pub n1: i64,
    pub n2: i64,
}

impl Request {
    /// Build an arithmetic request (`+ - * /`)
    pub fn arithmetic(operator: u8, n1: i64, n2: i64) -> Self {
        Self { kind: RequestKind::Arithmetic, operator, n1, n2 }
    }

    pub fn even_or_odd(n: i64) -> Self {
        Self::unary(RequestKind::EvenOrOdd, n)
    }

    pub fn is_prime(n: i64) -> Self {
        Self::unary(RequestKind::IsPrime, n)
    }

    pub fn is_negative(n: i64) -> Self {
        Self::unary(RequestKind::IsNegative, n)
    }

    /// Ask the worker to close the channel
    pub fn unregister() -> Self {
        Self::unary(RequestKind::Unregister, 0)
    }

    fn unary(kind: RequestKind, n1: i64) -> Self {
        Self { kind, operator: 0, n1, n2: 0 }
    }
}

/// A worker response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    /// Only meaningful when `status == Success`
    pub result: i64,
}

impl Response {
    pub fn success(result: i64) -> Self {
        Self { status: Status::Success, result }
    }

    pub fn unsupported() -> Self {
        Self { status: Status::Unsupported, result: 0 }
    }

    pub fn failure() -> Self {
        Self { status: Status::UnknownFailure, result: 0 }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Wire layout of a request (24 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawRequest {
    pub kind: u32,
    pub operator: u8,
    _pad: [u8; 3],
    pub n1: i64,
    pub n2: i64,
}

/// Wire layout of a response (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u32,
    _pad: u32,
    pub result: i64,
}

const _: () = assert!(std::mem::size_of::<RawRequest>() == 24);
const _: () = assert!(std::mem::size_of::<RawResponse>() == 16);

impl RawRequest {
    /// Build a raw record with an arbitrary discriminant, including invalid ones
    pub fn with_kind(kind: u32, operator: u8, n1: i64, n2: i64) -> Self {
        Self { kind, operator, _pad: [0; 3], n1, n2 }
    }
}

impl From<Request> for RawRequest {
    fn from(req: Request) -> Self {
        Self::with_kind(req.kind as u32, req.operator, req.n1, req.n2)
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = RecordError;

    fn try_from(raw: RawRequest) -> Result<Self> {
        Ok(Self {
            kind: RequestKind::try_from(raw.kind)?,
            operator: raw.operator,
            n1: raw.n1,
            n2: raw.n2,
        })
    }
}

impl From<Response> for RawResponse {
    fn from(res: Response) -> Self {
        Self { status: res.status as u32, _pad: 0, result: res.result }
    }
}

impl TryFrom<RawResponse> for Response {
    type Error = RecordError;

    fn try_from(raw: RawResponse) -> Result<Self> {
        Ok(Self { status: Status::try_from(raw.status)?, result: raw.result })
    }
}

/// Fixed-capacity owner name stored inline in a channel segment.
///
/// Longer names are truncated at the last UTF-8 boundary that fits, never
/// written past the buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OwnerName {
    len: u32,
    bytes: [u8; OWNER_NAME_CAP],
}

impl OwnerName {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(OWNER_NAME_CAP);
        while !name.is_char_boundary(end) {
            end -= 1;
        }

        let mut bytes = [0u8; OWNER_NAME_CAP];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self { len: end as u32, bytes }
    }

    pub fn as_str(&self) -> &str {
        let len = (self.len as usize).min(OWNER_NAME_CAP);
        // A corrupt length from a foreign writer degrades to the valid prefix.
        match std::str::from_utf8(&self.bytes[..len]) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&self.bytes[..e.valid_up_to()]).unwrap_or_default(),
        }
    }
}

impl Default for OwnerName {
    fn default() -> Self {
        Self { len: 0, bytes: [0; OWNER_NAME_CAP] }
    }
}

impl std::fmt::Debug for OwnerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OwnerName").field(&self.as_str()).finish()
    }
}

impl std::fmt::Display for OwnerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for OwnerName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for OwnerName {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kind_decoding() {
        assert_eq!(RequestKind::try_from(1).unwrap(), RequestKind::Arithmetic);
        assert_eq!(RequestKind::try_from(5).unwrap(), RequestKind::Unregister);
        assert_eq!(RequestKind::try_from(0), Err(RecordError::InvalidKind(0)));
        assert_eq!(RequestKind::try_from(99), Err(RecordError::InvalidKind(99)));
    }

    #[test]
    fn test_raw_request_keeps_operands() {
        let raw = RawRequest::from(Request::arithmetic(b'/', 10, 3));
        assert_eq!(raw.kind, RequestKind::Arithmetic as u32);
        assert_eq!(raw.operator, b'/');

        let back = Request::try_from(raw).unwrap();
        assert_eq!(back, Request::arithmetic(b'/', 10, 3));
    }

    #[test]
    fn test_raw_request_with_bad_kind_is_rejected() {
        let raw = RawRequest::with_kind(0xdead, b'+', 1, 2);
        assert_eq!(Request::try_from(raw), Err(RecordError::InvalidKind(0xdead)));
    }

    #[test]
    fn test_raw_response_status() {
        let raw = RawResponse::from(Response::unsupported());
        assert_eq!(raw.status, 1);
        assert_eq!(Response::try_from(raw).unwrap().status, Status::Unsupported);

        let bad = RawResponse { status: 9, ..RawResponse::default() };
        assert_eq!(Response::try_from(bad), Err(RecordError::InvalidStatus(9)));
    }

    #[test]
    fn test_owner_name_truncation() {
        let long = "x".repeat(OWNER_NAME_CAP + 10);
        let name = OwnerName::new(&long);
        assert_eq!(name.as_str().len(), OWNER_NAME_CAP);

        // A multi-byte char straddling the cap is dropped, not split.
        let mut tricky = "a".repeat(OWNER_NAME_CAP - 1);
        tricky.push('é');
        let name = OwnerName::new(&tricky);
        assert_eq!(name.as_str(), "a".repeat(OWNER_NAME_CAP - 1));
    }

    #[test]
    fn test_owner_name_short() {
        let name = OwnerName::new("client-7");
        assert_eq!(name.as_str(), "client-7");
        assert_eq!(name, OwnerName::new("client-7"));
        assert_eq!(OwnerName::default().as_str(), "");
    }
}
