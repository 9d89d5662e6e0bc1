//! Request handlers run by the worker

use crate::{RawRequest, Request, RequestKind, Response};
use tracing::warn;

/// Decode a raw request and dispatch it.
///
/// Unknown discriminants produce `UnknownFailure` instead of being dropped.
pub fn handle(raw: &RawRequest) -> Response {
    match Request::try_from(*raw) {
        Ok(req) => handle_request(&req),
        Err(e) => {
            warn!("Rejecting malformed request: {}", e);
            Response::failure()
        }
    }
}

/// Dispatch a decoded request.
///
/// `Unregister` is acknowledged with a plain success; closing the channel is
/// the worker's job.
pub fn handle_request(req: &Request) -> Response {
    match req.kind {
        RequestKind::Arithmetic => arithmetic(req.operator, req.n1, req.n2),
        RequestKind::EvenOrOdd => even_or_odd(req.n1),
        RequestKind::IsPrime => is_prime(req.n1),
        RequestKind::IsNegative => is_negative(req.n1),
        RequestKind::Unregister => Response::success(0),
    }
}

/// Apply `+ - * /` to the operands. Division by zero, overflow and any other
/// operator are unsupported.
pub fn arithmetic(operator: u8, n1: i64, n2: i64) -> Response {
    let result = match operator {
        b'+' => n1.checked_add(n2),
        b'-' => n1.checked_sub(n2),
        b'*' => n1.checked_mul(n2),
        b'/' => n1.checked_div(n2),
        _ => None,
    };

    result.map_or_else(Response::unsupported, Response::success)
}

/// 1 for odd, 0 for even. Negative odd numbers are odd too.
pub fn even_or_odd(n: i64) -> Response {
    Response::success(n.rem_euclid(2))
}

pub fn is_prime(n: i64) -> Response {
    if n < 0 {
        return Response::failure();
    }
    Response::success(primality(n as u64) as i64)
}

pub fn is_negative(n: i64) -> Response {
    Response::success((n < 0) as i64)
}

/// Trial division over 6k ± 1
pub fn primality(n: u64) -> bool {
    match n {
        0 | 1 => false,
        2 | 3 => true,
        _ if n % 2 == 0 || n % 3 == 0 => false,
        _ => {
            let mut i: u64 = 5;
            while i.saturating_mul(i) <= n {
                if n % i == 0 || n % (i + 2) == 0 {
                    return false;
                }
                i += 6;
            }
            true
        }
    }
}
