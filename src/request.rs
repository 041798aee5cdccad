//! Bodies carried inside `Req`/`Rep` segments: the `QueryReceive` RPC.

use crate::constants::MAX_MISSING_IDS;
use crate::error::{Result, TransportError};

/// The only defined request subtype.
const SUBTYPE_QUERY_RECEIVE: u8 = 0;

const STATUS_UNKNOWN_TYPE: u8 = 0;
const STATUS_NOT_EXIST: u8 = 1;
const STATUS_COMPLETED: u8 = 2;
const STATUS_NOT_COMPLETED: u8 = 3;

/// The `QueryReceive` answer describing a receiver's reassembly state for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReceiveStatus {
    UnknownType,
    NotExist,
    Completed,
    NotCompleted { largest_order_id: u16, missing: Vec<u16> },
}

/// Encodes a `Req` body asking the peer about `trans_id`.
pub fn encode_query_receive_request(request_id: u32, trans_id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    out.extend_from_slice(&request_id.to_be_bytes());
    out.push(SUBTYPE_QUERY_RECEIVE);
    out.extend_from_slice(&trans_id.to_be_bytes());
    out
}

/// Decodes a `Req` body: the echoed request id, and either the `QueryReceive`
/// transaction id or an unknown-subtype error the caller should answer with
/// `UnknownType`.
pub fn decode_request(body: &[u8]) -> Result<(u32, Result<u16, u8>)> {
    if body.len() < 5 {
        return Err(TransportError::SegmentTruncated(body.len()));
    }

    let request_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let subtype = body[4];

    if subtype != SUBTYPE_QUERY_RECEIVE {
        return Ok((request_id, Err(subtype)));
    }

    if body.len() < 7 {
        return Err(TransportError::SegmentTruncated(body.len()));
    }

    let trans_id = u16::from_be_bytes([body[5], body[6]]);
    Ok((request_id, Ok(trans_id)))
}

/// Encodes a `Rep` body answering a `QueryReceive` request, truncating the missing
/// list to `MAX_MISSING_IDS` so the response always fits one segment.
pub fn encode_query_receive_response(request_id: u32, status: &QueryReceiveStatus) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    out.extend_from_slice(&request_id.to_be_bytes());

    match status {
        QueryReceiveStatus::UnknownType => out.push(STATUS_UNKNOWN_TYPE),
        QueryReceiveStatus::NotExist => out.push(STATUS_NOT_EXIST),
        QueryReceiveStatus::Completed => out.push(STATUS_COMPLETED),
        QueryReceiveStatus::NotCompleted { largest_order_id, missing } => {
            out.push(STATUS_NOT_COMPLETED);
            out.extend_from_slice(&largest_order_id.to_be_bytes());
            for id in missing.iter().take(MAX_MISSING_IDS) {
                out.extend_from_slice(&id.to_be_bytes());
            }
        }
    }

    out
}

/// Decodes a `Rep` body for a `QueryReceive` response.
pub fn decode_query_receive_response(body: &[u8]) -> Result<(u32, QueryReceiveStatus)> {
    if body.len() < 5 {
        return Err(TransportError::SegmentTruncated(body.len()));
    }

    let request_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let status_byte = body[4];

    let status = match status_byte {
        STATUS_UNKNOWN_TYPE => QueryReceiveStatus::UnknownType,
        STATUS_NOT_EXIST => QueryReceiveStatus::NotExist,
        STATUS_COMPLETED => QueryReceiveStatus::Completed,
        STATUS_NOT_COMPLETED => {
            if body.len() < 7 {
                return Err(TransportError::SegmentTruncated(body.len()));
            }

            let largest_order_id = u16::from_be_bytes([body[5], body[6]]);
            let rest = &body[7..];
            let missing = rest.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();

            QueryReceiveStatus::NotCompleted { largest_order_id, missing }
        }
        other => return Err(TransportError::UnknownRequestType(other)),
    };

    Ok((request_id, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_receive_request_round_trips() {
        let body = encode_query_receive_request(42, 7);
        let (request_id, subtype) = decode_request(&body).unwrap();
        assert_eq!(request_id, 42);
        assert_eq!(subtype, Ok(7));
    }

    #[test]
    fn unknown_subtype_is_reported_not_rejected() {
        let mut body = encode_query_receive_request(1, 1);
        body[4] = 0xff;
        let (request_id, subtype) = decode_request(&body).unwrap();
        assert_eq!(request_id, 1);
        assert_eq!(subtype, Err(0xff));
    }

    #[test]
    fn not_completed_response_round_trips() {
        let status = QueryReceiveStatus::NotCompleted { largest_order_id: 7, missing: vec![1, 3, 5] };
        let body = encode_query_receive_response(99, &status);
        let (request_id, decoded) = decode_query_receive_response(&body).unwrap();
        assert_eq!(request_id, 99);
        assert_eq!(decoded, status);
    }

    #[test]
    fn missing_list_is_truncated_to_budget() {
        let missing: Vec<u16> = (0..10_000).collect();
        let status = QueryReceiveStatus::NotCompleted { largest_order_id: 10_000, missing };
        let body = encode_query_receive_response(1, &status);

        assert!(body.len() <= crate::constants::BODY_MAX);

        let (_, decoded) = decode_query_receive_response(&body).unwrap();
        match decoded {
            QueryReceiveStatus::NotCompleted { missing, .. } => assert_eq!(missing.len(), MAX_MISSING_IDS),
            _ => panic!("expected NotCompleted"),
        }
    }
}
