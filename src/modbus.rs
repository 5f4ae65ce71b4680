use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Largest register count a single read is allowed to request.
pub const MAX_SAFE_READ_COUNT: u16 = 123;

const READ_HOLDINGS: u8 = 3;
const WRITE_HOLDING: u8 = 6;
const SERVER_BUSY: u8 = 6;

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

/// Register addresses are 1-based, as they are listed in the controller's documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::GetHoldings { .. } | ResponseKind::SetHolding { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_BUSY)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetHoldings { values: Vec<u16> },
    /// Echo of the written register (0-based on the wire, converted back to 1-based here).
    SetHolding { address: u16, value: u16 },
}

pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (function, address, word) = match req.operation {
            Operation::GetHoldings { address, count } => (READ_HOLDINGS, address, count),
            Operation::SetHolding { address, value } => (WRITE_HOLDING, address, value),
        };
        let Some(wire_address) = address.checked_sub(1) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "register addresses start at 1",
            ));
        };
        dst.extend(req.transaction_id.to_be_bytes());
        // Protocol 0, then 6 bytes of PDU including the unit identifier.
        dst.extend([0, 0, 0, 6, req.device_id, function]);
        dst.extend(wire_address.to_be_bytes());
        dst.extend(word.to_be_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, remainder)) = src.split_first_chunk::<6>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            if proto != 0 {
                // Not aligned to a frame boundary, resynchronize.
                src.advance(1);
                continue;
            }
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            let Some(data) = remainder.get(..length) else {
                return Ok(None);
            };
            let kind = match *data {
                [_, function, code] if function > 0x80 => Some(ResponseKind::ErrorCode(code)),
                [_, READ_HOLDINGS, byte_count, ref values @ ..]
                    if usize::from(byte_count) == values.len() && values.len() % 2 == 0 =>
                {
                    let values =
                        values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect();
                    Some(ResponseKind::GetHoldings { values })
                }
                [_, WRITE_HOLDING, a1, a2, v1, v2] => Some(ResponseKind::SetHolding {
                    address: u16::from_be_bytes([a1, a2]).wrapping_add(1),
                    value: u16::from_be_bytes([v1, v2]),
                }),
                _ => None,
            };
            let device_id = data.first().copied().unwrap_or_default();
            src.advance(6 + length);
            match kind {
                Some(kind) => return Ok(Some(Response { device_id, transaction_id, kind })),
                None => {
                    trace!(message = "skipping a frame we do not understand", transaction_id);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(operation: Operation) -> Vec<u8> {
        let mut dst = BytesMut::new();
        let req = Request { device_id: 1, transaction_id: 0x0102, operation };
        ModbusTCPCodec {}.encode(&req, &mut dst).unwrap();
        dst.to_vec()
    }

    #[test]
    fn encodes_read_request() {
        assert_eq!(
            encode(Operation::GetHoldings { address: 101, count: 3 }),
            [1, 2, 0, 0, 0, 6, 1, 3, 0, 100, 0, 3]
        );
    }

    #[test]
    fn encodes_write_request() {
        assert_eq!(
            encode(Operation::SetHolding { address: 1, value: 0xABCD }),
            [1, 2, 0, 0, 0, 6, 1, 6, 0, 0, 0xAB, 0xCD]
        );
    }

    #[test]
    fn rejects_address_zero() {
        let mut dst = BytesMut::new();
        let operation = Operation::GetHoldings { address: 0, count: 1 };
        let req = Request { device_id: 1, transaction_id: 0, operation };
        assert!(ModbusTCPCodec {}.encode(&req, &mut dst).is_err());
    }

    #[test]
    fn decodes_read_response_in_pieces() {
        let frame = [0, 7, 0, 0, 0, 7, 1, 3, 4, 0, 171, 0xFF, 0xCE];
        let mut src = BytesMut::from(&frame[..8]);
        assert_eq!(ModbusTCPCodec {}.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&frame[8..]);
        let response = ModbusTCPCodec {}.decode(&mut src).unwrap().unwrap();
        assert_eq!(response.transaction_id, 7);
        assert_eq!(response.kind, ResponseKind::GetHoldings { values: vec![171, 65486] });
        assert!(src.is_empty());
    }

    #[test]
    fn decodes_write_echo_and_exceptions() {
        let mut src = BytesMut::from(
            &[
                0, 1, 0, 0, 0, 6, 1, 6, 0, 41, 0, 55, // write echo
                0, 2, 0, 0, 0, 3, 1, 0x83, 6, // server busy
            ][..],
        );
        let echo = ModbusTCPCodec {}.decode(&mut src).unwrap().unwrap();
        assert_eq!(echo.kind, ResponseKind::SetHolding { address: 42, value: 55 });
        let busy = ModbusTCPCodec {}.decode(&mut src).unwrap().unwrap();
        assert!(busy.is_server_busy());
        assert_eq!(busy.transaction_id, 2);
        assert_eq!(ModbusTCPCodec {}.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn resynchronizes_after_garbage() {
        let mut src = BytesMut::from(&[0xFF, 0, 9, 0, 0, 0, 5, 1, 3, 2, 0, 1][..]);
        let response = ModbusTCPCodec {}.decode(&mut src).unwrap().unwrap();
        assert_eq!(response.transaction_id, 9);
        assert_eq!(response.kind, ResponseKind::GetHoldings { values: vec![1] });
    }
}
