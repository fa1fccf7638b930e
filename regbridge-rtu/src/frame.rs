//! Modbus RTU frame codec.
//!
//! ```text
//! | unit (1) | function (1) | payload (n) | crc16 (2, low byte first) |
//! ```
//!
//! Only the function codes needed to serve a register bank are understood:
//! read holding/input registers and write single/multiple registers.

use thiserror::Error;

/// Broadcast unit address. Never answered.
pub const BROADCAST_ADDRESS: u8 = 0;

/// Maximum size of an RTU frame on the wire.
pub const MAX_FRAME_LEN: usize = 256;

/// Maximum quantity for a register read.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Maximum quantity for a multiple-register write.
pub const MAX_WRITE_QUANTITY: u16 = 123;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const EXCEPTION_FLAG: u8 = 0x80;

/// Reasons a received frame is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("frame too long ({0} bytes)")]
    TooLong(usize),

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Crc { expected: u16, actual: u16 },

    #[error("unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),

    #[error("function {function:#04x}: expected {expected} bytes, got {actual}")]
    Length {
        function: u8,
        expected: usize,
        actual: usize,
    },

    #[error("byte count {byte_count} does not match quantity {quantity}")]
    ByteCount { byte_count: u8, quantity: u16 },
}

/// Decoded request PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { start: u16, quantity: u16 },
    ReadInputRegisters { start: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Request::ReadInputRegisters { .. } => READ_INPUT_REGISTERS,
            Request::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            Request::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::WriteSingleRegister { .. } | Request::WriteMultipleRegisters { .. }
        )
    }
}

/// A request together with the unit it is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub unit: u8,
    pub request: Request,
}

/// Modbus exception codes used in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

/// Reply PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadRegisters { function: u8, values: Vec<u16> },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, quantity: u16 },
    Exception { function: u8, code: ExceptionCode },
}

/// CRC-16/Modbus over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC to a frame body.
fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

fn word(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Check the CRC and split a frame into unit, function and payload.
fn open(frame: &[u8]) -> Result<(u8, u8, &[u8]), FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong(frame.len()));
    }

    let (body, trailer) = frame.split_at(frame.len() - 2);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    let expected = crc16(body);
    if expected != actual {
        return Err(FrameError::Crc { expected, actual });
    }

    Ok((body[0], body[1], &body[2..]))
}

fn expect_len(function: u8, payload: &[u8], expected: usize) -> Result<(), FrameError> {
    if payload.len() != expected {
        return Err(FrameError::Length {
            function,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Decode a complete request frame.
pub fn decode_request(frame: &[u8]) -> Result<RequestFrame, FrameError> {
    let (unit, function, payload) = open(frame)?;

    let request = match function {
        READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
            expect_len(function, payload, 4)?;
            let start = word(payload, 0);
            let quantity = word(payload, 2);
            if function == READ_HOLDING_REGISTERS {
                Request::ReadHoldingRegisters { start, quantity }
            } else {
                Request::ReadInputRegisters { start, quantity }
            }
        }
        WRITE_SINGLE_REGISTER => {
            expect_len(function, payload, 4)?;
            Request::WriteSingleRegister {
                address: word(payload, 0),
                value: word(payload, 2),
            }
        }
        WRITE_MULTIPLE_REGISTERS => {
            if payload.len() < 5 {
                return Err(FrameError::Length {
                    function,
                    expected: 5,
                    actual: payload.len(),
                });
            }
            let start = word(payload, 0);
            let quantity = word(payload, 2);
            let byte_count = payload[4];
            if byte_count as usize != quantity as usize * 2 {
                return Err(FrameError::ByteCount {
                    byte_count,
                    quantity,
                });
            }
            expect_len(function, payload, 5 + byte_count as usize)?;
            let values = payload[5..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Request::WriteMultipleRegisters { start, values }
        }
        other => return Err(FrameError::UnsupportedFunction(other)),
    };

    Ok(RequestFrame { unit, request })
}

/// Encode a request frame, as a master would send it.
pub fn encode_request(unit: u8, request: &Request) -> Vec<u8> {
    let mut body = vec![unit, request.function()];
    match request {
        Request::ReadHoldingRegisters { start, quantity }
        | Request::ReadInputRegisters { start, quantity } => {
            body.extend_from_slice(&start.to_be_bytes());
            body.extend_from_slice(&quantity.to_be_bytes());
        }
        Request::WriteSingleRegister { address, value } => {
            body.extend_from_slice(&address.to_be_bytes());
            body.extend_from_slice(&value.to_be_bytes());
        }
        Request::WriteMultipleRegisters { start, values } => {
            body.extend_from_slice(&start.to_be_bytes());
            body.extend_from_slice(&(values.len() as u16).to_be_bytes());
            body.push((values.len() * 2) as u8);
            for value in values {
                body.extend_from_slice(&value.to_be_bytes());
            }
        }
    }
    seal(body)
}

/// Encode a reply frame.
pub fn encode_response(unit: u8, response: &Response) -> Vec<u8> {
    let body = match response {
        Response::ReadRegisters { function, values } => {
            let mut body = Vec::with_capacity(3 + values.len() * 2);
            body.extend_from_slice(&[unit, *function, (values.len() * 2) as u8]);
            for value in values {
                body.extend_from_slice(&value.to_be_bytes());
            }
            body
        }
        Response::WriteSingleRegister { address, value } => {
            let mut body = vec![unit, WRITE_SINGLE_REGISTER];
            body.extend_from_slice(&address.to_be_bytes());
            body.extend_from_slice(&value.to_be_bytes());
            body
        }
        Response::WriteMultipleRegisters { start, quantity } => {
            let mut body = vec![unit, WRITE_MULTIPLE_REGISTERS];
            body.extend_from_slice(&start.to_be_bytes());
            body.extend_from_slice(&quantity.to_be_bytes());
            body
        }
        Response::Exception { function, code } => {
            vec![unit, function | EXCEPTION_FLAG, *code as u8]
        }
    };
    seal(body)
}
