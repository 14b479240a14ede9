//! Dooya curtain motor wire protocol: frame layout, CRC trailer and
//! response decoding.
//!
//! Every frame starts with the sync byte 0x55 followed by a 2-byte
//! device address, a command group, a command code and an optional
//! payload. The transport appends a Modbus-style CRC16 (low byte
//! first) over everything before it, sync byte included.

use crc::{Crc, CRC_16_MODBUS};
use lazy_static::lazy_static;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;
use regex::Regex;
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

pub const SYNC: u8 = 0x55;
pub const BROADCAST: DeviceAddress = DeviceAddress([0x00, 0x00]);

const CRC_LEN: usize = 2;
/// Offset of the status/value byte in query answers.
const VALUE_OFFSET: usize = 5;
/// Offset of the echoed address in the programming-mode answer.
const ASSIGN_ECHO_OFFSET: usize = 8;
/// Raw position byte reported while end limits are not programmed.
const POSITION_UNSET: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid device address '{0}'")]
    BadAddress(String),
    #[error("invalid direction '{0}'")]
    BadDirection(String),
    #[error("position {0} out of range")]
    BadPosition(u8),
}

pub fn checksum(data: &[u8]) -> u16 {
    let crc = Crc::<u16>::new(&CRC_16_MODBUS);
    crc.checksum(data)
}

/// Appends the CRC16 trailer, yielding the exact on-wire frame.
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + CRC_LEN);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&checksum(payload).to_le_bytes());
    frame
}

/// 2-byte device id, unique per bus. Configured as a 4-digit hex
/// string (e.g. "0102").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub [u8; 2]);

impl DeviceAddress {
    pub fn hi(&self) -> u8 {
        self.0[0]
    }

    pub fn lo(&self) -> u8 {
        self.0[1]
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

impl FromStr for DeviceAddress {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})$").unwrap();
        }
        let cap = RE
            .captures(input)
            .ok_or_else(|| ProtocolError::BadAddress(input.to_string()))?;
        let hi = u8::from_str_radix(cap.get(1).unwrap().as_str(), 16).unwrap();
        let lo = u8::from_str_radix(cap.get(2).unwrap().as_str(), 16).unwrap();
        Ok(DeviceAddress([hi, lo]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Direction {
    Direct = 0,
    Reverse = 1,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Direct => "DIRECT".fmt(f),
            Direction::Reverse => "REVERSE".fmt(f),
        }
    }
}

impl FromStr for Direction {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "direct" => Ok(Direction::Direct),
            "reverse" => Ok(Direction::Reverse),
            _ => Err(ProtocolError::BadDirection(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MotionState {
    Stop = 0,
    Open = 1,
    Close = 2,
    Programming = 3,
}

impl Display for MotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MotionState::Stop => "STOP".fmt(f),
            MotionState::Open => "OPEN".fmt(f),
            MotionState::Close => "CLOSE".fmt(f),
            MotionState::Programming => "PROGRAMMING".fmt(f),
        }
    }
}

/// Every command the motor controller understands, together with the
/// single command -> bytes and command -> answer-length tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MoveTo(u8),
    Open,
    Close,
    Stop,
    SetDirection(Direction),
    QueryPosition,
    QueryMotion,
    QueryDirection,
    /// Protocol version handshake issued on session init.
    Probe,
    /// Broadcast that puts a listening device into programming mode so
    /// it claims the given address.
    Assign(DeviceAddress),
}

impl Command {
    /// Logical payload, pre-CRC. `Assign` goes out on the broadcast
    /// address regardless of `addr`.
    pub fn encode(&self, addr: DeviceAddress) -> Vec<u8> {
        let (a0, a1) = (addr.hi(), addr.lo());
        match *self {
            Command::MoveTo(pct) => vec![SYNC, a0, a1, 0x03, 0x04, pct],
            Command::Open => vec![SYNC, a0, a1, 0x03, 0x01],
            Command::Close => vec![SYNC, a0, a1, 0x03, 0x02],
            Command::Stop => vec![SYNC, a0, a1, 0x03, 0x03],
            Command::SetDirection(dir) => vec![SYNC, a0, a1, 0x02, 0x03, 0x01, dir as u8],
            Command::QueryPosition => vec![SYNC, a0, a1, 0x01, 0x02, 0x01],
            Command::QueryMotion => vec![SYNC, a0, a1, 0x01, 0x05, 0x01],
            Command::QueryDirection => vec![SYNC, a0, a1, 0x01, 0x03, 0x01],
            Command::Probe => vec![SYNC, a0, a1, 0x01, 0xFE, 0x01],
            Command::Assign(target) => {
                vec![SYNC, 0x00, 0x00, 0x02, 0x00, 0x02, target.hi(), target.lo()]
            }
        }
    }

    /// Total answer length on the wire, CRC trailer included.
    pub fn response_len(&self) -> usize {
        match *self {
            Command::Open | Command::Close | Command::Stop => 7,
            Command::MoveTo(_)
            | Command::QueryPosition
            | Command::QueryMotion
            | Command::QueryDirection
            | Command::Probe => 8,
            Command::SetDirection(_) => 9,
            Command::Assign(_) => 15,
        }
    }
}

/// An answer is only interpreted when it has the declared length and
/// leads with the sync byte; anything else is line noise.
pub fn frame_valid(answer: &[u8], expected_len: usize) -> bool {
    answer.len() == expected_len && answer.first() == Some(&SYNC)
}

/// Answers echo the device address at bytes 1..3; a mismatch is
/// cross-talk from another device sharing the bus.
pub fn address_matches(answer: &[u8], addr: DeviceAddress) -> bool {
    answer.len() >= 3 && answer[1..3] == addr.0
}

/// 0xFF means the end limits are not programmed yet; values past 100
/// are garbage and rejected.
pub fn decode_position(answer: &[u8]) -> Option<u8> {
    match answer.get(VALUE_OFFSET).copied() {
        Some(POSITION_UNSET) => None,
        Some(pct) if pct <= 100 => Some(pct),
        _ => None,
    }
}

pub fn decode_motion(answer: &[u8]) -> Option<MotionState> {
    MotionState::from_u8(*answer.get(VALUE_OFFSET)?)
}

pub fn decode_direction(answer: &[u8]) -> Option<Direction> {
    Direction::from_u8(*answer.get(VALUE_OFFSET)?)
}

pub fn decode_version(answer: &[u8]) -> Option<u8> {
    answer.get(VALUE_OFFSET).copied()
}

/// Programming succeeded when the answer echoes the requested address.
pub fn assign_acknowledged(answer: &[u8], addr: DeviceAddress) -> bool {
    answer.get(ASSIGN_ECHO_OFFSET..ASSIGN_ECHO_OFFSET + 2) == Some(&addr.0[..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: DeviceAddress = DeviceAddress([0x01, 0x02]);

    // Bit-by-bit Modbus CRC16: poly 0xA001, seed 0xFFFF.
    fn crc16_reference(data: &[u8]) -> u16 {
        let mut reg = 0xFFFFu16;
        for &byte in data {
            reg ^= byte as u16;
            for _ in 0..8 {
                if reg & 1 != 0 {
                    reg = (reg >> 1) ^ 0xA001;
                } else {
                    reg >>= 1;
                }
            }
        }
        reg
    }

    #[test]
    fn checksum_known_vectors() {
        assert_eq!(checksum(&[]), 0xFFFF);
        assert_eq!(checksum(b"123456789"), 0x4B37);
    }

    #[test]
    fn checksum_matches_reference() {
        let frames: &[&[u8]] = &[
            &[0x55, 0x01, 0x02, 0x03, 0x01],
            &[0x55, 0x01, 0x02, 0x03, 0x04, 0x37],
            &[0x55, 0x00, 0x00, 0x02, 0x00, 0x02, 0x01, 0x02],
            &[0x00],
        ];
        for frame in frames {
            assert_eq!(checksum(frame), crc16_reference(frame), "{:02X?}", frame);
        }
    }

    #[test]
    fn build_frame_appends_crc_low_byte_first() {
        let payload = [0x55, 0x01, 0x02, 0x03, 0x01];
        let frame = build_frame(&payload);
        let crc = checksum(&payload);

        assert_eq!(frame.len(), payload.len() + 2);
        assert_eq!(&frame[..payload.len()], &payload);
        assert_eq!(frame[payload.len()], (crc & 0xFF) as u8);
        assert_eq!(frame[payload.len() + 1], (crc >> 8) as u8);
    }

    #[test]
    fn encode_command_payloads() {
        assert_eq!(
            Command::MoveTo(55).encode(ADDR),
            [0x55, 0x01, 0x02, 0x03, 0x04, 0x37]
        );
        assert_eq!(Command::Open.encode(ADDR), [0x55, 0x01, 0x02, 0x03, 0x01]);
        assert_eq!(Command::Close.encode(ADDR), [0x55, 0x01, 0x02, 0x03, 0x02]);
        assert_eq!(Command::Stop.encode(ADDR), [0x55, 0x01, 0x02, 0x03, 0x03]);
        assert_eq!(
            Command::SetDirection(Direction::Reverse).encode(ADDR),
            [0x55, 0x01, 0x02, 0x02, 0x03, 0x01, 0x01]
        );
        assert_eq!(
            Command::QueryPosition.encode(ADDR),
            [0x55, 0x01, 0x02, 0x01, 0x02, 0x01]
        );
        assert_eq!(
            Command::QueryMotion.encode(ADDR),
            [0x55, 0x01, 0x02, 0x01, 0x05, 0x01]
        );
        assert_eq!(
            Command::QueryDirection.encode(ADDR),
            [0x55, 0x01, 0x02, 0x01, 0x03, 0x01]
        );
        assert_eq!(
            Command::Probe.encode(ADDR),
            [0x55, 0x01, 0x02, 0x01, 0xFE, 0x01]
        );
        assert_eq!(
            Command::Assign(ADDR).encode(BROADCAST),
            [0x55, 0x00, 0x00, 0x02, 0x00, 0x02, 0x01, 0x02]
        );
    }

    #[test]
    fn response_length_is_echo_plus_crc() {
        let commands = [
            Command::MoveTo(0),
            Command::Open,
            Command::Close,
            Command::Stop,
            Command::SetDirection(Direction::Direct),
            Command::QueryPosition,
            Command::QueryMotion,
            Command::QueryDirection,
            Command::Probe,
        ];
        for cmd in commands {
            assert_eq!(cmd.response_len(), cmd.encode(ADDR).len() + 2, "{:?}", cmd);
        }
        // Programming-mode answer carries extra state on top of the echo.
        assert_eq!(Command::Assign(ADDR).response_len(), 15);
    }

    #[test]
    fn parse_address() {
        assert_eq!("0102".parse::<DeviceAddress>().unwrap(), ADDR);
        assert_eq!(
            "aBcD".parse::<DeviceAddress>().unwrap(),
            DeviceAddress([0xAB, 0xCD])
        );
        assert!("".parse::<DeviceAddress>().is_err());
        assert!("012".parse::<DeviceAddress>().is_err());
        assert!("01023".parse::<DeviceAddress>().is_err());
        assert!("zz00".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn sync_byte_gates_validity() {
        assert!(frame_valid(&[0x55, 0, 0, 0, 0, 0, 0, 0], 8));
        assert!(!frame_valid(&[0x00, 0, 0, 0, 0, 0, 0, 0], 8));
        assert!(!frame_valid(&[0x55, 0, 0], 8));
        assert!(!frame_valid(&[], 0));
    }

    #[test]
    fn address_echo_check() {
        assert!(address_matches(&[0x55, 0x01, 0x02, 0, 0, 0, 0, 0], ADDR));
        assert!(!address_matches(&[0x55, 0x01, 0x03, 0, 0, 0, 0, 0], ADDR));
        assert!(!address_matches(&[0x55], ADDR));
    }

    #[test]
    fn decode_position_values() {
        assert_eq!(decode_position(&[0x55, 1, 2, 1, 2, 42, 0, 0]), Some(42));
        assert_eq!(decode_position(&[0x55, 1, 2, 1, 2, 0, 0, 0]), Some(0));
        assert_eq!(decode_position(&[0x55, 1, 2, 1, 2, 100, 0, 0]), Some(100));
        // limits-unset sentinel
        assert_eq!(decode_position(&[0x55, 1, 2, 1, 2, 0xFF, 0, 0]), None);
        // out of range
        assert_eq!(decode_position(&[0x55, 1, 2, 1, 2, 101, 0, 0]), None);
        assert_eq!(decode_position(&[0x55, 1, 2]), None);
    }

    #[test]
    fn decode_motion_values() {
        let answer = |v| [0x55, 1, 2, 1, 5, v, 0, 0];
        assert_eq!(decode_motion(&answer(0)), Some(MotionState::Stop));
        assert_eq!(decode_motion(&answer(1)), Some(MotionState::Open));
        assert_eq!(decode_motion(&answer(2)), Some(MotionState::Close));
        assert_eq!(decode_motion(&answer(3)), Some(MotionState::Programming));
        assert_eq!(decode_motion(&answer(9)), None);
    }

    #[test]
    fn decode_direction_values() {
        let answer = |v| [0x55, 1, 2, 1, 3, v, 0, 0];
        assert_eq!(decode_direction(&answer(0)), Some(Direction::Direct));
        assert_eq!(decode_direction(&answer(1)), Some(Direction::Reverse));
        assert_eq!(decode_direction(&answer(2)), None);
    }

    #[test]
    fn assign_ack_echoes_address() {
        let mut answer = [0u8; 15];
        answer[0] = 0x55;
        answer[8] = 0x01;
        answer[9] = 0x02;
        assert!(assign_acknowledged(&answer, ADDR));
        answer[9] = 0x03;
        assert!(!assign_acknowledged(&answer, ADDR));
        assert!(!assign_acknowledged(&[0x55, 0, 0], ADDR));
    }
}
