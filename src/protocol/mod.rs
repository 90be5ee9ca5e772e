//! 送料柜协议层
//!
//! 负责把 CAN 帧的原始字节解析为类型安全的消息结构，
//! 以及把上层操作编码为 CAN 帧；并实现链路生命周期
//! （握手 / 心跳 / 重连）与 RFID 分包传输的重组。

pub mod ids;
pub mod link;
pub mod messages;
pub mod opentag;
pub mod rfid;

pub use link::{LinkConfig, LinkEngine, LinkHandle, LinkState, ProtocolEvent};
pub use messages::{CabinetMessage, FeedPhase, MaterialType, RfidSource, RfidStart};

use thiserror::Error;

/// 协议解析/链路错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too short: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unexpected CAN ID: 0x{id:X}")]
    InvalidCanId { id: u16 },

    #[error("Unknown command: 0x{command:02X}")]
    UnknownCommand { command: u8 },

    #[error("Invalid value for field {field}: 0x{value:02X}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Protocol version mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Event channel closed")]
    ChannelClosed,
}

/// 协议头 16 位字段的字节序约定：高字节在前
///
/// 注意与 OpenTag 负载内容相反（OpenTag 为小端），
/// 必须与送料柜固件逐位兼容。
pub fn split_u16_hi_lo(value: u16) -> (u8, u8) {
    ((value >> 8) as u8, (value & 0xFF) as u8)
}

/// 高低两个 8 位字段还原为 u16
pub fn join_u16_hi_lo(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | (lo as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_join_roundtrip() {
        for value in [0u16, 1, 148, 0x1234, 0xFFFF] {
            let (hi, lo) = split_u16_hi_lo(value);
            assert_eq!(join_u16_hi_lo(hi, lo), value);
        }
    }

    #[test]
    fn test_split_is_big_endian_first() {
        // 148 字节 -> 高字节 0x00 在前，低字节 0x94 在后
        assert_eq!(split_u16_hi_lo(148), (0x00, 0x94));
        assert_eq!(split_u16_hi_lo(0x1234), (0x12, 0x34));
    }
}
