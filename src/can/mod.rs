//! CAN 适配层核心定义
//!
//! 与送料柜的全部通信都走标准帧（11-bit ID、0-8 字节数据）。
//! 本模块定义统一的帧类型、错误分类以及收发抽象；
//! Linux 下的 SocketCAN 实现见 [`socketcan`] 子模块。

use std::time::Duration;
use thiserror::Error;

pub mod socketcan;

pub use socketcan::{SocketCanRx, SocketCanTransport, SocketCanTx};

/// 送料柜协议使用的 CAN 帧（仅标准帧）
///
/// 设计要点：
/// - Copy：帧在通道间传递无堆分配
/// - 固定 8 字节数据区，未使用部分为 0
/// - `len` 标记有效数据长度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeederFrame {
    /// 11-bit 标准帧 ID
    pub id: u16,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,
}

impl FeederFrame {
    /// 构造一帧，超过 8 字节的数据被截断
    pub fn new(id: u16, data: &[u8]) -> Self {
        let mut fixed = [0u8; 8];
        let len = data.len().min(8);
        fixed[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            data: fixed,
            len: len as u8,
        }
    }

    /// 只含有效数据的切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    /// 底层 IO 错误
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 读取超时（非致命，可以重试）
    #[error("Read timeout")]
    Timeout,

    /// 总线关闭（致命，需要重连）
    #[error("Bus off")]
    BusOff,

    /// 接收缓冲区溢出
    #[error("Buffer overflow")]
    BufferOverflow,

    /// 总线未连接
    #[error("Bus not connected")]
    Down,

    /// 无法构造/解析帧
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl CanError {
    /// 是否为需要走重连流程的致命错误
    ///
    /// `Timeout` 是正常轮询结果；其余都视为链路故障。
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CanError::Timeout)
    }
}

/// CAN 收发抽象
///
/// 语义：
/// - `send()`: 写入内核发送缓冲即返回，不等待总线确认
/// - `receive()`: 阻塞直到收到数据帧或超时
pub trait CanTransport {
    fn send(&mut self, frame: FeederFrame) -> Result<(), CanError>;

    fn receive(&mut self) -> Result<FeederFrame, CanError>;

    /// 设置后续 `receive()` 的超时时间
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
}

/// 只读端（RX 线程持有）
pub trait RxTransport: Send {
    fn receive(&mut self) -> Result<FeederFrame, CanError>;
}

/// 只写端（TX 线程持有）
pub trait TxTransport: Send {
    fn send(&mut self, frame: FeederFrame) -> Result<(), CanError>;
}

/// 可分离为独立收/发两端的适配器
///
/// RX 与 TX 线程物理隔离：接收不会被发送阻塞，反之亦然。
/// 分离消费 `self`，之后原适配器不再可用。
pub trait SplittableTransport: CanTransport {
    type Rx: RxTransport + 'static;
    type Tx: TxTransport + 'static;

    fn split(self) -> Result<(Self::Rx, Self::Tx), CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new_pads_with_zero() {
        let frame = FeederFrame::new(0x10A, &[0x0E, 0x00, 0x01]);
        assert_eq!(frame.id, 0x10A);
        assert_eq!(frame.len, 3);
        assert_eq!(frame.data, [0x0E, 0x00, 0x01, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_frame_new_truncates() {
        let long = [0u8; 12];
        let frame = FeederFrame::new(0x10B, &long);
        assert_eq!(frame.len, 8);
    }

    #[test]
    fn test_data_slice() {
        let frame = FeederFrame::new(0x10A, &[1, 2]);
        assert_eq!(frame.data_slice(), &[1, 2]);

        let empty = FeederFrame::new(0x10A, &[]);
        assert!(empty.data_slice().is_empty());
    }

    #[test]
    fn test_error_fatality() {
        assert!(!CanError::Timeout.is_fatal());
        assert!(CanError::BusOff.is_fatal());
        assert!(CanError::Down.is_fatal());
        assert!(CanError::Io(std::io::Error::other("gone")).is_fatal());
    }
}
