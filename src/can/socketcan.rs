//! SocketCAN 传输实现
//!
//! 基于 Linux SocketCAN 子系统。接口配置（波特率等）由系统工具
//! `ip link` 完成，应用层只负责打开接口、设置过滤器和超时。
//!
//! 收/发分离基于 `CanSocket::try_clone()`（`dup()` 系统调用）。
//! 注意 `dup()` 共享"打开文件描述"：文件状态标志与过滤器在两个 FD
//! 之间共享，因此超时一律走 `SO_RCVTIMEO`/`SO_SNDTIMEO`，
//! 严禁在分离后的任何一端调用 `set_nonblocking()`。

use crate::can::{CanError, CanTransport, FeederFrame, RxTransport, SplittableTransport, TxTransport};
use crate::protocol::ids::{CABINET_TO_PRINTER_ID, HANDSHAKE_RX_ID};
use socketcan::{
    BlockingCan, CanError as SocketCanError, CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame,
    Socket, SocketOptions, StandardId,
};
use std::os::unix::io::OwnedFd;
use std::time::Duration;
use tracing::{trace, warn};

/// 发送超时：总线 Error Passive / 缓冲区满时快速失败，避免 TX 线程卡死
const WRITE_TIMEOUT: Duration = Duration::from_millis(10);

/// SocketCAN 适配器
///
/// 打开即配置：接收过滤器只放行送料柜方向的两个 ID（命令 0x10B、
/// 握手 0x3F1），降低繁忙总线上的唤醒次数。
pub struct SocketCanTransport {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
}

impl SocketCanTransport {
    /// 打开 CAN 接口
    pub fn open(interface: &str, read_timeout: Duration) -> Result<Self, CanError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to open CAN interface {}: {}",
                interface, e
            )))
        })?;

        socket.set_read_timeout(read_timeout).map_err(CanError::Io)?;
        socket.set_write_timeout(WRITE_TIMEOUT).map_err(CanError::Io)?;

        Self::configure_filters(&socket)?;

        trace!(interface, "SocketCAN interface opened");
        Ok(Self {
            socket,
            interface: interface.to_string(),
            read_timeout,
        })
    }

    /// 配置硬件过滤器：只接收送料柜 -> 打印机方向的帧
    fn configure_filters(socket: &CanSocket) -> Result<(), CanError> {
        let filters = [
            CanFilter::new(CABINET_TO_PRINTER_ID as u32, 0x7FF),
            CanFilter::new(HANDSHAKE_RX_ID as u32, 0x7FF),
        ];
        socket.set_filters(&filters).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to set CAN filters: {}",
                e
            )))
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

/// 从 socketcan 帧转换为协议帧；非标准数据帧返回 None
fn convert_inbound(frame: CanFrame) -> Result<Option<FeederFrame>, CanError> {
    match frame {
        CanFrame::Data(data_frame) => {
            if data_frame.is_extended() {
                // 协议只使用标准帧，扩展帧直接丢弃
                trace!(id = data_frame.raw_id(), "Ignoring extended frame");
                return Ok(None);
            }
            Ok(Some(FeederFrame::new(
                data_frame.raw_id() as u16,
                data_frame.data(),
            )))
        }
        CanFrame::Remote(_) => Ok(None),
        CanFrame::Error(error_frame) => {
            let err = SocketCanError::from(error_frame);
            match &err {
                SocketCanError::BusOff => Err(CanError::BusOff),
                SocketCanError::ControllerProblem(problem) => {
                    let text = format!("{}", problem);
                    if text.to_lowercase().contains("overflow") {
                        Err(CanError::BufferOverflow)
                    } else {
                        warn!(problem = %problem, "CAN controller problem, ignoring");
                        Ok(None)
                    }
                }
                other => {
                    warn!(error = %other, "CAN error frame received, ignoring");
                    Ok(None)
                }
            }
        }
    }
}

fn convert_outbound(frame: &FeederFrame) -> Result<CanFrame, CanError> {
    let id = StandardId::new(frame.id)
        .ok_or_else(|| CanError::InvalidFrame(format!("Invalid standard ID 0x{:X}", frame.id)))?;
    CanFrame::new(id, frame.data_slice()).ok_or_else(|| {
        CanError::InvalidFrame(format!("Failed to build frame with ID 0x{:X}", frame.id))
    })
}

fn map_io_error(e: std::io::Error) -> CanError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => CanError::Timeout,
        _ => CanError::Io(e),
    }
}

fn map_transmit_error(e: socketcan::Error) -> CanError {
    match e {
        socketcan::Error::Io(io_err) => map_io_error(io_err),
        socketcan::Error::Can(can_err) => CanError::Io(std::io::Error::other(can_err.to_string())),
    }
}

fn try_clone_socket(socket: &CanSocket) -> std::io::Result<CanSocket> {
    let cloned = socket.as_raw_socket().try_clone()?;
    Ok(CanSocket::from(OwnedFd::from(cloned)))
}

/// 在一个 socket 上阻塞读一帧，过滤掉错误帧与非标准帧
fn receive_on(socket: &mut CanSocket) -> Result<FeederFrame, CanError> {
    loop {
        let raw = socket.read_frame().map_err(map_io_error)?;
        if let Some(frame) = convert_inbound(raw)? {
            trace!(id = frame.id, len = frame.len, "RX frame");
            return Ok(frame);
        }
        // 错误帧/远程帧：继续等下一帧，超时由 SO_RCVTIMEO 兜底
    }
}

fn send_on(socket: &mut CanSocket, frame: FeederFrame) -> Result<(), CanError> {
    let can_frame = convert_outbound(&frame)?;
    socket.transmit(&can_frame).map_err(map_transmit_error)?;
    trace!(id = frame.id, len = frame.len, "TX frame");
    Ok(())
}

impl CanTransport for SocketCanTransport {
    fn send(&mut self, frame: FeederFrame) -> Result<(), CanError> {
        send_on(&mut self.socket, frame)
    }

    fn receive(&mut self) -> Result<FeederFrame, CanError> {
        receive_on(&mut self.socket)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.socket.set_read_timeout(timeout) {
            warn!(error = %e, "Failed to update read timeout");
        } else {
            self.read_timeout = timeout;
        }
    }
}

/// 只读端：RX 线程独占
pub struct SocketCanRx {
    socket: CanSocket,
}

/// 只写端：TX 线程独占
pub struct SocketCanTx {
    socket: CanSocket,
}

impl SplittableTransport for SocketCanTransport {
    type Rx = SocketCanRx;
    type Tx = SocketCanTx;

    fn split(self) -> Result<(Self::Rx, Self::Tx), CanError> {
        let rx_socket = try_clone_socket(&self.socket).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to clone CAN socket for RX: {}",
                e
            )))
        })?;
        rx_socket
            .set_read_timeout(self.read_timeout)
            .map_err(CanError::Io)?;

        let tx_socket = try_clone_socket(&self.socket).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to clone CAN socket for TX: {}",
                e
            )))
        })?;
        tx_socket
            .set_write_timeout(WRITE_TIMEOUT)
            .map_err(CanError::Io)?;

        Ok((
            SocketCanRx { socket: rx_socket },
            SocketCanTx { socket: tx_socket },
        ))
    }
}

impl RxTransport for SocketCanRx {
    fn receive(&mut self) -> Result<FeederFrame, CanError> {
        receive_on(&mut self.socket)
    }
}

impl TxTransport for SocketCanTx {
    fn send(&mut self, frame: FeederFrame) -> Result<(), CanError> {
        send_on(&mut self.socket, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_outbound_standard_id() {
        let frame = FeederFrame::new(0x10A, &[0x01, 0x00, 0x00]);
        let can_frame = convert_outbound(&frame).unwrap();
        assert_eq!(can_frame.raw_id(), 0x10A);
        assert_eq!(can_frame.data(), &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_convert_outbound_rejects_wide_id() {
        // 11-bit 标准帧 ID 上限 0x7FF
        let frame = FeederFrame::new(0x800, &[0x01]);
        assert!(matches!(
            convert_outbound(&frame),
            Err(CanError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_map_io_error_timeout() {
        let e = std::io::Error::new(std::io::ErrorKind::WouldBlock, "again");
        assert!(matches!(map_io_error(e), CanError::Timeout));

        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(map_io_error(e), CanError::Timeout));

        let e = std::io::Error::other("gone");
        assert!(matches!(map_io_error(e), CanError::Io(_)));
    }
}
