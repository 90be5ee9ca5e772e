//! Feeder Cabinet - 自动续料系统
//!
//! 位于 Klipper 打印机服务与送料柜之间的监督守护进程：
//! 打印中检测断料 -> 暂停打印 -> 请求送料柜补料 -> 确认完成 ->
//! 恢复打印，并把料盘 RFID 标签（OpenTag 布局）透传落盘。
//!
//! # 架构层次
//!
//! - **can**: SocketCAN 帧传输（收/发分离、重连由上层驱动）
//! - **protocol**: 消息编解码、握手/心跳/重连、RFID 分包重组
//! - **klipper**: Moonraker WebSocket 观察者与动作原语
//! - **state**: 系统状态机（单写者）
//! - **orchestrator**: 事件泵，连接以上全部

pub mod can;
pub mod config;
pub mod klipper;
pub mod orchestrator;
pub mod protocol;
pub mod sink;
pub mod state;

// Re-export 核心类型（简化使用方导入）
pub use can::{CanError, FeederFrame};
pub use config::{AppConfig, ConfigError};
pub use orchestrator::Orchestrator;
pub use protocol::{LinkConfig, LinkEngine, LinkHandle, ProtocolError, ProtocolEvent};
pub use state::{StateManager, SystemState};
