//! 中央状态管理器
//!
//! 系统状态的唯一事实来源。所有转换由编排线程串行发起，
//! 非法转换记录后拒绝，绝不静默提升；每次成功转换在提交后
//! 才对外发布变更通知。

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{info, warn};

/// 不可恢复错误分类（进入 [`SystemState::Error`] 的原因）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// 送料柜协议版本不匹配
    VersionMismatch,
    /// 打印机服务反复不可达
    PrinterUnreachable,
    /// 送料柜上报不可恢复故障
    CabinetFault,
}

/// 系统运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// 启动中，组件尚未就绪
    Starting,
    /// 空闲
    Idle,
    /// 打印中
    Printing,
    /// 已暂停；断料流程暂停时携带挤出机号，人工暂停为 None
    Paused { extruder: Option<u8> },
    /// 断料，等待暂停确认
    Runout { extruder: u8 },
    /// 送料中
    Feeding { extruder: u8 },
    /// 恢复打印中，等待恢复确认
    Resuming { extruder: u8 },
    /// 错误状态：停发命令，链路保持用于诊断
    Error { kind: FatalKind },
    /// CAN 链路断开
    Disconnected,
}

/// 状态机输入事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ComponentsReady,
    LinkLost,
    LinkUp,
    PrintStarted,
    /// 打印完成（正常结束）
    PrintFinished,
    /// 打印被取消
    PrintCancelled,
    /// 打印机侧人工暂停 / 恢复（非断料流程）
    PrintPausedExternally,
    PrintResumedExternally,
    SensorRunout { extruder: u8 },
    PauseConfirmed,
    FeedRequested,
    FeedComplete,
    ResumeConfirmed,
    FatalError { kind: FatalKind },
    OperatorReset,
}

/// 成功提交的一次转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: SystemState,
    pub to: SystemState,
    pub event: StateEvent,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal transition: {state:?} on {event:?}")]
pub struct IllegalTransition {
    pub state: SystemState,
    pub event: StateEvent,
}

/// 状态管理器
///
/// 单写者约束：只有编排线程调用 [`StateManager::transition`]；
/// 其余组件通过 [`StateManager::subscribe`] 观察变更。
pub struct StateManager {
    state: SystemState,
    /// 断链前的状态，链路恢复后回到这里
    prior: Option<SystemState>,
    watchers: Vec<Sender<StateChange>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: SystemState::Starting,
            prior: None,
            watchers: Vec::new(),
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    /// 订阅状态变更通知
    pub fn subscribe(&mut self) -> Receiver<StateChange> {
        let (tx, rx) = crossbeam_channel::bounded(64);
        self.watchers.push(tx);
        rx
    }

    /// 断料换料流程当前关注的挤出机
    pub fn active_runout_extruder(&self) -> Option<u8> {
        match self.state {
            SystemState::Runout { extruder }
            | SystemState::Feeding { extruder }
            | SystemState::Resuming { extruder } => Some(extruder),
            SystemState::Paused { extruder } => extruder,
            _ => None,
        }
    }

    /// 依转换表计算后继状态；不在表中返回 None
    fn next_state(&mut self, event: StateEvent) -> Option<SystemState> {
        use StateEvent::*;
        use SystemState::*;

        match (self.state, event) {
            // 全局行：断链与致命错误在任何状态下生效
            (Disconnected, LinkLost) => None,
            (_, LinkLost) => {
                self.prior = Some(self.state);
                Some(Disconnected)
            }
            (Disconnected, LinkUp) => {
                let restored = match self.prior.take() {
                    None | Some(Starting) | Some(Disconnected) => Idle,
                    Some(prior) => prior,
                };
                Some(restored)
            }
            (Error { .. }, FatalError { .. }) => None,
            (_, FatalError { kind }) => Some(Error { kind }),
            (Error { .. }, OperatorReset) => Some(Idle),

            (Starting, ComponentsReady) => Some(Idle),

            // 打印生命周期
            (Idle, PrintStarted) => Some(Printing),
            (Printing, PrintFinished) => Some(Idle),
            (Printing | Paused { .. } | Runout { .. } | Feeding { .. } | Resuming { .. }, PrintCancelled) => {
                Some(Idle)
            }
            (Printing, PrintPausedExternally) => Some(Paused { extruder: None }),
            (Paused { extruder: None }, PrintResumedExternally) => Some(Printing),

            // 断料 -> 送料 -> 恢复 序列
            (Printing, SensorRunout { extruder }) => Some(Runout { extruder }),
            (Runout { extruder }, PauseConfirmed) => Some(Paused {
                extruder: Some(extruder),
            }),
            (Paused { extruder: Some(extruder) }, FeedRequested) => Some(Feeding { extruder }),
            (Feeding { extruder }, FeedComplete) => Some(Resuming { extruder }),
            (Resuming { .. }, ResumeConfirmed) => Some(Printing),

            _ => None,
        }
    }

    /// 发起一次转换；非法转换记录并拒绝，无任何副作用
    pub fn transition(&mut self, event: StateEvent) -> Result<StateChange, IllegalTransition> {
        let from = self.state;
        let to = match self.next_state(event) {
            Some(to) => to,
            None => {
                let err = IllegalTransition { state: from, event };
                warn!(state = ?from, event = ?event, "Illegal state transition rejected");
                return Err(err);
            }
        };

        // 先提交再通知
        self.state = to;
        if !matches!(to, SystemState::Disconnected) && !matches!(event, StateEvent::LinkLost) {
            // 正常转换后旧的断链快照作废
            if !matches!(from, SystemState::Disconnected) {
                self.prior = None;
            }
        }
        let change = StateChange { from, to, event };
        info!(from = ?from, to = ?to, "System state transition");

        self.watchers
            .retain(|watcher| watcher.try_send(change).is_ok());
        Ok(change)
    }
}
