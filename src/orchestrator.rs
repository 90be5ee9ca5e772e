//! 编排层
//!
//! 唯一的事件泵：排空观察者与协议两路事件通道，翻译成状态机转换，
//! 并按转换表把副作用（打印机动作、送料柜命令、记录落盘）发出去。
//! 状态机只有这一个写者，接收线程从不直接改状态。

use crate::config::AppConfig;
use crate::klipper::{KlipperHandle, ObserverEvent, PrintState};
use crate::protocol::ids::*;
use crate::protocol::messages::{encode_filament_bitmap, CabinetMessage, FeedPhase};
use crate::protocol::rfid::RfidEvent;
use crate::protocol::{LinkHandle, ProtocolEvent, ProtocolError};
use crate::sink::FilamentSink;
use crate::state::{FatalKind, StateChange, StateEvent, StateManager, SystemState};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

/// Moonraker 连续连接失败多少次判定打印机不可达
const PRINTER_UNREACHABLE_THRESHOLD: u32 = 10;

/// 编排器
pub struct Orchestrator {
    config: AppConfig,
    link: LinkHandle,
    klipper: KlipperHandle,
    state: StateManager,
    sink: Option<FilamentSink>,
    /// 启动就绪标志：两者齐备才离开 Starting
    link_ready: bool,
    printer_ready: bool,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        link: LinkHandle,
        klipper: KlipperHandle,
        sink: Option<FilamentSink>,
    ) -> Self {
        Self {
            config,
            link,
            klipper,
            state: StateManager::new(),
            sink,
            link_ready: false,
            printer_ready: false,
        }
    }

    /// 事件泵主循环：返回即代表编排层已排空退出
    pub fn run(
        mut self,
        protocol_rx: Receiver<ProtocolEvent>,
        observer_rx: Receiver<ObserverEvent>,
        shutdown: Receiver<()>,
    ) {
        info!("Orchestrator started");
        loop {
            crossbeam_channel::select! {
                recv(protocol_rx) -> event => match event {
                    Ok(event) => self.handle_protocol_event(event),
                    Err(_) => break,
                },
                recv(observer_rx) -> event => match event {
                    Ok(event) => self.handle_observer_event(event),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }

        // 停机：先排空两路通道再退出，链路随后才关闭
        for event in protocol_rx.try_iter() {
            self.handle_protocol_event(event);
        }
        for event in observer_rx.try_iter() {
            self.handle_observer_event(event);
        }
        info!("Orchestrator drained and stopped");
    }

    /// Error 状态下停发一切出站命令，链路保持供诊断
    fn commands_allowed(&self) -> bool {
        !matches!(self.state.state(), SystemState::Error { .. })
    }

    fn notify_cabinet(&self, cmd: u8, extruder: u8) {
        if !self.commands_allowed() {
            debug!(cmd, "Outbound halted in error state");
            return;
        }
        if let Err(e) = self.link.notify_print_state(cmd, extruder) {
            warn!(cmd, error = %e, "Failed to notify cabinet");
        }
    }

    /// 发起状态转换并执行随之而来的副作用
    fn apply(&mut self, event: StateEvent) {
        match self.state.transition(event) {
            Ok(change) => self.run_side_effects(change),
            Err(_) => {
                // 已由状态机记录，无副作用
            }
        }
    }

    fn run_side_effects(&mut self, change: StateChange) {
        let active = self.klipper.snapshot().active_extruder;
        match change.event {
            StateEvent::PrintStarted => {
                self.notify_cabinet(CMD_PRINT_STARTED, active);
            }
            StateEvent::SensorRunout { extruder } => {
                // 先停打印，再告知送料柜断料暂停
                if let Err(e) = self.klipper.pause_print() {
                    error!(error = %e, "Failed to pause print on runout");
                }
                self.notify_cabinet(CMD_PRINT_PAUSED, extruder);
            }
            StateEvent::PauseConfirmed => {
                // 暂停确认后立刻请求补料
                if let SystemState::Paused {
                    extruder: Some(extruder),
                } = change.to
                {
                    match self.link.request_feed(extruder, false) {
                        Ok(()) => self.apply(StateEvent::FeedRequested),
                        Err(e) => {
                            warn!(extruder, error = %e, "Feed request failed, staying paused")
                        }
                    }
                }
            }
            StateEvent::FeedComplete => {
                if let Err(e) = self.klipper.resume_print() {
                    error!(error = %e, "Failed to resume print after feed");
                }
                // 新料已就位，顺便读取其标签
                if self.config.rfid.enabled {
                    if let SystemState::Resuming { extruder } = change.to {
                        if let Err(e) = self.link.request_rfid_data(extruder) {
                            warn!(extruder, error = %e, "Failed to request RFID data");
                        }
                    }
                }
            }
            StateEvent::ResumeConfirmed => {
                self.notify_cabinet(CMD_PRINT_RESUMED, active);
            }
            StateEvent::PrintFinished => {
                self.notify_cabinet(CMD_PRINT_COMPLETED, active);
            }
            StateEvent::PrintCancelled => {
                // 换料途中取消：同时停掉送料
                if let SystemState::Feeding { extruder } | SystemState::Resuming { extruder } =
                    change.from
                {
                    if let Err(e) = self.link.cancel_feed(extruder) {
                        warn!(extruder, error = %e, "Failed to cancel feed");
                    }
                }
                self.notify_cabinet(CMD_PRINT_CANCELLED, active);
            }
            StateEvent::FatalError { kind } => {
                error!(kind = ?kind, "Entering error state, outbound halted");
            }
            StateEvent::LinkLost => {
                // 在途操作随链路一并作废；RFID 会话由超时回收
                warn!("CAN link lost, in-flight operations cancelled");
            }
            StateEvent::LinkUp => {
                // 重连后向送料柜同步当前打印状态
                let cmd = match change.to {
                    SystemState::Printing | SystemState::Resuming { .. } => {
                        Some(CMD_PRINT_STARTED)
                    }
                    SystemState::Paused { .. } | SystemState::Runout { .. }
                    | SystemState::Feeding { .. } => Some(CMD_PRINT_PAUSED),
                    _ => None,
                };
                if let Some(cmd) = cmd {
                    self.notify_cabinet(cmd, active);
                }
            }
            _ => {}
        }
    }

    fn check_components_ready(&mut self) {
        if self.link_ready
            && self.printer_ready
            && matches!(self.state.state(), SystemState::Starting)
        {
            self.apply(StateEvent::ComponentsReady);
        }
    }

    // ------------------------------------------------------------------
    // 协议事件
    // ------------------------------------------------------------------

    fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::LinkUp => {
                self.link_ready = true;
                if matches!(self.state.state(), SystemState::Disconnected) {
                    self.apply(StateEvent::LinkUp);
                } else {
                    self.check_components_ready();
                }
            }
            ProtocolEvent::LinkDown => {
                self.link_ready = false;
                self.apply(StateEvent::LinkLost);
            }
            ProtocolEvent::Fatal(ProtocolError::VersionMismatch { .. }) => {
                self.apply(StateEvent::FatalError {
                    kind: FatalKind::VersionMismatch,
                });
            }
            ProtocolEvent::Fatal(e) => {
                error!(error = %e, "Unrecoverable protocol error");
            }
            ProtocolEvent::Message(msg) => self.handle_cabinet_message(msg),
            ProtocolEvent::Rfid(event) => self.handle_rfid_event(event),
        }
    }

    fn handle_cabinet_message(&mut self, msg: CabinetMessage) {
        match msg {
            CabinetMessage::FilamentStatusQuery | CabinetMessage::LegacyStatusQuery => {
                self.reply_filament_status();
            }
            CabinetMessage::MappingQuery => {
                self.reply_mapping();
            }
            CabinetMessage::MappingSet {
                zone0_extruder,
                zone1_extruder,
                status,
            } => {
                // 映射在配置校验后即不可变：请求只回显当前配置
                let mapping = &self.config.extruder_mapping;
                let requested = [(zone0_extruder, 0u8), (zone1_extruder, 1u8)];
                for (extruder, zone) in requested {
                    if mapping.zone_for(extruder) != Some(zone) {
                        warn!(
                            extruder,
                            zone, status, "Cabinet requested mapping change, configuration wins"
                        );
                        break;
                    }
                }
                self.reply_mapping();
            }
            CabinetMessage::FeedStatus {
                phase,
                progress,
                error_code,
            } => self.handle_feed_status(phase, progress, error_code),
            CabinetMessage::FilamentOutNotify {
                valid,
                channel,
                extruder,
                active,
                material,
            } => {
                if !valid || !active {
                    debug!(channel, extruder, "Ignoring inactive filament-out notify");
                    return;
                }
                info!(
                    channel,
                    extruder,
                    material = material.name(),
                    "Cabinet reports filament out"
                );
                let resolved = self.resolve_extruder(extruder, channel);
                if let Some(extruder) = resolved {
                    self.handle_runout(extruder);
                }
            }
            CabinetMessage::HeartbeatAck => {}
            // RFID 帧在链路层直接进重组器，不会走到这里
            CabinetMessage::RfidNotifyStart(_)
            | CabinetMessage::RfidResponseStart(_)
            | CabinetMessage::RfidData { .. }
            | CabinetMessage::RfidEnd { .. }
            | CabinetMessage::RfidError { .. } => {
                debug!("RFID message reached orchestrator, ignoring");
            }
        }
    }

    fn handle_feed_status(&mut self, phase: FeedPhase, progress: u8, error_code: u8) {
        debug!(phase = ?phase, progress, error_code, "Cabinet feed status");
        match phase {
            FeedPhase::Complete => {
                if matches!(self.state.state(), SystemState::Feeding { .. }) {
                    self.apply(StateEvent::FeedComplete);
                }
            }
            FeedPhase::Error => {
                error!(error_code, "Cabinet reports feed error");
                if matches!(self.state.state(), SystemState::Feeding { .. }) {
                    self.apply(StateEvent::FatalError {
                        kind: FatalKind::CabinetFault,
                    });
                }
            }
            FeedPhase::Idle | FeedPhase::Ready | FeedPhase::Feeding => {}
        }
    }

    fn handle_rfid_event(&mut self, event: RfidEvent) {
        match event {
            RfidEvent::TransferStarted {
                seq,
                extruder,
                expected_len,
                ..
            } => {
                debug!(seq, extruder, expected_len, "RFID transfer started");
            }
            RfidEvent::TransferComplete {
                extruder,
                channel,
                record,
                raw,
                ..
            } => {
                let resolved = self.resolve_extruder(extruder, channel);
                let Some(extruder) = resolved else {
                    warn!(channel, "RFID record for unmapped channel, discarded");
                    return;
                };
                let Some(record) = record else {
                    debug!(extruder, bytes = raw.len(), "RFID transfer without parsable record");
                    return;
                };

                if let Some(sink) = &self.sink {
                    match sink.store(extruder, &record) {
                        Ok(path) => debug!(path = %path.display(), "RFID record persisted"),
                        Err(e) => error!(error = %e, "Failed to persist RFID record"),
                    }
                }

                if self.config.rfid.auto_set_temperature && self.commands_allowed() {
                    let heater = if extruder == 0 {
                        "extruder".to_string()
                    } else {
                        format!("extruder{}", extruder)
                    };
                    if let Err(e) = self.klipper.run_gcode(format!(
                        "SET_HEATER_TEMPERATURE HEATER={} TARGET={}",
                        heater, record.print_temp
                    )) {
                        warn!(extruder, error = %e, "Failed to set hotend temperature");
                    }
                    if let Err(e) = self.klipper.run_gcode(format!(
                        "SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET={}",
                        record.bed_temp
                    )) {
                        warn!(error = %e, "Failed to set bed temperature");
                    }
                    info!(
                        extruder,
                        print_temp = record.print_temp,
                        bed_temp = record.bed_temp,
                        "Applied temperatures from RFID record"
                    );
                }
            }
            RfidEvent::TransferAborted {
                seq,
                extruder,
                reason,
                ..
            } => {
                // 会话级错误不影响系统状态
                warn!(seq, extruder, reason = ?reason, "RFID transfer aborted");
            }
            RfidEvent::ReadError {
                extruder,
                code,
                ext_code,
                ..
            } => {
                warn!(extruder, code, ext_code, "Cabinet RFID read error");
            }
        }
    }

    // ------------------------------------------------------------------
    // 观察者事件
    // ------------------------------------------------------------------

    fn handle_observer_event(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::Connected => {
                self.printer_ready = true;
                self.check_components_ready();
            }
            ObserverEvent::Disconnected => {
                self.printer_ready = false;
            }
            ObserverEvent::ConnectFailed { consecutive } => {
                if consecutive >= PRINTER_UNREACHABLE_THRESHOLD {
                    self.apply(StateEvent::FatalError {
                        kind: FatalKind::PrinterUnreachable,
                    });
                }
            }
            ObserverEvent::PrintState(print_state) => self.handle_print_state(print_state),
            ObserverEvent::SensorChange { extruder, detected } => {
                if detected {
                    debug!(extruder, "Filament present again");
                    return;
                }
                self.handle_runout(extruder);
            }
        }
    }

    fn handle_print_state(&mut self, print_state: PrintState) {
        let current = self.state.state();
        match (current, print_state) {
            (SystemState::Idle, PrintState::Printing) => self.apply(StateEvent::PrintStarted),
            (SystemState::Resuming { .. }, PrintState::Printing) => {
                self.apply(StateEvent::ResumeConfirmed)
            }
            (SystemState::Paused { extruder: None }, PrintState::Printing) => {
                self.apply(StateEvent::PrintResumedExternally)
            }
            (SystemState::Runout { .. }, PrintState::Paused) => {
                self.apply(StateEvent::PauseConfirmed)
            }
            (SystemState::Printing, PrintState::Paused) => {
                self.apply(StateEvent::PrintPausedExternally)
            }
            (SystemState::Printing, PrintState::Complete) => self.apply(StateEvent::PrintFinished),
            (
                SystemState::Printing
                | SystemState::Paused { .. }
                | SystemState::Runout { .. }
                | SystemState::Feeding { .. }
                | SystemState::Resuming { .. },
                PrintState::Cancelled,
            ) => self.apply(StateEvent::PrintCancelled),
            (
                SystemState::Printing
                | SystemState::Paused { .. }
                | SystemState::Runout { .. }
                | SystemState::Feeding { .. }
                | SystemState::Resuming { .. },
                PrintState::Error,
            ) => {
                // 打印机侧错误终止打印：回到空闲并通知送料柜
                self.notify_cabinet(CMD_PRINT_ERROR, self.klipper.snapshot().active_extruder);
                self.apply(StateEvent::PrintCancelled);
            }
            _ => {
                debug!(state = ?current, report = ?print_state, "Print state report ignored");
            }
        }
    }

    /// 断料处理：仅在打印中且功能开启时触发
    fn handle_runout(&mut self, extruder: u8) {
        if !self.config.filament_runout.enabled {
            debug!(extruder, "Runout handling disabled");
            return;
        }
        if !matches!(self.state.state(), SystemState::Printing) {
            debug!(extruder, state = ?self.state.state(), "Runout outside printing ignored");
            return;
        }
        if self.config.extruder_mapping.zone_for(extruder).is_none() {
            warn!(extruder, "Runout on unmapped extruder ignored");
            return;
        }
        info!(extruder, "Filament runout detected");
        self.apply(StateEvent::SensorRunout { extruder });
    }

    // ------------------------------------------------------------------
    // 同步应答
    // ------------------------------------------------------------------

    /// 0x0D / 旧版 0x03 查询：按料管位图回报余料状态
    fn reply_filament_status(&self) {
        if !self.commands_allowed() {
            return;
        }
        let snapshot = self.klipper.snapshot();
        let mapping = &self.config.extruder_mapping;

        let mut all_known = true;
        let zones = mapping.pairs().into_iter().map(|(extruder, zone)| {
            let detected = snapshot
                .filament_detected
                .get(extruder as usize)
                .copied()
                .flatten();
            if detected.is_none() {
                all_known = false;
            }
            (zone, detected.unwrap_or(false))
        });
        let bitmap = encode_filament_bitmap(zones);

        if let Err(e) = self.link.send_filament_status(all_known, bitmap) {
            warn!(error = %e, "Failed to send filament status response");
        }
    }

    fn reply_mapping(&self) {
        if !self.commands_allowed() {
            return;
        }
        let pairs = self.config.extruder_mapping.pairs();
        if let Err(e) = self.link.send_mapping_response(&pairs) {
            warn!(error = %e, "Failed to send mapping response");
        }
    }

    /// 起始包里挤出机可能是 0xFF（未映射），此时经料管映射反查
    fn resolve_extruder(&self, extruder: u8, channel: u8) -> Option<u8> {
        if extruder != EXTRUDER_UNMAPPED {
            return Some(extruder);
        }
        self.config.extruder_mapping.extruder_for_zone(channel)
    }
}

/// 停机协调：触发即丢弃发送端，让所有接收端克隆同时观察到断开
///
/// crossbeam 通道不是广播通道，发一条消息只会被一个接收端消费；
/// 断开是所有克隆都能看到的事件，因此以断开作为停机信号。
pub struct ShutdownSignal {
    tx: parking_lot::Mutex<Option<Sender<()>>>,
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSignal, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            ShutdownSignal {
                tx: parking_lot::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// 触发停机（幂等）
    pub fn trigger(&self) {
        self.tx.lock().take();
    }
}
