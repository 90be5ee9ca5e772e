//! Klipper/Moonraker 观察者
//!
//! 通过 Moonraker WebSocket 订阅打印机状态（打印状态、断料传感器、
//! 活动挤出机），并提供暂停 / 恢复 / 取消 / 执行 G-code 动作原语。
//!
//! WebSocket 由单一线程独占：循环内交替做带超时的读取与命令通道
//! 排空，动作调用方从不直接触碰连接。连接失败按指数退避重连，
//! 连续失败次数随事件上报，阈值判定交给编排层。

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde_json::{json, Value};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// 打印机打印状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
    Unknown,
}

impl PrintState {
    pub fn from_report(s: &str) -> Self {
        match s {
            "standby" | "ready" => PrintState::Standby,
            "printing" => PrintState::Printing,
            "paused" => PrintState::Paused,
            "complete" => PrintState::Complete,
            "cancelled" => PrintState::Cancelled,
            "error" | "shutdown" => PrintState::Error,
            _ => PrintState::Unknown,
        }
    }
}

/// 观察者事件（供编排层消费）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    /// WebSocket 已连接并完成订阅
    Connected,
    /// 连接断开，进入重连
    Disconnected,
    /// 连接尝试失败；`consecutive` 为连续失败次数
    ConnectFailed { consecutive: u32 },
    /// 打印状态变化
    PrintState(PrintState),
    /// 断料传感器状态变化
    SensorChange { extruder: u8, detected: bool },
}

/// 打印机动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KlipperCommand {
    Pause,
    Resume,
    Cancel,
    RunGcode(String),
}

/// 打印机状态快照（观察者线程写，任意线程读）
#[derive(Debug, Clone)]
pub struct PrinterSnapshot {
    pub print_state: PrintState,
    /// 按挤出机号索引的断料传感器读数；None 表示尚未上报
    pub filament_detected: Vec<Option<bool>>,
    pub active_extruder: u8,
}

impl PrinterSnapshot {
    fn new(extruder_count: usize) -> Self {
        Self {
            print_state: PrintState::Unknown,
            filament_detected: vec![None; extruder_count],
            active_extruder: 0,
        }
    }
}

/// 监控的断料传感器
#[derive(Debug, Clone)]
pub struct SensorBinding {
    /// Klipper 配置中的传感器名（`filament_switch_sensor <name>`）
    pub name: String,
    pub extruder: u8,
}

/// 观察者配置
#[derive(Debug, Clone)]
pub struct KlipperObserverConfig {
    /// Moonraker HTTP 基地址，如 `http://127.0.0.1:7125`
    pub base_url: String,
    /// 周期性主动查询间隔
    pub update_interval: Duration,
    pub sensors: Vec<SensorBinding>,
    pub extruder_count: usize,
}

#[derive(Error, Debug)]
enum WsError {
    #[error("WebSocket error: {0}")]
    Socket(#[from] Box<tungstenite::Error>),
}

/// 由 HTTP 基地址推导 WebSocket 地址
pub fn websocket_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", trimmed)
    };
    format!("{}/websocket", ws_base)
}

/// 状态报文解析器：把 Moonraker 的动态 JSON 归一化为类型化事件
///
/// 与网络解耦，便于单测。
struct StatusTracker {
    sensors: Vec<SensorBinding>,
    snapshot: Arc<ArcSwap<PrinterSnapshot>>,
}

impl StatusTracker {
    fn new(sensors: Vec<SensorBinding>, snapshot: Arc<ArcSwap<PrinterSnapshot>>) -> Self {
        Self { sensors, snapshot }
    }

    /// 处理一条 status 对象，返回派生出的事件
    fn apply_status(&mut self, status: &Value) -> Vec<ObserverEvent> {
        let mut events = Vec::new();
        let current = self.snapshot.load_full();
        let mut next = (*current).clone();

        if let Some(state) = status
            .get("print_stats")
            .and_then(|ps| ps.get("state"))
            .and_then(Value::as_str)
        {
            let parsed = PrintState::from_report(state);
            if parsed != next.print_state {
                info!(from = ?next.print_state, to = ?parsed, "Printer state changed");
                next.print_state = parsed;
                events.push(ObserverEvent::PrintState(parsed));
            }
        }

        if let Some(extruder) = status
            .get("toolhead")
            .and_then(|th| th.get("extruder"))
            .and_then(Value::as_str)
        {
            // "extruder" -> 0, "extruder1" -> 1
            let index = extruder
                .strip_prefix("extruder")
                .and_then(|suffix| {
                    if suffix.is_empty() {
                        Some(0)
                    } else {
                        suffix.parse::<u8>().ok()
                    }
                })
                .unwrap_or(next.active_extruder);
            next.active_extruder = index;
        }

        for sensor in &self.sensors {
            let key = format!("filament_switch_sensor {}", sensor.name);
            if let Some(detected) = status
                .get(&key)
                .and_then(|s| s.get("filament_detected"))
                .and_then(Value::as_bool)
            {
                let slot = sensor.extruder as usize;
                if slot < next.filament_detected.len()
                    && next.filament_detected[slot] != Some(detected)
                {
                    info!(
                        sensor = %sensor.name,
                        extruder = sensor.extruder,
                        detected,
                        "Filament sensor changed"
                    );
                    next.filament_detected[slot] = Some(detected);
                    events.push(ObserverEvent::SensorChange {
                        extruder: sensor.extruder,
                        detected,
                    });
                }
            }
        }

        self.snapshot.store(Arc::new(next));
        events
    }

    /// 处理一条完整的 WebSocket JSON-RPC 报文
    fn apply_message(&mut self, msg: &Value) -> Vec<ObserverEvent> {
        if msg.get("method").and_then(Value::as_str) == Some("notify_status_update") {
            if let Some(status) = msg.get("params").and_then(|p| p.get(0)) {
                return self.apply_status(status);
            }
        }
        if let Some(status) = msg.get("result").and_then(|r| r.get("status")) {
            return self.apply_status(status);
        }
        Vec::new()
    }
}

/// 观察者动作句柄（编排层持有）
#[derive(Clone)]
pub struct KlipperHandle {
    cmd_tx: Sender<KlipperCommand>,
    snapshot: Arc<ArcSwap<PrinterSnapshot>>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionError {
    #[error("Observer not running")]
    NotRunning,
    #[error("Action queue full")]
    QueueFull,
}

impl KlipperHandle {
    fn dispatch(&self, cmd: KlipperCommand) -> Result<(), ActionError> {
        match self.cmd_tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ActionError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ActionError::NotRunning),
        }
    }

    pub fn pause_print(&self) -> Result<(), ActionError> {
        self.dispatch(KlipperCommand::Pause)
    }

    pub fn resume_print(&self) -> Result<(), ActionError> {
        self.dispatch(KlipperCommand::Resume)
    }

    pub fn cancel_print(&self) -> Result<(), ActionError> {
        self.dispatch(KlipperCommand::Cancel)
    }

    pub fn run_gcode(&self, line: impl Into<String>) -> Result<(), ActionError> {
        self.dispatch(KlipperCommand::RunGcode(line.into()))
    }

    /// 当前打印机状态快照
    pub fn snapshot(&self) -> Arc<PrinterSnapshot> {
        self.snapshot.load_full()
    }
}

#[cfg(test)]
pub(crate) fn test_klipper_handle(
    extruder_count: usize,
) -> (
    KlipperHandle,
    Receiver<KlipperCommand>,
    Arc<ArcSwap<PrinterSnapshot>>,
) {
    let (cmd_tx, cmd_rx) = bounded(16);
    let snapshot = Arc::new(ArcSwap::from_pointee(PrinterSnapshot::new(extruder_count)));
    (
        KlipperHandle {
            cmd_tx,
            snapshot: snapshot.clone(),
        },
        cmd_rx,
        snapshot,
    )
}

/// 观察者后台线程
pub struct KlipperObserver {
    thread: JoinHandle<()>,
}

impl KlipperObserver {
    pub fn spawn(
        config: KlipperObserverConfig,
        events: Sender<ObserverEvent>,
        shutdown: Receiver<()>,
    ) -> (KlipperObserver, KlipperHandle) {
        let snapshot = Arc::new(ArcSwap::from_pointee(PrinterSnapshot::new(
            config.extruder_count,
        )));
        let (cmd_tx, cmd_rx) = bounded::<KlipperCommand>(16);

        let handle = KlipperHandle {
            cmd_tx,
            snapshot: snapshot.clone(),
        };

        let thread = thread::Builder::new()
            .name("klipper-ws".into())
            .spawn(move || observer_loop(config, snapshot, events, cmd_rx, shutdown))
            .expect("failed to spawn klipper-ws thread");

        (KlipperObserver { thread }, handle)
    }

    pub fn shutdown(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.thread.is_finished() {
            let _ = self.thread.join();
        } else {
            warn!("Klipper observer thread did not stop in time, detaching");
        }
    }
}

const WS_READ_TIMEOUT: Duration = Duration::from_millis(100);
const RECONNECT_START: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

fn observer_loop(
    config: KlipperObserverConfig,
    snapshot: Arc<ArcSwap<PrinterSnapshot>>,
    events: Sender<ObserverEvent>,
    cmd_rx: Receiver<KlipperCommand>,
    shutdown: Receiver<()>,
) {
    let url = websocket_url(&config.base_url);
    let mut tracker = StatusTracker::new(config.sensors.clone(), snapshot);
    let mut backoff = RECONNECT_START;
    let mut consecutive_failures: u32 = 0;

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected) => break,
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }

        let mut ws = match connect(&url, &config) {
            Ok(ws) => ws,
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    error = %e,
                    attempt = consecutive_failures,
                    "Failed to connect to Moonraker"
                );
                if events
                    .send(ObserverEvent::ConnectFailed {
                        consecutive: consecutive_failures,
                    })
                    .is_err()
                {
                    break;
                }
                match shutdown.recv_timeout(backoff) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue;
            }
        };

        info!(url = %url, "Moonraker WebSocket connected");
        consecutive_failures = 0;
        backoff = RECONNECT_START;
        if events.send(ObserverEvent::Connected).is_err() {
            break;
        }

        match session_loop(
            &mut ws,
            &config,
            &mut tracker,
            &events,
            &cmd_rx,
            &shutdown,
        ) {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost => {
                // 断开后清空状态缓存，重连后重新同步
                tracker
                    .snapshot
                    .store(Arc::new(PrinterSnapshot::new(config.extruder_count)));
                if events.send(ObserverEvent::Disconnected).is_err() {
                    break;
                }
                match shutdown.recv_timeout(backoff) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
    info!("Klipper observer stopped");
}

type Ws = WebSocket<MaybeTlsStream<TcpStream>>;

fn connect(url: &str, config: &KlipperObserverConfig) -> Result<Ws, WsError> {
    let (mut ws, _response) = tungstenite::connect(url).map_err(Box::new)?;

    // 读超时让循环能交替排空命令通道；依赖 SO_RCVTIMEO 而非非阻塞模式
    if let MaybeTlsStream::Plain(stream) = ws.get_mut() {
        let _ = stream.set_read_timeout(Some(WS_READ_TIMEOUT));
    }

    let mut request_id: u64 = 0;
    send_rpc(&mut ws, &mut request_id, "printer.objects.subscribe", subscribe_params(config))?;
    send_rpc(&mut ws, &mut request_id, "printer.objects.query", subscribe_params(config))?;
    Ok(ws)
}

/// 订阅/查询的对象集合：打印状态、工具头与全部断料传感器
fn subscribe_params(config: &KlipperObserverConfig) -> Value {
    let mut objects = serde_json::Map::new();
    objects.insert("print_stats".into(), Value::Null);
    objects.insert("toolhead".into(), json!(["extruder"]));
    for sensor in &config.sensors {
        objects.insert(
            format!("filament_switch_sensor {}", sensor.name),
            Value::Null,
        );
    }
    json!({ "objects": Value::Object(objects) })
}

fn send_rpc(ws: &mut Ws, request_id: &mut u64, method: &str, params: Value) -> Result<(), WsError> {
    *request_id += 1;
    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": *request_id,
    });
    ws.send(Message::Text(request.to_string().into()))
        .map_err(Box::new)?;
    Ok(())
}

enum SessionEnd {
    Lost,
    Shutdown,
}

fn session_loop(
    ws: &mut Ws,
    config: &KlipperObserverConfig,
    tracker: &mut StatusTracker,
    events: &Sender<ObserverEvent>,
    cmd_rx: &Receiver<KlipperCommand>,
    shutdown: &Receiver<()>,
) -> SessionEnd {
    let mut request_id: u64 = 100;
    let mut last_query = Instant::now();

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected) => {
                let _ = ws.close(None);
                return SessionEnd::Shutdown;
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }

        // 排空动作命令
        while let Ok(cmd) = cmd_rx.try_recv() {
            let script = match cmd {
                KlipperCommand::Pause => "PAUSE".to_string(),
                KlipperCommand::Resume => "RESUME".to_string(),
                KlipperCommand::Cancel => "CANCEL_PRINT".to_string(),
                KlipperCommand::RunGcode(line) => line,
            };
            debug!(script = %script, "Sending G-code to Klipper");
            if let Err(e) = send_rpc(
                ws,
                &mut request_id,
                "printer.gcode.script",
                json!({ "script": script }),
            ) {
                warn!(error = %e, "Failed to send G-code, connection lost");
                return SessionEnd::Lost;
            }
        }

        // 周期性主动查询，兜底订阅推送丢失
        if last_query.elapsed() >= config.update_interval {
            last_query = Instant::now();
            if send_rpc(
                ws,
                &mut request_id,
                "printer.objects.query",
                subscribe_params(config),
            )
            .is_err()
            {
                return SessionEnd::Lost;
            }
        }

        // 带超时读取
        match ws.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(msg) => {
                    for event in tracker.apply_message(&msg) {
                        if events.send(event).is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Unparsable WebSocket message"),
            },
            Ok(Message::Ping(_)) => {
                // tungstenite 已排队 Pong，flush 促发
                let _ = ws.flush();
            }
            Ok(Message::Close(_)) => {
                info!("Moonraker closed the WebSocket");
                return SessionEnd::Lost;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // 读超时：正常轮询节拍
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return SessionEnd::Lost;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                return SessionEnd::Lost;
            }
        }
    }
}
