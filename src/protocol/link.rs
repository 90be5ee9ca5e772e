//! 链路生命周期管理
//!
//! 状态机：`Closed -> Connecting -> Handshaking -> Up ->
//! (Reconnecting -> Handshaking)* -> Closed`。
//!
//! 线程划分（每个长期职责一个线程）：
//! - 控制/RX 线程：建连、握手、接收分发、链路活性监测、触发重连
//! - TX 线程：独占发送端，排空出站队列并按节拍发送心跳
//! - Reaper 线程：定期清理无进展的 RFID 会话
//!
//! 入站帧在 RX 线程解码后以 [`ProtocolEvent`] 投递给编排层，
//! RX 线程自身从不触碰系统状态。

use crate::can::{CanError, FeederFrame, RxTransport, SplittableTransport, TxTransport};
use crate::protocol::ids::*;
use crate::protocol::messages::{self, CabinetMessage};
use crate::protocol::rfid::{RfidEvent, RfidReassembler};
use crate::protocol::ProtocolError;
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Closed = 0,
    Connecting = 1,
    Handshaking = 2,
    Up = 3,
    Reconnecting = 4,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Handshaking,
            3 => LinkState::Up,
            4 => LinkState::Reconnecting,
            _ => LinkState::Closed,
        }
    }
}

/// 协议层对外事件流
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// 握手完成，链路可用
    LinkUp,
    /// 链路失效，进入重连
    LinkDown,
    /// 不可恢复错误（协议版本不匹配），不再重试
    Fatal(ProtocolError),
    /// 非 RFID 入站消息（查询、状态、映射、断料通知）
    Message(CabinetMessage),
    /// RFID 重组事件
    Rfid(RfidEvent),
}

/// 出站发送失败
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// 链路未就绪；心跳直接丢弃，命令由调用方决定
    #[error("Link is not up")]
    TransportDown,
    /// 出站队列已满
    #[error("Outbound queue full")]
    QueueFull,
    /// 参数越界（帧未发送）
    #[error("Invalid argument")]
    InvalidArgument,
}

/// 链路配置
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// 握手请求重发间隔
    pub handshake_retry: Duration,
    /// 握手整体时限，超时走重连
    pub handshake_deadline: Duration,
    /// 心跳周期
    pub heartbeat_interval: Duration,
    /// 无任何入站帧判定链路陈旧的时限
    pub stale_after: Duration,
    /// 重连退避起点 / 上限（指数递增）
    pub backoff_start: Duration,
    pub backoff_cap: Duration,
    /// RFID 会话无进展超时
    pub rfid_timeout: Duration,
    /// RFID 会话清理周期
    pub rfid_cleanup_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_retry: Duration::from_millis(500),
            handshake_deadline: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(5),
            backoff_start: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            rfid_timeout: Duration::from_secs(10),
            rfid_cleanup_interval: Duration::from_secs(5),
        }
    }
}

/// 出站队列条目：命令帧带重试配额，心跳不入队
pub(crate) struct Outbound {
    pub(crate) frame: FeederFrame,
    pub(crate) retries: u8,
}

/// 命令发送重试间隔
const SEND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// 出站队列深度
const OUTBOUND_QUEUE: usize = 32;

/// 链路操作句柄（编排层持有）
///
/// 所有命令经由单一 FIFO 队列进入 TX 线程，保证同一 ID 上的
/// 发送顺序与调用顺序一致。
#[derive(Clone)]
pub struct LinkHandle {
    out_tx: Sender<Outbound>,
    state: Arc<AtomicU8>,
    seq: Arc<AtomicU8>,
}

impl LinkHandle {
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == LinkState::Up
    }

    /// 序列计数器：模 256 递增，用于需要关联应答的出站消息
    fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, frame: FeederFrame, retries: u8) -> Result<(), SendError> {
        if !self.is_up() {
            return Err(SendError::TransportDown);
        }
        match self.out_tx.try_send(Outbound { frame, retries }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SendError::TransportDown),
        }
    }

    /// 请求送料（传输错误重试 3 次）
    pub fn request_feed(&self, extruder: u8, force: bool) -> Result<(), SendError> {
        self.enqueue(messages::request_feed(extruder, force), 3)
    }

    /// 取消送料
    pub fn cancel_feed(&self, extruder: u8) -> Result<(), SendError> {
        self.enqueue(messages::cancel_feed(extruder), 0)
    }

    /// 打印状态通知（0x04-0x09）
    pub fn notify_print_state(&self, cmd: u8, extruder: u8) -> Result<(), SendError> {
        self.enqueue(messages::notify_print_state(cmd, extruder), 0)
    }

    /// 余料状态响应（0x0D / 旧版 0x03 查询的同步应答）
    pub fn send_filament_status(&self, valid: bool, bitmap: u8) -> Result<(), SendError> {
        self.enqueue(messages::filament_status_response(valid, bitmap), 0)
    }

    /// 料管映射响应
    pub fn send_mapping_response(&self, mapping: &[(u8, u8)]) -> Result<(), SendError> {
        self.enqueue(messages::mapping_response(mapping), 0)
    }

    /// 请求 RFID 原始数据
    pub fn request_rfid_data(&self, extruder: u8) -> Result<(), SendError> {
        let seq = self.next_seq();
        self.enqueue(messages::rfid_request(seq, extruder), 0)
    }

    /// 回退耗材
    pub fn retract_filament(
        &self,
        buffer: u8,
        distance_gear: u8,
        speed_gear: u8,
    ) -> Result<(), SendError> {
        let frame = messages::retract_filament(buffer, distance_gear, speed_gear)
            .map_err(|_| SendError::InvalidArgument)?;
        self.enqueue(frame, 0)
    }
}

#[cfg(test)]
pub(crate) fn test_link_handle(state: LinkState) -> (LinkHandle, Receiver<Outbound>) {
    let (out_tx, out_rx) = bounded(OUTBOUND_QUEUE);
    (
        LinkHandle {
            out_tx,
            state: Arc::new(AtomicU8::new(state as u8)),
            seq: Arc::new(AtomicU8::new(0)),
        },
        out_rx,
    )
}

/// 链路引擎：持有后台线程句柄
pub struct LinkEngine {
    control: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl LinkEngine {
    /// 启动链路。`factory` 在每次（重）连接时创建一个新的传输实例。
    pub fn spawn<T, F>(
        factory: F,
        config: LinkConfig,
        events: Sender<ProtocolEvent>,
        shutdown: Receiver<()>,
    ) -> (LinkEngine, LinkHandle)
    where
        T: SplittableTransport + Send + 'static,
        F: Fn() -> Result<T, CanError> + Send + 'static,
    {
        let (out_tx, out_rx) = bounded::<Outbound>(OUTBOUND_QUEUE);
        let state = Arc::new(AtomicU8::new(LinkState::Closed as u8));
        let seq = Arc::new(AtomicU8::new(0));
        let reassembler = Arc::new(Mutex::new(RfidReassembler::new(config.rfid_timeout)));

        let handle = LinkHandle {
            out_tx,
            state: state.clone(),
            seq,
        };

        let reaper = {
            let reassembler = reassembler.clone();
            let events = events.clone();
            let shutdown = shutdown.clone();
            let interval = config.rfid_cleanup_interval;
            thread::Builder::new()
                .name("rfid-reaper".into())
                .spawn(move || reaper_loop(reassembler, events, shutdown, interval))
                .expect("failed to spawn rfid-reaper thread")
        };

        let control = thread::Builder::new()
            .name("can-link".into())
            .spawn(move || {
                control_loop(factory, config, events, shutdown, out_rx, state, reassembler)
            })
            .expect("failed to spawn can-link thread");

        (LinkEngine { control, reaper }, handle)
    }

    /// 等待后台线程退出；超时后放弃等待（线程将随进程终止）
    pub fn shutdown(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for handle in [self.control, self.reaper] {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Link thread did not stop in time, detaching");
                break;
            }
        }
    }
}

fn reaper_loop(
    reassembler: Arc<Mutex<RfidReassembler>>,
    events: Sender<ProtocolEvent>,
    shutdown: Receiver<()>,
    interval: Duration,
) {
    loop {
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let expired = reassembler.lock().reap_expired(Instant::now());
        for event in expired {
            if events.send(ProtocolEvent::Rfid(event)).is_err() {
                return;
            }
        }
    }
    debug!("RFID reaper stopped");
}

enum ConnectionOutcome {
    /// 链路失效，按退避重连
    Retry,
    /// 进程停机或事件通道关闭
    Shutdown,
    /// 协议版本不匹配，放弃该链路
    Fatal,
}

#[allow(clippy::too_many_arguments)]
fn control_loop<T, F>(
    factory: F,
    config: LinkConfig,
    events: Sender<ProtocolEvent>,
    shutdown: Receiver<()>,
    out_rx: Receiver<Outbound>,
    state: Arc<AtomicU8>,
    reassembler: Arc<Mutex<RfidReassembler>>,
) where
    T: SplittableTransport + Send + 'static,
    F: Fn() -> Result<T, CanError> + Send,
{
    let set_state = |s: LinkState| state.store(s as u8, Ordering::Release);
    let mut backoff = config.backoff_start;
    let mut was_up = false;

    loop {
        set_state(LinkState::Connecting);
        let outcome = match factory() {
            Ok(transport) => run_connection(
                transport,
                &config,
                &events,
                &shutdown,
                &out_rx,
                &state,
                &reassembler,
                &mut was_up,
            ),
            Err(e) => {
                warn!(error = %e, "Failed to open CAN transport");
                ConnectionOutcome::Retry
            }
        };

        match outcome {
            ConnectionOutcome::Shutdown => break,
            ConnectionOutcome::Fatal => {
                // 版本不匹配无法靠重连修复；保持退出前静默待机
                set_state(LinkState::Closed);
                let _ = shutdown.recv();
                break;
            }
            ConnectionOutcome::Retry => {
                set_state(LinkState::Reconnecting);
                if was_up {
                    // 本次连接握手成功过：退避重置回起点
                    backoff = config.backoff_start;
                    was_up = false;
                    if events.send(ProtocolEvent::LinkDown).is_err() {
                        break;
                    }
                }
                info!(backoff_secs = backoff.as_secs(), "Reconnecting after backoff");
                match shutdown.recv_timeout(backoff) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                backoff = (backoff * 2).min(config.backoff_cap);
            }
        }
    }

    set_state(LinkState::Closed);
    info!("CAN link closed");
}

/// 单次连接的完整生命周期：握手 -> Up -> 失效
#[allow(clippy::too_many_arguments)]
fn run_connection<T>(
    transport: T,
    config: &LinkConfig,
    events: &Sender<ProtocolEvent>,
    shutdown: &Receiver<()>,
    out_rx: &Receiver<Outbound>,
    state: &Arc<AtomicU8>,
    reassembler: &Arc<Mutex<RfidReassembler>>,
    was_up: &mut bool,
) -> ConnectionOutcome
where
    T: SplittableTransport,
{
    let (mut rx, mut tx) = match transport.split() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "Failed to split CAN transport");
            return ConnectionOutcome::Retry;
        }
    };

    state.store(LinkState::Handshaking as u8, Ordering::Release);
    match perform_handshake(&mut rx, &mut tx, config, shutdown) {
        Ok(()) => {}
        Err(HandshakeFailure::Shutdown) => return ConnectionOutcome::Shutdown,
        Err(HandshakeFailure::Timeout) => {
            warn!("Handshake timed out");
            return ConnectionOutcome::Retry;
        }
        Err(HandshakeFailure::Transport(e)) => {
            warn!(error = %e, "Transport failed during handshake");
            return ConnectionOutcome::Retry;
        }
        Err(HandshakeFailure::VersionMismatch { expected, actual }) => {
            error!(
                expected = format_args!("0x{:02X}", expected),
                actual = format_args!("0x{:02X}", actual),
                "Cabinet protocol version mismatch"
            );
            let _ = events.send(ProtocolEvent::Fatal(ProtocolError::VersionMismatch {
                expected,
                actual,
            }));
            return ConnectionOutcome::Fatal;
        }
    }

    info!("Handshake complete, link up");
    state.store(LinkState::Up as u8, Ordering::Release);
    *was_up = true;
    if events.send(ProtocolEvent::LinkUp).is_err() {
        return ConnectionOutcome::Shutdown;
    }

    // 连接内停止信号：控制线程丢弃发送端即可令 TX 线程退出
    let (conn_stop_tx, conn_stop_rx) = bounded::<()>(0);
    let conn_failed = Arc::new(AtomicBool::new(false));

    let tx_thread = {
        let out_rx = out_rx.clone();
        let conn_failed = conn_failed.clone();
        let heartbeat_interval = config.heartbeat_interval;
        thread::Builder::new()
            .name("can-tx".into())
            .spawn(move || tx_loop(tx, out_rx, conn_stop_rx, conn_failed, heartbeat_interval))
            .expect("failed to spawn can-tx thread")
    };

    let outcome = rx_loop(
        &mut rx,
        config,
        events,
        shutdown,
        &conn_failed,
        reassembler,
    );

    drop(conn_stop_tx);
    let _ = tx_thread.join();
    outcome
}

enum HandshakeFailure {
    Timeout,
    VersionMismatch { expected: u8, actual: u8 },
    Transport(CanError),
    Shutdown,
}

/// 握手：每 500ms 重发请求，10s 未得到有效响应判超时
fn perform_handshake<R: RxTransport, W: TxTransport>(
    rx: &mut R,
    tx: &mut W,
    config: &LinkConfig,
    shutdown: &Receiver<()>,
) -> Result<(), HandshakeFailure> {
    let request = FeederFrame::new(HANDSHAKE_TX_ID, &HANDSHAKE_REQUEST);
    let started = Instant::now();

    tx.send(request).map_err(HandshakeFailure::Transport)?;
    let mut last_sent = Instant::now();
    debug!("Handshake request sent");

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected) => {
                return Err(HandshakeFailure::Shutdown)
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }
        if started.elapsed() >= config.handshake_deadline {
            return Err(HandshakeFailure::Timeout);
        }
        if last_sent.elapsed() >= config.handshake_retry {
            tx.send(request).map_err(HandshakeFailure::Transport)?;
            last_sent = Instant::now();
        }

        match rx.receive() {
            Ok(frame) if frame.id == HANDSHAKE_RX_ID => {
                let data = frame.data_slice();
                if data.is_empty() {
                    continue;
                }
                if data[0] == PROTOCOL_VERSION {
                    return Ok(());
                }
                return Err(HandshakeFailure::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: data[0],
                });
            }
            Ok(frame) => {
                debug!(id = frame.id, "Ignoring frame during handshake");
            }
            Err(CanError::Timeout) => {}
            Err(e) => return Err(HandshakeFailure::Transport(e)),
        }
    }
}

/// RX 循环：接收、解码、分发，并监测链路活性
fn rx_loop<R: RxTransport>(
    rx: &mut R,
    config: &LinkConfig,
    events: &Sender<ProtocolEvent>,
    shutdown: &Receiver<()>,
    conn_failed: &AtomicBool,
    reassembler: &Arc<Mutex<RfidReassembler>>,
) -> ConnectionOutcome {
    let mut last_rx = Instant::now();

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected) => {
                return ConnectionOutcome::Shutdown
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }
        if conn_failed.load(Ordering::Acquire) {
            warn!("TX thread reported transport failure");
            return ConnectionOutcome::Retry;
        }

        let frame = match rx.receive() {
            Ok(frame) => frame,
            Err(CanError::Timeout) => {
                // 5s 内连心跳应答都没有，判定链路陈旧
                if last_rx.elapsed() >= config.stale_after {
                    warn!(
                        silent_secs = last_rx.elapsed().as_secs(),
                        "No inbound frames, link is stale"
                    );
                    return ConnectionOutcome::Retry;
                }
                continue;
            }
            Err(e) => {
                error!(error = %e, "CAN receive error");
                return ConnectionOutcome::Retry;
            }
        };

        // 任何入站帧都刷新活性，包括握手 ID 与心跳应答
        last_rx = Instant::now();

        if frame.id != CABINET_TO_PRINTER_ID {
            debug!(id = frame.id, "Ignoring non-command frame");
            continue;
        }

        let msg = match messages::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                // 格式错误的帧记录后丢弃，不影响链路
                warn!(error = %e, data = ?frame.data_slice(), "Malformed frame dropped");
                continue;
            }
        };

        let forward_ok = match &msg {
            CabinetMessage::HeartbeatAck => true,
            CabinetMessage::RfidNotifyStart(_)
            | CabinetMessage::RfidResponseStart(_)
            | CabinetMessage::RfidData { .. }
            | CabinetMessage::RfidEnd { .. }
            | CabinetMessage::RfidError { .. } => {
                let rfid_events = reassembler.lock().handle_message(&msg);
                rfid_events
                    .into_iter()
                    .all(|e| events.send(ProtocolEvent::Rfid(e)).is_ok())
            }
            _ => events.send(ProtocolEvent::Message(msg.clone())).is_ok(),
        };
        if !forward_ok {
            // 事件通道关闭等价于停机
            return ConnectionOutcome::Shutdown;
        }
    }
}

/// TX 循环：排空出站队列并按节拍发送心跳
///
/// 心跳到点而队列非空时，当前命令发送完立即补发心跳，
/// 等价于把心跳插到队首。
fn tx_loop<W: TxTransport>(
    mut tx: W,
    out_rx: Receiver<Outbound>,
    conn_stop: Receiver<()>,
    conn_failed: Arc<AtomicBool>,
    heartbeat_interval: Duration,
) {
    let heartbeat_tick = tick(heartbeat_interval);

    loop {
        crossbeam_channel::select! {
            recv(conn_stop) -> _ => break,
            recv(heartbeat_tick) -> _ => {
                // 心跳失败不重试：丢一个心跳无妨，连续失败由活性监测兜底
                if let Err(e) = tx.send(messages::heartbeat()) {
                    warn!(error = %e, "Heartbeat send failed");
                    if e.is_fatal() {
                        conn_failed.store(true, Ordering::Release);
                        break;
                    }
                }
            }
            recv(out_rx) -> msg => {
                let out = match msg {
                    Ok(out) => out,
                    Err(_) => break,
                };
                if !send_with_retry(&mut tx, &out, &conn_failed) {
                    break;
                }
                // 命令发送期间心跳到点：立即补发
                if heartbeat_tick.try_recv().is_ok() {
                    if let Err(e) = tx.send(messages::heartbeat()) {
                        warn!(error = %e, "Heartbeat send failed");
                        if e.is_fatal() {
                            conn_failed.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("TX loop stopped");
}

/// 命令帧发送，失败按配额重试；重试耗尽标记链路失效
fn send_with_retry<W: TxTransport>(
    tx: &mut W,
    out: &Outbound,
    conn_failed: &AtomicBool,
) -> bool {
    let attempts = out.retries as usize + 1;
    for attempt in 1..=attempts {
        match tx.send(out.frame) {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    error = %e,
                    attempt,
                    attempts,
                    id = out.frame.id,
                    "Command send failed"
                );
                if attempt < attempts {
                    thread::sleep(SEND_RETRY_DELAY);
                }
            }
        }
    }
    conn_failed.store(true, Ordering::Release);
    false
}
