//! RFID 分包传输重组
//!
//! 送料柜把最长 256 字节的标签负载切成 4 字节数据包传输：
//! 起始包（0x14 / 0x16）声明总包数与总长度，数据包（0x17）按
//! `packet_no` 落到 `(packet_no - 1) * 4` 偏移，结束包（0x18）携带
//! 16 位累加和。会话以挤出机为键：同一挤出机同一时刻至多一个活动
//! 会话，新的起始包取代旧会话（序列号相同视为重传重启）。
//!
//! 容错取向：单个数据包异常（未知序列号、包号越界、有效字节数超出
//! 剩余空间）只丢弃该包不中止会话——送料柜会重传；只有校验和/长度
//! 不一致、重复包数据冲突、超时与 0x19 错误帧才中止会话。

use crate::protocol::ids::EXTRUDER_UNMAPPED;
use crate::protocol::messages::{CabinetMessage, RfidSource, RfidStart};
use crate::protocol::opentag::{self, OpenTagFilament};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 每个数据包携带的最大字节数
const PACKET_CHUNK: usize = 4;

/// 会话中止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAbortReason {
    /// 累加和不一致（含重复包数据冲突）
    ChecksumError { expected: u16, actual: u16 },
    /// 字节数或包数与起始包声明不一致
    LengthMismatch { expected: u16, actual: u16 },
    /// 超过无进展时限
    TransferTimeout,
    /// 被同一挤出机的新起始包取代
    Superseded,
    /// 送料柜上报读取错误（0x19）
    CabinetError { code: u8, ext_code: u8 },
}

/// 重组器对外事件
#[derive(Debug, Clone, PartialEq)]
pub enum RfidEvent {
    TransferStarted {
        seq: u8,
        extruder: u8,
        channel: u8,
        expected_len: u16,
    },
    TransferComplete {
        seq: u8,
        extruder: u8,
        channel: u8,
        source: RfidSource,
        raw: Vec<u8>,
        /// 空传输或负载不是合法 OpenTag 记录时为 None
        record: Option<OpenTagFilament>,
    },
    TransferAborted {
        seq: u8,
        extruder: u8,
        channel: u8,
        reason: SessionAbortReason,
    },
    /// 0x19 错误帧透传（会话如存在已被取消）
    ReadError {
        seq: u8,
        extruder: u8,
        code: u8,
        ext_code: u8,
    },
}

/// 单次传输会话
#[derive(Debug)]
struct Session {
    seq: u8,
    extruder: u8,
    channel: u8,
    total_packets: u8,
    expected_len: u16,
    source: RfidSource,
    /// 槽位按包号索引（0 起），每槽最多 4 字节
    slots: Vec<Option<Vec<u8>>>,
    received_bytes: usize,
    started_at: Instant,
    last_progress: Instant,
}

impl Session {
    fn new(start: &RfidStart, now: Instant) -> Self {
        Self {
            seq: start.seq,
            extruder: start.extruder,
            channel: start.channel,
            total_packets: start.total_packets,
            expected_len: start.expected_len,
            source: start.source,
            slots: vec![None; start.total_packets as usize],
            received_bytes: 0,
            started_at: now,
            last_progress: now,
        }
    }

    /// 槽位 index（0 起）允许的最大字节数：末尾槽可能不满 4 字节
    fn slot_capacity(&self, index: usize) -> usize {
        let consumed = index * PACKET_CHUNK;
        (self.expected_len as usize)
            .saturating_sub(consumed)
            .min(PACKET_CHUNK)
    }

    /// 按槽位顺序拼接已收数据
    fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.expected_len as usize);
        for slot in self.slots.iter().flatten() {
            out.extend_from_slice(slot);
        }
        out
    }

    fn abort_event(&self, reason: SessionAbortReason) -> RfidEvent {
        RfidEvent::TransferAborted {
            seq: self.seq,
            extruder: self.extruder,
            channel: self.channel,
            reason,
        }
    }
}

/// 分包重组器
///
/// 由链路 RX 线程独占持有；清理超时会话由定时 reap 驱动。
pub struct RfidReassembler {
    /// 以起始包序列号为主键；挤出机唯一性在插入时保证
    sessions: HashMap<u8, Session>,
    timeout: Duration,
}

impl RfidReassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// 指定挤出机是否有活动会话
    pub fn is_extruder_busy(&self, extruder: u8) -> bool {
        self.sessions.values().any(|s| s.extruder == extruder)
    }

    /// 统一入口：把 RFID 相关的入站消息喂给重组器
    pub fn handle_message(&mut self, msg: &CabinetMessage) -> Vec<RfidEvent> {
        match msg {
            CabinetMessage::RfidNotifyStart(start) | CabinetMessage::RfidResponseStart(start) => {
                self.handle_start(start)
            }
            CabinetMessage::RfidData {
                seq,
                packet_no,
                valid_len,
                data,
            } => self
                .handle_data(*seq, *packet_no, &data[..*valid_len as usize])
                .into_iter()
                .collect(),
            CabinetMessage::RfidEnd {
                seq,
                total_packets,
                checksum,
                ..
            } => self
                .handle_end(*seq, *total_packets, *checksum)
                .into_iter()
                .collect(),
            CabinetMessage::RfidError {
                seq,
                extruder,
                code,
                ext_code,
            } => self.handle_error(*seq, *extruder, *code, *ext_code),
            _ => Vec::new(),
        }
    }

    /// 起始包：取代同一挤出机（或未映射时同一料管）的旧会话
    pub fn handle_start(&mut self, start: &RfidStart) -> Vec<RfidEvent> {
        let mut events = Vec::new();
        let now = Instant::now();

        // 同一序列号的起始包视为重传，重置缓冲重新开始
        let restart = self.sessions.contains_key(&start.seq);

        // 取消同一身份上的旧会话（挤出机同一时刻至多一个会话）。
        // 任一侧挤出机为 0xFF（未映射）时，其身份退化为料管号，
        // 两个方向都按此规则比较，避免映射前后的会话共存。
        let conflicts = |s: &Session| {
            if s.extruder != EXTRUDER_UNMAPPED && start.extruder != EXTRUDER_UNMAPPED {
                s.extruder == start.extruder
            } else {
                s.channel == start.channel
            }
        };
        let stale: Vec<u8> = self
            .sessions
            .values()
            .filter(|&s| s.seq != start.seq && conflicts(s))
            .map(|s| s.seq)
            .collect();
        for seq in stale {
            if let Some(old) = self.sessions.remove(&seq) {
                warn!(
                    seq = old.seq,
                    extruder = old.extruder,
                    "RFID session superseded by new start packet"
                );
                events.push(old.abort_event(SessionAbortReason::Superseded));
            }
        }

        if restart {
            debug!(seq = start.seq, "RFID start retransmitted, restarting session");
        }
        info!(
            seq = start.seq,
            extruder = start.extruder,
            channel = start.channel,
            total_packets = start.total_packets,
            expected_len = start.expected_len,
            "RFID transfer started"
        );
        self.sessions.insert(start.seq, Session::new(start, now));
        events.push(RfidEvent::TransferStarted {
            seq: start.seq,
            extruder: start.extruder,
            channel: start.channel,
            expected_len: start.expected_len,
        });
        events
    }

    /// 数据包：落槽；重复包数据一致则幂等，冲突则中止
    pub fn handle_data(&mut self, seq: u8, packet_no: u8, chunk: &[u8]) -> Option<RfidEvent> {
        let session = match self.sessions.get_mut(&seq) {
            Some(s) => s,
            None => {
                debug!(seq, packet_no, "RFID data for unknown session, dropped");
                return None;
            }
        };

        if packet_no == 0 || packet_no > session.total_packets {
            warn!(
                seq,
                packet_no,
                total = session.total_packets,
                "RFID packet number out of range, dropped"
            );
            return None;
        }

        let index = (packet_no - 1) as usize;
        let capacity = session.slot_capacity(index);
        if chunk.len() > capacity {
            warn!(
                seq,
                packet_no,
                len = chunk.len(),
                capacity,
                "RFID chunk exceeds remaining expected bytes, dropped"
            );
            return None;
        }

        match &session.slots[index] {
            Some(existing) if existing.as_slice() == chunk => {
                // 重传同一包，幂等丢弃
                debug!(seq, packet_no, "Duplicate RFID packet, ignored");
                None
            }
            Some(_) => {
                // 同一包号两次携带不同数据，无法信任缓冲内容
                let actual = session.assemble().iter().map(|&b| b as u16).sum::<u16>();
                let event = session.abort_event(SessionAbortReason::ChecksumError {
                    expected: 0,
                    actual,
                });
                warn!(seq, packet_no, "Conflicting RFID packet payload, session aborted");
                self.sessions.remove(&seq);
                Some(event)
            }
            None => {
                session.slots[index] = Some(chunk.to_vec());
                session.received_bytes += chunk.len();
                session.last_progress = Instant::now();
                None
            }
        }
    }

    /// 结束包：校验包数、长度、累加和，全部通过才解析记录
    pub fn handle_end(&mut self, seq: u8, total_packets: u8, checksum: u16) -> Option<RfidEvent> {
        let session = match self.sessions.remove(&seq) {
            Some(s) => s,
            None => {
                debug!(seq, "RFID end for unknown session, dropped");
                return None;
            }
        };

        if total_packets != session.total_packets {
            warn!(
                seq,
                declared = total_packets,
                expected = session.total_packets,
                "RFID end packet count mismatch"
            );
            return Some(session.abort_event(SessionAbortReason::LengthMismatch {
                expected: session.total_packets as u16,
                actual: total_packets as u16,
            }));
        }

        if session.received_bytes != session.expected_len as usize {
            warn!(
                seq,
                received = session.received_bytes,
                expected = session.expected_len,
                "RFID transfer length mismatch"
            );
            return Some(session.abort_event(SessionAbortReason::LengthMismatch {
                expected: session.expected_len,
                actual: session.received_bytes as u16,
            }));
        }

        let raw = session.assemble();
        let actual: u16 = raw.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
        if actual != checksum {
            warn!(
                seq,
                expected = checksum,
                actual,
                "RFID checksum verification failed"
            );
            return Some(session.abort_event(SessionAbortReason::ChecksumError {
                expected: checksum,
                actual,
            }));
        }

        // 校验通过即传输成功；负载解析不出记录时只降级为无记录完成，
        // 空传输（L = 0）同理
        let record = if raw.is_empty() {
            None
        } else {
            match opentag::parse(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(seq, error = %e, "Payload is not a parsable OpenTag record");
                    None
                }
            }
        };

        info!(
            seq,
            extruder = session.extruder,
            bytes = raw.len(),
            "RFID transfer complete"
        );
        Some(RfidEvent::TransferComplete {
            seq,
            extruder: session.extruder,
            channel: session.channel,
            source: session.source,
            raw,
            record,
        })
    }

    /// 0x19 错误帧：取消该挤出机的活动会话并透传错误
    pub fn handle_error(&mut self, seq: u8, extruder: u8, code: u8, ext_code: u8) -> Vec<RfidEvent> {
        let mut events = Vec::new();
        let stale: Vec<u8> = self
            .sessions
            .values()
            .filter(|s| s.seq == seq || s.extruder == extruder)
            .map(|s| s.seq)
            .collect();
        for stale_seq in stale {
            if let Some(session) = self.sessions.remove(&stale_seq) {
                events.push(
                    session.abort_event(SessionAbortReason::CabinetError { code, ext_code }),
                );
            }
        }
        events.push(RfidEvent::ReadError {
            seq,
            extruder,
            code,
            ext_code,
        });
        events
    }

    /// 清理无进展超时的会话；年龄恰好等于时限的会话同样取消
    pub fn reap_expired(&mut self, now: Instant) -> Vec<RfidEvent> {
        let timeout = self.timeout;
        let expired: Vec<u8> = self
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_progress) >= timeout)
            .map(|s| s.seq)
            .collect();

        let mut events = Vec::new();
        for seq in expired {
            if let Some(session) = self.sessions.remove(&seq) {
                warn!(
                    seq,
                    extruder = session.extruder,
                    age_secs = now.duration_since(session.started_at).as_secs(),
                    "RFID session timed out"
                );
                events.push(session.abort_event(SessionAbortReason::TransferTimeout));
            }
        }
        events
    }

    /// 停机时丢弃全部会话（不产生事件）
    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opentag::MIN_RECORD_LEN;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn start(seq: u8, extruder: u8, channel: u8, len: u16) -> RfidStart {
        RfidStart {
            seq,
            extruder,
            channel,
            total_packets: len.div_ceil(4) as u8,
            expected_len: len,
            source: RfidSource::Rfid,
        }
    }

    /// 按协议规则把负载切成 (包号, 数据块)
    fn fragment(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        data.chunks(PACKET_CHUNK)
            .enumerate()
            .map(|(i, chunk)| ((i + 1) as u8, chunk.to_vec()))
            .collect()
    }

    fn wrapping_sum(data: &[u8]) -> u16 {
        data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
    }

    /// 合法的最小 OpenTag 负载（必需块全零即可解析）
    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn run_transfer(
        r: &mut RfidReassembler,
        s: &RfidStart,
        data: &[u8],
    ) -> Option<RfidEvent> {
        r.handle_start(s);
        for (no, chunk) in fragment(data) {
            assert!(r.handle_data(s.seq, no, &chunk).is_none());
        }
        r.handle_end(s.seq, s.total_packets, wrapping_sum(data))
    }

    #[test]
    fn test_roundtrip_preserves_bytes() {
        // 分包后重组必须逐字节还原
        for len in [1usize, 3, 4, 5, MIN_RECORD_LEN, 148, 255, 256] {
            let mut r = RfidReassembler::new(TIMEOUT);
            let data = payload(len);
            let s = start(1, 0, 0, len as u16);
            match run_transfer(&mut r, &s, &data) {
                Some(RfidEvent::TransferComplete { raw, .. }) => assert_eq!(raw, data),
                other => panic!("len {}: expected completion, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_full_record_parses() {
        let mut r = RfidReassembler::new(TIMEOUT);
        // 必需块可解析的全零负载
        let data = vec![0u8; MIN_RECORD_LEN];
        let s = start(7, 0, 0, MIN_RECORD_LEN as u16);
        match run_transfer(&mut r, &s, &data) {
            Some(RfidEvent::TransferComplete { record, .. }) => {
                assert!(record.is_some());
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(r.active_sessions(), 0);
    }

    #[test]
    fn test_empty_transfer_completes_without_record() {
        // L = 0：一个结束包、零个数据包，产生空记录
        let mut r = RfidReassembler::new(TIMEOUT);
        let s = RfidStart {
            seq: 2,
            extruder: 1,
            channel: 1,
            total_packets: 0,
            expected_len: 0,
            source: RfidSource::Rfid,
        };
        r.handle_start(&s);
        match r.handle_end(2, 0, 0) {
            Some(RfidEvent::TransferComplete { raw, record, .. }) => {
                assert!(raw.is_empty());
                assert!(record.is_none());
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_single_byte_transfer() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let s = start(3, 0, 0, 1);
        assert_eq!(s.total_packets, 1);
        r.handle_start(&s);
        assert!(r.handle_data(3, 1, &[0x42]).is_none());
        match r.handle_end(3, 1, 0x42) {
            Some(RfidEvent::TransferComplete { raw, record, .. }) => {
                assert_eq!(raw, vec![0x42]);
                // 1 字节不足必需块：传输成功但无可解析记录
                assert!(record.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_aborts_then_next_session_ok() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let mut data = payload(148);
        let s = start(5, 0, 0, 148);
        let good_sum = wrapping_sum(&data);

        // 翻转一个字节，但结束包仍声明原校验和
        data[10] ^= 0xFF;
        r.handle_start(&s);
        for (no, chunk) in fragment(&data) {
            r.handle_data(5, no, &chunk);
        }
        match r.handle_end(5, s.total_packets, good_sum) {
            Some(RfidEvent::TransferAborted {
                reason: SessionAbortReason::ChecksumError { expected, .. },
                ..
            }) => assert_eq!(expected, good_sum),
            other => panic!("expected checksum abort, got {:?}", other),
        }

        // 下一次 NOTIFY 正常接受
        let clean = payload(148);
        let s2 = start(6, 0, 0, 148);
        assert!(matches!(
            run_transfer(&mut r, &s2, &clean),
            Some(RfidEvent::TransferComplete { .. })
        ));
    }

    #[test]
    fn test_duplicate_packet_idempotent() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let data = payload(8);
        let s = start(9, 0, 0, 8);
        r.handle_start(&s);
        r.handle_data(9, 1, &data[..4]);
        // 同一包号、同一数据重传
        assert!(r.handle_data(9, 1, &data[..4]).is_none());
        r.handle_data(9, 2, &data[4..]);
        assert!(matches!(
            r.handle_end(9, 2, wrapping_sum(&data)),
            Some(RfidEvent::TransferComplete { .. })
        ));
    }

    #[test]
    fn test_duplicate_packet_conflicting_data_aborts() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let s = start(9, 0, 0, 8);
        r.handle_start(&s);
        r.handle_data(9, 1, &[1, 2, 3, 4]);
        match r.handle_data(9, 1, &[9, 9, 9, 9]) {
            Some(RfidEvent::TransferAborted {
                reason: SessionAbortReason::ChecksumError { .. },
                ..
            }) => {}
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(r.active_sessions(), 0);
    }

    #[test]
    fn test_out_of_range_packet_dropped_without_abort() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let data = payload(8);
        let s = start(4, 0, 0, 8);
        r.handle_start(&s);
        // 包号 0 与超出总包数的包号都丢弃
        assert!(r.handle_data(4, 0, &[1, 2, 3, 4]).is_none());
        assert!(r.handle_data(4, 3, &[1, 2, 3, 4]).is_none());
        // 有效字节数超出该槽剩余空间
        let s2 = start(8, 1, 1, 6);
        r.handle_start(&s2);
        assert!(r.handle_data(8, 2, &[1, 2, 3]).is_none()); // 末槽只容 2 字节

        // 原会话继续可完成
        for (no, chunk) in fragment(&data) {
            r.handle_data(4, no, &chunk);
        }
        assert!(matches!(
            r.handle_end(4, 2, wrapping_sum(&data)),
            Some(RfidEvent::TransferComplete { .. })
        ));
    }

    #[test]
    fn test_unknown_session_data_and_end_dropped() {
        let mut r = RfidReassembler::new(TIMEOUT);
        assert!(r.handle_data(0x55, 1, &[1]).is_none());
        assert!(r.handle_end(0x55, 1, 1).is_none());
    }

    #[test]
    fn test_out_of_order_receipt_tolerated() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let data = payload(12);
        let s = start(11, 0, 0, 12);
        r.handle_start(&s);
        // 乱序：3, 1, 2
        r.handle_data(11, 3, &data[8..12]);
        r.handle_data(11, 1, &data[0..4]);
        r.handle_data(11, 2, &data[4..8]);
        match r.handle_end(11, 3, wrapping_sum(&data)) {
            Some(RfidEvent::TransferComplete { raw, .. }) => assert_eq!(raw, data),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_end_packet_count_mismatch() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let data = payload(8);
        let s = start(12, 0, 0, 8);
        r.handle_start(&s);
        for (no, chunk) in fragment(&data) {
            r.handle_data(12, no, &chunk);
        }
        assert!(matches!(
            r.handle_end(12, 3, wrapping_sum(&data)),
            Some(RfidEvent::TransferAborted {
                reason: SessionAbortReason::LengthMismatch { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_missing_packet_is_length_mismatch() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let data = payload(8);
        let s = start(13, 0, 0, 8);
        r.handle_start(&s);
        r.handle_data(13, 1, &data[..4]); // 缺第 2 包
        assert!(matches!(
            r.handle_end(13, 2, wrapping_sum(&data)),
            Some(RfidEvent::TransferAborted {
                reason: SessionAbortReason::LengthMismatch {
                    expected: 8,
                    actual: 4
                },
                ..
            })
        ));
    }

    #[test]
    fn test_new_start_supersedes_same_extruder() {
        let mut r = RfidReassembler::new(TIMEOUT);
        r.handle_start(&start(20, 0, 0, 8));
        let events = r.handle_start(&start(21, 0, 0, 8));
        assert!(events.iter().any(|e| matches!(
            e,
            RfidEvent::TransferAborted {
                seq: 20,
                reason: SessionAbortReason::Superseded,
                ..
            }
        )));
        assert_eq!(r.active_sessions(), 1);
        assert!(r.is_extruder_busy(0));
    }

    #[test]
    fn test_same_seq_start_is_restart() {
        let mut r = RfidReassembler::new(TIMEOUT);
        let data = payload(8);
        let s = start(30, 0, 0, 8);
        r.handle_start(&s);
        r.handle_data(30, 1, &[0xEE; 4]); // 旧数据将被丢弃
        let events = r.handle_start(&s);
        // 重启不产生 Superseded
        assert!(events
            .iter()
            .all(|e| !matches!(e, RfidEvent::TransferAborted { .. })));
        for (no, chunk) in fragment(&data) {
            r.handle_data(30, no, &chunk);
        }
        match r.handle_end(30, 2, wrapping_sum(&data)) {
            Some(RfidEvent::TransferComplete { raw, .. }) => assert_eq!(raw, data),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_mapped_start_supersedes_unmapped_session_on_same_channel() {
        let mut r = RfidReassembler::new(TIMEOUT);
        // NOTIFY 起始包尚未解析出挤出机（0xFF），身份是料管 0
        r.handle_start(&RfidStart {
            seq: 70,
            extruder: EXTRUDER_UNMAPPED,
            channel: 0,
            total_packets: 2,
            expected_len: 8,
            source: RfidSource::Rfid,
        });
        // 同一料管上已映射的起始包必须取代它
        let events = r.handle_start(&start(71, 0, 0, 8));
        assert!(events.iter().any(|e| matches!(
            e,
            RfidEvent::TransferAborted {
                seq: 70,
                reason: SessionAbortReason::Superseded,
                ..
            }
        )));
        assert_eq!(r.active_sessions(), 1);
    }

    #[test]
    fn test_unmapped_start_supersedes_mapped_session_on_same_channel() {
        let mut r = RfidReassembler::new(TIMEOUT);
        r.handle_start(&start(72, 1, 1, 8));
        // 反方向：未映射的起始包落在同一料管上，同样取代旧会话
        let events = r.handle_start(&RfidStart {
            seq: 73,
            extruder: EXTRUDER_UNMAPPED,
            channel: 1,
            total_packets: 2,
            expected_len: 8,
            source: RfidSource::Rfid,
        });
        assert!(events.iter().any(|e| matches!(
            e,
            RfidEvent::TransferAborted {
                seq: 72,
                reason: SessionAbortReason::Superseded,
                ..
            }
        )));
        assert_eq!(r.active_sessions(), 1);
    }

    #[test]
    fn test_unmapped_sessions_on_different_channels_coexist() {
        let mut r = RfidReassembler::new(TIMEOUT);
        for (seq, channel) in [(74u8, 0u8), (75, 1)] {
            r.handle_start(&RfidStart {
                seq,
                extruder: EXTRUDER_UNMAPPED,
                channel,
                total_packets: 2,
                expected_len: 8,
                source: RfidSource::Rfid,
            });
        }
        assert_eq!(r.active_sessions(), 2);
    }

    #[test]
    fn test_different_extruders_concurrent_sessions() {
        let mut r = RfidReassembler::new(TIMEOUT);
        r.handle_start(&start(40, 0, 0, 8));
        r.handle_start(&start(41, 1, 1, 8));
        assert_eq!(r.active_sessions(), 2);
    }

    #[test]
    fn test_error_frame_cancels_extruder_session() {
        let mut r = RfidReassembler::new(TIMEOUT);
        r.handle_start(&start(50, 1, 1, 8));
        let events = r.handle_error(0x60, 1, 0x01, 0x03);
        assert!(events.iter().any(|e| matches!(
            e,
            RfidEvent::TransferAborted {
                reason: SessionAbortReason::CabinetError {
                    code: 0x01,
                    ext_code: 0x03
                },
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, RfidEvent::ReadError { extruder: 1, .. })));
        assert_eq!(r.active_sessions(), 0);
    }

    #[test]
    fn test_reap_at_exact_timeout_boundary() {
        let mut r = RfidReassembler::new(Duration::from_secs(0));
        r.handle_start(&start(60, 0, 0, 8));
        // 年龄恰好等于时限（0 秒）也要被清理
        let events = r.reap_expired(Instant::now());
        assert!(matches!(
            events.as_slice(),
            [RfidEvent::TransferAborted {
                reason: SessionAbortReason::TransferTimeout,
                ..
            }]
        ));
        assert_eq!(r.active_sessions(), 0);
    }

    #[test]
    fn test_reap_keeps_fresh_sessions() {
        let mut r = RfidReassembler::new(TIMEOUT);
        r.handle_start(&start(61, 0, 0, 8));
        assert!(r.reap_expired(Instant::now()).is_empty());
        assert_eq!(r.active_sessions(), 1);
    }
}
