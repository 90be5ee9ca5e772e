//! 应用消息编解码
//!
//! 出站：把类型化操作编码为 0x10A 命令帧。
//! 入站：把 0x10B 帧按第 0 字节分发为 [`CabinetMessage`] 变体，
//! 编码错误在编译期以未处理变体的形式暴露。

use crate::can::FeederFrame;
use crate::protocol::ids::*;
use crate::protocol::{join_u16_hi_lo, ProtocolError};

/// 送料柜送料流程阶段（状态帧第 0 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Idle,
    Ready,
    Feeding,
    Complete,
    Error,
}

impl FeedPhase {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            FEED_STATUS_IDLE => Some(FeedPhase::Idle),
            FEED_STATUS_READY => Some(FeedPhase::Ready),
            FEED_STATUS_FEEDING => Some(FeedPhase::Feeding),
            FEED_STATUS_COMPLETE => Some(FeedPhase::Complete),
            FEED_STATUS_ERROR => Some(FeedPhase::Error),
            _ => None,
        }
    }
}

/// RFID 数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfidSource {
    /// 标签读取
    Rfid,
    /// 手动录入
    Manual,
}

/// 耗材类型（断料通知第 5 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialType {
    Unknown,
    Pla,
    Petg,
    Abs,
    Asa,
    Other(u8),
}

impl MaterialType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => MaterialType::Unknown,
            0x01 => MaterialType::Pla,
            0x02 => MaterialType::Petg,
            0x03 => MaterialType::Abs,
            0x04 => MaterialType::Asa,
            other => MaterialType::Other(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MaterialType::Unknown => "unknown",
            MaterialType::Pla => "PLA",
            MaterialType::Petg => "PETG",
            MaterialType::Abs => "ABS",
            MaterialType::Asa => "ASA",
            MaterialType::Other(_) => "other",
        }
    }
}

/// RFID 传输起始包字段
///
/// 0x14（主动通知）与 0x16（查询响应）负载布局相同，
/// 仅挤出机号与料管号的字节位置互换（第 2 / 第 6 字节）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfidStart {
    pub seq: u8,
    pub extruder: u8,
    pub channel: u8,
    pub total_packets: u8,
    pub expected_len: u16,
    pub source: RfidSource,
}

/// 送料柜 -> 打印机 的入站消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CabinetMessage {
    /// 送料流程状态上报
    FeedStatus {
        phase: FeedPhase,
        progress: u8,
        error_code: u8,
    },
    /// 旧版余料查询（0x03 全零尾部），按 0x0D 处理
    LegacyStatusQuery,
    /// 心跳应答，只用于刷新链路活性
    HeartbeatAck,
    /// 料管映射查询
    MappingQuery,
    /// 料管映射设置请求
    MappingSet {
        zone0_extruder: u8,
        zone1_extruder: u8,
        status: u8,
    },
    /// 余料状态查询
    FilamentStatusQuery,
    /// RFID 主动通知起始包
    RfidNotifyStart(RfidStart),
    /// RFID 查询响应起始包
    RfidResponseStart(RfidStart),
    /// RFID 数据包
    RfidData {
        seq: u8,
        packet_no: u8,
        valid_len: u8,
        data: [u8; 4],
    },
    /// RFID 传输结束包
    RfidEnd {
        seq: u8,
        total_packets: u8,
        checksum: u16,
        status: u8,
    },
    /// RFID 读取错误
    RfidError {
        seq: u8,
        extruder: u8,
        code: u8,
        ext_code: u8,
    },
    /// 断料通知（送料柜侧传感器）
    FilamentOutNotify {
        valid: bool,
        channel: u8,
        extruder: u8,
        active: bool,
        material: MaterialType,
    },
}

/// 解析一条 0x10B 入站帧
pub fn decode(frame: &FeederFrame) -> Result<CabinetMessage, ProtocolError> {
    if frame.id != CABINET_TO_PRINTER_ID {
        return Err(ProtocolError::InvalidCanId { id: frame.id });
    }
    let data = frame.data_slice();
    if data.is_empty() {
        return Err(ProtocolError::InvalidLength {
            expected: 1,
            actual: 0,
        });
    }

    let need = |n: usize| -> Result<(), ProtocolError> {
        if data.len() < n {
            Err(ProtocolError::InvalidLength {
                expected: n,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    };

    let cmd = data[0];
    match cmd {
        // 0x03 兼容两种含义：全零尾部是旧版查询，否则是"送料完成"状态
        CMD_LEGACY_STATUS_QUERY if data[1..].iter().all(|&b| b == 0) => {
            Ok(CabinetMessage::LegacyStatusQuery)
        }
        FEED_STATUS_IDLE..=FEED_STATUS_ERROR => {
            let phase = FeedPhase::from_code(cmd).ok_or(ProtocolError::InvalidValue {
                field: "feed_status",
                value: cmd,
            })?;
            Ok(CabinetMessage::FeedStatus {
                phase,
                progress: data.get(1).copied().unwrap_or(0),
                error_code: data.get(2).copied().unwrap_or(0),
            })
        }
        CMD_HEARTBEAT_ACK => Ok(CabinetMessage::HeartbeatAck),
        CMD_MAPPING_QUERY => Ok(CabinetMessage::MappingQuery),
        CMD_MAPPING_SET => {
            need(4)?;
            Ok(CabinetMessage::MappingSet {
                zone0_extruder: data[1],
                zone1_extruder: data[2],
                status: data[3],
            })
        }
        CMD_FILAMENT_STATUS_QUERY => Ok(CabinetMessage::FilamentStatusQuery),
        CMD_RFID_NOTIFY_START => {
            need(8)?;
            Ok(CabinetMessage::RfidNotifyStart(RfidStart {
                seq: data[1],
                channel: data[2],
                total_packets: data[3],
                expected_len: join_u16_hi_lo(data[4], data[5]),
                extruder: data[6],
                source: if data[7] == 0 {
                    RfidSource::Rfid
                } else {
                    RfidSource::Manual
                },
            }))
        }
        CMD_RFID_RESPONSE_START => {
            // 与 0x14 相比挤出机号与料管号互换
            need(8)?;
            Ok(CabinetMessage::RfidResponseStart(RfidStart {
                seq: data[1],
                extruder: data[2],
                total_packets: data[3],
                expected_len: join_u16_hi_lo(data[4], data[5]),
                channel: data[6],
                source: if data[7] == 0 {
                    RfidSource::Rfid
                } else {
                    RfidSource::Manual
                },
            }))
        }
        CMD_RFID_DATA => {
            need(4)?;
            let valid_len = data[3];
            if valid_len == 0 || valid_len > 4 {
                return Err(ProtocolError::InvalidValue {
                    field: "valid_len",
                    value: valid_len,
                });
            }
            need(4 + valid_len as usize)?;
            let mut payload = [0u8; 4];
            payload[..valid_len as usize].copy_from_slice(&data[4..4 + valid_len as usize]);
            Ok(CabinetMessage::RfidData {
                seq: data[1],
                packet_no: data[2],
                valid_len,
                data: payload,
            })
        }
        CMD_RFID_END => {
            need(6)?;
            Ok(CabinetMessage::RfidEnd {
                seq: data[1],
                total_packets: data[2],
                checksum: join_u16_hi_lo(data[3], data[4]),
                status: data[5],
            })
        }
        CMD_RFID_ERROR => {
            need(5)?;
            Ok(CabinetMessage::RfidError {
                seq: data[1],
                extruder: data[2],
                code: data[3],
                ext_code: data[4],
            })
        }
        CMD_FILAMENT_OUT_NOTIFY => {
            need(6)?;
            Ok(CabinetMessage::FilamentOutNotify {
                valid: data[1] == 0x01,
                channel: data[2],
                extruder: data[3],
                active: data[4] == 0x01,
                material: MaterialType::from_code(data[5]),
            })
        }
        other => Err(ProtocolError::UnknownCommand { command: other }),
    }
}

// ============================================================================
// 出站编码
// ============================================================================

fn command_frame(data: &[u8]) -> FeederFrame {
    // 命令帧固定 DLC 8，未用字节补零
    let mut padded = [0u8; 8];
    padded[..data.len()].copy_from_slice(data);
    FeederFrame::new(PRINTER_TO_CABINET_ID, &padded)
}

/// 请求送料
pub fn request_feed(extruder: u8, force: bool) -> FeederFrame {
    command_frame(&[CMD_REQUEST_FEED, extruder, force as u8])
}

/// 取消送料
pub fn cancel_feed(extruder: u8) -> FeederFrame {
    command_frame(&[CMD_CANCEL_FEED, extruder])
}

/// 打印状态通知（0x04-0x09）
pub fn notify_print_state(cmd: u8, extruder: u8) -> FeederFrame {
    debug_assert!((CMD_PRINT_STARTED..=CMD_PRINT_ERROR).contains(&cmd));
    command_frame(&[cmd, extruder])
}

/// 心跳包
pub fn heartbeat() -> FeederFrame {
    command_frame(&[CMD_HEARTBEAT])
}

/// 余料状态响应：validity 0 表示数据有效
pub fn filament_status_response(valid: bool, bitmap: u8) -> FeederFrame {
    let validity = if valid { 0x00 } else { 0x01 };
    command_frame(&[CMD_FILAMENT_STATUS_RESPONSE, validity, bitmap])
}

/// 料管映射响应：每个挤出机一个 (挤出机, 料管, 0) 三元组
pub fn mapping_response(mapping: &[(u8, u8)]) -> FeederFrame {
    let mut data = [0u8; 8];
    data[0] = CMD_MAPPING_RESPONSE;
    for (i, &(extruder, zone)) in mapping.iter().take(2).enumerate() {
        data[1 + i * 3] = extruder;
        data[2 + i * 3] = zone;
        // 第三字节保留为 0
    }
    command_frame(&data)
}

/// 请求 RFID 原始数据
pub fn rfid_request(seq: u8, extruder: u8) -> FeederFrame {
    command_frame(&[CMD_RFID_REQUEST, seq, extruder])
}

/// 回退耗材：档位 0-7
///
/// 距离档位 0-7 对应 1/5/10/20/50/100/200/1000 mm，
/// 速度档位 0-7 对应 10-80 mm/s。
pub fn retract_filament(
    buffer: u8,
    distance_gear: u8,
    speed_gear: u8,
) -> Result<FeederFrame, ProtocolError> {
    if buffer > 1 {
        return Err(ProtocolError::InvalidValue {
            field: "buffer",
            value: buffer,
        });
    }
    if distance_gear > 7 {
        return Err(ProtocolError::InvalidValue {
            field: "distance_gear",
            value: distance_gear,
        });
    }
    if speed_gear > 7 {
        return Err(ProtocolError::InvalidValue {
            field: "speed_gear",
            value: speed_gear,
        });
    }
    Ok(command_frame(&[
        CMD_RETRACT_FILAMENT,
        0x01,
        buffer,
        distance_gear,
        speed_gear,
    ]))
}

/// 把 (料管号, 有料) 集合编码为位图：bit i = 料管 i 有料
pub fn encode_filament_bitmap<I>(zones: I) -> u8
where
    I: IntoIterator<Item = (u8, bool)>,
{
    let mut bitmap = 0u8;
    for (zone, present) in zones {
        if present && zone < 8 {
            bitmap |= 1 << zone;
        }
    }
    bitmap
}

/// 位图解码为 (料管号, 有料) 列表
pub fn decode_filament_bitmap(bitmap: u8, zone_count: u8) -> Vec<(u8, bool)> {
    (0..zone_count.min(8))
        .map(|zone| (zone, bitmap & (1 << zone) != 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(data: &[u8]) -> FeederFrame {
        FeederFrame::new(CABINET_TO_PRINTER_ID, data)
    }

    #[test]
    fn test_decode_rejects_wrong_id() {
        let frame = FeederFrame::new(0x123, &[0x0D]);
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::InvalidCanId { id: 0x123 })
        ));
    }

    #[test]
    fn test_decode_empty_frame() {
        let frame = inbound(&[]);
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_decode_status_query() {
        let msg = decode(&inbound(&[0x0D, 0, 0, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(msg, CabinetMessage::FilamentStatusQuery);
    }

    #[test]
    fn test_decode_legacy_query_all_zero_tail() {
        let msg = decode(&inbound(&[0x03, 0, 0, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(msg, CabinetMessage::LegacyStatusQuery);
    }

    #[test]
    fn test_decode_feed_complete_with_progress() {
        // 0x03 + 非零尾部 = 送料完成状态
        let msg = decode(&inbound(&[0x03, 100, 0, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::FeedStatus {
                phase: FeedPhase::Complete,
                progress: 100,
                error_code: 0,
            }
        );
    }

    #[test]
    fn test_decode_feed_error() {
        let msg = decode(&inbound(&[0x04, 0, FEED_ERROR_MATERIAL_MISSING, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::FeedStatus {
                phase: FeedPhase::Error,
                progress: 0,
                error_code: FEED_ERROR_MATERIAL_MISSING,
            }
        );
    }

    #[test]
    fn test_decode_heartbeat_ack() {
        // 实测送料柜应答形如 05 00 FA E2 7E
        let msg = decode(&inbound(&[0x05, 0x00, 0xFA, 0xE2, 0x7E])).unwrap();
        assert_eq!(msg, CabinetMessage::HeartbeatAck);
    }

    #[test]
    fn test_decode_rfid_notify_start() {
        // 148 字节 / 37 包的起始帧
        let msg = decode(&inbound(&[0x14, 0x07, 0x00, 0x25, 0x00, 0x94, 0xFF, 0x00])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::RfidNotifyStart(RfidStart {
                seq: 0x07,
                channel: 0x00,
                total_packets: 0x25,
                expected_len: 148,
                extruder: EXTRUDER_UNMAPPED,
                source: RfidSource::Rfid,
            })
        );
    }

    #[test]
    fn test_decode_rfid_response_start_swaps_fields() {
        let msg = decode(&inbound(&[0x16, 0x07, 0x01, 0x02, 0x00, 0x08, 0x00, 0x01])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::RfidResponseStart(RfidStart {
                seq: 0x07,
                extruder: 0x01,
                total_packets: 0x02,
                expected_len: 8,
                channel: 0x00,
                source: RfidSource::Manual,
            })
        );
    }

    #[test]
    fn test_decode_rfid_data_partial() {
        let msg = decode(&inbound(&[0x17, 0x07, 0x25, 0x02, 0xAB, 0xCD, 0, 0])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::RfidData {
                seq: 0x07,
                packet_no: 0x25,
                valid_len: 2,
                data: [0xAB, 0xCD, 0, 0],
            }
        );
    }

    #[test]
    fn test_decode_rfid_data_invalid_valid_len() {
        assert!(matches!(
            decode(&inbound(&[0x17, 0x07, 0x01, 0x05, 0, 0, 0, 0])),
            Err(ProtocolError::InvalidValue {
                field: "valid_len",
                ..
            })
        ));
        assert!(matches!(
            decode(&inbound(&[0x17, 0x07, 0x01, 0x00, 0, 0, 0, 0])),
            Err(ProtocolError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_decode_rfid_end() {
        let msg = decode(&inbound(&[0x18, 0x07, 0x25, 0x12, 0x34, 0x00, 0, 0])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::RfidEnd {
                seq: 0x07,
                total_packets: 0x25,
                checksum: 0x1234,
                status: 0,
            }
        );
    }

    #[test]
    fn test_decode_rfid_error() {
        let msg = decode(&inbound(&[0x19, 0x07, 0x01, 0x01, 0x03, 0, 0, 0])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::RfidError {
                seq: 0x07,
                extruder: 1,
                code: RFID_ERR_READ_FAIL,
                ext_code: RFID_EXT_NO_TAG,
            }
        );
    }

    #[test]
    fn test_decode_filament_out_notify() {
        let msg = decode(&inbound(&[0x1A, 0x01, 0x02, 0x00, 0x01, 0x01, 0, 0])).unwrap();
        assert_eq!(
            msg,
            CabinetMessage::FilamentOutNotify {
                valid: true,
                channel: 2,
                extruder: 0,
                active: true,
                material: MaterialType::Pla,
            }
        );
    }

    #[test]
    fn test_decode_unknown_command() {
        assert!(matches!(
            decode(&inbound(&[0x7E, 0, 0, 0, 0, 0, 0, 0])),
            Err(ProtocolError::UnknownCommand { command: 0x7E })
        ));
    }

    #[test]
    fn test_encode_filament_status_response() {
        // 料管 0 有料、料管 1 无料 -> 10A#0E0001
        let frame = filament_status_response(true, 0b01);
        assert_eq!(frame.id, PRINTER_TO_CABINET_ID);
        assert_eq!(frame.data, [0x0E, 0x00, 0x01, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_request_feed() {
        let frame = request_feed(0, false);
        assert_eq!(frame.data, [0x01, 0x00, 0x00, 0, 0, 0, 0, 0]);

        let forced = request_feed(1, true);
        assert_eq!(forced.data[..3], [0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_encode_mapping_response_triples() {
        let frame = mapping_response(&[(0, 0), (1, 1)]);
        assert_eq!(frame.data, [0x0B, 0, 0, 0, 1, 1, 0, 0]);
    }

    #[test]
    fn test_encode_retract_validates_gears() {
        assert!(retract_filament(0, 3, 2).is_ok());
        assert!(retract_filament(2, 0, 0).is_err());
        assert!(retract_filament(0, 8, 0).is_err());
        assert!(retract_filament(0, 0, 8).is_err());
    }

    #[test]
    fn test_bitmap_roundtrip() {
        let zones = vec![(0u8, true), (1u8, false), (2u8, true)];
        let bitmap = encode_filament_bitmap(zones.iter().copied());
        assert_eq!(bitmap, 0b101);
        assert_eq!(decode_filament_bitmap(bitmap, 3), zones);
    }

    #[test]
    fn test_bitmap_unused_bits_zero() {
        let bitmap = encode_filament_bitmap([(0u8, true), (1u8, true)]);
        assert_eq!(bitmap & !0b11, 0);
    }
}
