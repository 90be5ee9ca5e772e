//! CAN ID 与命令码常量定义
//!
//! 帧 ID 与命令码由送料柜固件固定，不可配置。

/// 打印机 -> 送料柜 命令帧
pub const PRINTER_TO_CABINET_ID: u16 = 0x10A;

/// 送料柜 -> 打印机 命令帧
pub const CABINET_TO_PRINTER_ID: u16 = 0x10B;

/// 握手请求（打印机 -> 送料柜）
pub const HANDSHAKE_TX_ID: u16 = 0x3F0;

/// 握手响应（送料柜 -> 打印机）
pub const HANDSHAKE_RX_ID: u16 = 0x3F1;

/// 协议版本，握手请求第 8 字节；响应首字节必须与其一致
pub const PROTOCOL_VERSION: u8 = 0x05;

/// 握手请求负载（版本号在末字节）
pub const HANDSHAKE_REQUEST: [u8; 8] = [0x01, 0xF0, 0x10, 0x00, 0x00, 0x06, 0x01, PROTOCOL_VERSION];

// ============================================================================
// 打印机 -> 送料柜 命令码（负载第 0 字节）
// ============================================================================

/// 请求送料
pub const CMD_REQUEST_FEED: u8 = 0x01;
/// 取消送料
pub const CMD_CANCEL_FEED: u8 = 0x02;
/// 打印开始
pub const CMD_PRINT_STARTED: u8 = 0x04;
/// 打印暂停（断料）
pub const CMD_PRINT_PAUSED: u8 = 0x05;
/// 打印恢复
pub const CMD_PRINT_RESUMED: u8 = 0x06;
/// 打印完成
pub const CMD_PRINT_COMPLETED: u8 = 0x07;
/// 打印取消
pub const CMD_PRINT_CANCELLED: u8 = 0x08;
/// 打印错误
pub const CMD_PRINT_ERROR: u8 = 0x09;
/// 心跳包
pub const CMD_HEARTBEAT: u8 = 0x0A;
/// 料管映射响应
pub const CMD_MAPPING_RESPONSE: u8 = 0x0B;
/// 余料状态响应
pub const CMD_FILAMENT_STATUS_RESPONSE: u8 = 0x0E;
/// 请求 RFID 原始数据
pub const CMD_RFID_REQUEST: u8 = 0x15;
/// 回退耗材
pub const CMD_RETRACT_FILAMENT: u8 = 0x1E;

// ============================================================================
// 送料柜 -> 打印机 命令码
// ============================================================================

/// 旧版余料状态查询（全零尾部时等价于 0x0D）
pub const CMD_LEGACY_STATUS_QUERY: u8 = 0x03;
/// 心跳应答
pub const CMD_HEARTBEAT_ACK: u8 = 0x05;
/// 料管映射查询
pub const CMD_MAPPING_QUERY: u8 = 0x0A;
/// 料管映射设置
pub const CMD_MAPPING_SET: u8 = 0x0C;
/// 余料状态查询
pub const CMD_FILAMENT_STATUS_QUERY: u8 = 0x0D;
/// 主动通知 RFID 原始数据（起始包）
pub const CMD_RFID_NOTIFY_START: u8 = 0x14;
/// RFID 原始数据响应（起始包）
pub const CMD_RFID_RESPONSE_START: u8 = 0x16;
/// RFID 数据包
pub const CMD_RFID_DATA: u8 = 0x17;
/// RFID 数据传输结束
pub const CMD_RFID_END: u8 = 0x18;
/// RFID 读取错误
pub const CMD_RFID_ERROR: u8 = 0x19;
/// 断料通知
pub const CMD_FILAMENT_OUT_NOTIFY: u8 = 0x1A;

// ============================================================================
// 送料柜送料状态码（负载第 0 字节，0x00-0x04）
// ============================================================================

pub const FEED_STATUS_IDLE: u8 = 0x00;
pub const FEED_STATUS_READY: u8 = 0x01;
pub const FEED_STATUS_FEEDING: u8 = 0x02;
pub const FEED_STATUS_COMPLETE: u8 = 0x03;
pub const FEED_STATUS_ERROR: u8 = 0x04;

/// 送料错误码（状态帧第 2 字节）
pub const FEED_ERROR_NONE: u8 = 0x00;
pub const FEED_ERROR_MECHANICAL: u8 = 0x01;
pub const FEED_ERROR_MATERIAL_MISSING: u8 = 0x02;
pub const FEED_ERROR_OTHER: u8 = 0x03;
pub const FEED_ERROR_PRINTER: u8 = 0x04;
pub const FEED_ERROR_SERVICE: u8 = 0x05;
pub const FEED_ERROR_COMMUNICATION: u8 = 0x06;

// ============================================================================
// RFID 错误码（0x19 帧第 3 字节），扩展码在第 4 字节
// ============================================================================

pub const RFID_ERR_READ_FAIL: u8 = 0x01;
pub const RFID_ERR_NO_FILAMENT: u8 = 0x02;
pub const RFID_ERR_INVALID_DATA: u8 = 0x03;
pub const RFID_ERR_TIMEOUT: u8 = 0x04;
pub const RFID_ERR_NO_MAPPING: u8 = 0x05;
pub const RFID_ERR_BUSY: u8 = 0x06;

// 扩展码（主码 0x01 读取失败下）
pub const RFID_EXT_UART: u8 = 0x01;
pub const RFID_EXT_CHECKSUM: u8 = 0x02;
pub const RFID_EXT_NO_TAG: u8 = 0x03;
pub const RFID_EXT_AUTH: u8 = 0x04;

/// 起始包中表示"挤出机未映射"的占位值
pub const EXTRUDER_UNMAPPED: u8 = 0xFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_constants() {
        assert_eq!(PRINTER_TO_CABINET_ID, 0x10A);
        assert_eq!(CABINET_TO_PRINTER_ID, 0x10B);
        assert_eq!(HANDSHAKE_TX_ID, 0x3F0);
        assert_eq!(HANDSHAKE_RX_ID, 0x3F1);
    }

    #[test]
    fn test_handshake_request_carries_version() {
        assert_eq!(HANDSHAKE_REQUEST[7], PROTOCOL_VERSION);
    }
}
