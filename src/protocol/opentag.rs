//! OpenTag 耗材标签解析
//!
//! OpenTag 是耗材 RFID 标签的公开二进制布局：负载内所有多字节数值
//! 为小端字节序，字符串为 NUL 填充的 UTF-8，缺省的可选字段以全 1
//! （0xFF / 0xFFFF / 0xFFFFFFFF）作为哨兵值。
//!
//! 必需块 76 字节；带全部可选字段的完整记录 148 字节。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// 必需字段块长度（tag_version 到 density）
pub const MIN_RECORD_LEN: usize = 76;

/// 含全部可选字段的记录长度
pub const FULL_RECORD_LEN: usize = 148;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenTagError {
    #[error("Record too short: {actual} bytes (required block is {MIN_RECORD_LEN})")]
    TooShort { actual: usize },
}

/// 解析完成的耗材记录
///
/// 直接按本结构序列化为 JSON 落盘，字段名即文件格式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTagFilament {
    pub tag_version: u16,
    pub manufacturer: String,
    pub material_name: String,
    pub color_name: String,
    /// 目标直径（µm）
    pub diameter_target: u16,
    /// 标称重量（g）
    pub weight_nominal: u16,
    /// 打印温度（°C）
    pub print_temp: u16,
    /// 热床温度（°C）
    pub bed_temp: u16,
    /// 密度（µg/cm³）
    pub density: u16,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serial_number: Option<String>,
    /// 生产日期（Unix 时间戳，秒）
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub manufacture_date_unix: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub spool_core_diameter: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mfi: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tolerance_measured: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub additional_data_url: Option<String>,
    /// 空盘重量（g）
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub empty_spool_weight: Option<u16>,
    /// 实测耗材重量（g）
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filament_weight_measured: Option<u16>,
    /// 实测耗材长度（m）
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filament_length_measured: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transmission_distance: Option<u16>,
    /// 颜色 RGB，JSON 中表示为 "#RRGGBB"
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "ser_color_hex",
        deserialize_with = "de_color_hex",
        default
    )]
    pub color_hex: Option<u32>,
    /// 最高干燥温度（°C）
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_dry_temp: Option<u8>,
}

fn ser_color_hex<S: Serializer>(value: &Option<u32>, ser: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(rgb) => ser.serialize_str(&format!("#{:06X}", rgb & 0xFF_FFFF)),
        None => ser.serialize_none(),
    }
}

fn de_color_hex<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u32>, D::Error> {
    let value: Option<String> = Option::deserialize(de)?;
    match value {
        Some(s) => u32::from_str_radix(s.trim_start_matches('#'), 16)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

impl OpenTagFilament {
    /// RGB 分量 (r, g, b)
    pub fn color_rgb(&self) -> Option<(u8, u8, u8)> {
        self.color_hex.map(|hex| {
            (
                ((hex >> 16) & 0xFF) as u8,
                ((hex >> 8) & 0xFF) as u8,
                (hex & 0xFF) as u8,
            )
        })
    }
}

/// 顺序读取器：必需字段越界即错，可选字段越界返回 None
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.offset + n > self.data.len() {
            return None;
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_le_bytes([s[0], s[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    /// NUL 填充的定长 UTF-8 字符串；非法序列按有损方式解码
    fn string(&mut self, len: usize) -> Option<String> {
        self.take(len).map(|s| {
            let end = s.iter().position(|&b| b == 0).unwrap_or(s.len());
            String::from_utf8_lossy(&s[..end]).trim().to_string()
        })
    }
}

fn opt_u8(value: Option<u8>) -> Option<u8> {
    value.filter(|&v| v != 0xFF)
}

fn opt_u16(value: Option<u16>) -> Option<u16> {
    value.filter(|&v| v != 0xFFFF)
}

fn opt_u32(value: Option<u32>) -> Option<u32> {
    value.filter(|&v| v != 0xFFFF_FFFF)
}

fn opt_string(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// 解析一条重组完成的 OpenTag 负载
///
/// 数据不足必需块长度报错；可选字段能读多少读多少。
pub fn parse(data: &[u8]) -> Result<OpenTagFilament, OpenTagError> {
    if data.len() < MIN_RECORD_LEN {
        return Err(OpenTagError::TooShort { actual: data.len() });
    }

    let mut r = Reader::new(data);

    // 必需块（76 字节），上面的长度检查保证这里不会失败
    let tag_version = r.u16_le().unwrap_or_default();
    let manufacturer = r.string(16).unwrap_or_default();
    let material_name = r.string(16).unwrap_or_default();
    let color_name = r.string(32).unwrap_or_default();
    let diameter_target = r.u16_le().unwrap_or_default();
    let weight_nominal = r.u16_le().unwrap_or_default();
    let print_temp = r.u16_le().unwrap_or_default();
    let bed_temp = r.u16_le().unwrap_or_default();
    let density = r.u16_le().unwrap_or_default();

    // 可选块，按布局顺序读取
    let serial_number = opt_string(r.string(16));
    let manufacture_date_unix = opt_u32(r.u32_le());
    let _manufacture_time = r.u32_le(); // 布局保留字段，跳过
    let spool_core_diameter = opt_u8(r.u8());
    let mfi = opt_u8(r.u8());
    let tolerance_measured = opt_u8(r.u8());
    let additional_data_url = opt_string(r.string(32));
    let empty_spool_weight = opt_u16(r.u16_le());
    let filament_weight_measured = opt_u16(r.u16_le());
    let filament_length_measured = opt_u16(r.u16_le());
    let transmission_distance = opt_u16(r.u16_le());
    let color_hex = opt_u32(r.u32_le());
    let max_dry_temp = opt_u8(r.u8());

    Ok(OpenTagFilament {
        tag_version,
        manufacturer,
        material_name,
        color_name,
        diameter_target,
        weight_nominal,
        print_temp,
        bed_temp,
        density,
        serial_number,
        manufacture_date_unix,
        spool_core_diameter,
        mfi,
        tolerance_measured,
        additional_data_url,
        empty_spool_weight,
        filament_weight_measured,
        filament_length_measured,
        transmission_distance,
        color_hex,
        max_dry_temp,
    })
}
