//! YAML 配置加载与校验
//!
//! 配置非法属于致命启动错误：进程报错退出，不带病运行。
//! 挤出机与料管的映射在加载校验后即不可变。

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub can: CanConfig,
    pub klipper: KlipperConfig,
    pub filament_runout: RunoutConfig,
    pub extruder_mapping: MappingConfig,
    pub rfid: RfidConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// CAN 设备名，由 `ip link` 预先配置
    pub interface: String,
    /// 总线波特率（仅记录用，内核接口已设置）
    pub bitrate: u32,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can1".to_string(),
            bitrate: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KlipperConfig {
    /// Moonraker HTTP 基地址
    pub base_url: String,
    /// 状态主动查询间隔（秒）
    pub update_interval: f64,
}

impl Default for KlipperConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7125".to_string(),
            update_interval: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunoutConfig {
    /// 断料处理总开关
    pub enabled: bool,
    pub sensors: Vec<SensorConfig>,
}

impl Default for RunoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensors: vec![
                SensorConfig {
                    name: "Filament_Sensor0".to_string(),
                    extruder: 0,
                },
                SensorConfig {
                    name: "Filament_Sensor1".to_string(),
                    extruder: 1,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub extruder: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// 默认活动挤出机
    pub default_active: u8,
    /// 挤出机 -> 料管（缓冲区）映射
    pub tube_mapping: BTreeMap<u8, u8>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            default_active: 0,
            tube_mapping: BTreeMap::from([(0, 0), (1, 1)]),
        }
    }
}

impl MappingConfig {
    pub fn extruder_count(&self) -> usize {
        self.tube_mapping.len()
    }

    pub fn zone_for(&self, extruder: u8) -> Option<u8> {
        self.tube_mapping.get(&extruder).copied()
    }

    pub fn extruder_for_zone(&self, zone: u8) -> Option<u8> {
        self.tube_mapping
            .iter()
            .find(|(_, &z)| z == zone)
            .map(|(&e, _)| e)
    }

    /// (挤出机, 料管) 对，按挤出机号升序
    pub fn pairs(&self) -> Vec<(u8, u8)> {
        self.tube_mapping.iter().map(|(&e, &z)| (e, z)).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RfidConfig {
    pub enabled: bool,
    /// 记录落盘后是否自动下发喷头/热床温度
    pub auto_set_temperature: bool,
    pub data_dir: PathBuf,
    pub transfer_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for RfidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_set_temperature: false,
            data_dir: PathBuf::from("/var/lib/feeder_cabinet"),
            transfer_timeout_seconds: 10,
            cleanup_interval_seconds: 5,
        }
    }
}

impl RfidConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace / debug / info / warn / error
    pub level: String,
    /// 不设置则只输出到控制台
    pub log_dir: Option<PathBuf>,
    /// 单文件上限（MB）；按天滚动时仅作记录
    pub max_size_mb: u64,
    pub backup_count: u32,
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            max_size_mb: 10,
            backup_count: 5,
            retention_days: 7,
        }
    }
}

impl AppConfig {
    /// 从文件加载并校验；`None` 使用内置默认值
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let body = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&body)?
            }
            None => AppConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验配置一致性；任何违例都是致命错误
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mapping = &self.extruder_mapping;
        if mapping.tube_mapping.is_empty() {
            return Err(invalid("extruder_mapping.tube_mapping must not be empty"));
        }

        // 料管两两互异
        let mut zones: Vec<u8> = mapping.tube_mapping.values().copied().collect();
        zones.sort_unstable();
        zones.dedup();
        if zones.len() != mapping.tube_mapping.len() {
            return Err(invalid(
                "extruder_mapping.tube_mapping assigns the same tube to multiple extruders",
            ));
        }

        if mapping.zone_for(mapping.default_active).is_none() {
            return Err(invalid(format!(
                "extruder_mapping.default_active {} has no tube mapping",
                mapping.default_active
            )));
        }

        if self.filament_runout.enabled {
            if self.filament_runout.sensors.is_empty() {
                return Err(invalid(
                    "filament_runout.enabled is set but no sensors are configured",
                ));
            }
            for sensor in &self.filament_runout.sensors {
                if sensor.name.is_empty() {
                    return Err(invalid("filament_runout.sensors entry with empty name"));
                }
                if mapping.zone_for(sensor.extruder).is_none() {
                    return Err(invalid(format!(
                        "sensor {} watches extruder {} which has no tube mapping",
                        sensor.name, sensor.extruder
                    )));
                }
            }
        }

        if !(self.klipper.update_interval > 0.0) {
            return Err(invalid("klipper.update_interval must be positive"));
        }
        if self.rfid.transfer_timeout_seconds == 0 {
            return Err(invalid("rfid.transfer_timeout_seconds must be positive"));
        }
        if self.rfid.cleanup_interval_seconds == 0 {
            return Err(invalid("rfid.cleanup_interval_seconds must be positive"));
        }
        if self.can.interface.is_empty() {
            return Err(invalid("can.interface must not be empty"));
        }
        Ok(())
    }
}
