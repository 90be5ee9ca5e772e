//! 耗材记录落盘
//!
//! 每个挤出机一个 JSON 文件 `filament_extruder_<id>.json`，
//! 采用临时文件 + rename 的原子写，读取方不会看到半截文件。

use crate::protocol::opentag::OpenTagFilament;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 按挤出机落盘的记录仓
pub struct FilamentSink {
    data_dir: PathBuf,
}

impl FilamentSink {
    /// 目录不存在时创建
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn record_path(&self, extruder: u8) -> PathBuf {
        self.data_dir
            .join(format!("filament_extruder_{}.json", extruder))
    }

    /// 原子写入一条记录，返回落盘路径
    pub fn store(&self, extruder: u8, record: &OpenTagFilament) -> Result<PathBuf, SinkError> {
        let target = self.record_path(extruder);
        let tmp = target.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;

        info!(
            extruder,
            path = %target.display(),
            material = %record.material_name,
            "Filament record stored"
        );
        Ok(target)
    }

    /// 读取已有记录（不存在返回 None）
    pub fn load(&self, extruder: u8) -> Result<Option<OpenTagFilament>, SinkError> {
        let path = self.record_path(extruder);
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read(&path)?;
        let record = serde_json::from_slice(&body)?;
        debug!(extruder, path = %path.display(), "Filament record loaded");
        Ok(Some(record))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_sink() -> FilamentSink {
        let dir = std::env::temp_dir().join(format!(
            "feeder_cabinet_sink_test_{}_{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        FilamentSink::new(dir).unwrap()
    }

    fn sample_record() -> OpenTagFilament {
        OpenTagFilament {
            tag_version: 1,
            manufacturer: "Mingda".into(),
            material_name: "PETG".into(),
            color_name: "Transparent Blue".into(),
            diameter_target: 1750,
            weight_nominal: 1000,
            print_temp: 240,
            bed_temp: 80,
            density: 1270,
            serial_number: Some("SN42".into()),
            manufacture_date_unix: Some(1_700_000_000),
            spool_core_diameter: None,
            mfi: None,
            tolerance_measured: None,
            additional_data_url: None,
            empty_spool_weight: Some(140),
            filament_weight_measured: None,
            filament_length_measured: None,
            transmission_distance: None,
            color_hex: Some(0x2244AA),
            max_dry_temp: Some(65),
        }
    }

    #[test]
    fn test_store_and_load_roundtrip() {
        let sink = temp_sink();
        let record = sample_record();

        let path = sink.store(1, &record).unwrap();
        assert_eq!(path, sink.record_path(1));
        assert!(path.exists());
        // 临时文件必须已被 rename 掉
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = sink.load(1).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let sink = temp_sink();
        assert!(sink.load(0).unwrap().is_none());
    }

    #[test]
    fn test_store_overwrites_previous() {
        let sink = temp_sink();
        let mut record = sample_record();
        sink.store(0, &record).unwrap();

        record.material_name = "ASA".into();
        sink.store(0, &record).unwrap();

        let loaded = sink.load(0).unwrap().unwrap();
        assert_eq!(loaded.material_name, "ASA");
    }

    #[test]
    fn test_file_naming_per_extruder() {
        let sink = temp_sink();
        assert!(sink
            .record_path(0)
            .ends_with("filament_extruder_0.json"));
        assert!(sink
            .record_path(1)
            .ends_with("filament_extruder_1.json"));
    }
}
