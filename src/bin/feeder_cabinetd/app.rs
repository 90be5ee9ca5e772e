//! 应用装配
//!
//! 在 main 作用域内构造全部组件并用通道连线：
//! 链路引擎与观察者各自持有事件发送端，编排器是唯一消费者，
//! 状态机只被编排器触碰。组件之间没有反向引用。

use crossbeam_channel::{bounded, Receiver};
use feeder_cabinet::can::SocketCanTransport;
use feeder_cabinet::config::AppConfig;
use feeder_cabinet::klipper::{KlipperObserver, KlipperObserverConfig, SensorBinding};
use feeder_cabinet::orchestrator::Orchestrator;
use feeder_cabinet::protocol::{LinkConfig, LinkEngine};
use feeder_cabinet::sink::{FilamentSink, SinkError};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// CAN 接收轮询超时：决定各循环观察停机信号的粒度
const CAN_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 停机后等待各线程退出的时限
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Record sink init failed: {0}")]
    Sink(#[from] SinkError),
}

/// 组装好的应用
pub struct App {
    config: AppConfig,
    sink: Option<FilamentSink>,
}

impl App {
    /// 初始化不涉及 IO 的部分（--dry-run 到此为止）
    pub fn init(config: AppConfig) -> Result<Self, AppError> {
        let sink = if config.rfid.enabled {
            Some(FilamentSink::new(config.rfid.data_dir.clone())?)
        } else {
            None
        };

        info!(
            can_interface = %config.can.interface,
            moonraker = %config.klipper.base_url,
            extruders = config.extruder_mapping.extruder_count(),
            runout_enabled = config.filament_runout.enabled,
            rfid_enabled = config.rfid.enabled,
            "Components initialized"
        );
        Ok(Self { config, sink })
    }

    /// 启动全部后台线程并驻留在编排循环里，直到停机信号到来
    pub fn run(self, shutdown: Receiver<()>) {
        let (protocol_tx, protocol_rx) = bounded(256);
        let (observer_tx, observer_rx) = bounded(256);

        let link_config = LinkConfig {
            rfid_timeout: self.config.rfid.transfer_timeout(),
            rfid_cleanup_interval: self.config.rfid.cleanup_interval(),
            ..LinkConfig::default()
        };
        let interface = self.config.can.interface.clone();
        let (link_engine, link_handle) = LinkEngine::spawn(
            move || SocketCanTransport::open(&interface, CAN_READ_TIMEOUT),
            link_config,
            protocol_tx,
            shutdown.clone(),
        );

        let observer_config = KlipperObserverConfig {
            base_url: self.config.klipper.base_url.clone(),
            update_interval: Duration::from_secs_f64(self.config.klipper.update_interval),
            sensors: self
                .config
                .filament_runout
                .sensors
                .iter()
                .map(|s| SensorBinding {
                    name: s.name.clone(),
                    extruder: s.extruder,
                })
                .collect(),
            extruder_count: self.config.extruder_mapping.extruder_count(),
        };
        let (observer, klipper_handle) =
            KlipperObserver::spawn(observer_config, observer_tx, shutdown.clone());

        // 编排器占据主线程；返回即已排空事件
        Orchestrator::new(self.config, link_handle, klipper_handle, self.sink).run(
            protocol_rx,
            observer_rx,
            shutdown,
        );

        // 停机顺序：编排器已排空 -> 观察者 -> 最后关链路
        observer.shutdown(JOIN_TIMEOUT);
        link_engine.shutdown(JOIN_TIMEOUT);
        info!("Shutdown complete");
    }
}
