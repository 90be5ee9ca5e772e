//! feeder_cabinetd 守护进程入口
//!
//! 职责：参数解析、配置加载、日志初始化、单例锁、信号处理。
//! 正常停机退出码 0；配置或初始化失败退出码 1。

mod app;
mod singleton;

use app::App;
use clap::Parser;
use feeder_cabinet::config::{AppConfig, LoggingConfig};
use feeder_cabinet::orchestrator::ShutdownSignal;
use singleton::SingletonLock;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// 自动续料系统守护进程
#[derive(Parser, Debug)]
#[command(name = "feeder_cabinetd")]
#[command(about = "Filament feeder cabinet supervisor daemon", long_about = None)]
struct Args {
    /// 配置文件路径（省略时使用内置默认配置）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 提高日志详细程度（等价于 logging.level = debug）
    #[arg(short, long)]
    verbose: bool,

    /// 只校验配置文件后退出
    #[arg(long)]
    check_config: bool,

    /// 初始化但不启动 IO
    #[arg(long)]
    dry_run: bool,

    /// 单例锁文件路径
    #[arg(long, default_value = "/var/run/feeder_cabinet.lock")]
    lock_file: PathBuf,
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.level.clone()
    };
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("feeder_cabinet")
                .filename_suffix("log")
                .max_log_files(config.retention_days.max(1) as usize)
                .build(dir);
            match appender {
                Ok(appender) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(tracing_subscriber::fmt::layer())
                        .with(
                            tracing_subscriber::fmt::layer()
                                .with_writer(writer)
                                .with_ansi(false),
                        )
                        .init();
                    Some(guard)
                }
                Err(e) => {
                    eprintln!("Failed to open log dir {}: {}", dir.display(), e);
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(tracing_subscriber::fmt::layer())
                        .init();
                    None
                }
            }
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

fn main() {
    let args = Args::parse();

    // 配置非法是唯一的启动期致命错误
    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            process::exit(1);
        }
    };

    if args.check_config {
        println!("Config OK");
        return;
    }

    let _log_guard = init_logging(&config.logging, args.verbose);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "feeder_cabinetd starting"
    );

    let _lock = match SingletonLock::try_lock(&args.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!(lock_file = %args.lock_file.display(), error = %e, "Failed to acquire singleton lock");
            process::exit(1);
        }
    };

    let app = match App::init(config) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Initialization failed");
            process::exit(1);
        }
    };

    if args.dry_run {
        info!("Dry run: initialization OK, not starting IO");
        return;
    }

    let (signal, shutdown_rx) = ShutdownSignal::new();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, shutting down...");
        signal.trigger();
    })
    .expect("Failed to set signal handler");

    app.run(shutdown_rx);
}
