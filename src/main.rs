use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hyproxy::config::HandlerSpec;
use hyproxy::{Config, HandlerRegistry, Proxy, ProxyHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    init_logging();

    info!("Starting hyproxy...");

    // 配置：第一个参数是配置文件路径；没有就用 env 驱动的缺省链
    let config_path = std::env::args().nth(1);
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => default_config(),
    };

    let registry = Arc::new(HandlerRegistry::builtin());

    // bind 失败 (监听地址或配置错误) 直接以非零退出
    let proxy = Proxy::bind(&config, &registry).await?;
    let handle = proxy.handle();

    spawn_signal_handlers(handle, config_path, Arc::clone(&registry));

    proxy.run().await
}

/// 没有配置文件时的缺省链：HYPROXY_BACKEND → forwarder
fn default_config() -> Config {
    Config {
        listen: None,
        session_timeout: 600,
        cid_length: 8,
        handlers: vec![
            HandlerSpec {
                kind: "simple-router".to_string(),
                config: None,
            },
            HandlerSpec {
                kind: "forwarder".to_string(),
                config: None,
            },
        ],
    }
}

/// 中断信号 → 优雅关闭；挂起信号 (有配置文件时) → 重载配置
#[cfg(unix)]
fn spawn_signal_handlers(
    handle: ProxyHandle,
    config_path: Option<String>,
    registry: Arc<HandlerRegistry>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        shutdown_handle.shutdown();
    });

    if let Some(path) = config_path {
        tokio::spawn(async move {
            let mut sighup =
                signal(SignalKind::hangup()).expect("Failed to register SIGHUP handler");
            while sighup.recv().await.is_some() {
                info!("SIGHUP received, reloading {}", path);
                // 重载失败不致命：拒绝新配置，按原配置继续跑
                match Config::load(&path) {
                    Ok(config) => {
                        if let Err(e) = handle.reload(&config, &registry) {
                            error!("config reload rejected: {:#}", e);
                        }
                    }
                    Err(e) => error!("config reload failed: {:#}", e),
                }
            }
        });
    }
}

#[cfg(not(unix))]
fn spawn_signal_handlers(
    handle: ProxyHandle,
    _config_path: Option<String>,
    _registry: Arc<HandlerRegistry>,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            handle.shutdown();
        }
    });
}

/// 初始化日志系统
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let formatting_layer = fmt::layer().with_target(false).with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(formatting_layer)
        .init();
}
