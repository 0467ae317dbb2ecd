use crate::{ConfigError, GatewayFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{info, warn};

/// 已加载的配置代次。
#[derive(Debug, Clone)]
pub struct ConfigWatcher {
    receiver: watch::Receiver<(u64, Arc<GatewayFile>)>,
}

impl ConfigWatcher {
    /// 当前配置及其版本号（首次加载为 1）。
    pub fn current(&self) -> (u64, Arc<GatewayFile>) {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<(u64, Arc<GatewayFile>)> {
        self.receiver.clone()
    }
}

/// 首次同步加载，之后按修改时间轮询热加载。
///
/// 解析失败的新文件不会替换当前配置，只记录告警。
pub fn spawn_config_watcher(
    path: impl Into<PathBuf>,
    poll_interval: Duration,
) -> Result<ConfigWatcher, ConfigError> {
    let path = path.into();
    let initial = GatewayFile::load(&path)?;
    let mut last_modified = modified_at(&path);
    let (tx, rx) = watch::channel((1u64, Arc::new(initial)));

    tokio::spawn(async move {
        let mut version = 1u64;
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            let modified = modified_at(&path);
            if modified.is_none() || modified == last_modified {
                continue;
            }
            last_modified = modified;
            match GatewayFile::load(&path) {
                Ok(file) => {
                    version += 1;
                    info!(
                        target: "edge.config",
                        path = %path.display(),
                        version,
                        mappings = file.mappings.len(),
                        "config_reloaded"
                    );
                    let _ = tx.send((version, Arc::new(file)));
                }
                Err(err) => {
                    warn!(
                        target: "edge.config",
                        path = %path.display(),
                        error = %err,
                        "config_reload_rejected"
                    );
                }
            }
        }
    });

    Ok(ConfigWatcher { receiver: rx })
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
