#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use civic_common::{Config, FileConfig, SystemClock};
use civic_loader::App;
use civic_scout::testing::ScriptedLauncher;
use civic_store::{MemoryExecutionLog, MemoryRecordStore};
use tempfile::TempDir;

pub struct Harness {
    pub app: App,
    pub log: Arc<MemoryExecutionLog>,
    pub records: Arc<MemoryRecordStore>,
    pub launcher: Arc<ScriptedLauncher>,
    pub data_dir: TempDir,
}

pub fn harness(launcher: ScriptedLauncher) -> Harness {
    harness_with(launcher, FileConfig::default())
}

pub fn harness_with(launcher: ScriptedLauncher, file_config: FileConfig) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: data_dir.path().to_path_buf(),
        scraper_timeout: Duration::from_secs(300),
        ..Config::default()
    };
    let log = Arc::new(MemoryExecutionLog::new());
    let records = Arc::new(MemoryRecordStore::new());
    let launcher = Arc::new(launcher);
    let app = App::assemble(
        config,
        file_config,
        log.clone(),
        records.clone(),
        launcher.clone(),
        Arc::new(SystemClock),
    )
    .unwrap();

    Harness {
        app,
        log,
        records,
        launcher,
        data_dir,
    }
}

/// Poll until `check` holds, failing after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
