use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::jobs::{JobKind, WorkerConfig};
use crate::pdf::{DEFAULT_CACHE_PAGES, DisplayDensity, RenderConfig};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagecache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_items: usize,
    pub max_bytes: usize,
    /// Disk tier directory; defaults to the platform cache dir
    pub disk_dir: Option<PathBuf>,
    /// Write entries to the disk tier
    pub persist: bool,
    pub memory_ttl_secs: u64,
    pub disk_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            max_items: defaults.max_items,
            max_bytes: defaults.max_bytes,
            disk_dir: default_disk_dir(),
            persist: true,
            memory_ttl_secs: defaults.memory_ttl.as_secs(),
            disk_ttl_secs: defaults.disk_ttl.as_secs(),
            cleanup_interval_secs: defaults.cleanup_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub cache_pages: usize,
    pub coalesce_delay_ms: u64,
    pub dispatch_yield_ms: u64,
    pub device_pixel_ratio: f32,
    pub dpi: f32,
    pub scale: f32,
    pub job_kind: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        let density = DisplayDensity::default();
        Self {
            cache_pages: DEFAULT_CACHE_PAGES,
            coalesce_delay_ms: 30,
            dispatch_yield_ms: 1,
            device_pixel_ratio: density.device_pixel_ratio,
            dpi: density.dpi,
            scale: 1.0,
            job_kind: JobKind::PAGE_RENDER.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub stop_grace_ms: u64,
    pub forced_stop_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            stop_grace_ms: 3000,
            forced_stop_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub render: RenderSettings,

    #[serde(default)]
    pub workers: WorkerSettings,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_disk_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join(APP_NAME))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cache: CacheSettings::default(),
            render: RenderSettings::default(),
            workers: WorkerSettings::default(),
        }
    }
}

/// `<config dir>/pagecache/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

impl Settings {
    /// Read settings from `path`, falling back to defaults when the file is
    /// missing or unparsable.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Settings file {path:?} not found, using defaults");
                return Self::default();
            }
            Err(e) => {
                error!("Failed to read settings file {path:?}: {e}");
                return Self::default();
            }
        };

        match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");
                if settings.version < CURRENT_VERSION {
                    settings.migrate();
                }
                settings
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
                Self::default()
            }
        }
    }

    /// Load from the default location, or defaults if there is none
    pub fn load() -> Self {
        match default_config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("Could not determine config directory, using default settings");
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_yaml::to_string(self).map_err(std::io::Error::other)?;
        fs::write(path, content)?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }

    fn migrate(&mut self) {
        info!(
            "Migrating settings from v{} to v{}",
            self.version, CURRENT_VERSION
        );

        // Future migrations go here:
        // if self.version < 2 {
        //     migrate_v1_to_v2(self);
        // }

        self.version = CURRENT_VERSION;
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        let cache = &self.cache;
        CacheConfig {
            max_items: cache.max_items,
            max_bytes: cache.max_bytes,
            disk_dir: cache.disk_dir.clone().filter(|_| cache.persist),
            memory_ttl: Duration::from_secs(cache.memory_ttl_secs),
            disk_ttl: Duration::from_secs(cache.disk_ttl_secs),
            cleanup_interval: Duration::from_secs(cache.cleanup_interval_secs),
        }
    }

    #[must_use]
    pub fn render_config(&self) -> RenderConfig {
        let render = &self.render;
        RenderConfig {
            cache_pages: render.cache_pages,
            coalesce_delay: Duration::from_millis(render.coalesce_delay_ms),
            dispatch_yield: Duration::from_millis(render.dispatch_yield_ms),
            density: DisplayDensity {
                device_pixel_ratio: render.device_pixel_ratio,
                dpi: render.dpi,
            },
            scale: render.scale,
            job_kind: JobKind::new(render.job_kind.clone()),
        }
    }

    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            stop_grace: Duration::from_millis(self.workers.stop_grace_ms),
            forced_stop: Duration::from_millis(self.workers.forced_stop_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.yaml"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "render:\n  scale: 2.0\ncache:\n  max_items: 5\n").unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.version, CURRENT_VERSION);
        assert!((settings.render.scale - 2.0).abs() < f32::EPSILON);
        assert_eq!(settings.render.cache_pages, DEFAULT_CACHE_PAGES);
        assert_eq!(settings.cache.max_items, 5);
        assert_eq!(settings.workers, WorkerSettings::default());
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "cache: [1, 2").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut settings = Settings::default();
        settings.cache.persist = false;
        settings.workers.stop_grace_ms = 500;
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path), settings);
    }

    #[test]
    fn conversions() {
        let mut settings = Settings::default();
        settings.cache.disk_dir = Some(PathBuf::from("/tmp/pc"));
        settings.cache.persist = false;
        settings.render.job_kind = "thumbs".to_string();

        assert_eq!(settings.cache_config().disk_dir, None);
        assert_eq!(settings.render_config().job_kind, JobKind::new("thumbs"));
        assert_eq!(
            settings.worker_config().stop_grace,
            Duration::from_millis(3000)
        );
    }
}
