//! Persistent daemon settings (JSON file in the config directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hydrotag_core::{
    buffering::DEFAULT_SHM_DIR,
    geometry::{DEFAULT_BASE_FILE_BYTES, DEFAULT_PAGE_DURATION},
    EncoderKind, EngineConfig, FilterType, RingNames, SampleGeometry,
};
use serde::{Deserialize, Serialize};

pub const SETTINGS_PATH_ENV: &str = "HYDROTAG_SETTINGS";
pub const OUTPUT_DIR_ENV: &str = "HYDROTAG_OUTPUT_DIR";
pub const SHM_DIR_ENV: &str = "HYDROTAG_SHM_DIR";

/// Shortest page the daemon will size from `pageDurationSecs`.
const MIN_PAGE_SECS: f64 = 0.1;
/// Smallest accepted rotation base.
const MIN_BASE_FILE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DaemonSettings {
    pub bit_depth: u32,
    pub sample_rate: u32,
    pub channel_count: u32,
    pub filter_type: FilterType,
    pub encoder: EncoderKind,
    pub output_dir: PathBuf,
    /// Defaults to `status.csv` inside the output directory.
    pub status_log_path: Option<PathBuf>,
    pub shm_dir: PathBuf,
    pub shm_name: String,
    pub page_duration_secs: f64,
    pub blocks_per_page: Option<usize>,
    pub base_file_bytes: u64,
    pub producer_core: Option<usize>,
    pub consumer_core: Option<usize>,
    pub restart_on_overflow: bool,
    pub auto_start: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            bit_depth: 16,
            sample_rate: 750,
            channel_count: 4,
            filter_type: FilterType::Wideband,
            encoder: EncoderKind::Wav,
            output_dir: PathBuf::from("recordings"),
            status_log_path: None,
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            shm_name: "hydrotag".into(),
            page_duration_secs: DEFAULT_PAGE_DURATION.as_secs_f64(),
            blocks_per_page: None,
            base_file_bytes: DEFAULT_BASE_FILE_BYTES,
            producer_core: Some(0),
            consumer_core: Some(1),
            restart_on_overflow: false,
            auto_start: false,
        }
    }
}

impl DaemonSettings {
    /// Clamp soft fields. Geometry is left exactly as written.
    pub fn normalize(&mut self) {
        if !self.page_duration_secs.is_finite() || self.page_duration_secs < MIN_PAGE_SECS {
            self.page_duration_secs = DEFAULT_PAGE_DURATION.as_secs_f64();
        }
        self.blocks_per_page = self.blocks_per_page.filter(|&b| b > 0);
        self.base_file_bytes = self.base_file_bytes.max(MIN_BASE_FILE_BYTES);

        let name = self.shm_name.trim().trim_start_matches('/');
        self.shm_name = if name.is_empty() || name.contains('/') {
            "hydrotag".into()
        } else {
            name.to_string()
        };
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = PathBuf::from("recordings");
        }
        if self.shm_dir.as_os_str().is_empty() {
            self.shm_dir = PathBuf::from(DEFAULT_SHM_DIR);
        }
        self.status_log_path = self
            .status_log_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.producer_core = self.producer_core.filter(|&c| c < cores);
        self.consumer_core = self.consumer_core.filter(|&c| c < cores);
    }

    /// Apply environment overrides; `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(OUTPUT_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.output_dir = PathBuf::from(dir.trim());
        }
        if let Some(dir) = lookup(SHM_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.shm_dir = PathBuf::from(dir.trim());
        }
    }

    pub fn status_log_path(&self) -> PathBuf {
        self.status_log_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("status.csv"))
    }

    /// Validate the geometry and build the engine configuration.
    ///
    /// # Errors
    /// `HydroError::InvalidGeometry` for any unsupported geometry value.
    pub fn to_engine_config(&self) -> hydrotag_core::Result<EngineConfig> {
        let geometry = SampleGeometry::new(
            self.bit_depth,
            self.sample_rate,
            self.channel_count,
            self.filter_type,
        )?;
        Ok(EngineConfig {
            geometry,
            encoder: self.encoder,
            output_dir: self.output_dir.clone(),
            status_log_path: self.status_log_path(),
            ring: RingNames::new(&self.shm_dir, &self.shm_name),
            page_duration: Duration::from_secs_f64(self.page_duration_secs),
            blocks_per_page: self.blocks_per_page,
            base_file_bytes: self.base_file_bytes,
            producer_core: self.producer_core,
            consumer_core: self.consumer_core,
            realtime_scheduling: true,
        })
    }
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV) {
        return PathBuf::from(path);
    }
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("hydrotag")
        .join("settings.json")
}

/// Read settings, falling back to defaults when the file is missing.
/// A file that exists but does not parse is an error.
pub fn load_settings(path: &Path) -> anyhow::Result<DaemonSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<DaemonSettings>(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonSettings::default(),
        Err(e) => return Err(e.into()),
    };
    settings.apply_overrides(|key| std::env::var(key).ok());
    settings.normalize();
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &DaemonSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
