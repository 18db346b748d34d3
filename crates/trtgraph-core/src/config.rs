use std::path::{Path, PathBuf};

use crate::backend::CaptureMode;
use crate::network::{BuilderConfig, LogSeverity, NetworkDefinition};
use crate::shape::{OptimizationProfile, Shape};

/// Extension of persisted engine files, cleared at startup.
pub const ENGINE_EXTENSION: &str = "trt";

/// Settings for the build/load + capture demonstration.
pub struct DemoConfig {
    /// Persisted engine blob. Its directory is cleared of `*.trt` files on
    /// startup.
    pub engine_path: PathBuf,
    pub input_name: String,
    pub output_name: String,
    /// Bounds for the dynamic input; buffers are sized for `profile.max`.
    pub profile: OptimizationProfile,
    /// Builder workspace pool limit.
    pub workspace_bytes: usize,
    /// CUDA device to initialise.
    pub device_ordinal: i32,
    pub capture_mode: CaptureMode,
    /// Vendor log messages less severe than this are dropped.
    pub log_severity: LogSeverity,
    /// One inference per shape, in order.
    pub shapes: Vec<Shape>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        let input_name = "inputT0";
        Self {
            engine_path: PathBuf::from("./engine.trt"),
            input_name: input_name.into(),
            output_name: "outputT0".into(),
            profile: OptimizationProfile::new(input_name, [1, 1, 1], [3, 4, 5], [6, 8, 10]),
            workspace_bytes: 1 << 30,
            device_ordinal: 0,
            capture_mode: CaptureMode::Global,
            log_severity: LogSeverity::Error,
            shapes: vec![Shape::new([3, 4, 5]), Shape::new([2, 3, 4])],
        }
    }
}

impl DemoConfig {
    /// Directory holding the engine file; `.` for a bare file name.
    pub fn engine_dir(&self) -> &Path {
        match self.engine_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Dynamic `Float` input of the profile's rank through one identity layer.
    pub fn network(&self) -> NetworkDefinition {
        NetworkDefinition::identity(&self.input_name, &self.output_name, self.profile.min.rank())
    }

    /// `profile` bound to `input_name`, whatever tensor it was written for.
    pub fn input_profile(&self) -> OptimizationProfile {
        OptimizationProfile {
            input: self.input_name.clone(),
            ..self.profile.clone()
        }
    }

    pub fn builder_config(&self) -> BuilderConfig {
        let mut config = BuilderConfig {
            workspace_bytes: self.workspace_bytes,
            ..BuilderConfig::default()
        };
        config.add_optimization_profile(self.input_profile());
        config
    }
}
