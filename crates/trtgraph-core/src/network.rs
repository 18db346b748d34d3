use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::shape::{DataType, Dims, OptimizationProfile};

/// Declared network input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDecl {
    pub name: String,
    pub dtype: DataType,
    pub dims: Dims,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    /// Copies `input` to a new tensor named `output`.
    Identity { input: String, output: String },
}

impl Layer {
    pub fn input(&self) -> &str {
        match self {
            Layer::Identity { input, .. } => input,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            Layer::Identity { output, .. } => output,
        }
    }
}

/// Explicit-batch network description handed to a backend's builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub inputs: Vec<TensorDecl>,
    pub layers: Vec<Layer>,
    pub outputs: Vec<String>,
}

impl NetworkDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>, dtype: DataType, dims: Dims) -> &mut Self {
        self.inputs.push(TensorDecl {
            name: name.into(),
            dtype,
            dims,
        });
        self
    }

    pub fn add_identity(&mut self, input: impl Into<String>, output: impl Into<String>) -> &mut Self {
        self.layers.push(Layer::Identity {
            input: input.into(),
            output: output.into(),
        });
        self
    }

    pub fn mark_output(&mut self, name: impl Into<String>) -> &mut Self {
        self.outputs.push(name.into());
        self
    }

    /// One dynamic `Float` input of the given rank through an identity layer.
    pub fn identity(input: &str, output: &str, rank: usize) -> Self {
        let mut network = Self::new();
        network
            .add_input(input, DataType::Float, Dims::dynamic(rank))
            .add_identity(input, output)
            .mark_output(output);
        network
    }

    pub fn input(&self, name: &str) -> Option<&TensorDecl> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// For every tensor, the network input it derives from.
    pub fn sources(&self) -> HashMap<&str, &str> {
        let mut sources: HashMap<&str, &str> = self
            .inputs
            .iter()
            .map(|t| (t.name.as_str(), t.name.as_str()))
            .collect();
        for layer in &self.layers {
            if let Some(&root) = sources.get(layer.input()) {
                sources.insert(layer.output(), root);
            }
        }
        sources
    }

    /// Everything a builder rejects before it would emit a plan: dangling
    /// layer inputs, duplicate names, no outputs, unknown outputs, dynamic
    /// inputs without a valid profile.
    pub fn validate(&self, config: &BuilderConfig) -> Result<(), String> {
        if self.inputs.is_empty() {
            return Err("network has no inputs".into());
        }
        if self.outputs.is_empty() {
            return Err("network has no marked outputs".into());
        }
        let mut defined: Vec<&str> = Vec::new();
        for input in &self.inputs {
            if defined.contains(&input.name.as_str()) {
                return Err(format!("duplicate tensor name '{}'", input.name));
            }
            defined.push(&input.name);
        }
        for layer in &self.layers {
            if !defined.contains(&layer.input()) {
                return Err(format!("layer input '{}' is not defined", layer.input()));
            }
            if defined.contains(&layer.output()) {
                return Err(format!("duplicate tensor name '{}'", layer.output()));
            }
            defined.push(layer.output());
        }
        for output in &self.outputs {
            if !defined.contains(&output.as_str()) {
                return Err(format!("marked output '{output}' is not defined"));
            }
        }
        for input in self.inputs.iter().filter(|t| t.dims.is_dynamic()) {
            let profile = config
                .profiles
                .iter()
                .find(|p| p.input == input.name)
                .ok_or_else(|| {
                    format!("dynamic input '{}' has no optimization profile", input.name)
                })?;
            profile.validate(&input.dims).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Builder settings: workspace pool limit plus optimization profiles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub workspace_bytes: usize,
    pub profiles: Vec<OptimizationProfile>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            workspace_bytes: 1 << 30,
            profiles: Vec::new(),
        }
    }
}

impl BuilderConfig {
    pub fn add_optimization_profile(&mut self, profile: OptimizationProfile) -> &mut Self {
        self.profiles.push(profile);
        self
    }

    pub fn profile_for(&self, input: &str) -> Option<&OptimizationProfile> {
        self.profiles.iter().find(|p| p.input == input)
    }
}

/// Direction of an engine IO tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorIoMode {
    Input,
    Output,
}

/// One row of an engine's IO tensor table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoTensor {
    pub name: String,
    pub mode: TensorIoMode,
    pub dtype: DataType,
}

/// Vendor logger threshold; messages at or above this severity are kept.
/// Ordered as TensorRT's `ILogger::Severity` (lower is more severe).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    InternalError = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_config() -> BuilderConfig {
        let mut config = BuilderConfig::default();
        config.add_optimization_profile(OptimizationProfile::new(
            "inputT0",
            [1, 1, 1],
            [3, 4, 5],
            [6, 8, 10],
        ));
        config
    }

    #[test]
    fn identity_network_is_valid() {
        let network = NetworkDefinition::identity("inputT0", "outputT0", 3);
        assert_eq!(network.validate(&demo_config()), Ok(()));
        assert_eq!(network.sources().get("outputT0"), Some(&"inputT0"));
    }

    #[test]
    fn missing_output_is_rejected() {
        let mut network = NetworkDefinition::new();
        network
            .add_input("inputT0", DataType::Float, Dims::dynamic(3))
            .add_identity("inputT0", "outputT0");
        let err = network.validate(&demo_config()).unwrap_err();
        assert!(err.contains("no marked outputs"), "{err}");
    }

    #[test]
    fn dynamic_input_needs_profile() {
        let network = NetworkDefinition::identity("inputT0", "outputT0", 3);
        let err = network.validate(&BuilderConfig::default()).unwrap_err();
        assert!(err.contains("no optimization profile"), "{err}");
    }

    #[test]
    fn dangling_layer_is_rejected() {
        let mut network = NetworkDefinition::identity("inputT0", "outputT0", 3);
        network.add_identity("missing", "other");
        assert!(network.validate(&demo_config()).is_err());
    }

    #[test]
    fn default_workspace_is_one_gib() {
        assert_eq!(BuilderConfig::default().workspace_bytes, 1 << 30);
    }

    #[test]
    fn severity_orders_like_tensorrt() {
        assert!(LogSeverity::Error < LogSeverity::Warning);
        assert!(LogSeverity::InternalError < LogSeverity::Error);
    }
}
