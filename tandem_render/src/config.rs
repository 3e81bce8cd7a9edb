use std::path::PathBuf;

use crate::backend::{BackendKind, DescriptorKind};

/// Backend requested by the application.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendSelection {
    /// The native backend of the platform.
    #[default]
    Auto,
    Backend(BackendKind),
}

impl BackendSelection {
    pub fn resolve(self) -> BackendKind {
        match self {
            Self::Auto => BackendKind::platform_default(),
            Self::Backend(kind) => kind,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AdapterPreference {
    /// The first discrete GPU, otherwise the first suitable adapter.
    #[default]
    HighPerformance,
    Index(usize),
    /// First adapter whose name contains the string, ignoring case.
    Name(String),
}

/// Capacity of the descriptor pool for each [`DescriptorKind`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorCapacities {
    capacities: [u32; DescriptorKind::ALL.len()],
}

impl DescriptorCapacities {
    pub fn get(&self, kind: DescriptorKind) -> u32 {
        self.capacities[kind as usize]
    }

    pub fn set(&mut self, kind: DescriptorKind, capacity: u32) {
        self.capacities[kind as usize] = capacity;
    }

    /// Sum of all capacities that live in a resource (CBV/SRV/UAV) heap.
    pub fn resource_total(&self) -> u32 {
        DescriptorKind::ALL
            .iter()
            .filter(|kind| **kind != DescriptorKind::Sampler)
            .map(|kind| self.get(*kind))
            .sum()
    }
}

impl Default for DescriptorCapacities {
    fn default() -> Self {
        let mut this = Self {
            capacities: [64; DescriptorKind::ALL.len()],
        };
        this.set(DescriptorKind::Sampler, 128);
        this.set(DescriptorKind::SampledImage, 1024);
        this.set(DescriptorKind::CombinedImageSampler, 256);
        this.set(DescriptorKind::UniformBuffer, 2048);
        this.set(DescriptorKind::StorageBuffer, 256);
        this
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RendererConfig {
    pub backend: BackendSelection,
    pub adapter: AdapterPreference,
    /// Number of submission contexts recorded ahead of the GPU.
    pub frames_in_flight: u32,
    /// Number of swapchain images. Must be 2 or 3.
    pub swapchain_images: u32,
    pub vsync: bool,
    /// Draws meshes as wireframes if the adapter supports it.
    pub wireframe: bool,
    /// Enables API validation layers when they are available.
    pub validation: bool,
    pub app_name: String,
    /// Directory containing `<name>.wgsl` shader sources.
    pub shader_dir: PathBuf,
    /// Compile shaders with debug information and without optimizations.
    pub shader_debug: bool,
    /// Watch `shader_dir` and recompile changed shaders.
    pub shader_hot_reload: bool,
    /// Pipeline cache directory. Defaults to `<documents>/<app_name>`.
    pub pipeline_cache_dir: Option<PathBuf>,
    pub descriptors: DescriptorCapacities,
    /// Size of the host-visible staging arena in bytes. Rounded up to a power of two.
    pub staging_capacity: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendSelection::Auto,
            adapter: AdapterPreference::HighPerformance,
            frames_in_flight: 3,
            swapchain_images: 3,
            vsync: true,
            wireframe: false,
            validation: cfg!(debug_assertions),
            app_name: "tandem".to_owned(),
            shader_dir: PathBuf::from("assets/shaders"),
            shader_debug: cfg!(debug_assertions),
            shader_hot_reload: false,
            pipeline_cache_dir: None,
            descriptors: DescriptorCapacities::default(),
            staging_capacity: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("swapchain image count must be 2 or 3, got {0}")]
    SwapchainImages(u32),
    #[error("frames in flight must be at least 1")]
    FramesInFlight,
    #[error("descriptor capacity of {0:?} is zero")]
    DescriptorCapacity(DescriptorKind),
    #[error("staging capacity is zero")]
    StagingCapacity,
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

impl RendererConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=3).contains(&self.swapchain_images) {
            return Err(ConfigError::SwapchainImages(self.swapchain_images));
        }

        if self.frames_in_flight == 0 {
            return Err(ConfigError::FramesInFlight);
        }

        for kind in DescriptorKind::ALL {
            if self.descriptors.get(kind) == 0 {
                return Err(ConfigError::DescriptorCapacity(kind));
            }
        }

        if self.staging_capacity == 0 {
            return Err(ConfigError::StagingCapacity);
        }

        Ok(())
    }

    /// Applies `TANDEM_*` environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|var| std::env::var(var).ok())
    }

    fn apply_vars<F>(&mut self, mut get: F) -> Result<(), ConfigError>
    where
        F: FnMut(&'static str) -> Option<String>,
    {
        if let Some(value) = get("TANDEM_BACKEND") {
            self.backend = if value.eq_ignore_ascii_case("auto") {
                BackendSelection::Auto
            } else {
                let kind = value.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "TANDEM_BACKEND",
                    value: value.clone(),
                })?;
                BackendSelection::Backend(kind)
            };
        }

        if let Some(value) = get("TANDEM_VSYNC") {
            self.vsync = parse_bool("TANDEM_VSYNC", &value)?;
        }

        if let Some(value) = get("TANDEM_VALIDATION") {
            self.validation = parse_bool("TANDEM_VALIDATION", &value)?;
        }

        if let Some(value) = get("TANDEM_ADAPTER") {
            self.adapter = match value.parse::<usize>() {
                Ok(index) => AdapterPreference::Index(index),
                Err(_) => AdapterPreference::Name(value),
            };
        }

        if let Some(value) = get("TANDEM_FRAMES_IN_FLIGHT") {
            self.frames_in_flight = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "TANDEM_FRAMES_IN_FLIGHT",
                value: value.clone(),
            })?;
        }

        Ok(())
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::backend::{BackendKind, DescriptorKind};

    use super::{AdapterPreference, BackendSelection, ConfigError, RendererConfig};

    fn apply(config: &mut RendererConfig, vars: &[(&str, &str)]) -> Result<(), ConfigError> {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        config.apply_vars(|var| vars.get(var).map(|value| value.to_string()))
    }

    #[test]
    fn default_config_is_valid() {
        RendererConfig::default().validate().unwrap();
    }

    #[test]
    fn swapchain_image_count_range() {
        let mut config = RendererConfig::default();
        config.swapchain_images = 4;
        assert_eq!(config.validate(), Err(ConfigError::SwapchainImages(4)));

        config.swapchain_images = 2;
        config.validate().unwrap();
    }

    #[test]
    fn zero_descriptor_capacity_rejected() {
        let mut config = RendererConfig::default();
        config.descriptors.set(DescriptorKind::InputAttachment, 0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::DescriptorCapacity(DescriptorKind::InputAttachment))
        );
    }

    #[test]
    fn env_overrides() {
        let mut config = RendererConfig::default();
        apply(
            &mut config,
            &[
                ("TANDEM_BACKEND", "null"),
                ("TANDEM_VSYNC", "0"),
                ("TANDEM_ADAPTER", "radeon"),
                ("TANDEM_FRAMES_IN_FLIGHT", "2"),
            ],
        )
        .unwrap();

        assert_eq!(config.backend, BackendSelection::Backend(BackendKind::Null));
        assert!(!config.vsync);
        assert_eq!(config.adapter, AdapterPreference::Name("radeon".to_owned()));
        assert_eq!(config.frames_in_flight, 2);
    }

    #[test]
    fn env_invalid_value() {
        let mut config = RendererConfig::default();
        let err = apply(&mut config, &[("TANDEM_VSYNC", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TANDEM_VSYNC", .. }));
    }
}
