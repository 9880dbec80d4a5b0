//! Hardware detection for accelerator classification.
//!
//! Probes the local generator runtime for VRAM allocation to classify the
//! host into a capacity class. The class drives scheduler worker counts and
//! model-layer offload defaults; it is advisory and never enforced elsewhere.

use serde::{Deserialize, Serialize};

use crate::backends::ollama::OllamaClient;

/// Env override pinning the profile (tests, manual tuning).
pub const FORCE_PROFILE_ENV: &str = "CHAIRSIDE_FORCE_PROFILE";

/// VRAM at or above this is treated as a high-capacity accelerator.
const HIGH_VRAM_BYTES: u64 = 8 * 1024 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Capacity class computed once at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareProfile {
    HighVram,
    LowVram,
    CpuOnly,
}

impl std::fmt::Display for HardwareProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighVram => write!(f, "high_vram"),
            Self::LowVram => write!(f, "low_vram"),
            Self::CpuOnly => write!(f, "cpu_only"),
        }
    }
}

impl HardwareProfile {
    /// Generate-queue worker count for this class.
    pub fn generate_workers(&self) -> usize {
        match self {
            Self::HighVram => 2,
            Self::LowVram | Self::CpuOnly => 1,
        }
    }

    /// Default GPU layer offload hint passed to the generator backend.
    pub fn offload_layers(&self) -> Option<u32> {
        match self {
            Self::HighVram => None, // runtime default: everything on GPU
            Self::LowVram => Some(20),
            Self::CpuOnly => Some(0),
        }
    }
}

/// Raw probe result behind the classification.
///
/// Conservative: defaults to CPU-only if detection fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareReport {
    /// Total VRAM allocated to loaded models (bytes). 0 = CPU-only.
    pub vram_bytes: u64,
    /// Total model size in memory (bytes).
    pub total_model_bytes: u64,
    /// Processor label from the runtime (e.g., "100% GPU", "CPU").
    pub processor_label: String,
    /// ISO 8601 timestamp when detection occurred.
    pub detected_at: String,
}

impl HardwareReport {
    /// Classify into a capacity class.
    pub fn profile(&self) -> HardwareProfile {
        if self.vram_bytes == 0 {
            HardwareProfile::CpuOnly
        } else if self.vram_bytes >= HIGH_VRAM_BYTES {
            HardwareProfile::HighVram
        } else {
            HardwareProfile::LowVram
        }
    }

    /// Conservative fallback when detection fails.
    pub fn cpu_fallback() -> Self {
        Self {
            vram_bytes: 0,
            total_model_bytes: 0,
            processor_label: "CPU (detection unavailable)".to_string(),
            detected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Detection
// ═══════════════════════════════════════════════════════════

/// Detect the capacity class, honouring the `CHAIRSIDE_FORCE_PROFILE` pin.
pub fn detect_profile(client: &OllamaClient) -> HardwareProfile {
    if let Ok(forced) = std::env::var(FORCE_PROFILE_ENV) {
        match forced.as_str() {
            "high_vram" => return HardwareProfile::HighVram,
            "low_vram" => return HardwareProfile::LowVram,
            "cpu_only" => return HardwareProfile::CpuOnly,
            other => {
                tracing::warn!(value = %other, "Unrecognised forced hardware profile, probing instead");
            }
        }
    }
    detect_hardware(client).profile()
}

/// Probe the generator runtime for loaded-model VRAM allocation.
///
/// Falls back to `HardwareReport::cpu_fallback()` if the runtime is
/// unreachable or no models are currently loaded.
pub fn detect_hardware(client: &OllamaClient) -> HardwareReport {
    let _span = tracing::info_span!("hardware_detect").entered();

    match client.list_running_models() {
        Ok(models) if !models.is_empty() => {
            let total_size: u64 = models.iter().map(|m| m.size).sum();
            let total_vram: u64 = models.iter().map(|m| m.size_vram).sum();

            let processor_label = if models.len() == 1 {
                models[0].processor.clone()
            } else {
                let gpu_count = models.iter().filter(|m| m.size_vram > 0).count();
                if gpu_count == models.len() {
                    "GPU (all models)".to_string()
                } else if gpu_count > 0 {
                    format!("Mixed ({gpu_count}/{} on GPU)", models.len())
                } else {
                    "CPU (all models)".to_string()
                }
            };

            let report = HardwareReport {
                vram_bytes: total_vram,
                total_model_bytes: total_size,
                processor_label,
                detected_at: chrono::Utc::now().to_rfc3339(),
            };
            tracing::info!(
                vram_bytes = report.vram_bytes,
                profile = %report.profile(),
                "Hardware detected"
            );
            report
        }
        Ok(_) => {
            tracing::info!("No models loaded; assuming CPU-only");
            HardwareReport::cpu_fallback()
        }
        Err(e) => {
            tracing::debug!(error = %e, "Hardware probe failed; assuming CPU-only");
            HardwareReport::cpu_fallback()
        }
    }
}
