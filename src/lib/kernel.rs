//! # Yield Kernel Source
//!
//! The per-item yield computation that runs on the device. The program text is
//! an immutable, versioned asset: the `ProgramCache` keys compiled artifacts by
//! `(name, version)`, so any change to [`YIELD_KERNEL_TEXT`] must come with a
//! version bump.
//!
//! Each lane computes one item independently:
//!
//! ```text
//! climate_factor = 1.0 if 20.0 <= temperature[i] <= 30.0 else 0.5
//! result[i]      = area[i] * 3.0 * climate_factor
//! ```

use serde::{Deserialize, Serialize};

/// Base productivity per unit of area.
pub const YIELD_FACTOR: f32 = 3.0;
/// Lower bound (inclusive) of the optimal temperature band.
pub const OPTIMAL_TEMP_MIN: f32 = 20.0;
/// Upper bound (inclusive) of the optimal temperature band.
pub const OPTIMAL_TEMP_MAX: f32 = 30.0;
/// Climate factor applied outside the optimal band.
pub const CLIMATE_PENALTY: f32 = 0.5;

/// Entry point name inside [`YIELD_KERNEL_TEXT`].
pub const YIELD_KERNEL_ENTRY: &str = "simulate_harvest";

/// Current version of [`YIELD_KERNEL_TEXT`].
pub const YIELD_KERNEL_VERSION: u32 = 1;

/// Device program text. Parameter order is the kernel ABI:
/// `(areas, temperatures, results, count)`.
pub const YIELD_KERNEL_TEXT: &str = r#"
extern "C" __global__ void simulate_harvest(const float* areas,
                                            const float* temperatures,
                                            float* results,
                                            const int count) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;

    if (i < count) {
        float area = areas[i];
        float temp = temperatures[i];

        float climate_factor = 0.5f;
        if (temp >= 20.0f && temp <= 30.0f) {
            climate_factor = 1.0f;
        }

        results[i] = area * 3.0f * climate_factor;
    }
}
"#;

/// A named, versioned piece of device program text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSource {
    /// Logical program name, used for module naming and cache keys
    pub name: String,
    /// Monotonic version of `text`
    pub version: u32,
    /// Entry point looked up after compilation
    pub entry: String,
    /// Program text handed to the backend compiler
    pub text: String,
}

impl KernelSource {
    /// Create a kernel source from its parts
    pub fn new(name: &str, version: u32, entry: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            version,
            entry: entry.to_string(),
            text: text.to_string(),
        }
    }

    /// The built-in yield kernel.
    pub fn yield_kernel() -> Self {
        Self::new(
            "harvest",
            YIELD_KERNEL_VERSION,
            YIELD_KERNEL_ENTRY,
            YIELD_KERNEL_TEXT,
        )
    }

    /// Module name used when loading the compiled artifact, unique per version.
    pub fn module_name(&self) -> String {
        format!("{}_v{}", self.name, self.version)
    }

    /// Replace the program text and bump the version.
    pub fn revise(&self, text: &str) -> Self {
        Self {
            text: text.to_string(),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

impl Default for KernelSource {
    fn default() -> Self {
        Self::yield_kernel()
    }
}

/// Host reference for one lane of the yield kernel.
#[inline]
pub fn estimate_yield(area: f32, temperature: f32) -> f32 {
    let climate_factor = if (OPTIMAL_TEMP_MIN..=OPTIMAL_TEMP_MAX).contains(&temperature) {
        1.0
    } else {
        CLIMATE_PENALTY
    };
    area * YIELD_FACTOR * climate_factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_scenarios() {
        assert_eq!(estimate_yield(100.0, 25.0), 300.0);
        assert_eq!(estimate_yield(100.0, 35.0), 150.0);
        assert_eq!(estimate_yield(0.0, 25.0), 0.0);
    }

    #[test]
    fn test_band_is_inclusive() {
        assert_eq!(estimate_yield(10.0, 20.0), 30.0);
        assert_eq!(estimate_yield(10.0, 30.0), 30.0);
        assert_eq!(estimate_yield(10.0, 19.999), 15.0);
        assert_eq!(estimate_yield(10.0, 30.001), 15.0);
    }

    #[test]
    fn test_nan_temperature_takes_penalty() {
        assert_eq!(estimate_yield(10.0, f32::NAN), 15.0);
    }

    #[test]
    fn test_device_text_matches_reference_constants() {
        let text = YIELD_KERNEL_TEXT;
        assert!(text.contains("float climate_factor = 0.5f;"));
        assert!(text.contains("temp >= 20.0f && temp <= 30.0f"));
        assert!(text.contains("climate_factor = 1.0f;"));
        assert!(text.contains("results[i] = area * 3.0f * climate_factor;"));
        assert!(text.contains("if (i < count)"));

        assert_eq!(YIELD_FACTOR, 3.0);
        assert_eq!((OPTIMAL_TEMP_MIN, OPTIMAL_TEMP_MAX), (20.0, 30.0));
        assert_eq!(CLIMATE_PENALTY, 0.5);
    }

    #[test]
    fn test_source_carries_entry_point() {
        let src = KernelSource::yield_kernel();
        assert!(src.text.contains(&src.entry));
        assert_eq!(src.module_name(), "harvest_v1");

        let revised = src.revise("// nothing");
        assert_eq!(revised.version, src.version + 1);
        assert_eq!(revised.entry, src.entry);
    }
}
