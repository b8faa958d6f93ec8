// src/compat.rs

//! Device compatibility checks
//!
//! The synchronization pipeline asks a [`CompatibilityChecker`] about every
//! version it ingests and stores the answer alongside the version. Checkers
//! run on rayon worker threads, so they must be `Send + Sync`.

use crate::db::models::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware feature that many devices lack but most apps work without
pub const TOUCHSCREEN_FEATURE: &str = "android.hardware.touchscreen";

/// Why a version cannot run on the current device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncompatibilityReason {
    /// Device platform level is below the version's minimum
    MinSdk(i32),
    /// Device platform level is above the version's maximum
    MaxSdk(i32),
    /// A required hardware feature is missing
    Feature(String),
    /// None of the bundled native-code ABIs run on the device
    NativeCode(Vec<String>),
}

impl fmt::Display for IncompatibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinSdk(sdk) => write!(f, "requires sdk >= {}", sdk),
            Self::MaxSdk(sdk) => write!(f, "requires sdk <= {}", sdk),
            Self::Feature(feature) => write!(f, "{}", feature),
            Self::NativeCode(abis) => write!(f, "native code: {}", abis.join(",")),
        }
    }
}

/// Decides whether a version can run on the device
pub trait CompatibilityChecker: Send + Sync {
    /// Empty result means compatible
    fn check(&self, version: &Version) -> Vec<IncompatibilityReason>;
}

/// The device the catalog is resolving for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub sdk_int: i32,
    /// Supported ABIs, most preferred first
    pub abis: Vec<String>,
    pub features: Vec<String>,
    pub ignore_touchscreen: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            sdk_int: 34,
            abis: vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()],
            features: Vec::new(),
            ignore_touchscreen: true,
        }
    }
}

impl CompatibilityChecker for DeviceProfile {
    fn check(&self, version: &Version) -> Vec<IncompatibilityReason> {
        let mut reasons = Vec::new();

        if let Some(min_sdk) = version.min_sdk
            && self.sdk_int < min_sdk
        {
            reasons.push(IncompatibilityReason::MinSdk(min_sdk));
        }
        if let Some(max_sdk) = version.max_sdk
            && max_sdk > 0
            && self.sdk_int > max_sdk
        {
            reasons.push(IncompatibilityReason::MaxSdk(max_sdk));
        }

        for feature in &version.features {
            if self.ignore_touchscreen && feature == TOUCHSCREEN_FEATURE {
                continue;
            }
            if !self.features.contains(feature) {
                reasons.push(IncompatibilityReason::Feature(feature.clone()));
            }
        }

        if !version.native_code.is_empty()
            && !version.native_code.iter().any(|abi| self.abis.contains(abi))
        {
            reasons.push(IncompatibilityReason::NativeCode(version.native_code.clone()));
        }

        reasons
    }
}

/// Accepts everything; for callers that do not care about device fit
#[derive(Debug, Clone, Copy, Default)]
pub struct AllCompatible;

impl CompatibilityChecker for AllCompatible {
    fn check(&self, _version: &Version) -> Vec<IncompatibilityReason> {
        Vec::new()
    }
}
