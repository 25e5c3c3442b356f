//! TOSA target specifications.
//!
//! A [`TosaSpecification`] names the output dialect version, the numeric
//! profile and any extensions of the target. It is parsed from the canonical
//! string form used throughout the toolchain:
//!
//! ```text
//! TOSA-<major>.<minor>[.<patch>]+<PROFILE>[+<extension>]*
//! ```
//!
//! ```
//! use tosalower_ir::{NumericProfile, TosaSpecification};
//!
//! let spec: TosaSpecification = "TOSA-0.80+BI+u55".parse().unwrap();
//! assert!(spec.is_restricted());
//! assert_eq!(spec.numeric_profile(), NumericProfile::IntegerQuantized);
//! assert_eq!(spec.to_string(), "TOSA-0.80+BI+u55");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::IrError;

/// Dialect version of the target IR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TosaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl TosaVersion {
    pub const V0_80: TosaVersion = TosaVersion::new(0, 80, 0);
    pub const V1_0: TosaVersion = TosaVersion::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        TosaVersion {
            major,
            minor,
            patch,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return None;
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in parts.iter().enumerate() {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            numbers[slot] = part.parse().ok()?;
        }
        Some(TosaVersion::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for TosaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// Profile of a target. 0.x targets use BI/MI, 1.x targets use INT/FP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Profile {
    /// Base inference (integer only), 0.x.
    BaseInference,
    /// Main inference (integer and float), 0.x.
    MainInference,
    /// Integer profile, 1.x.
    Integer,
    /// Floating-point profile, 1.x.
    FloatingPoint,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::BaseInference => "BI",
            Profile::MainInference => "MI",
            Profile::Integer => "INT",
            Profile::FloatingPoint => "FP",
        }
    }

    fn parse(text: &str, major: u32) -> Option<Self> {
        match (major, text) {
            (0, "BI") => Some(Profile::BaseInference),
            (0, "MI") => Some(Profile::MainInference),
            (m, "INT") if m >= 1 => Some(Profile::Integer),
            (m, "FP") if m >= 1 => Some(Profile::FloatingPoint),
            _ => None,
        }
    }
}

/// Numeric domain the pipeline compiles for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericProfile {
    IntegerQuantized,
    FloatingPoint,
}

/// Optional capability extensions of a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Extension {
    /// Ethos-U55 restricted subset.
    U55,
    Int16,
    Int4,
    Bf16,
    Fp8e4m3,
    Fp8e5m2,
    Fft,
    Variable,
    ControlFlow,
    DoubleRound,
    InexactRound,
}

impl Extension {
    pub const ALL: [Extension; 11] = [
        Extension::U55,
        Extension::Int16,
        Extension::Int4,
        Extension::Bf16,
        Extension::Fp8e4m3,
        Extension::Fp8e5m2,
        Extension::Fft,
        Extension::Variable,
        Extension::ControlFlow,
        Extension::DoubleRound,
        Extension::InexactRound,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Extension::U55 => "u55",
            Extension::Int16 => "int16",
            Extension::Int4 => "int4",
            Extension::Bf16 => "bf16",
            Extension::Fp8e4m3 => "fp8e4m3",
            Extension::Fp8e5m2 => "fp8e5m2",
            Extension::Fft => "fft",
            Extension::Variable => "variable",
            Extension::ControlFlow => "controlflow",
            Extension::DoubleRound => "doubleround",
            Extension::InexactRound => "inexactround",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        Extension::ALL.into_iter().find(|e| e.as_str() == text)
    }
}

/// Immutable identification of the compilation target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TosaSpecification {
    version: TosaVersion,
    profile: Profile,
    extensions: BTreeSet<Extension>,
}

impl TosaSpecification {
    pub fn new(version: TosaVersion, profile: Profile) -> Self {
        TosaSpecification {
            version,
            profile,
            extensions: BTreeSet::new(),
        }
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extensions.insert(extension);
        self
    }

    pub fn version(&self) -> TosaVersion {
        self.version
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn extensions(&self) -> impl Iterator<Item = Extension> + '_ {
        self.extensions.iter().copied()
    }

    pub fn has_extension(&self, extension: Extension) -> bool {
        self.extensions.contains(&extension)
    }

    /// True for restricted-capability device subsets (Ethos-U55).
    pub fn is_restricted(&self) -> bool {
        self.has_extension(Extension::U55)
    }

    /// True for the 0.x dialect era.
    pub fn is_legacy(&self) -> bool {
        self.version.major == 0
    }

    pub fn numeric_profile(&self) -> NumericProfile {
        match self.profile {
            Profile::BaseInference | Profile::Integer => NumericProfile::IntegerQuantized,
            Profile::MainInference | Profile::FloatingPoint => NumericProfile::FloatingPoint,
        }
    }

    pub fn supports_integer(&self) -> bool {
        matches!(
            self.profile,
            Profile::BaseInference | Profile::MainInference | Profile::Integer
        )
    }

    pub fn supports_float(&self) -> bool {
        matches!(
            self.profile,
            Profile::MainInference | Profile::FloatingPoint
        )
    }
}

impl fmt::Display for TosaSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TOSA-{}+{}", self.version, self.profile.as_str())?;
        for ext in &self.extensions {
            write!(f, "+{}", ext.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for TosaSpecification {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| IrError::InvalidSpecification {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s
            .strip_prefix("TOSA-")
            .ok_or_else(|| invalid("expected 'TOSA-' prefix"))?;
        let mut parts = rest.split('+');
        let version_text = parts.next().unwrap_or_default();
        let version =
            TosaVersion::parse(version_text).ok_or_else(|| invalid("malformed version"))?;

        let profile_text = parts.next().ok_or_else(|| invalid("missing profile"))?;
        let profile = Profile::parse(profile_text, version.major)
            .ok_or_else(|| invalid("unknown profile for this version"))?;

        let mut spec = TosaSpecification::new(version, profile);
        for text in parts {
            let ext = Extension::parse(text).ok_or_else(|| invalid("unknown extension"))?;
            if !spec.extensions.insert(ext) {
                return Err(invalid("duplicate extension"));
            }
        }
        Ok(spec)
    }
}

impl TryFrom<String> for TosaSpecification {
    type Error = IrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TosaSpecification> for String {
    fn from(spec: TosaSpecification) -> Self {
        spec.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_is_optional() {
        let a: TosaSpecification = "TOSA-0.80+BI".parse().unwrap();
        let b: TosaSpecification = "TOSA-0.80.0+BI".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(b.to_string(), "TOSA-0.80+BI");
    }

    #[test]
    fn test_profiles_are_version_bound() {
        assert!("TOSA-1.0+BI".parse::<TosaSpecification>().is_err());
        assert!("TOSA-0.80+INT".parse::<TosaSpecification>().is_err());
        assert!("TOSA-1.0+FP".parse::<TosaSpecification>().is_ok());
    }

    #[test]
    fn test_malformed_strings() {
        for text in [
            "",
            "TOSA",
            "TOSA-",
            "TOSA-1+INT",
            "TOSA-1.0.0.0+INT",
            "TOSA-a.b+INT",
            "TOSA-1.0",
            "TOSA-1.0+int",
            "TOSA-1.0+INT+u66",
            "TOSA-1.0+INT+u55+u55",
            "tosa-1.0+INT",
        ] {
            let err = text.parse::<TosaSpecification>().unwrap_err();
            assert!(
                matches!(err, IrError::InvalidSpecification { .. }),
                "{text:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_extensions() {
        let spec: TosaSpecification = "TOSA-1.0+INT+int16+u55".parse().unwrap();
        assert!(spec.is_restricted());
        assert!(spec.has_extension(Extension::Int16));
        assert_eq!(spec.to_string(), "TOSA-1.0+INT+u55+int16");
        let again: TosaSpecification = spec.to_string().parse().unwrap();
        assert_eq!(spec, again);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let spec: TosaSpecification = "TOSA-1.0+FP".parse().unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"TOSA-1.0+FP\"");
        let back: TosaSpecification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert!(serde_json::from_str::<TosaSpecification>("\"TOSA-9\"").is_err());
    }
}
