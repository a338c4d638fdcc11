//! Extension capability check.
//!
//! A discovered type qualifies as an extension when it can be constructed
//! with a configuration section and exposes a `setup` hook.

use std::fmt;

/// What a discovered type turned out to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shape {
    /// False when the exported value is not a type at all.
    pub is_type: bool,
    pub constructor: bool,
    pub setup: bool,
}

impl Shape {
    /// The shape of a type that satisfies the whole contract.
    pub const COMPLETE: Self = Self {
        is_type: true,
        constructor: true,
        setup: true,
    };
}

/// Why a type was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonconformance {
    NotAType,
    MissingConstructor,
    MissingSetup,
}

impl fmt::Display for Nonconformance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotAType => "not an extension type",
            Self::MissingConstructor => "no constructor accepting a config section",
            Self::MissingSetup => "no setup hook",
        })
    }
}

pub fn check(shape: Shape) -> Result<(), Nonconformance> {
    if !shape.is_type {
        Err(Nonconformance::NotAType)
    } else if !shape.constructor {
        Err(Nonconformance::MissingConstructor)
    } else if !shape.setup {
        Err(Nonconformance::MissingSetup)
    } else {
        Ok(())
    }
}
