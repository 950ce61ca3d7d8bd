// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tagged parameter values.
//!
//! One variant enum replaces a per-type class hierarchy: clamp, snap,
//! rendering and wire conversion all dispatch on the tag.

/// On-wire scalar type tag. The integer values are part of the wire
/// and cache-catalog contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32 = 1,
    Float64 = 2,
    Int8 = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    UInt8 = 7,
    UInt16 = 8,
    UInt32 = 9,
    UInt64 = 10,
    Bool = 11,
    String = 12,
    Choice = 13,
    Color = 14,
    Vector = 15,
    Trigger = 16,
}

impl DataType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => Self::Float32,
            2 => Self::Float64,
            3 => Self::Int8,
            4 => Self::Int16,
            5 => Self::Int32,
            6 => Self::Int64,
            7 => Self::UInt8,
            8 => Self::UInt16,
            9 => Self::UInt32,
            10 => Self::UInt64,
            11 => Self::Bool,
            12 => Self::String,
            13 => Self::Choice,
            14 => Self::Color,
            15 => Self::Vector,
            16 => Self::Trigger,
            _ => return None,
        })
    }
}

/// How a parameter renders inside path templates and command lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpaceRepresentation {
    /// The scalar value in its default string form.
    #[default]
    Value,
    /// The index into the candidate space.
    Index,
    /// The id string at the current index.
    Id,
}

impl SpaceRepresentation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "VALUE" | "value" => Some(Self::Value),
            "INDEX" | "index" => Some(Self::Index),
            "ID" | "id" => Some(Self::Id),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Value => "VALUE",
            Self::Index => "INDEX",
            Self::Id => "ID",
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Double(f64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    String(String),
    /// Unsigned bitmask over an ordered element list.
    Choice(u64),
    /// RGBA, four floats.
    Color([f32; 4]),
    /// N floats, N fixed per parameter instance.
    Vector(Vec<f32>),
    /// Edge-only bool: a true transition fires callbacks then snaps back.
    Trigger(bool),
}

impl ParamValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Float(_) => DataType::Float32,
            Self::Double(_) => DataType::Float64,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt8(_) => DataType::UInt8,
            Self::UInt16(_) => DataType::UInt16,
            Self::UInt32(_) => DataType::UInt32,
            Self::UInt64(_) => DataType::UInt64,
            Self::Bool(_) => DataType::Bool,
            Self::String(_) => DataType::String,
            Self::Choice(_) => DataType::Choice,
            Self::Color(_) => DataType::Color,
            Self::Vector(_) => DataType::Vector,
            Self::Trigger(_) => DataType::Trigger,
        }
    }

    /// Numeric view used for clamping, snapping and distance.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::Int8(v) => Some(f64::from(*v)),
            Self::Int16(v) => Some(f64::from(*v)),
            Self::Int32(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt8(v) => Some(f64::from(*v)),
            Self::UInt16(v) => Some(f64::from(*v)),
            Self::UInt32(v) => Some(f64::from(*v)),
            Self::UInt64(v) => Some(*v as f64),
            Self::Choice(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Rebuild a value of this variant's kind from a numeric view.
    pub fn with_f64(&self, v: f64) -> Self {
        match self {
            Self::Float(_) => Self::Float(v as f32),
            Self::Double(_) => Self::Double(v),
            Self::Int8(_) => Self::Int8(v as i8),
            Self::Int16(_) => Self::Int16(v as i16),
            Self::Int32(_) => Self::Int32(v as i32),
            Self::Int64(_) => Self::Int64(v as i64),
            Self::UInt8(_) => Self::UInt8(v as u8),
            Self::UInt16(_) => Self::UInt16(v as u16),
            Self::UInt32(_) => Self::UInt32(v as u32),
            Self::UInt64(_) => Self::UInt64(v as u64),
            Self::Choice(_) => Self::Choice(v as u64),
            other => other.clone(),
        }
    }

    /// Clamp into `[min, max]`; non-numeric values pass through.
    pub fn clamped(&self, min: &ParamValue, max: &ParamValue) -> Self {
        let (Some(v), Some(lo), Some(hi)) = (self.as_f64(), min.as_f64(), max.as_f64()) else {
            return self.clone();
        };
        if v < lo {
            self.with_f64(lo)
        } else if v > hi {
            self.with_f64(hi)
        } else {
            self.clone()
        }
    }

    /// Default string form, as used in path templates.
    pub fn render(&self) -> String {
        match self {
            Self::Float(v) => format!("{}", v),
            Self::Double(v) => format!("{}", v),
            Self::Int8(v) => format!("{}", v),
            Self::Int16(v) => format!("{}", v),
            Self::Int32(v) => format!("{}", v),
            Self::Int64(v) => format!("{}", v),
            Self::UInt8(v) => format!("{}", v),
            Self::UInt16(v) => format!("{}", v),
            Self::UInt32(v) => format!("{}", v),
            Self::UInt64(v) => format!("{}", v),
            Self::Bool(v) | Self::Trigger(v) => format!("{}", v),
            Self::String(v) => v.clone(),
            Self::Choice(v) => format!("{}", v),
            Self::Color(c) => format!("{},{},{},{}", c[0], c[1], c[2], c[3]),
            Self::Vector(v) => v
                .iter()
                .map(|f| format!("{}", f))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Index of the nearest candidate to `v`.
///
/// Candidates are treated as sorted ascending; a value exactly midway
/// between two neighbors resolves toward the lower index.
pub fn nearest_index(candidates: &[ParamValue], v: f64) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut best = 0usize;
    let mut best_dist = f64::INFINITY;
    for (i, c) in candidates.iter().enumerate() {
        let Some(cv) = c.as_f64() else { continue };
        let dist = (cv - v).abs();
        // Strict comparison keeps the lower index on ties.
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    if best_dist.is_finite() {
        Some(best)
    } else {
        None
    }
}

/// Count of leading repeats of the first candidate in the sorted list.
/// Always at least 1 for a non-empty list.
pub fn stride(candidates: &[ParamValue]) -> usize {
    let Some(first) = candidates.first() else {
        return 1;
    };
    candidates.iter().take_while(|c| *c == first).count().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_roundtrip() {
        for tag in 1..=16u16 {
            let dt = DataType::from_u16(tag).unwrap();
            assert_eq!(dt.as_u16(), tag);
        }
        assert!(DataType::from_u16(0).is_none());
        assert!(DataType::from_u16(99).is_none());
    }

    #[test]
    fn test_clamp_numeric() {
        let v = ParamValue::Float(1.8);
        let clamped = v.clamped(&ParamValue::Float(-1.0), &ParamValue::Float(1.0));
        assert_eq!(clamped, ParamValue::Float(1.0));

        let v = ParamValue::Int32(-5);
        let clamped = v.clamped(&ParamValue::Int32(0), &ParamValue::Int32(10));
        assert_eq!(clamped, ParamValue::Int32(0));
    }

    #[test]
    fn test_clamp_string_passthrough() {
        let v = ParamValue::String("abc".into());
        let clamped = v.clamped(&ParamValue::Float(0.0), &ParamValue::Float(1.0));
        assert_eq!(clamped, ParamValue::String("abc".into()));
    }

    #[test]
    fn test_nearest_index_midpoint_ties_low() {
        let candidates: Vec<ParamValue> =
            (1..=7).map(|i| ParamValue::Float(i as f32)).collect();
        assert_eq!(nearest_index(&candidates, 1.8), Some(1)); // 2
        assert_eq!(nearest_index(&candidates, 1.5), Some(0)); // midway -> lower
        assert_eq!(nearest_index(&candidates, 7.1), Some(6));
        assert_eq!(nearest_index(&candidates, -0.1), Some(0));
    }

    #[test]
    fn test_nearest_index_empty() {
        assert_eq!(nearest_index(&[], 1.0), None);
    }

    #[test]
    fn test_stride() {
        let vals: Vec<ParamValue> = [0.0, 0.0, 0.0, 1.0, 1.0, 2.0]
            .iter()
            .map(|v| ParamValue::Double(*v))
            .collect();
        assert_eq!(stride(&vals), 3);

        let vals: Vec<ParamValue> = (0..4).map(ParamValue::Int32).collect();
        assert_eq!(stride(&vals), 1);

        assert_eq!(stride(&[]), 1);
    }

    #[test]
    fn test_render() {
        assert_eq!(ParamValue::Int32(7).render(), "7");
        assert_eq!(ParamValue::String("x".into()).render(), "x");
        assert_eq!(ParamValue::Bool(true).render(), "true");
        assert_eq!(ParamValue::Vector(vec![1.0, 2.5]).render(), "1,2.5");
    }

    #[test]
    fn test_with_f64_preserves_kind() {
        let v = ParamValue::Int16(3).with_f64(9.0);
        assert_eq!(v, ParamValue::Int16(9));
        assert_eq!(v.data_type(), DataType::Int16);
    }
}
