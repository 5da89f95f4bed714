//! Handle and launch types shared by every backend

use crate::error::{BackendError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! device_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Sentinel value meaning "no handle"
            pub const NULL: Self = Self(0);

            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn id(self) -> u64 {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

device_handle!(
    /// Handle to a device context
    ContextHandle,
    "ctx"
);
device_handle!(
    /// Handle to a device memory object
    ///
    /// Backends may hand out a numeric value again after it was freed.
    MemHandle,
    "mem"
);
device_handle!(
    /// Handle to a built program
    ProgramHandle,
    "prog"
);
device_handle!(
    /// Handle to a kernel resolved from a program
    KernelHandle,
    "kern"
);

/// Device memory access flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemFlags {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl MemFlags {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read_write" | "rw" => Some(Self::ReadWrite),
            "read_only" | "ro" => Some(Self::ReadOnly),
            "write_only" | "wo" => Some(Self::WriteOnly),
            _ => None,
        }
    }
}

impl fmt::Display for MemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadWrite => "read_write",
            Self::ReadOnly => "read_only",
            Self::WriteOnly => "write_only",
        };
        f.write_str(s)
    }
}

/// Explicit N-dimensional launch range
///
/// Unused trailing dimensions hold offset 0 and size 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkRange {
    dimension: u32,
    offset: [usize; 3],
    size: [usize; 3],
}

impl WorkRange {
    /// Largest supported dimension count
    pub const MAX_DIMENSIONS: u32 = 3;

    /// Build a range of `dimension` dimensions
    ///
    /// `offset` and `size` must each hold at least `dimension` values; extra
    /// values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidWorkRange`] if `dimension` is outside
    /// `1..=3`, a slice is too short, or any size component is zero.
    pub fn new(dimension: u32, offset: &[usize], size: &[usize]) -> Result<Self> {
        if dimension == 0 || dimension > Self::MAX_DIMENSIONS {
            return Err(BackendError::InvalidWorkRange(format!(
                "dimension {dimension} not in 1..={}",
                Self::MAX_DIMENSIONS
            )));
        }
        let dims = dimension as usize;
        if offset.len() < dims || size.len() < dims {
            return Err(BackendError::InvalidWorkRange(format!(
                "{dims} dimensions need {dims} offsets and sizes, got {} and {}",
                offset.len(),
                size.len()
            )));
        }
        if let Some(axis) = size[..dims].iter().position(|&s| s == 0) {
            return Err(BackendError::InvalidWorkRange(format!("size along axis {axis} is zero")));
        }

        let mut range = Self {
            dimension,
            offset: [0; 3],
            size: [1; 3],
        };
        range.offset[..dims].copy_from_slice(&offset[..dims]);
        range.size[..dims].copy_from_slice(&size[..dims]);
        Ok(range)
    }

    /// One-dimensional range `[0, n)`
    ///
    /// # Errors
    ///
    /// Returns an error if `n` is zero.
    pub fn linear(n: usize) -> Result<Self> {
        Self::new(1, &[0], &[n])
    }

    pub fn dimension(&self) -> u32 {
        self.dimension
    }

    pub fn offset(&self) -> &[usize] {
        &self.offset[..self.dimension as usize]
    }

    pub fn size(&self) -> &[usize] {
        &self.size[..self.dimension as usize]
    }

    /// Total number of work-items
    pub fn work_items(&self) -> usize {
        self.size().iter().product()
    }
}

impl fmt::Display for WorkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}D offset={:?} size={:?}", self.dimension, self.offset(), self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles() {
        assert!(MemHandle::NULL.is_null());
        assert!(!MemHandle::new(4).is_null());
        assert_eq!(KernelHandle::new(7).to_string(), "kern7");
        assert_eq!(ContextHandle::new(1).to_string(), "ctx1");
    }

    #[test]
    fn mem_flags_parse() {
        assert_eq!(MemFlags::parse("READ_ONLY"), Some(MemFlags::ReadOnly));
        assert_eq!(MemFlags::parse("wo"), Some(MemFlags::WriteOnly));
        assert_eq!(MemFlags::parse("bogus"), None);
        assert_eq!(MemFlags::default(), MemFlags::ReadWrite);
    }

    #[test]
    fn work_range_two_dimensions() {
        let range = WorkRange::new(2, &[0, 4], &[16, 8]).unwrap();
        assert_eq!(range.dimension(), 2);
        assert_eq!(range.offset(), &[0, 4]);
        assert_eq!(range.size(), &[16, 8]);
        assert_eq!(range.work_items(), 128);
    }

    #[test]
    fn work_range_rejects_bad_input() {
        assert!(WorkRange::new(0, &[], &[]).is_err());
        assert!(WorkRange::new(4, &[0; 4], &[1; 4]).is_err());
        assert!(WorkRange::new(2, &[0], &[1, 1]).is_err());
        assert!(WorkRange::new(1, &[0], &[0]).is_err());
        assert!(WorkRange::linear(0).is_err());
    }

    #[test]
    fn work_range_ignores_extra_components() {
        let range = WorkRange::new(1, &[2, 9], &[10, 9]).unwrap();
        assert_eq!(range.offset(), &[2]);
        assert_eq!(range.work_items(), 10);
    }
}
