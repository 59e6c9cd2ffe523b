use std::fmt;
use std::io;

/// Parameter-validation and mapping failures of the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A pool size that is zero or negative.
    InvalidSize(i32),
    /// Buffer geometry that cannot describe a pixel rectangle: negative
    /// offset, non-positive extent, stride below width, or a row count that
    /// overflows `stride * height`.
    BadGeometry { offset: i32, width: i32, height: i32, stride: i32 },
    /// A geometrically valid buffer that does not fit inside the pool.
    OutOfBounds { offset: i32, len: usize, pool_size: usize },
    /// A resize below the current size; pools only grow.
    Shrink { current: usize, requested: i32 },
    /// `mmap`/`mremap`/`memfd` failure.
    Map(io::ErrorKind),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidSize(size) => write!(f, "invalid pool size {size}"),
            PoolError::BadGeometry { offset, width, height, stride } => write!(
                f,
                "invalid buffer geometry: offset {offset}, {width}x{height}, stride {stride}"
            ),
            PoolError::OutOfBounds { offset, len, pool_size } => write!(
                f,
                "buffer of {len} bytes at offset {offset} exceeds pool of {pool_size} bytes"
            ),
            PoolError::Shrink { current, requested } => {
                write!(f, "pool of {current} bytes cannot shrink to {requested}")
            }
            PoolError::Map(kind) => write!(f, "mapping failed: {kind}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> Self {
        PoolError::Map(e.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_numbers() {
        let e = PoolError::OutOfBounds { offset: 16, len: 64, pool_size: 32 };
        let text = format!("{e}");
        assert!(text.contains("64"));
        assert!(text.contains("32"));
    }
}
