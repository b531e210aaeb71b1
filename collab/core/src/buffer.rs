//! Owned Payload Buffer
//!
//! [`DataBuffer`] is the fundamental payload unit moved through channels:
//! an owned, fixed-capacity byte allocation with a `(offset, length)`
//! view over it. Codecs write into the full capacity and then narrow the
//! view with [`DataBuffer::set_range`]; consumers only ever observe the
//! view.
//!
//! Capacity is fixed at construction. A capacity of zero or one at or
//! above [`MAX_BUFFER_SIZE`] produces a buffer with no backing storage;
//! `data()` returns `None` and callers must check before use.

/// Hard cap on a single buffer allocation (100 MiB).
pub const MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// Length-and-offset-bounded owned byte buffer.
///
/// Invariant: `offset + length <= capacity`. [`DataBuffer::set_range`]
/// rejects any range that would violate it, leaving the buffer unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    data: Option<Vec<u8>>,
    range_offset: usize,
    range_length: usize,
}

impl DataBuffer {
    /// Allocate a zero-filled buffer of `capacity` bytes.
    ///
    /// The initial view spans the whole capacity. Out-of-range capacities
    /// (zero, or at/above [`MAX_BUFFER_SIZE`]) yield an empty buffer
    /// whose `data()` is `None`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 || capacity >= MAX_BUFFER_SIZE {
            tracing::warn!(capacity, "refusing buffer allocation outside limits");
            return Self {
                data: None,
                range_offset: 0,
                range_length: 0,
            };
        }
        Self {
            data: Some(vec![0u8; capacity]),
            range_offset: 0,
            range_length: capacity,
        }
    }

    /// Build a buffer that owns a copy of `bytes`, viewing all of it.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buffer = Self::new(bytes.len());
        if let Some(data) = buffer.data.as_mut() {
            data.copy_from_slice(bytes);
        }
        buffer
    }

    /// Length of the current view.
    #[must_use]
    pub fn size(&self) -> usize {
        self.range_length
    }

    /// Offset of the current view into the backing storage.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.range_offset
    }

    /// Total backing capacity (zero for an empty buffer).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// The bytes of the current view, or `None` for an empty buffer.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.data
            .as_ref()
            .map(|d| &d[self.range_offset..self.range_offset + self.range_length])
    }

    /// Mutable access to the current view, or `None` for an empty buffer.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let offset = self.range_offset;
        let length = self.range_length;
        self.data
            .as_mut()
            .map(|d| &mut d[offset..offset + length])
    }

    /// Narrow (or move) the view.
    ///
    /// Fails without mutating state unless `offset <= capacity` and
    /// `offset + size <= capacity`.
    pub fn set_range(&mut self, offset: usize, size: usize) -> crate::errors::Result<()> {
        let capacity = self.capacity();
        if offset > capacity || offset.checked_add(size).map_or(true, |end| end > capacity) {
            return Err(crate::errors::CollabError::InvalidParameters(format!(
                "range {offset}+{size} exceeds capacity {capacity}"
            )));
        }
        self.range_offset = offset;
        self.range_length = size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_views_full_capacity() {
        let buffer = DataBuffer::new(64);
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.offset(), 0);
        assert_eq!(buffer.data().unwrap().len(), 64);
    }

    #[test]
    fn test_zero_capacity_has_no_storage() {
        let buffer = DataBuffer::new(0);
        assert!(buffer.data().is_none());
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_oversized_capacity_has_no_storage() {
        let buffer = DataBuffer::new(MAX_BUFFER_SIZE);
        assert!(buffer.data().is_none());
    }

    #[test]
    fn test_set_range_accepts_in_bounds() {
        let mut buffer = DataBuffer::new(10);
        buffer.set_range(2, 5).unwrap();
        assert_eq!(buffer.offset(), 2);
        assert_eq!(buffer.size(), 5);

        // Boundary: offset == capacity with zero length is allowed.
        buffer.set_range(10, 0).unwrap();
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_set_range_rejects_out_of_bounds() {
        let mut buffer = DataBuffer::new(10);
        assert!(buffer.set_range(11, 0).is_err());
        assert!(buffer.set_range(4, 7).is_err());
        assert!(buffer.set_range(0, 11).is_err());
        assert!(buffer.set_range(usize::MAX, 2).is_err());

        // Failed calls leave the view untouched.
        assert_eq!(buffer.offset(), 0);
        assert_eq!(buffer.size(), 10);
    }

    #[test]
    fn test_from_slice_copies_bytes() {
        let buffer = DataBuffer::from_slice(b"hello");
        assert_eq!(buffer.data().unwrap(), b"hello");
    }

    #[test]
    fn test_view_windows_data() {
        let mut buffer = DataBuffer::from_slice(b"abcdef");
        buffer.set_range(2, 3).unwrap();
        assert_eq!(buffer.data().unwrap(), b"cde");
    }
}
