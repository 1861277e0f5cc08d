// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Memory block addressable by the coordinator and every worker process.
//!
//! The coordinator calls [`SharedBuffer::allocate`], which creates a file-backed
//! segment (on `/dev/shm` when available) and maps it. The serializable
//! [`BufferHandle`] travels to each worker in its job spec, and the worker maps the
//! same segment with [`SharedBuffer::recreate`]. The segment file is unlinked when
//! the allocating buffer drops.
//!
//! The buffer is a flat array of `T`. Callers reinterpret it as equal-size slots
//! of a [`Shape`]; the manager itself does not track who writes where.

use bytemuck::Pod;
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedBufferError {
    #[error("shared buffer must hold at least one element")]
    Empty,

    #[error("shared buffer of {elements} elements overflows the address space")]
    TooLarge { elements: usize },

    #[error("element size mismatch: segment stores {stored}-byte elements, view expects {expected}")]
    ElementSize { stored: usize, expected: usize },

    #[error("segment {path:?} holds {actual} bytes, expected {expected}")]
    Truncated {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },

    #[error("segment is not aligned for the element type")]
    Misaligned,

    #[error("io error on shared segment: {0}")]
    Io(#[from] std::io::Error),
}

/// Row-major dimensions of one slot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Number of elements in one slot
    pub fn len(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat offset of a multi-dimensional coordinate, `None` if outside the shape
    pub fn offset(&self, coords: &[usize]) -> Option<usize> {
        if coords.len() != self.0.len() {
            return None;
        }
        let mut offset = 0;
        for (&coord, &dim) in coords.iter().zip(&self.0) {
            if coord >= dim {
                return None;
            }
            offset = offset * dim + coord;
        }
        Some(offset)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

/// Everything a worker needs to map the coordinator's segment
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    pub path: PathBuf,
    pub len: usize,
    pub elem_size: usize,
}

impl BufferHandle {
    fn byte_len(&self) -> usize {
        self.len * self.elem_size
    }
}

#[derive(Debug)]
pub struct SharedBuffer<T> {
    map: MmapMut,
    handle: BufferHandle,
    // Present only in the allocating process; dropping it unlinks the segment.
    segment: Option<NamedTempFile>,
    _elem: PhantomData<T>,
}

impl<T: Pod> SharedBuffer<T> {
    /// Allocates a zeroed segment of `total_length` elements
    pub fn allocate(total_length: usize) -> Result<Self, SharedBufferError> {
        if total_length == 0 {
            return Err(SharedBufferError::Empty);
        }
        let elem_size = std::mem::size_of::<T>();
        let byte_len =
            total_length
                .checked_mul(elem_size)
                .ok_or(SharedBufferError::TooLarge {
                    elements: total_length,
                })?;

        let segment = tempfile::Builder::new()
            .prefix("task-dispatch-")
            .suffix(".shm")
            .tempfile_in(segment_dir())?;
        segment.as_file().set_len(byte_len as u64)?;

        // SAFETY: the segment is a private temp file; other processes only map it
        // through the handle and coordinate slot ownership through the channels.
        let map = unsafe { MmapOptions::new().len(byte_len).map_mut(segment.as_file())? };

        let handle = BufferHandle {
            path: segment.path().to_path_buf(),
            len: total_length,
            elem_size,
        };
        tracing::debug!(path = ?handle.path, len = total_length, "allocated shared buffer");

        Self::checked(Self {
            map,
            handle,
            segment: Some(segment),
            _elem: PhantomData,
        })
    }

    /// Maps a segment allocated by another process
    pub fn recreate(handle: &BufferHandle) -> Result<Self, SharedBufferError> {
        let expected = std::mem::size_of::<T>();
        if handle.elem_size != expected {
            return Err(SharedBufferError::ElementSize {
                stored: handle.elem_size,
                expected,
            });
        }
        if handle.len == 0 {
            return Err(SharedBufferError::Empty);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&handle.path)?;
        let actual = file.metadata()?.len();
        let byte_len = handle.byte_len() as u64;
        if actual < byte_len {
            return Err(SharedBufferError::Truncated {
                path: handle.path.clone(),
                actual,
                expected: byte_len,
            });
        }

        // SAFETY: see `allocate`; the mapping never outlives this buffer.
        let map = unsafe { MmapOptions::new().len(handle.byte_len()).map_mut(&file)? };

        Self::checked(Self {
            map,
            handle: handle.clone(),
            segment: None,
            _elem: PhantomData,
        })
    }

    fn checked(buffer: Self) -> Result<Self, SharedBufferError> {
        if buffer.map.as_ptr().align_offset(std::mem::align_of::<T>()) != 0 {
            return Err(SharedBufferError::Misaligned);
        }
        Ok(buffer)
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    /// True in the process that allocated the segment
    pub fn is_owner(&self) -> bool {
        self.segment.is_some()
    }

    pub fn len(&self) -> usize {
        self.handle.len
    }

    pub fn is_empty(&self) -> bool {
        self.handle.len == 0
    }

    /// Number of whole slots of `shape` that fit in the buffer
    pub fn slot_count(&self, shape: &Shape) -> usize {
        match shape.len() {
            0 => 0,
            n => self.len() / n,
        }
    }

    /// Views one slot; `None` if it does not fit in the buffer.
    ///
    /// Only the slot's own elements are borrowed, so other processes may write
    /// their slots meanwhile.
    pub fn slot<'a>(&'a self, slot: usize, shape: &'a Shape) -> Option<SlotRef<'a, T>> {
        let range = self.slot_range(slot, shape)?;
        // SAFETY: `range` lies within the mapping, which is aligned for `T` (checked
        // on creation) and valid for any bit pattern since `T: Pod`. The slot is
        // only read while the coordinator owns it: a worker writes a slot between
        // receiving `Slot` and sending `SlotCompleted`, never otherwise.
        let data = unsafe {
            let start = self.map.as_ptr().cast::<T>().add(range.start);
            std::slice::from_raw_parts(start, range.len())
        };
        Some(SlotRef { data, shape })
    }

    /// Mutable view of one slot; `None` if it does not fit in the buffer
    pub fn slot_mut<'a>(&'a mut self, slot: usize, shape: &'a Shape) -> Option<SlotMut<'a, T>> {
        let range = self.slot_range(slot, shape)?;
        // SAFETY: as in `slot`. The caller holds the slot under the ledger, so no
        // other process touches these elements until it is handed back.
        let data = unsafe {
            let start = self.map.as_mut_ptr().cast::<T>().add(range.start);
            std::slice::from_raw_parts_mut(start, range.len())
        };
        Some(SlotMut { data, shape })
    }

    fn slot_range(&self, slot: usize, shape: &Shape) -> Option<std::ops::Range<usize>> {
        let len = shape.len();
        let start = slot.checked_mul(len)?;
        let end = start.checked_add(len)?;
        (end <= self.len()).then_some(start..end)
    }
}

fn segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Read-only view of one slot
#[derive(Debug, Clone, Copy)]
pub struct SlotRef<'a, T> {
    data: &'a [T],
    shape: &'a Shape,
}

impl<'a, T> SlotRef<'a, T> {
    pub fn new(data: &'a [T], shape: &'a Shape) -> Self {
        Self { data, shape }
    }

    pub fn shape(&self) -> &Shape {
        self.shape
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    pub fn get(&self, coords: &[usize]) -> Option<&T> {
        self.data.get(self.shape.offset(coords)?)
    }
}

impl<T> Deref for SlotRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

/// Mutable view of one slot, handed to tasks that compute in place
#[derive(Debug)]
pub struct SlotMut<'a, T> {
    data: &'a mut [T],
    shape: &'a Shape,
}

impl<'a, T> SlotMut<'a, T> {
    pub fn new(data: &'a mut [T], shape: &'a Shape) -> Self {
        Self { data, shape }
    }

    pub fn shape(&self) -> &Shape {
        self.shape
    }

    pub fn as_slice(&self) -> &[T] {
        self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data
    }

    pub fn get(&self, coords: &[usize]) -> Option<&T> {
        self.data.get(self.shape.offset(coords)?)
    }

    pub fn get_mut(&mut self, coords: &[usize]) -> Option<&mut T> {
        let offset = self.shape.offset(coords)?;
        self.data.get_mut(offset)
    }
}

impl<T> Deref for SlotMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T> DerefMut for SlotMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shape_offset_is_row_major() {
        let shape = Shape::from([2, 3]);
        assert_eq!(shape.len(), 6);
        assert_eq!(shape.offset(&[0, 0]), Some(0));
        assert_eq!(shape.offset(&[1, 2]), Some(5));
        assert_eq!(shape.offset(&[2, 0]), None);
        assert_eq!(shape.offset(&[0]), None);
    }

    #[test]
    fn test_recreated_mapping_sees_writes() {
        let shape = Shape::from([2, 2]);
        let mut owner = SharedBuffer::<f64>::allocate(shape.len() * 3).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.slot_count(&shape), 3);

        owner
            .slot_mut(1, &shape)
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let mut peer = SharedBuffer::<f64>::recreate(owner.handle()).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.slot(1, &shape).unwrap().as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(peer.slot(0, &shape).unwrap().as_slice(), &[0.0; 4]);

        *peer.slot_mut(2, &shape).unwrap().get_mut(&[1, 0]).unwrap() = 9.5;
        assert_eq!(owner.slot(2, &shape).unwrap().get(&[1, 0]), Some(&9.5));
    }

    #[test]
    fn test_slot_out_of_range_is_none() {
        let shape = Shape::from([4]);
        let buffer = SharedBuffer::<f32>::allocate(8).unwrap();
        assert!(buffer.slot(1, &shape).is_some());
        assert!(buffer.slot(2, &shape).is_none());
    }

    #[test]
    fn test_slot_views_cover_only_their_slot() {
        let shape = Shape::from([2]);
        let mut buffer = SharedBuffer::<f64>::allocate(5).unwrap();
        assert_eq!(buffer.slot_count(&shape), 2);

        buffer.slot_mut(1, &shape).unwrap().copy_from_slice(&[7.0, 8.0]);
        assert_eq!(buffer.slot(0, &shape).unwrap().as_slice(), &[0.0, 0.0]);
        assert_eq!(buffer.slot(1, &shape).unwrap().as_slice(), &[7.0, 8.0]);

        // elements 4..6 would run past the fifth element
        assert!(buffer.slot(2, &shape).is_none());
        assert!(buffer.slot_mut(2, &shape).is_none());
        assert!(buffer.slot(usize::MAX, &shape).is_none());
    }

    #[test]
    fn test_recreate_rejects_other_element_size() {
        let buffer = SharedBuffer::<f64>::allocate(4).unwrap();
        let err = SharedBuffer::<f32>::recreate(buffer.handle()).unwrap_err();
        assert!(matches!(
            err,
            SharedBufferError::ElementSize {
                stored: 8,
                expected: 4
            }
        ));
    }

    #[test]
    fn test_empty_allocation_is_rejected() {
        assert!(matches!(
            SharedBuffer::<f64>::allocate(0),
            Err(SharedBufferError::Empty)
        ));
    }

    #[test]
    fn test_segment_removed_when_owner_drops() {
        let buffer = SharedBuffer::<u32>::allocate(16).unwrap();
        let path = buffer.handle().path.clone();
        assert!(path.exists());
        drop(buffer);
        assert!(!path.exists());
    }
}
