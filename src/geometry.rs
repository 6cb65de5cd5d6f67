//! Shared trajectory/geometry buffer and point-in-time snapshots.
//!
//! The buffer is owned by the perception loop and grows as keyframes are
//! added. Readers go through `GeometrySource::with_read_lock`, which hands
//! them a `GeometryView` for the duration of one critical section.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Floats per pose: translation (x, y, z) then quaternion (qx, qy, qz, qw).
pub const POSE_LEN: usize = 7;

/// Floats per intrinsics row: fx, fy, cx, cy.
pub const INTRINSICS_LEN: usize = 4;

/// Plain row-major n-dimensional array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumericArray<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T: Copy> NumericArray<T> {
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || data.len() != expected {
            return Err(anyhow!(
                "array shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn filled(shape: Vec<usize>, value: T) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    /// Length of the leading dimension.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, index: usize) -> &[T] {
        let len = self.row_len();
        &self.data[index * len..(index + 1) * len]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [T] {
        let len = self.row_len();
        &mut self.data[index * len..(index + 1) * len]
    }

    /// Copy of the first `n` rows (clamped to the row count).
    pub fn head(&self, n: usize) -> Self {
        let n = n.min(self.rows());
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = n;
        }
        Self {
            shape,
            data: self.data[..n * self.row_len()].to_vec(),
        }
    }
}

/// Read access to the buffer while its lock is held.
pub trait GeometryView {
    /// Logical number of valid rows.
    fn counter(&self) -> usize;
    fn tstamps(&self) -> &NumericArray<f64>;
    fn poses(&self) -> &NumericArray<f32>;
    fn disps(&self) -> &NumericArray<f32>;
    fn intrinsics(&self) -> &NumericArray<f32>;
}

/// Owner of a lockable geometry buffer.
pub trait GeometrySource {
    type View: GeometryView;

    /// Run `f` with the lock held. The view must not escape `f`.
    fn with_read_lock<R>(&self, f: impl FnOnce(&Self::View) -> R) -> Result<R>;
}

/// Four parallel arrays copied out under one lock acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeometrySnapshot {
    pub tstamps: NumericArray<f64>,
    pub poses: NumericArray<f32>,
    pub disps: NumericArray<f32>,
    pub intrinsics: NumericArray<f32>,
}

impl GeometrySnapshot {
    /// Copy the first `counter()` rows of every array.
    ///
    /// A counter past the end of any array is clamped to the shortest one so
    /// all four arrays keep the same length.
    pub fn capture<V: GeometryView + ?Sized>(view: &V) -> Self {
        let counter = view.counter();
        let n = counter
            .min(view.tstamps().rows())
            .min(view.poses().rows())
            .min(view.disps().rows())
            .min(view.intrinsics().rows());
        if n < counter {
            log::warn!(
                "geometry counter {} exceeds stored rows; publishing {} frames",
                counter,
                n
            );
        }
        Self {
            tstamps: view.tstamps().head(n),
            poses: view.poses().head(n),
            disps: view.disps().head(n),
            intrinsics: view.intrinsics().head(n),
        }
    }

    /// Number of frames in the snapshot.
    pub fn len(&self) -> usize {
        self.tstamps.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the first array holding a NaN or infinite value.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        if self.tstamps.data.iter().any(|v| !v.is_finite()) {
            return Some("tstamps");
        }
        [
            ("poses", &self.poses),
            ("disps", &self.disps),
            ("intrinsics", &self.intrinsics),
        ]
        .into_iter()
        .find(|(_, array)| array.data.iter().any(|v| !v.is_finite()))
        .map(|(name, _)| name)
    }

    /// Wire encoding: one JSON object with `tstamps`, `poses`, `disps`, `intrinsics`.
    ///
    /// JSON has no NaN or infinity, so snapshots holding them are refused
    /// rather than sent with `null`s the receiver cannot parse.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if let Some(field) = self.non_finite_field() {
            return Err(anyhow!("geometry snapshot has non-finite values in {}", field));
        }
        serde_json::to_vec(self).map_err(|e| anyhow!("serialize geometry snapshot: {}", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("parse geometry snapshot: {}", e))
    }
}

/// One keyframe worth of geometry.
#[derive(Clone, Debug)]
pub struct GeometryEntry {
    pub tstamp: f64,
    pub pose: [f32; POSE_LEN],
    /// Dense inverse depth, `height * width` row-major.
    pub disp: Vec<f32>,
    pub intrinsics: [f32; INTRINSICS_LEN],
}

/// Fixed-capacity geometry storage. `counter` rows are valid.
#[derive(Debug)]
pub struct GeometryFrames {
    counter: usize,
    tstamps: NumericArray<f64>,
    poses: NumericArray<f32>,
    disps: NumericArray<f32>,
    intrinsics: NumericArray<f32>,
}

impl GeometryFrames {
    pub fn new(capacity: usize, height: usize, width: usize) -> Self {
        Self {
            counter: 0,
            tstamps: NumericArray::filled(vec![capacity], 0.0),
            poses: NumericArray::filled(vec![capacity, POSE_LEN], 0.0),
            disps: NumericArray::filled(vec![capacity, height, width], 0.0),
            intrinsics: NumericArray::filled(vec![capacity, INTRINSICS_LEN], 0.0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tstamps.rows()
    }

    /// Append one entry and return its row index.
    pub fn push(&mut self, entry: GeometryEntry) -> Result<usize> {
        let index = self.counter;
        if index >= self.capacity() {
            return Err(anyhow!("geometry buffer full ({} frames)", self.capacity()));
        }
        if entry.disp.len() != self.disps.row_len() {
            return Err(anyhow!(
                "disparity has {} values, buffer rows hold {}",
                entry.disp.len(),
                self.disps.row_len()
            ));
        }
        self.tstamps.row_mut(index)[0] = entry.tstamp;
        self.poses.row_mut(index).copy_from_slice(&entry.pose);
        self.disps.row_mut(index).copy_from_slice(&entry.disp);
        self.intrinsics
            .row_mut(index)
            .copy_from_slice(&entry.intrinsics);
        self.counter += 1;
        Ok(index)
    }
}

impl GeometryView for GeometryFrames {
    fn counter(&self) -> usize {
        self.counter
    }

    fn tstamps(&self) -> &NumericArray<f64> {
        &self.tstamps
    }

    fn poses(&self) -> &NumericArray<f32> {
        &self.poses
    }

    fn disps(&self) -> &NumericArray<f32> {
        &self.disps
    }

    fn intrinsics(&self) -> &NumericArray<f32> {
        &self.intrinsics
    }
}

/// `GeometryFrames` behind a mutex, shareable between the writer and publishers.
#[derive(Clone, Debug)]
pub struct SharedGeometryBuffer {
    inner: Arc<Mutex<GeometryFrames>>,
}

impl SharedGeometryBuffer {
    pub fn new(capacity: usize, height: usize, width: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GeometryFrames::new(capacity, height, width))),
        }
    }

    pub fn push(&self, entry: GeometryEntry) -> Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("geometry buffer lock poisoned"))?;
        guard.push(entry)
    }

    pub fn len(&self) -> Result<usize> {
        self.with_read_lock(|frames| frames.counter())
    }
}

impl GeometrySource for SharedGeometryBuffer {
    type View = GeometryFrames;

    fn with_read_lock<R>(&self, f: impl FnOnce(&GeometryFrames) -> R) -> Result<R> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("geometry buffer lock poisoned"))?;
        Ok(f(&guard))
    }
}
