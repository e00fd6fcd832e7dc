//! In-memory break-point data source.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use crate::data::{DataError, DataSource};

/// Data source backed by maps, filled in with the builder methods.
#[derive(Default)]
pub struct SimBackend {
    inner: Mutex<SimBackendInner>,
}

#[derive(Default)]
struct SimBackendInner {
    switch_points: HashMap<u32, u32>,
    wait_points: HashMap<String, u32>,
    break_values: HashMap<u32, Vec<i32>>,
    distances: HashMap<u32, Vec<f32>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_switch_point(self, side_number: u32, point_id: u32) -> Self {
        self.lock().switch_points.insert(side_number, point_id);
        self
    }

    pub fn with_wait_point(self, machine_id: &str, point_id: u32) -> Self {
        self.lock().wait_points.insert(machine_id.to_string(), point_id);
        self
    }

    /// Break values as the backend stores them, zeros included.
    pub fn with_break_values(self, side_number: u32, values: &[i32]) -> Self {
        self.set_break_values(side_number, values);
        self
    }

    pub fn with_distances(self, side_number: u32, distances: &[f32]) -> Self {
        self.lock().distances.insert(side_number, distances.to_vec());
        self
    }

    pub fn set_break_values(&self, side_number: u32, values: &[i32]) {
        self.lock().break_values.insert(side_number, values.to_vec());
    }

    fn lock(&self) -> MutexGuard<'_, SimBackendInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DataSource for SimBackend {
    fn switch_point_id(&self, side_number: u32) -> Result<Option<u32>, DataError> {
        Ok(self.lock().switch_points.get(&side_number).copied())
    }

    fn wait_point_id(&self, machine_id: &str) -> Result<Option<u32>, DataError> {
        Ok(self.lock().wait_points.get(machine_id).copied())
    }

    fn non_zero_break_values(&self, side_number: u32) -> Result<Vec<i32>, DataError> {
        if side_number == 0 {
            return Err(DataError::InvalidSide(side_number));
        }

        Ok(self
            .lock()
            .break_values
            .get(&side_number)
            .map(|v| v.iter().copied().filter(|v| *v != 0).collect())
            .unwrap_or_default())
    }

    fn distance_values(&self, side_number: u32) -> Result<Vec<f32>, DataError> {
        Ok(self
            .lock()
            .distances
            .get(&side_number)
            .cloned()
            .unwrap_or_default())
    }
}
