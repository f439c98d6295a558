//! Measurement matrix for one sweep.
//!
//! The grid is `voltage × device × read × channel`. Every cell starts as the
//! `-.-` sentinel and is written exactly once by the sweep engine.

use crate::judgment::Judgment;
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Text used for cells that were never visited.
pub const UNSET_SENTINEL: &str = "-.-";
/// Text used for cells whose read exhausted its retries.
pub const ERROR_SENTINEL: &str = "error";

/// Value of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Reading {
    /// Not visited yet.
    #[default]
    Unset,
    /// Measured value in volts.
    Volts(f64),
    /// The analyzer could not be read.
    Error,
}

impl Reading {
    /// Measured value, if any.
    pub fn volts(&self) -> Option<f64> {
        match self {
            Reading::Volts(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the cell was never visited.
    pub fn is_unset(&self) -> bool {
        matches!(self, Reading::Unset)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Unset => f.write_str(UNSET_SENTINEL),
            Reading::Error => f.write_str(ERROR_SENTINEL),
            Reading::Volts(v) => write!(f, "{:.2}", v),
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Unset => serializer.serialize_str(UNSET_SENTINEL),
            Reading::Error => serializer.serialize_str(ERROR_SENTINEL),
            Reading::Volts(v) => serializer.serialize_f64(*v),
        }
    }
}

/// One written (or unset) cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeasurementCell {
    /// What was measured.
    pub reading: Reading,
    /// Verdict, `None` while unset.
    pub judgment: Option<Judgment>,
}

impl MeasurementCell {
    /// Whether the cell was never visited.
    pub fn is_unset(&self) -> bool {
        self.reading.is_unset()
    }

    /// `G`, `N` or the sentinel for unvisited cells.
    pub fn judgment_text(&self) -> &'static str {
        self.judgment.map_or(UNSET_SENTINEL, Judgment::as_str)
    }
}

impl Serialize for MeasurementCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("MeasurementCell", 2)?;
        state.serialize_field("voltage", &self.reading)?;
        state.serialize_field("judgment", self.judgment_text())?;
        state.end()
    }
}

/// Position of a cell in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellIndex {
    /// Output voltage index.
    pub voltage: usize,
    /// Device slot.
    pub device: usize,
    /// Read index.
    pub read: usize,
    /// Analyzer channel.
    pub channel: usize,
}

/// Rejected cell write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// Index outside the grid.
    #[error("cell {0:?} is outside the matrix")]
    OutOfBounds(CellIndex),
    /// Cells are write-once per sweep.
    #[error("cell {0:?} was already written")]
    AlreadyWritten(CellIndex),
}

/// The full grid for one sweep invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementMatrix {
    voltages: usize,
    devices: usize,
    reads: usize,
    channels: usize,
    cells: Vec<MeasurementCell>,
}

impl MeasurementMatrix {
    /// All-unset grid of the given shape.
    pub fn new(voltages: usize, devices: usize, reads: usize, channels: usize) -> Self {
        Self {
            voltages,
            devices,
            reads,
            channels,
            cells: vec![MeasurementCell::default(); voltages * devices * reads * channels],
        }
    }

    /// Replace the grid with a fresh all-sentinel one of the given shape.
    pub fn reset(&mut self, voltages: usize, devices: usize, reads: usize, channels: usize) {
        *self = Self::new(voltages, devices, reads, channels);
    }

    /// `(voltages, devices, reads, channels)`.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.voltages, self.devices, self.reads, self.channels)
    }

    fn offset(&self, idx: CellIndex) -> Option<usize> {
        (idx.voltage < self.voltages
            && idx.device < self.devices
            && idx.read < self.reads
            && idx.channel < self.channels)
            .then(|| {
                ((idx.voltage * self.devices + idx.device) * self.reads + idx.read) * self.channels
                    + idx.channel
            })
    }

    /// Cell at `idx`, `None` when out of bounds.
    pub fn get(&self, idx: CellIndex) -> Option<&MeasurementCell> {
        self.offset(idx).map(|i| &self.cells[i])
    }

    /// Write a cell. A cell can only be written once per sweep.
    pub fn write(
        &mut self,
        idx: CellIndex,
        reading: Reading,
        judgment: Judgment,
    ) -> Result<(), MatrixError> {
        let offset = self.offset(idx).ok_or(MatrixError::OutOfBounds(idx))?;
        let cell = &mut self.cells[offset];
        if !cell.is_unset() {
            return Err(MatrixError::AlreadyWritten(idx));
        }
        *cell = MeasurementCell {
            reading,
            judgment: Some(judgment),
        };
        Ok(())
    }

    /// Iterate every cell with its index.
    pub fn iter(&self) -> impl Iterator<Item = (CellIndex, &MeasurementCell)> + '_ {
        (0..self.voltages).flat_map(move |voltage| {
            (0..self.devices).flat_map(move |device| {
                (0..self.reads).flat_map(move |read| {
                    (0..self.channels).filter_map(move |channel| {
                        let idx = CellIndex {
                            voltage,
                            device,
                            read,
                            channel,
                        };
                        self.get(idx).map(|cell| (idx, cell))
                    })
                })
            })
        })
    }

    /// Nested `[voltage][device][read][channel]` arrays for broadcasting.
    pub fn nested(&self) -> Vec<Vec<Vec<Vec<MeasurementCell>>>> {
        if self.cells.is_empty() {
            return Vec::new();
        }
        self.cells
            .chunks(self.devices * self.reads * self.channels)
            .map(|per_voltage| {
                per_voltage
                    .chunks(self.reads * self.channels)
                    .map(|per_device| {
                        per_device
                            .chunks(self.channels)
                            .map(<[MeasurementCell]>::to_vec)
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    /// Copy published to observers.
    pub fn snapshot(&self, voltages: &[f64]) -> TableSnapshot {
        TableSnapshot {
            voltages: voltages.to_vec(),
            cells: self.nested(),
        }
    }
}

/// Table broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSnapshot {
    /// Output voltages, one per outer index.
    pub voltages: Vec<f64>,
    /// `[voltage][device][read][channel]`.
    pub cells: Vec<Vec<Vec<Vec<MeasurementCell>>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(voltage: usize, device: usize, read: usize) -> CellIndex {
        CellIndex {
            voltage,
            device,
            read,
            channel: 0,
        }
    }

    #[test]
    fn new_matrix_is_all_sentinel() {
        let matrix = MeasurementMatrix::new(3, 10, 2, 1);
        assert_eq!(matrix.iter().count(), 60);
        assert!(matrix.iter().all(|(_, cell)| cell.is_unset()));
        assert_eq!(matrix.get(idx(2, 9, 1)).unwrap().judgment_text(), "-.-");
        assert!(matrix.get(idx(3, 0, 0)).is_none());
    }

    #[test]
    fn cells_are_write_once() {
        let mut matrix = MeasurementMatrix::new(3, 2, 1, 1);
        matrix
            .write(idx(1, 1, 0), Reading::Volts(221.0), Judgment::Good)
            .unwrap();
        assert_eq!(
            matrix.write(idx(1, 1, 0), Reading::Volts(10.0), Judgment::NoGood),
            Err(MatrixError::AlreadyWritten(idx(1, 1, 0)))
        );
        assert_eq!(
            matrix.get(idx(1, 1, 0)).unwrap().reading,
            Reading::Volts(221.0)
        );
        assert!(matches!(
            matrix.write(idx(0, 5, 0), Reading::Error, Judgment::NoGood),
            Err(MatrixError::OutOfBounds(_))
        ));
    }

    #[test]
    fn reset_restores_sentinels_regardless_of_prior_content() {
        let mut matrix = MeasurementMatrix::new(3, 2, 2, 1);
        for (i, _) in matrix.clone().iter() {
            matrix.write(i, Reading::Error, Judgment::NoGood).unwrap();
        }
        matrix.reset(3, 2, 1, 1);
        assert_eq!(matrix.dims(), (3, 2, 1, 1));
        assert!(matrix.iter().all(|(_, cell)| cell.is_unset()));
    }

    #[test]
    fn nested_layout_matches_indices() {
        let mut matrix = MeasurementMatrix::new(3, 2, 2, 1);
        matrix
            .write(idx(2, 1, 0), Reading::Volts(219.5), Judgment::Good)
            .unwrap();
        let nested = matrix.nested();
        assert_eq!(nested.len(), 3);
        assert_eq!(nested[0].len(), 2);
        assert_eq!(nested[0][0].len(), 2);
        assert_eq!(nested[2][1][0][0].reading, Reading::Volts(219.5));
        assert!(nested[2][1][1][0].is_unset());
    }

    #[test]
    fn snapshot_serializes_sentinels() {
        let mut matrix = MeasurementMatrix::new(1, 2, 1, 1);
        matrix
            .write(idx(0, 0, 0), Reading::Error, Judgment::NoGood)
            .unwrap();
        let json = serde_json::to_value(matrix.snapshot(&[24.0])).unwrap();
        assert_eq!(json["cells"][0][0][0][0]["voltage"], "error");
        assert_eq!(json["cells"][0][0][0][0]["judgment"], "N");
        assert_eq!(json["cells"][0][1][0][0]["voltage"], "-.-");
        assert_eq!(json["cells"][0][1][0][0]["judgment"], "-.-");
    }
}
