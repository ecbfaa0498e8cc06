// kestrel_core/src/buffer.rs

//! The time-ordered history of every measurement the estimator accepted.
//!
//! Each entry keeps its raw measurement for its whole lifetime, so the buffer is a
//! replayable log; the resolved [`StateSnapshot`] stored next to it is derived data
//! that the controller recomputes whenever an earlier measurement is inserted.

use crate::error::{EstimatorError, Result};
use crate::messages::MeasurementData;
use crate::states::StateSnapshot;
use crate::time::Timestamp;
use crate::types::SensorHandle;
use std::collections::VecDeque;
use std::fmt;

// =========================================================================
// == Buffer Entries ==
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    /// A measurement waiting for the estimator to be initialized.
    Pending(MeasurementData),
    /// A processed measurement and the estimate it produced.
    Resolved {
        measurement: MeasurementData,
        snapshot: StateSnapshot,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub timestamp: Timestamp,
    pub sensor: SensorHandle,
    /// Insertion order, used to keep equal timestamps in arrival order.
    pub sequence: u64,
    pub payload: EntryPayload,
}

impl BufferEntry {
    /// A new, unresolved entry. The sequence number is assigned on insertion.
    pub fn pending(timestamp: Timestamp, sensor: SensorHandle, data: MeasurementData) -> Self {
        Self {
            timestamp,
            sensor,
            sequence: 0,
            payload: EntryPayload::Pending(data),
        }
    }

    pub fn measurement(&self) -> &MeasurementData {
        match &self.payload {
            EntryPayload::Pending(measurement) => measurement,
            EntryPayload::Resolved { measurement, .. } => measurement,
        }
    }

    pub fn snapshot(&self) -> Option<&StateSnapshot> {
        match &self.payload {
            EntryPayload::Pending(_) => None,
            EntryPayload::Resolved { snapshot, .. } => Some(snapshot),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.snapshot().is_some()
    }
}

// =========================================================================
// == History Buffer ==
// =========================================================================

/// Buffer entries sorted by timestamp, ties kept in insertion order.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    data: VecDeque<BufferEntry>,
    /// Timestamps closer than this are the same instant.
    epsilon: f64,
    next_sequence: u64,
}

impl HistoryBuffer {
    pub fn new(epsilon: f64) -> Self {
        Self {
            data: VecDeque::new(),
            epsilon,
            next_sequence: 0,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn get(&self, index: usize) -> Option<&BufferEntry> {
        self.data.get(index)
    }

    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = &BufferEntry> + ExactSizeIterator + '_ {
        self.data.iter()
    }

    /// Inserts `entry` after every entry at or before its timestamp and returns its index.
    ///
    /// Entries within `epsilon` of the new timestamp count as simultaneous, so the
    /// new entry goes after them. If that leaves it behind its predecessor by less
    /// than `epsilon`, its timestamp is snapped up to the predecessor's so the
    /// buffer stays non-decreasing.
    pub fn insert(&mut self, mut entry: BufferEntry) -> usize {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;

        let limit = entry.timestamp.seconds() + self.epsilon;
        let index = self.data.partition_point(|e| e.timestamp.seconds() <= limit);
        if let Some(previous) = index.checked_sub(1).and_then(|i| self.data.get(i)) {
            if previous.timestamp > entry.timestamp {
                entry.timestamp = previous.timestamp;
            }
        }

        self.data.insert(index, entry);
        index
    }

    /// The most recent resolved snapshot overall.
    pub fn get_latest(&self) -> Result<&StateSnapshot> {
        self.data
            .iter()
            .rev()
            .find_map(BufferEntry::snapshot)
            .ok_or(EstimatorError::EmptyBuffer)
    }

    /// The most recent resolved snapshot produced by `sensor`.
    pub fn get_latest_for(&self, sensor: SensorHandle) -> Result<&StateSnapshot> {
        self.data
            .iter()
            .rev()
            .filter(|e| e.sensor == sensor)
            .find_map(BufferEntry::snapshot)
            .ok_or(EstimatorError::NoEntryForSensor(sensor))
    }

    /// Entries strictly after `timestamp`, oldest first. This is the replay set
    /// for a measurement inserted at `timestamp`.
    pub fn entries_after(&self, timestamp: Timestamp) -> impl Iterator<Item = &BufferEntry> + '_ {
        let start = self.data.partition_point(|e| e.timestamp <= timestamp);
        self.data.range(start..)
    }

    /// Drops entries older than `timestamp`, oldest first, and returns them.
    ///
    /// The newest entry always survives, so an initialized buffer never becomes empty.
    pub fn evict_before(&mut self, timestamp: Timestamp) -> Vec<BufferEntry> {
        let mut evicted = Vec::new();
        while self.data.len() > 1 {
            match self.data.front() {
                Some(front) if front.timestamp < timestamp => {}
                _ => break,
            }
            if let Some(front) = self.data.pop_front() {
                evicted.push(front);
            }
        }
        evicted
    }

    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.data.back().map(|e| e.timestamp)
    }

    /// The oldest resolved snapshot still retained; nothing older can be replayed.
    pub fn oldest_snapshot(&self) -> Option<&StateSnapshot> {
        self.data.iter().find_map(BufferEntry::snapshot)
    }

    /// The last resolved snapshot at or before `timestamp` (within epsilon), with its index.
    pub fn last_snapshot_at_or_before(
        &self,
        timestamp: Timestamp,
    ) -> Option<(usize, &StateSnapshot)> {
        let limit = timestamp.seconds() + self.epsilon;
        let end = self.data.partition_point(|e| e.timestamp.seconds() <= limit);
        (0..end)
            .rev()
            .find_map(|i| self.data[i].snapshot().map(|s| (i, s)))
    }

    /// All buffered measurements of `sensor`, oldest first.
    pub fn measurements_for(
        &self,
        sensor: SensorHandle,
    ) -> impl Iterator<Item = (Timestamp, &MeasurementData)> + '_ {
        self.data
            .iter()
            .filter(move |e| e.sensor == sensor)
            .map(|e| (e.timestamp, e.measurement()))
    }

    /// True if every timestamp is at or after its predecessor.
    pub fn is_sorted(&self) -> bool {
        self.data
            .iter()
            .zip(self.data.iter().skip(1))
            .all(|(a, b)| a.timestamp <= b.timestamp)
    }

    // --- Controller-only mutation ---

    /// Stores (or overwrites) the resolved snapshot of the entry at `index`.
    pub(crate) fn set_snapshot(&mut self, index: usize, snapshot: StateSnapshot) {
        let Some(entry) = self.data.get_mut(index) else {
            return;
        };
        match &mut entry.payload {
            EntryPayload::Resolved { snapshot: slot, .. } => *slot = snapshot,
            EntryPayload::Pending(measurement) => {
                let measurement = measurement.clone();
                entry.payload = EntryPayload::Resolved {
                    measurement,
                    snapshot,
                };
            }
        }
    }

    /// Takes back an entry whose measurement was rejected after insertion.
    pub(crate) fn remove(&mut self, index: usize) -> Option<BufferEntry> {
        self.data.remove(index)
    }

    /// Drops the `count` oldest entries regardless of their timestamps.
    pub(crate) fn discard_front(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }
}

impl fmt::Display for HistoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HistoryBuffer ({} entries)", self.data.len())?;
        for (i, entry) in self.data.iter().enumerate() {
            let status = if entry.is_resolved() {
                "resolved"
            } else {
                "pending"
            };
            writeln!(
                f,
                "  [{i:>4}] {} {} seq={} {} {}",
                entry.timestamp,
                entry.sensor,
                entry.sequence,
                entry.measurement().kind(),
                status
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ImuMeasurement;
    use crate::states::{CalibrationSet, CoreState, NavState};
    use crate::types::CoreMatrix;
    use nalgebra::{UnitQuaternion, Vector3};

    const EPS: f64 = 1e-6;

    fn imu() -> MeasurementData {
        MeasurementData::Imu(ImuMeasurement::default())
    }

    fn pending(t: f64, sensor: u64) -> BufferEntry {
        BufferEntry::pending(Timestamp::new(t), SensorHandle(sensor), imu())
    }

    fn snapshot(t: f64, sensor: u64) -> StateSnapshot {
        StateSnapshot {
            timestamp: Timestamp::new(t),
            sensor: SensorHandle(sensor),
            core: CoreState::new(
                NavState::new(Vector3::new(t, 0.0, 0.0), UnitQuaternion::identity()),
                CoreMatrix::identity(),
                ImuMeasurement::default(),
            ),
            calibrations: CalibrationSet::default(),
            sensor_state: None,
        }
    }

    fn resolved_buffer(times: &[(f64, u64)]) -> HistoryBuffer {
        let mut buffer = HistoryBuffer::new(EPS);
        for &(t, sensor) in times {
            let idx = buffer.insert(pending(t, sensor));
            buffer.set_snapshot(idx, snapshot(t, sensor));
        }
        buffer
    }

    #[test]
    fn insert_keeps_time_order_and_reports_position() {
        let mut buffer = HistoryBuffer::new(EPS);
        assert_eq!(buffer.insert(pending(1.0, 0)), 0);
        assert_eq!(buffer.insert(pending(3.0, 0)), 1);
        assert_eq!(buffer.insert(pending(2.0, 1)), 1);
        assert_eq!(buffer.insert(pending(0.5, 1)), 0);

        let times: Vec<f64> = buffer.iter().map(|e| e.timestamp.seconds()).collect();
        assert_eq!(times, vec![0.5, 1.0, 2.0, 3.0]);
        assert!(buffer.is_sorted());
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut buffer = HistoryBuffer::new(EPS);
        buffer.insert(pending(1.0, 0));
        buffer.insert(pending(2.0, 0));
        assert_eq!(buffer.insert(pending(1.0, 1)), 1);
        assert_eq!(buffer.insert(pending(1.0, 2)), 2);

        let sensors: Vec<u64> = buffer.iter().map(|e| e.sensor.0).collect();
        assert_eq!(sensors, vec![0, 1, 2, 0]);
        let sequences: Vec<u64> = buffer.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 2, 3, 1]);
    }

    #[test]
    fn near_duplicate_is_snapped_to_predecessor() {
        let mut buffer = HistoryBuffer::new(EPS);
        buffer.insert(pending(1.0, 0));
        let idx = buffer.insert(pending(1.0 - 0.5 * EPS, 1));

        assert_eq!(idx, 1);
        assert_eq!(buffer.get(1).map(|e| e.timestamp), Some(Timestamp::new(1.0)));
        assert!(buffer.is_sorted());
    }

    #[test]
    fn latest_queries_fail_without_snapshots() {
        let mut buffer = HistoryBuffer::new(EPS);
        assert_eq!(buffer.get_latest(), Err(EstimatorError::EmptyBuffer));

        buffer.insert(pending(1.0, 0));
        assert_eq!(buffer.get_latest(), Err(EstimatorError::EmptyBuffer));
        assert_eq!(
            buffer.get_latest_for(SensorHandle(0)),
            Err(EstimatorError::NoEntryForSensor(SensorHandle(0)))
        );
    }

    #[test]
    fn latest_and_latest_for_sensor() {
        let buffer = resolved_buffer(&[(1.0, 0), (1.5, 1), (2.0, 0), (2.5, 2), (3.0, 0)]);

        assert_eq!(buffer.get_latest().map(|s| s.timestamp.seconds()), Ok(3.0));
        assert_eq!(
            buffer.get_latest_for(SensorHandle(1)).map(|s| s.timestamp.seconds()),
            Ok(1.5)
        );
        assert_eq!(
            buffer.get_latest_for(SensorHandle(2)).map(|s| s.timestamp.seconds()),
            Ok(2.5)
        );
        assert_eq!(
            buffer.get_latest_for(SensorHandle(7)),
            Err(EstimatorError::NoEntryForSensor(SensorHandle(7)))
        );
    }

    #[test]
    fn entries_after_is_strict() {
        let buffer = resolved_buffer(&[(1.0, 0), (2.0, 0), (2.0, 1), (3.0, 0)]);
        let after: Vec<f64> = buffer
            .entries_after(Timestamp::new(2.0))
            .map(|e| e.timestamp.seconds())
            .collect();
        assert_eq!(after, vec![3.0]);
        assert_eq!(buffer.entries_after(Timestamp::new(0.0)).count(), 4);
        assert_eq!(buffer.entries_after(Timestamp::new(3.0)).count(), 0);
    }

    #[test]
    fn evict_never_removes_the_newest_entry() {
        let mut buffer = resolved_buffer(&[(1.0, 0), (2.0, 0), (3.0, 0)]);

        let evicted = buffer.evict_before(Timestamp::new(2.5));
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].timestamp.seconds(), 1.0);

        let evicted = buffer.evict_before(Timestamp::new(100.0));
        assert!(evicted.is_empty());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get_latest().map(|s| s.timestamp.seconds()), Ok(3.0));
    }

    #[test]
    fn last_snapshot_at_or_before() {
        let buffer = resolved_buffer(&[(1.0, 0), (2.0, 0), (3.0, 0)]);
        let (idx, snap) = buffer
            .last_snapshot_at_or_before(Timestamp::new(2.5))
            .expect("snapshot before 2.5");
        assert_eq!(idx, 1);
        assert_eq!(snap.timestamp.seconds(), 2.0);

        assert!(buffer
            .last_snapshot_at_or_before(Timestamp::new(1.0))
            .is_some());
        assert!(buffer
            .last_snapshot_at_or_before(Timestamp::new(0.9))
            .is_none());
    }

    #[test]
    fn overwriting_a_snapshot_keeps_the_measurement() {
        let mut buffer = resolved_buffer(&[(1.0, 0)]);
        let replacement = snapshot(42.0, 0);
        buffer.set_snapshot(0, replacement.clone());

        let entry = buffer.get(0).expect("entry");
        assert_eq!(entry.snapshot(), Some(&replacement));
        assert_eq!(entry.measurement(), &imu());
        assert_eq!(buffer.measurements_for(SensorHandle(0)).count(), 1);
    }
}
