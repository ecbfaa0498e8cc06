// kestrel_sim/src/transport.rs

//! Delivery of recorded measurements to the estimator: latency, jitter and the
//! resulting arrival order.

use crate::config::StreamConfig;
use crate::prng::SimulationRng;
use kestrel_core::messages::MeasurementMessage;
use rand::Rng;

/// A measurement together with the time it reaches the estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub arrival: f64,
    pub message: MeasurementMessage,
}

/// Delivers messages without delay.
pub fn immediate(messages: Vec<MeasurementMessage>) -> Vec<Delivery> {
    messages
        .into_iter()
        .map(|message| Delivery {
            arrival: message.timestamp.seconds(),
            message,
        })
        .collect()
}

/// Delays every message by the stream latency plus `U(0, jitter)`.
pub fn delayed(
    messages: Vec<MeasurementMessage>,
    stream: &StreamConfig,
    rng: &mut SimulationRng,
) -> Vec<Delivery> {
    messages
        .into_iter()
        .map(|message| {
            let jitter = if stream.jitter > 0.0 {
                rng.0.gen::<f64>() * stream.jitter
            } else {
                0.0
            };
            Delivery {
                arrival: message.timestamp.seconds() + stream.latency + jitter,
                message,
            }
        })
        .collect()
}

/// Sorts deliveries by arrival time. The sort is stable, so simultaneous
/// arrivals keep the order in which they were queued.
pub fn arrival_order(mut deliveries: Vec<Delivery>) -> Vec<Delivery> {
    deliveries.sort_by(|a, b| a.arrival.total_cmp(&b.arrival));
    deliveries
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::messages::MeasurementData;
    use kestrel_core::time::Timestamp;
    use kestrel_core::types::SensorHandle;

    fn message(sensor: u64, t: f64) -> MeasurementMessage {
        MeasurementMessage::new(
            SensorHandle(sensor),
            Timestamp::new(t),
            MeasurementData::Pressure {
                pressure: 101_325.0,
                temperature: 288.15,
            },
        )
    }

    #[test]
    fn latency_reorders_against_undelayed_streams() {
        let fast = immediate(vec![message(0, 0.0), message(0, 0.1), message(0, 0.2)]);
        let stream = StreamConfig {
            latency: 0.15,
            ..Default::default()
        };
        let slow = delayed(
            vec![message(1, 0.0)],
            &stream,
            &mut SimulationRng::from_seed(0),
        );

        let ordered = arrival_order(fast.into_iter().chain(slow).collect());
        let order: Vec<_> = ordered
            .iter()
            .map(|d| (d.message.sensor_handle.0, d.message.timestamp.seconds()))
            .collect();
        assert_eq!(order, vec![(0, 0.0), (0, 0.1), (1, 0.0), (0, 0.2)]);
    }

    #[test]
    fn ties_keep_queue_order() {
        let deliveries = immediate(vec![message(0, 1.0), message(2, 1.0), message(1, 1.0)]);
        let ordered = arrival_order(deliveries);
        let sensors: Vec<_> = ordered.iter().map(|d| d.message.sensor_handle.0).collect();
        assert_eq!(sensors, vec![0, 2, 1]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let stream = StreamConfig {
            latency: 0.05,
            jitter: 0.02,
            ..Default::default()
        };
        let messages = (0..200).map(|i| message(1, i as f64 * 0.1)).collect();
        let deliveries = delayed(messages, &stream, &mut SimulationRng::from_seed(9));
        for d in &deliveries {
            let delay = d.arrival - d.message.timestamp.seconds();
            assert!((0.05 - 1e-12..0.07 + 1e-12).contains(&delay), "delay = {delay}");
        }
    }
}
