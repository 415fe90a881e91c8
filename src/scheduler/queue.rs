//! Pairing and stagger arithmetic for a matching tick
//!
//! Both inputs arrive already ordered: idle devices by how long they have
//! been idle, candidates by `(priority_rank, enqueued_at, seq)`. Pairing is
//! positional, so the N-th idle device takes the N-th candidate.

use std::time::Duration;

use crate::models::{Device, EnergySettings, QueueEntry};

/// Zip idle devices with candidates; yields `min(|idle|, |candidates|)` pairs
pub fn pair<'a>(
    idle: &'a [Device],
    candidates: &'a [QueueEntry],
) -> impl Iterator<Item = (&'a Device, &'a QueueEntry)> + 'a {
    idle.iter().zip(candidates.iter())
}

/// Delay before the start signal of the `index`-th assignment in a tick
pub fn stagger_offset(index: usize, settings: &EnergySettings) -> Duration {
    if !settings.stagger_enabled || settings.stagger_delay_secs <= 0 {
        return Duration::ZERO;
    }
    let secs = (settings.stagger_delay_secs as u64).saturating_mul(index as u64);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceStatus, QueueStatus};
    use chrono::Utc;
    use proptest::prelude::*;

    fn device(i: usize) -> Device {
        Device {
            id: format!("d{i}"),
            name: format!("printer-{i}"),
            address: "127.0.0.1:1".to_string(),
            max_extruder_temp: 260.0,
            max_bed_temp: 110.0,
            rated_power_kw: 0.35,
            active: true,
            current_status: DeviceStatus::Idle,
            current_power_kw: 0.02,
            idle_streak: 1,
            status_changed_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    fn entry(i: usize) -> QueueEntry {
        QueueEntry {
            id: format!("e{i}"),
            job_id: format!("j{i}"),
            priority_rank: 5,
            enqueued_at: Utc::now(),
            status: QueueStatus::Queued,
            device_id: None,
        }
    }

    #[test]
    fn test_stagger_offsets() {
        let settings = EnergySettings::default();
        assert_eq!(stagger_offset(0, &settings), Duration::ZERO);
        assert_eq!(stagger_offset(2, &settings), Duration::from_secs(60));

        let off = EnergySettings {
            stagger_enabled: false,
            ..settings
        };
        assert_eq!(stagger_offset(3, &off), Duration::ZERO);
    }

    #[test]
    fn test_pair_is_positional() {
        let idle: Vec<_> = (0..2).map(device).collect();
        let candidates: Vec<_> = (0..3).map(entry).collect();
        let pairs: Vec<_> = pair(&idle, &candidates)
            .map(|(d, e)| (d.id.as_str(), e.id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("d0", "e0"), ("d1", "e1")]);
    }

    proptest! {
        #[test]
        fn prop_pair_count_is_min(idle in 0usize..20, queued in 0usize..20) {
            let devices: Vec<_> = (0..idle).map(device).collect();
            let entries: Vec<_> = (0..queued).map(entry).collect();
            let pairs: Vec<_> = pair(&devices, &entries).collect();

            prop_assert_eq!(pairs.len(), idle.min(queued));

            let mut seen = std::collections::HashSet::new();
            for (d, _) in &pairs {
                prop_assert!(seen.insert(d.id.clone()));
            }
        }
    }
}
