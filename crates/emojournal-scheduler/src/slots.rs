//! Daily slot generation.
//!
//! `FixedSlots` is the production policy (09:00/13:00/17:00/21:00).
//! `RandomSlots` draws spaced slots inside a window and is kept as an
//! alternative behind the same trait.

use chrono::{Datelike, NaiveDate, NaiveTime};
use emojournal_core::config::{SchedulerConfig, SlotPolicy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Produces the local check-in times for one calendar day.
/// Output is sorted ascending with no duplicates.
pub trait SlotGenerator: Send + Sync {
    fn generate_slots(&self, date: NaiveDate) -> Vec<NaiveTime>;
}

/// Same hours every day, on the hour.
#[derive(Debug, Clone)]
pub struct FixedSlots {
    hours: Vec<u32>,
}

impl FixedSlots {
    pub fn new(hours: &[u32]) -> Self {
        let mut hours: Vec<u32> = hours.iter().copied().filter(|h| *h < 24).collect();
        hours.sort_unstable();
        hours.dedup();
        Self { hours }
    }
}

impl Default for FixedSlots {
    fn default() -> Self {
        Self::new(&[9, 13, 17, 21])
    }
}

impl SlotGenerator for FixedSlots {
    fn generate_slots(&self, _date: NaiveDate) -> Vec<NaiveTime> {
        self.hours
            .iter()
            .filter_map(|h| NaiveTime::from_hms_opt(*h, 0, 0))
            .collect()
    }
}

/// Randomly placed slots with a minimum pairwise gap.
#[derive(Debug, Clone)]
pub struct RandomSlots {
    pub count: usize,
    pub window_start_hour: u32,
    /// Exclusive.
    pub window_end_hour: u32,
    pub min_gap_minutes: u32,
    pub max_attempts: u32,
    pub seed: u64,
}

impl RandomSlots {
    /// Pure function of `(date, seed)`: the same inputs yield the same slots.
    pub fn generate_with_seed(&self, date: NaiveDate, seed: u64) -> Vec<NaiveTime> {
        if self.count == 0 {
            return Vec::new();
        }
        let start = self.window_start_hour * 60;
        let end = self.window_end_hour.min(24) * 60;
        if start >= end {
            return Vec::new();
        }

        let day_seed = seed ^ (date.num_days_from_ce() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = StdRng::seed_from_u64(day_seed);

        for _ in 0..self.max_attempts {
            let mut minutes: Vec<u32> = (0..self.count).map(|_| rng.gen_range(start..end)).collect();
            minutes.sort_unstable();
            if minutes
                .windows(2)
                .all(|w| w[1] - w[0] >= self.min_gap_minutes)
            {
                return to_times(&minutes);
            }
        }

        tracing::debug!(
            "🎲 Slot sampling exhausted {} attempts for {}, using even spacing",
            self.max_attempts,
            date
        );
        let step = (end - start) / self.count as u32;
        let minutes: Vec<u32> = (0..self.count as u32).map(|i| start + i * step).collect();
        to_times(&minutes)
    }
}

impl SlotGenerator for RandomSlots {
    fn generate_slots(&self, date: NaiveDate) -> Vec<NaiveTime> {
        self.generate_with_seed(date, self.seed)
    }
}

fn to_times(minutes: &[u32]) -> Vec<NaiveTime> {
    let mut times: Vec<NaiveTime> = minutes
        .iter()
        .filter_map(|m| NaiveTime::from_hms_opt(m / 60, m % 60, 0))
        .collect();
    times.dedup();
    times
}

/// Pick the generator named by the config.
pub fn from_config(config: &SchedulerConfig) -> Arc<dyn SlotGenerator> {
    match config.slot_policy {
        SlotPolicy::Fixed => Arc::new(FixedSlots::new(&config.daily_hours)),
        SlotPolicy::Random => Arc::new(RandomSlots {
            count: config.daily_hours.len(),
            window_start_hour: config.random_window_start_hour,
            window_end_hour: config.random_window_end_hour,
            min_gap_minutes: config.random_min_gap_minutes,
            max_attempts: config.random_max_attempts,
            seed: rand::random(),
        }),
    }
}
