//! Position Filter (C5) — smooths successive position estimates per tag and
//! throttles how often they are published downstream (§4.4).

use std::collections::HashMap;

use crate::clock::Clock;
use crate::distance_filter::median;

const DEFAULT_MAX_AGE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionFilterMode {
    MostRecent,
    Median,
    Mean,
}

impl PositionFilterMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "most_recent" => Some(Self::MostRecent),
            "median" => Some(Self::Median),
            "mean" => Some(Self::Mean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PositionUpdate {
    point: (f64, f64),
    timestamp: f64,
}

pub struct PositionFilter {
    mode: PositionFilterMode,
    update_rate: Option<f64>,
    max_age: f64,
    clock: Clock,
    updates: HashMap<u32, Vec<PositionUpdate>>,
    last_emitted: HashMap<u32, f64>,
}

impl PositionFilter {
    pub fn new(mode: PositionFilterMode, update_rate: Option<f64>, clock: Clock) -> Self {
        Self {
            mode,
            update_rate,
            max_age: DEFAULT_MAX_AGE,
            clock,
            updates: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    pub fn with_max_age(mut self, max_age: f64) -> Self {
        self.max_age = max_age;
        self
    }

    /// Append one timestamped position update per tag.
    pub fn add_updates(&mut self, updates: &HashMap<u32, (f64, f64)>) {
        let now = self.clock.now();
        for (&tag_id, &point) in updates {
            self.updates
                .entry(tag_id)
                .or_default()
                .push(PositionUpdate {
                    point,
                    timestamp: now,
                });
        }
    }

    fn cull_old(&mut self) {
        let now = self.clock.now();
        let max_age = self.max_age;
        for entries in self.updates.values_mut() {
            entries.retain(|u| now - u.timestamp <= max_age);
        }
    }

    /// Smoothed positions for the requested tags (all tracked tags if
    /// `tags` is empty). Applies the update-rate throttle per tag: a tag
    /// that emitted too recently is simply absent from the result this call.
    pub fn locations(&mut self, tags: &[u32]) -> HashMap<u32, (f64, f64)> {
        self.cull_old();
        let now = self.clock.now();

        let tag_ids: Vec<u32> = if tags.is_empty() {
            self.updates.keys().copied().collect()
        } else {
            tags.to_vec()
        };

        let mut result = HashMap::new();
        for tag_id in tag_ids {
            let Some(entries) = self.updates.get(&tag_id) else {
                continue;
            };
            if entries.is_empty() {
                continue;
            }

            if let Some(rate) = self.update_rate {
                if let Some(&last) = self.last_emitted.get(&tag_id) {
                    if now - last < rate {
                        continue;
                    }
                }
            }

            let point = match self.mode {
                PositionFilterMode::MostRecent => entries.last().unwrap().point,
                PositionFilterMode::Median => {
                    let mut xs: Vec<f64> = entries.iter().map(|u| u.point.0).collect();
                    let mut ys: Vec<f64> = entries.iter().map(|u| u.point.1).collect();
                    (median(&mut xs), median(&mut ys))
                }
                PositionFilterMode::Mean => {
                    let n = entries.len() as f64;
                    let sx: f64 = entries.iter().map(|u| u.point.0).sum();
                    let sy: f64 = entries.iter().map(|u| u.point.1).sum();
                    (sx / n, sy / n)
                }
            };

            self.last_emitted.insert(tag_id, now);
            result.insert(tag_id, point);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates_of(points: &[(f64, f64)]) -> HashMap<u32, (f64, f64)> {
        let mut m = HashMap::new();
        if let Some(&p) = points.last() {
            m.insert(1, p);
        }
        m
    }

    #[test]
    fn most_recent_mode_returns_last_point() {
        let clock = Clock::paused_at(0.0);
        let mut filter = PositionFilter::new(PositionFilterMode::MostRecent, None, clock);
        filter.add_updates(&updates_of(&[(1.0, 1.0)]));
        filter.add_updates(&updates_of(&[(2.0, 2.0)]));
        assert_eq!(filter.locations(&[1])[&1], (2.0, 2.0));
    }

    #[test]
    fn mean_mode_averages_componentwise() {
        let clock = Clock::paused_at(0.0);
        let mut filter = PositionFilter::new(PositionFilterMode::Mean, None, clock);
        let mut u1 = HashMap::new();
        u1.insert(1u32, (0.0, 0.0));
        filter.add_updates(&u1);
        let mut u2 = HashMap::new();
        u2.insert(1u32, (2.0, 4.0));
        filter.add_updates(&u2);
        assert_eq!(filter.locations(&[1])[&1], (1.0, 2.0));
    }

    #[test]
    fn update_rate_throttles_emission() {
        let clock = Clock::paused_at(0.0);
        let mut filter = PositionFilter::new(PositionFilterMode::MostRecent, Some(1.0), clock.clone());
        let mut u = HashMap::new();
        u.insert(1u32, (1.0, 1.0));
        filter.add_updates(&u);
        assert!(filter.locations(&[1]).contains_key(&1));
        // Immediately again: rate-gated, should not re-emit.
        assert!(!filter.locations(&[1]).contains_key(&1));
        clock.set(2.0);
        assert!(filter.locations(&[1]).contains_key(&1));
    }

    #[test]
    fn max_age_culls_stale_updates() {
        let clock = Clock::paused_at(0.0);
        let mut filter = PositionFilter::new(PositionFilterMode::MostRecent, None, clock.clone());
        let mut u = HashMap::new();
        u.insert(1u32, (1.0, 1.0));
        filter.add_updates(&u);
        clock.set(10.0);
        assert!(!filter.locations(&[1]).contains_key(&1));
    }
}
