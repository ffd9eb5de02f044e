//! Replay Driver (C11): re-runs the stored measurement history through a
//! fresh locmod under a virtual clock pinned to each reading's original
//! timestamp, persisting the resulting estimates under a new configuration
//! row (§2, §4.6, §8 scenario 6).
//!
//! The source's replay script only replays already-computed estimates; this
//! follows the fuller description in the distilled specification instead —
//! re-running the whole pipeline (batch assembler through locmod) rather
//! than replaying stored positions verbatim, so replay also exercises any
//! change to the locmod configuration between the original run and now
//! (documented as an Open Question decision in `DESIGN.md`).

use crate::batch::BatchAssembler;
use crate::clock::Clock;
use crate::config::LocmodConfig;
use crate::error::StoreError;
use crate::locmod::{self, Locmod};
use crate::store::Store;

pub struct ReplayDriver<'a> {
    store: &'a Store,
    locmod: Locmod,
    configuration_id: u32,
}

impl<'a> ReplayDriver<'a> {
    /// Build a replay driver from an explicit locmod configuration. If
    /// `source_configuration_id` names a previously registered configuration,
    /// its stored `locmod_text` is used in place of `locmod_config` so the
    /// replay reproduces that run's algorithmic parameters exactly rather
    /// than whatever `--locmod-config` happens to point at today.
    pub async fn new(
        store: &'a Store,
        locmod_config: &LocmodConfig,
        locmod_name: &str,
        histogram_errors: &[f64],
        source_configuration_id: Option<u32>,
    ) -> Result<Self, StoreError> {
        let resolved = match source_configuration_id {
            Some(id) => match store.configuration(id).await? {
                Some(prior) => LocmodConfig::load_text(&prior.locmod_text)?,
                None => {
                    tracing::warn!(configuration_id = id, "no such configuration, falling back to --locmod-config");
                    locmod_config.clone()
                }
            },
            None => locmod_config.clone(),
        };

        let anchors = store.anchors().await?;
        let clock = Clock::paused_at(0.0);
        let locmod = locmod::build(&resolved, anchors, clock, histogram_errors, None);
        let configuration_id = store
            .register_configuration("replay", &resolved.text, locmod_name, &resolved.text)
            .await?;
        Ok(Self {
            store,
            locmod,
            configuration_id,
        })
    }

    pub fn configuration_id(&self) -> u32 {
        self.configuration_id
    }

    /// Feed every stored reading through the pipeline in original timestamp
    /// order, pinning the clock to each reading's timestamp before it is
    /// processed, and persist the estimates under this run's configuration.
    /// Returns the number of estimates written.
    pub async fn run(&mut self) -> Result<u32, StoreError> {
        let readings = self.store.all_readings().await?;
        let mut assembler = BatchAssembler::new();
        let mut written = 0u32;
        let clock = self.locmod.clock().clone();

        for reading in readings {
            if reading.is_error() {
                continue;
            }
            clock.set(reading.timestamp);
            let Some(round) = assembler.push(reading) else {
                continue;
            };
            self.locmod.add_reading_batch(&round);
            let locations = self.locmod.update_locations(&[round.tag_id]);
            let Some(&point) = locations.get(&round.tag_id) else {
                continue;
            };
            let ground_truth = self.store.ground_truth(round.tag_id, round.timestamp).await?;
            let error = ground_truth.map(|gt| lat_types::euclid(point, gt));
            self.store
                .add_estimate(
                    Some(self.configuration_id),
                    round.tag_id,
                    point,
                    round.timestamp,
                    None,
                    error,
                )
                .await?;
            written += 1;
        }

        for round in assembler.flush() {
            self.locmod.add_reading_batch(&round);
        }
        self.locmod.update_locations(&[]);

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lat_types::Anchor;

    async fn populated_store() -> Store {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Store::open(file.path()).await.unwrap();
        let anchors = [
            Anchor::new(1, 0.0, 0.0),
            Anchor::new(2, 0.0, 10.0),
            Anchor::new(3, 10.0, 0.0),
            Anchor::new(4, 10.0, 10.0),
        ];
        for a in &anchors {
            store.add_anchor(a.id, (a.x, a.y)).await.unwrap();
        }
        let target = (5.0, 5.0);
        let mut t = 0.0;
        for _ in 0..3 {
            for a in &anchors {
                store
                    .add_reading(a.id, 7, lat_types::euclid((a.x, a.y), target), t, None)
                    .await
                    .unwrap();
                t += 0.1;
            }
        }
        store
    }

    #[tokio::test]
    async fn replay_produces_estimates_for_every_completed_round() {
        let store = populated_store().await;
        let locmod_config = LocmodConfig::default();
        let errors: Vec<f64> = (-50..=50).map(|i| i as f64 * 0.01).collect();
        let mut driver = ReplayDriver::new(&store, &locmod_config, "default", &errors, None)
            .await
            .unwrap();
        let written = driver.run().await.unwrap();
        assert!(written >= 2, "expected at least two completed rounds, got {written}");
    }

    #[tokio::test]
    async fn replay_is_deterministic_across_runs() {
        let store = populated_store().await;
        let locmod_config = LocmodConfig::default();
        let errors: Vec<f64> = (-50..=50).map(|i| i as f64 * 0.01).collect();

        let mut first = ReplayDriver::new(&store, &locmod_config, "default", &errors, None)
            .await
            .unwrap();
        let first_written = first.run().await.unwrap();
        let first_estimates = store.estimates(first.configuration_id()).await.unwrap();

        let mut second = ReplayDriver::new(&store, &locmod_config, "default", &errors, None)
            .await
            .unwrap();
        let second_written = second.run().await.unwrap();
        let second_estimates = store.estimates(second.configuration_id()).await.unwrap();

        assert_eq!(first_written, second_written);
        assert_eq!(first_estimates.len(), second_estimates.len());
        for (a, b) in first_estimates.iter().zip(second_estimates.iter()) {
            assert_eq!(a.tag_id, b.tag_id);
            assert_eq!(a.x, b.x);
            assert_eq!(a.y, b.y);
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.error, b.error);
        }
    }

    #[tokio::test]
    async fn replay_can_reproduce_a_prior_configurations_locmod() {
        let store = populated_store().await;
        let mut locmod_config = LocmodConfig::default();
        locmod_config
            .distance_filter
            .insert("mode".to_string(), "median_filter".to_string());
        locmod_config.text = "DistanceFilter:\nmode: median_filter\n".to_string();
        let errors: Vec<f64> = (-50..=50).map(|i| i as f64 * 0.01).collect();

        let mut original = ReplayDriver::new(&store, &locmod_config, "original", &errors, None)
            .await
            .unwrap();
        original.run().await.unwrap();
        let original_id = original.configuration_id();

        // A bare default config would select a different distance filter
        // mode; passing the prior configuration id should override it with
        // the stored locmod text instead.
        let mut reproduced = ReplayDriver::new(
            &store,
            &LocmodConfig::default(),
            "reproduced",
            &errors,
            Some(original_id),
        )
        .await
        .unwrap();
        reproduced.run().await.unwrap();

        let original_row = store.configuration(original_id).await.unwrap().unwrap();
        let reproduced_row = store
            .configuration(reproduced.configuration_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original_row.locmod_text, reproduced_row.locmod_text);
    }
}
