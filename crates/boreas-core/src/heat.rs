//! Cross-platform heat scoring and ranking.
//!
//! score = w1 * platform_percentile + w2 * velocity + w3 * freshness
//!       + w4 * cross_platform, scaled by a per-platform boost. Weights are
//! normalized from [`HeatConfig`]; nothing here is hard-coded.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::HeatConfig;
use crate::models::{SortStrategy, TrendSource};

#[derive(Clone)]
pub struct HeatScorer {
    config: HeatConfig,
}

impl HeatScorer {
    pub fn new(config: HeatConfig) -> Self {
        Self { config }
    }

    /// Score a batch in place, filling `normalized_heat_score` and the
    /// per-component breakdown on every item.
    pub fn score_batch(&self, items: &mut [TrendSource]) {
        if items.is_empty() {
            return;
        }
        let now = Utc::now();
        self.score_batch_at(items, now);
    }

    /// Deterministic variant used by tests: the reference instant is explicit.
    pub fn score_batch_at(&self, items: &mut [TrendSource], now: DateTime<Utc>) {
        let mut platform_values: HashMap<String, Vec<f64>> = HashMap::new();
        let mut content_platforms: HashMap<String, HashSet<String>> = HashMap::new();
        let mut velocities: Vec<f64> = Vec::with_capacity(items.len());

        for item in items.iter() {
            platform_values
                .entry(item.source_platform.clone())
                .or_default()
                .push(item.engagement_score);
            if !item.content_hash.is_empty() {
                content_platforms
                    .entry(item.content_hash.clone())
                    .or_default()
                    .insert(item.source_platform.clone());
            }
            let age_hours = age_hours(item, now).max(1.0 / 60.0);
            velocities.push(item.engagement_score / age_hours);
        }

        for values in platform_values.values_mut() {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        }
        let velocity_max = velocities.iter().cloned().fold(0.0_f64, f64::max).max(1e-9);

        let weights = self.normalized_weights();
        for (index, item) in items.iter_mut().enumerate() {
            let sorted = &platform_values[&item.source_platform];
            let percentile = percentile_rank(sorted, item.engagement_score);
            let velocity = (velocities[index] / velocity_max).min(1.0);
            let freshness = self.freshness(age_hours(item, now));
            let cross_platform = if item.content_hash.is_empty() {
                0.0
            } else {
                let count = content_platforms[&item.content_hash].len();
                (((count as f64) - 1.0) / 2.0).clamp(0.0, 1.0)
            };

            let mut score = weights[0] * percentile
                + weights[1] * velocity
                + weights[2] * freshness
                + weights[3] * cross_platform;
            let boost = self
                .config
                .platform_weights
                .get(&item.source_platform.to_lowercase())
                .copied()
                .unwrap_or(1.0)
                .max(0.0);
            score *= boost;

            item.normalized_heat_score = score.clamp(0.0, 1.0);
            item.heat_breakdown = HashMap::from([
                ("platform_percentile".to_string(), percentile),
                ("velocity".to_string(), velocity),
                ("freshness".to_string(), freshness),
                ("cross_platform".to_string(), cross_platform),
                ("platform_weight".to_string(), boost),
            ]);
        }
    }

    /// Sort a scored batch. Ties break deterministically on
    /// (platform asc, source_id asc) so repeated runs rank identically.
    pub fn sort_items(&self, items: &mut [TrendSource], strategy: SortStrategy) {
        match strategy {
            SortStrategy::Engagement => items.sort_by(|a, b| {
                b.engagement_score
                    .partial_cmp(&a.engagement_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.source_platform.cmp(&b.source_platform))
                    .then_with(|| a.source_id.cmp(&b.source_id))
            }),
            SortStrategy::Recency => items.sort_by(|a, b| {
                let ta = a.published_at.unwrap_or(a.scraped_at);
                let tb = b.published_at.unwrap_or(b.scraped_at);
                tb.cmp(&ta)
                    .then_with(|| a.source_platform.cmp(&b.source_platform))
                    .then_with(|| a.source_id.cmp(&b.source_id))
            }),
            SortStrategy::Hybrid => items.sort_by(|a, b| {
                b.normalized_heat_score
                    .partial_cmp(&a.normalized_heat_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.source_platform.cmp(&b.source_platform))
                    .then_with(|| a.source_id.cmp(&b.source_id))
            }),
        }
    }

    /// Exponential half-life decay, zero past the configured max age.
    fn freshness(&self, age_hours: f64) -> f64 {
        let age = age_hours.max(0.0);
        let max_age = self.config.freshness_max_age_hours.max(1.0);
        if age >= max_age {
            return 0.0;
        }
        let half_life = self.config.freshness_half_life_hours.max(0.1);
        (-std::f64::consts::LN_2 * age / half_life).exp().clamp(0.0, 1.0)
    }

    fn normalized_weights(&self) -> [f64; 4] {
        let raw = [
            self.config.weight_platform_percentile.max(0.0),
            self.config.weight_velocity.max(0.0),
            self.config.weight_freshness.max(0.0),
            self.config.weight_cross_platform.max(0.0),
        ];
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return [0.45, 0.25, 0.20, 0.10];
        }
        raw.map(|w| w / total)
    }
}

fn age_hours(item: &TrendSource, now: DateTime<Utc>) -> f64 {
    let reference = item.published_at.unwrap_or(item.scraped_at);
    (now - reference).num_milliseconds() as f64 / 3_600_000.0
}

fn percentile_rank(sorted_values: &[f64], value: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    if sorted_values.len() == 1 {
        return 1.0;
    }
    let count = sorted_values.iter().filter(|v| **v <= value).count();
    (count.saturating_sub(1)) as f64 / (sorted_values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn item(platform: &str, id: &str, engagement: f64, age_hours: i64) -> TrendSource {
        let mut source = TrendSource::new(platform, id);
        source.engagement_score = engagement;
        source.published_at = Some(Utc::now() - TimeDelta::hours(age_hours));
        source
    }

    #[test]
    fn test_freshness_half_life() {
        let scorer = HeatScorer::new(HeatConfig {
            freshness_half_life_hours: 12.0,
            freshness_max_age_hours: 72.0,
            ..HeatConfig::default()
        });
        assert!((scorer.freshness(0.0) - 1.0).abs() < 1e-9);
        assert!((scorer.freshness(12.0) - 0.5).abs() < 1e-9);
        assert!((scorer.freshness(24.0) - 0.25).abs() < 1e-9);
        assert_eq!(scorer.freshness(72.0), 0.0);
        assert_eq!(scorer.freshness(500.0), 0.0);
    }

    #[test]
    fn test_hotter_fresher_items_score_higher() {
        let scorer = HeatScorer::new(HeatConfig::default());
        let mut items = vec![
            item("weibo", "cold", 10.0, 48),
            item("weibo", "hot", 5000.0, 1),
        ];
        scorer.score_batch(&mut items);
        let cold = items.iter().find(|i| i.source_id == "cold").unwrap();
        let hot = items.iter().find(|i| i.source_id == "hot").unwrap();
        assert!(hot.normalized_heat_score > cold.normalized_heat_score);
        assert!(hot.heat_breakdown["platform_percentile"] > cold.heat_breakdown["platform_percentile"]);
    }

    #[test]
    fn test_cross_platform_component() {
        let scorer = HeatScorer::new(HeatConfig::default());
        let mut items = vec![
            item("weibo", "a", 100.0, 2),
            item("bilibili", "b", 100.0, 2),
            item("zhihu", "solo", 100.0, 2),
        ];
        items[0].content_hash = "shared".into();
        items[1].content_hash = "shared".into();
        items[2].content_hash = "alone".into();
        scorer.score_batch(&mut items);
        assert!(items[0].heat_breakdown["cross_platform"] > 0.0);
        assert_eq!(items[2].heat_breakdown["cross_platform"], 0.0);
    }

    #[test]
    fn test_sort_is_deterministic_on_ties() {
        let scorer = HeatScorer::new(HeatConfig::default());
        let mut items = vec![
            item("weibo", "b", 100.0, 2),
            item("weibo", "a", 100.0, 2),
            item("bilibili", "z", 100.0, 2),
        ];
        for i in items.iter_mut() {
            i.normalized_heat_score = 0.5;
        }
        scorer.sort_items(&mut items, SortStrategy::Hybrid);
        let order: Vec<_> = items
            .iter()
            .map(|i| (i.source_platform.as_str(), i.source_id.as_str()))
            .collect();
        assert_eq!(order, vec![("bilibili", "z"), ("weibo", "a"), ("weibo", "b")]);
    }

    #[test]
    fn test_platform_boost_multiplies() {
        let mut config = HeatConfig::default();
        config.platform_weights.insert("github".into(), 0.0);
        let scorer = HeatScorer::new(config);
        let mut items = vec![item("github", "x", 9000.0, 1)];
        scorer.score_batch(&mut items);
        assert_eq!(items[0].normalized_heat_score, 0.0);
    }

    #[test]
    fn test_zero_weights_fall_back_to_defaults() {
        let scorer = HeatScorer::new(HeatConfig {
            weight_platform_percentile: 0.0,
            weight_velocity: 0.0,
            weight_freshness: 0.0,
            weight_cross_platform: 0.0,
            ..HeatConfig::default()
        });
        let weights = scorer.normalized_weights();
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
