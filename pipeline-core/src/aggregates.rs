use serde::{Deserialize, Serialize};

/// Fixed lookback periods the aggregate recomputation covers, in days.
pub const DEFAULT_WINDOWS: [AggregationWindow; 3] = [
    AggregationWindow { days: 7 },
    AggregationWindow { days: 30 },
    AggregationWindow { days: 90 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationWindow {
    pub days: u32,
}

impl AggregationWindow {
    pub fn new(days: u32) -> Self {
        Self { days }
    }
}

/// Raw per-window sums for one tutor, as returned by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub sessions_count: i64,
    pub completed_sessions: i64,
    pub cancelled_sessions: i64,
    pub total_minutes: i64,
    pub unique_students: i64,
    pub rating_sum: f64,
    pub rating_count: i64,
}

/// One persisted aggregate record's metric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    pub sessions_count: i64,
    pub completed_sessions: i64,
    pub completion_rate: f64,
    pub avg_rating: Option<f64>,
    pub total_hours: f64,
    pub unique_students: i64,
    pub engagement_score: f64,
    pub performance_tier: String,
}

/// Domain-scoring rules, kept behind a trait because their calibration is a
/// product decision, not pipeline engineering. Swap the implementation to
/// change how tutors are scored without touching the workers.
pub trait ScoringStrategy: Send + Sync {
    fn engagement_score(&self, stats: &WindowStats) -> f64;
    fn performance_tier(&self, score: f64) -> &'static str;
}

/// The production weighting: completion 40%, rating 35%, volume 25%, with
/// volume saturating at 20 sessions per window.
#[derive(Debug, Clone, Default)]
pub struct WeightedScoring;

impl WeightedScoring {
    const COMPLETION_WEIGHT: f64 = 0.40;
    const RATING_WEIGHT: f64 = 0.35;
    const VOLUME_WEIGHT: f64 = 0.25;
    const VOLUME_SATURATION: f64 = 20.0;
}

impl ScoringStrategy for WeightedScoring {
    fn engagement_score(&self, stats: &WindowStats) -> f64 {
        let completion = if stats.sessions_count > 0 {
            stats.completed_sessions as f64 / stats.sessions_count as f64
        } else {
            0.0
        };
        let rating = if stats.rating_count > 0 {
            (stats.rating_sum / stats.rating_count as f64) / 5.0
        } else {
            0.0
        };
        let volume = (stats.sessions_count as f64 / Self::VOLUME_SATURATION).min(1.0);

        let score = 100.0
            * (completion * Self::COMPLETION_WEIGHT
                + rating * Self::RATING_WEIGHT
                + volume * Self::VOLUME_WEIGHT);
        (score * 100.0).round() / 100.0
    }

    fn performance_tier(&self, score: f64) -> &'static str {
        if score >= 85.0 {
            "platinum"
        } else if score >= 70.0 {
            "gold"
        } else if score >= 50.0 {
            "silver"
        } else {
            "bronze"
        }
    }
}

/// Derive the persisted metric record for one window from its raw sums.
pub fn compute_metrics(stats: &WindowStats, scorer: &dyn ScoringStrategy) -> MetricSet {
    let completion_rate = if stats.sessions_count > 0 {
        stats.completed_sessions as f64 / stats.sessions_count as f64 * 100.0
    } else {
        0.0
    };
    let avg_rating = (stats.rating_count > 0).then(|| stats.rating_sum / stats.rating_count as f64);
    let engagement_score = scorer.engagement_score(stats);

    MetricSet {
        sessions_count: stats.sessions_count,
        completed_sessions: stats.completed_sessions,
        completion_rate,
        avg_rating,
        total_hours: stats.total_minutes as f64 / 60.0,
        unique_students: stats.unique_students,
        engagement_score,
        performance_tier: scorer.performance_tier(engagement_score).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy_tutor() -> WindowStats {
        WindowStats {
            sessions_count: 20,
            completed_sessions: 19,
            cancelled_sessions: 1,
            total_minutes: 20 * 60,
            unique_students: 12,
            rating_sum: 95.0,
            rating_count: 19,
        }
    }

    #[test]
    fn empty_window_scores_zero_bronze() {
        let metrics = compute_metrics(&WindowStats::default(), &WeightedScoring);
        assert_eq!(metrics.completion_rate, 0.0);
        assert_eq!(metrics.avg_rating, None);
        assert_eq!(metrics.engagement_score, 0.0);
        assert_eq!(metrics.performance_tier, "bronze");
    }

    #[test]
    fn strong_window_reaches_platinum() {
        let metrics = compute_metrics(&busy_tutor(), &WeightedScoring);
        assert_eq!(metrics.completion_rate, 95.0);
        assert_eq!(metrics.avg_rating, Some(5.0));
        assert_eq!(metrics.total_hours, 20.0);
        // 0.95 * 40 + 1.0 * 35 + 1.0 * 25 = 98
        assert_eq!(metrics.engagement_score, 98.0);
        assert_eq!(metrics.performance_tier, "platinum");
    }

    #[test]
    fn tier_thresholds() {
        let scorer = WeightedScoring;
        assert_eq!(scorer.performance_tier(85.0), "platinum");
        assert_eq!(scorer.performance_tier(84.9), "gold");
        assert_eq!(scorer.performance_tier(70.0), "gold");
        assert_eq!(scorer.performance_tier(50.0), "silver");
        assert_eq!(scorer.performance_tier(49.9), "bronze");
    }
}
