use chrono::{DateTime, Duration, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use super::clock::Clock;
use crate::config::AnomalyConfig;
use crate::models::SecurityEventType;

/// One behavioural sample for a subject.
#[derive(Debug, Clone)]
pub struct AnomalyObservation {
    pub subject_id: String,
    pub event_type: SecurityEventType,
    pub resource: String,
    pub action: String,
    pub ip: IpAddr,
    pub user_agent: Option<String>,
}

/// Per-factor deviation, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AnomalyFactors {
    pub network: f64,
    pub time: f64,
    pub frequency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnomalyAssessment {
    pub is_anomaly: bool,
    pub score: f64,
    /// Baseline still being built; never flags.
    pub learning: bool,
    pub factors: AnomalyFactors,
}

/// Distinct IPs, user agents and resource/action pairs kept per baseline.
/// Past this the rarest value makes room for the new one.
const MAX_TRACKED_VALUES: usize = 256;

fn bump<K: Eq + std::hash::Hash + Clone>(counts: &mut HashMap<K, u64>, key: K) {
    if counts.len() >= MAX_TRACKED_VALUES && !counts.contains_key(&key) {
        let rarest = counts
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(k, _)| k.clone());
        if let Some(rarest) = rarest {
            counts.remove(&rarest);
        }
    }
    *counts.entry(key).or_default() += 1;
}

/// Learned behaviour of one subject.
#[derive(Debug, Clone)]
struct Baseline {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    observations: u64,
    ips: HashMap<IpAddr, u64>,
    user_agents: HashMap<String, u64>,
    hours: [u64; 24],
    actions: HashMap<(String, String), u64>,
    /// Observation times inside the trailing hour.
    recent: VecDeque<DateTime<Utc>>,
}

impl Baseline {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            observations: 0,
            ips: HashMap::new(),
            user_agents: HashMap::new(),
            hours: [0; 24],
            actions: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    fn novelty<K: Eq + std::hash::Hash>(counts: &HashMap<K, u64>, key: &K, total: u64) -> f64 {
        match counts.get(key) {
            None | Some(0) => 1.0,
            // Seen before: rarely-used values still deviate a little.
            Some(count) => (1.0 - *count as f64 / total.max(1) as f64) * 0.5,
        }
    }

    fn network_deviation(&self, observation: &AnomalyObservation) -> f64 {
        let ip = Self::novelty(&self.ips, &observation.ip, self.observations);
        match &observation.user_agent {
            Some(ua) => 0.6 * ip + 0.4 * Self::novelty(&self.user_agents, ua, self.observations),
            None => ip,
        }
    }

    fn time_deviation(&self, now: DateTime<Utc>) -> f64 {
        let peak = self.hours.iter().copied().max().unwrap_or(0);
        if peak == 0 {
            return 0.0;
        }
        1.0 - self.hours[now.hour() as usize] as f64 / peak as f64
    }

    fn frequency_deviation(&self, observation: &AnomalyObservation, now: DateTime<Utc>) -> f64 {
        let hours_active = ((now - self.first_seen).num_minutes() as f64 / 60.0).max(1.0);
        let hourly_average = (self.observations as f64 / hours_active).max(1.0);

        let last_hour = self
            .recent
            .iter()
            .filter(|t| **t > now - Duration::hours(1))
            .count() as f64
            + 1.0;
        // Twice the usual rate is normal variance; five times is a full deviation.
        let burst = ((last_hour / hourly_average - 2.0) / 3.0).clamp(0.0, 1.0);

        let key = (observation.resource.clone(), observation.action.clone());
        let unfamiliar = if self.actions.contains_key(&key) {
            0.0
        } else {
            0.5
        };

        burst.max(unfamiliar)
    }

    fn record(&mut self, observation: &AnomalyObservation, now: DateTime<Utc>) {
        self.observations += 1;
        self.last_seen = now;
        bump(&mut self.ips, observation.ip);
        if let Some(ua) = &observation.user_agent {
            bump(&mut self.user_agents, ua.clone());
        }
        self.hours[now.hour() as usize] += 1;
        bump(
            &mut self.actions,
            (observation.resource.clone(), observation.action.clone()),
        );

        self.recent.push_back(now);
        let horizon = now - Duration::hours(1);
        while self.recent.front().is_some_and(|t| *t <= horizon) {
            self.recent.pop_front();
        }
    }
}

/// Scores requests against a per-subject baseline.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    baselines: DashMap<String, Baseline>,
    clock: Arc<dyn Clock>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            baselines: DashMap::new(),
            clock,
        }
    }

    pub fn auto_block(&self) -> bool {
        self.config.auto_block
    }

    /// Score, then fold the observation into the baseline.
    pub fn observe(&self, observation: &AnomalyObservation) -> AnomalyAssessment {
        let now = self.clock.now();
        let mut baseline = self
            .baselines
            .entry(observation.subject_id.clone())
            .or_insert_with(|| Baseline::new(now));

        let learning = baseline.observations < self.config.min_observations
            || now - baseline.first_seen < Duration::hours(self.config.learning_period_hours);

        let factors = if baseline.observations == 0 {
            AnomalyFactors::default()
        } else {
            AnomalyFactors {
                network: baseline.network_deviation(observation),
                time: baseline.time_deviation(now),
                frequency: baseline.frequency_deviation(observation, now),
            }
        };

        let weights =
            self.config.network_weight + self.config.time_weight + self.config.frequency_weight;
        let score = if weights > 0.0 {
            ((self.config.network_weight * factors.network
                + self.config.time_weight * factors.time
                + self.config.frequency_weight * factors.frequency)
                / weights)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        baseline.record(observation, now);

        let is_anomaly = !learning && score >= self.config.score_threshold;
        if is_anomaly {
            tracing::warn!(
                subject = %observation.subject_id,
                event_type = observation.event_type.as_str(),
                score,
                network = factors.network,
                time = factors.time,
                frequency = factors.frequency,
                "Anomalous behaviour detected"
            );
        }

        AnomalyAssessment {
            is_anomaly,
            score,
            learning,
            factors,
        }
    }

    /// Drop baselines of subjects not seen within the retention period.
    pub fn purge_idle(&self) -> usize {
        let cutoff = self.clock.now() - Duration::hours(self.config.baseline_retention_hours);
        let before = self.baselines.len();
        self.baselines.retain(|_, baseline| baseline.last_seen > cutoff);
        let purged = before.saturating_sub(self.baselines.len());
        if purged > 0 {
            tracing::debug!(purged, "Purged idle anomaly baselines");
        }
        purged
    }

    /// Forget what was learned about a subject; it re-enters learning mode.
    pub fn reset_baseline(&self, subject_id: &str) -> bool {
        self.baselines.remove(subject_id).is_some()
    }
}
