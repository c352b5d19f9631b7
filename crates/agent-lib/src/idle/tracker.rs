//! Keyed debounce state machine for idle workloads
//!
//! Each workload moves between three states:
//! - accumulating: consecutive idle samples are being counted
//! - reported: a candidate was emitted and the workload is still idle
//! - reset: any active observation clears the counter and re-arms emission

use crate::models::{Candidate, PodEvidence, Timestamp, TrackingId, WorkloadKey};
use chrono::Duration;
use std::collections::{BTreeSet, HashMap};

/// One per-tick observation of a workload
#[derive(Debug, Clone)]
pub struct Observation {
    pub key: WorkloadKey,
    pub seen_at: Timestamp,
    /// True when every GPU the workload touched this tick was idle
    pub idle: bool,
    pub gpus: BTreeSet<u32>,
    pub pids: BTreeSet<u32>,
    pub cmdlines: Vec<String>,
}

/// Tracking state of a single workload
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub key: WorkloadKey,
    pub idle_count: u32,
    pub idle_since: Option<Timestamp>,
    pub last_seen: Timestamp,
    pub last_active: Option<Timestamp>,
    /// Set once a candidate was emitted for the current idle episode
    pub reported: bool,
    pub evidence: PodEvidence,
}

impl TrackerState {
    fn new(key: WorkloadKey, seen_at: Timestamp) -> Self {
        Self {
            key,
            idle_count: 0,
            idle_since: None,
            last_seen: seen_at,
            last_active: None,
            reported: false,
            evidence: PodEvidence::default(),
        }
    }
}

/// Tracks idle episodes per workload and emits at most one candidate each
pub struct IdleTracker {
    idle_duration: Duration,
    consecutive_idle_samples: u32,
    states: HashMap<TrackingId, TrackerState>,
}

impl IdleTracker {
    /// Create a tracker that requires `consecutive_idle_samples` idle
    /// observations spanning at least `idle_minutes`
    pub fn new(idle_minutes: u32, consecutive_idle_samples: u32) -> Self {
        Self {
            idle_duration: Duration::minutes(i64::from(idle_minutes)),
            consecutive_idle_samples,
            states: HashMap::new(),
        }
    }

    /// Record one observation. Returns a candidate when the workload's
    /// current idle episode first satisfies both thresholds.
    pub fn observe(&mut self, obs: Observation) -> Option<Candidate> {
        let state = self
            .states
            .entry(obs.key.tracking_id())
            .or_insert_with(|| TrackerState::new(obs.key.clone(), obs.seen_at));

        state.key = obs.key;
        state.last_seen = obs.seen_at;

        if obs.idle {
            state.idle_count = state.idle_count.saturating_add(1);
            if state.idle_count == 1 {
                state.idle_since = Some(obs.seen_at);
            }
            state.evidence = PodEvidence {
                gpus: obs.gpus,
                pids: obs.pids,
                cmdlines: obs.cmdlines,
                util_samples: state.idle_count,
                idle_since: state.idle_since.map(|t| t.wall),
            };
        } else {
            state.idle_count = 0;
            state.idle_since = None;
            state.last_active = Some(obs.seen_at);
            state.reported = false;
            state.evidence = PodEvidence::default();
        }

        if state.reported || state.idle_count < self.consecutive_idle_samples {
            return None;
        }
        let idle_since = state.idle_since?;
        let idle_for = obs.seen_at.since(&idle_since);
        if idle_for < self.idle_duration {
            return None;
        }

        state.reported = true;
        Some(Candidate {
            key: state.key.clone(),
            evidence: state.evidence.clone(),
            idle_for,
        })
    }

    /// Drop every workload not seen within `max_age` of `now`.
    /// Returns how many were removed.
    pub fn gc(&mut self, now: Timestamp, max_age: Duration) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| now.since(&state.last_seen) <= max_age);
        before - self.states.len()
    }

    pub fn get(&self, id: &TrackingId) -> Option<&TrackerState> {
        self.states.get(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::OnceLock;
    use std::time::Instant;

    fn key() -> WorkloadKey {
        WorkloadKey {
            uid: "1a2b3c4d-5678-90ab-cdef-1234567890ab".to_string(),
            namespace: "ml".to_string(),
            name: "trainer-0".to_string(),
            container_id: "abc".to_string(),
        }
    }

    fn at(minute: i64) -> Timestamp {
        static BASE: OnceLock<Timestamp> = OnceLock::new();
        let base = *BASE.get_or_init(|| Timestamp {
            wall: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            mono: Instant::now(),
        });
        base.advanced_by(Duration::minutes(minute))
    }

    fn obs(minute: i64, idle: bool) -> Observation {
        Observation {
            key: key(),
            seen_at: at(minute),
            idle,
            gpus: BTreeSet::from([0]),
            pids: BTreeSet::from([123]),
            cmdlines: vec!["python serve.py".to_string()],
        }
    }

    fn state(tracker: &IdleTracker) -> &TrackerState {
        tracker.get(&key().tracking_id()).unwrap()
    }

    #[test]
    fn test_candidate_after_consecutive_samples() {
        let mut tracker = IdleTracker::new(0, 3);

        assert!(tracker.observe(obs(0, true)).is_none());
        assert!(tracker.observe(obs(1, true)).is_none());
        let candidate = tracker.observe(obs(2, true)).unwrap();

        assert_eq!(candidate.idle_for, Duration::minutes(2));
        assert_eq!(candidate.key, key());
        assert_eq!(candidate.evidence.util_samples, 3);
        assert_eq!(candidate.evidence.idle_since, Some(at(0).wall));
        assert_eq!(candidate.evidence.pids, BTreeSet::from([123]));
    }

    #[test]
    fn test_active_sample_restarts_episode() {
        let mut tracker = IdleTracker::new(0, 3);

        assert!(tracker.observe(obs(0, true)).is_none());
        assert!(tracker.observe(obs(1, true)).is_none());
        assert!(tracker.observe(obs(2, false)).is_none());
        assert_eq!(state(&tracker).idle_count, 0);
        assert_eq!(state(&tracker).idle_since, None);
        assert_eq!(state(&tracker).last_active, Some(at(2)));

        assert!(tracker.observe(obs(3, true)).is_none());
        assert!(tracker.observe(obs(4, true)).is_none());
        let candidate = tracker.observe(obs(5, true)).unwrap();
        assert_eq!(candidate.idle_for, Duration::minutes(2));
        assert_eq!(candidate.evidence.idle_since, Some(at(3).wall));
    }

    #[test]
    fn test_wall_clock_step_back_does_not_shrink_episode() {
        let mut tracker = IdleTracker::new(30, 2);
        tracker.observe(obs(0, true));

        // NTP pulls the wall clock back an hour while 30 real minutes pass
        let stepped = Timestamp {
            wall: at(0).wall - Duration::hours(1),
            ..at(30)
        };
        let candidate = tracker
            .observe(Observation {
                seen_at: stepped,
                ..obs(30, true)
            })
            .unwrap();

        assert_eq!(candidate.idle_for, Duration::minutes(30));
        assert_eq!(candidate.evidence.idle_since, Some(at(0).wall));
    }

    #[test]
    fn test_wall_clock_step_forward_does_not_trigger_early() {
        let mut tracker = IdleTracker::new(30, 2);
        tracker.observe(obs(0, true));

        // Wall clock jumps three hours ahead, one real minute later
        let stepped = Timestamp {
            wall: at(0).wall + Duration::hours(3),
            ..at(1)
        };
        assert_eq!(tracker.gc(stepped, Duration::minutes(120)), 0);
        assert!(tracker
            .observe(Observation {
                seen_at: stepped,
                ..obs(1, true)
            })
            .is_none());
    }

    #[test]
    fn test_duration_threshold_gates_emission() {
        let mut tracker = IdleTracker::new(30, 2);

        assert!(tracker.observe(obs(0, true)).is_none());
        assert!(tracker.observe(obs(10, true)).is_none());
        assert!(tracker.observe(obs(29, true)).is_none());
        let candidate = tracker.observe(obs(30, true)).unwrap();
        assert_eq!(candidate.idle_for, Duration::minutes(30));
        assert_eq!(candidate.evidence.util_samples, 4);
    }

    #[test]
    fn test_sample_threshold_gates_emission() {
        let mut tracker = IdleTracker::new(1, 5);

        for minute in 0..4 {
            assert!(tracker.observe(obs(minute * 10, true)).is_none());
        }
        assert!(tracker.observe(obs(40, true)).is_some());
    }

    #[test]
    fn test_at_most_one_candidate_per_episode() {
        let mut tracker = IdleTracker::new(0, 1);

        assert!(tracker.observe(obs(0, true)).is_some());
        for minute in 1..10 {
            assert!(tracker.observe(obs(minute, true)).is_none());
        }
        assert!(state(&tracker).reported);

        // Going active re-arms emission
        assert!(tracker.observe(obs(10, false)).is_none());
        assert!(!state(&tracker).reported);
        assert!(tracker.observe(obs(11, true)).is_some());
    }

    #[test]
    fn test_active_observation_clears_evidence() {
        let mut tracker = IdleTracker::new(60, 10);

        tracker.observe(obs(0, true));
        assert_eq!(state(&tracker).evidence.util_samples, 1);

        tracker.observe(obs(1, false));
        assert_eq!(state(&tracker).evidence, PodEvidence::default());
        assert_eq!(state(&tracker).last_seen, at(1));
    }

    #[test]
    fn test_counter_zero_after_any_active_observation() {
        let mut tracker = IdleTracker::new(0, 100);
        let pattern = [true, true, false, true, false, false, true, true, true, false];

        for (minute, idle) in pattern.iter().enumerate() {
            tracker.observe(obs(minute as i64, *idle));
            if !idle {
                assert_eq!(state(&tracker).idle_count, 0);
                assert!(state(&tracker).idle_since.is_none());
            }
        }
    }

    #[test]
    fn test_workloads_are_tracked_independently() {
        let mut tracker = IdleTracker::new(0, 2);
        let other = WorkloadKey {
            uid: "other".to_string(),
            ..Default::default()
        };

        tracker.observe(obs(0, true));
        tracker.observe(Observation {
            key: other.clone(),
            ..obs(0, false)
        });
        assert!(tracker.observe(obs(1, true)).is_some());
        assert!(tracker
            .observe(Observation {
                key: other,
                ..obs(1, true)
            })
            .is_none());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_keys_without_identifiers_share_a_slot() {
        let mut tracker = IdleTracker::new(0, 2);
        let a = WorkloadKey {
            name: "a".to_string(),
            ..Default::default()
        };
        let b = WorkloadKey {
            name: "b".to_string(),
            ..Default::default()
        };

        tracker.observe(Observation {
            key: a,
            ..obs(0, true)
        });
        let candidate = tracker
            .observe(Observation {
                key: b,
                ..obs(1, true)
            })
            .unwrap();
        assert_eq!(candidate.key.name, "b");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_gc_removes_only_stale_keys() {
        let mut tracker = IdleTracker::new(0, 100);
        tracker.observe(obs(0, true));

        // Exactly max_age old is kept
        assert_eq!(tracker.gc(at(120), Duration::minutes(120)), 0);
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.gc(at(121), Duration::minutes(120)), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_gc_keeps_recently_seen() {
        let mut tracker = IdleTracker::new(0, 100);
        tracker.observe(obs(0, true));
        tracker.observe(Observation {
            key: WorkloadKey {
                uid: "fresh".to_string(),
                ..Default::default()
            },
            ..obs(100, true)
        });

        assert_eq!(tracker.gc(at(130), Duration::minutes(120)), 1);
        assert!(tracker.get(&TrackingId::Uid("fresh".to_string())).is_some());
    }
}
