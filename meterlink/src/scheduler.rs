//! Per-topic publish throttling.
//!
//! Each topic gets a publish interval from the first matching
//! [`IntervalRule`]. Deadlines are aligned to multiples of the interval so
//! that topics sharing an interval wake the session together and send times
//! never drift with poll jitter.

use std::collections::HashMap;

use regex::Regex;

/// Interval used when no rule matches a topic.
pub const DEFAULT_INTERVAL_SECS: f64 = 5.0;

/// A topic pattern and the interval it selects.
#[derive(Debug, Clone)]
pub struct IntervalRule {
    pattern: Regex,
    interval: f64,
}

impl IntervalRule {
    /// Compile a rule. The pattern is anchored at the start of the topic.
    pub fn new(pattern: &str, interval_secs: f64) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("^(?:{})", pattern))?;
        Ok(Self {
            pattern,
            interval: interval_secs,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.pattern.is_match(topic)
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }
}

/// Ordered interval rules; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct IntervalRules {
    rules: Vec<IntervalRule>,
}

impl IntervalRules {
    pub fn new(rules: Vec<IntervalRule>) -> Self {
        Self { rules }
    }

    /// Publish interval in seconds for `topic`.
    pub fn interval_for(&self, topic: &str) -> f64 {
        self.rules
            .iter()
            .find(|rule| rule.matches(topic))
            .map_or(DEFAULT_INTERVAL_SECS, IntervalRule::interval)
    }
}

/// Smallest multiple of `interval` strictly greater than `now`.
pub fn next_boundary(now: f64, interval: f64) -> f64 {
    ((now / interval).floor() + 1.0) * interval
}

/// Throttle state of one device session.
///
/// Maps each topic suffix to the earliest time (seconds since epoch) it may
/// be published again.
#[derive(Debug, Default)]
pub struct TopicScheduler {
    rules: IntervalRules,
    next_send: HashMap<String, f64>,
}

impl TopicScheduler {
    pub fn new(rules: IntervalRules) -> Self {
        Self {
            rules,
            next_send: HashMap::new(),
        }
    }

    /// Decide whether `topic` may be published at `now`.
    ///
    /// A topic never seen before is always due. A tracked topic is due once
    /// `now` reaches its deadline (`>=`, not `>`), so a poll landing exactly
    /// on an interval boundary publishes. When due, the topic's next deadline
    /// moves to the next interval boundary after `now`.
    pub fn poll(&mut self, now: f64, topic: &str) -> bool {
        let due = self
            .next_send
            .get(topic)
            .is_none_or(|deadline| now >= *deadline);
        if due {
            let interval = self.rules.interval_for(topic);
            self.next_send
                .insert(topic.to_string(), next_boundary(now, interval));
        }
        due
    }

    /// Close a poll cycle.
    ///
    /// Deadlines at or before `now` are forgotten, so a topic that stopped
    /// appearing no longer pins the wakeup time. Deadlines still ahead are
    /// kept even for topics missing from this cycle, which keeps them
    /// throttled when their block comes back.
    pub fn finish_cycle(&mut self, now: f64) {
        self.next_send.retain(|_, deadline| *deadline > now);
    }

    /// Earliest deadline across all tracked topics.
    pub fn next_wakeup(&self) -> Option<f64> {
        self.next_send.values().copied().reduce(f64::min)
    }

    pub fn deadline(&self, topic: &str) -> Option<f64> {
        self.next_send.get(topic).copied()
    }

    pub fn len(&self) -> usize {
        self.next_send.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_send.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy_rules() -> IntervalRules {
        IntervalRules::new(vec![IntervalRule::new("energy/", 60.0).unwrap()])
    }

    #[test]
    fn test_first_match_wins() {
        let rules = IntervalRules::new(vec![
            IntervalRule::new("energy/import", 300.0).unwrap(),
            IntervalRule::new("energy/", 60.0).unwrap(),
            IntervalRule::new(".*", 10.0).unwrap(),
        ]);

        assert_eq!(rules.interval_for("energy/import/L1"), 300.0);
        assert_eq!(rules.interval_for("energy/export"), 60.0);
        assert_eq!(rules.interval_for("voltage/L1"), 10.0);
    }

    #[test]
    fn test_default_interval() {
        let rules = energy_rules();
        assert_eq!(rules.interval_for("power"), DEFAULT_INTERVAL_SECS);
        assert_eq!(IntervalRules::default().interval_for("power"), 5.0);
    }

    #[test]
    fn test_patterns_anchor_at_start() {
        let rules = IntervalRules::new(vec![IntervalRule::new("import", 60.0).unwrap()]);
        assert_eq!(rules.interval_for("energy/import"), DEFAULT_INTERVAL_SECS);
        assert_eq!(rules.interval_for("import/L1"), 60.0);

        let anchored = IntervalRules::new(vec![IntervalRule::new("^energy/", 60.0).unwrap()]);
        assert_eq!(anchored.interval_for("energy/net"), 60.0);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(IntervalRule::new("energy/(", 60.0).is_err());
    }

    #[test]
    fn test_next_boundary() {
        assert_eq!(next_boundary(0.0, 60.0), 60.0);
        assert_eq!(next_boundary(59.9, 60.0), 60.0);
        assert_eq!(next_boundary(60.0, 60.0), 120.0);
        assert_eq!(next_boundary(1_700_000_003.2, 5.0), 1_700_000_005.0);
    }

    #[test]
    fn test_throttles_to_interval_boundaries() {
        let mut scheduler = TopicScheduler::new(energy_rules());

        let mut sent = Vec::new();
        for step in 0..=40 {
            let now = f64::from(step) * 5.0;
            if scheduler.poll(now, "energy/import") {
                sent.push(now);
            }
            scheduler.finish_cycle(now);
        }

        assert_eq!(sent, vec![0.0, 60.0, 120.0, 180.0]);
    }

    #[test]
    fn test_late_poll_does_not_drift() {
        let mut scheduler = TopicScheduler::new(energy_rules());

        assert!(scheduler.poll(3.0, "energy/import"));
        assert_eq!(scheduler.deadline("energy/import"), Some(60.0));
        assert!(!scheduler.poll(59.0, "energy/import"));
        assert!(scheduler.poll(61.7, "energy/import"));
        assert_eq!(scheduler.deadline("energy/import"), Some(120.0));
    }

    #[test]
    fn test_wakeup_is_earliest_deadline() {
        let mut scheduler = TopicScheduler::new(energy_rules());

        assert!(scheduler.poll(2.0, "voltage"));
        assert!(scheduler.poll(2.0, "energy/import"));
        scheduler.finish_cycle(2.0);

        assert_eq!(scheduler.deadline("voltage"), Some(5.0));
        assert_eq!(scheduler.deadline("energy/import"), Some(60.0));
        assert_eq!(scheduler.next_wakeup(), Some(5.0));
    }

    #[test]
    fn test_empty_scheduler_has_no_wakeup() {
        let scheduler = TopicScheduler::new(IntervalRules::default());
        assert_eq!(scheduler.next_wakeup(), None);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_expired_absent_topics_are_purged() {
        let mut scheduler = TopicScheduler::new(energy_rules());

        scheduler.poll(1.0, "voltage");
        scheduler.poll(1.0, "energy/import");
        scheduler.finish_cycle(1.0);
        assert_eq!(scheduler.len(), 2);

        // Neither topic is offered again; only the expired deadline goes.
        scheduler.finish_cycle(6.0);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.deadline("voltage"), None);
        assert_eq!(scheduler.deadline("energy/import"), Some(60.0));
        assert_eq!(scheduler.next_wakeup(), Some(60.0));
    }

    #[test]
    fn test_skipped_cycle_keeps_topic_throttled() {
        let mut scheduler = TopicScheduler::new(energy_rules());

        let mut sent = Vec::new();
        for now in [0.0, 5.0, 10.0, 15.0, 60.0] {
            // The block carrying the topic fails to decode at t = 5.
            if now != 5.0 && scheduler.poll(now, "energy/import") {
                sent.push(now);
            }
            scheduler.finish_cycle(now);
        }

        assert_eq!(sent, vec![0.0, 60.0]);
    }
}
