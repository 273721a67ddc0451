//! Five-tier event queue with a configurable drain policy

use super::model::{EventPriority, RealTimeEvent};
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Events drained from a tier per round in weighted mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierWeights {
    #[serde(default = "default_critical_weight")]
    pub critical: u32,
    #[serde(default = "default_high_weight")]
    pub high: u32,
    #[serde(default = "default_normal_weight")]
    pub normal: u32,
    #[serde(default = "default_minor_weight")]
    pub low: u32,
    #[serde(default = "default_minor_weight")]
    pub background: u32,
}

fn default_critical_weight() -> u32 {
    8
}

fn default_high_weight() -> u32 {
    4
}

fn default_normal_weight() -> u32 {
    2
}

fn default_minor_weight() -> u32 {
    1
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            critical: default_critical_weight(),
            high: default_high_weight(),
            normal: default_normal_weight(),
            low: default_minor_weight(),
            background: default_minor_weight(),
        }
    }
}

impl TierWeights {
    /// Weights in tier order, each at least 1
    fn as_credits(&self) -> [u32; 5] {
        [
            self.critical,
            self.high,
            self.normal,
            self.low,
            self.background,
        ]
        .map(|w| w.max(1))
    }
}

/// How the drain loop picks the next tier
///
/// `strict` always serves the highest non-empty tier. `weighted` serves tiers round-robin in
/// proportion to their weights so lower tiers cannot starve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DrainPolicy {
    #[default]
    Strict,
    Weighted {
        #[serde(default)]
        weights: TierWeights,
    },
}

#[derive(Debug)]
pub struct PriorityRouter {
    tiers: [VecDeque<RealTimeEvent>; 5],
    capacity: usize,
    policy: DrainPolicy,
    credits: [u32; 5],
}

impl PriorityRouter {
    pub fn new(capacity: usize, policy: DrainPolicy) -> Self {
        let credits = match &policy {
            DrainPolicy::Strict => [0; 5],
            DrainPolicy::Weighted { weights } => weights.as_credits(),
        };
        Self {
            tiers: Default::default(),
            capacity,
            policy,
            credits,
        }
    }

    /// Append to the event's tier; a full tier rejects the event
    pub fn push(&mut self, event: RealTimeEvent) -> MeshResult<()> {
        let tier = &mut self.tiers[event.priority.tier_index()];
        if tier.len() >= self.capacity {
            return Err(MeshError::overflow(tier.len(), self.capacity));
        }
        tier.push_back(event);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<RealTimeEvent> {
        match &self.policy {
            DrainPolicy::Strict => self.tiers.iter_mut().find_map(VecDeque::pop_front),
            DrainPolicy::Weighted { weights } => {
                if self.is_empty() {
                    return None;
                }
                let refill = weights.as_credits();
                loop {
                    let next = (0..5).find(|&i| !self.tiers[i].is_empty() && self.credits[i] > 0);
                    match next {
                        Some(i) => {
                            self.credits[i] -= 1;
                            return self.tiers[i].pop_front();
                        }
                        // Every non-empty tier used its share this round
                        None => self.credits = refill,
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn depth(&self, priority: EventPriority) -> usize {
        self.tiers[priority.tier_index()].len()
    }

    pub fn depths(&self) -> BTreeMap<String, usize> {
        EventPriority::TIERS
            .iter()
            .map(|p| (p.as_str().to_string(), self.depth(*p)))
            .collect()
    }

    /// Drop everything pending. Returns how many events were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        for tier in &mut self.tiers {
            tier.clear();
        }
        dropped
    }
}
