//! RBG Allocation Strategies
//!
//! Per-RBG winner selection among the UEs eligible for a new transmission.

use std::cmp::Ordering;
use std::str::FromStr;

use common::types::Rnti;
use serde::{Deserialize, Serialize};

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Cycle through eligible UEs RBG by RBG
    RoundRobin,
    /// Achievable rate over served rate
    ProportionalFair,
    /// Best channel quality on the RBG
    BestCqi,
}

impl FromStr for AllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "rr" | "round_robin" => Ok(AllocationStrategy::RoundRobin),
            "pf" | "proportional_fair" => Ok(AllocationStrategy::ProportionalFair),
            "best_cqi" | "bestcqi" | "max_cqi" => Ok(AllocationStrategy::BestCqi),
            other => Err(format!("Unknown allocation strategy: {}", other)),
        }
    }
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AllocationStrategy::RoundRobin => "round_robin",
            AllocationStrategy::ProportionalFair => "proportional_fair",
            AllocationStrategy::BestCqi => "best_cqi",
        };
        write!(f, "{}", name)
    }
}

/// One eligible UE as seen on one RBG
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RbgCandidate {
    pub rnti: Rnti,
    /// Mean CQI over the RBG's resource blocks
    pub average_cqi: f64,
    /// Bits per second the UE would get from this RBG alone
    pub achievable_rate: f64,
    /// Moving average of the UE's served rate in bits per second
    pub served_rate: f64,
}

/// Served rate floor, also the initial served rate
pub const MIN_SERVED_RATE: f64 = 1.0;

impl AllocationStrategy {
    /// Pick the winner of one RBG. `candidates` holds only eligible UEs;
    /// `last_winner` is the previous RBG winner in this direction.
    pub fn decide(&self, candidates: &[RbgCandidate], last_winner: Option<Rnti>) -> Option<Rnti> {
        match self {
            AllocationStrategy::RoundRobin => {
                let next = candidates
                    .iter()
                    .filter(|c| last_winner.map_or(true, |last| c.rnti > last))
                    .min_by_key(|c| c.rnti);
                next.or_else(|| candidates.iter().min_by_key(|c| c.rnti))
                    .map(|c| c.rnti)
            }
            AllocationStrategy::ProportionalFair => candidates
                .iter()
                .max_by(|a, b| {
                    pf_weight(a)
                        .total_cmp(&pf_weight(b))
                        .then(a.average_cqi.total_cmp(&b.average_cqi))
                        .then(lower_rnti_first(a, b))
                })
                .map(|c| c.rnti),
            AllocationStrategy::BestCqi => candidates
                .iter()
                .max_by(|a, b| {
                    a.average_cqi
                        .total_cmp(&b.average_cqi)
                        .then(lower_rnti_first(a, b))
                })
                .map(|c| c.rnti),
        }
    }
}

fn pf_weight(candidate: &RbgCandidate) -> f64 {
    candidate.achievable_rate / candidate.served_rate.max(MIN_SERVED_RATE)
}

fn lower_rnti_first(a: &RbgCandidate, b: &RbgCandidate) -> Ordering {
    b.rnti.cmp(&a.rnti)
}

/// Bits per second carried by `resource_elements` at `efficiency` bits per
/// RE over a TTI of `tti_ms`
pub fn achievable_rate(resource_elements: u32, efficiency: f64, tti_ms: f64) -> f64 {
    if tti_ms <= 0.0 {
        return 0.0;
    }
    resource_elements as f64 * efficiency * 1000.0 / tti_ms
}

/// Exponential moving average step; unscheduled UEs pass `achieved = 0`
pub fn update_served_rate(current: f64, achieved: f64, alpha: f64) -> f64 {
    ((1.0 - alpha) * current + alpha * achieved).max(MIN_SERVED_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(rnti: u16, cqi: f64, achievable: f64, served: f64) -> RbgCandidate {
        RbgCandidate {
            rnti: Rnti(rnti),
            average_cqi: cqi,
            achievable_rate: achievable,
            served_rate: served,
        }
    }

    #[test]
    fn test_round_robin_cycles_and_wraps() {
        let candidates = [
            candidate(1, 10.0, 1.0, 1.0),
            candidate(3, 10.0, 1.0, 1.0),
            candidate(4, 10.0, 1.0, 1.0),
        ];
        let rr = AllocationStrategy::RoundRobin;
        assert_eq!(rr.decide(&candidates, None), Some(Rnti(1)));
        assert_eq!(rr.decide(&candidates, Some(Rnti(1))), Some(Rnti(3)));
        // UE 2 is not eligible, so after 1 comes 3 even from cursor 2
        assert_eq!(rr.decide(&candidates, Some(Rnti(2))), Some(Rnti(3)));
        assert_eq!(rr.decide(&candidates, Some(Rnti(4))), Some(Rnti(1)));
    }

    #[test]
    fn test_round_robin_equal_share() {
        let candidates: Vec<_> = (1..=4).map(|r| candidate(r, 7.0, 1.0, 1.0)).collect();
        let mut counts = [0usize; 4];
        let mut last = None;
        for _ in 0..25 {
            last = AllocationStrategy::RoundRobin.decide(&candidates, last);
            counts[last.unwrap().ue_index().unwrap()] += 1;
        }
        let (min, max) = (counts.iter().min().unwrap(), counts.iter().max().unwrap());
        assert!(max - min <= 1);
    }

    #[test]
    fn test_best_cqi_tie_lowest_rnti() {
        let candidates = [
            candidate(3, 12.0, 1.0, 1.0),
            candidate(2, 12.0, 1.0, 1.0),
            candidate(1, 9.5, 1.0, 1.0),
        ];
        assert_eq!(AllocationStrategy::BestCqi.decide(&candidates, None), Some(Rnti(2)));
        assert_eq!(AllocationStrategy::BestCqi.decide(&[], None), None);
    }

    #[test]
    fn test_pf_never_served_beats_heavily_served() {
        let candidates = [
            candidate(1, 10.0, 5.0e6, 50.0e6),
            candidate(2, 10.0, 5.0e6, MIN_SERVED_RATE),
        ];
        assert_eq!(
            AllocationStrategy::ProportionalFair.decide(&candidates, None),
            Some(Rnti(2))
        );
    }

    #[test]
    fn test_pf_tie_breaks() {
        // Equal weight, better CQI wins
        let candidates = [candidate(1, 9.0, 2.0, 1.0), candidate(2, 11.0, 4.0, 2.0)];
        assert_eq!(
            AllocationStrategy::ProportionalFair.decide(&candidates, None),
            Some(Rnti(2))
        );
        // Equal weight and CQI, lower RNTI wins
        let candidates = [candidate(2, 9.0, 2.0, 1.0), candidate(1, 9.0, 2.0, 1.0)];
        assert_eq!(
            AllocationStrategy::ProportionalFair.decide(&candidates, None),
            Some(Rnti(1))
        );
    }

    #[test]
    fn test_pf_zero_served_rate_is_floored() {
        let candidates = [candidate(1, 15.0, 8.0e6, 0.0), candidate(2, 5.0, 1.0e6, 0.0)];
        assert_eq!(
            AllocationStrategy::ProportionalFair.decide(&candidates, None),
            Some(Rnti(1))
        );
    }

    #[test]
    fn test_served_rate_ema() {
        assert_eq!(update_served_rate(100.0, 300.0, 0.5), 200.0);
        assert_eq!(update_served_rate(100.0, 0.0, 0.25), 75.0);
        assert_eq!(update_served_rate(1.0, 0.0, 0.5), MIN_SERVED_RATE);
        assert_eq!(update_served_rate(100.0, 300.0, 0.0), 100.0);
    }

    #[test]
    fn test_achievable_rate() {
        // 4 RBs x 12 subcarriers x 14 symbols at 2 bits/RE over 1 ms
        let rate = achievable_rate(4 * 12 * 14, 2.0, 1.0);
        assert!((rate - 1_344_000.0).abs() < 1e-6);
        assert_eq!(achievable_rate(100, 2.0, 0.0), 0.0);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("pf".parse::<AllocationStrategy>(), Ok(AllocationStrategy::ProportionalFair));
        assert_eq!("Round-Robin".parse::<AllocationStrategy>(), Ok(AllocationStrategy::RoundRobin));
        assert_eq!("best_cqi".parse::<AllocationStrategy>(), Ok(AllocationStrategy::BestCqi));
        assert!("fifo".parse::<AllocationStrategy>().is_err());
    }
}
