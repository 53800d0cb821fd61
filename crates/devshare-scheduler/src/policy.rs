//! Device unit selection policies

use devshare_core::{DeviceAllocationItem, SelectionPolicyKind};
use std::cmp::Reverse;
use std::sync::Arc;

/// A unit the allocator may take capacity from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Minor number
    pub minor: u32,
    /// Capacity available to this workload
    pub free: u64,
    /// Total capacity of the unit
    pub total: u64,
}

impl Candidate {
    fn is_idle(&self) -> bool {
        self.free == self.total
    }
}

/// Strategy for choosing which units cover a need
pub trait SelectionPolicy: Send + Sync {
    /// Policy name, for logs
    fn name(&self) -> &'static str;

    /// Cover `need` from `candidates` (healthy units with free capacity,
    /// ascending by minor). When the need cannot come from one unit and
    /// `whole_units` is set, only idle units may be used for the split.
    /// Returns `None` when the need cannot be covered.
    fn select(
        &self,
        candidates: &[Candidate],
        need: u64,
        whole_units: bool,
    ) -> Option<Vec<DeviceAllocationItem>>;
}

/// Build the policy named in configuration
pub fn policy_for(kind: SelectionPolicyKind) -> Arc<dyn SelectionPolicy> {
    match kind {
        SelectionPolicyKind::BestFit => Arc::new(BestFitPolicy),
        SelectionPolicyKind::FirstFit => Arc::new(FirstFitPolicy),
    }
}

fn split_eligible(candidates: &[Candidate], whole_units: bool) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| c.free > 0 && (!whole_units || c.is_idle()))
        .copied()
        .collect()
}

/// Smallest sufficient free capacity first, ties by ascending minor
pub struct BestFitPolicy;

impl BestFitPolicy {
    fn tightest(candidates: &[Candidate], need: u64) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.free >= need)
            .min_by_key(|(_, c)| (c.free, c.minor))
            .map(|(i, _)| i)
    }

    fn largest(candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| (c.free, Reverse(c.minor)))
            .map(|(i, _)| i)
    }
}

impl SelectionPolicy for BestFitPolicy {
    fn name(&self) -> &'static str {
        "best-fit"
    }

    fn select(
        &self,
        candidates: &[Candidate],
        need: u64,
        whole_units: bool,
    ) -> Option<Vec<DeviceAllocationItem>> {
        if need == 0 {
            return Some(Vec::new());
        }
        if let Some(i) = Self::tightest(candidates, need) {
            return Some(vec![DeviceAllocationItem {
                minor: candidates[i].minor,
                amount: need,
            }]);
        }

        // Split: close with the tightest unit that covers the remainder,
        // otherwise drain the largest one
        let mut pool = split_eligible(candidates, whole_units);
        let mut remaining = need;
        let mut items = Vec::new();
        while remaining > 0 {
            let i = Self::tightest(&pool, remaining).or_else(|| Self::largest(&pool))?;
            let unit = pool.swap_remove(i);
            let amount = unit.free.min(remaining);
            items.push(DeviceAllocationItem {
                minor: unit.minor,
                amount,
            });
            remaining -= amount;
        }
        Some(items)
    }
}

/// Lowest minor with enough capacity first
pub struct FirstFitPolicy;

impl SelectionPolicy for FirstFitPolicy {
    fn name(&self) -> &'static str {
        "first-fit"
    }

    fn select(
        &self,
        candidates: &[Candidate],
        need: u64,
        whole_units: bool,
    ) -> Option<Vec<DeviceAllocationItem>> {
        if need == 0 {
            return Some(Vec::new());
        }
        if let Some(unit) = candidates.iter().find(|c| c.free >= need) {
            return Some(vec![DeviceAllocationItem {
                minor: unit.minor,
                amount: need,
            }]);
        }

        let mut remaining = need;
        let mut items = Vec::new();
        for unit in split_eligible(candidates, whole_units) {
            if remaining == 0 {
                break;
            }
            let amount = unit.free.min(remaining);
            items.push(DeviceAllocationItem {
                minor: unit.minor,
                amount,
            });
            remaining -= amount;
        }
        (remaining == 0).then_some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(minor: u32, free: u64, total: u64) -> Candidate {
        Candidate { minor, free, total }
    }

    fn item(minor: u32, amount: u64) -> DeviceAllocationItem {
        DeviceAllocationItem { minor, amount }
    }

    #[test]
    fn test_best_fit_prefers_tightest_unit() {
        let candidates = vec![
            candidate(0, 100, 100),
            candidate(1, 40, 100),
            candidate(2, 60, 100),
        ];
        let items = BestFitPolicy.select(&candidates, 50, true).unwrap();
        assert_eq!(items, vec![item(2, 50)]);
    }

    #[test]
    fn test_best_fit_ties_break_by_minor() {
        let candidates = vec![
            candidate(3, 1, 1),
            candidate(1, 1, 1),
            candidate(2, 1, 1),
        ];
        let items = BestFitPolicy.select(&candidates, 1, false).unwrap();
        assert_eq!(items, vec![item(1, 1)]);
    }

    #[test]
    fn test_best_fit_split_minimizes_fragments() {
        let candidates = vec![
            candidate(0, 1, 1),
            candidate(1, 2, 2),
            candidate(2, 5, 5),
            candidate(3, 6, 6),
        ];
        let items = BestFitPolicy.select(&candidates, 7, false).unwrap();
        assert_eq!(items, vec![item(3, 6), item(0, 1)]);
    }

    #[test]
    fn test_best_fit_whole_unit_split_skips_partially_used() {
        let candidates = vec![
            candidate(0, 50, 100),
            candidate(1, 100, 100),
            candidate(2, 100, 100),
        ];
        let items = BestFitPolicy.select(&candidates, 200, true).unwrap();
        assert_eq!(items, vec![item(1, 100), item(2, 100)]);

        let candidates = vec![candidate(0, 50, 100), candidate(1, 100, 100)];
        assert!(BestFitPolicy.select(&candidates, 200, true).is_none());
    }

    #[test]
    fn test_best_fit_insufficient() {
        let candidates = vec![candidate(0, 1, 1)];
        assert!(BestFitPolicy.select(&candidates, 2, false).is_none());
        assert!(BestFitPolicy.select(&[], 1, false).is_none());
    }

    #[test]
    fn test_first_fit_uses_lowest_minor() {
        let candidates = vec![
            candidate(0, 100, 100),
            candidate(1, 40, 100),
        ];
        let items = FirstFitPolicy.select(&candidates, 30, true).unwrap();
        assert_eq!(items, vec![item(0, 30)]);

        let candidates = vec![
            candidate(0, 1, 1),
            candidate(1, 1, 1),
            candidate(2, 1, 1),
        ];
        let items = FirstFitPolicy.select(&candidates, 2, false).unwrap();
        assert_eq!(items, vec![item(0, 1), item(1, 1)]);
    }

    #[test]
    fn test_zero_need_selects_nothing() {
        let candidates = vec![candidate(0, 1, 1)];
        assert_eq!(BestFitPolicy.select(&candidates, 0, false), Some(vec![]));
        assert_eq!(FirstFitPolicy.select(&candidates, 0, false), Some(vec![]));
    }

    #[test]
    fn test_policy_for_config() {
        assert_eq!(policy_for(SelectionPolicyKind::BestFit).name(), "best-fit");
        assert_eq!(policy_for(SelectionPolicyKind::FirstFit).name(), "first-fit");
    }
}
