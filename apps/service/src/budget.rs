use crate::config::BudgetPolicy;

/// Concurrency ceilings for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    policy: BudgetPolicy,
    sockets: usize,
    helpers: usize,
}

/// Room left for new work right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slots {
    pub sockets: usize,
    pub helpers: usize,
}

impl Budget {
    pub fn new(policy: BudgetPolicy, sockets: usize, helpers: usize) -> Self {
        Self { policy, sockets: sockets.max(1), helpers: helpers.max(1) }
    }

    /// Under [`BudgetPolicy::Shared`] every running helper also holds one
    /// socket slot.
    pub fn slots(&self, active_sockets: usize, running_helpers: usize) -> Slots {
        let helper_room = self.helpers.saturating_sub(running_helpers);
        match self.policy {
            BudgetPolicy::Separate => {
                Slots { sockets: self.sockets.saturating_sub(active_sockets), helpers: helper_room }
            }
            BudgetPolicy::Shared => {
                let free = self.sockets.saturating_sub(active_sockets + running_helpers);
                Slots { sockets: free, helpers: helper_room.min(free) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separate_pools() {
        let budget = Budget::new(BudgetPolicy::Separate, 10, 3);
        assert_eq!(budget.slots(0, 0), Slots { sockets: 10, helpers: 3 });
        assert_eq!(budget.slots(10, 3), Slots { sockets: 0, helpers: 0 });
        assert_eq!(budget.slots(4, 1), Slots { sockets: 6, helpers: 2 });
    }

    #[test]
    fn shared_ceiling() {
        let budget = Budget::new(BudgetPolicy::Shared, 10, 3);
        assert_eq!(budget.slots(0, 0), Slots { sockets: 10, helpers: 3 });
        assert_eq!(budget.slots(4, 2), Slots { sockets: 4, helpers: 1 });
        assert_eq!(budget.slots(9, 0), Slots { sockets: 1, helpers: 1 });
        assert_eq!(budget.slots(8, 2), Slots { sockets: 0, helpers: 0 });
    }

    #[test]
    fn zero_ceilings_are_raised() {
        let budget = Budget::new(BudgetPolicy::Separate, 0, 0);
        assert_eq!(budget.slots(0, 0), Slots { sockets: 1, helpers: 1 });
    }
}
