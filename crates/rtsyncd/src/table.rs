//! Source-specific routing table allocator
//!
//! Routes constrained by a source prefix live in their own kernel table,
//! selected by a policy rule `from <src> lookup <table>`. The allocator owns
//! a fixed pool of tables and one rule priority per slot:
//! slot `i` is priority `priority_base + i`.
//!
//! Rules are matched in ascending priority, so a more specific source prefix
//! must sit in a lower slot than any prefix covering it. Disjoint prefixes are
//! left in whatever order they arrived. Inserting ahead of an occupied slot
//! moves the following rules one priority up; each move adds the rule at its
//! new priority before removing the old one so the source never goes
//! unmatched.
//!
//! Bindings are only released by [`TableAllocator::teardown`].

use crate::config::RtsyncConfig;
use crate::error::{Result, RtsyncError};
use crate::types::ObservedRule;
use rtsync_types::{Family, IpPrefix, PrefixRelation};
use tracing::{debug, info, trace, warn};

/// Installs and removes policy rules on behalf of the allocator
#[cfg_attr(test, mockall::automock)]
pub trait RuleInstaller {
    /// Add `from src lookup table` at `priority`.
    fn add_rule(&mut self, priority: u32, src: &IpPrefix, table: u32) -> Result<()>;

    /// Remove one rule of `family` at `priority`.
    fn flush_rule(&mut self, priority: u32, family: Family) -> Result<()>;
}

/// A source prefix bound to a kernel table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleBinding {
    pub src: IpPrefix,
    pub table: u32,
}

/// Fixed-capacity pool of source tables ordered by rule priority
#[derive(Debug, Clone)]
pub struct TableAllocator {
    slots: Vec<Option<RuleBinding>>,
    used_tables: Vec<bool>,
    table_base: u32,
    priority_base: u32,
    export_table: u32,
    source_specific: bool,
    ipv6_subtrees: bool,
    max_flush_attempts: usize,
}

impl TableAllocator {
    pub fn new(table_base: u32, priority_base: u32, capacity: usize, export_table: u32) -> Self {
        Self {
            slots: vec![None; capacity],
            used_tables: vec![false; capacity],
            table_base,
            priority_base,
            export_table,
            source_specific: true,
            ipv6_subtrees: false,
            max_flush_attempts: 16,
        }
    }

    pub fn from_config(config: &RtsyncConfig) -> Self {
        let mut allocator = Self::new(
            config.source.table_base,
            config.source.priority_base,
            config.source.capacity,
            config.tables.export_table,
        );
        allocator.source_specific = config.source.enabled;
        allocator.ipv6_subtrees = config.source.ipv6_subtrees;
        allocator.max_flush_attempts = config.netlink.max_flush_attempts;
        allocator
    }

    pub fn with_ipv6_subtrees(mut self, enabled: bool) -> Self {
        self.ipv6_subtrees = enabled;
        self
    }

    pub fn with_source_specific(mut self, enabled: bool) -> Self {
        self.source_specific = enabled;
        self
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn export_table(&self) -> u32 {
        self.export_table
    }

    pub fn ipv6_subtrees(&self) -> bool {
        self.ipv6_subtrees
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rule priority of a slot
    pub fn priority_of(&self, slot: usize) -> u32 {
        self.priority_base + slot as u32
    }

    /// Binding held by a slot
    pub fn slot(&self, slot: usize) -> Option<&RuleBinding> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Occupied slots in priority order
    pub fn bindings(&self) -> impl Iterator<Item = (usize, &RuleBinding)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i, b)))
    }

    /// Slot index owning `priority`, if it falls in the allocator's range.
    fn slot_of_priority(&self, priority: u32) -> Option<usize> {
        let index = priority.checked_sub(self.priority_base)? as usize;
        (index < self.slots.len()).then_some(index)
    }

    /// Whether `src` is routed through the export table without a rule.
    fn needs_no_rule(&self, src: &IpPrefix) -> bool {
        !self.source_specific || src.is_default() || (self.ipv6_subtrees && src.is_ipv6())
    }

    /// Kernel table for routes from `src`, allocating a table and installing
    /// its rule on first use.
    pub fn resolve<R>(&mut self, src: Option<&IpPrefix>, installer: &mut R) -> Result<u32>
    where
        R: RuleInstaller + ?Sized,
    {
        let src = match src {
            Some(src) if !self.needs_no_rule(src) => src.network(),
            _ => return Ok(self.export_table),
        };

        let mut position = None;
        for (i, binding) in self.bindings() {
            match src.relation(&binding.src) {
                PrefixRelation::Equal => {
                    trace!(%src, table = binding.table, slot = i, "Source table hit");
                    return Ok(binding.table);
                }
                PrefixRelation::MoreSpecific => {
                    position = Some(i);
                    break;
                }
                PrefixRelation::LessSpecific | PrefixRelation::Disjoint => {}
            }
        }
        let position = position.unwrap_or_else(|| self.end_of_run());

        if self.len() >= self.capacity() {
            warn!(%src, capacity = self.capacity(), "All source tables are in use");
            return Err(RtsyncError::TableCapacity {
                capacity: self.capacity(),
            });
        }
        let table_index = self
            .used_tables
            .iter()
            .position(|used| !used)
            .ok_or(RtsyncError::TableCapacity {
                capacity: self.capacity(),
            })?;
        let table = self.table_base + table_index as u32;

        let slot = self.make_room(position, installer)?;

        installer.add_rule(self.priority_of(slot), &src, table)?;
        self.slots[slot] = Some(RuleBinding { src, table });
        self.used_tables[table_index] = true;

        info!(%src, table, slot, priority = self.priority_of(slot), "Allocated source table");
        Ok(table)
    }

    /// Index just past the last occupied slot.
    fn end_of_run(&self) -> usize {
        self.slots
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1)
    }

    /// Free the slot directly before whatever sits at `position`, shifting
    /// neighbours toward the nearest free slot. Returns the freed index.
    fn make_room<R>(&mut self, position: usize, installer: &mut R) -> Result<usize>
    where
        R: RuleInstaller + ?Sized,
    {
        if position < self.slots.len() && self.slots[position].is_none() {
            return Ok(position);
        }
        if position > 0 && self.slots[position - 1].is_none() {
            return Ok(position - 1);
        }

        let after = (position..self.slots.len()).find(|&i| self.slots[i].is_none());
        if let Some(free) = after {
            for i in (position..free).rev() {
                self.move_slot(i, i + 1, installer)?;
            }
            return Ok(position);
        }

        // Nothing free above; pull the run below `position` down instead.
        let before = (0..position).rev().find(|&i| self.slots[i].is_none());
        if let Some(free) = before {
            for i in free + 1..position {
                self.move_slot(i, i - 1, installer)?;
            }
            return Ok(position - 1);
        }

        Err(RtsyncError::TableCapacity {
            capacity: self.capacity(),
        })
    }

    /// Re-express the rule of slot `from` at the priority of the empty slot `to`.
    fn move_slot<R>(&mut self, from: usize, to: usize, installer: &mut R) -> Result<()>
    where
        R: RuleInstaller + ?Sized,
    {
        let Some(binding) = self.slots[from] else {
            return Ok(());
        };
        let old_priority = self.priority_of(from);
        let new_priority = self.priority_of(to);

        debug!(src = %binding.src, table = binding.table, old_priority, new_priority, "Moving source rule");
        installer.add_rule(new_priority, &binding.src, binding.table)?;
        self.slots[to] = Some(binding);
        self.slots[from] = None;

        if let Err(e) = installer.flush_rule(old_priority, binding.src.family()) {
            warn!(src = %binding.src, priority = old_priority, error = %e, "Failed to remove moved rule");
        }
        Ok(())
    }

    /// Compare the rules the kernel reports for `family` against the intended
    /// bindings, remove the ones that differ, and reinstall any binding whose
    /// rule is missing.
    ///
    /// Returns the number of rules reinstalled.
    pub fn reconcile<R>(&mut self, observed: &[ObservedRule], family: Family, installer: &mut R) -> usize
    where
        R: RuleInstaller + ?Sized,
    {
        let mut present = vec![false; self.slots.len()];

        for rule in observed.iter().filter(|r| r.family == family) {
            let Some(priority) = rule.priority else {
                continue;
            };
            if rule.src.is_some_and(|src| src.is_martian()) {
                continue;
            }
            let Some(slot) = self.slot_of_priority(priority) else {
                continue;
            };

            let matches = match (&self.slots[slot], &rule.src) {
                (Some(binding), Some(src)) => {
                    binding.src.relation(src) == PrefixRelation::Equal
                        && binding.src.prefix_len() == src.prefix_len()
                        && binding.table == rule.table
                }
                _ => false,
            };

            if matches && !present[slot] {
                present[slot] = true;
                continue;
            }

            warn!(priority, src = ?rule.src, table = rule.table, "Removing unexpected rule");
            self.flush_priority(priority, family, installer);
            present[slot] = false;
        }

        let mut reinstalled = 0;
        for (slot, binding) in self.slots.iter().enumerate() {
            let Some(binding) = binding else {
                continue;
            };
            if present[slot] || binding.src.family() != family {
                continue;
            }
            let priority = self.priority_of(slot);
            match installer.add_rule(priority, &binding.src, binding.table) {
                Ok(()) => {
                    info!(src = %binding.src, table = binding.table, priority, "Reinstalled missing rule");
                    reinstalled += 1;
                }
                Err(e) => {
                    warn!(src = %binding.src, table = binding.table, priority, error = %e, "Cannot install rule");
                }
            }
        }
        reinstalled
    }

    /// Remove every rule of `family` at `priority`, bounded by the flush limit.
    fn flush_priority<R>(&self, priority: u32, family: Family, installer: &mut R)
    where
        R: RuleInstaller + ?Sized,
    {
        for _ in 0..self.max_flush_attempts {
            match installer.flush_rule(priority, family) {
                Ok(()) => continue,
                Err(e) if e.is_not_found() || e.is_exists() => return,
                Err(e) => {
                    warn!(priority, error = %e, "Cannot remove rule");
                    return;
                }
            }
        }
        warn!(priority, attempts = self.max_flush_attempts, "Rule flush limit reached");
    }

    /// Flush every allocated rule and return all tables to the pool.
    pub fn teardown<R>(&mut self, installer: &mut R)
    where
        R: RuleInstaller + ?Sized,
    {
        for slot in 0..self.slots.len() {
            if let Some(binding) = self.slots[slot].take() {
                let priority = self.priority_of(slot);
                if let Err(e) = installer.flush_rule(priority, binding.src.family()) {
                    warn!(src = %binding.src, priority, error = %e, "Failed to flush rule");
                }
            }
        }
        self.used_tables.iter_mut().for_each(|used| *used = false);
        debug!("Released all source tables");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn p(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    /// Rule table keyed by (priority, family), mirroring the kernel.
    #[derive(Default)]
    struct FakeRules {
        rules: BTreeMap<(u32, bool), Vec<(IpPrefix, u32)>>,
        fail_add_at: Option<u32>,
        calls: usize,
    }

    impl RuleInstaller for FakeRules {
        fn add_rule(&mut self, priority: u32, src: &IpPrefix, table: u32) -> Result<()> {
            self.calls += 1;
            if self.fail_add_at == Some(priority) {
                return Err(RtsyncError::Kernel { code: libc::EPERM });
            }
            let rules = self.rules.entry((priority, src.is_ipv4())).or_default();
            if rules.contains(&(*src, table)) {
                return Err(RtsyncError::Kernel { code: libc::EEXIST });
            }
            rules.push((*src, table));
            Ok(())
        }

        fn flush_rule(&mut self, priority: u32, family: Family) -> Result<()> {
            self.calls += 1;
            let key = (priority, family.is_ipv4());
            match self.rules.get_mut(&key) {
                Some(rules) if !rules.is_empty() => {
                    rules.remove(0);
                    if rules.is_empty() {
                        self.rules.remove(&key);
                    }
                    Ok(())
                }
                _ => Err(RtsyncError::Kernel { code: libc::ENOENT }),
            }
        }
    }

    impl FakeRules {
        fn snapshot(&self) -> Vec<ObservedRule> {
            self.rules
                .iter()
                .flat_map(|(&(priority, v4), rules)| {
                    rules.iter().map(move |&(src, table)| ObservedRule {
                        family: if v4 { Family::Inet } else { Family::Inet6 },
                        priority: Some(priority),
                        src: Some(src),
                        table,
                    })
                })
                .collect()
        }
    }

    fn allocator() -> TableAllocator {
        TableAllocator::new(10, 100, 4, 254)
    }

    /// Slots are ordered by specificity and mirrored exactly by the rules.
    fn assert_consistent(allocator: &TableAllocator, rules: &FakeRules) {
        let bindings: Vec<_> = allocator.bindings().collect();
        for (a, (i, first)) in bindings.iter().enumerate() {
            for (j, second) in &bindings[a + 1..] {
                assert_ne!(
                    first.src.relation(&second.src),
                    PrefixRelation::LessSpecific,
                    "slot {} ({}) covers later slot {} ({})",
                    i,
                    first.src,
                    j,
                    second.src
                );
                assert_ne!(first.src, second.src);
            }
        }

        let expected: Vec<_> = bindings
            .iter()
            .map(|(i, b)| (allocator.priority_of(*i), b.src, b.table))
            .collect();
        let actual: Vec<_> = rules
            .snapshot()
            .into_iter()
            .map(|r| (r.priority.unwrap(), r.src.unwrap(), r.table))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_no_source_uses_export_table() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        assert_eq!(allocator.resolve(None, &mut rules).unwrap(), 254);
        assert_eq!(allocator.resolve(Some(&p("::/0")), &mut rules).unwrap(), 254);
        assert!(allocator.is_empty());
        assert_eq!(rules.calls, 0);
    }

    #[test]
    fn test_disabled_source_routing_uses_export_table() {
        let mut allocator = allocator().with_source_specific(false);
        let mut rules = FakeRules::default();
        assert_eq!(allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap(), 254);
        assert!(allocator.is_empty());
    }

    #[test]
    fn test_ipv6_subtrees_bypass_rules_for_v6_only() {
        let mut allocator = allocator().with_ipv6_subtrees(true);
        let mut rules = FakeRules::default();
        assert_eq!(
            allocator.resolve(Some(&p("2001:db8::/32")), &mut rules).unwrap(),
            254
        );
        assert_eq!(allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap(), 10);
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        let first = allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();
        let calls = rules.calls;
        let second = allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();
        assert_eq!(first, second);
        assert_eq!(rules.calls, calls);
        assert_eq!(allocator.len(), 1);
    }

    #[test]
    fn test_host_bits_are_ignored() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        let first = allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();
        let second = allocator.resolve(Some(&p("10.9.9.9/8")), &mut rules).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_more_specific_goes_first() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        let wide = allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();
        let narrow = allocator.resolve(Some(&p("10.1.0.0/16")), &mut rules).unwrap();

        assert_eq!(allocator.slot(0).unwrap().src, p("10.1.0.0/16"));
        assert_eq!(allocator.slot(0).unwrap().table, narrow);
        assert_eq!(allocator.slot(1).unwrap().table, wide);
        assert_consistent(&allocator, &rules);
    }

    #[test]
    fn test_superset_does_not_reorder_disjoint_slots() {
        let mut allocator = TableAllocator::new(10, 100, 8, 254);
        let mut rules = FakeRules::default();
        for src in ["192.168.0.0/16", "10.1.0.0/16", "172.16.0.0/12"] {
            allocator.resolve(Some(&p(src)), &mut rules).unwrap();
        }
        allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();

        let order: Vec<_> = allocator.bindings().map(|(_, b)| b.src).collect();
        assert_eq!(
            order,
            vec![
                p("192.168.0.0/16"),
                p("10.1.0.0/16"),
                p("172.16.0.0/12"),
                p("10.0.0.0/8"),
            ]
        );
        assert_consistent(&allocator, &rules);
    }

    #[test]
    fn test_shift_keeps_rules_in_step() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();
        allocator.resolve(Some(&p("10.0.0.0/16")), &mut rules).unwrap();
        allocator.resolve(Some(&p("10.0.0.0/24")), &mut rules).unwrap();

        let order: Vec<_> = allocator.bindings().map(|(i, b)| (i, b.src)).collect();
        assert_eq!(
            order,
            vec![
                (0, p("10.0.0.0/24")),
                (1, p("10.0.0.0/16")),
                (2, p("10.0.0.0/8")),
            ]
        );
        assert_consistent(&allocator, &rules);
    }

    /// Visit every ordering of `items` (Heap's algorithm).
    fn permutations<T: Clone>(items: &mut Vec<T>, k: usize, visit: &mut dyn FnMut(&[T])) {
        if k <= 1 {
            visit(items);
            return;
        }
        permutations(items, k - 1, visit);
        for i in 0..k - 1 {
            let swap = if k % 2 == 0 { i } else { 0 };
            items.swap(swap, k - 1);
            permutations(items, k - 1, visit);
        }
    }

    #[test]
    fn test_specificity_holds_for_every_insertion_order() {
        let mut prefixes = vec![
            p("10.0.0.0/8"),
            p("10.1.0.0/16"),
            p("10.1.2.0/24"),
            p("192.168.0.0/16"),
            p("0.0.0.0/1"),
        ];
        let k = prefixes.len();
        let mut orderings = 0;
        permutations(&mut prefixes, k, &mut |order| {
            let mut allocator = TableAllocator::new(10, 100, 5, 254);
            let mut rules = FakeRules::default();
            let mut tables = Vec::new();
            for src in order {
                tables.push(allocator.resolve(Some(src), &mut rules).unwrap());
            }
            assert_consistent(&allocator, &rules);
            // Every prefix still resolves to the table it was given
            for (src, table) in order.iter().zip(&tables) {
                assert_eq!(allocator.resolve(Some(src), &mut rules).unwrap(), *table);
            }
            orderings += 1;
        });
        assert_eq!(orderings, 120);
    }

    #[test]
    fn test_capacity_exhaustion_leaves_slots_unchanged() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        for src in ["10.0.0.0/8", "11.0.0.0/8", "12.0.0.0/8", "13.0.0.0/8"] {
            allocator.resolve(Some(&p(src)), &mut rules).unwrap();
        }
        let before: Vec<_> = allocator.bindings().map(|(i, b)| (i, *b)).collect();
        let calls = rules.calls;

        let err = allocator
            .resolve(Some(&p("10.1.0.0/16")), &mut rules)
            .unwrap_err();
        assert!(matches!(err, RtsyncError::TableCapacity { capacity: 4 }));

        let after: Vec<_> = allocator.bindings().map(|(i, b)| (i, *b)).collect();
        assert_eq!(before, after);
        assert_eq!(rules.calls, calls);
    }

    #[test]
    fn test_failed_rule_install_does_not_commit() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();

        rules.fail_add_at = Some(100);
        assert!(allocator.resolve(Some(&p("10.1.0.0/16")), &mut rules).is_err());
        // The shift completed, the new binding did not
        assert!(allocator.slot(0).is_none());
        assert_eq!(allocator.slot(1).unwrap().src, p("10.0.0.0/8"));
        assert_eq!(allocator.len(), 1);
        assert_consistent(&allocator, &rules);

        // The hole is reused and order still holds
        rules.fail_add_at = None;
        let table = allocator.resolve(Some(&p("10.1.0.0/16")), &mut rules).unwrap();
        assert_eq!(allocator.slot(0).unwrap().table, table);
        assert_consistent(&allocator, &rules);
    }

    #[test]
    fn test_hole_below_is_used_when_nothing_free_above() {
        let mut allocator = TableAllocator::new(10, 100, 3, 254);
        let mut rules = FakeRules::default();
        allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();
        allocator.resolve(Some(&p("11.0.0.0/8")), &mut rules).unwrap();

        // Leaves slot 0 empty and the two /8s in slots 1 and 2
        rules.fail_add_at = Some(100);
        assert!(allocator.resolve(Some(&p("10.1.0.0/16")), &mut rules).is_err());
        rules.fail_add_at = None;
        assert!(allocator.slot(0).is_none());

        // 11.1.0.0/16 must precede 11.0.0.0/8 in slot 2; slot 1 moves down
        allocator.resolve(Some(&p("11.1.0.0/16")), &mut rules).unwrap();
        let order: Vec<_> = allocator.bindings().map(|(i, b)| (i, b.src)).collect();
        assert_eq!(
            order,
            vec![
                (0, p("10.0.0.0/8")),
                (1, p("11.1.0.0/16")),
                (2, p("11.0.0.0/8")),
            ]
        );
        assert_consistent(&allocator, &rules);
    }

    #[test]
    fn test_lowest_free_table_is_used() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        let tables: Vec<_> = ["10.0.0.0/8", "2001:db8::/32", "10.1.0.0/16"]
            .iter()
            .map(|s| allocator.resolve(Some(&p(s)), &mut rules).unwrap())
            .collect();
        assert_eq!(tables, vec![10, 11, 12]);
    }

    #[test]
    fn test_reconcile_restores_missing_rule() {
        let mut allocator = allocator();
        let mut mock = MockRuleInstaller::new();
        mock.expect_add_rule().times(3).returning(|_, _, _| Ok(()));
        for src in ["10.0.0.0/8", "11.0.0.0/8", "12.0.0.0/8"] {
            allocator.resolve(Some(&p(src)), &mut mock).unwrap();
        }

        let observed: Vec<_> = allocator
            .bindings()
            .filter(|(i, _)| *i != 1)
            .map(|(i, b)| ObservedRule {
                family: Family::Inet,
                priority: Some(allocator.priority_of(i)),
                src: Some(b.src),
                table: b.table,
            })
            .collect();

        let mut mock = MockRuleInstaller::new();
        mock.expect_add_rule()
            .with(eq(101), eq(p("11.0.0.0/8")), eq(11))
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_flush_rule().never();

        assert_eq!(allocator.reconcile(&observed, Family::Inet, &mut mock), 1);
    }

    #[test]
    fn test_reconcile_flushes_mismatched_rule_until_absent() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        allocator.resolve(Some(&p("10.0.0.0/8")), &mut rules).unwrap();

        // A third party replaced our rule and added a second one at the same priority
        rules.flush_rule(100, Family::Inet).unwrap();
        rules.add_rule(100, &p("172.16.0.0/12"), 99).unwrap();
        rules.add_rule(100, &p("172.17.0.0/16"), 98).unwrap();

        let observed = rules.snapshot();
        assert_eq!(allocator.reconcile(&observed, Family::Inet, &mut rules), 1);
        assert_eq!(allocator.slot(0).unwrap().src, p("10.0.0.0/8"));
        assert_consistent(&allocator, &rules);
    }

    #[test]
    fn test_reconcile_ignores_other_family_and_foreign_priorities() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        allocator.resolve(Some(&p("2001:db8::/32")), &mut rules).unwrap();

        let observed = vec![
            ObservedRule {
                family: Family::Inet6,
                priority: Some(100),
                src: Some(p("2001:db8::/32")),
                table: 10,
            },
            ObservedRule {
                family: Family::Inet6,
                priority: Some(32766),
                src: None,
                table: 254,
            },
            ObservedRule {
                family: Family::Inet6,
                priority: None,
                src: Some(p("2001:db8:1::/48")),
                table: 7,
            },
        ];

        let mut mock = MockRuleInstaller::new();
        mock.expect_flush_rule().never();
        mock.expect_add_rule().never();
        assert_eq!(allocator.reconcile(&observed, Family::Inet6, &mut mock), 0);
        // The v6 binding is not reinstalled when reconciling v4
        assert_eq!(allocator.reconcile(&[], Family::Inet, &mut mock), 0);
    }

    #[test]
    fn test_reconcile_flush_is_bounded() {
        let mut allocator = allocator();
        let observed = vec![ObservedRule {
            family: Family::Inet,
            priority: Some(102),
            src: Some(p("172.16.0.0/12")),
            table: 99,
        }];

        let mut mock = MockRuleInstaller::new();
        mock.expect_flush_rule()
            .with(eq(102), always())
            .times(16)
            .returning(|_, _| Ok(()));
        assert_eq!(allocator.reconcile(&observed, Family::Inet, &mut mock), 0);
    }

    #[test]
    fn test_teardown_flushes_everything() {
        let mut allocator = allocator();
        let mut rules = FakeRules::default();
        for src in ["10.0.0.0/8", "10.1.0.0/16", "2001:db8::/32"] {
            allocator.resolve(Some(&p(src)), &mut rules).unwrap();
        }
        allocator.teardown(&mut rules);
        assert!(allocator.is_empty());
        assert!(rules.snapshot().is_empty());

        // Tables are handed out from the bottom again
        assert_eq!(allocator.resolve(Some(&p("12.0.0.0/8")), &mut rules).unwrap(), 10);
    }
}
