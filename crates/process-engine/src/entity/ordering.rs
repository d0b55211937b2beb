//! Flush ordering policy.
//!
//! The cache itself does not know which entity types depend on which. The
//! policy lists types parents-first; inserts and updates follow that order,
//! deletes run in reverse so children go before their parents. Types the
//! policy does not know are written after all known types and deleted
//! before them.

use super::EntityKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct FlushOrdering {
    ranks: HashMap<String, usize>,
}

impl FlushOrdering {
    /// Build a policy from entity types listed parents-first.
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ranks = types
            .into_iter()
            .enumerate()
            .map(|(rank, t)| (t.into(), rank))
            .collect();
        Self { ranks }
    }

    pub fn rank(&self, entity_type: &str) -> usize {
        self.ranks.get(entity_type).copied().unwrap_or(usize::MAX)
    }

    pub fn sort_parents_first(&self, keys: &mut [EntityKey]) {
        keys.sort_by(|a, b| {
            self.rank(&a.entity_type)
                .cmp(&self.rank(&b.entity_type))
                .then_with(|| a.cmp(b))
        });
    }

    pub fn sort_children_first(&self, keys: &mut [EntityKey]) {
        keys.sort_by(|a, b| {
            self.rank(&b.entity_type)
                .cmp(&self.rank(&a.entity_type))
                .then_with(|| a.cmp(b))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents_first_and_children_first() {
        let ordering = FlushOrdering::new(["execution", "task"]);
        let mut keys = vec![
            EntityKey::new("task", "t1"),
            EntityKey::new("unknown", "u1"),
            EntityKey::new("execution", "e1"),
        ];

        ordering.sort_parents_first(&mut keys);
        let types: Vec<_> = keys.iter().map(|k| k.entity_type.as_str()).collect();
        assert_eq!(types, vec!["execution", "task", "unknown"]);

        ordering.sort_children_first(&mut keys);
        let types: Vec<_> = keys.iter().map(|k| k.entity_type.as_str()).collect();
        assert_eq!(types, vec!["unknown", "task", "execution"]);
    }
}
