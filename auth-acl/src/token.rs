use crate::models::AccessFact;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Permission string to every fact recorded for it across a subject's
/// closure, in merge order.
///
/// The governing fact per permission is computed on first query and kept
/// until the index is changed again.
#[derive(Debug, Default)]
pub struct FactIndex {
    entries: HashMap<String, Vec<AccessFact>>,
    governing: OnceLock<HashMap<String, usize>>,
}

impl FactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fact: AccessFact) {
        self.entries
            .entry(fact.permission.clone())
            .or_default()
            .push(fact);
        self.governing = OnceLock::new();
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = AccessFact>) {
        for fact in facts {
            self.add(fact);
        }
    }

    /// Append every fact of `other`. Duplicates are kept.
    pub fn merge(&mut self, other: FactIndex) {
        for (permission, facts) in other.entries {
            self.entries.entry(permission).or_default().extend(facts);
        }
        self.governing = OnceLock::new();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of facts, duplicates included
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Facts recorded for `permission` in merge order
    pub fn facts(&self, permission: &str) -> &[AccessFact] {
        self.entries
            .get(permission)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Facts for `permission` in ascending priority; equal priorities keep
    /// merge order, so the last element is the governing fact.
    pub fn ranked(&self, permission: &str) -> Vec<&AccessFact> {
        let mut ranked: Vec<&AccessFact> = self.facts(permission).iter().collect();
        ranked.sort_by_key(|fact| fact.priority());
        ranked
    }

    pub fn governing(&self, permission: &str) -> Option<&AccessFact> {
        let position = *self.reduced().get(permission)?;
        self.entries.get(permission)?.get(position)
    }

    fn reduced(&self) -> &HashMap<String, usize> {
        self.governing.get_or_init(|| {
            self.entries
                .iter()
                .filter_map(|(permission, facts)| {
                    governing_position(facts).map(|position| (permission.clone(), position))
                })
                .collect()
        })
    }
}

/// Index of the fact with the greatest priority, the latest one on ties
fn governing_position(facts: &[AccessFact]) -> Option<usize> {
    facts
        .iter()
        .enumerate()
        .max_by_key(|(position, fact)| (fact.priority(), *position))
        .map(|(position, _)| position)
}

/// The resolved, queryable view of a subject's access
#[derive(Debug)]
pub enum AccessToken {
    Facts(FactIndex),
    /// Held only by the root principal; every query is granted
    GrantAll,
}

impl AccessToken {
    pub fn is_grant_all(&self) -> bool {
        matches!(self, AccessToken::GrantAll)
    }

    pub fn get_access(&self, permission: &str) -> bool {
        match self {
            AccessToken::GrantAll => true,
            AccessToken::Facts(_) => self
                .get_access_entry(permission)
                .is_some_and(AccessFact::is_grant),
        }
    }

    /// The fact that decides `permission`, or `None` when access is denied
    /// by default. The grant-all token never consults facts.
    pub fn get_access_entry(&self, permission: &str) -> Option<&AccessFact> {
        match self {
            AccessToken::Facts(index) => index.governing(permission),
            AccessToken::GrantAll => None,
        }
    }

    pub fn ranked_entries(&self, permission: &str) -> Vec<&AccessFact> {
        match self {
            AccessToken::Facts(index) => index.ranked(permission),
            AccessToken::GrantAll => Vec::new(),
        }
    }

    pub fn index(&self) -> Option<&FactIndex> {
        match self {
            AccessToken::Facts(index) => Some(index),
            AccessToken::GrantAll => None,
        }
    }
}

impl From<FactIndex> for AccessToken {
    fn from(index: FactIndex) -> Self {
        AccessToken::Facts(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubjectKey;
    use proptest::prelude::*;

    fn user() -> SubjectKey {
        SubjectKey::user(3)
    }

    fn group() -> SubjectKey {
        SubjectKey::group(8)
    }

    #[test]
    fn test_no_facts_denies() {
        let token = AccessToken::from(FactIndex::new());
        assert!(!token.get_access("admin"));
        assert!(token.get_access_entry("admin").is_none());
    }

    #[test]
    fn test_revoke_wins_at_same_level() {
        let mut index = FactIndex::new();
        index.add(AccessFact::revoke(user(), "print"));
        index.add(AccessFact::grant(group(), "print"));

        let token = AccessToken::from(index);
        assert!(!token.get_access("print"));
        assert_eq!(
            token.get_access_entry("print"),
            Some(&AccessFact::revoke(user(), "print"))
        );
    }

    #[test]
    fn test_higher_level_dominates() {
        let mut index = FactIndex::new();
        index.add(AccessFact::revoke(user(), "print").at_level(2));
        for _ in 0..10 {
            index.add(AccessFact::grant(group(), "print").at_level(1));
        }
        assert!(!AccessToken::from(index).get_access("print"));

        let mut index = FactIndex::new();
        index.add(AccessFact::revoke(user(), "print"));
        index.add(AccessFact::grant(group(), "print").at_level(1));
        assert!(AccessToken::from(index).get_access("print"));
    }

    #[test]
    fn test_ties_go_to_latest_in_merge_order() {
        let mut index = FactIndex::new();
        index.add(AccessFact::grant(user(), "print"));
        index.add(AccessFact::grant(group(), "print"));

        assert_eq!(index.governing("print").map(|f| f.subject), Some(group()));

        let ranked: Vec<SubjectKey> = index.ranked("print").iter().map(|f| f.subject).collect();
        assert_eq!(ranked, vec![user(), group()]);
    }

    #[test]
    fn test_merge_keeps_duplicates_and_resets_memo() {
        let mut index = FactIndex::new();
        index.add(AccessFact::grant(user(), "print"));
        assert!(index.governing("print").is_some_and(AccessFact::is_grant));

        let mut other = FactIndex::new();
        other.add(AccessFact::grant(group(), "print"));
        other.add(AccessFact::grant(group(), "print"));
        other.add(AccessFact::revoke(group(), "print"));
        index.merge(other);

        assert_eq!(index.len(), 4);
        assert_eq!(index.facts("print").len(), 4);
        assert!(index.governing("print").is_some_and(|f| f.revoke));
    }

    #[test]
    fn test_add_after_query_recomputes() {
        let mut index = FactIndex::new();
        index.add(AccessFact::grant(user(), "scan"));
        assert!(index.governing("scan").is_some_and(AccessFact::is_grant));

        index.add(AccessFact::revoke(user(), "scan"));
        assert!(index.governing("scan").is_some_and(|f| f.revoke));
    }

    #[test]
    fn test_grant_all_answers_everything() {
        let token = AccessToken::GrantAll;
        assert!(token.get_access("print"));
        assert!(token.get_access("never-granted-anywhere"));
        assert!(token.get_access_entry("print").is_none());
        assert!(token.is_grant_all());
    }

    fn arb_fact() -> impl Strategy<Value = AccessFact> {
        (0..4i32, any::<bool>(), prop_oneof![Just(user()), Just(group())])
            .prop_map(|(level, revoke, subject)| AccessFact::new(subject, "print", revoke, level))
    }

    proptest! {
        #[test]
        fn prop_highest_level_decides_and_revoke_wins(facts in prop::collection::vec(arb_fact(), 0..24)) {
            let mut index = FactIndex::new();
            index.extend(facts.clone());
            let token = AccessToken::from(index);

            let expected = match facts.iter().map(|f| f.level).max() {
                None => false,
                Some(top) => !facts.iter().any(|f| f.level == top && f.revoke),
            };
            prop_assert_eq!(token.get_access("print"), expected);
        }

        #[test]
        fn prop_decision_ignores_order_of_lower_facts(
            lower in prop::collection::vec(arb_fact(), 0..16),
            revoke in any::<bool>(),
        ) {
            let top = AccessFact::new(user(), "print", revoke, 10);

            let mut forward = FactIndex::new();
            forward.extend(lower.iter().cloned());
            forward.add(top.clone());

            let mut backward = FactIndex::new();
            backward.add(top.clone());
            backward.extend(lower.iter().rev().cloned());

            prop_assert_eq!(forward.governing("print"), Some(&top));
            prop_assert_eq!(backward.governing("print"), Some(&top));
            prop_assert_eq!(AccessToken::from(forward).get_access("print"), !revoke);
        }
    }
}
