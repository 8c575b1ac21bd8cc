use std::{collections::HashMap, sync::RwLock};

use tracing::debug;

use crate::{
    directory::{Directory, DirectoryFuture, GroupRecord},
    DirectoryError, DirectoryResult, GroupKey, Member, MembershipState, Transition,
};

/// Directory keeping every group in process memory.
///
/// State is lost on restart, useful for tests and for deployments where
/// membership is mirrored elsewhere.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    groups: RwLock<HashMap<GroupKey, GroupRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of groups with any recorded state.
    pub fn len(&self) -> usize {
        self.groups.read().map(|groups| groups.len()).unwrap_or(0)
    }

    /// Returns true if no group has recorded state.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, group: &GroupKey, f: impl FnOnce(&GroupRecord) -> T) -> DirectoryResult<T> {
        let groups = self
            .groups
            .read()
            .map_err(|_| DirectoryError::Storage("poisoned lock".to_string()))?;
        Ok(match groups.get(group) {
            Some(record) => f(record),
            None => f(&GroupRecord::default()),
        })
    }
}

impl Directory for MemoryDirectory {
    fn get_state<'a>(
        &'a self,
        group: &'a GroupKey,
        address: &'a str,
    ) -> DirectoryFuture<'a, MembershipState> {
        Box::pin(async move { self.read(group, |record| record.state(address)) })
    }

    fn alias_owner<'a>(
        &'a self,
        group: &'a GroupKey,
        alias: &'a str,
    ) -> DirectoryFuture<'a, Option<String>> {
        Box::pin(async move { self.read(group, |record| record.members.get(alias).cloned()) })
    }

    fn members<'a>(&'a self, group: &'a GroupKey) -> DirectoryFuture<'a, Vec<Member>> {
        Box::pin(async move { self.read(group, GroupRecord::members) })
    }

    fn apply<'a>(
        &'a self,
        group: &'a GroupKey,
        address: &'a str,
        transition: Transition,
    ) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut groups = self
                .groups
                .write()
                .map_err(|_| DirectoryError::Storage("poisoned lock".to_string()))?;
            let record = groups.entry(group.clone()).or_default();
            let result = record.apply_all(&[(address.to_string(), transition.clone())]);
            if *record == GroupRecord::default() {
                groups.remove(group);
            }
            result?;
            debug!(
                group = %group,
                address = %address,
                transition = transition.name(),
                "Applied transition in memory"
            );
            Ok(())
        })
    }

    fn apply_batch<'a>(
        &'a self,
        group: &'a GroupKey,
        changes: Vec<(String, Transition)>,
    ) -> DirectoryFuture<'a, ()> {
        Box::pin(async move {
            let mut groups = self
                .groups
                .write()
                .map_err(|_| DirectoryError::Storage("poisoned lock".to_string()))?;
            let record = groups.entry(group.clone()).or_default();
            let result = record.apply_all(&changes);
            if *record == GroupRecord::default() {
                groups.remove(group);
            }
            result?;
            debug!(group = %group, changes = changes.len(), "Applied batch in memory");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_directory_roundtrip() {
        let directory = MemoryDirectory::new();
        let group = GroupKey::new("arpa2.org", "news");
        assert!(directory.is_empty());
        assert_eq!(
            directory.get_state(&group, "alice@arpa2.org").await.unwrap(),
            MembershipState::None
        );

        directory
            .apply(
                &group,
                "alice@arpa2.org",
                Transition::Subscribe {
                    alias: "alice".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(directory.len(), 1);
        assert_eq!(
            directory.get_state(&group, "alice@arpa2.org").await.unwrap(),
            MembershipState::Subscribed("alice".to_string())
        );
        assert_eq!(
            directory.alias_owner(&group, "alice").await.unwrap(),
            Some("alice@arpa2.org".to_string())
        );
        assert_eq!(directory.members(&group).await.unwrap().len(), 1);

        // other groups are independent
        let other = GroupKey::new("arpa2.org", "chat");
        assert_eq!(
            directory.get_state(&other, "alice@arpa2.org").await.unwrap(),
            MembershipState::None
        );
    }

    #[tokio::test]
    async fn test_memory_directory_conflict_keeps_state() {
        let directory = MemoryDirectory::new();
        let group = GroupKey::new("arpa2.org", "news");
        directory
            .apply(&group, "alice@arpa2.org", Transition::Refuse)
            .await
            .unwrap();

        let result = directory
            .apply(
                &group,
                "alice@arpa2.org",
                Transition::Subscribe {
                    alias: "alice".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(DirectoryError::Conflict(_))));
        assert_eq!(
            directory.get_state(&group, "alice@arpa2.org").await.unwrap(),
            MembershipState::Refused
        );
    }

    #[tokio::test]
    async fn test_memory_directory_batch() {
        let directory = MemoryDirectory::new();
        let group = GroupKey::new("arpa2.org", "news");
        directory
            .apply_batch(
                &group,
                vec![
                    ("bob@arpa2.org".to_string(), Transition::Refuse),
                    ("carol@arpa2.org".to_string(), Transition::Refuse),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            directory.get_state(&group, "carol@arpa2.org").await.unwrap(),
            MembershipState::Refused
        );

        // a failing change rolls back the whole batch
        let result = directory
            .apply_batch(
                &group,
                vec![
                    ("bob@arpa2.org".to_string(), Transition::Welcome),
                    (
                        "carol@arpa2.org".to_string(),
                        Transition::Subscribe {
                            alias: "carol".to_string(),
                        },
                    ),
                ],
            )
            .await;
        assert!(result.is_err());
        assert_eq!(
            directory.get_state(&group, "bob@arpa2.org").await.unwrap(),
            MembershipState::Refused
        );
    }

    #[tokio::test]
    async fn test_memory_directory_drops_empty_groups() {
        let directory = MemoryDirectory::new();
        let group = GroupKey::new("arpa2.org", "news");
        directory
            .apply(&group, "alice@arpa2.org", Transition::Decline)
            .await
            .unwrap();
        assert_eq!(directory.len(), 1);
        directory
            .apply(&group, "alice@arpa2.org", Transition::ClearDecline)
            .await
            .unwrap();
        assert!(directory.is_empty());
    }
}
