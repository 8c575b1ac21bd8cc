//! Membership state machine driven by authenticated commands.
//!
//! The [`Dispatcher`] reads the current state of every affected address,
//! decides the transitions locally and hands them to the [`Directory`]
//! in a single call. Commands on the same group are serialized with a
//! per-group async lock, commands on different groups run in parallel.

use std::{
    collections::HashMap,
    mem::take,
    sync::{Arc, Mutex, PoisonError},
};

use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    extract_addresses, generate_activation_code, normalize_address, split_address, Command,
    Directory, DirectoryError, GroupKey, MembershipState, Notifier, SenderIdentity, Transition,
    Verb,
};

/// Length of generated member aliases.
pub const ALIAS_LENGTH: usize = 8;

/// Number of generated aliases tried before giving up.
pub const MAX_ALIAS_ATTEMPTS: usize = 16;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Reasons a command is not carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Refused error: {address} is refused by {group}")]
    Refused { address: String, group: String },
    #[error("Alias error: {0} is taken")]
    AliasTaken(String),
    #[error("Owner error: alias {0} belongs to another mailbox")]
    NotOwner(String),
    #[error("Subscription error: {address} is not subscribed to {group}")]
    NotSubscribed { address: String, group: String },
    #[error("Authorization error: {0} may not issue this command")]
    NotAuthorized(String),
    #[error("Alias error: no free alias found in {0}")]
    AliasExhausted(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Policy knobs of the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DispatchPolicy {
    /// Senders allowed to issue body commands, either full addresses or
    /// `@domain` entries. Empty means every authenticated sender.
    pub operators: Vec<String>,
    /// Whether invitations carry an activation code.
    pub activation_code: bool,
}

impl DispatchPolicy {
    pub fn is_operator(&self, sender: &str) -> bool {
        if self.operators.is_empty() {
            return true;
        }
        let sender_domain = split_address(sender).map(|(_, domain)| domain);
        self.operators.iter().any(|operator| match operator.strip_prefix('@') {
            Some(domain) => sender_domain.is_some_and(|d| d.eq_ignore_ascii_case(domain)),
            None => operator.eq_ignore_ascii_case(sender),
        })
    }
}

/// What a dispatched command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub group: GroupKey,
    /// Transitions committed to the directory, in order.
    pub applied: Vec<(String, Transition)>,
    /// Addresses that needed no change.
    pub skipped: Vec<String>,
    /// Addresses an invitation was sent to.
    pub invited: Vec<String>,
    /// Addresses whose invitation could not be sent.
    pub notify_failures: Vec<String>,
}

impl DispatchReport {
    fn new(group: GroupKey) -> Self {
        Self {
            group,
            applied: Vec::new(),
            skipped: Vec::new(),
            invited: Vec::new(),
            notify_failures: Vec::new(),
        }
    }
}

/// Registry of per-group locks, entries live only while in use.
#[derive(Debug, Default)]
struct GroupLocks {
    locks: Mutex<HashMap<GroupKey, Arc<AsyncMutex<()>>>>,
}

impl GroupLocks {
    async fn lock(&self, group: &GroupKey) -> GroupGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(group.clone()).or_default().clone()
        };
        GroupGuard {
            locks: self,
            group: group.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct GroupGuard<'a> {
    locks: &'a GroupLocks,
    group: GroupKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // only the registry holds the lock, nobody is waiting for it
        if locks
            .get(&self.group)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.group);
        }
    }
}

/// Applies authenticated commands to the group directory.
pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
    locks: GroupLocks,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            directory,
            notifier,
            policy,
            locks: GroupLocks::default(),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Carries out `command` on behalf of `sender`, `body` being the
    /// signed message body used by invite, refuse and welcome.
    pub async fn dispatch(
        &self,
        sender: &SenderIdentity,
        command: &Command,
        body: &[u8],
    ) -> DispatchResult<DispatchReport> {
        let group = GroupKey::new(&command.domain, &command.group);
        let address = normalize_address(&sender.address);

        let targets = if command.verb.takes_body() {
            if !self.policy.is_operator(&address) {
                warn!(sender = %address, command = %command, "Sender is not an operator");
                return Err(DispatchError::NotAuthorized(address));
            }
            extract_addresses(body)
        } else {
            Vec::new()
        };

        let mut report = DispatchReport::new(group.clone());
        let invitees = {
            let _guard = self.locks.lock(&group).await;
            let mut changes = match command.verb {
                Verb::Subscribe => {
                    self.plan_subscribe(&group, &address, command.member.as_deref())
                        .await?
                }
                Verb::Unsubscribe => {
                    self.plan_unsubscribe(&group, &address, command.member.as_deref())
                        .await?
                }
                Verb::Decline => self.plan_decline(&group, &address).await?,
                Verb::Invite | Verb::Refuse | Verb::Welcome => {
                    self.plan_targets(&group, command.verb, &targets).await?
                }
            };
            let invitees = take(&mut changes.invitees);
            self.commit(&group, changes, &mut report).await?;
            invitees
        };

        // invitations are sent once the group lock is released
        for target in &invitees {
            self.invite(&group, target, &mut report).await;
        }

        info!(
            group = %group,
            verb = %command.verb,
            sender = %address,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            invited = report.invited.len(),
            "Command dispatched"
        );
        Ok(report)
    }

    async fn plan_subscribe(
        &self,
        group: &GroupKey,
        address: &str,
        member: Option<&str>,
    ) -> DispatchResult<Plan> {
        let state = self.directory.get_state(group, address).await?;
        let alias = match (&state, member) {
            (MembershipState::Refused, _) => {
                return Err(DispatchError::Refused {
                    address: address.to_string(),
                    group: group.to_string(),
                });
            }
            (MembershipState::Subscribed(_), None) => return Ok(Plan::skip(address)),
            (MembershipState::Subscribed(current), Some(member)) if current == member => {
                return Ok(Plan::skip(address));
            }
            (_, Some(member)) => match self.directory.alias_owner(group, member).await? {
                Some(owner) if owner != address => {
                    return Err(DispatchError::AliasTaken(group.alias_address(member)));
                }
                _ => member.to_string(),
            },
            (_, None) => self.generate_alias(group).await?,
        };
        Ok(Plan::change(address, Transition::Subscribe { alias }))
    }

    async fn plan_unsubscribe(
        &self,
        group: &GroupKey,
        address: &str,
        member: Option<&str>,
    ) -> DispatchResult<Plan> {
        let state = self.directory.get_state(group, address).await?;
        match (state, member) {
            (MembershipState::Subscribed(alias), None) => {
                Ok(Plan::change(address, Transition::Unsubscribe { alias }))
            }
            (MembershipState::Subscribed(alias), Some(member)) if alias == member => {
                Ok(Plan::change(address, Transition::Unsubscribe { alias }))
            }
            (state, Some(member)) => {
                if let Some(owner) = self.directory.alias_owner(group, member).await? {
                    if owner != address {
                        return Err(DispatchError::NotOwner(group.alias_address(member)));
                    }
                }
                match state {
                    MembershipState::Declined => Ok(Plan::change(address, Transition::ClearDecline)),
                    _ => Ok(Plan::skip(address)),
                }
            }
            (MembershipState::Declined, None) => {
                Ok(Plan::change(address, Transition::ClearDecline))
            }
            (_, None) => Err(DispatchError::NotSubscribed {
                address: address.to_string(),
                group: group.to_string(),
            }),
        }
    }

    async fn plan_decline(&self, group: &GroupKey, address: &str) -> DispatchResult<Plan> {
        match self.directory.get_state(group, address).await? {
            MembershipState::None => Ok(Plan::change(address, Transition::Decline)),
            _ => Ok(Plan::skip(address)),
        }
    }

    async fn plan_targets(
        &self,
        group: &GroupKey,
        verb: Verb,
        targets: &[String],
    ) -> DispatchResult<Plan> {
        let mut plan = Plan::default();
        for target in targets {
            let state = self.directory.get_state(group, target).await?;
            if verb == Verb::Invite {
                match state {
                    MembershipState::Refused => {
                        debug!(group = %group, target_address = %target, "Refused target not invited");
                    }
                    _ => plan.invitees.push(target.clone()),
                }
            }
            let transition = match (verb, state) {
                (Verb::Invite, MembershipState::Declined) => Some(Transition::ClearDecline),
                (Verb::Refuse, MembershipState::Refused) => None,
                (Verb::Refuse, _) => Some(Transition::Refuse),
                (Verb::Welcome, MembershipState::Refused) => Some(Transition::Welcome),
                _ => None,
            };
            match transition {
                Some(transition) => plan.changes.push((target.clone(), transition)),
                None => plan.skipped.push(target.clone()),
            }
        }
        Ok(plan)
    }

    async fn commit(
        &self,
        group: &GroupKey,
        plan: Plan,
        report: &mut DispatchReport,
    ) -> DispatchResult<()> {
        let Plan {
            changes, skipped, ..
        } = plan;
        for address in &skipped {
            debug!(group = %group, address = %address, "No transition needed");
        }
        report.skipped.extend(skipped);

        match changes.len() {
            0 => {}
            1 => {
                let (address, transition) = &changes[0];
                self.directory
                    .apply(group, address, transition.clone())
                    .await?;
            }
            _ => self.directory.apply_batch(group, changes.clone()).await?,
        }
        for (address, transition) in &changes {
            info!(
                group = %group,
                address = %address,
                transition = transition.name(),
                "Transition applied"
            );
        }
        report.applied.extend(changes);
        Ok(())
    }

    async fn invite(&self, group: &GroupKey, target: &str, report: &mut DispatchReport) {
        let code = self.policy.activation_code.then(generate_activation_code);
        match self
            .notifier
            .send_invitation(target, group, code.as_deref())
            .await
        {
            Ok(()) => report.invited.push(target.to_string()),
            Err(e) => {
                warn!(
                    group = %group,
                    target_address = %target,
                    notifier = self.notifier.name(),
                    error = %e,
                    "Failed to send invitation"
                );
                report.notify_failures.push(target.to_string());
            }
        }
    }

    async fn generate_alias(&self, group: &GroupKey) -> DispatchResult<String> {
        for _ in 0..MAX_ALIAS_ATTEMPTS {
            let alias = random_alias();
            if self.directory.alias_owner(group, &alias).await?.is_none() {
                return Ok(alias);
            }
            debug!(group = %group, alias = %alias, "Generated alias collides, retrying");
        }
        Err(DispatchError::AliasExhausted(group.to_string()))
    }
}

/// Transitions decided for one command, before they are committed.
#[derive(Debug, Default)]
struct Plan {
    changes: Vec<(String, Transition)>,
    skipped: Vec<String>,
    /// Invite targets, all but the refused ones, as read under the lock.
    invitees: Vec<String>,
}

impl Plan {
    fn change(address: &str, transition: Transition) -> Self {
        Self {
            changes: vec![(address.to_string(), transition)],
            ..Self::default()
        }
    }

    fn skip(address: &str) -> Self {
        Self {
            skipped: vec![address.to_string()],
            ..Self::default()
        }
    }
}

fn random_alias() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ALIAS_LENGTH)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use super::*;
    use crate::{DirectoryFuture, Member, MemoryDirectory, NotifyError, NotifyFuture};

    const ALICE: &str = "alice@arpa2.org";
    const BOB: &str = "bob@arpa2.org";

    /// Notifier remembering every invitation, optionally failing them.
    #[derive(Default)]
    struct RecordingNotifier {
        sent: StdMutex<Vec<(String, Option<String>)>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn sent(&self) -> Vec<(String, Option<String>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn send_invitation<'a>(
            &'a self,
            target: &'a str,
            _group: &'a GroupKey,
            activation_code: Option<&'a str>,
        ) -> NotifyFuture<'a> {
            Box::pin(async move {
                if self.fail {
                    return Err(NotifyError::Delivery("relay down".to_string()));
                }
                self.sent
                    .lock()
                    .unwrap()
                    .push((target.to_string(), activation_code.map(str::to_string)));
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Directory whose state reads start failing after a number of calls.
    struct FlakyDirectory {
        inner: MemoryDirectory,
        reads_left: AtomicUsize,
    }

    impl FlakyDirectory {
        fn new(inner: MemoryDirectory, reads: usize) -> Self {
            Self {
                inner,
                reads_left: AtomicUsize::new(reads),
            }
        }
    }

    impl Directory for FlakyDirectory {
        fn get_state<'a>(
            &'a self,
            group: &'a GroupKey,
            address: &'a str,
        ) -> DirectoryFuture<'a, MembershipState> {
            let allowed = self
                .reads_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if !allowed {
                return Box::pin(async { Err(DirectoryError::Storage("offline".to_string())) });
            }
            self.inner.get_state(group, address)
        }

        fn alias_owner<'a>(
            &'a self,
            group: &'a GroupKey,
            alias: &'a str,
        ) -> DirectoryFuture<'a, Option<String>> {
            self.inner.alias_owner(group, alias)
        }

        fn members<'a>(&'a self, group: &'a GroupKey) -> DirectoryFuture<'a, Vec<Member>> {
            self.inner.members(group)
        }

        fn apply<'a>(
            &'a self,
            group: &'a GroupKey,
            address: &'a str,
            transition: Transition,
        ) -> DirectoryFuture<'a, ()> {
            self.inner.apply(group, address, transition)
        }

        fn apply_batch<'a>(
            &'a self,
            group: &'a GroupKey,
            changes: Vec<(String, Transition)>,
        ) -> DirectoryFuture<'a, ()> {
            self.inner.apply_batch(group, changes)
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn sender(address: &str) -> SenderIdentity {
        SenderIdentity {
            address: address.to_string(),
            domain: "arpa2.org".to_string(),
        }
    }

    fn command(verb: Verb, member: Option<&str>) -> Command {
        Command {
            verb,
            group: "news".to_string(),
            member: member.map(str::to_string),
            domain: "arpa2.org".to_string(),
        }
    }

    fn group() -> GroupKey {
        GroupKey::new("arpa2.org", "news")
    }

    fn setup(policy: DispatchPolicy) -> (Dispatcher, Arc<MemoryDirectory>, Arc<RecordingNotifier>) {
        let directory = Arc::new(MemoryDirectory::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(directory.clone(), notifier.clone(), policy);
        (dispatcher, directory, notifier)
    }

    async fn state(directory: &MemoryDirectory, address: &str) -> MembershipState {
        directory.get_state(&group(), address).await.unwrap()
    }

    #[test]
    fn test_policy_is_operator() {
        let policy = DispatchPolicy::default();
        assert!(policy.is_operator(ALICE));

        let policy = DispatchPolicy {
            operators: vec!["Admin@arpa2.org".to_string(), "@staff.arpa2.org".to_string()],
            activation_code: false,
        };
        assert!(policy.is_operator("admin@arpa2.org"));
        assert!(policy.is_operator("carol@staff.arpa2.org"));
        assert!(!policy.is_operator(ALICE));
    }

    #[test]
    fn test_random_alias() {
        let alias = random_alias();
        assert_eq!(alias.len(), ALIAS_LENGTH);
        assert!(alias
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());

        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("alice")), b"")
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 1);

        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("alice")), b"")
            .await
            .unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, vec![ALICE.to_string()]);

        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, None), b"")
            .await
            .unwrap();
        assert!(report.applied.is_empty());

        assert_eq!(
            state(&directory, ALICE).await,
            MembershipState::Subscribed("alice".to_string())
        );
        assert_eq!(directory.members(&group()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_generates_alias() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, None), b"")
            .await
            .unwrap();
        match state(&directory, ALICE).await {
            MembershipState::Subscribed(alias) => assert_eq!(alias.len(), ALIAS_LENGTH),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_renames_alias() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("a1")), b"")
            .await
            .unwrap();
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("a2")), b"")
            .await
            .unwrap();
        assert_eq!(
            state(&directory, ALICE).await,
            MembershipState::Subscribed("a2".to_string())
        );
        assert_eq!(directory.alias_owner(&group(), "a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_alias_taken() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("news")), b"")
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(&sender(BOB), &command(Verb::Subscribe, Some("news")), b"")
            .await;
        assert_eq!(
            result,
            Err(DispatchError::AliasTaken("news+news@arpa2.org".to_string()))
        );
        assert_eq!(state(&directory, BOB).await, MembershipState::None);
    }

    #[tokio::test]
    async fn test_decline_then_subscribe_clears_decline() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Decline, None), b"")
            .await
            .unwrap();
        assert_eq!(state(&directory, ALICE).await, MembershipState::Declined);

        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("alice")), b"")
            .await
            .unwrap();
        assert_eq!(
            state(&directory, ALICE).await,
            MembershipState::Subscribed("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_decline_leaves_subscription() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("alice")), b"")
            .await
            .unwrap();
        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Decline, None), b"")
            .await
            .unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(
            state(&directory, ALICE).await,
            MembershipState::Subscribed("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_rules() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());

        let result = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Unsubscribe, None), b"")
            .await;
        assert!(matches!(result, Err(DispatchError::NotSubscribed { .. })));

        // explicit member on an empty state is a no-op
        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Unsubscribe, Some("x")), b"")
            .await
            .unwrap();
        assert!(report.applied.is_empty());

        dispatcher
            .dispatch(&sender(BOB), &command(Verb::Subscribe, Some("bob")), b"")
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Unsubscribe, Some("bob")), b"")
            .await;
        assert_eq!(
            result,
            Err(DispatchError::NotOwner("news+bob@arpa2.org".to_string()))
        );

        dispatcher
            .dispatch(&sender(BOB), &command(Verb::Unsubscribe, Some("bob")), b"")
            .await
            .unwrap();
        assert_eq!(state(&directory, BOB).await, MembershipState::None);
        assert!(directory.members(&group()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_decline() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Decline, None), b"")
            .await
            .unwrap();
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Unsubscribe, None), b"")
            .await
            .unwrap();
        assert_eq!(state(&directory, ALICE).await, MembershipState::None);
    }

    #[tokio::test]
    async fn test_refuse_welcome_subscribe() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("alice")), b"")
            .await
            .unwrap();

        let body = format!("{ALICE}\r\n");
        dispatcher
            .dispatch(&sender(BOB), &command(Verb::Refuse, None), body.as_bytes())
            .await
            .unwrap();
        assert_eq!(state(&directory, ALICE).await, MembershipState::Refused);
        assert!(directory.members(&group()).await.unwrap().is_empty());

        let result = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, None), b"")
            .await;
        assert!(matches!(result, Err(DispatchError::Refused { .. })));

        dispatcher
            .dispatch(&sender(BOB), &command(Verb::Welcome, None), body.as_bytes())
            .await
            .unwrap();
        assert_eq!(state(&directory, ALICE).await, MembershipState::None);

        dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Subscribe, Some("alice")), b"")
            .await
            .unwrap();
        assert_eq!(
            state(&directory, ALICE).await,
            MembershipState::Subscribed("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_invite_skips_refused_and_clears_decline() {
        let (dispatcher, directory, notifier) = setup(DispatchPolicy {
            operators: Vec::new(),
            activation_code: true,
        });
        dispatcher
            .dispatch(&sender(BOB), &command(Verb::Decline, None), b"")
            .await
            .unwrap();
        dispatcher
            .dispatch(
                &sender(ALICE),
                &command(Verb::Refuse, None),
                b"carol@arpa2.org\r\n",
            )
            .await
            .unwrap();

        let body = b"Bob <bob@arpa2.org>, carol@arpa2.org\r\ndave@arpa2.org\r\n";
        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Invite, None), body)
            .await
            .unwrap();

        assert_eq!(
            report.invited,
            vec![BOB.to_string(), "dave@arpa2.org".to_string()]
        );
        assert_eq!(state(&directory, BOB).await, MembershipState::None);
        assert_eq!(
            state(&directory, "carol@arpa2.org").await,
            MembershipState::Refused
        );

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, code)| code.is_some()));
    }

    #[tokio::test]
    async fn test_invite_notifier_failure_keeps_changes() {
        let directory = Arc::new(MemoryDirectory::new());
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(directory.clone(), notifier, DispatchPolicy::default());
        dispatcher
            .dispatch(&sender(BOB), &command(Verb::Decline, None), b"")
            .await
            .unwrap();

        let report = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Invite, None), b"bob@arpa2.org\r\n")
            .await
            .unwrap();
        assert!(report.invited.is_empty());
        assert_eq!(report.notify_failures, vec![BOB.to_string()]);
        assert_eq!(state(&directory, BOB).await, MembershipState::None);
    }

    #[tokio::test]
    async fn test_invite_reads_states_once() {
        let inner = MemoryDirectory::new();
        inner
            .apply(&group(), BOB, Transition::Decline)
            .await
            .unwrap();
        // one read per target, any further read fails
        let directory = Arc::new(FlakyDirectory::new(inner, 2));
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(directory.clone(), notifier.clone(), DispatchPolicy::default());

        let report = dispatcher
            .dispatch(
                &sender(ALICE),
                &command(Verb::Invite, None),
                b"bob@arpa2.org, dave@arpa2.org\r\n",
            )
            .await
            .unwrap();
        assert_eq!(report.applied, vec![(BOB.to_string(), Transition::ClearDecline)]);
        assert_eq!(
            report.invited,
            vec![BOB.to_string(), "dave@arpa2.org".to_string()]
        );
        assert_eq!(notifier.sent().len(), 2);
        assert_eq!(state(&directory.inner, BOB).await, MembershipState::None);
    }

    #[tokio::test]
    async fn test_body_commands_require_operator() {
        let (dispatcher, directory, _) = setup(DispatchPolicy {
            operators: vec!["admin@arpa2.org".to_string()],
            activation_code: false,
        });
        let result = dispatcher
            .dispatch(&sender(ALICE), &command(Verb::Refuse, None), b"bob@arpa2.org\r\n")
            .await;
        assert_eq!(
            result,
            Err(DispatchError::NotAuthorized(ALICE.to_string()))
        );
        assert_eq!(state(&directory, BOB).await, MembershipState::None);

        dispatcher
            .dispatch(
                &sender("admin@arpa2.org"),
                &command(Verb::Refuse, None),
                b"bob@arpa2.org\r\n",
            )
            .await
            .unwrap();
        assert_eq!(state(&directory, BOB).await, MembershipState::Refused);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_unsubscribe() {
        let (dispatcher, directory, _) = setup(DispatchPolicy::default());
        let dispatcher = Arc::new(dispatcher);

        let mut handles = Vec::new();
        for i in 0..32 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let verb = if i % 2 == 0 {
                    Verb::Subscribe
                } else {
                    Verb::Unsubscribe
                };
                dispatcher
                    .dispatch(&sender(ALICE), &command(verb, Some("alice")), b"")
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // whatever the interleaving, the state is one of the two valid ones
        let members = directory.members(&group()).await.unwrap();
        match state(&directory, ALICE).await {
            MembershipState::Subscribed(alias) => {
                assert_eq!(alias, "alice");
                assert_eq!(members.len(), 1);
            }
            MembershipState::None => assert!(members.is_empty()),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(dispatcher.locks.len(), 0);
    }
}
