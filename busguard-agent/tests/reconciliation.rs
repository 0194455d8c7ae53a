//! Reconciliation tests: pending-change propagation, update ordering, sync
//! errors, and recovery after downtime.

mod common;

use std::sync::Arc;

use busguard_core::{ClaimState, Error, GroupInfo, Guid, IdentityInfo, PolicyGenerator};
use busguard_agent::SyncErrorKind;
use common::*;

#[tokio::test]
async fn policy_push_converges_remote() {
    let h = harness().await;
    let key = new_key();
    claim_app(&h, "bus.:3.1", key).await;
    let storage = Arc::clone(h.agent.storage());

    let g1 = GroupInfo::new(Guid::filled(0xab), "G1", "");
    let g2 = GroupInfo::new(Guid::filled(0xcd), "G2", "");
    storage.store_group(&g1).unwrap();
    storage.store_group(&g2).unwrap();

    let one_group = PolicyGenerator::default_policy(&[storage.get_group(&g1).unwrap()]).unwrap();
    assert_eq!(one_group.acls.len(), 1);
    storage.update_policy(&key, &one_group).unwrap();

    wait_for("first policy on remote", || {
        h.remote.state("bus.:3.1", |state| {
            state.policy.as_ref().map(|p| p.acls.len()) == Some(1)
        })
    })
    .await;
    wait_for("updates confirmed", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;
    assert_eq!(storage.get_policy(&key).unwrap().version, 1);

    let both_groups = PolicyGenerator::default_policy(&[
        storage.get_group(&g1).unwrap(),
        storage.get_group(&g2).unwrap(),
    ])
    .unwrap();
    assert_eq!(both_groups.acls.len(), 2);
    storage.update_policy(&key, &both_groups).unwrap();

    wait_for("second policy on remote", || {
        h.remote.state("bus.:3.1", |state| {
            state.policy.as_ref().map(|p| p.acls.len()) == Some(2)
        })
    })
    .await;
    // The stored version strictly increased and reached the remote.
    assert_eq!(storage.get_policy(&key).unwrap().version, 2);
    h.remote.state("bus.:3.1", |state| {
        assert_eq!(state.policy.as_ref().unwrap().version, 2);
    });

    h.agent.shutdown().await;
}

#[tokio::test]
async fn membership_install_and_remove_lifecycle() {
    let h = harness().await;
    let listener = RecordingListener::new();
    h.agent.register_application_listener(listener.clone());

    let key = new_key();
    claim_app(&h, "bus.:3.2", key).await;
    let storage = Arc::clone(h.agent.storage());

    let group = GroupInfo::new(Guid::filled(0x41), "Operators", "");
    storage.store_group(&group).unwrap();

    storage.install_membership(&key, &group).unwrap();
    assert!(storage.get_managed_application(&key).unwrap().updates_pending);

    wait_for("membership delivered", || {
        h.remote
            .state("bus.:3.2", |state| state.memberships.len() == 1)
    })
    .await;
    h.remote.state("bus.:3.2", |state| {
        assert_eq!(state.memberships[0].guild, group.guid);
        assert_eq!(state.memberships[0].subject_cn, key.aki());
    });
    wait_for("install confirmed", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;

    storage.remove_membership(&key, &group).unwrap();
    assert!(storage.get_managed_application(&key).unwrap().updates_pending);
    wait_for("removal confirmed", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;
    assert!(storage
        .membership_certificates(&storage.get_managed_application(&key).unwrap())
        .unwrap()
        .is_empty());

    // Listener-visible pending transitions: true, false, true, false.
    wait_for("listener transitions", || {
        listener.pending_flags_for(&key) == vec![true, false, true, false]
    })
    .await;

    h.agent.shutdown().await;
}

#[tokio::test]
async fn reinstalled_membership_is_a_duplicate_not_an_error() {
    let h = harness().await;
    let key = new_key();
    claim_app(&h, "bus.:3.3", key).await;
    let storage = Arc::clone(h.agent.storage());

    let group = GroupInfo::new(Guid::filled(0x42), "Ops", "");
    storage.store_group(&group).unwrap();
    storage.install_membership(&key, &group).unwrap();
    wait_for("membership delivered", || {
        h.remote
            .state("bus.:3.3", |state| state.memberships.len() == 1)
    })
    .await;

    // A fresh sync reinstalls the same certificate; the remote reports it as
    // a duplicate and reconciliation still completes.
    h.agent.sync_with_applications(None);
    wait_for("sync confirmed", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;
    h.remote
        .state("bus.:3.3", |state| assert_eq!(state.memberships.len(), 1));

    h.agent.shutdown().await;
}

#[tokio::test]
async fn pending_update_survives_downtime_and_reconnect() {
    let h = harness().await;
    let key = new_key();
    claim_app(&h, "bus.:3.4", key).await;
    let storage = Arc::clone(h.agent.storage());

    // The remote goes offline before the policy change lands.
    h.monitor.lose("bus.:3.4");
    wait_for("registry marks offline", || {
        !h.agent.get_application(&key).unwrap().is_online()
    })
    .await;

    let group = GroupInfo::new(Guid::filled(0x43), "G", "");
    storage.store_group(&group).unwrap();
    let policy = PolicyGenerator::default_policy(&[storage.get_group(&group).unwrap()]).unwrap();
    storage.update_policy(&key, &policy).unwrap();

    // Nothing can be pushed while offline; the flag stays up.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(storage.get_managed_application(&key).unwrap().updates_pending);
    h.remote
        .state("bus.:3.4", |state| assert!(state.policy.is_none()));

    // Reconnection picks the pending policy back up.
    h.monitor.announce("bus.:3.4", key, ClaimState::Claimed);
    wait_for("policy pushed after reconnect", || {
        h.remote.state("bus.:3.4", |state| state.policy.is_some())
    })
    .await;
    wait_for("pending falls after confirmation", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;

    h.agent.shutdown().await;
}

#[tokio::test]
async fn sync_errors_are_reported_and_retried_on_next_event() {
    let h = harness().await;
    let listener = RecordingListener::new();
    h.agent.register_application_listener(listener.clone());

    let key = new_key();
    claim_app(&h, "bus.:3.5", key).await;
    let storage = Arc::clone(h.agent.storage());

    let group = GroupInfo::new(Guid::filled(0x44), "G", "");
    storage.store_group(&group).unwrap();
    let policy = PolicyGenerator::default_policy(&[storage.get_group(&group).unwrap()]).unwrap();

    // The remote looks online but every call fails.
    h.remote.set_offline(true);
    storage.update_policy(&key, &policy).unwrap();

    wait_for("sync error delivered", || {
        !listener.sync_errors.lock().is_empty()
    })
    .await;
    let error = listener.sync_errors.lock()[0].clone();
    assert_eq!(error.kind, SyncErrorKind::Policy);
    assert!(matches!(error.error, Error::RemoteUnreachable(_)));
    assert!(storage.get_managed_application(&key).unwrap().updates_pending);

    // No automatic retry: recovery requires the next event.
    h.remote.set_offline(false);
    h.agent.sync_with_applications(None);
    wait_for("policy pushed after recovery", || {
        h.remote.state("bus.:3.5", |state| state.policy.is_some())
    })
    .await;
    wait_for("pending cleared", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;

    h.agent.shutdown().await;
}

#[tokio::test]
async fn removed_application_is_reset_on_sight() {
    let h = harness().await;
    let key = new_key();
    claim_app(&h, "bus.:3.6", key).await;
    let storage = Arc::clone(h.agent.storage());

    wait_for("initial sync settles", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;

    storage.remove_application(&key).unwrap();
    wait_for("remote reset", || {
        h.remote
            .state("bus.:3.6", |state| state.reset_count == 1 && !state.claimed)
    })
    .await;

    h.agent.shutdown().await;
}

#[tokio::test]
async fn identity_update_reaches_remote() {
    let h = harness().await;
    let key = new_key();
    claim_app(&h, "bus.:3.7", key).await;
    let storage = Arc::clone(h.agent.storage());

    let original_serial =
        h.remote.state("bus.:3.7", |state| state.identity[0].serial.clone());

    let renamed = IdentityInfo::new(Guid::random(), "Renamed");
    storage.update_identity(&key, &renamed).unwrap();

    wait_for("identity refreshed on remote", || {
        h.remote.state("bus.:3.7", |state| {
            state.identity[0].serial != original_serial
        })
    })
    .await;
    h.remote.state("bus.:3.7", |state| {
        assert_eq!(state.identity[0].subject_ou, "Renamed");
    });
    wait_for("pending cleared", || {
        !storage.get_managed_application(&key).unwrap().updates_pending
    })
    .await;

    h.agent.shutdown().await;
}

#[tokio::test]
async fn claimable_announcements_are_not_reconciled() {
    let h = harness().await;
    let key = new_key();
    h.monitor.announce("bus.:3.8", key, ClaimState::Claimable);

    // Give the worker a moment; an unmanaged claimable app must not be
    // touched, let alone reset.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.remote.state("bus.:3.8", |state| {
        assert_eq!(state.reset_count, 0);
        assert!(!state.claimed);
    });

    h.agent.shutdown().await;
}

#[tokio::test]
async fn self_announcements_are_ignored() {
    let h = harness().await;
    let key = h.local_bus.public_key().unwrap();
    h.monitor.announce("bus.agent", key, ClaimState::Claimed);

    assert!(matches!(
        h.agent.get_application(&key),
        Err(Error::EndOfData)
    ));
    // In particular, the reconciler never sees the event; the agent must not
    // reset its own unmanaged attachment.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.remote
        .state("bus.agent", |state| assert_eq!(state.reset_count, 0));

    h.agent.shutdown().await;
}

#[tokio::test]
async fn unregistered_listener_stops_receiving_events() {
    let h = harness().await;
    let listener = RecordingListener::new();
    let dyn_listener =
        std::sync::Arc::clone(&listener) as std::sync::Arc<dyn busguard_agent::ApplicationListener>;
    h.agent.register_application_listener(dyn_listener.clone());

    h.monitor
        .announce("bus.:5.1", new_key(), ClaimState::Claimable);
    wait_for("first event delivered", || {
        !listener.transitions.lock().is_empty()
    })
    .await;

    h.agent.unregister_application_listener(&dyn_listener);
    let seen = listener.transitions.lock().len();
    h.monitor
        .announce("bus.:5.2", new_key(), ClaimState::Claimable);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(listener.transitions.lock().len(), seen);

    h.agent.shutdown().await;
}

#[tokio::test]
async fn sync_with_explicit_selection_only_touches_named_apps() {
    let h = harness().await;
    let (key_a, key_b) = (new_key(), new_key());
    claim_app(&h, "bus.:4.1", key_a).await;
    claim_app(&h, "bus.:4.2", key_b).await;
    let storage = Arc::clone(h.agent.storage());

    wait_for("both settled", || {
        !storage.get_managed_application(&key_a).unwrap().updates_pending
            && !storage.get_managed_application(&key_b).unwrap().updates_pending
    })
    .await;

    // Make both pending while nothing is listening for changes: take the
    // remote offline so the automatic push fails quietly.
    h.remote.set_offline(true);
    let group = GroupInfo::new(Guid::filled(0x45), "G", "");
    storage.store_group(&group).unwrap();
    let policy = PolicyGenerator::default_policy(&[storage.get_group(&group).unwrap()]).unwrap();
    storage.update_policy(&key_a, &policy).unwrap();
    storage.update_policy(&key_b, &policy).unwrap();
    h.remote.set_offline(false);

    let app_a = h.agent.get_application(&key_a).unwrap();
    h.agent.sync_with_applications(Some(std::slice::from_ref(&app_a)));

    wait_for("a converged", || {
        h.remote.state("bus.:4.1", |state| state.policy.is_some())
    })
    .await;
    h.remote
        .state("bus.:4.2", |state| assert!(state.policy.is_none()));
    assert!(storage.get_managed_application(&key_b).unwrap().updates_pending);

    // A full sync catches the rest.
    h.agent.sync_with_applications(None);
    wait_for("b converged", || {
        h.remote.state("bus.:4.2", |state| state.policy.is_some())
    })
    .await;

    h.agent.shutdown().await;
}
