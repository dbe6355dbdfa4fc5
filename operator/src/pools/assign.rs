use crate::util::{Error, patch::patch_status};
use crate::vms::channels::ChannelRegistry;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use vmop_types::*;

/// One mutex per pool name; serialises the enumerate-select-patch window
/// so two concurrent requests can never pick the same free VM.
#[derive(Default)]
pub struct PoolLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PoolLocks {
    pub async fn lock(&self, pool: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.entry(pool.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

/// Whether the VM's assignment currently reserves it, per the pool's
/// retention policy.
fn assignment_live(assignment: &Assignment, retention: &Retention, now: DateTime<Utc>) -> bool {
    if assignment.user.is_empty() {
        return false;
    }
    retention.is_live(assignment.last_used.0, now)
}

/// The selection rule: prefer the VM already assigned to the user, then
/// the free VM idle the longest, names breaking ties.
fn select_candidate<'a>(
    members: &'a [VirtualMachine],
    pool_name: &str,
    user: &str,
    retention: &Retention,
    now: DateTime<Utc>,
) -> Option<&'a VirtualMachine> {
    let assignment = |vm: &'a VirtualMachine| vm.status.as_ref().and_then(|s| s.assignment.as_ref());

    if let Some(own) = members.iter().find(|vm| {
        assignment(vm).is_some_and(|a| {
            a.pool == pool_name && a.user == user && assignment_live(a, retention, now)
        })
    }) {
        return Some(own);
    }

    members
        .iter()
        .filter(|vm| !assignment(vm).is_some_and(|a| assignment_live(a, retention, now)))
        .min_by_key(|vm| {
            let last_used = assignment(vm)
                .map(|a| a.last_used.0)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            (last_used, vm.name_any())
        })
}

/// Assigns a VM from `pool_name` to `user`. Returns `Ok(None)` when the
/// pool has no free member. The returned VM has its assignment recorded
/// in status; a Stopped VM is started as a side effect.
pub async fn assign(
    client: Client,
    channels: &ChannelRegistry,
    locks: &PoolLocks,
    namespace: &str,
    pool_name: &str,
    user: &str,
) -> Result<Option<VirtualMachine>, Error> {
    let pool = match channels.get_pool(namespace, pool_name).await {
        Some(pool) => pool,
        None => {
            let api: Api<VmPool> = Api::namespaced(client.clone(), namespace);
            match api.get(pool_name).await {
                Ok(pool) => pool,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Err(Error::UserInput(format!("unknown pool '{}'", pool_name)));
                }
                Err(e) => return Err(e.into()),
            }
        }
    };
    let retention: Retention = pool.spec.retention.parse()?;

    let _guard = locks.lock(pool_name).await;

    // Re-read the members under the lock; statuses written by a previous
    // assignment must be visible to this one.
    let api: Api<VirtualMachine> = Api::namespaced(client.clone(), namespace);
    let members: Vec<VirtualMachine> = api
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .filter(|vm| vm.spec.pools.iter().any(|p| p == pool_name))
        .collect();

    let now = Utc::now();
    let Some(selected) = select_candidate(&members, pool_name, user, &retention, now) else {
        return Ok(None);
    };

    let assignment = Assignment {
        pool: pool_name.to_owned(),
        user: user.to_owned(),
        last_used: Time(now),
    };
    let updated = patch_status(client.clone(), selected, |status: &mut VmStatus| {
        status.assignment = Some(assignment);
    })
    .await?;

    if updated.spec.vm.state == VmState::Stopped {
        let patch = serde_json::json!({"spec": {"vm": {"state": "Running"}}});
        api.patch(
            &updated.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    }

    Ok(Some(updated))
}

/// Clears assignments whose retention has lapsed. Called by the pool
/// sweep; returns the names of the VMs that were released.
pub async fn sweep_stale(
    client: Client,
    members: &[VirtualMachine],
    pool_name: &str,
    retention: &Retention,
) -> Result<Vec<String>, Error> {
    let now = Utc::now();
    let mut released = Vec::new();
    for vm in members {
        let Some(assignment) = vm.status.as_ref().and_then(|s| s.assignment.as_ref()) else {
            continue;
        };
        if assignment.pool != pool_name || assignment_live(assignment, retention, now) {
            continue;
        }
        patch_status(client.clone(), vm, |status: &mut VmStatus| {
            status.assignment = None;
        })
        .await?;
        released.push(vm.name_any());
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kube::api::ObjectMeta;

    fn member(name: &str, assignment: Option<Assignment>) -> VirtualMachine {
        VirtualMachine {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            spec: VmSpec {
                pools: vec!["test-vms".to_owned()],
                ..Default::default()
            },
            status: assignment.map(|assignment| VmStatus {
                assignment: Some(assignment),
                ..Default::default()
            }),
        }
    }

    fn assigned(user: &str, idle: Duration) -> Assignment {
        Assignment {
            pool: "test-vms".to_owned(),
            user: user.to_owned(),
            last_used: Time(Utc::now() - idle),
        }
    }

    fn hour() -> Retention {
        "PT1H".parse().unwrap()
    }

    #[test]
    fn same_user_gets_the_same_vm() {
        let members = vec![
            member("vm-a", Some(assigned("alice", Duration::minutes(5)))),
            member("vm-b", None),
        ];
        let selected =
            select_candidate(&members, "test-vms", "alice", &hour(), Utc::now()).unwrap();
        assert_eq!(selected.name_any(), "vm-a");
    }

    #[test]
    fn different_user_never_gets_a_live_assignment() {
        let members = vec![
            member("vm-a", Some(assigned("alice", Duration::minutes(5)))),
            member("vm-b", None),
        ];
        let selected = select_candidate(&members, "test-vms", "bob", &hour(), Utc::now()).unwrap();
        assert_eq!(selected.name_any(), "vm-b");
    }

    #[test]
    fn expired_assignments_are_free() {
        let members = vec![member("vm-a", Some(assigned("alice", Duration::hours(2))))];
        let selected = select_candidate(&members, "test-vms", "bob", &hour(), Utc::now()).unwrap();
        assert_eq!(selected.name_any(), "vm-a");
    }

    #[test]
    fn longest_idle_wins_then_name() {
        let members = vec![
            member("vm-c", None),
            member("vm-b", Some(assigned("old", Duration::hours(3)))),
            member("vm-a", None),
        ];
        // Never-assigned members sort before any stale assignment.
        let selected = select_candidate(&members, "test-vms", "carol", &hour(), Utc::now()).unwrap();
        assert_eq!(selected.name_any(), "vm-a");
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let members = vec![member("vm-a", Some(assigned("alice", Duration::minutes(1))))];
        assert!(select_candidate(&members, "test-vms", "bob", &hour(), Utc::now()).is_none());
        assert!(select_candidate(&[], "test-vms", "bob", &hour(), Utc::now()).is_none());
    }
}
