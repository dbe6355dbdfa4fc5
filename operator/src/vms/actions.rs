use super::objects;
use crate::util::{Error, MANAGER_NAME, messages, patch::*};
use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    Api, Client,
    api::{DeleteParams, Patch, PatchParams, PostParams, Resource},
};
use vmop_common::labels;
use vmop_types::*;

/// Result of bringing the auxiliary objects up to date; feeds the Pod
/// decision.
#[derive(Debug, Clone)]
pub struct AuxState {
    /// `resourceVersion` of the VM's ConfigMap after the apply.
    pub config_version: String,

    /// Hash over the spec fields that require a Pod replacement.
    pub cold_hash: String,
}

fn namespace(instance: &VirtualMachine) -> &str {
    instance.meta().namespace.as_deref().unwrap()
}

/// Server-side apply needs `apiVersion`/`kind` in the document; the
/// typed objects carry them in their `Resource` impl only.
fn apply_document<K>(object: &K) -> serde_json::Value
where
    K: k8s_openapi::Resource + serde::Serialize,
{
    let mut value = serde_json::to_value(object).unwrap();
    value["apiVersion"] = serde_json::json!(K::API_VERSION);
    value["kind"] = serde_json::json!(K::KIND);
    value
}

fn name(instance: &VirtualMachine) -> &str {
    instance.meta().name.as_deref().unwrap()
}

/// Applies PVCs, ConfigMap, display Secret and Service, in that order.
/// All steps are idempotent; PVCs and the display Secret are create-only.
/// With `spec_changed == false` the apply is skipped and only the current
/// ConfigMap version is captured, so status-only events stay cheap.
pub async fn ensure_auxiliary(
    client: Client,
    instance: &VirtualMachine,
    spec_changed: bool,
) -> Result<AuxState, Error> {
    let cold_hash = objects::cold_hash(instance);
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace(instance));

    if !spec_changed {
        // The ConfigMap may still be missing, e.g. after a manual delete.
        if let Some(existing) = get_opt(&config_maps, name(instance)).await? {
            return Ok(AuxState {
                config_version: existing.metadata.resource_version.unwrap_or_default(),
                cold_hash,
            });
        }
    }

    ensure_pvcs(client.clone(), instance).await?;

    let params = PatchParams::apply(MANAGER_NAME).force();
    let config_map = objects::config_map(instance)?;
    let applied = config_maps
        .patch(
            name(instance),
            &params,
            &Patch::Apply(apply_document(&config_map)),
        )
        .await?;

    ensure_display_secret(client.clone(), instance).await?;
    reconcile_service(client, instance).await?;

    Ok(AuxState {
        config_version: applied.metadata.resource_version.unwrap_or_default(),
        cold_hash,
    })
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Creates missing PVCs. Existing claims are never touched or deleted;
/// storage outlives both Pod and VM resource.
async fn ensure_pvcs(client: Client, instance: &VirtualMachine) -> Result<(), Error> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client, namespace(instance));
    for (index, disk) in instance.spec.vm.disks.iter().enumerate() {
        let Some(pvc) = objects::pvc(instance, disk, index) else {
            continue;
        };
        let pvc_name = pvc.metadata.name.clone().unwrap();
        if get_opt(&api, &pvc_name).await?.is_none() {
            api.create(&PostParams::default(), &pvc).await?;
        }
    }
    Ok(())
}

/// Creates the display secret with a random, already-expired password.
/// An existing secret is left alone: users own its content after that.
async fn ensure_display_secret(client: Client, instance: &VirtualMachine) -> Result<(), Error> {
    if !objects::wants_display_secret(instance) {
        return Ok(());
    }
    let api: Api<Secret> = Api::namespaced(client, namespace(instance));
    let secret_name = objects::display_secret_name(name(instance));
    if get_opt(&api, &secret_name).await?.is_none() {
        api.create(&PostParams::default(), &objects::display_secret(instance))
            .await?;
    }
    Ok(())
}

/// Keeps the LoadBalancer Service in sync with the spec, deleting it when
/// the spec no longer asks for one.
async fn reconcile_service(client: Client, instance: &VirtualMachine) -> Result<(), Error> {
    let api: Api<Service> = Api::namespaced(client, namespace(instance));
    match objects::service(instance) {
        Some(service) => {
            let params = PatchParams::apply(MANAGER_NAME).force();
            api.patch(
                name(instance),
                &params,
                &Patch::Apply(apply_document(&service)),
            )
            .await?;
        }
        None => {
            if let Some(existing) = get_opt(&api, name(instance)).await? {
                let ours = existing
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|l| l.get(labels::MANAGED_BY).map(String::as_str) == Some("vm-operator"));
                if ours {
                    api.delete(name(instance), &DeleteParams::default()).await?;
                }
            }
        }
    }
    Ok(())
}

pub async fn create_pod(
    client: Client,
    instance: &VirtualMachine,
    aux: &AuxState,
) -> Result<(), Error> {
    let pod = objects::pod(instance, &aux.config_version, &aux.cold_hash);
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace(instance));
    api.create(&PostParams::default(), &pod).await?;
    starting(client, instance, name(instance)).await
}

/// Deletes the runner Pod. The grace period leaves room for the guest's
/// powerdown before the kubelet escalates to KILL.
pub async fn delete_pod(client: Client, instance: &VirtualMachine) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace(instance));
    let grace = instance.spec.vm.powerdown_timeout + 5;
    api.delete(
        name(instance),
        &DeleteParams::default().grace_period(grace as u32),
    )
    .await?;
    Ok(())
}

fn condition(instance: &VirtualMachine, type_: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_owned(),
        status: status.to_owned(),
        reason: reason.to_owned(),
        message: message.to_owned(),
        last_transition_time: Time(Utc::now()),
        observed_generation: instance.meta().generation,
    }
}

pub async fn starting(client: Client, instance: &VirtualMachine, pod_name: &str) -> Result<(), Error> {
    let cond = condition(
        instance,
        CONDITION_RUNNING,
        "False",
        messages::STARTING,
        &format!("The runner Pod '{}' is starting.", pod_name),
    );
    patch_status(client, instance, |status: &mut VmStatus| {
        set_condition(&mut status.conditions, cond);
    })
    .await?;
    Ok(())
}

/// Records that the VM is intentionally not running.
pub async fn stopped(client: Client, instance: &VirtualMachine) -> Result<(), Error> {
    let cond = condition(
        instance,
        CONDITION_RUNNING,
        "False",
        messages::STOPPED,
        "The VM is stopped.",
    );
    patch_status(client, instance, |status: &mut VmStatus| {
        set_condition(&mut status.conditions, cond);
        status.cpus = None;
        status.ram = None;
        status.console_user = None;
        status.console_client = None;
        status.node_addresses.clear();
        status.node_name = None;
    })
    .await?;
    Ok(())
}

/// The Pod is up; clear any stale failure and surface clamping of
/// `currentCpus`, which QEMU cannot honor beyond the configured maximum.
pub async fn active(client: Client, instance: &VirtualMachine) -> Result<(), Error> {
    let clamped = instance
        .spec
        .vm
        .current_cpus
        .is_some_and(|cpus| cpus > instance.spec.vm.maximum_cpus);
    let warning = clamped.then(|| {
        condition(
            instance,
            CONDITION_WARNING,
            "True",
            "CpusClamped",
            messages::CPUS_CLAMPED,
        )
    });
    patch_status(client, instance, |status: &mut VmStatus| {
        status
            .conditions
            .retain(|c| c.type_ != CONDITION_RECONCILE_FAILED);
        match warning {
            Some(cond) => set_condition(&mut status.conditions, cond),
            None => status.conditions.retain(|c| c.type_ != CONDITION_WARNING),
        }
    })
    .await?;
    Ok(())
}

/// Records a terminal reconcile failure; retried only on the next
/// observed change of the resource.
pub async fn reconcile_failed(
    client: Client,
    instance: &VirtualMachine,
    message: String,
) -> Result<(), Error> {
    let cond = condition(
        instance,
        CONDITION_RECONCILE_FAILED,
        "True",
        messages::TERMINAL,
        &message,
    );
    patch_status(client, instance, |status: &mut VmStatus| {
        set_condition(&mut status.conditions, cond);
    })
    .await?;
    Ok(())
}
