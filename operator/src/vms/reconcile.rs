use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::{
    Api, Resource, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use vmop_types::*;

use super::{
    actions::{self, AuxState},
    channels::ChannelRegistry,
};
use crate::util::{
    Error, PROBE_INTERVAL, messages,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `VirtualMachine` controller. Also hosts the pool
/// manager and the assignment listener, which share the channel registry.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "Starting VirtualMachine controller...".green());

    let channels: Arc<ChannelRegistry> = Arc::new(ChannelRegistry::default());

    // Preparation of resources used by the `kube_runtime::Controller`
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), channels.clone()));

    // Namespace where the Lease object lives.
    // Commonly: the controller's namespace. If you deploy in one namespace, hardcode it.
    // If you want it dynamic, inject POD_NAMESPACE via the Downward API.
    let lease_namespace = vmop_common::namespace();
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("vm-operator-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "vm-operator-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        vmop_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    vmop_common::signal_ready();
    println!("{}", "🌱 Starting VirtualMachine controller...".green());
    // We run indefinitely; only the leader runs the controllers.
    // On leadership loss, we abort the controllers and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controllers due to leader election error");
                }
                continue;
            }
        };
        if lease.acquired_lease {
            // We are leader; ensure the controllers are running
            if controller_task.is_none() {
                println!("acquired leadership; starting controllers");
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let channels_for_pools = channels.clone();
                let crd_api_for_controller: Api<VirtualMachine> =
                    Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 VirtualMachine controller started.".green());
                    let vm_controller = Controller::new(crd_api_for_controller, Default::default())
                        .owns(
                            Api::<Pod>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .owns(
                            Api::<ConfigMap>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .owns(
                            Api::<Secret>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .owns(
                            Api::<Service>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .owns(
                            Api::<PersistentVolumeClaim>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {});
                    let pool_controller = crate::pools::run(
                        client_for_controller.clone(),
                        channels_for_pools.clone(),
                    );
                    let assignment_api = crate::pools::api::maybe_serve(
                        client_for_controller,
                        channels_for_pools,
                    );
                    tokio::join!(vm_controller, pool_controller, assignment_api);
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure the controllers are stopped
            eprintln!("lost leadership; stopping controllers");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
pub(crate) struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with. Required for K8S resource management.
    client: Client,

    /// One channel per observed VM; also consulted by the pool manager.
    channels: Arc<ChannelRegistry>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    pub fn new(client: Client, channels: Arc<ChannelRegistry>) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                channels,
                metrics: ControllerMetrics::new("vms"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client, channels }
        }
    }
}

/// Action to be taken upon a `VirtualMachine` resource during reconciliation
#[derive(Debug, PartialEq)]
enum VmAction {
    /// Create the runner Pod (auxiliary objects are already in place).
    CreatePod,

    /// Replace the Pod because a cold spec field changed.
    RecreatePod {
        reason: String,
    },

    /// Delete the Pod because the VM was stopped.
    StopPod,

    /// The VM is intentionally not running.
    Stopped,

    Starting {
        pod_name: String,
    },

    /// Signals that the [`VirtualMachine`] is fully reconciled.
    Active {
        pod_name: String,
    },

    /// An error occurred during reconciliation.
    Error(String),

    /// The resource is in desired state and requires no actions to be taken.
    NoOp,

    Requeue(Duration),
}

impl VmAction {
    fn to_str(&self) -> &str {
        match self {
            VmAction::CreatePod => "CreatePod",
            VmAction::RecreatePod { .. } => "RecreatePod",
            VmAction::StopPod => "StopPod",
            VmAction::Stopped => "Stopped",
            VmAction::Starting { .. } => "Starting",
            VmAction::Active { .. } => "Active",
            VmAction::Error(_) => "Error",
            VmAction::NoOp => "NoOp",
            VmAction::Requeue(_) => "Requeue",
        }
    }
}

/// Reconciliation function for the `VirtualMachine` resource.
async fn reconcile(instance: Arc<VirtualMachine>, context: Arc<ContextData>) -> Result<Action, Error> {
    // The `Client` is shared -> a clone from the reference is obtained
    let client: Client = context.client.clone();

    // The resource of `VirtualMachine` kind is required to have a namespace set. However, it is
    // not guaranteed the resource will have a `namespace` set. Therefore, the `namespace` field
    // on object's metadata is optional and Rust forces the programmer to check for it's
    // existence first.
    let namespace: String = match instance.namespace() {
        None => {
            // If there is no namespace to deploy to defined, reconciliation ends with an error immediately.
            return Err(Error::UserInput(
                "Expected VirtualMachine resource to be namespaced. Can't deploy to an unknown namespace."
                    .to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };

    // Name of the VirtualMachine resource is used to name the subresources as well.
    let name = instance.name_any();

    // Increment total number of reconciles for the VirtualMachine resource.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    // The channel is destroyed on observed DELETE; nothing else to do here,
    // retained objects are owner-referenced and PVCs outlive the VM anyway.
    if instance.metadata.deletion_timestamp.is_some() {
        context.channels.remove(&namespace, &name).await;
        return Ok(Action::requeue(Duration::from_millis(500)));
    }

    // Memoised generation check: events without a spec change (status
    // refreshes) skip the auxiliary-object apply entirely.
    let spec_changed = context
        .channels
        .associate(&namespace, &name, instance.clone())
        .await;

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Auxiliary objects first: PVCs, ConfigMap, display Secret, Service.
    // Validation errors here are terminal until the next spec change.
    let aux = match actions::ensure_auxiliary(client.clone(), &instance, spec_changed).await {
        Ok(aux) => aux,
        Err(e) if !e.is_transient() => {
            eprintln!(
                "{}",
                format!("Terminal reconcile error for {}/{}: {}", namespace, name, e).red()
            );
            actions::reconcile_failed(client, &instance, e.to_string()).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    context
        .channels
        .mark_applied(&namespace, &name, instance.metadata.generation)
        .await;

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(client.clone(), &namespace, &instance, &aux).await?;

    if action != VmAction::NoOp {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            format!("{:?}", action).color(FG2),
        );
    }

    // Report the read phase performance.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    // Increment the counter for the action.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match action {
        // Don't measure performance for NoOp actions.
        VmAction::NoOp => None,
        // Start a performance timer for the write phase.
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    // Performs action as decided by the `determine_action` function.
    // This is the write phase of reconciliation.
    let result = match action {
        VmAction::Requeue(duration) => Action::requeue(duration),
        VmAction::CreatePod => {
            actions::create_pod(client, &instance, &aux).await?;

            Action::await_change()
        }
        VmAction::RecreatePod { reason } => {
            println!(
                "{}{}",
                "♻️ Replacing Pod • reason=".color(FG1),
                reason.color(FG2),
            );
            actions::delete_pod(client, &instance).await?;

            Action::await_change()
        }
        VmAction::StopPod => {
            actions::delete_pod(client, &instance).await?;

            Action::await_change()
        }
        VmAction::Stopped => {
            actions::stopped(client, &instance).await?;

            Action::requeue(PROBE_INTERVAL)
        }
        VmAction::Starting { pod_name } => {
            actions::starting(client, &instance, &pod_name).await?;

            Action::await_change()
        }
        VmAction::Active { pod_name: _ } => {
            actions::active(client, &instance).await?;

            // Resource is fully reconciled.
            Action::requeue(PROBE_INTERVAL)
        }
        VmAction::Error(message) => {
            actions::reconcile_failed(client, &instance, message).await?;

            Action::await_change()
        }
        // The resource is already in desired state, do nothing and re-check after 30 seconds
        VmAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Resources arrive into the reconciliation queue in a certain state. This function looks at
/// the state of the given `VirtualMachine` resource and decides which action needs to be
/// performed. The finite set of possible actions is represented by the `VmAction` enum.
async fn determine_action(
    client: Client,
    namespace: &str,
    instance: &VirtualMachine,
    aux: &AuxState,
) -> Result<VmAction, Error> {
    let pod = get_pod(
        client.clone(),
        namespace,
        instance.meta().name.as_ref().unwrap(),
    )
    .await?;

    let desired = instance.spec.vm.state;
    let Some(pod) = pod else {
        return Ok(match desired {
            VmState::Running => VmAction::CreatePod,
            VmState::Stopped => determine_stopped_action(instance),
        });
    };

    // Don't do anything while the pod is being deleted.
    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(VmAction::Requeue(Duration::from_millis(500)));
    }

    if desired == VmState::Stopped {
        return Ok(VmAction::StopPod);
    }

    // A changed cold field invalidates the running QEMU; replace the Pod.
    // Hot fields flow through the ConfigMap and never take this path.
    let pod_hash = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(vmop_common::annotations::COLD_HASH).cloned());
    if pod_hash.as_deref() != Some(&aux.cold_hash) {
        return Ok(VmAction::RecreatePod {
            reason: "cold spec fields changed".to_owned(),
        });
    }

    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") | Some("ContainerCreating") => {
            if running_reason(instance) == Some(messages::STARTING) {
                return Ok(VmAction::NoOp);
            }
            Ok(VmAction::Starting {
                pod_name: pod.meta().name.clone().unwrap(),
            })
        }
        Some("Running") => Ok(VmAction::Active {
            pod_name: pod.meta().name.clone().unwrap(),
        }),
        Some("Succeeded") | Some("Failed") => {
            // QEMU exited. Deleting the Pod lets the next reconcile bring
            // the VM back up (or settle, if the runner stopped the VM).
            Ok(VmAction::RecreatePod {
                reason: "runner exited".to_owned(),
            })
        }
        _ => Ok(VmAction::Error("Pod is in unknown state.".to_owned())),
    }
}

fn determine_stopped_action(instance: &VirtualMachine) -> VmAction {
    if running_reason(instance) == Some(messages::STOPPED) {
        VmAction::NoOp
    } else {
        VmAction::Stopped
    }
}

fn running_reason(instance: &VirtualMachine) -> Option<&str> {
    instance
        .status
        .as_ref()
        .and_then(|s| get_condition(&s.conditions, CONDITION_RUNNING))
        .map(|c| c.reason.as_str())
}

async fn get_pod(client: Client, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(pod) => Ok(Some(pod)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Prints out the error to `stderr` and requeues the resource for another reconciliation after
/// five seconds.
fn on_error(instance: Arc<VirtualMachine>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error: {:?} {:?}",
            error,
            instance.meta().name
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
