use futures::stream::StreamExt;
use kube::{
    Api, Resource, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use vmop_types::*;

use super::assign;
use crate::util::{
    Error, SWEEP_INTERVAL,
    colors::{FG1, FG2},
};
use crate::vms::channels::ChannelRegistry;

/// The `VmPool` controller. Keeps the registry's pool view current and
/// sweeps expired assignments every 30 seconds. Leadership gating happens
/// in the caller; this future runs only on the leader.
pub async fn run(client: Client, channels: Arc<ChannelRegistry>) {
    println!("{}", "🚀 VmPool controller started.".green());
    let context = Arc::new(ContextData { client: client.clone(), channels });
    let api: Api<VmPool> = Api::all(client);
    Controller::new(api, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

struct ContextData {
    client: Client,
    channels: Arc<ChannelRegistry>,
}

/// Reconciliation function for the `VmPool` resource. Doubles as the
/// periodic retention sweep through its fixed requeue interval.
async fn reconcile(instance: Arc<VmPool>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected VmPool resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    if instance.metadata.deletion_timestamp.is_some() {
        context.channels.remove_pool(&namespace, &name).await;
        return Ok(Action::requeue(Duration::from_millis(500)));
    }

    context
        .channels
        .put_pool(&namespace, &name, (*instance).clone())
        .await;

    let retention: Retention = instance.spec.retention.parse()?;

    let api: Api<VirtualMachine> = Api::namespaced(client.clone(), &namespace);
    let all_vms = api.list(&Default::default()).await?.items;

    // Backstop for missed DELETE events: drop channels whose VM is gone.
    for channel in context.channels.values().await {
        let definition = &channel.definition;
        if definition.meta().namespace.as_deref() != Some(namespace.as_str()) {
            continue;
        }
        let vm_name = definition.name_any();
        if !all_vms.iter().any(|vm| vm.name_any() == vm_name) {
            context.channels.remove(&namespace, &vm_name).await;
        }
    }

    let members: Vec<VirtualMachine> = all_vms
        .into_iter()
        .filter(|vm| vm.spec.pools.iter().any(|p| p == &name))
        .collect();

    let released = assign::sweep_stale(client, &members, &name, &retention).await?;
    for vm_name in released {
        println!(
            "♻️ {}{}{}",
            name.color(FG2),
            " released expired assignment of ".color(FG1),
            vm_name.color(FG2),
        );
    }

    Ok(Action::requeue(SWEEP_INTERVAL))
}

fn on_error(instance: Arc<VmPool>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Pool reconciliation error: {:?} {:?}",
            error,
            instance.meta().name
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
