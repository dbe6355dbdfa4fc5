use super::{assign::PoolLocks, connection::connection_file};
use crate::util::Error;
use crate::vms::{channels::ChannelRegistry, objects};
use chrono::{Duration, Utc};
use hyper::{
    Body, Method, Request, Response, Server, StatusCode,
    service::{make_service_fn, service_fn},
};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use owo_colors::OwoColorize;
use rand::{Rng, distr::Alphanumeric};
use std::{convert::Infallible, sync::Arc};
use vmop_common::annotations;
use vmop_types::{
    VirtualMachine,
    runner::{DISPLAY_PASSWORD_KEY, PASSWORD_EXPIRY_KEY},
};

/// How long a password handed out with an assignment stays valid.
const PASSWORD_VALIDITY_SECS: i64 = 120;

struct ApiState {
    client: Client,
    channels: Arc<ChannelRegistry>,
    locks: PoolLocks,
    namespace: String,
}

/// Serves `POST /assign?pool=…&user=…` when `ASSIGN_PORT` is set. The
/// web console is external; this endpoint is its only coupling to the
/// pool manager.
pub async fn maybe_serve(client: Client, channels: Arc<ChannelRegistry>) {
    let Some(port) = std::env::var("ASSIGN_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    let state = Arc::new(ApiState {
        client,
        channels,
        locks: PoolLocks::default(),
        namespace: vmop_common::namespace(),
    });
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, state).await) }
            }))
        }
    });
    let addr = ([0, 0, 0, 0], port).into();
    println!(
        "{}{}",
        "🎟️ Starting assignment listener • port=".green(),
        port.to_string().green().dimmed(),
    );
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .expect("Failed to serve assignments");
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_owned())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn handle(req: Request<Body>, state: Arc<ApiState>) -> Response<Body> {
    if req.method() != Method::POST || req.uri().path() != "/assign" {
        return json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": "not found"}),
        );
    }
    let query = req.uri().query();
    let (Some(pool), Some(user)) = (
        query_param(query, "pool"),
        query_param(query, "user"),
    ) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "pool and user are required"}),
        );
    };
    let namespace = query_param(query, "namespace").unwrap_or_else(|| state.namespace.clone());

    match super::assign(
        state.client.clone(),
        &state.channels,
        &state.locks,
        &namespace,
        &pool,
        &user,
    )
    .await
    {
        Ok(Some(vm)) => {
            let connection = match refresh_display_password(&state.client, &vm).await {
                Ok(connection) => connection,
                Err(e) => {
                    eprintln!("{}", format!("display password refresh failed: {}", e).red());
                    None
                }
            };
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "vm": vm.name_any(),
                    "namespace": namespace,
                    "connectionFile": connection,
                }),
            )
        }
        Ok(None) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({"error": "pool-empty"}),
        ),
        Err(Error::UserInput(message)) => {
            json_response(StatusCode::NOT_FOUND, serde_json::json!({"error": message}))
        }
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": e.to_string()}),
        ),
    }
}

/// Rotates the display password for an assignment and renders the
/// connection file. The runner picks the new password up from the
/// mounted secret and applies it over QMP.
async fn refresh_display_password(
    client: &Client,
    vm: &VirtualMachine,
) -> Result<Option<String>, Error> {
    let Some(spice) = vm.spec.vm.display.as_ref().and_then(|d| d.spice.as_ref()) else {
        return Ok(None);
    };
    let host = spice.server.clone().or_else(|| {
        vm.status
            .as_ref()
            .and_then(|s| s.node_addresses.first().cloned())
    });
    let Some(host) = host else {
        // Not schedulable into a connection file yet; the console can
        // retry once the runner has reported addresses.
        return Ok(None);
    };

    let password = if objects::wants_display_secret(vm) {
        let namespace = vm.namespace().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let password: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let expiry = (Utc::now() + Duration::seconds(PASSWORD_VALIDITY_SECS)).to_rfc3339();
        let patch = serde_json::json!({
            "metadata": {"annotations": {(annotations::PASSWORD_EXPIRY): &expiry}},
            "stringData": {
                (DISPLAY_PASSWORD_KEY): &password,
                (PASSWORD_EXPIRY_KEY): &expiry,
            },
        });
        api.patch(
            &objects::display_secret_name(&vm.name_any()),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Some(password)
    } else {
        None
    };

    Ok(Some(connection_file(
        &host,
        spice.port,
        password.as_deref(),
        spice.proxy_url.as_deref(),
    )))
}
