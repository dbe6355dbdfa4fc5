use crate::util::metrics::REGISTRY;
use hyper::{
    Body, Request, Response, Server,
    service::{make_service_fn, service_fn},
};
use owo_colors::OwoColorize;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;

async fn serve(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();
            encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();
            Response::builder()
                .header("Content-Type", encoder.format_type())
                .body(Body::from(buffer))
                .unwrap()
        }
        "/healthz" | "/readyz" => Response::new(Body::from("ok")),
        _ => Response::builder()
            .status(404)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(response)
}

/// Runs the Prometheus scrape endpoint. Panics on bind failure; the
/// process-wide panic hook turns that into a container restart.
pub async fn run_server(port: u16) {
    let addr = ([0, 0, 0, 0], port).into();
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(serve)) });
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        port.to_string().green().dimmed(),
    );
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .expect("Failed to serve metrics");
}
