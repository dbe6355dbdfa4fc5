pub mod shutdown;

/// Group all operator-owned metadata keys live under.
pub const GROUP: &str = "vmoperator.jdrupes.org";

pub mod annotations {
    /// `resourceVersion` of the ConfigMap the Pod was created against.
    /// Drift forces a Pod replacement.
    pub const CONFIG_VERSION: &str = "vmoperator.jdrupes.org/config-version";

    /// Hash of the spec fields that cannot be applied to a live QEMU.
    pub const COLD_HASH: &str = "vmoperator.jdrupes.org/cold-hash";

    /// RFC 3339 instant after which the display password is invalid.
    pub const PASSWORD_EXPIRY: &str = "vmoperator.jdrupes.org/password-expiry";
}

pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
}

/// Process-wide setup shared by the binaries. Panics anywhere must take
/// the container down so Kubernetes restarts it.
pub fn init() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
}

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Namespace this process acts in: `POD_NAMESPACE`, else the service
/// account's namespace file, else `default`.
pub fn namespace() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        return ns;
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "default".to_owned())
}
