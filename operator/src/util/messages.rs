/// Reason put on the Running condition while the runner Pod is deleted
/// because the VM was stopped.
pub const STOPPED: &str = "Stopped";

/// Reason put on the Running condition while the runner Pod is coming up.
pub const STARTING: &str = "Starting";

/// Reason put on the ReconcileFailed condition for errors that will not
/// resolve without a spec change.
pub const TERMINAL: &str = "TerminalError";

/// Message recorded when `currentCpus` exceeds `maximumCpus`.
pub const CPUS_CLAMPED: &str = "currentCpus exceeds maximumCpus; clamped to maximum.";
