//! The key layout of the control plane.
//!
//! All keys are absolute, `/`-separated paths. Directories are implicit: a directory exists
//! as long as some key has it as a prefix.

/// The root of every cluster's service state.
pub const SERVICES_ROOT: &str = "/services";
/// The root of the per-node completion channels.
pub const NOTIFY_ROOT: &str = "/_notify";
/// The root of the node inventory.
pub const INVENTORY_NODES: &str = "/inventory/nodes";
/// The root of leader election leases.
pub const LEADER_ROOT: &str = "/_leader";

/// The value agents publish on their status key after a successful reconcile.
pub const STATUS_SUCCEEDED: &str = "succeeded";
/// The value used for boolean markers such as trigger and state keys.
pub const MARKER_SET: &str = "1";

pub const DESIRED: &str = "desired";
pub const APPLIED: &str = "applied";

/// Join the given path segments into a single key.
pub fn join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for part in parts {
        let part = part.as_ref().trim_matches('/');
        if part.is_empty() {
            continue;
        }
        key.push('/');
        key.push_str(part);
    }
    if key.is_empty() {
        key.push('/');
    }
    key
}

/// Check if `key` is `dir` itself or lives underneath it.
pub fn is_within(key: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return true;
    }
    key == dir || (key.starts_with(dir) && key.as_bytes().get(dir.len()) == Some(&b'/'))
}

/// The last segment of the given key.
pub fn base_name(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// `/services/<cluster>`
pub fn cluster_root(cluster: &str) -> String {
    join([SERVICES_ROOT, cluster])
}

/// `/services/<cluster>/<service>/desired`
pub fn desired_key(cluster: &str, service: &str) -> String {
    join([SERVICES_ROOT, cluster, service, DESIRED])
}

/// `/services/<cluster>/<service>/applied`
pub fn applied_key(cluster: &str, service: &str) -> String {
    join([SERVICES_ROOT, cluster, service, APPLIED])
}

/// `/services/<cluster>/<service>/desired/<node>`
pub fn desired_node_key(cluster: &str, service: &str, node: &str) -> String {
    join([desired_key(cluster, service).as_str(), node])
}

/// `/services/<cluster>/<service>/applied/<node>`
pub fn applied_node_key(cluster: &str, service: &str, node: &str) -> String {
    join([applied_key(cluster, service).as_str(), node])
}

/// `/services/<cluster>/agents/<node>/<service>/ready`, the marker a leader sets to wake an agent.
pub fn trigger_key(cluster: &str, node: &str, service: &str) -> String {
    join([SERVICES_ROOT, cluster, "agents", node, service, "ready"])
}

/// `/_notify/<node>/<service>/status`, where an agent reports the outcome of a reconcile.
pub fn status_key(node: &str, service: &str) -> String {
    join([NOTIFY_ROOT, node, service, "status"])
}

/// `/inventory/nodes/<node>`
pub fn node_key(node: &str) -> String {
    join([INVENTORY_NODES, node])
}

/// `/_leader/<cluster>`
pub fn lease_key(cluster: &str) -> String {
    join([LEADER_ROOT, cluster])
}

/// Escape a filesystem path so that it can be used as a single key segment.
///
/// The leading `/` is dropped and every other `/` becomes `_`.
pub fn escape_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}
