use crate::keys::*;

#[test]
fn join_normalizes_separators() {
    let key = join(["/services/", "/ceph", "monitor/", "desired"]);
    assert!(key == "/services/ceph/monitor/desired", "unexpected key, got {}", key);
    assert!(join(Vec::<String>::new()) == "/", "expected root key for empty join");
}

#[test]
fn is_within_respects_segment_boundaries() {
    assert!(is_within("/a/b/c", "/a/b"), "expected /a/b/c to be within /a/b");
    assert!(is_within("/a/b", "/a/b/"), "expected /a/b to be within itself");
    assert!(!is_within("/a/bc", "/a/b"), "expected /a/bc to not be within /a/b");
    assert!(is_within("/anything", "/"), "expected every key to be within the root");
}

#[test]
fn escape_path_flattens_directories() {
    let escaped = escape_path("/var/lib/castle");
    assert!(escaped == "var_lib_castle", "unexpected escaped path, got {}", escaped);
}

#[test]
fn service_keys_follow_layout() {
    let trigger = trigger_key("ceph", "node1", "osd");
    assert!(trigger == "/services/ceph/agents/node1/osd/ready", "unexpected trigger key, got {}", trigger);
    let status = status_key("node1", "osd");
    assert!(status == "/_notify/node1/osd/status", "unexpected status key, got {}", status);
    let desired = desired_node_key("ceph", "monitor", "node1");
    assert!(desired == "/services/ceph/monitor/desired/node1", "unexpected desired key, got {}", desired);
}
