use sha2::{Digest, Sha256};

/// Stable identity of one subscriber queue on the hub.
///
/// Same host, handler and hub always give the same id, so a restarted
/// process picks up the queue it left behind. `client_id` separates several
/// processes on one host that would otherwise share a queue.
pub fn subscriber_id(host: &str, handler_type: &str, target: &str, client_id: Option<&str>) -> String {
    let mut key = format!("{host}:{handler_type}:{target}");
    if let Some(client_id) = client_id {
        key.push(':');
        key.push_str(client_id);
    }

    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Host name for subscriber ids, from the environment
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
