//! Lifecycle RPC between the coordinator and its workers, served on the
//! `management` port of every RPC worker.

pub mod client;
pub mod server;

use crate::constants::MANAGEMENT_PORT;

pub mod proto {
    tonic::include_proto!("lifecycle.v1");
}

/// Cluster DNS address of a worker's management service.
pub fn worker_address(ordinal: usize, namespace: &str) -> String {
    format!("worker-{ordinal}.{namespace}.svc.cluster.local:{MANAGEMENT_PORT}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_address() {
        assert_eq!(
            worker_address(2, "alpha-bee-map"),
            "worker-2.alpha-bee-map.svc.cluster.local:5000"
        );
    }
}
