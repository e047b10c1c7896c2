pub mod controller;

mod cluster;
mod delegate;
mod registry;
mod tls;

pub use cluster::{KubeTlsCluster, TlsCluster};
pub use controller::run;
pub use delegate::{delete_tls_references, update_tls_references, INGRESS_FINALIZER, KEYPAIR_FINALIZER};
pub use tls::{validate_keypair, InvalidTlsSecret, TlsReason};
