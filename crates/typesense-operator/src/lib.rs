pub mod cluster_controller;
pub mod conditions;
pub mod crds;
pub mod error;
pub mod ingress;
pub mod nodeslist;
pub mod podmonitor;
pub mod quorum;
pub mod scraper;
pub mod secret;
pub mod services;
pub mod statefulset;
