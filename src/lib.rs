//! Keeps a Kubernetes node's labels synchronized with the metadata of the
//! Linode instance backing it.
//!
//! One agent instance manages exactly one node. On startup it resolves its
//! own Node object, performs a single bootstrap synchronization, then starts
//! an [`watcher::InstanceWatcher`] that polls the Linode Metadata Service at
//! a fixed interval and emits change and error events on separate channels.
//! The [`controller::Controller`] consumes those events and applies the
//! `linode_*` labels through [`node::LabelSynchronizer`].

pub mod config;
pub mod controller;
pub mod metadata;
pub mod node;
pub mod utils;
pub mod watcher;
