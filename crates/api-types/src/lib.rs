//! Shared API type definitions
//!
//! This crate carries the kubelet device plugin API (`v1beta1`) generated from
//! `proto/api.proto`, plus the string constants the protocol exchanges as plain
//! text (API version, health values).
#![allow(clippy::doc_markdown)]

pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// Device plugin API version sent in every registration request.
pub const VERSION: &str = "v1beta1";

/// Health value of a device that can be allocated.
pub const HEALTHY: &str = "Healthy";

/// Health value of a device that must not be allocated.
pub const UNHEALTHY: &str = "Unhealthy";

/// Default directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// File name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET: &str = "kubelet.sock";
