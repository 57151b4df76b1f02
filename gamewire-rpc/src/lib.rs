//! # gamewire-rpc
//!
//! RPC layer for gamewire. RPC traffic is ordinary protocol traffic: the
//! provider registers its handlers into a server's message registry.
//!
//! This crate provides:
//! - The RPC value and type model
//! - Service declarations, implementations and the checked service table
//! - RPC and service-center messages
//! - The provider node, with service-center registration and jobs
//! - Provider configuration

pub mod config;
pub mod error;
pub mod messages;
pub mod provider;
pub mod schedule;
pub mod service;
pub mod value;

pub use config::{ProviderConfig, ProviderSection, ServiceCenterConfig};
pub use error::RpcError;
pub use messages::{
    AddSchedule, FetchServices, FetchServicesResult, PushServices, RpcErrorCode, RpcExecute,
    RpcResult, TriggerSchedule,
};
pub use provider::{NoopProviderListener, ProviderListener, RpcProvider};
pub use schedule::{ProviderJob, ScheduleSpec, REPEAT_FOREVER};
pub use service::{
    service_name, MethodDescriptor, MethodError, MethodSpec, MethodTable, RpcService,
    ServiceCatalog, ServiceDescriptor, ServiceInstance, ServiceTable,
};
pub use value::{InvalidType, RpcType, RpcValue};
