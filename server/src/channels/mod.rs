//! Platform adapters. Each one turns a webhook body into canonical
//! [`InboundEvent`]s and speaks the platform's send and profile APIs.

pub mod adapter;
pub mod facebook;
pub mod lazada;
pub mod registry;
pub mod signature;
pub mod zalo;

pub use adapter::{
    ChannelAdapter, EventDirection, HistoryPage, HistoryRequest, InboundEvent, OutboundContent,
    OutboundTarget,
};
pub use registry::{build_channel_registry, ChannelRegistry};
