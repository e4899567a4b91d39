//! Event Fabric (§4.7): append-only persisted events, multi-subscriber
//! broadcast for `/stream`, and the wrapper command channel for `/ingest`.

mod fabric;
mod wrapper_channel;

pub use fabric::EventFabric;
pub use wrapper_channel::WrapperChannelRegistry;
