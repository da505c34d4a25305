//! The loopback HTTP surface: spec §6's permission/tool/brain API served over axum.

pub mod control_plane;

pub use control_plane::{build_router, GatewayState};
