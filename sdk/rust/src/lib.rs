//! Client for the gatehouse line protocol.

mod client;

pub use client::{ClientError, GatehouseClient, SessionInfo, UserInfo};
