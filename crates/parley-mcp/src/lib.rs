// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod manager;
mod protocol;
mod proxy;
mod transport;

pub use manager::{McpError, McpManager, McpServer};
pub use protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use proxy::McpToolProxy;
pub use transport::{HttpTransport, McpTransport, StdioTransport, TransportError};
