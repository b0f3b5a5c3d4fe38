//! ONC RPC v2 wire layer.
//!
//! - `xdr`: XDR primitive encoding
//! - `message`: call and reply envelopes
//! - `codec`: record-marking framing and the per-connection server codec
//! - `client`: client for calling a running server

pub mod client;
pub mod codec;
pub mod message;
pub mod xdr;

pub use client::{ClientError, RpcClient};
pub use codec::{CALL_SIGNATURE_LEN, is_sunrpc_call};
pub use message::{Call, Reply};
