//! Built-in RPC programs.
//!
//! - `handshake`: client handshake negotiation
//! - `dump`: lists the programs this server answers
//! - `portmap`: brick-to-port registry, owned per connection

pub mod dump;
pub mod handshake;
pub mod portmap;

use std::sync::Arc;

use crate::context::AppContext;
use crate::rpc::xdr::XdrWriter;
use crate::server::program::Program;

/// Longest brick path or name accepted in arguments.
pub(crate) const MAX_NAME_LEN: usize = 4096;

/// The programs every server registers.
pub fn default_programs(ctx: &AppContext) -> Vec<Arc<dyn Program>> {
    vec![
        Arc::new(handshake::Handshake::new()) as Arc<dyn Program>,
        Arc::new(dump::Dump::new()) as Arc<dyn Program>,
        ctx.portmap.clone() as Arc<dyn Program>,
    ]
}

/// Encode the `(op_ret, op_errno)` pair most replies start with.
pub(crate) fn op_status(w: &mut XdrWriter, result: Result<(), nix::errno::Errno>) {
    match result {
        Ok(()) => w.put_i32(0).put_i32(0),
        Err(errno) => w.put_i32(-1).put_i32(errno as i32),
    };
}
