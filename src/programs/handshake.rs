use async_trait::async_trait;
use bytes::Bytes;

use crate::server::program::{CallContext, NULLPROC, ProcError, Procedure, Program};

pub const PROGRAM: u32 = 14398633;
pub const VERSION: u32 = 2;

const PROCEDURES: &[Procedure] = &[Procedure::new(NULLPROC, "NULL")];

/// Handshake negotiation program. Clients ping it to confirm they are
/// talking to a live server before anything else.
#[derive(Debug, Default)]
pub struct Handshake;

impl Handshake {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Program for Handshake {
    fn name(&self) -> &str {
        "Gluster Handshake"
    }

    fn number(&self) -> u32 {
        PROGRAM
    }

    fn version(&self) -> u32 {
        VERSION
    }

    fn procedures(&self) -> &[Procedure] {
        PROCEDURES
    }

    async fn call(
        &self,
        _cx: &CallContext<'_>,
        procedure: u32,
        _args: Bytes,
    ) -> Result<Bytes, ProcError> {
        match procedure {
            NULLPROC => Ok(Bytes::new()),
            other => Err(ProcError::Unavailable(other)),
        }
    }
}
