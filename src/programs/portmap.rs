//! Brick port mapper.
//!
//! Bricks sign in with the port they listen on and clients ask where a brick
//! lives. A mapping belongs to the connection that signed it in and is
//! dropped when that connection goes away.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use tracing::{debug, info};

use super::{MAX_NAME_LEN, op_status};
use crate::rpc::xdr::{XdrReader, XdrWriter};
use crate::server::clients::{Conn, ConnId};
use crate::server::program::{CallContext, NULLPROC, ProcError, Procedure, Program};
use crate::server::pruner::DisconnectHook;

pub const PROGRAM: u32 = 34123456;
pub const VERSION: u32 = 1;

pub const PORTBYBRICK: u32 = 1;
pub const BRICKBYPORT: u32 = 2;
pub const SIGNIN: u32 = 4;
pub const SIGNOUT: u32 = 5;

const PROCEDURES: &[Procedure] = &[
    Procedure::new(NULLPROC, "NULL"),
    Procedure::new(PORTBYBRICK, "PORTBYBRICK"),
    Procedure::new(BRICKBYPORT, "BRICKBYPORT"),
    Procedure::new(SIGNIN, "SIGNIN"),
    Procedure::new(SIGNOUT, "SIGNOUT"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    port: u32,
    owner: ConnId,
}

#[derive(Debug, Default)]
pub struct Portmap {
    bricks: Mutex<HashMap<String, Mapping>>,
}

impl Portmap {
    pub fn new() -> Self {
        Self::default()
    }

    fn bricks(&self) -> MutexGuard<'_, HashMap<String, Mapping>> {
        self.bricks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn port_by_brick(&self, brick: &str) -> Option<u32> {
        self.bricks().get(brick).map(|m| m.port)
    }

    pub fn brick_by_port(&self, port: u32) -> Option<String> {
        self.bricks()
            .iter()
            .find(|(_, m)| m.port == port)
            .map(|(brick, _)| brick.clone())
    }

    /// Record `brick` on `port` for `owner`. A later sign-in for the same
    /// brick replaces the earlier one, as a restarted brick reconnects.
    pub fn sign_in(&self, owner: ConnId, brick: &str, port: u32) {
        let previous = self
            .bricks()
            .insert(brick.to_string(), Mapping { port, owner });
        match previous {
            Some(old) if old.owner != owner || old.port != port => {
                info!(brick, port, old_port = old.port, conn = %owner, "Brick re-signed in")
            }
            Some(_) => {}
            None => info!(brick, port, conn = %owner, "Brick signed in"),
        }
    }

    /// Remove `brick` if `owner` signed it in on `port`.
    pub fn sign_out(&self, owner: ConnId, brick: &str, port: u32) -> Result<(), Errno> {
        let mut bricks = self.bricks();
        match bricks.get(brick) {
            None => Err(Errno::ENOENT),
            Some(m) if m.owner != owner => Err(Errno::EPERM),
            Some(m) if m.port != port => Err(Errno::EINVAL),
            Some(_) => {
                bricks.remove(brick);
                info!(brick, port, conn = %owner, "Brick signed out");
                Ok(())
            }
        }
    }

    /// Drop every mapping `owner` holds, returning how many went.
    pub fn release(&self, owner: ConnId) -> usize {
        let mut bricks = self.bricks();
        let before = bricks.len();
        bricks.retain(|_, m| m.owner != owner);
        before - bricks.len()
    }

    pub fn len(&self) -> usize {
        self.bricks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks().is_empty()
    }
}

#[async_trait]
impl Program for Portmap {
    fn name(&self) -> &str {
        "GF-PMAP"
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
        cx: &CallContext<'_>,
        procedure: u32,
        args: Bytes,
    ) -> Result<Bytes, ProcError> {
        let mut r = XdrReader::new(args);
        let mut w = XdrWriter::new();

        match procedure {
            NULLPROC => {}
            PORTBYBRICK => {
                let brick = r.get_string(MAX_NAME_LEN)?;
                match self.port_by_brick(&brick) {
                    Some(port) => {
                        op_status(&mut w, Ok(()));
                        w.put_u32(port);
                    }
                    None => {
                        op_status(&mut w, Err(Errno::ENOENT));
                        w.put_u32(0);
                    }
                }
            }
            BRICKBYPORT => {
                let port = r.get_u32()?;
                match self.brick_by_port(port) {
                    Some(brick) => {
                        op_status(&mut w, Ok(()));
                        w.put_string(&brick);
                    }
                    None => {
                        op_status(&mut w, Err(Errno::ENOENT));
                        w.put_string("");
                    }
                }
            }
            SIGNIN => {
                let brick = r.get_string(MAX_NAME_LEN)?;
                let port = r.get_u32()?;
                self.sign_in(cx.conn.id(), &brick, port);
                op_status(&mut w, Ok(()));
            }
            SIGNOUT => {
                let brick = r.get_string(MAX_NAME_LEN)?;
                let port = r.get_u32()?;
                let result = self.sign_out(cx.conn.id(), &brick, port);
                if let Err(errno) = result {
                    debug!(brick = %brick, port, conn = %cx.conn.id(), %errno, "Sign-out refused");
                }
                op_status(&mut w, result);
            }
            other => return Err(ProcError::Unavailable(other)),
        }

        Ok(w.finish())
    }
}

impl DisconnectHook for Portmap {
    fn on_disconnect(&self, conn: &Conn) {
        let released = self.release(conn.id());
        if released > 0 {
            info!(conn = %conn.id(), peer = %conn.peer(), released, "Released brick mappings");
        }
    }
}
