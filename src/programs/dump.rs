//! Introspection program: reports which programs the server answers.
//!
//! DUMP takes the caller's 64-bit id and echoes it back with an XDR array
//! of `(name, number, version)` entries, one per registered program.

use async_trait::async_trait;
use bytes::Bytes;

use super::{MAX_NAME_LEN, op_status};
use crate::rpc::client::{ClientError, RpcClient};
use crate::rpc::xdr::{XdrError, XdrReader, XdrWriter};
use crate::server::program::{CallContext, NULLPROC, ProcError, Procedure, Program};

pub const PROGRAM: u32 = 123451501;
pub const VERSION: u32 = 1;

pub const DUMP: u32 = 1;

const PROCEDURES: &[Procedure] = &[Procedure::new(NULLPROC, "NULL"), Procedure::new(DUMP, "DUMP")];

/// Upper bound on entries accepted when decoding a reply.
const MAX_ENTRIES: usize = 1024;

#[derive(Debug, Default)]
pub struct Dump;

impl Dump {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Program for Dump {
    fn name(&self) -> &str {
        "GF-DUMP"
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
        match procedure {
            NULLPROC => Ok(Bytes::new()),
            DUMP => {
                let gfs_id = XdrReader::new(args).get_u64()?;

                let mut w = XdrWriter::new();
                w.put_u64(gfs_id);
                op_status(&mut w, Ok(()));
                w.put_u32(cx.programs.len() as u32);
                for program in cx.programs.iter() {
                    w.put_string(program.name())
                        .put_u32(program.number())
                        .put_u32(program.version());
                }
                Ok(w.finish())
            }
            other => Err(ProcError::Unavailable(other)),
        }
    }
}

/// One entry of a DUMP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub name: String,
    pub number: u32,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReply {
    pub gfs_id: u64,
    pub op_ret: i32,
    pub op_errno: i32,
    pub programs: Vec<ProgramInfo>,
}

impl DumpReply {
    pub fn decode(results: Bytes) -> Result<Self, XdrError> {
        let mut r = XdrReader::new(results);
        let gfs_id = r.get_u64()?;
        let op_ret = r.get_i32()?;
        let op_errno = r.get_i32()?;

        let count = r.get_u32()? as usize;
        if count > MAX_ENTRIES {
            return Err(XdrError::TooLong {
                len: count,
                limit: MAX_ENTRIES,
            });
        }
        let mut programs = Vec::with_capacity(count);
        for _ in 0..count {
            programs.push(ProgramInfo {
                name: r.get_string(MAX_NAME_LEN)?,
                number: r.get_u32()?,
                version: r.get_u32()?,
            });
        }

        Ok(Self {
            gfs_id,
            op_ret,
            op_errno,
            programs,
        })
    }
}

/// Ask a server which programs it serves.
pub async fn query(client: &mut RpcClient, gfs_id: u64) -> Result<DumpReply, ClientError> {
    let mut args = XdrWriter::new();
    args.put_u64(gfs_id);

    let results = client.call(PROGRAM, VERSION, DUMP, args.finish()).await?;
    Ok(DumpReply::decode(results)?)
}
