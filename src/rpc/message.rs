//! ONC RPC version 2 message types (RFC 5531).
//!
//! Only the envelope is modelled here. Procedure arguments and results stay
//! opaque `Bytes` and are interpreted by the program that owns them.

use bytes::Bytes;

use super::xdr::{XdrError, XdrReader, XdrWriter};

/// The only RPC protocol version this server speaks.
pub const RPC_VERSION: u32 = 2;

pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;

const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;

// accept_stat
const SUCCESS: u32 = 0;
const PROG_UNAVAIL: u32 = 1;
const PROG_MISMATCH: u32 = 2;
const PROC_UNAVAIL: u32 = 3;
const GARBAGE_ARGS: u32 = 4;
const SYSTEM_ERR: u32 = 5;

// reject_stat
const RPC_MISMATCH: u32 = 0;
const AUTH_ERROR: u32 = 1;

pub const AUTH_NONE: u32 = 0;

/// Upper bound on credential and verifier bodies.
const MAX_AUTH_BYTES: usize = 400;

/// Errors decoding an RPC message envelope.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Xdr(#[from] XdrError),

    #[error("message {xid:#x} has type {msg_type}, expected {expected}")]
    UnexpectedType { xid: u32, msg_type: u32, expected: u32 },

    #[error("call {xid:#x} uses RPC version {version}")]
    RpcVersion { xid: u32, version: u32 },

    #[error("reply {xid:#x} has unknown {field} {value}")]
    UnknownStatus {
        xid: u32,
        field: &'static str,
        value: u32,
    },
}

/// Credential or verifier: a flavor tag plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Bytes,
}

impl OpaqueAuth {
    pub fn none() -> Self {
        Self {
            flavor: AUTH_NONE,
            body: Bytes::new(),
        }
    }

    fn read(r: &mut XdrReader) -> Result<Self, XdrError> {
        let flavor = r.get_u32()?;
        let body = r.get_opaque(MAX_AUTH_BYTES)?;
        Ok(Self { flavor, body })
    }

    fn write(&self, w: &mut XdrWriter) {
        w.put_u32(self.flavor).put_opaque(&self.body);
    }
}

/// Everything in a call message except the procedure arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

/// A decoded call: header plus the still-encoded arguments.
#[derive(Debug, Clone)]
pub struct Call {
    pub header: CallHeader,
    pub args: Bytes,
}

impl Call {
    /// Decode a complete call record.
    ///
    /// A call carrying an RPC version other than 2 decodes its xid and then
    /// fails with [`MessageError::RpcVersion`] so the caller can answer with
    /// an RPC_MISMATCH denial instead of dropping the connection.
    pub fn decode(record: Bytes) -> Result<Self, MessageError> {
        let mut r = XdrReader::new(record);
        let xid = r.get_u32()?;
        let msg_type = r.get_u32()?;
        if msg_type != MSG_CALL {
            return Err(MessageError::UnexpectedType {
                xid,
                msg_type,
                expected: MSG_CALL,
            });
        }
        let version = r.get_u32()?;
        if version != RPC_VERSION {
            return Err(MessageError::RpcVersion { xid, version });
        }
        let prog = r.get_u32()?;
        let vers = r.get_u32()?;
        let proc = r.get_u32()?;
        let cred = OpaqueAuth::read(&mut r)?;
        let verf = OpaqueAuth::read(&mut r)?;

        Ok(Self {
            header: CallHeader {
                xid,
                prog,
                vers,
                proc,
                cred,
                verf,
            },
            args: r.into_rest(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let h = &self.header;
        let mut w = XdrWriter::new();
        w.put_u32(h.xid)
            .put_u32(MSG_CALL)
            .put_u32(RPC_VERSION)
            .put_u32(h.prog)
            .put_u32(h.vers)
            .put_u32(h.proc);
        h.cred.write(&mut w);
        h.verf.write(&mut w);
        w.put_raw(&self.args);
        w.finish()
    }
}

/// Outcome of a call the server accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptStat {
    Success(Bytes),
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

/// Reason a call was refused outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectStat {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted(AcceptStat),
    Denied(RejectStat),
}

/// A reply message. Replies always carry an AUTH_NONE verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub xid: u32,
    pub body: ReplyBody,
}

impl Reply {
    pub fn accepted(xid: u32, stat: AcceptStat) -> Self {
        Self {
            xid,
            body: ReplyBody::Accepted(stat),
        }
    }

    pub fn success(xid: u32, results: Bytes) -> Self {
        Self::accepted(xid, AcceptStat::Success(results))
    }

    pub fn rpc_mismatch(xid: u32) -> Self {
        Self {
            xid,
            body: ReplyBody::Denied(RejectStat::RpcMismatch {
                low: RPC_VERSION,
                high: RPC_VERSION,
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = XdrWriter::new();
        w.put_u32(self.xid).put_u32(MSG_REPLY);

        match &self.body {
            ReplyBody::Accepted(stat) => {
                w.put_u32(MSG_ACCEPTED);
                OpaqueAuth::none().write(&mut w);
                match stat {
                    AcceptStat::Success(results) => {
                        w.put_u32(SUCCESS).put_raw(results);
                    }
                    AcceptStat::ProgUnavail => {
                        w.put_u32(PROG_UNAVAIL);
                    }
                    AcceptStat::ProgMismatch { low, high } => {
                        w.put_u32(PROG_MISMATCH).put_u32(*low).put_u32(*high);
                    }
                    AcceptStat::ProcUnavail => {
                        w.put_u32(PROC_UNAVAIL);
                    }
                    AcceptStat::GarbageArgs => {
                        w.put_u32(GARBAGE_ARGS);
                    }
                    AcceptStat::SystemErr => {
                        w.put_u32(SYSTEM_ERR);
                    }
                }
            }
            ReplyBody::Denied(stat) => {
                w.put_u32(MSG_DENIED);
                match stat {
                    RejectStat::RpcMismatch { low, high } => {
                        w.put_u32(RPC_MISMATCH).put_u32(*low).put_u32(*high);
                    }
                    RejectStat::AuthError(why) => {
                        w.put_u32(AUTH_ERROR).put_u32(*why);
                    }
                }
            }
        }

        w.finish()
    }

    pub fn decode(record: Bytes) -> Result<Self, MessageError> {
        let mut r = XdrReader::new(record);
        let xid = r.get_u32()?;
        let msg_type = r.get_u32()?;
        if msg_type != MSG_REPLY {
            return Err(MessageError::UnexpectedType {
                xid,
                msg_type,
                expected: MSG_REPLY,
            });
        }

        let body = match r.get_u32()? {
            MSG_ACCEPTED => {
                let _verf = OpaqueAuth::read(&mut r)?;
                let stat = match r.get_u32()? {
                    SUCCESS => AcceptStat::Success(r.into_rest()),
                    PROG_UNAVAIL => AcceptStat::ProgUnavail,
                    PROG_MISMATCH => AcceptStat::ProgMismatch {
                        low: r.get_u32()?,
                        high: r.get_u32()?,
                    },
                    PROC_UNAVAIL => AcceptStat::ProcUnavail,
                    GARBAGE_ARGS => AcceptStat::GarbageArgs,
                    SYSTEM_ERR => AcceptStat::SystemErr,
                    value => {
                        return Err(MessageError::UnknownStatus {
                            xid,
                            field: "accept_stat",
                            value,
                        });
                    }
                };
                ReplyBody::Accepted(stat)
            }
            MSG_DENIED => {
                let stat = match r.get_u32()? {
                    RPC_MISMATCH => RejectStat::RpcMismatch {
                        low: r.get_u32()?,
                        high: r.get_u32()?,
                    },
                    AUTH_ERROR => RejectStat::AuthError(r.get_u32()?),
                    value => {
                        return Err(MessageError::UnknownStatus {
                            xid,
                            field: "reject_stat",
                            value,
                        });
                    }
                };
                ReplyBody::Denied(stat)
            }
            value => {
                return Err(MessageError::UnknownStatus {
                    xid,
                    field: "reply_stat",
                    value,
                });
            }
        };

        Ok(Self { xid, body })
    }
}
