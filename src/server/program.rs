//! Program registration and per-connection dispatch.
//!
//! Programs are built once and registered into a [`ProgramRegistry`] at
//! startup. Each accepted connection gets its own [`Dispatcher`] that shares
//! the validated table and passes the calling connection to every
//! procedure through [`CallContext`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::clients::Conn;
use crate::rpc::message::{AcceptStat, Call, Reply};
use crate::rpc::xdr::XdrError;

/// The NULL procedure every program answers.
pub const NULLPROC: u32 = 0;

/// A callable procedure exposed by a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure {
    pub number: u32,
    pub name: &'static str,
}

impl Procedure {
    pub const fn new(number: u32, name: &'static str) -> Self {
        Self { number, name }
    }
}

/// Per-call failure reported by a program.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("cannot decode arguments: {0}")]
    GarbageArgs(#[from] XdrError),

    #[error("procedure {0} is not implemented")]
    Unavailable(u32),

    #[error("{0}")]
    System(String),
}

/// What a procedure sees about the call it is serving.
pub struct CallContext<'a> {
    /// The connection that issued the call.
    pub conn: &'a Conn,
    /// Every program registered with the server.
    pub programs: &'a ProgramRegistry,
}

/// A dispatch target identified by (program number, version).
#[async_trait]
pub trait Program: Send + Sync {
    fn name(&self) -> &str;

    fn number(&self) -> u32;

    fn version(&self) -> u32;

    fn procedures(&self) -> &[Procedure];

    /// Run `procedure` with XDR-encoded `args`, returning XDR-encoded results.
    async fn call(
        &self,
        cx: &CallContext<'_>,
        procedure: u32,
        args: Bytes,
    ) -> Result<Bytes, ProcError>;
}

/// Registration failures. Any of these aborts server construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(
        "could not register program {program}: ({number}, v{version}) is already registered by {existing}"
    )]
    Conflict {
        program: String,
        existing: String,
        number: u32,
        version: u32,
    },

    #[error("could not register program {program}: procedure {procedure} is {reason}")]
    MalformedProcedure {
        program: String,
        procedure: u32,
        reason: &'static str,
    },
}

/// Result of looking a call up in the registry.
pub enum Lookup<'a> {
    Found(&'a Arc<dyn Program>),
    /// The program exists, but not at the requested version.
    VersionMismatch { low: u32, high: u32 },
    Unknown,
}

/// Immutable table of registered programs keyed by (number, version).
pub struct ProgramRegistry {
    programs: BTreeMap<(u32, u32), Arc<dyn Program>>,
}

impl ProgramRegistry {
    /// Register every program, failing on the first conflict.
    pub fn new(programs: impl IntoIterator<Item = Arc<dyn Program>>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            programs: BTreeMap::new(),
        };
        for program in programs {
            registry.register(program)?;
        }
        Ok(registry)
    }

    fn register(&mut self, program: Arc<dyn Program>) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for procedure in program.procedures() {
            if procedure.name.is_empty() {
                return Err(RegistryError::MalformedProcedure {
                    program: program.name().to_string(),
                    procedure: procedure.number,
                    reason: "unnamed",
                });
            }
            if !seen.insert(procedure.number) {
                return Err(RegistryError::MalformedProcedure {
                    program: program.name().to_string(),
                    procedure: procedure.number,
                    reason: "declared twice",
                });
            }
        }

        let key = (program.number(), program.version());
        if let Some(existing) = self.programs.get(&key) {
            return Err(RegistryError::Conflict {
                program: program.name().to_string(),
                existing: existing.name().to_string(),
                number: key.0,
                version: key.1,
            });
        }

        debug!(
            program = program.name(),
            number = key.0,
            version = key.1,
            procedures = program.procedures().len(),
            "Registered program"
        );
        self.programs.insert(key, program);
        Ok(())
    }

    pub fn lookup(&self, number: u32, version: u32) -> Lookup<'_> {
        if let Some(program) = self.programs.get(&(number, version)) {
            return Lookup::Found(program);
        }

        let versions = self
            .programs
            .range((number, u32::MIN)..=(number, u32::MAX))
            .map(|((_, v), _)| *v);
        match (versions.clone().min(), versions.max()) {
            (Some(low), Some(high)) => Lookup::VersionMismatch { low, high },
            _ => Lookup::Unknown,
        }
    }

    /// Programs in (number, version) order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Program>> {
        self.programs.values()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Per-connection dispatch server.
///
/// Calls are dispatched one at a time by the owning session, so a program
/// never sees two concurrent calls from the same connection.
pub struct Dispatcher {
    programs: Arc<ProgramRegistry>,
    conn: Conn,
}

impl Dispatcher {
    /// Bind the shared program table to one connection.
    pub fn bind(programs: Arc<ProgramRegistry>, conn: Conn) -> Self {
        Self { programs, conn }
    }

    pub async fn dispatch(&self, call: Call) -> Reply {
        let header = &call.header;
        let xid = header.xid;

        let program = match self.programs.lookup(header.prog, header.vers) {
            Lookup::Found(program) => program,
            Lookup::VersionMismatch { low, high } => {
                debug!(prog = header.prog, vers = header.vers, "Program version mismatch");
                return Reply::accepted(xid, AcceptStat::ProgMismatch { low, high });
            }
            Lookup::Unknown => {
                debug!(prog = header.prog, "Program unavailable");
                return Reply::accepted(xid, AcceptStat::ProgUnavail);
            }
        };

        if !program.procedures().iter().any(|p| p.number == header.proc) {
            return Reply::accepted(xid, AcceptStat::ProcUnavail);
        }

        let cx = CallContext {
            conn: &self.conn,
            programs: &self.programs,
        };

        match program.call(&cx, header.proc, call.args).await {
            Ok(results) => Reply::success(xid, results),
            Err(ProcError::GarbageArgs(e)) => {
                debug!(program = program.name(), proc = header.proc, error = %e, "Garbage arguments");
                Reply::accepted(xid, AcceptStat::GarbageArgs)
            }
            Err(ProcError::Unavailable(_)) => Reply::accepted(xid, AcceptStat::ProcUnavail),
            Err(ProcError::System(e)) => {
                warn!(
                    program = program.name(),
                    proc = header.proc,
                    peer = %self.conn.peer(),
                    error = %e,
                    "Procedure failed"
                );
                Reply::accepted(xid, AcceptStat::SystemErr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::{CallHeader, OpaqueAuth, ReplyBody};
    use crate::rpc::xdr::{XdrReader, XdrWriter};
    use crate::server::clients::{Connection, Transport};

    struct Echo {
        name: &'static str,
        number: u32,
        version: u32,
        procedures: Vec<Procedure>,
    }

    impl Echo {
        fn new(name: &'static str, number: u32, version: u32) -> Arc<dyn Program> {
            Arc::new(Self {
                name,
                number,
                version,
                procedures: vec![Procedure::new(NULLPROC, "NULL"), Procedure::new(1, "WHOAMI")],
            })
        }
    }

    #[async_trait]
    impl Program for Echo {
        fn name(&self) -> &str {
            self.name
        }

        fn number(&self) -> u32 {
            self.number
        }

        fn version(&self) -> u32 {
            self.version
        }

        fn procedures(&self) -> &[Procedure] {
            &self.procedures
        }

        async fn call(
            &self,
            cx: &CallContext<'_>,
            procedure: u32,
            args: Bytes,
        ) -> Result<Bytes, ProcError> {
            match procedure {
                NULLPROC => Ok(Bytes::new()),
                1 => {
                    let mut r = XdrReader::new(args);
                    let greeting = r.get_string(64)?;
                    let mut w = XdrWriter::new();
                    w.put_string(&format!("{greeting} {}", cx.conn.peer()));
                    Ok(w.finish())
                }
                other => Err(ProcError::Unavailable(other)),
            }
        }
    }

    fn call(prog: u32, vers: u32, proc: u32, args: Bytes) -> Call {
        Call {
            header: CallHeader {
                xid: 42,
                prog,
                vers,
                proc,
                cred: OpaqueAuth::none(),
                verf: OpaqueAuth::none(),
            },
            args,
        }
    }

    fn dispatcher(peer: &str) -> Dispatcher {
        let registry = ProgramRegistry::new([Echo::new("echo", 100, 1), Echo::new("echo2", 100, 3)])
            .unwrap();
        Dispatcher::bind(Arc::new(registry), Connection::new(Transport::Unix, peer))
    }

    #[test]
    fn test_conflict_names_program() {
        let err = ProgramRegistry::new([Echo::new("first", 7, 1), Echo::new("second", 7, 1)])
            .err()
            .unwrap();

        assert_eq!(
            err,
            RegistryError::Conflict {
                program: "second".into(),
                existing: "first".into(),
                number: 7,
                version: 1,
            }
        );
        assert!(err.to_string().contains("second"));
    }

    #[test]
    fn test_same_number_different_versions_coexist() {
        let registry =
            ProgramRegistry::new([Echo::new("v1", 7, 1), Echo::new("v2", 7, 2)]).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_procedure_is_malformed() {
        let bad: Arc<dyn Program> = Arc::new(Echo {
            name: "twice",
            number: 9,
            version: 1,
            procedures: vec![Procedure::new(1, "A"), Procedure::new(1, "B")],
        });

        let err = ProgramRegistry::new([bad]).err().unwrap();
        assert!(matches!(
            err,
            RegistryError::MalformedProcedure { procedure: 1, .. }
        ));
        assert!(err.to_string().contains("twice"));
    }

    #[tokio::test]
    async fn test_dispatch_passes_calling_connection() {
        let d = dispatcher("client-a");
        let mut w = XdrWriter::new();
        w.put_string("hello");

        let reply = d.dispatch(call(100, 1, 1, w.finish())).await;
        let ReplyBody::Accepted(AcceptStat::Success(results)) = reply.body else {
            panic!("expected success, got {:?}", reply.body);
        };
        let mut r = XdrReader::new(results);
        assert_eq!(r.get_string(64).unwrap(), "hello client-a");
    }

    #[tokio::test]
    async fn test_dispatch_statuses() {
        let d = dispatcher("client-b");

        let reply = d.dispatch(call(999, 1, 0, Bytes::new())).await;
        assert_eq!(reply.body, ReplyBody::Accepted(AcceptStat::ProgUnavail));

        let reply = d.dispatch(call(100, 2, 0, Bytes::new())).await;
        assert_eq!(
            reply.body,
            ReplyBody::Accepted(AcceptStat::ProgMismatch { low: 1, high: 3 })
        );

        let reply = d.dispatch(call(100, 1, 55, Bytes::new())).await;
        assert_eq!(reply.body, ReplyBody::Accepted(AcceptStat::ProcUnavail));

        // WHOAMI with no string argument
        let reply = d.dispatch(call(100, 1, 1, Bytes::new())).await;
        assert_eq!(reply.body, ReplyBody::Accepted(AcceptStat::GarbageArgs));
        assert_eq!(reply.xid, 42);
    }
}
