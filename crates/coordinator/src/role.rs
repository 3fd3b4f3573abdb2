//! The coordinator side of one session: drive the handshake, push the job's
//! function selectors, then pump assignments from the shared task manager
//! until it signals `disconnect`.

use crate::error::{CoordinatorError, CoordinatorResult};
use mapreduce::{canonical_key, Assignment, OutstandingHandle, TaskManager};
use netcode::message::{MapDonePayload, ReduceDonePayload};
use netcode::{message, Connection, Frame, HandshakeEvent, Session};
use slog::{info, warn, Logger};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

/// Notifies the task manager of whatever assignment a session is holding if
/// the session ends (error, disconnect, or panic unwind) before it reports
/// completion, without every exit path having to remember to call it. Every
/// `TaskManager` implementation treats this as a no-op today — the key stays
/// outstanding and the speculative path re-dispatches it — but the hook
/// still fires on every exit in case a future implementation wants it.
struct ReleaseGuard<'a> {
    manager: &'a Mutex<Box<dyn TaskManager>>,
    handle: OutstandingHandle,
}

impl<'a> ReleaseGuard<'a> {
    fn new(manager: &'a Mutex<Box<dyn TaskManager>>) -> ReleaseGuard<'a> {
        ReleaseGuard { manager, handle: OutstandingHandle::default() }
    }

    fn hold(&mut self, handle: OutstandingHandle) {
        self.handle = handle;
    }

    fn clear(&mut self) {
        self.handle = OutstandingHandle::default();
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if self.handle.map_key.is_none() && self.handle.reduce_key.is_none() {
            return;
        }
        if let Ok(mut manager) = self.manager.lock() {
            manager.release(&self.handle);
        }
    }
}

fn run_handshake(conn: &mut Connection, session: &mut Session) -> CoordinatorResult<bool> {
    let initial = session.initiate();
    apply_handshake_event(conn, initial)?;

    loop {
        let frame = match conn.read_frame()? {
            Some(frame) => frame,
            None => return Ok(false),
        };

        match frame {
            Frame::Control { verb, field } => {
                for event in session.on_control(&verb, &field)? {
                    if matches!(event, HandshakeEvent::Close) {
                        apply_handshake_event(conn, event)?;
                        return Ok(false);
                    }
                    apply_handshake_event(conn, event)?;
                }
            }
            Frame::Payload { .. } => {
                session.require_authed()?;
            }
        }

        if session.is_authed() {
            return Ok(true);
        }
    }
}

fn apply_handshake_event(conn: &mut Connection, event: HandshakeEvent) -> CoordinatorResult<()> {
    match event {
        HandshakeEvent::SendControl { verb, field } => Ok(conn.send_control(verb, &field)?),
        HandshakeEvent::Close => Ok(conn.send_control("disconnect", "")?),
    }
}

fn expect_payload(frame: Frame, expected: &'static str) -> CoordinatorResult<Vec<u8>> {
    match frame {
        Frame::Payload { verb, bytes } if verb == expected => Ok(bytes),
        Frame::Payload { verb, .. } => Err(CoordinatorError::UnexpectedReply { expected, got: verb }),
        Frame::Control { verb, .. } => Err(CoordinatorError::UnexpectedReply { expected, got: verb }),
    }
}

pub fn run_session(
    stream: TcpStream,
    secret: Vec<u8>,
    job: mapreduce::JobDef,
    manager: Arc<Mutex<Box<dyn TaskManager>>>,
    log: Logger,
) -> CoordinatorResult<()> {
    let mut conn = Connection::new(stream)?;
    let mut session = Session::new(secret, log.clone());

    if !run_handshake(&mut conn, &mut session)? {
        return Ok(());
    }
    info!(log, "worker authenticated"; "job" => job.name);

    conn.send_payload("mapfn", &job.name)?;
    conn.send_payload("reducefn", &job.name)?;
    if job.collectfn.is_some() {
        conn.send_payload("collectfn", &job.name)?;
    }

    let mut guard = ReleaseGuard::new(&manager);

    loop {
        let assignment = {
            let mut manager = manager.lock().unwrap();
            manager.next_task()?
        };

        match assignment {
            Assignment::Map(payload) => {
                guard.hold(OutstandingHandle { map_key: Some(canonical_key(&payload.k_in)), reduce_key: None });

                conn.send_payload("map", &payload)?;
                let frame = conn.read_frame()?.ok_or(CoordinatorError::ConnectionClosed)?;
                let bytes = expect_payload(frame, "mapdone")?;
                let done: MapDonePayload = message::decode(&bytes)?;

                manager.lock().unwrap().map_done(done)?;
                guard.clear();
            }
            Assignment::Reduce(payload) => {
                let wire_verb = match &payload.key {
                    netcode::message::ReduceKey::Simple(_) => "reduce",
                    netcode::message::ReduceKey::Sliced { .. } => "partialreduce",
                };
                guard.hold(OutstandingHandle { map_key: None, reduce_key: Some(payload.key.canonical()) });

                conn.send_payload(wire_verb, &payload)?;
                let frame = conn.read_frame()?.ok_or(CoordinatorError::ConnectionClosed)?;
                let bytes = expect_payload(frame, "reducedone")?;
                let done: ReduceDonePayload = message::decode(&bytes)?;

                manager.lock().unwrap().reduce_done(done.key, done.value)?;
                guard.clear();
            }
            Assignment::Disconnect => {
                conn.send_control("disconnect", "")?;
                info!(log, "job finished, closing session");
                return Ok(());
            }
        }
    }
}

pub fn log_session_error(log: &Logger, err: &CoordinatorError) {
    warn!(log, "session ended with an error"; "error" => %err);
}
