//! The worker side of one session: answer the coordinator's handshake,
//! install whichever function identifiers it pushes, then execute
//! `map`/`reduce`/`partialreduce` assignments until told to disconnect.

use crate::error::{WorkerError, WorkerResult};
use mapreduce::canonical_key;
use mapreduce::registry::{CollectFn, FunctionRegistry, MapFn, ReduceFn};
use netcode::message::{self, MapDonePayload, MapPayload, ReduceDonePayload, ReducePayload};
use netcode::{Connection, Frame, HandshakeEvent, Session};
use serde_json::Value;
use slog::{info, warn, Logger};
use std::collections::BTreeMap;
use std::net::TcpStream;

fn apply_handshake_event(conn: &mut Connection, event: HandshakeEvent) -> WorkerResult<()> {
    match event {
        HandshakeEvent::SendControl { verb, field } => Ok(conn.send_control(verb, &field)?),
        HandshakeEvent::Close => Ok(conn.send_control("disconnect", "")?),
    }
}

/// The coordinator always initiates (`§4.2`); the worker only reacts.
fn run_handshake(conn: &mut Connection, session: &mut Session) -> WorkerResult<bool> {
    loop {
        let frame = match conn.read_frame()? {
            Some(frame) => frame,
            None => return Ok(false),
        };

        match frame {
            Frame::Control { verb, field } => {
                for event in session.on_control(&verb, &field)? {
                    let closing = matches!(event, HandshakeEvent::Close);
                    apply_handshake_event(conn, event)?;
                    if closing {
                        return Ok(false);
                    }
                }
            }
            Frame::Payload { .. } => session.require_authed()?,
        }

        if session.is_authed() {
            return Ok(true);
        }
    }
}

pub fn run_worker(stream: TcpStream, secret: Vec<u8>, registry: FunctionRegistry, log: Logger) -> WorkerResult<()> {
    let mut conn = Connection::new(stream)?;
    let mut session = Session::new(secret, log.clone());

    if !run_handshake(&mut conn, &mut session)? {
        return Ok(());
    }
    info!(log, "authenticated with coordinator");

    let mut mapfn: Option<MapFn> = None;
    let mut reducefn: Option<ReduceFn> = None;
    let mut collectfn: Option<CollectFn> = None;

    loop {
        let frame = match conn.read_frame()? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        match frame {
            Frame::Control { verb, .. } if verb == "disconnect" => {
                info!(log, "coordinator closed the session");
                return Ok(());
            }
            Frame::Control { verb, .. } => return Err(WorkerError::UnexpectedVerb(verb)),
            Frame::Payload { verb, bytes } => match verb.as_str() {
                "mapfn" | "reducefn" | "collectfn" => {
                    let name: String = message::decode(&bytes)?;
                    let job = registry.get(&name).ok_or_else(|| WorkerError::UnknownJob(name.clone()))?;
                    match verb.as_str() {
                        "mapfn" => mapfn = Some(job.mapfn),
                        "reducefn" => reducefn = Some(job.reducefn),
                        "collectfn" => collectfn = job.collectfn,
                        _ => unreachable!(),
                    }
                }
                "map" => {
                    let payload: MapPayload = message::decode(&bytes)?;
                    let mapfn = mapfn.ok_or(WorkerError::FunctionNotInstalled("mapfn"))?;

                    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                    for (k, v) in mapfn(&payload.k_in, &payload.v_in) {
                        groups.entry(canonical_key(&k)).or_default().push(v);
                    }

                    // Local combine, per `§4.3`: each key's value list
                    // collapses to a single `collectfn`-combined value
                    // before it ever reaches the wire.
                    if let Some(collect) = collectfn {
                        for (key_text, values) in groups.iter_mut() {
                            let k_mid: Value = serde_json::from_str(key_text)?;
                            let combined = collect(&k_mid, values);
                            *values = vec![combined];
                        }
                    }

                    conn.send_payload("mapdone", &MapDonePayload { k_in: payload.k_in, groups })?;
                }
                "reduce" | "partialreduce" => {
                    let payload: ReducePayload = message::decode(&bytes)?;
                    let reducefn = reducefn.ok_or(WorkerError::FunctionNotInstalled("reducefn"))?;
                    let value = reducefn(payload.key.base_key(), &payload.values);
                    conn.send_payload("reducedone", &ReduceDonePayload { key: payload.key, value })?;
                }
                other => return Err(WorkerError::UnexpectedVerb(other.to_string())),
            },
        }
    }
}

pub fn log_session_error(log: &Logger, err: &WorkerError) {
    warn!(log, "worker session ended with an error"; "error" => %err);
}
