//! Per-connection authentication state machine.
//!
//! Phase is modeled as an explicit tagged `enum` rather than threaded through
//! control flow (per the "phase as data" design note), so a transition such
//! as `Authed -> Unauth` is simply not a variant any code can produce.

use crate::error::{ErrorType, NetworkError, NetworkResult};
use flux::auth;
use slog::{info, o, Logger};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Unauth,
    Challenged,
    Authed,
    Closed,
}

/// An action the caller must take as a result of feeding a control frame
/// into the session: either send a reply frame, or tear the connection down.
#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeEvent {
    SendControl { verb: &'static str, field: String },
    Close,
}

/// Per-connection handshake/authentication state.
///
/// Both ends of a connection run an identical instance of this state
/// machine — the protocol is fully symmetric (`§4.2`): whichever side
/// receives a `challenge` replies with `auth` and, if it hasn't already,
/// issues its own counter-challenge.
pub struct Session {
    secret: Vec<u8>,
    sent_nonce: Option<String>,
    my_auth_sent: bool,
    peer_verified: bool,
    phase: Phase,
    log: Logger,
}

impl Session {
    pub fn new(secret: impl Into<Vec<u8>>, log: Logger) -> Session {
        Session {
            secret: secret.into(),
            sent_nonce: None,
            my_auth_sent: false,
            peer_verified: false,
            phase: Phase::Unauth,
            log: log.new(o!("component" => "session")),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn is_authed(&self) -> bool {
        self.phase == Phase::Authed
    }

    /// Fatal if a payload-bearing verb arrives before mutual authentication.
    pub fn require_authed(&self) -> NetworkResult<()> {
        if self.is_authed() {
            Ok(())
        } else {
            Err(NetworkError::Fatal(ErrorType::PayloadBeforeAuth(
                "payload frame received before mutual authentication".into(),
            )))
        }
    }

    /// Issues this side's own challenge. Called once, by whichever side
    /// initiates (the coordinator, per `§4.2`).
    pub fn initiate(&mut self) -> HandshakeEvent {
        let nonce = auth::new_nonce();
        self.sent_nonce = Some(nonce.clone());
        self.refresh_phase();
        HandshakeEvent::SendControl { verb: "challenge", field: nonce }
    }

    /// Feeds a received `challenge`/`auth`/`disconnect` control frame into
    /// the handshake, returning the events the caller must act on in order.
    pub fn on_control(&mut self, verb: &str, field: &str) -> NetworkResult<Vec<HandshakeEvent>> {
        match verb {
            "challenge" => {
                let mut events = Vec::new();

                let mac = auth::compute_mac(&self.secret, field);
                self.my_auth_sent = true;
                events.push(HandshakeEvent::SendControl { verb: "auth", field: mac });

                if self.sent_nonce.is_none() {
                    let nonce = auth::new_nonce();
                    self.sent_nonce = Some(nonce.clone());
                    events.push(HandshakeEvent::SendControl { verb: "challenge", field: nonce });
                }

                self.refresh_phase();
                Ok(events)
            }
            "auth" => {
                let nonce = self.sent_nonce.as_ref().ok_or_else(|| {
                    NetworkError::Fatal(ErrorType::AuthFailed)
                })?;

                let ok = auth::verify_mac(&self.secret, nonce, field)
                    .map_err(|_| NetworkError::Fatal(ErrorType::AuthFailed))?;

                if !ok {
                    self.phase = Phase::Closed;
                    return Ok(vec![HandshakeEvent::Close]);
                }

                self.peer_verified = true;
                info!(self.log, "authenticated peer");
                self.refresh_phase();
                Ok(Vec::new())
            }
            "disconnect" => {
                self.phase = Phase::Closed;
                Ok(vec![HandshakeEvent::Close])
            }
            other => Err(NetworkError::Fatal(ErrorType::UnknownVerb(other.to_string()))),
        }
    }

    fn refresh_phase(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }

        self.phase = if self.my_auth_sent && self.peer_verified {
            Phase::Authed
        } else if self.sent_nonce.is_some() || self.my_auth_sent {
            Phase::Challenged
        } else {
            Phase::Unauth
        };
    }
}
