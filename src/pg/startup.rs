//! Connection startup and authentication state machine.

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

/// Progress reported by [`StartupStateMachine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupProgress {
    /// More messages are needed. Anything appended to the output buffer
    /// must be sent first.
    Continue,
    /// ReadyForQuery arrived; the connection is usable.
    Ready(TransactionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Startup state machine.
///
/// Writes the StartupMessage, answers the server's authentication request
/// and consumes messages until the first ReadyForQuery. Asynchronous
/// messages (notices, parameter status) are handled by the caller.
pub struct StartupStateMachine {
    state: State,
    user: String,
    password: Option<String>,
    params: Vec<(String, String)>,
    scram: Option<ScramClient>,
    backend_pid: Option<u32>,
}

impl StartupStateMachine {
    pub fn new(opts: &Opts) -> Self {
        let mut params = vec![
            ("user".to_string(), opts.user.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(database) = &opts.database {
            params.push(("database".to_string(), database.clone()));
        }
        if let Some(app) = &opts.application_name {
            params.push(("application_name".to_string(), app.clone()));
        }
        params.extend(opts.params.iter().cloned());

        Self {
            state: State::Initial,
            user: opts.user.clone(),
            password: opts.password.clone(),
            params,
            scram: None,
            backend_pid: None,
        }
    }

    /// Process id of the server backend, once reported.
    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    /// Append the StartupMessage to `out`.
    pub fn start(&mut self, out: &mut Vec<u8>) {
        let params: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        write_startup(out, &params);
        self.state = State::WaitingAuth;
    }

    /// Process one server message, appending any reply to `out`.
    pub fn step(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<StartupProgress> {
        let result = self.handle(msg, out);
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    fn handle(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<StartupProgress> {
        if msg.type_byte == msg_type::ERROR_RESPONSE {
            return Err(ErrorResponse::parse(msg.payload)?.into_error());
        }

        match self.state {
            State::WaitingAuth => self.handle_auth_request(msg, out),
            State::SaslInProgress => self.handle_sasl(msg, out),
            State::WaitingAuthResult => {
                match expect_auth(msg)? {
                    AuthenticationMessage::Ok => {
                        self.state = State::WaitingReady;
                        Ok(StartupProgress::Continue)
                    }
                    auth => Err(Error::Auth(format!("Unexpected auth result: {:?}", auth))),
                }
            }
            State::WaitingReady => self.handle_ready(msg),
            State::Initial | State::Ready | State::Failed => Err(Error::Protocol(format!(
                "Unexpected message '{}' in startup state {:?}",
                msg.type_byte as char, self.state
            ))),
        }
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn handle_auth_request(
        &mut self,
        msg: RawMessage<'_>,
        out: &mut Vec<u8>,
    ) -> Result<StartupProgress> {
        match expect_auth(msg)? {
            AuthenticationMessage::Ok => {
                self.state = State::WaitingReady;
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(out, self.password()?);
                self.state = State::WaitingAuthResult;
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.user, self.password()?, &salt);
                write_password(out, &hashed);
                self.state = State::WaitingAuthResult;
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&"SCRAM-SHA-256") {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {:?}",
                        mechanisms
                    )));
                }
                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    out,
                    "SCRAM-SHA-256",
                    scram.client_first_message().as_bytes(),
                );
                self.scram = Some(scram);
                self.state = State::SaslInProgress;
            }
            auth => {
                return Err(Error::Unsupported(format!(
                    "Unsupported authentication method: {:?}",
                    auth
                )));
            }
        }
        Ok(StartupProgress::Continue)
    }

    fn handle_sasl(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<StartupProgress> {
        let scram = self
            .scram
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

        match expect_auth(msg)? {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram.process_server_first(server_first).map_err(Error::Auth)?;
                write_sasl_response(out, client_final.as_bytes());
                Ok(StartupProgress::Continue)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram.verify_server_final(server_final).map_err(Error::Auth)?;
                self.state = State::WaitingAuthResult;
                Ok(StartupProgress::Continue)
            }
            auth => Err(Error::Protocol(format!(
                "Unexpected SASL message: {:?}",
                auth
            ))),
        }
    }

    fn handle_ready(&mut self, msg: RawMessage<'_>) -> Result<StartupProgress> {
        match msg.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_pid = Some(BackendKeyData::parse(msg.payload)?.process_id());
                Ok(StartupProgress::Continue)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                // Minor version or option downgrade; 3.0 is all we speak.
                tracing::debug!("server negotiated protocol version");
                Ok(StartupProgress::Continue)
            }
            msg_type::READY_FOR_QUERY => {
                let status = ReadyForQuery::parse(msg.payload)?
                    .transaction_status()
                    .unwrap_or_default();
                self.state = State::Ready;
                Ok(StartupProgress::Ready(status))
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}

fn expect_auth(msg: RawMessage<'_>) -> Result<AuthenticationMessage<'_>> {
    if msg.type_byte != msg_type::AUTHENTICATION {
        return Err(Error::Protocol(format!(
            "Expected Authentication message, got '{}'",
            msg.type_byte as char
        )));
    }
    AuthenticationMessage::parse(msg.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frontend::msg_type as frontend;

    fn opts() -> Opts {
        Opts {
            user: "alice".into(),
            database: Some("notes".into()),
            password: Some("pw".into()),
            ..Default::default()
        }
    }

    fn auth(kind: i32, rest: &[u8]) -> Vec<u8> {
        let mut payload = kind.to_be_bytes().to_vec();
        payload.extend_from_slice(rest);
        payload
    }

    #[test]
    fn trust_startup() {
        let mut machine = StartupStateMachine::new(&opts());
        let mut out = Vec::new();
        machine.start(&mut out);
        assert!(out.windows(6).any(|w| w == b"alice\0"));
        out.clear();

        let ok = auth(0, &[]);
        let progress = machine
            .step(RawMessage::new(msg_type::AUTHENTICATION, &ok), &mut out)
            .unwrap();
        assert_eq!(progress, StartupProgress::Continue);
        assert!(out.is_empty());

        let key = [0, 0, 0x30, 0x39, 0, 0, 0, 7];
        machine
            .step(RawMessage::new(msg_type::BACKEND_KEY_DATA, &key), &mut out)
            .unwrap();
        assert_eq!(machine.backend_pid(), Some(12345));

        let progress = machine
            .step(RawMessage::new(msg_type::READY_FOR_QUERY, b"I"), &mut out)
            .unwrap();
        assert_eq!(progress, StartupProgress::Ready(TransactionStatus::Idle));
    }

    #[test]
    fn md5_password_reply() {
        let mut machine = StartupStateMachine::new(&opts());
        let mut out = Vec::new();
        machine.start(&mut out);
        out.clear();

        let request = auth(5, &[1, 2, 3, 4]);
        machine
            .step(RawMessage::new(msg_type::AUTHENTICATION, &request), &mut out)
            .unwrap();
        assert_eq!(out[0], frontend::PASSWORD);
        let expected = md5_password("alice", "pw", &[1, 2, 3, 4]);
        assert_eq!(&out[5..out.len() - 1], expected.as_bytes());
    }

    #[test]
    fn missing_password() {
        let mut machine = StartupStateMachine::new(&Opts {
            password: None,
            ..opts()
        });
        let mut out = Vec::new();
        machine.start(&mut out);

        let request = auth(3, &[]);
        let err = machine
            .step(RawMessage::new(msg_type::AUTHENTICATION, &request), &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn server_error_fails_startup() {
        let mut machine = StartupStateMachine::new(&opts());
        let mut out = Vec::new();
        machine.start(&mut out);

        let payload = b"SFATAL\0VFATAL\0C3D000\0Mdatabase \"notes\" does not exist\0\0";
        let err = machine
            .step(RawMessage::new(msg_type::ERROR_RESPONSE, payload), &mut out)
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some("3D000"));
        assert!(err.is_connection_broken());
    }
}
