//! Built-in line protocol handler.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::auth::accounts::AccountService;
use crate::auth::certificate::TlsIdentity;
use crate::auth::principal::{Account, AuthError};
use crate::auth::session::{Session, SessionError, SessionToken, TransportSecurity};
use crate::error::GatehouseError;
use crate::protocol::command::{Command, ErrorCode, Reply};
use crate::protocol::{Connection, ConnectionHandler};

/// Longest accepted command line, terminator included.
pub const MAX_LINE_BYTES: usize = 8192;

/// Exposes the account flows over a newline-delimited text protocol.
#[derive(Debug, Clone)]
pub struct LineProtocolHandler {
    service_name: String,
    accounts: Arc<AccountService>,
}

impl LineProtocolHandler {
    pub fn new(service_name: impl Into<String>, accounts: Arc<AccountService>) -> Self {
        Self {
            service_name: service_name.into(),
            accounts,
        }
    }

    /// Run a credential operation off the reactor; Argon2 is CPU-bound.
    async fn blocking<T, F>(&self, op: F) -> io::Result<Result<T, AuthError>>
    where
        F: FnOnce(&AccountService) -> Result<T, AuthError> + Send + 'static,
        T: Send + 'static,
    {
        let accounts = Arc::clone(&self.accounts);
        tokio::task::spawn_blocking(move || op(&accounts))
            .await
            .map_err(io::Error::other)
    }

    async fn execute(&self, command: Command, state: &mut ConnectionState<'_>) -> io::Result<Reply> {
        let transport = state.connection_transport;
        let outcome: Result<Reply, AuthError> = match command {
            Command::SignUp {
                user_name,
                password,
                email,
            } => self
                .blocking(move |a| a.sign_up(&user_name, &password, email.as_deref()))
                .await?
                .map(|account| user_reply(&account)),
            Command::SignIn { user_name, password } => self
                .blocking(move |a| a.sign_in(&user_name, &password, transport))
                .await?
                .map(|session| state.attach(session)),
            Command::CertSignIn => match state.identity {
                Some(identity) => self
                    .accounts
                    .sign_in_with_certificate(identity, transport)
                    .map(|session| state.attach(session)),
                None => Err(AuthError::InvalidCredentials),
            },
            Command::Resume { token } => {
                let token = SessionToken::from(token);
                self.accounts.whoami(&token).map(|account| {
                    state.session = Some(token);
                    user_reply(&account)
                })
            }
            Command::WhoAmI => state
                .current()
                .and_then(|token| self.accounts.whoami(token))
                .map(|account| user_reply(&account)),
            Command::SignOut => {
                if let Some(token) = state.session.take() {
                    self.accounts.sign_out(&token);
                }
                Ok(Reply::Ok)
            }
            Command::Passwd { current, new } => match state.current().cloned() {
                Ok(token) => self
                    .blocking(move |a| a.change_password(&token, &current, &new))
                    .await?
                    .map(|()| {
                        state.session = None;
                        Reply::Ok
                    }),
                Err(err) => Err(err),
            },
            Command::ResetRequest { user_name } => self
                .accounts
                .request_password_reset(&user_name)
                .map(|()| Reply::Ok),
            Command::Reset { token, new_password } => self
                .blocking(move |a| a.reset_password(&token, &new_password))
                .await?
                .map(|()| Reply::Ok),
            Command::Quit => Ok(Reply::Bye),
        };

        Ok(outcome.unwrap_or_else(|err| Reply::from(&GatehouseError::from(err))))
    }
}

/// Per-connection protocol state.
struct ConnectionState<'a> {
    connection_transport: TransportSecurity,
    identity: Option<&'a TlsIdentity>,
    session: Option<SessionToken>,
}

impl ConnectionState<'_> {
    fn current(&self) -> Result<&SessionToken, AuthError> {
        self.session
            .as_ref()
            .ok_or(AuthError::Session(SessionError::Unknown))
    }

    fn attach(&mut self, session: Session) -> Reply {
        let reply = Reply::Session {
            token: session.token.as_str().to_string(),
            expires_at: session.expires_at,
        };
        self.session = Some(session.token);
        reply
    }
}

fn user_reply(account: &Account) -> Reply {
    Reply::User {
        user_id: account.user_id.to_string(),
        user_name: account.user_name.key(),
    }
}

#[async_trait]
impl ConnectionHandler for LineProtocolHandler {
    async fn handle(&self, connection: Connection) -> io::Result<()> {
        let Connection {
            transport,
            identity,
            stream,
            ..
        } = connection;
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut state = ConnectionState {
            connection_transport: transport,
            identity: identity.as_ref(),
            session: None,
        };

        write_reply(&mut writer, &Reply::Ready(self.service_name.clone())).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES as u64)
                .read_line(&mut line)
                .await?;
            if read == 0 {
                return Ok(());
            }
            if !line.ends_with('\n') && read >= MAX_LINE_BYTES {
                tracing::warn!(component = "protocol", "Command line too long, closing");
                write_reply(&mut writer, &Reply::error(ErrorCode::TooLong, "line too long")).await?;
                return Ok(());
            }

            let reply = match Command::parse(&line) {
                Ok(command) => {
                    let quit = command == Command::Quit;
                    let reply = self.execute(command, &mut state).await?;
                    if quit {
                        write_reply(&mut writer, &reply).await?;
                        return Ok(());
                    }
                    reply
                }
                Err(err) => Reply::error(ErrorCode::BadRequest, err.to_string()),
            };
            write_reply(&mut writer, &reply).await?;
        }
    }
}

async fn write_reply<W>(writer: &mut W, reply: &Reply) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(format!("{reply}\n").as_bytes()).await?;
    writer.flush().await
}
