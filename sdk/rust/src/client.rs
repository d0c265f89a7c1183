use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection, e.g. when admission was refused.
    #[error("connection closed by server")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Error code of a server-side failure (`AUTH`, `SESSION`, ...).
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub token: String,
    /// RFC 3339 timestamp.
    pub expires_at: String,
}

/// Line protocol client for a gatehouse listener.
pub struct GatehouseClient<S = TcpStream> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    service: String,
}

impl GatehouseClient<TcpStream> {
    /// Connect over plain TCP and wait for the greeting.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite> GatehouseClient<S> {
    /// Use an established stream (for example a TLS stream) and wait for the greeting.
    pub async fn from_stream(stream: S) -> Result<Self, ClientError> {
        let (reader, writer) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            service: String::new(),
        };

        let greeting = client.read_line().await?;
        let service = greeting
            .strip_prefix("OK ")
            .and_then(|rest| rest.strip_suffix(" ready"))
            .ok_or_else(|| reply_error(&greeting))?;
        client.service = service.to_string();
        Ok(client)
    }

    /// Service name announced in the greeting.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn sign_up(&mut self, user_name: &str, password: &str, email: Option<&str>) -> Result<UserInfo, ClientError> {
        let line = match email {
            Some(email) => format!("SIGNUP {user_name} {password} {email}"),
            None => format!("SIGNUP {user_name} {password}"),
        };
        let reply = self.call(&line).await?;
        parse_user(&reply)
    }

    pub async fn sign_in(&mut self, user_name: &str, password: &str) -> Result<SessionInfo, ClientError> {
        let reply = self.call(&format!("SIGNIN {user_name} {password}")).await?;
        parse_session(&reply)
    }

    pub async fn cert_sign_in(&mut self) -> Result<SessionInfo, ClientError> {
        let reply = self.call("CERT-SIGNIN").await?;
        parse_session(&reply)
    }

    pub async fn resume(&mut self, token: &str) -> Result<UserInfo, ClientError> {
        let reply = self.call(&format!("RESUME {token}")).await?;
        parse_user(&reply)
    }

    pub async fn whoami(&mut self) -> Result<UserInfo, ClientError> {
        let reply = self.call("WHOAMI").await?;
        parse_user(&reply)
    }

    pub async fn sign_out(&mut self) -> Result<(), ClientError> {
        self.expect_ok("SIGNOUT").await
    }

    pub async fn passwd(&mut self, current: &str, new: &str) -> Result<(), ClientError> {
        self.expect_ok(&format!("PASSWD {current} {new}")).await
    }

    pub async fn reset_request(&mut self, user_name: &str) -> Result<(), ClientError> {
        self.expect_ok(&format!("RESET-REQUEST {user_name}")).await
    }

    pub async fn reset(&mut self, reset_token: &str, new_password: &str) -> Result<(), ClientError> {
        self.expect_ok(&format!("RESET {reset_token} {new_password}")).await
    }

    pub async fn quit(mut self) -> Result<(), ClientError> {
        match self.call("QUIT").await?.as_str() {
            "BYE" => Ok(()),
            other => Err(ClientError::Protocol(other.to_string())),
        }
    }

    /// Send one raw command line and return the raw reply line.
    ///
    /// `ERR` replies are returned as `ClientError::Server`.
    pub async fn call(&mut self, line: &str) -> Result<String, ClientError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let reply = self.read_line().await?;
        if reply.starts_with("ERR ") {
            return Err(reply_error(&reply));
        }
        Ok(reply)
    }

    /// Wait for the next line the server sends, e.g. after a forced close.
    pub async fn read_line(&mut self) -> Result<String, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(line.trim_end().to_string())
    }

    async fn expect_ok(&mut self, line: &str) -> Result<(), ClientError> {
        match self.call(line).await?.as_str() {
            "OK" => Ok(()),
            other => Err(ClientError::Protocol(other.to_string())),
        }
    }
}

fn reply_error(reply: &str) -> ClientError {
    let Some(rest) = reply.strip_prefix("ERR ") else {
        return ClientError::Protocol(reply.to_string());
    };
    let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
    ClientError::Server {
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn parse_user(reply: &str) -> Result<UserInfo, ClientError> {
    match reply.split(' ').collect::<Vec<_>>().as_slice() {
        ["OK", "USER", user_id, user_name] => Ok(UserInfo {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        }),
        _ => Err(ClientError::Protocol(reply.to_string())),
    }
}

fn parse_session(reply: &str) -> Result<SessionInfo, ClientError> {
    match reply.split(' ').collect::<Vec<_>>().as_slice() {
        ["OK", "SESSION", token, expires_at] => Ok(SessionInfo {
            token: token.to_string(),
            expires_at: expires_at.to_string(),
        }),
        _ => Err(ClientError::Protocol(reply.to_string())),
    }
}
